//! AES-256-CBC session encryption with encrypted-IV transport.
//!
//! Wire layout for every encrypted payload:
//!
//! ```ascii
//!  0: IV (16 bytes, AES-256-ECB encrypted under the session key)
//! 16: AES-256-CBC-PKCS7 ciphertext of the payload
//! ```
//!
//! In plain mode the pre-encryption IV is 16 random bytes. In
//! authenticated mode the pre-encryption IV is
//! `random(3) || HMAC-SHA1(random(3) || plaintext, key[0..16])[0..13]`,
//! so the receiver can ECB-decrypt the IV and verify the payload against
//! the embedded MAC before accepting it.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// IV length (one AES block).
const IV_LEN: usize = 16;

/// Only the first 16 key bytes feed the IV HMAC.
const HMAC_KEY_LEN: usize = 16;

/// Random prefix length inside an authenticated IV.
const IV_RANDOM_LEN: usize = 3;

/// Truncated MAC length inside an authenticated IV.
const IV_MAC_LEN: usize = IV_LEN - IV_RANDOM_LEN;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha1 = Hmac<Sha1>;

/// Per-session symmetric cipher.
///
/// Constructed once the logon layer hands over the negotiated 32-byte key;
/// dropped (and the key zeroized) when the connection goes away.
#[derive(Clone)]
pub struct SessionCipher {
    key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    use_hmac: bool,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("use_hmac", &self.use_hmac)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Create a cipher from a 32-byte session key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLength`] if the key is not exactly 32 bytes.
    pub fn new(key: &[u8], use_hmac: bool) -> Result<Self> {
        if key.len() != SESSION_KEY_LEN {
            return Err(Error::InvalidLength {
                expected: SESSION_KEY_LEN,
                actual: key.len(),
            });
        }

        let mut buf = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        buf.copy_from_slice(key);

        Ok(Self {
            key: buf,
            use_hmac,
        })
    }

    /// Whether this cipher authenticates payloads through the IV.
    pub fn uses_hmac(&self) -> bool {
        self.use_hmac
    }

    /// Encrypt a payload for the wire.
    ///
    /// Output is `iv || cbc_ciphertext`; the payload may be empty.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let iv = if self.use_hmac {
            let mut random = [0u8; IV_RANDOM_LEN];
            rand::thread_rng().fill_bytes(&mut random);

            let digest = self.iv_mac(&random, plain)?.finalize().into_bytes();
            let mut inner = [0u8; IV_LEN];
            inner[..IV_RANDOM_LEN].copy_from_slice(&random);
            inner[IV_RANDOM_LEN..].copy_from_slice(&digest[..IV_MAC_LEN]);
            self.ecb_encrypt(inner)
        } else {
            let mut random = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut random);
            self.ecb_encrypt(random)
        };

        let body = self.cbc_encrypt(&iv, plain)?;
        let mut out = Vec::with_capacity(IV_LEN + body.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypt a wire payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decryption`] on bad padding or, in authenticated
    /// mode, on an IV MAC mismatch. Callers treat this as a recoverable
    /// per-packet failure, not a dead connection.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        // Smallest valid ciphertext: IV plus one padded block.
        if data.len() < IV_LEN * 2 {
            return Err(Error::InvalidLength {
                expected: IV_LEN * 2,
                actual: data.len(),
            });
        }

        let (iv, body) = data.split_at(IV_LEN);
        let plain = self.cbc_decrypt(iv, body)?;

        if self.use_hmac {
            let mut wire_iv = [0u8; IV_LEN];
            wire_iv.copy_from_slice(iv);
            let inner = self.ecb_decrypt(wire_iv);

            self.iv_mac(&inner[..IV_RANDOM_LEN], &plain)?
                .verify_truncated_left(&inner[IV_RANDOM_LEN..])
                .map_err(|_| Error::Decryption("IV authentication mismatch".into()))?;
        }

        Ok(plain)
    }

    fn iv_mac(&self, random: &[u8], plain: &[u8]) -> Result<HmacSha1> {
        let mut mac = <HmacSha1 as hmac::Mac>::new_from_slice(&self.key[..HMAC_KEY_LEN])
            .map_err(|e| Error::Encryption(e.to_string()))?;
        mac.update(random);
        mac.update(plain);
        Ok(mac)
    }

    fn ecb_encrypt(&self, block: [u8; IV_LEN]) -> [u8; IV_LEN] {
        let cipher = Aes256::new(GenericArray::from_slice(&self.key[..]));
        let mut buf = GenericArray::from(block);
        cipher.encrypt_block(&mut buf);
        buf.into()
    }

    fn ecb_decrypt(&self, block: [u8; IV_LEN]) -> [u8; IV_LEN] {
        let cipher = Aes256::new(GenericArray::from_slice(&self.key[..]));
        let mut buf = GenericArray::from(block);
        cipher.decrypt_block(&mut buf);
        buf.into()
    }

    fn cbc_encrypt(&self, iv: &[u8; IV_LEN], plain: &[u8]) -> Result<Vec<u8>> {
        let enc = Aes256CbcEnc::new_from_slices(&self.key[..], iv)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plain))
    }

    fn cbc_decrypt(&self, iv: &[u8], body: &[u8]) -> Result<Vec<u8>> {
        let dec = Aes256CbcDec::new_from_slices(&self.key[..], iv)
            .map_err(|e| Error::Decryption(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| Error::Decryption("bad PKCS#7 padding".into()))
    }
}
