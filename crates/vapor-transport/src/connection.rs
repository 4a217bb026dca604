//! The connection façade: one uniform surface over all three transports.
//!
//! A [`Connection`] selects a transport by [`Protocol`], owns the
//! session-key lifecycle, and pumps transport events to the caller. For
//! the stream transports the façade encrypts outbound payloads and
//! decrypts inbound ones; the UDP engine receives the session cipher
//! directly and handles its own payloads, so nothing is ever encrypted
//! twice.
//!
//! Until the session key is set, failures are treated as part of
//! connection establishment: with `auto_retry` the transport is silently
//! re-established against the same endpoint. Once the key is set, any
//! failure surfaces to the caller and the connection is abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use vapor_crypto::SessionCipher;

use crate::event::{Command, Event};
use crate::options::{ConnectOptions, Protocol};
use crate::{tcp, udp, websocket, Error, Result};

/// Pause between reconnect attempts while auto-retrying.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// State shared between the façade handle and its event pump.
struct Shared {
    /// Command channel into the live transport task; swapped on retry.
    cmd_tx: RwLock<mpsc::UnboundedSender<Command>>,
    /// Façade-side cipher for the stream transports; stays `None` for UDP.
    cipher: RwLock<Option<SessionCipher>>,
    /// True once the session key is set (the encryption handshake is done).
    connected: AtomicBool,
    /// Set by the logon layer once the CM session is established.
    logged_on: AtomicBool,
    /// A local disconnect is underway; stop retrying.
    closing: AtomicBool,
}

/// A single logical connection to a CM endpoint.
pub struct Connection {
    user_rx: mpsc::UnboundedReceiver<Event>,
    shared: Arc<Shared>,
    protocol: Protocol,
    remote_address: String,
}

impl Connection {
    /// Connect to the endpoint described by `opts`.
    ///
    /// The initial establishment must succeed; afterwards, failures before
    /// the session key is set are retried when `opts.auto_retry` holds.
    ///
    /// # Errors
    ///
    /// Returns the underlying transport error when the first connect
    /// attempt fails.
    pub async fn connect(opts: ConnectOptions) -> Result<Self> {
        let (cmd_tx, raw_rx) = establish(&opts).await?;
        let (user_tx, user_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            cmd_tx: RwLock::new(cmd_tx),
            cipher: RwLock::new(None),
            connected: AtomicBool::new(false),
            logged_on: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let remote_address = opts.remote_address();
        let protocol = opts.protocol;
        tokio::spawn(pump(opts, Arc::clone(&shared), raw_rx, user_tx));

        Ok(Self {
            user_rx,
            shared,
            protocol,
            remote_address,
        })
    }

    /// Receive the next connection event. `None` once the pump has shut
    /// down (after a final `Closed`).
    pub async fn recv(&mut self) -> Option<Event> {
        self.user_rx.recv().await
    }

    /// Send one opaque payload, encrypting it when a session key is
    /// active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the transport is gone.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let wire = {
            let cipher = self.shared.cipher.read().await;
            match cipher.as_ref() {
                Some(cipher) => cipher.encrypt(payload)?,
                None => payload.to_vec(),
            }
        };
        self.shared
            .cmd_tx
            .read()
            .await
            .send(Command::Send(wire))
            .map_err(|_| Error::Closed)
    }

    /// Install the session key negotiated by the logon layer.
    ///
    /// Set exactly once per connection; `use_hmac` selects the
    /// authenticated-IV mode. From this point on, failures are no longer
    /// retried.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if a key is already installed, or a crypto
    /// error for a malformed key.
    pub async fn set_session_key(&self, key: &[u8], use_hmac: bool) -> Result<()> {
        if self.shared.connected.load(Ordering::Relaxed) {
            return Err(Error::InvalidState("session key already set".into()));
        }

        let cipher = SessionCipher::new(key, use_hmac)?;
        match self.protocol {
            Protocol::Udp => {
                // The UDP engine encrypts before fragmentation and
                // decrypts after reassembly.
                self.shared
                    .cmd_tx
                    .read()
                    .await
                    .send(Command::SetSessionKey(Some(cipher)))
                    .map_err(|_| Error::Closed)?;
            }
            Protocol::Tcp | Protocol::WebSocket => {
                *self.shared.cipher.write().await = Some(cipher);
            }
        }
        self.shared.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Start an orderly shutdown.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when already disconnecting,
    /// [`Error::Closed`] when the transport is already gone.
    pub async fn disconnect(&self) -> Result<()> {
        if self.shared.closing.swap(true, Ordering::Relaxed) {
            return Err(Error::InvalidState("already disconnecting".into()));
        }
        self.shared.connected.store(false, Ordering::Relaxed);
        self.shared.cipher.write().await.take();
        self.shared
            .cmd_tx
            .read()
            .await
            .send(Command::End)
            .map_err(|_| Error::Closed)
    }

    /// Arm or disarm the inactivity timer; on expiry the connection emits
    /// [`Event::Timeout`] and keeps running.
    pub async fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared
            .cmd_tx
            .read()
            .await
            .send(Command::SetTimeout(timeout))
            .map_err(|_| Error::Closed)
    }

    /// The remote endpoint as `"host:port"`.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// The transport this connection runs over.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the encryption handshake has completed.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Whether the logon layer reported an established CM session.
    pub fn logged_on(&self) -> bool {
        self.shared.logged_on.load(Ordering::Relaxed)
    }

    /// Record the logon state; owned by the logon layer.
    pub fn set_logged_on(&self, logged_on: bool) {
        self.shared.logged_on.store(logged_on, Ordering::Relaxed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Relaxed);
        if let Ok(cmd_tx) = self.shared.cmd_tx.try_read() {
            let _ = cmd_tx.send(Command::Destroy);
        }
    }
}

/// Spawn the transport selected by `opts` with a fresh event channel.
async fn establish(
    opts: &ConnectOptions,
) -> Result<(mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<Event>)> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let cmd_tx = match opts.protocol {
        Protocol::Tcp => tcp::spawn(opts, raw_tx).await?,
        Protocol::Udp => udp::spawn(opts, raw_tx).await?,
        Protocol::WebSocket => websocket::spawn(opts, raw_tx).await?,
    };
    Ok((cmd_tx, raw_rx))
}

/// Bridge transport events to the caller: apply stream-transport
/// decryption, and absorb pre-handshake failures by reconnecting.
async fn pump(
    opts: ConnectOptions,
    shared: Arc<Shared>,
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    user_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        let Some(event) = raw_rx.recv().await else {
            let _ = user_tx.send(Event::Closed);
            return;
        };

        match event {
            Event::Packet(payload) => {
                let decrypted = {
                    let cipher = shared.cipher.read().await;
                    match cipher.as_ref() {
                        Some(cipher) => cipher.decrypt(&payload),
                        None => Ok(payload),
                    }
                };
                match decrypted {
                    Ok(plain) => {
                        let _ = user_tx.send(Event::Packet(plain));
                    }
                    Err(e) => {
                        let _ = user_tx.send(Event::EncryptionError(e));
                    }
                }
            }
            Event::Fatal(error) => {
                if !should_retry(&opts, &shared) {
                    let _ = user_tx.send(Event::Fatal(error));
                    let _ = user_tx.send(Event::Closed);
                    return;
                }
                tracing::debug!(%error, "transport failed before handshake; reconnecting");
                match retry(&opts, &shared).await {
                    Some(next_rx) => raw_rx = next_rx,
                    None => {
                        let _ = user_tx.send(Event::Closed);
                        return;
                    }
                }
            }
            Event::Closed => {
                if !should_retry(&opts, &shared) {
                    shared.connected.store(false, Ordering::Relaxed);
                    shared.cipher.write().await.take();
                    let _ = user_tx.send(Event::Closed);
                    return;
                }
                tracing::debug!("transport closed before handshake; reconnecting");
                match retry(&opts, &shared).await {
                    Some(next_rx) => raw_rx = next_rx,
                    None => {
                        let _ = user_tx.send(Event::Closed);
                        return;
                    }
                }
            }
            other => {
                let _ = user_tx.send(other);
            }
        }
    }
}

fn should_retry(opts: &ConnectOptions, shared: &Shared) -> bool {
    opts.auto_retry
        && !shared.connected.load(Ordering::Relaxed)
        && !shared.closing.load(Ordering::Relaxed)
}

/// Re-establish the transport against the same endpoint, swapping the
/// command channel. Gives up only when a local disconnect starts.
async fn retry(opts: &ConnectOptions, shared: &Shared) -> Option<mpsc::UnboundedReceiver<Event>> {
    loop {
        tokio::time::sleep(RETRY_DELAY).await;
        if shared.closing.load(Ordering::Relaxed) {
            return None;
        }
        match establish(opts).await {
            Ok((cmd_tx, raw_rx)) => {
                *shared.cmd_tx.write().await = cmd_tx;
                return Some(raw_rx);
            }
            Err(error) => {
                tracing::debug!(%error, "reconnect attempt failed");
            }
        }
    }
}
