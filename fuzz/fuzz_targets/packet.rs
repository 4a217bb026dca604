#![no_main]

use libfuzzer_sys::fuzz_target;
use vapor_core::Packet;

fuzz_target!(|data: &[u8]| {
    // Fuzz packet parsing - should never panic on any input
    let _ = Packet::parse(data);
});
