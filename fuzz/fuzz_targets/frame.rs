#![no_main]

use libfuzzer_sys::fuzz_target;
use vapor_core::FrameReader;

fuzz_target!(|data: &[u8]| {
    // Fuzz the incremental stream parser with arbitrary chunking - should
    // never panic and never loop past the input
    let mut reader = FrameReader::new();
    for chunk in data.chunks(7) {
        reader.push(chunk);
        loop {
            match reader.next() {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
});
