#![no_main]

use libfuzzer_sys::fuzz_target;

use veilport::{Handshake, HandshakeConfig};

fuzz_target!(|data: &[u8]| {
    let mut handshake = Handshake::new(HandshakeConfig::default()).expect("zero psk allowed");
    let _ = handshake.process_message(data, 1_700_000_000);
});
