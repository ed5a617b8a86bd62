#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frames) = veilport::frame::decode_all(data) {
        for frame in frames {
            let _ = frame.encode();
        }
    }
    let _ = veilport::parse_handshake_datagram(data);
});
