#![no_main]

use bytes::BytesMut;
use gridflow_core::buffer::EventKind;
use gridflow_network::MessageCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Fuzz the exchange frame codec with arbitrary bytes.
    // Tests handling of:
    // - Invalid length prefixes
    // - Oversized frames (>32MB)
    // - Truncated frames and bodies
    // - Unknown tags and bad magic
    let mut codec = MessageCodec::new();
    let mut buf = BytesMut::from(data);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => {}     // Valid frame, keep scanning
            Ok(None) => break,    // Needs more data
            Err(_) => break,      // Invalid data
        }
    }

    // Also fuzz the event payload parser fed to consumers.
    let _ = EventKind::from_payload(data);
});
