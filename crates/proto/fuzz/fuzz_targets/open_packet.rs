//! Fuzz target for the inbound record decoder.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run open_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use ferrule_proto::ssh::packet::{open_packet, Packet, MAX_PACKET_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buffer = BytesMut::from(data);
    let before = buffer.len();

    match open_packet(&mut buffer, None, 0, MAX_PACKET_SIZE) {
        // An incomplete record leaves the buffer untouched.
        Ok(None) => assert_eq!(buffer.len(), before),
        Ok(Some(payload)) => {
            assert!(buffer.len() < before);
            assert!(payload.len() < MAX_PACKET_SIZE);
        }
        Err(_) => {}
    }

    if let Ok(packet) = Packet::from_bytes(data) {
        let reparsed = Packet::from_bytes(&packet.to_bytes()).expect("re-encoded packet must parse");
        assert_eq!(packet.payload(), reparsed.payload());
    }
});
