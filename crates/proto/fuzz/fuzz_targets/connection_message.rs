//! Fuzz target for connection-layer and userauth message parsing.

#![no_main]
use ferrule_proto::ssh::auth::AuthResponse;
use ferrule_proto::ssh::connection::ConnectionMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = ConnectionMessage::from_bytes(data) {
        // Whatever decodes must encode again.
        let _ = message.to_bytes();
    }
    let _ = AuthResponse::from_bytes(data);
});
