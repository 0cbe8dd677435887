//! Fuzz target for STUN response decoding
//!
//! Responses come from the network; the decoder must reject anything
//! malformed without panicking.

#![no_main]

use flowd_discovery::nat::StunMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = StunMessage::decode(data) {
        let _ = message.reflexive_address();
        let _ = message.error_code();

        // Anything accepted re-encodes and decodes again
        let encoded = message.encode();
        let _ = StunMessage::decode(&encoded);
    }
});
