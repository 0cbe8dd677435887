//! Fuzz target for firefly datagram decoding

#![no_main]

use flowd_core::FireflyMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = FireflyMessage::decode(data) {
        let _ = message.kind();
    }
});
