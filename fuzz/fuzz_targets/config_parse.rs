//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must never panic the loader or the conversion into a
//! validated node configuration.

#![no_main]

use flowd_cli::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = Config::parse(s) {
            // Invalid values are errors, never panics
            let _ = config.to_node_config();
        }
    }
});
