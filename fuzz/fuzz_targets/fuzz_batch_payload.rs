//! Fuzz target for batch payload decoding.
//!
//! Arbitrary bytes must parse to a payload or a validation error, and a
//! parsed payload must validate without panicking.

#![no_main]

use dispatch_core::api::{BatchPayload, DEFAULT_MAX_PAYLOAD_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(payload) = BatchPayload::from_json(text) {
        let _ = payload.validate(DEFAULT_MAX_PAYLOAD_SIZE);
    }
});
