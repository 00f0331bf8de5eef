//! Fuzz target for satellite token verification.
//!
//! Feeds arbitrary strings as tokens through the full verification pipeline.
//! Every input must produce a structured rejection (or, vanishingly rarely, a
//! verified token); none may panic or hang.

#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use syfthub_authn::{
    KeyStore, TokenService,
    testutil::{test_key_store, test_token_service},
    validation::{normalize_audience, validate_kid},
};

fn fixtures() -> &'static (TokenService, KeyStore) {
    static FIXTURES: OnceLock<(TokenService, KeyStore)> = OnceLock::new();
    FIXTURES.get_or_init(|| (test_token_service(), test_key_store("fuzz-key")))
}

fuzz_target!(|data: &[u8]| {
    // JWTs are always UTF-8 strings
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (service, store) = fixtures();

    let _ = service.verify_token_for_audience(input, store, "syftai-space");

    // Treat the input as a hostile audience or kid as well
    let _ = service.verify_token_for_audience(input, store, input);
    let _ = validate_kid(input);
    let _ = normalize_audience(input);
});
