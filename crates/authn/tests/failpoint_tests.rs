#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Fault-injection tests for key generation.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p syfthub-authn --features failpoints,testutil --test failpoint_tests
//! ```

use std::time::Duration;

use syfthub_authn::{
    KeySource, KeyStore, assert_auth_error, key_store::LOCK_FILE, lock::KeyGenerationLock,
    testutil::temp_keys_config,
};

#[tokio::test]
async fn generation_failure_releases_lock() {
    let scenario = fail::FailScenario::setup();
    let (dir, config) = temp_keys_config();

    fail::cfg("key-store-before-generate", "return").expect("failed to configure fail point");

    let store = KeyStore::new(config.clone());
    let result = store.initialize().await;
    assert_auth_error!(result, KeyGeneration);
    assert!(!store.is_initialized());

    // Another worker can take the lock immediately.
    let lock =
        KeyGenerationLock::acquire(&dir.path().join(LOCK_FILE), Duration::from_millis(50)).await;
    assert!(lock.is_ok(), "lock must be released after a failed generation");
    drop(lock);

    fail::remove("key-store-before-generate");
    store.initialize().await.unwrap();
    assert_eq!(store.key_source(), Some(KeySource::Generated));

    scenario.teardown();
}

#[tokio::test]
async fn generation_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let (_dir, config) = temp_keys_config();

    let store = KeyStore::new(config);
    store.initialize().await.unwrap();
    assert!(store.is_configured());

    scenario.teardown();
}
