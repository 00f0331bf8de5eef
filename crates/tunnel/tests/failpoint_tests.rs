#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Fault-injection tests for the Space key cache.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p syfthub-tunnel --features failpoints,testutil --test failpoint_tests
//! ```

use std::sync::Arc;

use serde_json::json;
use syfthub_tunnel::{
    EndpointRef, EndpointType, MemoryBus, TunnelCall,
    testutil::{SpaceSimulator, StaticKeyResolver, memory_transport},
};

fn docs() -> EndpointRef {
    EndpointRef { slug: "docs".to_owned(), endpoint_type: EndpointType::DataSource }
}

#[tokio::test]
async fn key_fetch_failure_never_reaches_bus_and_is_not_cached() {
    let scenario = fail::FailScenario::setup();
    let bus = MemoryBus::new();
    let space = SpaceSimulator::echo(&bus, "alice").await;
    let resolver = Arc::new(StaticKeyResolver::new());
    resolver.set_key("alice", space.public_key());
    let transport = memory_transport(&bus, Arc::clone(&resolver));

    fail::cfg("key-cache-before-fetch", "return").expect("failed to configure fail point");

    let err = transport.send(TunnelCall::new("alice", docs(), json!({}))).await.unwrap_err();
    assert_eq!(err.code(), "ENCRYPTION_KEY_FETCH_FAILED");
    assert!(err.is_retryable());
    assert_eq!(resolver.fetch_count("alice"), 0);
    assert_eq!(space.request_count(), 0);
    assert!(!transport.key_cache().contains("alice").await);

    fail::remove("key-cache-before-fetch");
    transport.send(TunnelCall::new("alice", docs(), json!({}))).await.unwrap();
    assert_eq!(resolver.fetch_count("alice"), 1);

    scenario.teardown();
}
