//! `HttpKeyResolver` against a local backend stub.
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE};
use serde_json::json;
use syfthub_tunnel::{
    EncryptionKeyResolver, HttpKeyResolver, SpaceCipher, SpaceKeyCache, SpacePublicKey,
    assert_tunnel_error,
};

struct Backend {
    alice: SpacePublicKey,
}

async fn encryption_key(
    Path(username): Path<String>,
    State(backend): State<Arc<Backend>>,
) -> Response {
    match username.as_str() {
        "alice" => {
            Json(json!({"encryption_public_key": backend.alice.to_base64()})).into_response()
        },
        "padded" => {
            Json(json!({"encryption_public_key": URL_SAFE.encode(backend.alice.as_bytes())}))
                .into_response()
        },
        "unregistered" => Json(json!({"encryption_public_key": null})).into_response(),
        "broken" => Json(json!({"encryption_public_key": "not-a-key"})).into_response(),
        "overloaded" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StatusCode::OK.into_response()
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_backend(alice: SpacePublicKey) -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/nats/encryption-key/:username", get(encryption_key))
        .with_state(Arc::new(Backend { alice }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

#[tokio::test]
async fn resolves_registered_key() {
    let space = SpaceCipher::generate();
    let addr = spawn_backend(space.public_key()).await;
    let resolver = HttpKeyResolver::new(&format!("http://{addr}")).unwrap();

    assert_eq!(resolver.resolve("alice").await.unwrap(), Some(space.public_key()));
    assert_eq!(resolver.resolve("padded").await.unwrap(), Some(space.public_key()));
}

#[tokio::test]
async fn not_found_and_null_mean_unregistered() {
    let addr = spawn_backend(SpaceCipher::generate().public_key()).await;
    let resolver = HttpKeyResolver::new(&format!("http://{addr}")).unwrap();

    assert_eq!(resolver.resolve("nobody").await.unwrap(), None);
    assert_eq!(resolver.resolve("unregistered").await.unwrap(), None);
}

#[tokio::test]
async fn server_errors_and_bad_keys_are_fetch_failures() {
    let addr = spawn_backend(SpaceCipher::generate().public_key()).await;
    let resolver = HttpKeyResolver::new(&format!("http://{addr}")).unwrap();

    let overloaded = resolver.resolve("overloaded").await;
    assert_tunnel_error!(overloaded, EncryptionKeyFetchFailed);
    let broken = resolver.resolve("broken").await;
    assert_tunnel_error!(broken, EncryptionKeyFetchFailed);
}

#[tokio::test]
async fn slow_backend_times_out_as_fetch_failure() {
    let addr = spawn_backend(SpaceCipher::generate().public_key()).await;
    let resolver =
        HttpKeyResolver::with_timeout(&format!("http://{addr}"), Duration::from_millis(100))
            .unwrap();

    let result = resolver.resolve("slow").await;
    assert_tunnel_error!(result, EncryptionKeyFetchFailed);
}

#[tokio::test]
async fn unreachable_backend_is_fetch_failure() {
    // Bind then drop to get a port with nothing listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let resolver = HttpKeyResolver::new(&format!("http://{addr}")).unwrap();
    let err = resolver.resolve("alice").await.unwrap_err();
    assert_eq!(err.code(), "ENCRYPTION_KEY_FETCH_FAILED");
}

#[tokio::test]
async fn cache_over_http_maps_unregistered_to_missing() {
    let space = SpaceCipher::generate();
    let addr = spawn_backend(space.public_key()).await;
    let resolver = Arc::new(HttpKeyResolver::new(&format!("http://{addr}")).unwrap());
    let cache = SpaceKeyCache::new(resolver, Duration::from_secs(60), 16);

    assert_eq!(cache.get("alice").await.unwrap(), space.public_key());
    let missing = cache.get("nobody").await;
    assert_tunnel_error!(missing, EncryptionKeyMissing);
}
