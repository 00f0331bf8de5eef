//! Shared test utilities for tunnel testing.
//!
//! [`SpaceSimulator`] plays a Space on a [`MemoryBus`]: it opens requests
//! with its own [`SpaceCipher`], runs a handler on the plaintext, and seals
//! the reply. Its [`SpaceBehavior`] switches it into misbehaving modes
//! (silence, delay, tampering, stale replies, legacy unencrypted replies).
//! [`StaticKeyResolver`] stands in for the backend key lookup and counts
//! fetches per username.
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! syfthub-tunnel = { path = "../tunnel", features = ["testutil"] }
//! ```

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::{
    bus::{MemoryBus, MemoryClient, MemoryConnector, MessageBus},
    config::TunnelConfig,
    crypto::{SpaceCipher, SpacePublicKey},
    error::{Result, TunnelError},
    key_cache::EncryptionKeyResolver,
    protocol::{
        EndpointRef, MessageType, PROTOCOL_VERSION, ResponseStatus, TunnelRequest,
        TunnelResponse, peer_subject, space_subject,
    },
    transport::TunnelTransport,
};

/// Backend URL used by [`test_config`]. Never contacted.
pub const TEST_BACKEND_URL: &str = "http://backend.test";

/// Tunnel configuration with a 2s default timeout.
#[must_use]
pub fn test_config() -> TunnelConfig {
    TunnelConfig::builder()
        .backend_url(TEST_BACKEND_URL)
        .default_timeout(Duration::from_secs(2))
        .build()
        .expect("valid test config")
}

/// Transport over `bus` resolving keys through `resolver`.
#[must_use]
pub fn memory_transport(bus: &MemoryBus, resolver: Arc<StaticKeyResolver>) -> TunnelTransport {
    TunnelTransport::new(&test_config(), Arc::new(MemoryConnector::new(bus.clone())), resolver)
}

// ---------------------------------------------------------------------------
// Key resolver
// ---------------------------------------------------------------------------

/// In-memory [`EncryptionKeyResolver`] with per-username fetch counts.
#[derive(Debug, Default)]
pub struct StaticKeyResolver {
    keys: Mutex<HashMap<String, SpacePublicKey>>,
    fetches: Mutex<HashMap<String, usize>>,
    unavailable: AtomicBool,
}

impl StaticKeyResolver {
    /// Creates a resolver with no registered keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or rotates) the key for `username`.
    pub fn set_key(&self, username: &str, key: SpacePublicKey) {
        self.keys.lock().insert(username.to_owned(), key);
    }

    /// Unregisters the key for `username`.
    pub fn remove(&self, username: &str) {
        self.keys.lock().remove(username);
    }

    /// Makes every lookup fail as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of lookups for `username`.
    #[must_use]
    pub fn fetch_count(&self, username: &str) -> usize {
        self.fetches.lock().get(username).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EncryptionKeyResolver for StaticKeyResolver {
    async fn resolve(&self, username: &str) -> Result<Option<SpacePublicKey>> {
        *self.fetches.lock().entry(username.to_owned()).or_default() += 1;
        if self.unavailable.load(Ordering::Acquire) {
            return Err(TunnelError::key_fetch_failed(username, "backend unavailable"));
        }
        Ok(self.keys.lock().get(username).copied())
    }
}

// ---------------------------------------------------------------------------
// Space simulator
// ---------------------------------------------------------------------------

/// How a [`SpaceSimulator`] answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceBehavior {
    /// Run the handler and send a sealed reply.
    Respond,
    /// Receive requests but never answer.
    Silent,
    /// Answer after the given delay.
    Delay(Duration),
    /// Flip one ciphertext byte of the sealed reply.
    CorruptCiphertext,
    /// Send garbage and a reply for another correlation id before the real one.
    StaleFirst,
    /// Answer without encryption fields, like a Space predating encryption.
    Unencrypted,
    /// Answer with an error status and the given code.
    Fail(String),
}

type Handler = Arc<dyn Fn(&EndpointRef, &Value) -> Value + Send + Sync>;

struct SimulatorState {
    cipher: SpaceCipher,
    handler: Handler,
    behavior: Mutex<SpaceBehavior>,
    requests: Mutex<Vec<(Bytes, Option<TunnelRequest>)>>,
}

/// A fake Space listening on `syfthub.spaces.{username}`.
///
/// The subscription is live when the constructor returns. The listener task
/// is aborted on drop.
pub struct SpaceSimulator {
    username: String,
    state: Arc<SimulatorState>,
    task: JoinHandle<()>,
}

impl SpaceSimulator {
    /// A Space replying `{"echo": <request payload>}`.
    pub async fn echo(bus: &MemoryBus, username: &str) -> Self {
        Self::respond(bus, username, |_, payload| json!({ "echo": payload })).await
    }

    /// A Space replying with `handler(endpoint, payload)`.
    pub async fn respond<F>(bus: &MemoryBus, username: &str, handler: F) -> Self
    where
        F: Fn(&EndpointRef, &Value) -> Value + Send + Sync + 'static,
    {
        let state = Arc::new(SimulatorState {
            cipher: SpaceCipher::generate(),
            handler: Arc::new(handler),
            behavior: Mutex::new(SpaceBehavior::Respond),
            requests: Mutex::new(Vec::new()),
        });

        let client = Arc::new(bus.client());
        let mut subscription = client
            .subscribe(&space_subject(username))
            .await
            .expect("simulator subscription");

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Some(raw) = subscription.next_message().await {
                let request = serde_json::from_slice::<TunnelRequest>(&raw).ok();
                task_state.requests.lock().push((raw, request.clone()));
                if let Some(request) = request {
                    let state = Arc::clone(&task_state);
                    let client = Arc::clone(&client);
                    tokio::spawn(async move { answer(&state, &client, request).await });
                }
            }
        });

        Self { username: username.to_owned(), state, task }
    }

    /// Switches behavior for subsequent requests.
    #[must_use]
    pub fn with_behavior(self, behavior: SpaceBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    /// Switches behavior for subsequent requests.
    pub fn set_behavior(&self, behavior: SpaceBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Username this Space serves.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The Space's long-term public key.
    #[must_use]
    pub fn public_key(&self) -> SpacePublicKey {
        self.state.cipher.public_key()
    }

    /// Number of messages received.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    /// Most recent parsed request.
    #[must_use]
    pub fn last_request(&self) -> Option<TunnelRequest> {
        self.state.requests.lock().iter().rev().find_map(|(_, r)| r.clone())
    }

    /// Most recent message exactly as it crossed the bus.
    #[must_use]
    pub fn last_raw_request(&self) -> Option<Bytes> {
        self.state.requests.lock().last().map(|(raw, _)| raw.clone())
    }
}

impl Drop for SpaceSimulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(state: &SimulatorState, client: &MemoryClient, request: TunnelRequest) {
    let behavior = state.behavior.lock().clone();
    let reply_subject = peer_subject(&request.reply_to);
    let cid = request.correlation_id.clone();

    match &behavior {
        SpaceBehavior::Silent => return,
        SpaceBehavior::Delay(delay) => tokio::time::sleep(*delay).await,
        SpaceBehavior::Fail(code) => {
            let reply = TunnelResponse::error(cid, code.clone(), "simulated failure");
            publish(client, &reply_subject, &reply).await;
            return;
        },
        _ => {},
    }

    let (plaintext, sealer) = match state.cipher.open_request(&request) {
        Ok(opened) => opened,
        Err(e) => {
            let reply = TunnelResponse::error(cid, "DECRYPTION_FAILED", e.to_string());
            publish(client, &reply_subject, &reply).await;
            return;
        },
    };
    let payload: Value = serde_json::from_slice(&plaintext).unwrap_or(Value::Null);
    let reply = (state.handler)(&request.endpoint, &payload);
    let reply_bytes = serde_json::to_vec(&reply).expect("reply serializes");

    let mut response = TunnelResponse {
        protocol: PROTOCOL_VERSION.to_owned(),
        message_type: MessageType::EndpointResponse,
        correlation_id: cid,
        status: ResponseStatus::Success,
        encryption_info: None,
        encrypted_payload: None,
        error: None,
    };

    if behavior == SpaceBehavior::Unencrypted {
        publish(client, &reply_subject, &response).await;
        return;
    }

    let (info, mut sealed) = sealer.seal(&reply_bytes).expect("seal reply");
    if behavior == SpaceBehavior::CorruptCiphertext {
        let mut raw = STANDARD.decode(&sealed).expect("own ciphertext decodes");
        raw[0] ^= 0x01;
        sealed = STANDARD.encode(raw);
    }
    if behavior == SpaceBehavior::StaleFirst {
        client
            .publish(&reply_subject, Bytes::from_static(b"{not json"))
            .await
            .expect("publish garbage");
        let mut stale = response.clone();
        stale.correlation_id = "00000000-0000-0000-0000-000000000000".to_owned();
        stale.encryption_info = Some(info.clone());
        stale.encrypted_payload = Some(sealed.clone());
        publish(client, &reply_subject, &stale).await;
    }

    response.encryption_info = Some(info);
    response.encrypted_payload = Some(sealed);
    publish(client, &reply_subject, &response).await;
}

async fn publish(client: &MemoryClient, subject: &str, response: &TunnelResponse) {
    let body = serde_json::to_vec(response).expect("response serializes");
    client.publish(subject, Bytes::from(body)).await.expect("simulator publish");
}

/// Asserts that a result is an `Err` with the given [`TunnelError`] variant.
///
/// ```no_run
/// use syfthub_tunnel::{TunnelError, assert_tunnel_error};
///
/// let result: Result<(), TunnelError> = Err(TunnelError::key_missing("alice"));
/// assert_tunnel_error!(result, EncryptionKeyMissing);
/// ```
#[macro_export]
macro_rules! assert_tunnel_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::TunnelError::$variant { .. })),
            "expected TunnelError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::TunnelError::$variant { .. })),
            "{}: expected TunnelError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolver_counts_fetches() {
        let resolver = StaticKeyResolver::new();
        let key = SpaceCipher::generate().public_key();
        resolver.set_key("alice", key);

        assert_eq!(resolver.resolve("alice").await.unwrap(), Some(key));
        resolver.remove("alice");
        assert_eq!(resolver.resolve("alice").await.unwrap(), None);
        assert_eq!(resolver.fetch_count("alice"), 2);
        assert_eq!(resolver.fetch_count("bob"), 0);
    }

    #[tokio::test]
    async fn test_simulator_is_subscribed_on_return() {
        let bus = MemoryBus::new();
        let space = SpaceSimulator::echo(&bus, "alice").await;
        assert_eq!(bus.subscriber_count(&space_subject("alice")), 1);
        assert_eq!(space.username(), "alice");

        drop(space);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(&space_subject("alice")), 0);
    }

    #[test]
    fn test_macro_matches_variant() {
        let result: Result<()> = Err(TunnelError::timeout("alice", Duration::from_millis(1)));
        assert_tunnel_error!(result, Timeout);
    }
}
