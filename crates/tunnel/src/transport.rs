//! Encrypted request/reply over the message bus.
//!
//! One call runs
//!
//! ```text
//! idle → key-fetch → encrypt → subscribed → published
//!      → (reply received | timeout) → decrypt → done
//! ```
//!
//! The reply subject is subscribed before the request is published; a Space
//! that answers quickly would otherwise reply into the void. The subscription
//! is removed on every exit path, including cancellation of the call future.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    bus::{BusConnector, MessageBus, NatsConnector, Subscription},
    config::TunnelConfig,
    crypto::{CryptoError, RequestCipher},
    error::{Result, TunnelError},
    key_cache::{EncryptionKeyResolver, HttpKeyResolver, SpaceKeyCache},
    protocol::{
        EncryptionInfo, EndpointRef, MessageType, PROTOCOL_VERSION, ResponseStatus,
        TunnelRequest, TunnelResponse, peer_subject, space_subject, validate_username,
    },
};

/// Code reported when a Space's error reply carries no details.
pub const UNKNOWN_REMOTE_ERROR: &str = "UNKNOWN";

/// One request to a Space endpoint.
#[derive(Debug, Clone)]
pub struct TunnelCall {
    /// Username owning the target Space.
    pub username: String,
    /// Endpoint to invoke.
    pub endpoint: EndpointRef,
    /// Plaintext JSON payload; encrypted before it leaves the process.
    pub payload: Value,
    /// Opaque caller token forwarded for the Space to verify.
    pub satellite_token: Option<String>,
    /// Reply timeout; the transport default applies when `None`.
    pub timeout: Option<Duration>,
}

impl TunnelCall {
    /// Creates a call with no token and the default timeout.
    #[must_use]
    pub fn new(username: impl Into<String>, endpoint: EndpointRef, payload: Value) -> Self {
        Self { username: username.into(), endpoint, payload, satellite_token: None, timeout: None }
    }

    /// Attaches a satellite token.
    #[must_use]
    pub fn with_satellite_token(mut self, token: impl Into<String>) -> Self {
        self.satellite_token = Some(token.into());
        self
    }

    /// Overrides the reply timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client side of the tunnel.
///
/// Owns one lazily opened bus connection and the Space public-key cache;
/// everything else is per call.
pub struct TunnelTransport {
    default_timeout: Duration,
    connector: Arc<dyn BusConnector>,
    connection: Mutex<Option<Arc<dyn MessageBus>>>,
    keys: SpaceKeyCache,
}

impl TunnelTransport {
    /// Creates a transport over the given bus connector and key resolver.
    #[must_use]
    pub fn new(
        config: &TunnelConfig,
        connector: Arc<dyn BusConnector>,
        resolver: Arc<dyn EncryptionKeyResolver>,
    ) -> Self {
        Self {
            default_timeout: config.default_timeout(),
            connector,
            connection: Mutex::new(None),
            keys: SpaceKeyCache::new(resolver, config.key_cache_ttl(), config.key_cache_capacity()),
        }
    }

    /// Creates a transport talking to NATS and resolving keys over HTTP.
    ///
    /// No connection is opened until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the configuration is invalid.
    pub fn from_config(config: &TunnelConfig) -> Result<Self> {
        config.validate()?;
        let resolver = HttpKeyResolver::new(config.backend_url())?;
        Ok(Self::new(config, Arc::new(NatsConnector::from_config(config)), Arc::new(resolver)))
    }

    /// Default reply timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Space public-key cache.
    #[must_use]
    pub fn key_cache(&self) -> &SpaceKeyCache {
        &self.keys
    }

    /// Returns the shared connection, opening it on first use.
    ///
    /// Concurrent first callers wait on the same guard, so at most one
    /// connection is opened.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Bus`] if the connection cannot be opened.
    pub async fn connect(&self) -> Result<Arc<dyn MessageBus>> {
        let mut connection = self.connection.lock().await;
        if let Some(bus) = connection.as_ref() {
            return Ok(Arc::clone(bus));
        }
        let bus = self.connector.connect().await?;
        *connection = Some(Arc::clone(&bus));
        Ok(bus)
    }

    /// Returns `true` while a connection is open.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Closes the shared connection; the next call reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Bus`] if the bus reports a close failure. The
    /// connection is forgotten either way.
    pub async fn close(&self) -> Result<()> {
        let bus = self.connection.lock().await.take();
        match bus {
            Some(bus) => {
                tracing::info!("closing tunnel bus connection");
                bus.close().await
            },
            None => Ok(()),
        }
    }

    /// Sends `call` to its Space and returns the decrypted reply payload.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::InvalidTarget`] for a username unusable as a subject
    /// - [`TunnelError::EncryptionKeyMissing`] / [`TunnelError::EncryptionKeyFetchFailed`]
    /// - [`TunnelError::Bus`] for connection, subscribe, or publish failures
    /// - [`TunnelError::Timeout`] if no matching reply arrives in time
    /// - [`TunnelError::RemoteError`] if the Space answers with an error status
    /// - [`TunnelError::IncompatibleResponse`] if the reply is unencrypted or
    ///   speaks another protocol
    /// - [`TunnelError::DecryptionFailed`] if the reply fails authentication;
    ///   the Space's cached key is evicted first
    #[tracing::instrument(
        skip_all,
        fields(username = %call.username, slug = %call.endpoint.slug, correlation_id)
    )]
    pub async fn send(&self, call: TunnelCall) -> Result<Value> {
        validate_username(&call.username)?;
        let timeout = call.timeout.unwrap_or(self.default_timeout);
        let username = call.username.as_str();

        let space_key = self.keys.get(username).await?;

        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        let cipher = RequestCipher::new(&space_key, correlation_id.clone());

        let plaintext = Zeroizing::new(serde_json::to_vec(&call.payload)?);
        let (encryption_info, encrypted_payload) = cipher
            .encrypt_request(&plaintext)
            .map_err(|e| TunnelError::encryption_failed(e.to_string()))?;

        let peer_channel = Uuid::new_v4().simple().to_string();
        let request = TunnelRequest {
            protocol: PROTOCOL_VERSION.to_owned(),
            message_type: MessageType::EndpointRequest,
            correlation_id: correlation_id.clone(),
            reply_to: peer_channel.clone(),
            endpoint: call.endpoint.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            satellite_token: call.satellite_token.clone(),
            encryption_info,
            encrypted_payload,
        };
        let body = Bytes::from(serde_json::to_vec(&request)?);

        let bus = self.connect().await?;
        let mut subscription = bus.subscribe(&peer_subject(&peer_channel)).await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            exchange(bus.as_ref(), subscription.as_mut(), username, body, &correlation_id),
        )
        .await;

        if let Err(e) = subscription.unsubscribe().await {
            tracing::warn!(error = %e, "failed to unsubscribe reply subject");
        }

        let response = match outcome {
            Ok(response) => response?,
            Err(_) => {
                tracing::warn!(timeout_ms = request.timeout_ms, "tunnel request timed out");
                return Err(TunnelError::timeout(username, timeout));
            },
        };
        tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "reply received");

        self.open_response(username, &cipher, response).await
    }

    async fn open_response(
        &self,
        username: &str,
        cipher: &RequestCipher,
        response: TunnelResponse,
    ) -> Result<Value> {
        if response.protocol != PROTOCOL_VERSION {
            return Err(TunnelError::incompatible_response(
                username,
                format!("unsupported protocol '{}'", response.protocol),
            ));
        }

        if response.status == ResponseStatus::Error {
            return Err(self.remote_error(username, cipher, response).await);
        }

        let (Some(info), Some(payload)) = (&response.encryption_info, &response.encrypted_payload)
        else {
            return Err(TunnelError::incompatible_response(
                username,
                "reply is missing encryption_info or encrypted_payload",
            ));
        };

        let plaintext = self.decrypt(username, cipher, info, payload).await?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            TunnelError::incompatible_response(username, format!("reply payload is not JSON: {e}"))
        })
    }

    async fn remote_error(
        &self,
        username: &str,
        cipher: &RequestCipher,
        response: TunnelResponse,
    ) -> TunnelError {
        if let Some(error) = response.error {
            return TunnelError::remote(username, error.code, error.message);
        }
        // Some Spaces put the error details inside the encrypted payload.
        let encrypted = (&response.encryption_info, &response.encrypted_payload);
        if let (Some(info), Some(payload)) = encrypted {
            let plaintext = match self.decrypt(username, cipher, info, payload).await {
                Ok(plaintext) => plaintext,
                Err(e) => return e,
            };
            if let Ok(body) = serde_json::from_slice::<Value>(&plaintext) {
                let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_owned);
                return TunnelError::remote(
                    username,
                    field("code").unwrap_or_else(|| UNKNOWN_REMOTE_ERROR.to_owned()),
                    field("message").unwrap_or_else(|| "space reported an error".to_owned()),
                );
            }
        }
        TunnelError::remote(
            username,
            UNKNOWN_REMOTE_ERROR,
            "space reported an error without details",
        )
    }

    async fn decrypt(
        &self,
        username: &str,
        cipher: &RequestCipher,
        info: &EncryptionInfo,
        payload: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        match cipher.decrypt_response(info, payload) {
            Ok(plaintext) => Ok(plaintext),
            Err(CryptoError::Aead) => {
                tracing::warn!("reply failed authentication; evicting cached space key");
                self.keys.invalidate(username).await;
                Err(TunnelError::decryption_failed(username, CryptoError::Aead.to_string()))
            },
            Err(e) => Err(TunnelError::decryption_failed(username, e.to_string())),
        }
    }
}

impl std::fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("default_timeout", &self.default_timeout)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Publishes the request and waits for the reply carrying `correlation_id`.
async fn exchange(
    bus: &dyn MessageBus,
    subscription: &mut dyn Subscription,
    username: &str,
    body: Bytes,
    correlation_id: &str,
) -> Result<TunnelResponse> {
    bus.publish(&space_subject(username), body).await?;
    tracing::debug!("tunnel request published");

    while let Some(message) = subscription.next_message().await {
        let response: TunnelResponse = match serde_json::from_slice(&message) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unparseable reply");
                continue;
            },
        };
        if response.message_type != MessageType::EndpointResponse {
            tracing::warn!(message_type = ?response.message_type, "ignoring non-response message");
            continue;
        }
        if response.correlation_id != correlation_id {
            tracing::warn!(
                received = %response.correlation_id,
                "ignoring reply for another correlation id"
            );
            continue;
        }
        return Ok(response);
    }
    Err(TunnelError::bus(format!("reply subscription for space '{username}' closed")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        bus::{BusEvent, MemoryBus, MemoryConnector},
        crypto::SpaceCipher,
        protocol::EndpointType,
        testutil::{SpaceSimulator, StaticKeyResolver, test_config},
    };

    fn transport_over(bus: &MemoryBus, resolver: Arc<StaticKeyResolver>) -> TunnelTransport {
        TunnelTransport::new(
            &test_config(),
            Arc::new(MemoryConnector::new(bus.clone())),
            resolver,
        )
    }

    fn docs() -> EndpointRef {
        EndpointRef { slug: "docs".to_owned(), endpoint_type: EndpointType::DataSource }
    }

    #[tokio::test]
    async fn test_request_reaches_space_encrypted() {
        let bus = MemoryBus::new();
        let space = SpaceSimulator::echo(&bus, "alice").await;
        let resolver = Arc::new(StaticKeyResolver::new());
        resolver.set_key("alice", space.public_key());
        let transport = transport_over(&bus, resolver);

        let reply = transport
            .send(TunnelCall::new("alice", docs(), json!({"query": "secret words"})))
            .await
            .unwrap();

        assert_eq!(reply["echo"]["query"], "secret words");
        let raw = space.last_raw_request().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("secret words"));
    }

    #[tokio::test]
    async fn test_subscribe_precedes_publish_and_unsubscribe_follows() {
        let bus = MemoryBus::new();
        let space = SpaceSimulator::echo(&bus, "alice").await;
        let resolver = Arc::new(StaticKeyResolver::new());
        resolver.set_key("alice", space.public_key());
        let transport = transport_over(&bus, resolver);

        transport.send(TunnelCall::new("alice", docs(), json!({}))).await.unwrap();

        let request = space.last_request().unwrap();
        let reply_subject = peer_subject(&request.reply_to);
        let events = bus.events();
        let position = |wanted: &BusEvent| events.iter().position(|e| e == wanted).unwrap();

        let subscribed = position(&BusEvent::Subscribed(reply_subject.clone()));
        let published = position(&BusEvent::Published(space_subject("alice")));
        let unsubscribed = position(&BusEvent::Unsubscribed(reply_subject.clone()));
        assert!(subscribed < published, "reply subject must be subscribed before publishing");
        assert!(published < unsubscribed);
        assert_eq!(bus.subscriber_count(&reply_subject), 0);
    }

    #[tokio::test]
    async fn test_rejects_wildcard_username_before_fetching_key() {
        let bus = MemoryBus::new();
        let resolver = Arc::new(StaticKeyResolver::new());
        let transport = transport_over(&bus, Arc::clone(&resolver));

        let err = transport.send(TunnelCall::new("alice.*", docs(), json!({}))).await.unwrap_err();

        assert_eq!(err.code(), "INVALID_TARGET");
        assert_eq!(resolver.fetch_count("alice.*"), 0);
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_never_touches_bus() {
        let bus = MemoryBus::new();
        let transport = transport_over(&bus, Arc::new(StaticKeyResolver::new()));

        let err = transport.send(TunnelCall::new("ghost", docs(), json!({}))).await.unwrap_err();

        assert_eq!(err.code(), "ENCRYPTION_KEY_MISSING");
        assert!(!transport.is_connected().await);
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn test_space_unable_to_open_request_reports_remote_error() {
        let bus = MemoryBus::new();
        let space = SpaceSimulator::echo(&bus, "alice").await;
        let resolver = Arc::new(StaticKeyResolver::new());
        // The backend still serves a rotated-out key.
        resolver.set_key("alice", SpaceCipher::generate().public_key());
        let transport = transport_over(&bus, resolver);

        let err = transport.send(TunnelCall::new("alice", docs(), json!({}))).await.unwrap_err();

        let TunnelError::RemoteError { code, .. } = err else {
            panic!("expected remote error, got {err:?}");
        };
        assert_eq!(code, "DECRYPTION_FAILED");
        assert!(space.last_request().is_some());
    }
}
