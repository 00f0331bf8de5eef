//! # SyftHub Tunnel
//!
//! Encrypted request/reply between the hub and Spaces that are only reachable
//! through a publish/subscribe bus.
//!
//! This crate provides:
//! - **Protocol**: `syfthub-tunnel/v1` request and response envelopes
//! - **Crypto**: per-request X25519 ephemeral keys, HKDF-SHA256, AES-256-GCM bound to the
//!   correlation id
//! - **Key cache**: TTL cache of Space public keys in front of the backend lookup, evicted on
//!   authentication failure
//! - **Transport**: one lazy bus connection; subscribe-before-publish; bounded wait; guaranteed
//!   unsubscribe
//! - **Operations**: typed data-source and model calls, with fan-out across data sources
//!
//! ## Example
//!
//! ```no_run
//! use syfthub_tunnel::{DataSourceQuery, SpaceTarget, TunnelConfig, TunnelTransport};
//!
//! # async fn example() -> Result<(), syfthub_tunnel::TunnelError> {
//! let config = TunnelConfig::builder()
//!     .nats_url("nats://nats:4222")
//!     .backend_url("http://backend:8000")
//!     .build()?;
//! let transport = TunnelTransport::from_config(&config)?;
//!
//! let targets = [SpaceTarget::new("alice", "papers"), SpaceTarget::new("bob", "notes")];
//! let query = DataSourceQuery::new("rust", 5);
//! for result in transport.query_data_sources(&targets, &query, None).await {
//!     println!("{}/{}: {:?}", result.space, result.slug, result.status);
//! }
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Message bus abstraction with NATS and in-memory implementations.
pub mod bus;
/// Tunnel configuration.
pub mod config;
/// Envelope encryption.
pub mod crypto;
/// Tunnel error types.
pub mod error;
/// Space public-key resolution and caching.
pub mod key_cache;
/// Typed endpoint calls.
pub mod operations;
/// Wire envelopes and subjects.
pub mod protocol;
/// Request/reply transport.
pub mod transport;

/// Shared test utilities (requires the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use bus::{BusConnector, BusEvent, MemoryBus, MessageBus, NatsConnector, Subscription};
pub use config::TunnelConfig;
pub use crypto::{
    ALGORITHM, CryptoError, RequestCipher, ResponseSealer, SpaceCipher, SpacePublicKey,
};
pub use error::{Result, TunnelError};
pub use key_cache::{EncryptionKeyResolver, HttpKeyResolver, SpaceKeyCache};
pub use operations::{
    ChatMessage, DataSourceQuery, DataSourceResult, Document, ModelQuery, ModelResult,
    QueryStatus, SpaceTarget, Usage,
};
pub use protocol::{
    EncryptionInfo, EndpointRef, EndpointType, PROTOCOL_VERSION, TunnelRequest, TunnelResponse,
};
pub use transport::{TunnelCall, TunnelTransport};
