//! Publish/subscribe message bus abstraction.
//!
//! [`NatsConnector`] talks to a real NATS server through `async-nats`.
//! [`MemoryBus`] is an in-process broker that records every subscribe,
//! publish, and unsubscribe so tests can assert ordering and cleanup.
//!
//! Dropping a [`Subscription`] unsubscribes it, so a cancelled call never
//! leaves its reply subject registered.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::{
    config::TunnelConfig,
    error::{Result, TunnelError},
};

/// An open connection to the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribes to `subject`. Messages published after this returns are
    /// delivered to the subscription.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>>;

    /// Publishes `payload` to `subject` and flushes it to the server.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// A live subscription to one subject.
#[async_trait]
pub trait Subscription: Send {
    /// Subject this subscription listens on.
    fn subject(&self) -> &str;

    /// Waits for the next message; `None` once the subscription ends.
    async fn next_message(&mut self) -> Option<Bytes>;

    /// Removes the subscription. Idempotent.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Opens bus connections.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> Result<Arc<dyn MessageBus>>;
}

// ---------------------------------------------------------------------------
// NATS
// ---------------------------------------------------------------------------

/// Connects to NATS with the URL and token from [`TunnelConfig`].
pub struct NatsConnector {
    url: String,
    token: Option<Zeroizing<String>>,
}

impl NatsConnector {
    /// Creates a connector for `url`, optionally authenticating with `token`.
    #[must_use]
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self { url: url.into(), token: token.map(Zeroizing::new) }
    }

    /// Creates a connector from tunnel configuration.
    #[must_use]
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.nats_url(), config.nats_auth_token().map(str::to_owned))
    }
}

impl std::fmt::Debug for NatsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsConnector")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> Result<Arc<dyn MessageBus>> {
        let mut options = async_nats::ConnectOptions::new().name("syfthub-tunnel");
        if let Some(token) = &self.token {
            options = options.token(token.as_str().to_owned());
        }
        let client = options
            .connect(self.url.as_str())
            .await
            .map_err(|e| TunnelError::bus(format!("failed to connect to {}: {e}", self.url)))?;
        tracing::info!("connected to NATS");
        Ok(Arc::new(NatsBus { client }))
    }
}

/// [`MessageBus`] over an `async-nats` client.
#[derive(Debug, Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Wraps an already connected client.
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        let subscriber = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|e| TunnelError::bus(format!("subscribe to {subject}: {e}")))?;
        Ok(Box::new(NatsSubscription { subject: subject.to_owned(), inner: Some(subscriber) }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|e| TunnelError::bus(format!("publish to {subject}: {e}")))?;
        self.client.flush().await.map_err(|e| TunnelError::bus(format!("flush: {e}")))
    }

    async fn close(&self) -> Result<()> {
        // The connection shuts down once the last client handle is dropped.
        self.client.flush().await.map_err(|e| TunnelError::bus(format!("flush: {e}")))
    }
}

struct NatsSubscription {
    subject: String,
    inner: Option<async_nats::Subscriber>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next_message(&mut self) -> Option<Bytes> {
        let message = self.inner.as_mut()?.next().await?;
        Some(message.payload)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(mut subscriber) => subscriber
                .unsubscribe()
                .await
                .map_err(|e| TunnelError::bus(format!("unsubscribe from {}: {e}", self.subject))),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Bus operation recorded by [`MemoryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A subscription was registered on the subject.
    Subscribed(String),
    /// A message was published to the subject.
    Published(String),
    /// A subscription on the subject was removed.
    Unsubscribed(String),
}

impl BusEvent {
    /// Subject the event concerns.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::Subscribed(s) | Self::Published(s) | Self::Unsubscribed(s) => s,
        }
    }
}

#[derive(Default)]
struct Broker {
    subscribers: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Bytes>)>>>,
    events: Mutex<Vec<BusEvent>>,
    next_id: AtomicU64,
}

impl Broker {
    fn record(&self, event: BusEvent) {
        self.events.lock().push(event);
    }

    fn remove(&self, subject: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(subject) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                subscribers.remove(subject);
            }
        }
        drop(subscribers);
        self.record(BusEvent::Unsubscribed(subject.to_owned()));
    }
}

/// In-process broker with exact-subject routing and an event log.
///
/// Clones share the same broker. Each [`MemoryBus::client`] is an
/// independent connection that can be closed on its own.
#[derive(Clone, Default)]
pub struct MemoryBus {
    broker: Arc<Broker>,
}

impl MemoryBus {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection to this broker.
    #[must_use]
    pub fn client(&self) -> MemoryClient {
        MemoryClient { broker: Arc::clone(&self.broker), closed: AtomicBool::new(false) }
    }

    /// Every operation recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<BusEvent> {
        self.broker.events.lock().clone()
    }

    /// Events concerning `subject`, in order.
    #[must_use]
    pub fn events_for(&self, subject: &str) -> Vec<BusEvent> {
        self.broker.events.lock().iter().filter(|e| e.subject() == subject).cloned().collect()
    }

    /// Number of live subscriptions on `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker.subscribers.lock().get(subject).map_or(0, Vec::len)
    }

    /// Number of live subscriptions across all subjects.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.broker.subscribers.lock().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus").field("subscribers", &self.total_subscribers()).finish()
    }
}

/// One connection to a [`MemoryBus`].
pub struct MemoryClient {
    broker: Arc<Broker>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::bus("connection closed"));
        }
        Ok(())
    }

    /// Returns `true` once [`MessageBus::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessageBus for MemoryClient {
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.subscribers.lock().entry(subject.to_owned()).or_default().push((id, tx));
        self.broker.record(BusEvent::Subscribed(subject.to_owned()));
        Ok(Box::new(MemorySubscription {
            broker: Arc::clone(&self.broker),
            subject: subject.to_owned(),
            id,
            rx,
            active: true,
        }))
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.broker.record(BusEvent::Published(subject.to_owned()));
        if let Some(list) = self.broker.subscribers.lock().get(subject) {
            for (_, tx) in list {
                // A receiver that has gone away is removed by its own drop.
                let _ = tx.send(payload.clone());
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemorySubscription {
    broker: Arc<Broker>,
    subject: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    active: bool,
}

impl MemorySubscription {
    fn detach(&mut self) {
        if std::mem::take(&mut self.active) {
            self.rx.close();
            self.broker.remove(&self.subject, self.id);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn next_message(&mut self) -> Option<Bytes> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// [`BusConnector`] that hands out [`MemoryBus`] clients and counts them.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    bus: MemoryBus,
    connects: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryConnector {
    /// Creates a connector for `bus`.
    #[must_use]
    pub fn new(bus: MemoryBus) -> Self {
        Self { bus, connects: AtomicUsize::new(0), unavailable: AtomicBool::new(false) }
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Makes subsequent connects fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageBus>> {
        // Widen the window in which concurrent first users could race.
        tokio::task::yield_now().await;
        if self.unavailable.load(Ordering::Acquire) {
            return Err(TunnelError::bus("bus unavailable"));
        }
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(self.bus.client()))
    }
}
