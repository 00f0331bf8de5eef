//! Typed endpoint calls on top of [`TunnelTransport::send`].
//!
//! Retrieval never fails across this boundary: every source yields a
//! [`DataSourceResult`] whose status says what happened, so one slow or
//! broken Space cannot abort a fan-out. Generation has a single target and
//! propagates [`TunnelError`].

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{
    error::{Result, TunnelError},
    protocol::{EndpointRef, EndpointType},
    transport::{TunnelCall, TunnelTransport},
};

/// An endpoint on a specific Space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceTarget {
    /// Username owning the Space.
    pub username: String,
    /// Endpoint slug.
    pub slug: String,
    /// Satellite token minted for this Space's audience.
    pub satellite_token: Option<String>,
}

impl SpaceTarget {
    /// Creates a target without a satellite token.
    #[must_use]
    pub fn new(username: impl Into<String>, slug: impl Into<String>) -> Self {
        Self { username: username.into(), slug: slug.into(), satellite_token: None }
    }

    /// Attaches a satellite token.
    #[must_use]
    pub fn with_satellite_token(mut self, token: impl Into<String>) -> Self {
        self.satellite_token = Some(token.into());
        self
    }

    fn call(
        &self,
        endpoint_type: EndpointType,
        payload: Value,
        timeout: Option<Duration>,
    ) -> TunnelCall {
        TunnelCall {
            username: self.username.clone(),
            endpoint: EndpointRef { slug: self.slug.clone(), endpoint_type },
            payload,
            satellite_token: self.satellite_token.clone(),
            timeout,
        }
    }
}

/// Retrieval request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceQuery {
    /// Search text.
    pub query: String,
    /// Maximum number of documents.
    pub limit: u32,
    /// Minimum similarity for a document to be returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f64>,
}

impl DataSourceQuery {
    /// Creates a query for at most `limit` documents.
    #[must_use]
    pub fn new(query: impl Into<String>, limit: u32) -> Self {
        Self { query: query.into(), limit, similarity_threshold: None }
    }
}

/// One retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document text.
    pub content: String,
    /// Similarity score.
    #[serde(default)]
    pub score: f64,
    /// Source-defined metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct DataSourceReply {
    #[serde(default)]
    documents: Vec<Document>,
}

/// Outcome of a retrieval call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Documents were returned.
    Success,
    /// The call failed; see `error_code`.
    Error,
    /// The Space did not reply in time.
    Timeout,
}

/// Per-source retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceResult {
    /// Space username.
    pub space: String,
    /// Endpoint slug.
    pub slug: String,
    /// Outcome.
    pub status: QueryStatus,
    /// Retrieved documents; empty unless `status` is `success`.
    pub documents: Vec<Document>,
    /// Error message for `error` and `timeout`.
    pub error: Option<String>,
    /// Stable [`TunnelError::code`] for `error` and `timeout`.
    pub error_code: Option<String>,
    /// Wall-clock time spent on the call.
    pub latency_ms: u64,
}

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// Generation request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQuery {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Token budget for the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token accounting reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Deserialize)]
struct ModelReply {
    message: ChatMessage,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Generation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    /// Generated message.
    pub message: ChatMessage,
    /// Token accounting, when reported.
    pub usage: Option<Usage>,
    /// Wall-clock time spent on the call.
    pub latency_ms: u64,
}

impl TunnelTransport {
    /// Queries one data source. Never fails; inspect
    /// [`DataSourceResult::status`].
    #[tracing::instrument(
        skip(self, query),
        fields(username = %target.username, slug = %target.slug)
    )]
    pub async fn query_data_source(
        &self,
        target: &SpaceTarget,
        query: &DataSourceQuery,
        timeout: Option<Duration>,
    ) -> DataSourceResult {
        let started = Instant::now();
        let outcome = match serde_json::to_value(query) {
            Ok(payload) => self.send(target.call(EndpointType::DataSource, payload, timeout)).await,
            Err(e) => Err(e.into()),
        };
        let outcome = outcome.and_then(|reply| {
            serde_json::from_value::<DataSourceReply>(reply).map_err(|e| {
                let reason = format!("invalid documents: {e}");
                TunnelError::incompatible_response(&target.username, reason)
            })
        });
        let latency_ms = elapsed_ms(started);

        let mut result = DataSourceResult {
            space: target.username.clone(),
            slug: target.slug.clone(),
            status: QueryStatus::Success,
            documents: Vec::new(),
            error: None,
            error_code: None,
            latency_ms,
        };
        match outcome {
            Ok(reply) => result.documents = reply.documents,
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "data source query failed");
                result.status =
                    if e.is_timeout() { QueryStatus::Timeout } else { QueryStatus::Error };
                result.error_code = Some(e.code().to_owned());
                result.error = Some(e.to_string());
            },
        }
        result
    }

    /// Queries several data sources concurrently.
    ///
    /// Results are returned in `targets` order, one per target.
    pub async fn query_data_sources(
        &self,
        targets: &[SpaceTarget],
        query: &DataSourceQuery,
        timeout: Option<Duration>,
    ) -> Vec<DataSourceResult> {
        join_all(targets.iter().map(|target| self.query_data_source(target, query, timeout))).await
    }

    /// Queries a model endpoint.
    ///
    /// # Errors
    ///
    /// Every [`TunnelTransport::send`] error, plus
    /// [`TunnelError::IncompatibleResponse`] if the reply has no message.
    #[tracing::instrument(
        skip(self, query),
        fields(username = %target.username, slug = %target.slug)
    )]
    pub async fn query_model(
        &self,
        target: &SpaceTarget,
        query: &ModelQuery,
        timeout: Option<Duration>,
    ) -> Result<ModelResult> {
        let started = Instant::now();
        let payload = serde_json::to_value(query)?;
        let reply = self.send(target.call(EndpointType::Model, payload, timeout)).await?;
        let reply: ModelReply = serde_json::from_value(reply).map_err(|e| {
            let reason = format!("invalid model reply: {e}");
            TunnelError::incompatible_response(&target.username, reason)
        })?;
        Ok(ModelResult {
            message: reply.message,
            usage: reply.usage,
            latency_ms: elapsed_ms(started),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
