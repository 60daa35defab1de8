//! Capability interfaces: the structural contracts a plugin may implement.
//!
//! Lifecycle (`initialize`/`shutdown`/`health_check`) lives on the base
//! [`Plugin`](crate::plugin::Plugin) trait; a capability trait adds only the
//! operations specific to that plugin type. The loader verifies that an
//! instantiated plugin structurally satisfies the capability declared in its
//! metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use arbor_protocol::{ChatContext, ChatReply, Message};

use crate::PluginResult;

/// Payload map handed to middleware stages.
pub type MiddlewarePayload = serde_json::Map<String, serde_json::Value>;

/// Health check outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Plugin is fully operational.
    Healthy,
    /// Plugin is impaired but still serving; excluded from ACTIVE lookups.
    Degraded,
}

/// Health check report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,

    /// Free-form detail map for the observability sink.
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl HealthReport {
    /// A healthy report with no details.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            details: serde_json::Map::new(),
        }
    }

    /// A degraded report with a reason.
    pub fn degraded(reason: impl Into<String>) -> Self {
        let mut details = serde_json::Map::new();
        details.insert("reason".to_string(), serde_json::json!(reason.into()));
        Self {
            status: HealthStatus::Degraded,
            details,
        }
    }
}

/// The generation step. Exactly one provider is invoked per request.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Produce a reply for the conversation: a single message, or a lazy,
    /// single-pass stream of text fragments when `ctx.stream` is set.
    async fn chat(&self, ctx: &ChatContext) -> PluginResult<ChatReply>;

    /// Models this provider can serve.
    async fn list_models(&self) -> PluginResult<Vec<String>>;
}

/// Pure, non-rejecting message transform (filtering, redaction).
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Transform one message. Processors never reject a request; a failed
    /// transform leaves the message unchanged.
    async fn process_message(&self, message: Message, ctx: &ChatContext) -> PluginResult<Message>;
}

/// Context enrichment (retrieved documents, conversation history).
#[async_trait]
pub trait FeatureExtension: Send + Sync {
    /// Enrich the context and hand it back.
    async fn extend(&self, ctx: ChatContext) -> PluginResult<ChatContext>;
}

/// Request/response interception (audit, auth, rate limiting).
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Observe or transform the request payload. A failure carrying a status
    /// short-circuits the whole pipeline.
    async fn process_request(&self, payload: MiddlewarePayload) -> PluginResult<MiddlewarePayload>;

    /// Observe or transform the response payload. Always fail-open: a failure
    /// here never invalidates an already-produced response.
    async fn process_response(&self, payload: MiddlewarePayload)
    -> PluginResult<MiddlewarePayload>;
}
