//! Core hook types: extension points, priorities, context, registrations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PluginResult;

/// Named extension points in the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// A request entered the pipeline (middleware request phase).
    RequestStart,
    /// A response is about to leave the pipeline (middleware response phase).
    RequestComplete,
    /// An inbound message was received.
    MessageReceived,
    /// An outbound message is about to be sent.
    MessageSend,
    /// A pipeline stage produced an error.
    Error,
    /// A health check cycle completed.
    HealthReport,
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestStart => write!(f, "request_start"),
            Self::RequestComplete => write!(f, "request_complete"),
            Self::MessageReceived => write!(f, "message_received"),
            Self::MessageSend => write!(f, "message_send"),
            Self::Error => write!(f, "error"),
            Self::HealthReport => write!(f, "health_report"),
        }
    }
}

/// Hook priority. `Critical` runs first; ties preserve registration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HookPriority {
    /// Runs first.
    Critical,
    /// Runs before normal hooks.
    High,
    /// Default.
    #[default]
    Normal,
    /// Runs last.
    Low,
}

impl HookPriority {
    /// Sort rank; lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Bucket a numeric plugin priority into a hook priority.
    pub fn from_weight(weight: i32) -> Self {
        if weight >= 100 {
            Self::Critical
        } else if weight >= 50 {
            Self::High
        } else if weight >= 0 {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

/// Payload handed to hook callbacks.
///
/// The `data` document is threaded through the callbacks of one dispatch:
/// each successful callback returns the (possibly transformed) payload, which
/// feeds the next callback in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    /// The extension point being dispatched.
    pub hook_type: HookType,

    /// In-flight payload.
    pub data: serde_json::Value,
}

impl HookContext {
    /// Create a context for a hook type.
    pub fn new(hook_type: HookType, data: serde_json::Value) -> Self {
        Self { hook_type, data }
    }
}

/// Trait for hook callbacks.
#[async_trait]
pub trait HookCallback: Send + Sync {
    /// Observe or transform the in-flight payload. Returns the payload to
    /// feed the next callback; errors are captured by the dispatcher and
    /// never propagate.
    async fn call(&self, ctx: HookContext) -> PluginResult<serde_json::Value>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> HookCallback for FnCallback<F>
where
    F: Fn(HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = PluginResult<serde_json::Value>> + Send,
{
    async fn call(&self, ctx: HookContext) -> PluginResult<serde_json::Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a hook callback.
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PluginResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

/// One registered callback. Owned by the hook manager; created on
/// `register_hook`, destroyed on `unregister_hook` or plugin shutdown.
#[derive(Clone)]
pub struct HookRegistration {
    /// Extension point.
    pub hook_type: HookType,

    /// Execution priority.
    pub priority: HookPriority,

    /// Owning plugin name.
    pub plugin: String,

    /// Disabled registrations stay in place but are skipped by dispatch.
    pub enabled: bool,

    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,

    /// Per-registration timeout; the manager default applies when unset.
    pub timeout: Option<Duration>,

    /// The callback itself.
    pub callback: Arc<dyn HookCallback>,
}

impl HookRegistration {
    /// Create an enabled registration with the default timeout.
    pub fn new(
        hook_type: HookType,
        plugin: impl Into<String>,
        priority: HookPriority,
        callback: Arc<dyn HookCallback>,
    ) -> Self {
        Self {
            hook_type,
            priority,
            plugin: plugin.into(),
            enabled: true,
            registered_at: Utc::now(),
            timeout: None,
            callback,
        }
    }

    /// Set a per-registration timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Registration summary for the observability sink.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "plugin": self.plugin,
            "priority": self.priority,
            "enabled": self.enabled,
            "registered_at": self.registered_at.to_rfc3339(),
            "timeout_ms": self.timeout.map(|t| t.as_millis() as u64),
        })
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("hook_type", &self.hook_type)
            .field("priority", &self.priority)
            .field("plugin", &self.plugin)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(HookPriority::Critical < HookPriority::High);
        assert!(HookPriority::High < HookPriority::Normal);
        assert!(HookPriority::Normal < HookPriority::Low);
        assert_eq!(HookPriority::Critical.rank(), 0);
        assert_eq!(HookPriority::Low.rank(), 3);
    }

    #[test]
    fn test_hook_type_display() {
        assert_eq!(HookType::RequestStart.to_string(), "request_start");
        assert_eq!(HookType::RequestComplete.to_string(), "request_complete");
    }

    #[tokio::test]
    async fn test_fn_callback() {
        let cb = callback_fn(|ctx: HookContext| async move { Ok(ctx.data) });
        let result = cb
            .call(HookContext::new(HookType::Error, serde_json::json!(42)))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn test_registration_describe() {
        let reg = HookRegistration::new(
            HookType::RequestStart,
            "auth",
            HookPriority::High,
            callback_fn(|ctx| async move { Ok(ctx.data) }),
        )
        .with_timeout(Duration::from_millis(250));

        let info = reg.describe();
        assert_eq!(info["plugin"], "auth");
        assert_eq!(info["timeout_ms"], 250);
        assert_eq!(info["enabled"], true);
    }
}
