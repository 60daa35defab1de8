//! # Arbor Plugin System
//!
//! Plugin orchestration and event-hook execution for the Arbor chat host.
//!
//! ## Features
//!
//! - **Typed capabilities**: backends, message processors, feature
//!   extensions and middleware, each behind its own trait
//! - **Lifecycle orchestration**: dependency-ordered loading, idempotent
//!   initialize/shutdown, health-driven ACTIVE ⇄ DEGRADED transitions
//! - **Hook system**: priority-ordered dispatch with per-callback timeouts,
//!   panic isolation, concurrency bounds and per-plugin circuit breaking
//! - **Hot reload**: fingerprint-tracked sources with atomic hook swaps
//! - **Request pipeline**: middleware, processors, extensions and exactly
//!   one backend per request
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbor_plugins::{ManagerConfig, PluginManager, PluginSource};
//! use arbor_protocol::{ChatContext, Message};
//!
//! #[tokio::main]
//! async fn main() -> arbor_plugins::Result<()> {
//!     let manager = PluginManager::new(ManagerConfig::default());
//!     manager.add_plugin(PluginSource::new("echo", || Box::new(EchoBackend::default()))).await?;
//!     manager.initialize().await?;
//!
//!     let ctx = ChatContext::new(vec![Message::user("hello")]);
//!     let output = manager.process_request(ctx).await;
//!
//!     manager.shutdown().await
//! }
//! ```

pub mod breaker;
pub mod capability;
pub mod config;
pub mod error;
pub mod hooks;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod plugin;
pub mod registry;

pub use breaker::{BreakerDecision, BreakerState, CircuitBreaker};
pub use capability::{
    BackendProvider, FeatureExtension, HealthReport, HealthStatus, MessageProcessor, Middleware,
    MiddlewarePayload,
};
pub use config::{HookSettings, ManagerConfig, PluginConfig, PluginEntry};
pub use error::{Failure, PluginError, PluginResult, Result};
pub use hooks::{
    HookCallback, HookContext, HookManager, HookPriority, HookRegistration, HookStats, HookType,
    callback_fn,
};
pub use loader::{PluginFactory, PluginLoader, PluginSource, verify_capability};
pub use manager::{PipelineOutput, PluginManager};
pub use metadata::{PluginMetadata, PluginType};
pub use plugin::{Plugin, PluginHandle, PluginState};
pub use registry::PluginRegistry;

/// Plugin system version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
