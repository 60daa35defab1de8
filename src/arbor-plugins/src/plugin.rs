//! Core plugin trait, state machine, and the lifecycle handle.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::capability::{
    BackendProvider, FeatureExtension, HealthReport, HealthStatus, MessageProcessor, Middleware,
};
use crate::config::PluginConfig;
use crate::hooks::HookRegistration;
use crate::metadata::PluginMetadata;
use crate::{Failure, PluginError, PluginResult, Result};

/// Plugin runtime state.
///
/// Owned exclusively by the manager-side [`PluginHandle`]; no other component
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Plugin is known but not instantiated.
    Unloaded,
    /// Plugin is instantiated but not initialized.
    Loaded,
    /// Plugin is initializing.
    Initializing,
    /// Plugin is active and serving.
    Active,
    /// Plugin is impaired; excluded from lookups until healthy again.
    Degraded,
    /// Plugin is shutting down.
    ShuttingDown,
    /// Plugin has shut down.
    Shutdown,
    /// Terminal failure state.
    Failed,
}

impl PluginState {
    /// Whether the state machine permits this transition.
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Loaded)
                | (Loaded, Initializing)
                | (Loaded, Failed)
                | (Initializing, Active)
                | (Initializing, Failed)
                | (Active, Degraded)
                | (Active, ShuttingDown)
                | (Active, Failed)
                | (Degraded, Active)
                | (Degraded, ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Failed)
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loaded => write!(f, "loaded"),
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Trait for plugin implementations.
///
/// Construction must have no side effects; all setup happens in
/// `initialize`. A plugin implements exactly one capability and exposes it
/// through the matching `as_*` accessor.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Immutable plugin metadata.
    fn metadata(&self) -> &PluginMetadata;

    /// Initialize the plugin with its configuration slice.
    async fn initialize(&mut self, config: &PluginConfig) -> PluginResult<()>;

    /// Release plugin resources.
    async fn shutdown(&mut self) -> PluginResult<()>;

    /// Report plugin health. Drives the ACTIVE ⇄ DEGRADED transitions.
    async fn health_check(&self) -> PluginResult<HealthReport> {
        Ok(HealthReport::healthy())
    }

    /// Hook registrations this plugin contributes. Collected once after a
    /// successful `initialize`, and again after a hot-reload swap, so the
    /// hook manager can install them atomically.
    fn hook_registrations(&self) -> Vec<HookRegistration> {
        Vec::new()
    }

    /// Backend provider capability, if implemented.
    fn as_backend(&self) -> Option<&dyn BackendProvider> {
        None
    }

    /// Message processor capability, if implemented.
    fn as_message_processor(&self) -> Option<&dyn MessageProcessor> {
        None
    }

    /// Feature extension capability, if implemented.
    fn as_feature_extension(&self) -> Option<&dyn FeatureExtension> {
        None
    }

    /// Middleware capability, if implemented.
    fn as_middleware(&self) -> Option<&dyn Middleware> {
        None
    }
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("metadata", self.metadata())
            .finish()
    }
}

/// A handle to a loaded plugin.
///
/// The handle owns the plugin's state machine and enforces lifecycle
/// idempotency: a second `initialize` or `shutdown` returns the cached result
/// instead of re-running side effects.
#[derive(Clone)]
pub struct PluginHandle {
    metadata: PluginMetadata,
    priority: i32,
    plugin: Arc<RwLock<Box<dyn Plugin>>>,
    state: Arc<RwLock<PluginState>>,
    init_result: Arc<RwLock<Option<PluginResult<()>>>>,
    shutdown_result: Arc<RwLock<Option<PluginResult<()>>>>,
}

impl PluginHandle {
    /// Wrap a freshly constructed plugin instance.
    pub fn new(plugin: Box<dyn Plugin>) -> Self {
        let metadata = plugin.metadata().clone();
        let priority = metadata.priority;
        Self {
            metadata,
            priority,
            plugin: Arc::new(RwLock::new(plugin)),
            state: Arc::new(RwLock::new(PluginState::Loaded)),
            init_result: Arc::new(RwLock::new(None)),
            shutdown_result: Arc::new(RwLock::new(None)),
        }
    }

    /// Wrap a plugin with a config-supplied priority override.
    pub fn with_priority(plugin: Box<dyn Plugin>, priority: i32) -> Self {
        let mut handle = Self::new(plugin);
        handle.priority = priority;
        handle
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Plugin metadata.
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Effective priority (config override or declared).
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Current state.
    pub async fn state(&self) -> PluginState {
        *self.state.read().await
    }

    /// Whether the plugin is serving requests.
    pub async fn is_active(&self) -> bool {
        self.state().await == PluginState::Active
    }

    /// Read access to the plugin instance (capability calls go through here).
    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, Box<dyn Plugin>> {
        self.plugin.read().await
    }

    /// Force the terminal failure state.
    pub(crate) async fn mark_failed(&self) {
        *self.state.write().await = PluginState::Failed;
    }

    async fn transition(&self, next: PluginState) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            return Err(PluginError::InvalidState {
                expected: next.to_string(),
                actual: state.to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    /// Initialize the plugin. Idempotent: a repeat call returns the cached
    /// result without re-running plugin side effects.
    pub async fn initialize(&self, config: &PluginConfig) -> PluginResult<()> {
        if let Some(cached) = self.init_result.read().await.clone() {
            tracing::debug!("Plugin {} already initialized, returning cached result", self.name());
            return cached;
        }

        if let Err(e) = self.transition(PluginState::Initializing).await {
            return Err(Failure::from(e));
        }

        let result = {
            let mut plugin = self.plugin.write().await;
            plugin.initialize(config).await
        };

        match &result {
            Ok(()) => {
                *self.state.write().await = PluginState::Active;
                tracing::info!("Initialized plugin: {} v{}", self.name(), self.metadata.version);
            }
            Err(e) => {
                *self.state.write().await = PluginState::Failed;
                tracing::warn!("Plugin {} failed to initialize: {}", self.name(), e);
            }
        }

        *self.init_result.write().await = Some(result.clone());
        result
    }

    /// Shut the plugin down. Idempotent: a repeat call returns the cached
    /// result; a plugin that never became active shuts down as a no-op.
    pub async fn shutdown(&self) -> PluginResult<()> {
        if let Some(cached) = self.shutdown_result.read().await.clone() {
            tracing::debug!("Plugin {} already shut down, returning cached result", self.name());
            return cached;
        }

        match self.state().await {
            PluginState::Active | PluginState::Degraded => {}
            // Never ran, nothing to release.
            _ => {
                *self.shutdown_result.write().await = Some(Ok(()));
                return Ok(());
            }
        }

        if let Err(e) = self.transition(PluginState::ShuttingDown).await {
            return Err(Failure::from(e));
        }

        let result = {
            let mut plugin = self.plugin.write().await;
            plugin.shutdown().await
        };

        *self.state.write().await = PluginState::Shutdown;
        if let Err(e) = &result {
            tracing::warn!("Plugin {} failed during shutdown: {}", self.name(), e);
        } else {
            tracing::info!("Shut down plugin: {}", self.name());
        }

        *self.shutdown_result.write().await = Some(result.clone());
        result
    }

    /// Run a health check and apply the ACTIVE ⇄ DEGRADED transitions.
    pub async fn health_check(&self) -> PluginResult<HealthReport> {
        let current = self.state().await;
        if !matches!(current, PluginState::Active | PluginState::Degraded) {
            return Err(Failure::new(
                format!("plugin '{}' is {current}, not serving", self.name()),
                "invalid_state",
            ));
        }

        let report = {
            let plugin = self.plugin.read().await;
            plugin.health_check().await
        };

        match &report {
            Ok(r) => match (current, r.status) {
                (PluginState::Active, HealthStatus::Degraded) => {
                    tracing::warn!("Plugin {} degraded", self.name());
                    *self.state.write().await = PluginState::Degraded;
                }
                (PluginState::Degraded, HealthStatus::Healthy) => {
                    tracing::info!("Plugin {} recovered", self.name());
                    *self.state.write().await = PluginState::Active;
                }
                _ => {}
            },
            Err(e) => {
                tracing::warn!("Health check failed for plugin {}: {}", self.name(), e);
                if current == PluginState::Active {
                    *self.state.write().await = PluginState::Degraded;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPlugin {
        metadata: PluginMetadata,
        init_calls: Arc<AtomicU32>,
        shutdown_calls: Arc<AtomicU32>,
        fail_init: bool,
    }

    impl CountingPlugin {
        fn new(name: &str) -> (Self, Arc<AtomicU32>, Arc<AtomicU32>) {
            let init_calls = Arc::new(AtomicU32::new(0));
            let shutdown_calls = Arc::new(AtomicU32::new(0));
            let plugin = Self {
                metadata: PluginMetadata::new(
                    name,
                    "1.0.0",
                    crate::metadata::PluginType::Middleware,
                ),
                init_calls: init_calls.clone(),
                shutdown_calls: shutdown_calls.clone(),
                fail_init: false,
            };
            (plugin, init_calls, shutdown_calls)
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(Failure::new("boom", "init_error"));
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> PluginResult<()> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_state_transitions() {
        use PluginState::*;
        assert!(Loaded.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Active));
        assert!(Active.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Active));
        assert!(Active.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Shutdown));

        assert!(!Shutdown.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Loaded));
        assert!(Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (plugin, init_calls, _) = CountingPlugin::new("once");
        let handle = PluginHandle::new(Box::new(plugin));
        let config = PluginConfig::default();

        handle.initialize(&config).await.unwrap();
        handle.initialize(&config).await.unwrap();
        handle.initialize(&config).await.unwrap();

        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().await, PluginState::Active);
    }

    #[tokio::test]
    async fn test_failed_initialize_is_cached() {
        let (mut plugin, init_calls, _) = CountingPlugin::new("broken");
        plugin.fail_init = true;
        let handle = PluginHandle::new(Box::new(plugin));
        let config = PluginConfig::default();

        assert!(handle.initialize(&config).await.is_err());
        assert_eq!(handle.state().await, PluginState::Failed);

        // Cached failure, no second side effect.
        assert!(handle.initialize(&config).await.is_err());
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (plugin, _, shutdown_calls) = CountingPlugin::new("once");
        let handle = PluginHandle::new(Box::new(plugin));
        handle.initialize(&PluginConfig::default()).await.unwrap();

        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state().await, PluginState::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_before_initialize_is_noop() {
        let (plugin, _, shutdown_calls) = CountingPlugin::new("idle");
        let handle = PluginHandle::new(Box::new(plugin));

        handle.shutdown().await.unwrap();
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_check_flips_states() {
        struct FlakyPlugin {
            metadata: PluginMetadata,
            healthy: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Plugin for FlakyPlugin {
            fn metadata(&self) -> &PluginMetadata {
                &self.metadata
            }
            async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
                Ok(())
            }
            async fn shutdown(&mut self) -> PluginResult<()> {
                Ok(())
            }
            async fn health_check(&self) -> PluginResult<HealthReport> {
                if self.healthy.load(Ordering::SeqCst) == 1 {
                    Ok(HealthReport::healthy())
                } else {
                    Ok(HealthReport::degraded("dependency down"))
                }
            }
        }

        let healthy = Arc::new(AtomicU32::new(0));
        let handle = PluginHandle::new(Box::new(FlakyPlugin {
            metadata: PluginMetadata::new("flaky", "1.0.0", crate::metadata::PluginType::Middleware),
            healthy: healthy.clone(),
        }));
        handle.initialize(&PluginConfig::default()).await.unwrap();

        handle.health_check().await.unwrap();
        assert_eq!(handle.state().await, PluginState::Degraded);

        healthy.store(1, Ordering::SeqCst);
        handle.health_check().await.unwrap();
        assert_eq!(handle.state().await, PluginState::Active);
    }
}
