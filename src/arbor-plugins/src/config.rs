//! Plugin system configuration.
//!
//! Configuration is supplied by an external provider (YAML/env parsing lives
//! upstream); the core treats the per-plugin `config` map as opaque and
//! pre-validated, but still defends against malformed documents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Per-plugin configuration, supplied at load/reload time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Whether the plugin participates in the pipeline.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Priority override; falls back to the declared metadata priority.
    #[serde(default)]
    pub priority: Option<i32>,

    /// Opaque plugin-specific configuration.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Retry budget for plugin-internal operations.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout applied to this plugin's hook callbacks (seconds).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Deployment environment tag (e.g. "production", "development").
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: None,
            config: serde_json::Map::new(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            environment: default_environment(),
        }
    }
}

impl PluginConfig {
    /// Look up a value in the opaque config map.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }
}

/// One configured plugin entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginEntry {
    /// A required plugin's init failure aborts manager startup; an optional
    /// plugin's failure only degrades that plugin.
    #[serde(default)]
    pub required: bool,

    /// Plugin configuration.
    #[serde(default, flatten)]
    pub config: PluginConfig,
}

/// Hook execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSettings {
    /// Maximum simultaneous in-flight callback executions per hook type.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default per-callback timeout (milliseconds) when the owning plugin
    /// does not set one.
    #[serde(default = "default_hook_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Whether per-(plugin, hook type) circuit breaking is enabled.
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Consecutive failures before a breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker blocks dispatch before allowing a half-open
    /// trial (seconds).
    #[serde(default = "default_breaker_timeout_secs")]
    pub breaker_timeout_secs: u64,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_ms: default_hook_timeout_ms(),
            circuit_breaker_enabled: true,
            failure_threshold: default_failure_threshold(),
            breaker_timeout_secs: default_breaker_timeout_secs(),
        }
    }
}

/// Top-level manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Per-plugin entries keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, PluginEntry>,

    /// Hook execution settings.
    #[serde(default)]
    pub hooks: HookSettings,

    /// Whether the loader watches source fingerprints and swaps changed
    /// plugins.
    #[serde(default)]
    pub hot_reload: bool,
}

impl ManagerConfig {
    /// Parse a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Whether a plugin is enabled. Unconfigured plugins default to enabled.
    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.plugins
            .get(name)
            .map(|entry| entry.config.enabled)
            .unwrap_or(true)
    }

    /// Whether a plugin is required.
    pub fn is_plugin_required(&self, name: &str) -> bool {
        self.plugins
            .get(name)
            .map(|entry| entry.required)
            .unwrap_or(false)
    }

    /// Configuration slice for a plugin; unconfigured plugins get defaults.
    pub fn plugin_config(&self, name: &str) -> PluginConfig {
        self.plugins
            .get(name)
            .map(|entry| entry.config.clone())
            .unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_hook_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout_secs() -> u64 {
    60
}
