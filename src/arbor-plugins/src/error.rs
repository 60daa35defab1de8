//! Plugin system error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plugin system errors.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Plugin not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Plugin already registered.
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// Plugin load error (missing implementation or capability mismatch).
    #[error("Failed to load plugin '{plugin}': {message}")]
    LoadError { plugin: String, message: String },

    /// Plugin initialization error.
    #[error("Failed to initialize plugin '{plugin}': {message}")]
    InitError { plugin: String, message: String },

    /// Dependency cycle. The cycle path is ordered and closes on itself,
    /// e.g. `["a", "b", "a"]`.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// A declared dependency is not registered.
    #[error("Plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    /// Malformed plugin configuration. Config is validated upstream, but the
    /// core still defends against bad input.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic runtime failure inside a plugin.
    #[error("Plugin execution error in '{plugin}': {message}")]
    ExecutionError { plugin: String, message: String },

    /// Timeout or exception inside a hook callback.
    #[error("Hook error in '{plugin}': {message}")]
    HookError { plugin: String, message: String },

    /// Plugin operation timed out.
    #[error("Plugin operation timed out: {0}")]
    Timeout(String),

    /// Invalid plugin state transition.
    #[error("Invalid plugin state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// One or more plugins failed during shutdown. Shutdown is best-effort;
    /// failures are collected and reported together.
    #[error("Shutdown failures: {}", failures.iter().map(|(p, m)| format!("{p}: {m}")).collect::<Vec<_>>().join("; "))]
    ShutdownErrors { failures: Vec<(String, String)> },
}

impl PluginError {
    /// Create a load error.
    pub fn load_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create an init error.
    pub fn init_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InitError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a hook error.
    pub fn hook_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HookError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for PluginError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// Result type alias for plugin system operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Failure payload for plugin-facing boundaries.
///
/// Every plugin-facing call returns an explicit `Ok`/`Fail` outcome instead of
/// raising: hook callbacks, capability calls and the pipeline all produce a
/// [`PluginResult`]. Mapping a `Failure` to a transport-level response code is
/// the responsibility of the external API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    /// Human-readable message.
    pub message: String,

    /// Stable machine-readable code (e.g. `timeout`, `circuit_open`).
    pub code: String,

    /// Optional transport status hint. A request-phase middleware failure
    /// carrying a status short-circuits the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl Failure {
    /// Create a failure with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            status: None,
            extra: None,
        }
    }

    /// Attach a transport status hint.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach structured detail.
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Failure produced when a breaker refuses to dispatch. Kept distinct
    /// from genuine execution errors.
    pub fn circuit_open(plugin: &str) -> Self {
        Self::new(
            format!("circuit breaker open for plugin '{plugin}'"),
            "circuit_open",
        )
    }

    /// Failure produced when a callback exceeds its timeout.
    pub fn timeout(plugin: &str, millis: u128) -> Self {
        Self::new(
            format!("hook timeout after {millis}ms in plugin '{plugin}'"),
            "timeout",
        )
    }

    /// Failure produced when a callback panics.
    pub fn panicked(plugin: &str) -> Self {
        Self::new(format!("hook panicked in plugin '{plugin}'"), "panic")
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<PluginError> for Failure {
    fn from(err: PluginError) -> Self {
        let code = match &err {
            PluginError::NotFound(_) => "not_found",
            PluginError::AlreadyRegistered(_) => "already_registered",
            PluginError::LoadError { .. } => "load_error",
            PluginError::InitError { .. } => "init_error",
            PluginError::DependencyCycle { .. } => "dependency_cycle",
            PluginError::MissingDependency { .. } => "missing_dependency",
            PluginError::ConfigError(_) => "config_error",
            PluginError::ExecutionError { .. } => "execution_error",
            PluginError::HookError { .. } => "hook_error",
            PluginError::Timeout(_) => "timeout",
            PluginError::InvalidState { .. } => "invalid_state",
            PluginError::ShutdownErrors { .. } => "shutdown_error",
        };
        Self::new(err.to_string(), code)
    }
}

/// Two-variant outcome used at every plugin-facing boundary.
pub type PluginResult<T> = std::result::Result<T, Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::NotFound("audit-log".to_string());
        assert_eq!(err.to_string(), "Plugin not found: audit-log");
    }

    #[test]
    fn test_cycle_display_names_path() {
        let err = PluginError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_failure_builders() {
        let fail = Failure::new("bad input", "config_error").with_status(422);
        assert_eq!(fail.status, Some(422));

        let open = Failure::circuit_open("rate-limit");
        assert_eq!(open.code, "circuit_open");
        assert!(open.message.contains("rate-limit"));
    }

    #[test]
    fn test_failure_from_plugin_error() {
        let fail: Failure = PluginError::Timeout("chat".to_string()).into();
        assert_eq!(fail.code, "timeout");
        assert!(fail.message.contains("chat"));
    }

    #[test]
    fn test_shutdown_errors_collects_all() {
        let err = PluginError::ShutdownErrors {
            failures: vec![
                ("auth".to_string(), "socket closed".to_string()),
                ("memory".to_string(), "flush failed".to_string()),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("auth"));
        assert!(text.contains("memory"));
    }
}
