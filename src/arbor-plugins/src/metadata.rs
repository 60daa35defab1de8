//! Plugin metadata: the immutable identity a plugin declares at authoring time.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{PluginError, Result};

/// Capability a plugin declares. The loader structurally verifies the
/// instantiated plugin actually satisfies the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    /// Pure, non-rejecting message transform (filtering, redaction).
    MessageProcessor,
    /// The generation step: exactly one is invoked per request.
    BackendProvider,
    /// Context enrichment (retrieved documents, conversation history).
    FeatureExtension,
    /// Request/response interception (audit, auth, rate limiting).
    Middleware,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageProcessor => write!(f, "message_processor"),
            Self::BackendProvider => write!(f, "backend_provider"),
            Self::FeatureExtension => write!(f, "feature_extension"),
            Self::Middleware => write!(f, "middleware"),
        }
    }
}

/// Immutable plugin metadata, fixed at plugin authoring time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin name.
    pub name: String,

    /// Version string.
    pub version: String,

    /// Author.
    #[serde(default)]
    pub author: String,

    /// Description.
    #[serde(default)]
    pub description: String,

    /// Declared capability.
    pub plugin_type: PluginType,

    /// Names of plugins this plugin depends on. Dependencies are loaded
    /// first and shut down last.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Declared priority; higher loads earlier among independent plugins.
    #[serde(default)]
    pub priority: i32,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginMetadata {
    /// Create metadata with the required fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>, plugin_type: PluginType) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: String::new(),
            description: String::new(),
            plugin_type,
            dependencies: BTreeSet::new(),
            priority: 0,
            tags: Vec::new(),
        }
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a dependency on another plugin.
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Set the declared priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Validate structural requirements.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PluginError::ConfigError(
                "plugin name must not be empty".to_string(),
            ));
        }
        if self.version.is_empty() {
            return Err(PluginError::ConfigError(format!(
                "plugin '{}' has an empty version",
                self.name
            )));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PluginError::DependencyCycle {
                cycle: vec![self.name.clone(), self.name.clone()],
            });
        }
        Ok(())
    }
}
