//! Plugin loader: compiled-in sources, capability verification, hot-reload
//! bookkeeping.
//!
//! Plugins are registered through explicit factory callbacks rather than
//! filesystem introspection; construction must have no side effects. Each
//! source carries a content fingerprint so the host can publish a new
//! revision and have the manager swap the running instance atomically.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::metadata::PluginType;
use crate::plugin::Plugin;
use crate::{PluginError, Result};

/// Factory constructing a fresh plugin instance. Must be side-effect free.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A configured plugin source: where instances of one plugin come from.
#[derive(Clone)]
pub struct PluginSource {
    /// Plugin name; must match the metadata of constructed instances.
    pub name: String,

    /// Content fingerprint (revision hash, modification time, build id).
    /// A fingerprint change marks the source as needing a reload.
    pub fingerprint: Option<String>,

    /// Instance factory.
    pub factory: PluginFactory,
}

impl PluginSource {
    /// Create a source from a factory closure.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fingerprint: None,
            factory: Arc::new(factory),
        }
    }

    /// Attach a content fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

impl std::fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSource")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Verify that an instance structurally satisfies its declared capability.
pub fn verify_capability(plugin: &dyn Plugin) -> Result<()> {
    let metadata = plugin.metadata();
    let satisfied = match metadata.plugin_type {
        PluginType::MessageProcessor => plugin.as_message_processor().is_some(),
        PluginType::BackendProvider => plugin.as_backend().is_some(),
        PluginType::FeatureExtension => plugin.as_feature_extension().is_some(),
        PluginType::Middleware => plugin.as_middleware().is_some(),
    };

    if !satisfied {
        return Err(PluginError::load_error(
            &metadata.name,
            format!(
                "declares capability '{}' but does not implement it",
                metadata.plugin_type
            ),
        ));
    }
    Ok(())
}

/// Discovers and instantiates plugins, and tracks hot-reload state.
pub struct PluginLoader {
    sources: RwLock<HashMap<String, PluginSource>>,
    loaded_fingerprints: RwLock<HashMap<String, Option<String>>>,
    swap_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            loaded_fingerprints: RwLock::new(HashMap::new()),
            swap_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Add a plugin source. Rejects duplicate names.
    pub async fn add_source(&self, source: PluginSource) -> Result<()> {
        let mut sources = self.sources.write().await;
        if sources.contains_key(&source.name) {
            return Err(PluginError::AlreadyRegistered(source.name));
        }
        tracing::debug!("Added plugin source: {}", source.name);
        sources.insert(source.name.clone(), source);
        Ok(())
    }

    /// Replace a plugin source (new revision, new fingerprint).
    pub async fn update_source(&self, source: PluginSource) {
        tracing::debug!(
            "Updated plugin source: {} (fingerprint {:?})",
            source.name,
            source.fingerprint
        );
        self.sources
            .write()
            .await
            .insert(source.name.clone(), source);
    }

    /// Configured source names, sorted.
    pub async fn source_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct an instance and verify it satisfies its declared capability.
    ///
    /// The instance's metadata name must match the source name; a mismatch or
    /// unsatisfied capability is a [`PluginError::LoadError`].
    pub async fn instantiate(&self, name: &str) -> Result<Box<dyn Plugin>> {
        let source = self
            .sources
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let plugin = (source.factory)();

        if plugin.metadata().name != name {
            return Err(PluginError::load_error(
                name,
                format!(
                    "source '{}' constructed a plugin named '{}'",
                    name,
                    plugin.metadata().name
                ),
            ));
        }
        verify_capability(plugin.as_ref())?;

        self.loaded_fingerprints
            .write()
            .await
            .insert(name.to_string(), source.fingerprint.clone());

        tracing::debug!("Instantiated plugin: {}", name);
        Ok(plugin)
    }

    /// Whether the source fingerprint differs from the loaded one.
    pub async fn needs_reload(&self, name: &str) -> bool {
        let sources = self.sources.read().await;
        let loaded = self.loaded_fingerprints.read().await;
        match (sources.get(name), loaded.get(name)) {
            (Some(source), Some(loaded_fp)) => source.fingerprint != *loaded_fp,
            // Never loaded: nothing to swap.
            _ => false,
        }
    }

    /// Names of all sources whose fingerprint changed since load.
    pub async fn changed_sources(&self) -> Vec<String> {
        let mut changed = Vec::new();
        for name in self.source_names().await {
            if self.needs_reload(&name).await {
                changed.push(name);
            }
        }
        changed
    }

    /// Per-plugin-name lock serializing hot-reload swaps.
    pub async fn swap_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.swap_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}
