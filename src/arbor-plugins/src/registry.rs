//! Plugin registry: metadata, dependency graph, and load-order resolution.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::metadata::PluginMetadata;
use crate::{PluginError, Result};

/// Registry for plugin metadata and the dependency graph.
///
/// Edges point from a plugin to its dependencies; the graph must stay
/// acyclic. Violations are caught at registration or resolution time, never
/// at runtime.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginMetadata>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Register plugin metadata. Rejects duplicate names.
    pub async fn register(&self, metadata: PluginMetadata) -> Result<()> {
        metadata.validate()?;

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&metadata.name) {
            return Err(PluginError::AlreadyRegistered(metadata.name));
        }

        tracing::info!("Registered plugin: {} v{}", metadata.name, metadata.version);
        plugins.insert(metadata.name.clone(), metadata);
        Ok(())
    }

    /// Remove a plugin from the registry.
    pub async fn remove(&self, name: &str) -> Result<PluginMetadata> {
        self.plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Get metadata for a plugin.
    pub async fn get(&self, name: &str) -> Option<PluginMetadata> {
        self.plugins.read().await.get(name).cloned()
    }

    /// Whether a plugin is registered.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    /// Number of registered plugins.
    pub async fn count(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// All registered metadata, sorted by name.
    pub async fn list(&self) -> Vec<PluginMetadata> {
        let plugins = self.plugins.read().await;
        let mut all: Vec<_> = plugins.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve the load order (Kahn's algorithm).
    ///
    /// Every dependency precedes its dependents. Ties between independent
    /// plugins break deterministically: higher declared priority first, then
    /// lexical name. Fails with the exact cycle path when the graph is
    /// cyclic, or with the offending pair when a dependency is unknown.
    pub async fn topological_order(&self) -> Result<Vec<String>> {
        let plugins = self.plugins.read().await;

        for meta in plugins.values() {
            for dep in &meta.dependencies {
                if !plugins.contains_key(dep) {
                    return Err(PluginError::MissingDependency {
                        plugin: meta.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Unresolved dependency count per plugin.
        let mut pending: HashMap<&str, usize> = plugins
            .values()
            .map(|m| (m.name.as_str(), m.dependencies.len()))
            .collect();

        // Reverse edges: dependency -> dependents.
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for meta in plugins.values() {
            for dep in &meta.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(meta.name.as_str());
            }
        }

        let mut ready: Vec<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(plugins.len());
        while !ready.is_empty() {
            // Higher priority first, then lexical name.
            ready.sort_by(|a, b| {
                let pa = plugins[*a].priority;
                let pb = plugins[*b].priority;
                pb.cmp(&pa).then_with(|| a.cmp(b))
            });

            let next = ready.remove(0);
            order.push(next.to_string());

            if let Some(deps) = dependents.get(next) {
                for dependent in deps {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependent);
                        }
                    }
                }
            }
        }

        if order.len() < plugins.len() {
            let remaining: HashSet<&str> = plugins
                .keys()
                .map(String::as_str)
                .filter(|name| !order.iter().any(|o| o == name))
                .collect();
            return Err(PluginError::DependencyCycle {
                cycle: find_cycle(&plugins, &remaining),
            });
        }

        Ok(order)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk dependency edges among unresolved nodes until one repeats; the
/// returned path is ordered and closes on itself (e.g. `["a", "b", "a"]`).
fn find_cycle(plugins: &HashMap<String, PluginMetadata>, remaining: &HashSet<&str>) -> Vec<String> {
    let start = remaining.iter().min().copied().unwrap_or_default();

    let mut path: Vec<&str> = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&pos) = seen.get(current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        seen.insert(current, path.len());
        path.push(current);

        // Every remaining node has at least one unresolved dependency.
        current = plugins[current]
            .dependencies
            .iter()
            .map(String::as_str)
            .find(|dep| remaining.contains(dep))
            .unwrap_or(start);
    }
}
