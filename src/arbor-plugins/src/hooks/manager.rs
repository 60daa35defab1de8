//! Hook manager: priority-ordered dispatch with fault isolation.
//!
//! Dispatch is issued sequentially, so start order is always
//! priority-then-registration-order and reproducible across runs; only
//! completion timing varies when callbacks suspend. A counting limiter per
//! hook type bounds simultaneous in-flight callbacks across concurrent
//! dispatches, and a per-(plugin, hook type) circuit breaker keeps one
//! misbehaving plugin from blocking its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::breaker::{BreakerDecision, BreakerState, CircuitBreaker};
use crate::config::HookSettings;
use crate::hooks::types::{HookContext, HookRegistration, HookType};
use crate::{Failure, PluginResult};

/// Per-(plugin, hook type) execution counters for the observability sink.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HookStats {
    /// Callback invocations (skips not included).
    pub invocations: u64,
    /// Successful invocations.
    pub successes: u64,
    /// Failed invocations (timeouts and panics included).
    pub failures: u64,
    /// Invocations that exceeded their timeout.
    pub timeouts: u64,
    /// Dispatches skipped by an open breaker.
    pub breaker_skips: u64,
    /// Cumulative callback latency in milliseconds.
    pub total_duration_ms: u64,
    /// Most recent failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Maintains priority-ordered callback lists per hook type and executes them
/// with timeout, concurrency bound, and per-plugin circuit breaking.
pub struct HookManager {
    settings: HookSettings,
    hooks: RwLock<HashMap<HookType, Vec<HookRegistration>>>,
    breakers: RwLock<HashMap<(String, HookType), CircuitBreaker>>,
    limiters: Mutex<HashMap<HookType, Arc<Semaphore>>>,
    stats: RwLock<HashMap<(String, HookType), HookStats>>,
}

impl HookManager {
    /// Create a hook manager with the given execution settings.
    pub fn new(settings: HookSettings) -> Self {
        Self {
            settings,
            hooks: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Execution settings.
    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    /// Register a callback. The list stays sorted by priority; ties preserve
    /// registration order (stable sort).
    pub async fn register_hook(&self, registration: HookRegistration) {
        let hook_type = registration.hook_type;
        let plugin = registration.plugin.clone();

        {
            let mut hooks = self.hooks.write().await;
            let list = hooks.entry(hook_type).or_default();
            list.push(registration);
            list.sort_by_key(|r| r.priority.rank());
        }

        if self.settings.circuit_breaker_enabled {
            let mut breakers = self.breakers.write().await;
            breakers
                .entry((plugin.clone(), hook_type))
                .or_insert_with(|| self.new_breaker());
        }

        tracing::debug!("Registered {} hook for plugin {}", hook_type, plugin);
    }

    /// Remove a plugin's callbacks from one hook type only.
    pub async fn unregister_hook(&self, hook_type: HookType, plugin: &str) {
        {
            let mut hooks = self.hooks.write().await;
            if let Some(list) = hooks.get_mut(&hook_type) {
                list.retain(|r| r.plugin != plugin);
            }
        }
        self.breakers
            .write()
            .await
            .remove(&(plugin.to_string(), hook_type));

        tracing::debug!("Unregistered {} hooks for plugin {}", hook_type, plugin);
    }

    /// Remove a plugin's callbacks from every hook type.
    pub async fn unregister_plugin(&self, plugin: &str) {
        {
            let mut hooks = self.hooks.write().await;
            for list in hooks.values_mut() {
                list.retain(|r| r.plugin != plugin);
            }
        }
        self.breakers
            .write()
            .await
            .retain(|(owner, _), _| owner != plugin);

        tracing::debug!("Unregistered all hooks for plugin {}", plugin);
    }

    /// Atomically replace a plugin's registrations.
    ///
    /// The removal of the old callbacks and the insertion of the new ones
    /// happen under one write-lock acquisition, so a concurrent dispatch
    /// snapshots either entirely the old set or entirely the new set.
    pub async fn swap_plugin_hooks(&self, plugin: &str, registrations: Vec<HookRegistration>) {
        {
            let mut hooks = self.hooks.write().await;
            for list in hooks.values_mut() {
                list.retain(|r| r.plugin != plugin);
            }
            for registration in registrations {
                let list = hooks.entry(registration.hook_type).or_default();
                list.push(registration);
                list.sort_by_key(|r| r.priority.rank());
            }
        }

        // Fresh instance, fresh failure history.
        self.breakers
            .write()
            .await
            .retain(|(owner, _), _| owner != plugin);

        tracing::info!("Swapped hook registrations for plugin {}", plugin);
    }

    /// Toggle a plugin's callbacks for one hook type.
    pub async fn set_hook_enabled(&self, hook_type: HookType, plugin: &str, enabled: bool) {
        let mut hooks = self.hooks.write().await;
        if let Some(list) = hooks.get_mut(&hook_type) {
            for registration in list.iter_mut().filter(|r| r.plugin == plugin) {
                registration.enabled = enabled;
            }
        }
    }

    /// Number of registrations for a hook type.
    pub async fn hook_count(&self, hook_type: HookType) -> usize {
        self.hooks
            .read()
            .await
            .get(&hook_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total registrations across all hook types.
    pub async fn total_hook_count(&self) -> usize {
        self.hooks.read().await.values().map(Vec::len).sum()
    }

    /// Execute all enabled callbacks for a hook type in priority order.
    ///
    /// Returns one result per considered callback, in execution order. A
    /// callback error never propagates: timeouts, panics and failures all
    /// become `Fail` entries. With `fail_fast`, iteration stops after the
    /// first failure and the results collected so far are returned. Pipeline
    /// policy (whether a failure aborts the operation) is the caller's call.
    pub async fn execute_hooks(
        &self,
        hook_type: HookType,
        ctx: &mut HookContext,
        fail_fast: bool,
    ) -> Vec<PluginResult<serde_json::Value>> {
        let registrations: Vec<HookRegistration> = {
            let hooks = self.hooks.read().await;
            hooks
                .get(&hook_type)
                .map(|list| list.iter().filter(|r| r.enabled).cloned().collect())
                .unwrap_or_default()
        };

        let limiter = self.limiter(hook_type).await;
        let mut results = Vec::with_capacity(registrations.len());

        for registration in registrations {
            let plugin = registration.plugin.clone();

            if self.settings.circuit_breaker_enabled && !self.breaker_allows(&plugin, hook_type).await
            {
                tracing::debug!(
                    "Skipping {} hook for plugin {}: circuit breaker open",
                    hook_type,
                    plugin
                );
                self.record_skip(&plugin, hook_type).await;
                results.push(Err(Failure::circuit_open(&plugin)));
                if fail_fast {
                    break;
                }
                continue;
            }

            let _permit = limiter.clone().acquire_owned().await.ok();

            let started = Instant::now();
            let outcome = self.invoke(&registration, ctx.clone()).await;
            let elapsed = started.elapsed();

            match &outcome {
                Ok(data) => {
                    ctx.data = data.clone();
                    self.record_success(&plugin, hook_type, elapsed).await;
                }
                Err(failure) => {
                    tracing::warn!(
                        "{} hook failed for plugin {}: {}",
                        hook_type,
                        plugin,
                        failure
                    );
                    self.record_failure(&plugin, hook_type, elapsed, failure).await;
                }
            }

            let failed = outcome.is_err();
            results.push(outcome);
            if fail_fast && failed {
                break;
            }
        }

        results
    }

    /// Per-(plugin, hook type) counters, optionally filtered to one plugin.
    pub async fn get_metrics(&self, plugin: Option<&str>) -> serde_json::Value {
        let stats = self.stats.read().await;
        let breakers = self.breakers.read().await;

        let mut out = serde_json::Map::new();
        for ((owner, hook_type), entry) in stats.iter() {
            if plugin.is_some_and(|p| p != owner) {
                continue;
            }

            let per_plugin = out
                .entry(owner.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));

            let mut record = serde_json::Map::new();
            record.insert(
                "stats".to_string(),
                serde_json::to_value(entry).unwrap_or_default(),
            );
            if let Some(breaker) = breakers.get(&(owner.clone(), *hook_type)) {
                record.insert(
                    "breaker".to_string(),
                    serde_json::json!({
                        "state": breaker.state(),
                        "failure_count": breaker.failure_count(),
                    }),
                );
            }

            if let serde_json::Value::Object(map) = per_plugin {
                map.insert(hook_type.to_string(), serde_json::Value::Object(record));
            }
        }

        serde_json::Value::Object(out)
    }

    /// Registration summaries per hook type for the observability sink.
    pub async fn get_hook_info(&self) -> serde_json::Value {
        let hooks = self.hooks.read().await;
        let mut out = serde_json::Map::new();
        for (hook_type, list) in hooks.iter() {
            let entries: Vec<_> = list.iter().map(HookRegistration::describe).collect();
            out.insert(hook_type.to_string(), serde_json::Value::Array(entries));
        }
        serde_json::Value::Object(out)
    }

    /// Breaker state for a (plugin, hook type) pair, if one exists.
    pub async fn breaker_state(&self, plugin: &str, hook_type: HookType) -> Option<BreakerState> {
        self.breakers
            .read()
            .await
            .get(&(plugin.to_string(), hook_type))
            .map(CircuitBreaker::state)
    }

    fn new_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.settings.failure_threshold,
            Duration::from_secs(self.settings.breaker_timeout_secs),
        )
    }

    async fn breaker_allows(&self, plugin: &str, hook_type: HookType) -> bool {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry((plugin.to_string(), hook_type))
            .or_insert_with(|| self.new_breaker());
        breaker.try_acquire() == BreakerDecision::Allow
    }

    /// Run one callback under its timeout, converting panics and timeouts
    /// into `Fail` results. Timeout cancels only this callback.
    async fn invoke(
        &self,
        registration: &HookRegistration,
        ctx: HookContext,
    ) -> PluginResult<serde_json::Value> {
        let timeout = registration
            .timeout
            .unwrap_or(Duration::from_millis(self.settings.default_timeout_ms));
        let callback = registration.callback.clone();
        let plugin = registration.plugin.clone();

        let task = tokio::spawn(async move { callback.call(ctx).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(Failure::panicked(&plugin)),
            Ok(Err(_)) => Err(Failure::new(
                format!("hook cancelled in plugin '{plugin}'"),
                "cancelled",
            )),
            Err(_) => {
                abort.abort();
                Err(Failure::timeout(&plugin, timeout.as_millis()))
            }
        }
    }

    async fn limiter(&self, hook_type: HookType) -> Arc<Semaphore> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(hook_type)
            .or_insert_with(|| Arc::new(Semaphore::new(self.settings.max_concurrent.max(1))))
            .clone()
    }

    async fn record_success(&self, plugin: &str, hook_type: HookType, elapsed: Duration) {
        {
            let mut stats = self.stats.write().await;
            let entry = stats
                .entry((plugin.to_string(), hook_type))
                .or_default();
            entry.invocations += 1;
            entry.successes += 1;
            entry.total_duration_ms += elapsed.as_millis() as u64;
        }
        if self.settings.circuit_breaker_enabled {
            let mut breakers = self.breakers.write().await;
            if let Some(breaker) = breakers.get_mut(&(plugin.to_string(), hook_type)) {
                breaker.record_success();
            }
        }
    }

    async fn record_failure(
        &self,
        plugin: &str,
        hook_type: HookType,
        elapsed: Duration,
        failure: &Failure,
    ) {
        {
            let mut stats = self.stats.write().await;
            let entry = stats
                .entry((plugin.to_string(), hook_type))
                .or_default();
            entry.invocations += 1;
            entry.failures += 1;
            if failure.code == "timeout" {
                entry.timeouts += 1;
            }
            entry.total_duration_ms += elapsed.as_millis() as u64;
            entry.last_error = Some(failure.message.clone());
        }
        if self.settings.circuit_breaker_enabled {
            let mut breakers = self.breakers.write().await;
            if let Some(breaker) = breakers.get_mut(&(plugin.to_string(), hook_type)) {
                breaker.record_failure();
                if breaker.state() == BreakerState::Open {
                    tracing::warn!(
                        "Circuit breaker opened for plugin {} on {} hooks",
                        plugin,
                        hook_type
                    );
                }
            }
        }
    }

    async fn record_skip(&self, plugin: &str, hook_type: HookType) {
        let mut stats = self.stats.write().await;
        let entry = stats
            .entry((plugin.to_string(), hook_type))
            .or_default();
        entry.breaker_skips += 1;
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new(HookSettings::default())
    }
}
