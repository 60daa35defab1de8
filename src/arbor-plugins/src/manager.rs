//! Plugin manager: lifecycle orchestration and the request pipeline.
//!
//! The manager composes the registry (identity and ordering), the loader
//! (construction and hot-reload bookkeeping), the hook manager (dispatch),
//! and one [`PluginHandle`] per loaded plugin. It is the only component
//! that drives plugin state transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use arbor_protocol::{ChatContext, ChatReply};

use crate::config::{ManagerConfig, PluginConfig};
use crate::hooks::{
    HookCallback, HookContext, HookManager, HookPriority, HookRegistration, HookType, callback_fn,
};
use crate::loader::{PluginLoader, PluginSource};
use crate::metadata::{PluginMetadata, PluginType};
use crate::plugin::{PluginHandle, PluginState};
use crate::registry::PluginRegistry;
use crate::{Failure, PluginError, PluginResult, Result};

/// Outcome of one pipeline run: the final context and the backend reply.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Request context after all transforms; for a non-streaming reply the
    /// assistant message has been appended.
    pub context: ChatContext,

    /// The backend reply.
    pub reply: ChatReply,
}

/// Orchestrates plugin lifecycle and runs the request pipeline.
pub struct PluginManager {
    config: ManagerConfig,
    registry: PluginRegistry,
    loader: Arc<PluginLoader>,
    hooks: Arc<HookManager>,
    handles: RwLock<HashMap<String, PluginHandle>>,
    load_order: RwLock<Vec<String>>,
    started: RwLock<bool>,
}

impl PluginManager {
    /// Create a manager with the given configuration.
    pub fn new(config: ManagerConfig) -> Self {
        let hooks = Arc::new(HookManager::new(config.hooks.clone()));
        Self {
            registry: PluginRegistry::new(),
            loader: Arc::new(PluginLoader::new()),
            hooks,
            handles: RwLock::new(HashMap::new()),
            load_order: RwLock::new(Vec::new()),
            started: RwLock::new(false),
            config,
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The plugin registry.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// The plugin loader. Sources are added here before `initialize`.
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// The hook manager.
    pub fn hook_manager(&self) -> Arc<HookManager> {
        self.hooks.clone()
    }

    /// Add a plugin source. Must happen before `initialize` for the plugin
    /// to participate in the initial load.
    pub async fn add_plugin(&self, source: PluginSource) -> Result<()> {
        self.loader.add_source(source).await
    }

    /// Load, order, and initialize every enabled plugin.
    ///
    /// Plugins are initialized in dependency order (dependencies first;
    /// higher priority breaks ties among independent plugins). A required
    /// plugin's load or init failure aborts startup; an optional plugin's
    /// failure marks only that plugin failed. Already-initialized plugins
    /// are left running on abort; the caller decides whether to `shutdown`.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut started = self.started.write().await;
            if *started {
                return Err(PluginError::InvalidState {
                    expected: "uninitialized".to_string(),
                    actual: "initialized".to_string(),
                });
            }
            *started = true;
        }

        for name in self.loader.source_names().await {
            if !self.config.is_plugin_enabled(&name) {
                tracing::info!("Plugin {} disabled by configuration, skipping", name);
                continue;
            }

            let plugin = match self.loader.instantiate(&name).await {
                Ok(plugin) => plugin,
                Err(e) => {
                    if self.config.is_plugin_required(&name) {
                        tracing::error!("Required plugin {} failed to load: {}", name, e);
                        return Err(e);
                    }
                    tracing::warn!("Optional plugin {} failed to load: {}", name, e);
                    continue;
                }
            };

            self.registry.register(plugin.metadata().clone()).await?;
            let config = self.config.plugin_config(&name);
            let priority = config.priority.unwrap_or(plugin.metadata().priority);
            let handle = PluginHandle::with_priority(plugin, priority);
            self.handles.write().await.insert(name, handle);
        }

        let order = self.registry.topological_order().await?;
        *self.load_order.write().await = order.clone();

        for name in &order {
            let handle = match self.handles.read().await.get(name).cloned() {
                Some(handle) => handle,
                None => continue,
            };
            let config = self.config.plugin_config(name);

            match handle.initialize(&config).await {
                Ok(()) => {
                    let registrations = self.collect_registrations(&handle, &config).await;
                    self.hooks.swap_plugin_hooks(name, registrations).await;
                }
                Err(e) => {
                    if self.config.is_plugin_required(name) {
                        tracing::error!("Required plugin {} failed to initialize: {}", name, e);
                        return Err(PluginError::init_error(name, e.message));
                    }
                    tracing::warn!("Optional plugin {} failed to initialize: {}", name, e);
                }
            }
        }

        tracing::info!("Plugin manager initialized, load order: {:?}", order);
        Ok(())
    }

    /// Shut down every plugin in reverse load order.
    ///
    /// Best-effort: a plugin's shutdown failure never prevents its siblings
    /// from shutting down; failures are collected and reported together.
    pub async fn shutdown(&self) -> Result<()> {
        let order: Vec<String> = self.load_order.read().await.clone();
        let mut failures = Vec::new();

        for name in order.iter().rev() {
            let handle = match self.handles.read().await.get(name).cloned() {
                Some(handle) => handle,
                None => continue,
            };
            self.hooks.unregister_plugin(name).await;
            if let Err(e) = handle.shutdown().await {
                failures.push((name.clone(), e.message));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PluginError::ShutdownErrors { failures })
        }
    }

    /// Hot-swap one plugin for a fresh instance from its current source.
    ///
    /// Swaps per plugin are serialized; the hook registrations flip from the
    /// old set to the new set in a single write-lock acquisition, so a
    /// concurrent dispatch sees one or the other, never a mixture. The old
    /// instance keeps serving until the replacement is initialized and
    /// installed; a replacement that fails to construct or initialize leaves
    /// the old instance running.
    pub async fn reload_plugin(&self, name: &str) -> Result<()> {
        let lock = self.loader.swap_lock(name).await;
        let _swap = lock.lock().await;

        let old = self
            .handles
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        // Bring the replacement up while the old instance keeps serving.
        let plugin = self.loader.instantiate(name).await?;
        let config = self.config.plugin_config(name);
        let priority = config.priority.unwrap_or(plugin.metadata().priority);
        let replacement = PluginHandle::with_priority(plugin, priority);

        if let Err(e) = replacement.initialize(&config).await {
            tracing::warn!(
                "Replacement for {} failed to initialize, keeping the old instance: {}",
                name,
                e
            );
            return Err(PluginError::init_error(name, e.message));
        }

        let registrations = self.collect_registrations(&replacement, &config).await;
        self.hooks.swap_plugin_hooks(name, registrations).await;
        self.handles
            .write()
            .await
            .insert(name.to_string(), replacement);

        // Only now retire the old instance.
        if let Err(e) = old.shutdown().await {
            tracing::warn!("Old instance of {} failed during shutdown: {}", name, e);
        }

        tracing::info!("Reloaded plugin {}", name);
        Ok(())
    }

    /// Reload every plugin whose source fingerprint changed since load.
    /// No-op unless hot reload is enabled in the configuration.
    pub async fn reload_changed(&self) -> Result<Vec<String>> {
        if !self.config.hot_reload {
            return Ok(Vec::new());
        }

        let mut reloaded = Vec::new();
        for name in self.loader.changed_sources().await {
            self.reload_plugin(&name).await?;
            reloaded.push(name);
        }
        Ok(reloaded)
    }

    /// Run health checks on every serving plugin in load order, applying the
    /// ACTIVE ⇄ DEGRADED transitions, and dispatch the summary to health
    /// report hooks.
    pub async fn run_health_checks(&self) -> serde_json::Value {
        let order: Vec<String> = self.load_order.read().await.clone();
        let mut summary = serde_json::Map::new();

        for name in &order {
            let handle = match self.handles.read().await.get(name).cloned() {
                Some(handle) => handle,
                None => continue,
            };
            if !matches!(
                handle.state().await,
                PluginState::Active | PluginState::Degraded
            ) {
                continue;
            }

            let entry = match handle.health_check().await {
                Ok(report) => serde_json::json!({
                    "status": report.status,
                    "state": handle.state().await,
                    "details": report.details,
                }),
                Err(failure) => serde_json::json!({
                    "state": handle.state().await,
                    "error": failure.message,
                }),
            };
            summary.insert(name.clone(), entry);
        }

        let report = serde_json::Value::Object(summary);
        let mut hook_ctx = HookContext::new(HookType::HealthReport, report.clone());
        let _ = self
            .hooks
            .execute_hooks(HookType::HealthReport, &mut hook_ctx, false)
            .await;
        report
    }

    /// Run one request through the full pipeline.
    ///
    /// Stages: request-phase middleware (a failure carrying a status
    /// short-circuits), message processors (never reject), feature
    /// extensions (fail-open), exactly one backend provider (its failure is
    /// fatal to this request only), then response-phase middleware
    /// (fail-open).
    pub async fn process_request(&self, ctx: ChatContext) -> PluginResult<PipelineOutput> {
        // Request-phase middleware, threaded through the context document.
        let payload = serde_json::to_value(&ctx).map_err(|e| {
            Failure::new(
                format!("failed to encode request context: {e}"),
                "serialization_error",
            )
        })?;
        let mut hook_ctx = HookContext::new(HookType::RequestStart, payload);
        let results = self
            .hooks
            .execute_hooks(HookType::RequestStart, &mut hook_ctx, false)
            .await;
        for result in &results {
            if let Err(failure) = result {
                if failure.status.is_some() {
                    self.dispatch_error(failure).await;
                    return Err(failure.clone());
                }
            }
        }
        let mut ctx: ChatContext = serde_json::from_value(hook_ctx.data).map_err(|e| {
            Failure::new(
                format!("middleware produced an invalid request context: {e}"),
                "serialization_error",
            )
        })?;

        // Message processors transform the message being sent, in load
        // order. Processors never reject: on failure the original survives.
        for handle in self.active_in_load_order(PluginType::MessageProcessor).await {
            let Some(message) = ctx.messages.pop() else {
                break;
            };
            let processed = {
                let plugin = handle.read().await;
                match plugin.as_message_processor() {
                    Some(processor) => processor.process_message(message.clone(), &ctx).await,
                    None => Ok(message.clone()),
                }
            };
            match processed {
                Ok(transformed) => ctx.messages.push(transformed),
                Err(failure) => {
                    tracing::warn!("Message processor {} failed: {}", handle.name(), failure);
                    ctx.messages.push(message);
                }
            }
        }

        if let Some(last) = ctx.messages.last() {
            let mut hook_ctx = HookContext::new(
                HookType::MessageReceived,
                serde_json::json!({ "message": last }),
            );
            let _ = self
                .hooks
                .execute_hooks(HookType::MessageReceived, &mut hook_ctx, false)
                .await;
        }

        // Feature extensions enrich the context; a failed extension is
        // skipped and the context it saw is kept.
        for handle in self.active_in_load_order(PluginType::FeatureExtension).await {
            let outcome = {
                let plugin = handle.read().await;
                match plugin.as_feature_extension() {
                    Some(extension) => extension.extend(ctx.clone()).await,
                    None => Ok(ctx.clone()),
                }
            };
            match outcome {
                Ok(enriched) => ctx = enriched,
                Err(failure) => {
                    tracing::warn!("Feature extension {} failed: {}", handle.name(), failure);
                }
            }
        }

        // Exactly one backend produces the reply.
        let backend = self.select_backend(&ctx).await.ok_or_else(|| {
            Failure::new("no active backend provider", "not_found").with_status(503)
        })?;

        {
            let mut hook_ctx = HookContext::new(
                HookType::MessageSend,
                serde_json::json!({
                    "model": ctx.model,
                    "provider": backend.name(),
                    "message_count": ctx.messages.len(),
                }),
            );
            let _ = self
                .hooks
                .execute_hooks(HookType::MessageSend, &mut hook_ctx, false)
                .await;
        }

        let reply = {
            let plugin = backend.read().await;
            let Some(provider) = plugin.as_backend() else {
                return Err(Failure::new(
                    format!("plugin '{}' lost its backend capability", backend.name()),
                    "load_error",
                ));
            };
            match provider.chat(&ctx).await {
                Ok(reply) => reply,
                Err(failure) => {
                    tracing::warn!("Backend {} failed: {}", backend.name(), failure);
                    self.dispatch_error(&failure).await;
                    return Err(failure);
                }
            }
        };

        if let ChatReply::Message(message) = &reply {
            ctx.push(message.clone());
        }

        // Response-phase middleware is always fail-open: the reply stands
        // regardless of what happens here.
        let response_payload = serde_json::json!({
            "context": serde_json::to_value(&ctx).unwrap_or(serde_json::Value::Null),
            "streamed": matches!(reply, ChatReply::Stream(_)),
        });
        let mut hook_ctx = HookContext::new(HookType::RequestComplete, response_payload);
        let _ = self
            .hooks
            .execute_hooks(HookType::RequestComplete, &mut hook_ctx, false)
            .await;

        Ok(PipelineOutput { context: ctx, reply })
    }

    /// Active backend providers, highest priority first.
    pub async fn backend_providers(&self) -> Vec<PluginHandle> {
        self.active_of_type(PluginType::BackendProvider).await
    }

    /// Active message processors, highest priority first.
    pub async fn message_processors(&self) -> Vec<PluginHandle> {
        self.active_of_type(PluginType::MessageProcessor).await
    }

    /// Active feature extensions, highest priority first.
    pub async fn feature_extensions(&self) -> Vec<PluginHandle> {
        self.active_of_type(PluginType::FeatureExtension).await
    }

    /// Active middleware plugins, highest priority first.
    pub async fn middleware_plugins(&self) -> Vec<PluginHandle> {
        self.active_of_type(PluginType::Middleware).await
    }

    /// Handle for a plugin, in any state.
    pub async fn get_plugin(&self, name: &str) -> Option<PluginHandle> {
        self.handles.read().await.get(name).cloned()
    }

    /// Current state of a plugin.
    pub async fn plugin_state(&self, name: &str) -> Option<PluginState> {
        match self.handles.read().await.get(name) {
            Some(handle) => Some(handle.state().await),
            None => None,
        }
    }

    /// Metadata of every registered plugin.
    pub async fn list_plugins(&self) -> Vec<PluginMetadata> {
        self.registry.list().await
    }

    /// Plugin states and hook execution counters for the observability sink,
    /// optionally filtered to one plugin.
    pub async fn get_metrics(&self, plugin: Option<&str>) -> serde_json::Value {
        let hooks = self.hooks.get_metrics(plugin).await;

        let handles = self.handles.read().await;
        let mut plugins = serde_json::Map::new();
        for (name, handle) in handles.iter() {
            if plugin.is_some_and(|p| p != name) {
                continue;
            }
            plugins.insert(
                name.clone(),
                serde_json::json!({
                    "state": handle.state().await,
                    "priority": handle.priority(),
                    "type": handle.metadata().plugin_type,
                }),
            );
        }

        serde_json::json!({ "plugins": plugins, "hooks": hooks })
    }

    /// Registration summaries per hook type.
    pub async fn get_hook_info(&self) -> serde_json::Value {
        self.hooks.get_hook_info().await
    }

    /// Pick the backend for a request: the provider named in the context
    /// metadata, or the highest-priority active provider. A named provider
    /// that is missing or not serving is not substituted.
    async fn select_backend(&self, ctx: &ChatContext) -> Option<PluginHandle> {
        if let Some(requested) = ctx.metadata.get("provider").and_then(|v| v.as_str()) {
            let handle = self.handles.read().await.get(requested).cloned()?;
            if handle.metadata().plugin_type == PluginType::BackendProvider
                && handle.is_active().await
            {
                return Some(handle);
            }
            return None;
        }
        self.backend_providers().await.into_iter().next()
    }

    async fn active_of_type(&self, plugin_type: PluginType) -> Vec<PluginHandle> {
        let mut out = Vec::new();
        {
            let handles = self.handles.read().await;
            for handle in handles.values() {
                if handle.metadata().plugin_type == plugin_type && handle.is_active().await {
                    out.push(handle.clone());
                }
            }
        }
        out.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        out
    }

    async fn active_in_load_order(&self, plugin_type: PluginType) -> Vec<PluginHandle> {
        let order: Vec<String> = self.load_order.read().await.clone();
        let handles = self.handles.read().await;
        let mut out = Vec::new();
        for name in &order {
            if let Some(handle) = handles.get(name) {
                if handle.metadata().plugin_type == plugin_type && handle.is_active().await {
                    out.push(handle.clone());
                }
            }
        }
        out
    }

    /// Collect a plugin's hook registrations: its declared ones, plus the
    /// synthesized middleware request/response hooks for middleware plugins.
    /// Registrations are forced to the owning plugin's name, and the
    /// plugin's configured timeout fills any unset per-registration timeout.
    async fn collect_registrations(
        &self,
        handle: &PluginHandle,
        config: &PluginConfig,
    ) -> Vec<HookRegistration> {
        let name = handle.name().to_string();
        let default_timeout = Duration::from_secs(config.timeout_secs);

        let mut registrations = {
            let plugin = handle.read().await;
            plugin.hook_registrations()
        };
        for registration in &mut registrations {
            registration.plugin = name.clone();
            if registration.timeout.is_none() {
                registration.timeout = Some(default_timeout);
            }
        }

        if handle.metadata().plugin_type == PluginType::Middleware {
            let priority = HookPriority::from_weight(handle.priority());
            registrations.push(
                HookRegistration::new(
                    HookType::RequestStart,
                    name.clone(),
                    priority,
                    middleware_callback(handle.clone(), MiddlewarePhase::Request),
                )
                .with_timeout(default_timeout),
            );
            registrations.push(
                HookRegistration::new(
                    HookType::RequestComplete,
                    name,
                    priority,
                    middleware_callback(handle.clone(), MiddlewarePhase::Response),
                )
                .with_timeout(default_timeout),
            );
        }

        registrations
    }

    async fn dispatch_error(&self, failure: &Failure) {
        let mut hook_ctx =
            HookContext::new(HookType::Error, serde_json::json!({ "failure": failure }));
        let _ = self
            .hooks
            .execute_hooks(HookType::Error, &mut hook_ctx, false)
            .await;
    }
}

#[derive(Clone, Copy)]
enum MiddlewarePhase {
    Request,
    Response,
}

/// Bridge a middleware capability into a hook callback. A retiring instance
/// (mid hot-swap) passes the payload through untouched.
fn middleware_callback(handle: PluginHandle, phase: MiddlewarePhase) -> Arc<dyn HookCallback> {
    callback_fn(move |ctx: HookContext| {
        let handle = handle.clone();
        async move {
            if !handle.is_active().await {
                return Ok(ctx.data);
            }
            let serde_json::Value::Object(payload) = ctx.data else {
                return Err(Failure::new(
                    "middleware payload must be a JSON object",
                    "execution_error",
                ));
            };
            let plugin = handle.read().await;
            let Some(middleware) = plugin.as_middleware() else {
                return Ok(serde_json::Value::Object(payload));
            };
            let out = match phase {
                MiddlewarePhase::Request => middleware.process_request(payload).await?,
                MiddlewarePhase::Response => middleware.process_response(payload).await?,
            };
            Ok(serde_json::Value::Object(out))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    use arbor_protocol::{Message, Role};

    use crate::capability::{
        BackendProvider, MessageProcessor, Middleware, MiddlewarePayload,
    };
    use crate::plugin::Plugin;

    struct EchoBackend {
        metadata: PluginMetadata,
    }

    impl EchoBackend {
        fn source(name: &'static str, priority: i32) -> PluginSource {
            PluginSource::new(name, move || {
                Box::new(EchoBackend {
                    metadata: PluginMetadata::new(name, "1.0.0", PluginType::BackendProvider)
                        .with_priority(priority),
                })
            })
        }
    }

    #[async_trait]
    impl Plugin for EchoBackend {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> PluginResult<()> {
            Ok(())
        }
        fn as_backend(&self) -> Option<&dyn BackendProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl BackendProvider for EchoBackend {
        async fn chat(&self, ctx: &ChatContext) -> PluginResult<ChatReply> {
            let prompt = ctx
                .last_user_message()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatReply::Message(Message::assistant(format!(
                "{}: {prompt}",
                self.metadata.name
            ))))
        }
        async fn list_models(&self) -> PluginResult<Vec<String>> {
            Ok(vec!["echo-1".to_string()])
        }
    }

    struct UppercaseProcessor {
        metadata: PluginMetadata,
    }

    impl UppercaseProcessor {
        fn source(name: &'static str) -> PluginSource {
            PluginSource::new(name, move || {
                Box::new(UppercaseProcessor {
                    metadata: PluginMetadata::new(name, "1.0.0", PluginType::MessageProcessor),
                })
            })
        }
    }

    #[async_trait]
    impl Plugin for UppercaseProcessor {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> PluginResult<()> {
            Ok(())
        }
        fn as_message_processor(&self) -> Option<&dyn MessageProcessor> {
            Some(self)
        }
    }

    #[async_trait]
    impl MessageProcessor for UppercaseProcessor {
        async fn process_message(
            &self,
            mut message: Message,
            _ctx: &ChatContext,
        ) -> PluginResult<Message> {
            message.content = message.content.to_uppercase();
            Ok(message)
        }
    }

    struct GatingMiddleware {
        metadata: PluginMetadata,
    }

    impl GatingMiddleware {
        fn source(name: &'static str) -> PluginSource {
            PluginSource::new(name, move || {
                Box::new(GatingMiddleware {
                    metadata: PluginMetadata::new(name, "1.0.0", PluginType::Middleware),
                })
            })
        }
    }

    #[async_trait]
    impl Plugin for GatingMiddleware {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Ok(())
        }
        async fn shutdown(&mut self) -> PluginResult<()> {
            Ok(())
        }
        fn as_middleware(&self) -> Option<&dyn Middleware> {
            Some(self)
        }
    }

    #[async_trait]
    impl Middleware for GatingMiddleware {
        async fn process_request(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            let blocked = payload
                .get("metadata")
                .and_then(|m| m.get("blocked"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if blocked {
                return Err(Failure::new("request blocked", "auth").with_status(401));
            }
            Ok(payload)
        }
        async fn process_response(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            Ok(payload)
        }
    }

    struct OrderedPlugin {
        metadata: PluginMetadata,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl OrderedPlugin {
        fn source(
            name: &'static str,
            dependencies: &'static [&'static str],
            log: Arc<StdMutex<Vec<String>>>,
        ) -> PluginSource {
            PluginSource::new(name, move || {
                let mut metadata = PluginMetadata::new(name, "1.0.0", PluginType::Middleware);
                for dep in dependencies {
                    metadata = metadata.with_dependency(*dep);
                }
                Box::new(OrderedPlugin {
                    metadata,
                    log: log.clone(),
                })
            })
        }
    }

    #[async_trait]
    impl Plugin for OrderedPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("init:{}", self.metadata.name));
            Ok(())
        }
        async fn shutdown(&mut self) -> PluginResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("shutdown:{}", self.metadata.name));
            Ok(())
        }
        fn as_middleware(&self) -> Option<&dyn Middleware> {
            Some(self)
        }
    }

    #[async_trait]
    impl Middleware for OrderedPlugin {
        async fn process_request(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            Ok(payload)
        }
        async fn process_response(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            Ok(payload)
        }
    }

    struct BrokenPlugin {
        metadata: PluginMetadata,
    }

    impl BrokenPlugin {
        fn source(name: &'static str) -> PluginSource {
            PluginSource::new(name, move || {
                Box::new(BrokenPlugin {
                    metadata: PluginMetadata::new(name, "1.0.0", PluginType::Middleware),
                })
            })
        }
    }

    #[async_trait]
    impl Plugin for BrokenPlugin {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Err(Failure::new("refused to start", "init_error"))
        }
        async fn shutdown(&mut self) -> PluginResult<()> {
            Ok(())
        }
        fn as_middleware(&self) -> Option<&dyn Middleware> {
            Some(self)
        }
    }

    #[async_trait]
    impl Middleware for BrokenPlugin {
        async fn process_request(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            Ok(payload)
        }
        async fn process_response(
            &self,
            payload: MiddlewarePayload,
        ) -> PluginResult<MiddlewarePayload> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_initialize_follows_dependency_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new(ManagerConfig::default());

        manager
            .add_plugin(OrderedPlugin::source("c", &["b"], log.clone()))
            .await
            .unwrap();
        manager
            .add_plugin(OrderedPlugin::source("b", &["a"], log.clone()))
            .await
            .unwrap();
        manager
            .add_plugin(OrderedPlugin::source("a", &[], log.clone()))
            .await
            .unwrap();

        manager.initialize().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["init:a", "init:b", "init:c"]);

        manager.shutdown().await.unwrap();
        assert_eq!(
            log.lock().unwrap()[3..],
            ["shutdown:c", "shutdown:b", "shutdown:a"]
        );
    }

    #[tokio::test]
    async fn test_initialize_rejected_when_repeated() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager.initialize().await.unwrap();
        assert!(matches!(
            manager.initialize().await.unwrap_err(),
            PluginError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_required_plugin_failure_aborts_startup() {
        let config = ManagerConfig::from_toml_str(
            r#"
            [plugins.vital]
            required = true
            "#,
        )
        .unwrap();
        let manager = PluginManager::new(config);
        manager
            .add_plugin(BrokenPlugin::source("vital"))
            .await
            .unwrap();

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, PluginError::InitError { .. }));
    }

    #[tokio::test]
    async fn test_optional_plugin_failure_degrades_only_it() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(BrokenPlugin::source("flaky"))
            .await
            .unwrap();
        manager
            .add_plugin(EchoBackend::source("echo", 0))
            .await
            .unwrap();

        manager.initialize().await.unwrap();
        assert_eq!(
            manager.plugin_state("flaky").await,
            Some(PluginState::Failed)
        );
        assert_eq!(manager.plugin_state("echo").await, Some(PluginState::Active));
    }

    #[tokio::test]
    async fn test_disabled_plugin_not_loaded() {
        let config = ManagerConfig::from_toml_str(
            r#"
            [plugins.muted]
            enabled = false
            "#,
        )
        .unwrap();
        let manager = PluginManager::new(config);
        manager
            .add_plugin(EchoBackend::source("muted", 0))
            .await
            .unwrap();

        manager.initialize().await.unwrap();
        assert!(manager.get_plugin("muted").await.is_none());
        assert!(manager.list_plugins().await.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_processes_and_replies() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(EchoBackend::source("echo", 0))
            .await
            .unwrap();
        manager
            .add_plugin(UppercaseProcessor::source("shout"))
            .await
            .unwrap();

        manager.initialize().await.unwrap();

        let ctx = ChatContext::new(vec![Message::user("hello")]);
        let output = manager.process_request(ctx).await.unwrap();

        let ChatReply::Message(reply) = &output.reply else {
            panic!("expected message reply");
        };
        assert_eq!(reply.content, "echo: HELLO");

        // The assistant reply is appended to the final context.
        let last = output.context.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_middleware_status_failure_short_circuits() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(EchoBackend::source("echo", 0))
            .await
            .unwrap();
        manager
            .add_plugin(GatingMiddleware::source("gate"))
            .await
            .unwrap();

        manager.initialize().await.unwrap();

        let mut ctx = ChatContext::new(vec![Message::user("hi")]);
        ctx.metadata
            .insert("blocked".to_string(), serde_json::json!(true));

        let failure = manager.process_request(ctx).await.unwrap_err();
        assert_eq!(failure.status, Some(401));
        assert_eq!(failure.code, "auth");
    }

    #[tokio::test]
    async fn test_backend_selected_by_metadata_key() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(EchoBackend::source("primary", 10))
            .await
            .unwrap();
        manager
            .add_plugin(EchoBackend::source("secondary", 0))
            .await
            .unwrap();

        manager.initialize().await.unwrap();

        // Default: highest priority wins.
        let ctx = ChatContext::new(vec![Message::user("hi")]);
        let output = manager.process_request(ctx).await.unwrap();
        let ChatReply::Message(reply) = &output.reply else {
            panic!("expected message reply");
        };
        assert!(reply.content.starts_with("primary:"));

        // Explicit selection overrides priority.
        let mut ctx = ChatContext::new(vec![Message::user("hi")]);
        ctx.metadata
            .insert("provider".to_string(), serde_json::json!("secondary"));
        let output = manager.process_request(ctx).await.unwrap();
        let ChatReply::Message(reply) = &output.reply else {
            panic!("expected message reply");
        };
        assert!(reply.content.starts_with("secondary:"));
    }

    #[tokio::test]
    async fn test_unknown_named_backend_is_not_substituted() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(EchoBackend::source("echo", 0))
            .await
            .unwrap();
        manager.initialize().await.unwrap();

        let mut ctx = ChatContext::new(vec![Message::user("hi")]);
        ctx.metadata
            .insert("provider".to_string(), serde_json::json!("ghost"));

        let failure = manager.process_request(ctx).await.unwrap_err();
        assert_eq!(failure.code, "not_found");
        assert_eq!(failure.status, Some(503));
    }

    #[tokio::test]
    async fn test_no_backend_is_a_pipeline_failure() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager.initialize().await.unwrap();

        let failure = manager
            .process_request(ChatContext::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert_eq!(failure.code, "not_found");
    }

    #[tokio::test]
    async fn test_metrics_include_plugin_state() {
        let manager = PluginManager::new(ManagerConfig::default());
        manager
            .add_plugin(EchoBackend::source("echo", 7))
            .await
            .unwrap();
        manager.initialize().await.unwrap();

        let metrics = manager.get_metrics(None).await;
        assert_eq!(metrics["plugins"]["echo"]["state"], "active");
        assert_eq!(metrics["plugins"]["echo"]["priority"], 7);
    }
}
