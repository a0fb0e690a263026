//! Plugin lifecycle management
//!
//! The manager owns every plugin instance. Plugin-supplied code
//! (`initialize`, `discover`, `cleanup`) always runs in its own task with a
//! deadline, so a plugin that errors, panics or hangs only ever changes its
//! own state.

use super::base::{DiscoveryPlugin, PluginConfig, PluginFactory, PluginMetadata, PluginState};
use super::manifest::{scan_directory, PluginManifest};
use super::registry::{PluginRegistry, PluginSource, RegisteredPlugin};
use super::watcher::{PluginChange, PluginWatcher};
use crate::config::DiscoveryConfig;
use crate::device::{DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::events::{DiscoveryEvent, EventBus, EventKind};
use crate::logging::PerfLogger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_SOURCE: &str = "plugin_manager";
const SLOW_DISCOVERY: Duration = Duration::from_secs(10);

/// Per-plugin counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginStats {
    pub discovery_count: u64,
    pub error_count: u64,
    pub load_time_ms: Option<u64>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_discovery: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Snapshot of one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub enabled: bool,
    pub source: String,
    pub dependencies: Vec<String>,
    pub stats: PluginStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginManagerStats {
    pub registered: usize,
    pub active: usize,
    pub failed: usize,
    pub plugins: Vec<PluginStatus>,
}

/// Outcome of [`PluginManager::load_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
    /// Registered but disabled by configuration
    pub skipped: Vec<String>,
}

struct PluginSlot {
    state: PluginState,
    instance: Option<Arc<dyn DiscoveryPlugin>>,
    stats: PluginStats,
}

impl PluginSlot {
    fn new() -> Self {
        Self {
            state: PluginState::Registered,
            instance: None,
            stats: PluginStats::default(),
        }
    }
}

/// Loads, supervises and unloads protocol plugins
pub struct PluginManager {
    config: Arc<DiscoveryConfig>,
    event_bus: Arc<EventBus>,
    registry: RwLock<PluginRegistry>,
    slots: RwLock<HashMap<String, PluginSlot>>,
    /// One lock per plugin name, held across a whole load/unload/reload
    transitions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    watcher: Mutex<Option<PluginWatcher>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    pub fn new(config: Arc<DiscoveryConfig>, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            event_bus,
            registry: RwLock::new(PluginRegistry::new()),
            slots: RwLock::new(HashMap::new()),
            transitions: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            watch_task: Mutex::new(None),
        }
    }

    /// Register a compiled-in plugin, configured from the protocol table
    pub async fn register_factory(&self, factory: Arc<dyn PluginFactory>) -> String {
        let kind = factory.metadata().name;
        let config = self.base_config(&kind);
        self.register_factory_with_config(factory, config).await
    }

    pub async fn register_factory_with_config(
        &self,
        factory: Arc<dyn PluginFactory>,
        config: PluginConfig,
    ) -> String {
        let name = self.registry.write().await.register_builtin(factory, config);
        self.slots
            .write()
            .await
            .entry(name.clone())
            .or_insert_with(PluginSlot::new);
        debug!(plugin = %name, "Registered plugin factory");
        name
    }

    fn base_config(&self, kind: &str) -> PluginConfig {
        PluginConfig::from_protocol(kind, &self.config.protocol(kind), &self.config)
    }

    /// Scan manifest directories and report every known plugin
    pub async fn discover_plugins(&self) -> Vec<PluginMetadata> {
        for directory in &self.config.plugins.directories {
            for (path, manifest) in scan_directory(directory) {
                if let Err(e) = self.register_manifest(&path, &manifest).await {
                    warn!(path = %path.display(), error = %e, "Plugin manifest rejected");
                }
            }
        }

        let registry = self.registry.read().await;
        registry
            .names()
            .iter()
            .filter_map(|name| registry.get(name).map(|p| p.metadata.clone()))
            .collect()
    }

    async fn register_manifest(&self, path: &Path, manifest: &PluginManifest) -> Result<String> {
        let base = self.base_config(&manifest.plugin.kind);
        let name = self.registry.write().await.register_manifest(path, manifest, base)?;
        self.slots
            .write()
            .await
            .entry(name.clone())
            .or_insert_with(PluginSlot::new);
        debug!(plugin = %name, path = %path.display(), "Registered plugin manifest");
        Ok(name)
    }

    /// Load `name` and, first, anything it depends on.
    ///
    /// Failure is reported as `false` and leaves the plugin `Failed`;
    /// it is never propagated.
    pub async fn load_plugin(&self, name: &str) -> bool {
        let mut attempted = HashSet::new();
        self.load_with(name, &mut attempted).await
    }

    async fn load_with(&self, name: &str, attempted: &mut HashSet<String>) -> bool {
        let order = match self.registry.read().await.resolve_load_order(&[name.to_string()]) {
            Ok(order) => order,
            Err(e) => {
                self.fail(name, &e).await;
                warn!(plugin = %name, error = %e, "Plugin failed to load");
                return false;
            }
        };

        for plugin in order {
            if self.plugin_state(&plugin).await == Some(PluginState::Active) {
                continue;
            }
            let result = if attempted.contains(&plugin) {
                Err(EngineError::plugin_load(format!("plugin '{plugin}' is not active")))
            } else {
                attempted.insert(plugin.clone());
                self.activate(&plugin).await
            };

            if let Err(e) = result {
                warn!(plugin = %plugin, error = %e, "Plugin failed to load");
                if plugin != name {
                    let e = EngineError::plugin_load(format!(
                        "dependency '{plugin}' of '{name}' failed to load"
                    ));
                    self.fail(name, &e).await;
                    warn!(plugin = %name, error = %e, "Plugin failed to load");
                }
                return false;
            }
        }
        true
    }

    /// Load every enabled plugin, continuing past failures
    pub async fn load_all(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let mut attempted = HashSet::new();

        let names = self.registry.read().await.names();
        for name in names {
            let enabled = self.plugin_config(&name).await.map(|c| c.enabled).unwrap_or(false);
            if !enabled {
                debug!(plugin = %name, "Plugin disabled, not loading");
                report.skipped.push(name);
                continue;
            }
            if self.load_with(&name, &mut attempted).await {
                report.loaded.push(name);
            } else {
                report.failed.push(name);
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Plugins loaded"
        );
        report
    }

    async fn transition_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.transitions
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn activate(&self, name: &str) -> Result<()> {
        let lock = self.transition_lock(name).await;
        let _guard = lock.lock().await;
        self.activate_locked(name).await
    }

    async fn activate_locked(&self, name: &str) -> Result<()> {
        if self.plugin_state(name).await == Some(PluginState::Active) {
            return Ok(());
        }
        let entry = self
            .registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("plugin '{name}' is not registered")))?;
        if !entry.config.enabled {
            return Err(EngineError::plugin_load(format!("plugin '{name}' is disabled")));
        }

        self.set_state(name, PluginState::Initializing).await;
        let started = Instant::now();

        match Self::instantiate(&entry).await {
            Ok(instance) => {
                let version = instance.metadata().version;
                {
                    let mut slots = self.slots.write().await;
                    let slot = slots.entry(name.to_string()).or_insert_with(PluginSlot::new);
                    slot.state = PluginState::Active;
                    slot.instance = Some(instance);
                    slot.stats.load_time_ms = Some(started.elapsed().as_millis() as u64);
                    slot.stats.loaded_at = Some(Utc::now());
                    slot.stats.last_error = None;
                }
                info!(plugin = %name, version = %version, "Plugin active");
                self.event_bus
                    .publish(DiscoveryEvent::new(
                        EventKind::PluginLoaded {
                            plugin_name: name.to_string(),
                            plugin_version: version,
                        },
                        EVENT_SOURCE,
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.fail(name, &e).await;
                Err(e)
            }
        }
    }

    /// Build, check and initialize one instance
    async fn instantiate(entry: &RegisteredPlugin) -> Result<Arc<dyn DiscoveryPlugin>> {
        entry.config.validate()?;
        entry.metadata.validate()?;

        let instance = entry.factory.create(&entry.config)?;
        let kind = entry.factory.metadata().name;
        let reported = instance.metadata();
        if reported.name != kind {
            return Err(EngineError::plugin_load(format!(
                "factory '{kind}' built an instance reporting name '{}'",
                reported.name
            )));
        }
        reported.validate()?;

        let plugin = instance.clone();
        let config = entry.config.clone();
        isolated(&entry.name, "initialize", entry.config.timeout, async move {
            plugin.initialize(&config).await
        })
        .await
        .map_err(|e| match e {
            EngineError::Timeout(_) | EngineError::PluginLoad(_) => e,
            other => EngineError::plugin_load(format!("initialize failed: {other}")),
        })?;

        Ok(instance)
    }

    async fn fail(&self, name: &str, error: &EngineError) {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(name.to_string()).or_insert_with(PluginSlot::new);
        slot.state = PluginState::Failed;
        slot.instance = None;
        slot.stats.error_count += 1;
        slot.stats.last_error = Some(error.to_string());
    }

    async fn set_state(&self, name: &str, state: PluginState) {
        let mut slots = self.slots.write().await;
        slots.entry(name.to_string()).or_insert_with(PluginSlot::new).state = state;
    }

    /// Unload a plugin no active plugin depends on
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let dependents = self.active_dependents(name).await;
        if !dependents.is_empty() {
            warn!(
                plugin = %name,
                dependents = ?dependents,
                "Refusing to unload plugin with active dependents"
            );
            return false;
        }

        let lock = self.transition_lock(name).await;
        let _guard = lock.lock().await;
        self.deactivate_locked(name, "requested").await
    }

    async fn active_dependents(&self, name: &str) -> Vec<String> {
        let dependents = self.registry.read().await.dependents_of(name);
        let slots = self.slots.read().await;
        dependents
            .into_iter()
            .filter(|d| slots.get(d).map(|s| s.state == PluginState::Active).unwrap_or(false))
            .collect()
    }

    /// Ends `Unloaded` whatever `cleanup()` does
    async fn deactivate_locked(&self, name: &str, reason: &str) -> bool {
        let instance = {
            let mut slots = self.slots.write().await;
            let Some(slot) = slots.get_mut(name) else {
                return false;
            };
            if !matches!(slot.state, PluginState::Active | PluginState::Failed) {
                return false;
            }
            slot.state = PluginState::Unloading;
            slot.instance.take()
        };

        if let Some(plugin) = instance {
            let timeout = self
                .plugin_config(name)
                .await
                .map(|c| c.timeout)
                .unwrap_or(Duration::from_secs(30));
            if let Err(e) = isolated(name, "cleanup", timeout, async move { plugin.cleanup().await }).await {
                warn!(plugin = %name, error = %e, "Plugin cleanup failed");
            }
        }

        self.set_state(name, PluginState::Unloaded).await;
        info!(plugin = %name, reason = %reason, "Plugin unloaded");
        self.event_bus
            .publish(DiscoveryEvent::new(
                EventKind::PluginUnloaded {
                    plugin_name: name.to_string(),
                    reason: reason.to_string(),
                },
                EVENT_SOURCE,
            ))
            .await;
        true
    }

    /// Unload and load again; a manifest-backed plugin re-reads its file.
    ///
    /// Active dependents are unloaded first and loaded again afterwards in
    /// dependency order. A plugin that does not come back up is left
    /// `Failed`, and so are the dependents that were waiting on it.
    pub async fn reload_plugin(&self, name: &str) -> bool {
        if !self.is_registered(name).await {
            warn!(plugin = %name, "Cannot reload unknown plugin");
            return false;
        }

        let dependents = self.active_dependents_closure(name).await;
        for dependent in dependents.iter().rev() {
            let lock = self.transition_lock(dependent).await;
            let _guard = lock.lock().await;
            self.deactivate_locked(dependent, "dependency reload").await;
        }

        let reloaded = {
            let lock = self.transition_lock(name).await;
            let _guard = lock.lock().await;
            self.reload_locked(name).await
        };

        match reloaded {
            Ok(()) => {
                info!(plugin = %name, "Plugin reloaded");
                for dependent in &dependents {
                    if let Err(e) = self.activate(dependent).await {
                        warn!(plugin = %dependent, error = %e, "Dependent failed to come back after reload");
                    }
                }
                true
            }
            Err(e) => {
                if self.plugin_state(name).await != Some(PluginState::Failed) {
                    self.fail(name, &e).await;
                }
                warn!(plugin = %name, error = %e, "Plugin failed to reload");
                let cause = EngineError::plugin_load(format!("dependency '{name}' failed to reload"));
                for dependent in &dependents {
                    self.fail(dependent, &cause).await;
                    warn!(plugin = %dependent, error = %cause, "Plugin failed to load");
                }
                false
            }
        }
    }

    async fn reload_locked(&self, name: &str) -> Result<()> {
        let source = self
            .registry
            .read()
            .await
            .get(name)
            .map(|p| p.source.clone())
            .ok_or_else(|| EngineError::not_found(format!("plugin '{name}' is not registered")))?;

        if let PluginSource::Manifest(path) = &source {
            let refreshed = match PluginManifest::load(path) {
                Ok(manifest) => self.register_manifest(path, &manifest).await,
                Err(e) => Err(e),
            };
            if let Err(e) = refreshed {
                self.deactivate_locked(name, "reload").await;
                return Err(e);
            }
        }

        self.deactivate_locked(name, "reload").await;

        let missing = self.inactive_dependencies(name).await?;
        if !missing.is_empty() {
            return Err(EngineError::plugin_load(format!(
                "plugin '{name}' needs inactive dependencies: {}",
                missing.join(", ")
            )));
        }
        self.activate_locked(name).await
    }

    /// Every active plugin that needs `name`, directly or not, dependency-first
    async fn active_dependents_closure(&self, name: &str) -> Vec<String> {
        let registry = self.registry.read().await;
        let slots = self.slots.read().await;
        let is_active = |plugin: &str| {
            slots
                .get(plugin)
                .map(|s| s.state == PluginState::Active)
                .unwrap_or(false)
        };

        let mut found: Vec<String> = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            for dependent in registry.dependents_of(&current) {
                if dependent != name && is_active(&dependent) && !found.contains(&dependent) {
                    found.push(dependent.clone());
                    pending.push(dependent);
                }
            }
        }

        match registry.resolve_load_order(&found) {
            Ok(order) => order.into_iter().filter(|p| found.contains(p)).collect(),
            Err(_) => found,
        }
    }

    async fn inactive_dependencies(&self, name: &str) -> Result<Vec<String>> {
        let order = self.registry.read().await.resolve_load_order(&[name.to_string()])?;
        let slots = self.slots.read().await;
        Ok(order
            .into_iter()
            .filter(|p| p != name)
            .filter(|p| slots.get(p).map(|s| s.state != PluginState::Active).unwrap_or(true))
            .collect())
    }

    /// React to a manifest file change
    pub async fn handle_change(&self, change: PluginChange) {
        debug!(?change, "Handling plugin change");
        match change {
            PluginChange::Added(path) | PluginChange::Modified(path) => {
                let known = self.registry.read().await.find_by_path(&path);
                if let Some(name) = known {
                    self.reload_plugin(&name).await;
                    return;
                }
                let manifest = match PluginManifest::load(&path) {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Plugin manifest rejected");
                        return;
                    }
                };
                match self.register_manifest(&path, &manifest).await {
                    Ok(name) if manifest.plugin.enabled => {
                        self.load_plugin(&name).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Plugin manifest rejected"),
                }
            }
            PluginChange::Removed(path) => {
                let known = self.registry.read().await.find_by_path(&path);
                let Some(name) = known else {
                    return;
                };
                let dependents = self.active_dependents(&name).await;
                if !dependents.is_empty() {
                    warn!(plugin = %name, dependents = ?dependents, "Removing plugin that others depend on");
                }

                let lock = self.transition_lock(&name).await;
                let _guard = lock.lock().await;
                self.deactivate_locked(&name, "removed").await;
                self.registry.write().await.unregister(&name);
                self.slots.write().await.remove(&name);
                info!(plugin = %name, "Plugin removed");
            }
        }
    }

    /// Register manifests, load everything, then watch for changes
    pub async fn start(self: &Arc<Self>) -> LoadReport {
        self.discover_plugins().await;
        let report = self.load_all().await;

        if self.config.plugins.auto_reload {
            self.start_watching().await;
        }
        report
    }

    async fn start_watching(self: &Arc<Self>) {
        let directories = &self.config.plugins.directories;
        let (watcher, mut changes) =
            match PluginWatcher::start(directories, self.config.plugins.reload_debounce) {
                Ok(started) => started,
                Err(e) => {
                    warn!(error = %e, "Plugin hot reload unavailable");
                    return;
                }
            };

        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_change(change).await;
            }
        });

        *self.watcher.lock().await = Some(watcher);
        if let Some(previous) = self.watch_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Stop watching and unload everything, dependents first
    pub async fn stop(&self) {
        if let Some(task) = self.watch_task.lock().await.take() {
            task.abort();
        }
        self.watcher.lock().await.take();

        let order = {
            let registry = self.registry.read().await;
            let names = registry.names();
            registry.resolve_load_order(&names).unwrap_or(names)
        };
        for name in order.iter().rev() {
            let lock = self.transition_lock(name).await;
            let _guard = lock.lock().await;
            self.deactivate_locked(name, "shutdown").await;
        }
    }

    /// Active plugins by name
    pub async fn get_active_plugins(&self) -> HashMap<String, Arc<dyn DiscoveryPlugin>> {
        self.slots
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.state == PluginState::Active)
            .filter_map(|(name, slot)| slot.instance.clone().map(|i| (name.clone(), i)))
            .collect()
    }

    pub async fn plugin_state(&self, name: &str) -> Option<PluginState> {
        self.slots.read().await.get(name).map(|s| s.state)
    }

    pub async fn plugin_config(&self, name: &str) -> Option<PluginConfig> {
        self.registry.read().await.get(name).map(|p| p.config.clone())
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.registry.read().await.contains(name)
    }

    pub async fn list_plugins(&self) -> Vec<PluginStatus> {
        let registry = self.registry.read().await;
        let slots = self.slots.read().await;
        registry
            .names()
            .into_iter()
            .filter_map(|name| {
                let entry = registry.get(&name)?;
                let slot = slots.get(&name);
                Some(PluginStatus {
                    version: entry.metadata.version.clone(),
                    state: slot.map(|s| s.state).unwrap_or(PluginState::Registered),
                    enabled: entry.config.enabled,
                    source: match &entry.source {
                        PluginSource::Builtin => "builtin".to_string(),
                        PluginSource::Manifest(path) => path.display().to_string(),
                    },
                    dependencies: entry.metadata.dependencies.clone(),
                    stats: slot.map(|s| s.stats.clone()).unwrap_or_default(),
                    name,
                })
            })
            .collect()
    }

    /// Run one plugin's `discover()`; every failure comes back as a failed result
    pub async fn invoke_discover(&self, name: &str, params: &DiscoveryParams) -> DiscoveryResult {
        let instance = self
            .slots
            .read()
            .await
            .get(name)
            .filter(|s| s.state == PluginState::Active)
            .and_then(|s| s.instance.clone());
        let (Some(plugin), Some(config)) = (instance, self.plugin_config(name).await) else {
            return DiscoveryResult::failure(
                name,
                format!("plugin '{name}' is not active"),
                Duration::ZERO,
            )
            .with_metadata("error_kind", "not_active")
            .with_metadata("recoverable", false);
        };

        let params = params.clone().with_defaults(&config.settings);
        let started = Instant::now();
        let outcome = isolated(name, "discover", config.timeout, async move {
            plugin.discover(&params).await
        })
        .await;
        let elapsed = started.elapsed();
        PerfLogger::log_if_slow("plugin discover", elapsed, SLOW_DISCOVERY);

        let result = match outcome {
            Ok(mut result) => {
                if result.duration.is_zero() {
                    result.duration = elapsed;
                }
                result
            }
            Err(e) => {
                crate::log_structured_error!(e, "plugin_manager", "discover", "plugin" => name);
                DiscoveryResult::failure(name, e.to_string(), elapsed)
                    .with_metadata("error_kind", e.category())
                    .with_metadata("recoverable", e.is_retryable())
            }
        };

        if let Some(slot) = self.slots.write().await.get_mut(name) {
            slot.stats.discovery_count += 1;
            slot.stats.last_discovery = Some(Utc::now());
            if !result.success {
                slot.stats.error_count += 1;
                slot.stats.last_error = result.error.clone();
            }
        }
        result
    }

    pub async fn get_statistics(&self) -> PluginManagerStats {
        let plugins = self.list_plugins().await;
        PluginManagerStats {
            registered: plugins.len(),
            active: plugins.iter().filter(|p| p.state == PluginState::Active).count(),
            failed: plugins.iter().filter(|p| p.state == PluginState::Failed).count(),
            plugins,
        }
    }
}

/// Run plugin code in its own task with a deadline.
///
/// A panic or a timeout comes back as an error; a timed out task is aborted.
async fn isolated<T, F>(plugin: &str, operation: &str, timeout: Duration, future: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(future);
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            error!(plugin = %plugin, operation = %operation, "Plugin task panicked");
            Err(EngineError::plugin_runtime(format!(
                "plugin '{plugin}' panicked during {operation}: {join_error}"
            )))
        }
        Err(_) => {
            abort.abort();
            Err(EngineError::timeout(format!(
                "plugin '{plugin}' {operation} timed out after {timeout:?}"
            )))
        }
    }
}
