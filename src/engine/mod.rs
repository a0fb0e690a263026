//! Discovery engine
//!
//! The single entry point tying configuration, plugin manager, scheduler,
//! event bus and device registry together. Every protocol run goes through
//! the scheduler; its results are merged into the registry through one write
//! lock and announced on the bus.

pub mod registry;

pub use registry::{DeviceRegistry, MergeOutcome, RegistryStats, SweepReport};

use crate::config::{DiscoveryConfig, RegistryConfig};
use crate::device::{Device, DiscoveryParams, DiscoveryResult};
use crate::error::{EngineError, Result};
use crate::events::{
    handler_fn, BusStatistics, DiscoveryEvent, EventBus, EventFilter, EventHandler, EventKind,
    EventType, SubscriptionId,
};
use crate::plugins::{
    DiscoveryPlugin, PluginConfig, PluginFactory, PluginManager, PluginManagerStats, PluginState,
};
use crate::scheduler::{
    DiscoveryJob, JobExecutor, JobId, JobOutcome, JobPriority, RetryPolicy, Scheduler,
    SchedulerStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_SOURCE: &str = "engine";

/// Combined result of a multi-protocol run
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    /// Merged registry view of every device any protocol reported
    pub devices: Vec<Device>,
    /// Per-plugin results, failures included
    pub results: BTreeMap<String, DiscoveryResult>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// No protocol failed
    pub success: bool,
}

impl AggregatedResult {
    pub fn failed_protocols(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn successful_protocols(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Event counts kept by the engine's own subscription
#[derive(Debug, Default)]
struct EngineCounters {
    devices_discovered: AtomicU64,
    devices_updated: AtomicU64,
    devices_lost: AtomicU64,
    discovery_errors: AtomicU64,
    discoveries_completed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub initialized: bool,
    pub started_at: DateTime<Utc>,
    pub devices_discovered: u64,
    pub devices_updated: u64,
    pub devices_lost: u64,
    pub discovery_errors: u64,
    pub discoveries_completed: u64,
    pub registry: RegistryStats,
    pub plugins: PluginManagerStats,
    pub scheduler: SchedulerStats,
    pub events: BusStatistics,
}

/// Runs a job by invoking its plugin and reconciling the result
struct EngineExecutor {
    plugins: Arc<PluginManager>,
    registry: Arc<RwLock<DeviceRegistry>>,
    event_bus: Arc<EventBus>,
}

#[async_trait]
impl JobExecutor for EngineExecutor {
    async fn execute(&self, job: &DiscoveryJob) -> Result<DiscoveryResult> {
        let mut result = self.plugins.invoke_discover(&job.protocol, &job.params).await;
        if !result.success {
            return Ok(result);
        }

        let mut events = Vec::with_capacity(result.devices.len());
        let mut new_devices = 0u64;
        {
            let mut registry = self.registry.write().await;
            for device in &result.devices {
                match registry.merge(device.clone()) {
                    MergeOutcome::New(device) => {
                        new_devices += 1;
                        events.push(DiscoveryEvent::device_discovered(device, &job.protocol, true));
                    }
                    MergeOutcome::Updated { device, changes } => {
                        events.push(DiscoveryEvent::device_discovered(
                            device.clone(),
                            &job.protocol,
                            false,
                        ));
                        events.push(DiscoveryEvent::new(
                            EventKind::DeviceUpdated {
                                device,
                                changed_fields: changes.changed_fields,
                                previous_values: changes.previous_values,
                            },
                            EVENT_SOURCE,
                        ));
                    }
                    MergeOutcome::Unchanged(device) => {
                        events.push(DiscoveryEvent::device_discovered(device, &job.protocol, false));
                    }
                }
            }
        }

        for event in events {
            self.event_bus.publish(event).await;
        }
        self.event_bus
            .publish(DiscoveryEvent::new(
                EventKind::DiscoveryCompleted {
                    protocol: job.protocol.clone(),
                    duration_ms: result.duration.as_millis() as u64,
                    devices_found: result.devices.len(),
                    success: true,
                },
                EVENT_SOURCE,
            ))
            .await;

        info!(
            protocol = %job.protocol,
            devices = result.devices.len(),
            new_devices,
            duration_ms = result.duration.as_millis() as u64,
            "Discovery run completed"
        );
        result = result.with_metadata("new_devices", new_devices);
        Ok(result)
    }
}

/// Orchestrates plugin-driven device discovery
pub struct DiscoveryEngine {
    config: Arc<DiscoveryConfig>,
    event_bus: Arc<EventBus>,
    plugins: Arc<PluginManager>,
    scheduler: Scheduler,
    registry: Arc<RwLock<DeviceRegistry>>,
    factories: Mutex<Vec<Arc<dyn PluginFactory>>>,
    counters: Arc<EngineCounters>,
    initialized: AtomicBool,
    internal_subscription: Mutex<Option<SubscriptionId>>,
    sweeper: Mutex<Option<(JoinHandle<()>, mpsc::Sender<()>)>>,
    started_at: DateTime<Utc>,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig) -> Self {
        let config = Arc::new(config);
        let event_bus = Arc::new(EventBus::new(config.events.history_size));
        let plugins = Arc::new(PluginManager::new(config.clone(), event_bus.clone()));
        let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
        let executor = Arc::new(EngineExecutor {
            plugins: plugins.clone(),
            registry: registry.clone(),
            event_bus: event_bus.clone(),
        });
        let scheduler = Scheduler::new(config.scheduler.clone(), executor, event_bus.clone());

        Self {
            config,
            event_bus,
            plugins,
            scheduler,
            registry,
            factories: Mutex::new(Vec::new()),
            counters: Arc::new(EngineCounters::default()),
            initialized: AtomicBool::new(false),
            internal_subscription: Mutex::new(None),
            sweeper: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    /// Add a compiled-in plugin factory, registered at `initialize()`
    pub fn with_factory(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.factories.get_mut().push(factory);
        self
    }

    /// Add the mDNS, SSDP, SNMP and network scan plugins
    pub fn with_builtin_protocols(self) -> Self {
        let factories = crate::protocols::builtin_factories(&self.config);
        factories.into_iter().fold(self, |engine, f| engine.with_factory(f))
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn plugin_manager(&self) -> Arc<PluginManager> {
        self.plugins.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::not_initialized(
                "discovery engine is not initialized; call initialize() first",
            ))
        }
    }

    /// Validate config, load plugins, start the scheduler and the sweep task
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.config.validate()?;
        info!("🚀 Initializing discovery engine");

        let factories: Vec<_> = self.factories.lock().await.drain(..).collect();
        for factory in factories {
            self.plugins.register_factory(factory).await;
        }
        let report = self.plugins.start().await;
        for name in &report.failed {
            warn!(plugin = %name, "Plugin unavailable after startup");
        }

        self.scheduler.start().await?;

        let id = self
            .event_bus
            .subscribe(self.bookkeeping_handler(), Some(self.bookkeeping_filter()))
            .await;
        *self.internal_subscription.lock().await = Some(id);

        *self.sweeper.lock().await = Some(self.spawn_sweeper());

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            active_plugins = report.loaded.len(),
            failed_plugins = report.failed.len(),
            "Discovery engine ready"
        );
        Ok(())
    }

    fn bookkeeping_filter(&self) -> EventFilter {
        EventFilter::new().event_types([
            EventType::DeviceDiscovered,
            EventType::DeviceUpdated,
            EventType::DeviceLost,
            EventType::DiscoveryError,
            EventType::DiscoveryCompleted,
        ])
    }

    fn bookkeeping_handler(&self) -> Arc<dyn EventHandler> {
        let counters = self.counters.clone();
        handler_fn(move |event: Arc<DiscoveryEvent>| {
            let counters = counters.clone();
            async move {
                let counter = match &event.kind {
                    EventKind::DeviceDiscovered { is_new_device: true, .. } => &counters.devices_discovered,
                    EventKind::DeviceUpdated { .. } => &counters.devices_updated,
                    EventKind::DeviceLost { .. } => &counters.devices_lost,
                    EventKind::DiscoveryError { .. } => &counters.discovery_errors,
                    EventKind::DiscoveryCompleted { .. } => &counters.discoveries_completed,
                    _ => return Ok(()),
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
    }

    fn spawn_sweeper(&self) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let registry = self.registry.clone();
        let event_bus = self.event_bus.clone();
        let config = self.config.registry.clone();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sweep(&registry, &event_bus, &config).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Staleness sweep shutting down");
                        break;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    /// Run a staleness sweep now; returns the devices that became lost
    pub async fn sweep_now(&self) -> Vec<Device> {
        sweep(&self.registry, &self.event_bus, &self.config.registry).await
    }

    /// Active plugins, highest configured priority first
    async fn active_protocols(&self) -> Vec<String> {
        let active = self.plugins.get_active_plugins().await;
        let mut ranked = Vec::with_capacity(active.len());
        for name in active.into_keys() {
            let priority = self
                .plugins
                .plugin_config(&name)
                .await
                .map(|c| c.priority)
                .unwrap_or(0);
            ranked.push((priority, name));
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, name)| name).collect()
    }

    async fn build_job(&self, name: &str, params: &DiscoveryParams) -> DiscoveryJob {
        let plugin = self
            .plugins
            .plugin_config(name)
            .await
            .unwrap_or_else(|| PluginConfig::new(name));
        let retry = RetryPolicy::from_config(&self.config.scheduler)
            .with_max_retries(plugin.retry_count)
            .with_base_delay(plugin.retry_delay);

        DiscoveryJob::once(name)
            .with_priority(JobPriority::from_protocol_priority(plugin.priority))
            .with_retry(retry)
            .with_params(params.clone())
    }

    async fn publish_started(&self, protocols: Vec<String>, params: &DiscoveryParams) {
        self.event_bus
            .publish(DiscoveryEvent::new(
                EventKind::DiscoveryStarted {
                    protocols,
                    parameters: params.clone(),
                },
                EVENT_SOURCE,
            ))
            .await;
    }

    /// Run every active protocol once and merge what they find.
    ///
    /// A failing protocol only shows up as a failed entry in `results`.
    pub async fn discover_all(&self, params: DiscoveryParams) -> Result<AggregatedResult> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let protocols = self.active_protocols().await;
        info!(protocols = ?protocols, "🔍 Starting discovery across all protocols");
        self.publish_started(protocols.clone(), &params).await;

        let mut jobs = Vec::with_capacity(protocols.len());
        for name in &protocols {
            let job = self.build_job(name, &params).await;
            jobs.push((name.clone(), self.scheduler.schedule(job).await?));
        }

        let outcomes = join_all(jobs.into_iter().map(|(name, id)| async move {
            let outcome = self.scheduler.wait_for(id).await;
            (name, outcome)
        }))
        .await;

        let mut results = BTreeMap::new();
        for (name, outcome) in outcomes {
            results.insert(name.clone(), outcome_result(&name, outcome));
        }

        let devices = self.merged_view(results.values()).await;
        let success = results.values().all(|r| r.success);
        let aggregated = AggregatedResult {
            devices,
            results,
            duration: started.elapsed(),
            success,
        };
        info!(
            devices = aggregated.devices.len(),
            failed = ?aggregated.failed_protocols(),
            duration_ms = aggregated.duration.as_millis() as u64,
            "Discovery finished"
        );
        Ok(aggregated)
    }

    /// Run one protocol once.
    ///
    /// An unregistered name is an error; a registered but inactive plugin
    /// yields a failed result.
    pub async fn discover_protocol(&self, name: &str, params: DiscoveryParams) -> Result<DiscoveryResult> {
        self.ensure_initialized()?;
        if !self.plugins.is_registered(name).await {
            return Err(EngineError::not_found(format!("no plugin registered for protocol '{name}'")));
        }
        let state = self.plugins.plugin_state(name).await;
        if state != Some(PluginState::Active) {
            return Ok(DiscoveryResult::failure(
                name,
                format!("plugin '{name}' is not active ({state:?})"),
                Duration::ZERO,
            )
            .with_metadata("error_kind", "not_active"));
        }

        self.publish_started(vec![name.to_string()], &params).await;
        let job = self.build_job(name, &params).await;
        let id = self.scheduler.schedule(job).await?;
        let outcome = self.scheduler.wait_for(id).await;
        Ok(outcome_result(name, outcome))
    }

    /// Run a protocol every `interval` (config default when `None`)
    pub async fn schedule_recurring(&self, name: &str, interval: Option<Duration>) -> Result<JobId> {
        self.ensure_initialized()?;
        if !self.plugins.is_registered(name).await {
            return Err(EngineError::not_found(format!("no plugin registered for protocol '{name}'")));
        }
        let interval = interval.unwrap_or(self.config.scheduler.default_interval);
        let once = self.build_job(name, &DiscoveryParams::new()).await;
        let job = DiscoveryJob::recurring(name, interval)
            .with_priority(once.priority)
            .with_retry(once.retry);
        let id = self.scheduler.schedule(job).await?;
        info!(protocol = %name, job_id = %id, interval = ?interval, "Recurring discovery scheduled");
        Ok(id)
    }

    pub async fn cancel_job(&self, id: JobId) -> bool {
        self.scheduler.cancel(id).await
    }

    pub async fn run_job_now(&self, id: JobId) -> Result<()> {
        self.scheduler.run_now(id).await
    }

    pub async fn list_jobs(&self) -> Vec<DiscoveryJob> {
        self.scheduler.list_jobs().await
    }

    pub async fn get_active_plugins(&self) -> HashMap<String, Arc<dyn DiscoveryPlugin>> {
        self.plugins.get_active_plugins().await
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>, filter: Option<EventFilter>) -> SubscriptionId {
        self.event_bus.subscribe(handler, filter).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.event_bus.unsubscribe(id).await
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.registry.read().await.list()
    }

    /// Look up by id or alias key
    pub async fn device(&self, key: &str) -> Option<Device> {
        self.registry.read().await.get(key).cloned()
    }

    async fn merged_view<'a, I>(&self, results: I) -> Vec<Device>
    where
        I: Iterator<Item = &'a DiscoveryResult>,
    {
        let registry = self.registry.read().await;
        let mut merged = BTreeMap::new();
        for device in results.flat_map(|r| r.devices.iter()) {
            if let Some(current) = registry.get(&device.identity_key()) {
                merged.insert(current.id.clone(), current.clone());
            }
        }
        merged.into_values().collect()
    }

    pub async fn get_statistics(&self) -> EngineStatistics {
        EngineStatistics {
            initialized: self.is_initialized(),
            started_at: self.started_at,
            devices_discovered: self.counters.devices_discovered.load(Ordering::Relaxed),
            devices_updated: self.counters.devices_updated.load(Ordering::Relaxed),
            devices_lost: self.counters.devices_lost.load(Ordering::Relaxed),
            discovery_errors: self.counters.discovery_errors.load(Ordering::Relaxed),
            discoveries_completed: self.counters.discoveries_completed.load(Ordering::Relaxed),
            registry: self.registry.read().await.stats(),
            plugins: self.plugins.get_statistics().await,
            scheduler: self.scheduler.get_statistics().await,
            events: self.event_bus.get_statistics().await,
        }
    }

    /// Stop sweeping and scheduling, unload plugins, close the bus
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down discovery engine");

        if let Some((handle, shutdown_tx)) = self.sweeper.lock().await.take() {
            let _ = shutdown_tx.send(()).await;
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                debug!("Sweep task did not stop in time");
            }
        }
        self.scheduler.shutdown().await;
        self.plugins.stop().await;
        if let Some(id) = self.internal_subscription.lock().await.take() {
            self.event_bus.unsubscribe(id).await;
        }
        self.event_bus.shutdown().await;
    }
}

/// The result a finished job carries, or a failure describing why it has none
fn outcome_result(name: &str, outcome: Result<JobOutcome>) -> DiscoveryResult {
    match outcome {
        Ok(JobOutcome { result: Some(result), .. }) => result,
        Ok(outcome) => DiscoveryResult::failure(
            name,
            outcome
                .error
                .unwrap_or_else(|| format!("job ended {:?}", outcome.status)),
            Duration::ZERO,
        ),
        Err(e) => DiscoveryResult::failure(name, e.to_string(), Duration::ZERO)
            .with_metadata("error_kind", e.category()),
    }
}

async fn sweep(registry: &RwLock<DeviceRegistry>, event_bus: &EventBus, config: &RegistryConfig) -> Vec<Device> {
    let report = registry.write().await.sweep(Utc::now(), config);

    if !report.stale.is_empty() {
        debug!(devices = ?report.stale, "Devices went stale");
    }
    for device in &report.lost {
        info!(device_id = %device.id, last_seen = %device.last_seen, "Device lost");
        event_bus.publish(DiscoveryEvent::device_lost(device)).await;
    }
    if !report.evicted.is_empty() {
        info!(
            devices = ?report.evicted.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "Evicted long-lost devices"
        );
    }
    report.lost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let engine = DiscoveryEngine::new(DiscoveryConfig::new());
        let err = engine.discover_all(DiscoveryParams::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized(_)));
        assert!(engine.discover_protocol("mdns", DiscoveryParams::new()).await.is_err());
        assert!(engine.schedule_recurring("mdns", None).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let mut config = DiscoveryConfig::new();
        config.scheduler.max_concurrent_jobs = 0;
        let engine = DiscoveryEngine::new(config);
        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!engine.is_initialized());
    }

    #[tokio::test]
    async fn test_sweep_publishes_device_lost() {
        let engine = DiscoveryEngine::new(DiscoveryConfig::new());
        let seen = Utc::now() - chrono::Duration::hours(2);
        engine
            .registry
            .write()
            .await
            .merge(Device::new("10.1.1.1".parse().unwrap(), "mdns").with_last_seen(seen));

        let lost = engine.sweep_now().await;
        assert_eq!(lost.len(), 1);
        let events = engine
            .event_bus
            .get_event_history(Some(&[EventType::DeviceLost]), None, None)
            .await;
        assert_eq!(events.len(), 1);
        assert!(engine.sweep_now().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_after_retention() {
        let mut config = DiscoveryConfig::new();
        config.registry.evict_after = Duration::from_secs(3600);
        let engine = DiscoveryEngine::new(config);
        let seen = Utc::now() - chrono::Duration::hours(2);
        engine
            .registry
            .write()
            .await
            .merge(Device::new("10.1.1.2".parse().unwrap(), "mdns").with_last_seen(seen));

        let lost = engine.sweep_now().await;
        assert_eq!(lost.len(), 1);
        assert!(engine.device("ip:10.1.1.2").await.is_none());
        assert!(engine.devices().await.is_empty());
        let events = engine
            .event_bus
            .get_event_history(Some(&[EventType::DeviceLost]), None, None)
            .await;
        assert_eq!(events.len(), 1);
    }
}
