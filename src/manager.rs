//! Reconciliation of running outputs against the desired target set.
//!
//! The manager owns every live output. All changes to the output map go
//! through one async write lock; the dispatch path only ever reads the
//! snapshot slot, which is published while the lock is held and read
//! without it.
//!
//! Nothing here logs while the write lock is held. Each operation collects
//! what happened into a [`ReconcileReport`] and logs it after the guard is
//! dropped, because those log events are themselves routed through the
//! dispatch hook.

use crate::backend::{DefaultOutputFactory, OutputFactory};
use crate::dispatch::{empty_slot, DispatchHook, DispatchSnapshot, OutputWorker, SnapshotSlot, DEFAULT_QUEUE_CAPACITY};
use crate::error::ManagerError;
use crate::layer::DispatchLayer;
use crate::output::Output;
use crate::record::{Level, LogRecord};
use crate::settings::{legacy_targets, SettingsReader};
use crate::store::TargetStore;
use crate::target::{target_config_changed, validate, TargetConfig};
use parking_lot::RwLock as SlotLock;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// A target that could not be started, or whose output failed to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub id: String,
    pub name: String,
    pub error: String,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Outputs live after the pass.
    pub active: usize,
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    /// Targets skipped this pass; retried on the next one.
    pub failed: Vec<TargetFailure>,
    pub close_errors: Vec<TargetFailure>,
}

impl ReconcileReport {
    fn log(&self) {
        for id in &self.started {
            info!(target_id = %id, "log target started");
        }
        for id in &self.restarted {
            info!(target_id = %id, "log target reconnected after configuration change");
        }
        for id in &self.stopped {
            info!(target_id = %id, "log target stopped");
        }
        for f in &self.failed {
            warn!(
                target_id = %f.id,
                name = %f.name,
                error = %f.error,
                "log target unavailable, will retry on next reconfiguration"
            );
        }
        for f in &self.close_errors {
            warn!(target_id = %f.id, error = %f.error, "log target did not close cleanly");
        }
        info!(active = self.active, "log targets reconfigured");
    }
}

#[derive(Default)]
struct ManagerState {
    outputs: BTreeMap<String, OutputWorker>,
    last_configs: BTreeMap<String, TargetConfig>,
}

/// Owns the mapping from target id to running output and keeps it in
/// line with the enabled targets in the [`TargetStore`] (or the legacy
/// settings while no store is attached).
pub struct Manager {
    state: RwLock<ManagerState>,
    slot: SnapshotSlot,
    hook: DispatchHook,
    factory: Arc<dyn OutputFactory>,
    store: SlotLock<Option<Arc<TargetStore>>>,
    settings: SlotLock<Option<Arc<dyn SettingsReader>>>,
    queue_capacity: usize,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultOutputFactory))
    }

    pub fn with_factory(factory: Arc<dyn OutputFactory>) -> Self {
        let slot = empty_slot();
        Self {
            state: RwLock::new(ManagerState::default()),
            hook: DispatchHook::new(Arc::clone(&slot)),
            slot,
            factory,
            store: SlotLock::new(None),
            settings: SlotLock::new(None),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Per-output delivery queue length. Applies to outputs started after
    /// the call.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Hook to register with the logging framework.
    pub fn dispatch_hook(&self) -> DispatchHook {
        self.hook.clone()
    }

    /// [`DispatchLayer`] wrapping this manager's hook.
    pub fn layer(&self) -> DispatchLayer {
        DispatchLayer::new(self.dispatch_hook())
    }

    pub fn target_store(&self) -> Option<Arc<TargetStore>> {
        self.store.read().clone()
    }

    /// Attach the legacy settings reader and reconcile.
    pub async fn set_settings_manager(
        &self,
        settings: Arc<dyn SettingsReader>,
    ) -> Result<ReconcileReport, ManagerError> {
        *self.settings.write() = Some(settings);
        self.reconfigure().await
    }

    /// Attach a target store and reconcile against it.
    pub async fn set_target_store(&self, store: Arc<TargetStore>) -> Result<ReconcileReport, ManagerError> {
        *self.store.write() = Some(store);
        self.reconfigure().await
    }

    /// Create the schema, migrate legacy settings into an empty table,
    /// attach the store and reconcile.
    pub async fn init_target_store(&self, pool: SqlitePool) -> Result<Arc<TargetStore>, ManagerError> {
        let store = Arc::new(TargetStore::new(pool));
        store.init_schema().await?;

        let settings = self.settings.read().clone();
        if let Some(settings) = settings {
            let migrated = store.migrate_if_empty(settings.as_ref()).await?;
            if !migrated.is_empty() {
                info!(count = migrated.len(), "migrated legacy log target settings");
            }
        }

        self.set_target_store(Arc::clone(&store)).await?;
        Ok(store)
    }

    /// Converge running outputs to the enabled target set and publish a
    /// fresh dispatch snapshot.
    pub async fn reconfigure(&self) -> Result<ReconcileReport, ManagerError> {
        let result = {
            let mut state = self.state.write().await;
            match self.desired_configs().await {
                Ok(desired) => Ok(self.reconcile(&mut state, desired).await),
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(report) => report.log(),
            Err(e) => error!(error = %e, "failed to load log targets"),
        }
        result
    }

    async fn desired_configs(&self) -> Result<Vec<TargetConfig>, ManagerError> {
        let store = self.store.read().clone();
        if let Some(store) = store {
            return Ok(store.list_enabled().await?);
        }

        let settings = self.settings.read().clone();
        Ok(settings
            .map(|s| legacy_targets(s.as_ref()))
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.enabled)
            .collect())
    }

    async fn reconcile(&self, state: &mut ManagerState, desired: Vec<TargetConfig>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let desired: BTreeMap<String, TargetConfig> = desired.into_iter().map(|c| (c.id.clone(), c)).collect();

        let removed: Vec<String> = state
            .outputs
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.stop(state, &id, &mut report).await;
            report.stopped.push(id);
        }
        state.last_configs.retain(|id, _| desired.contains_key(id));

        for (id, cfg) in desired {
            if let Err(e) = cfg.filter_level() {
                if state.outputs.contains_key(&id) {
                    self.stop(state, &id, &mut report).await;
                    report.stopped.push(id.clone());
                }
                report.failed.push(TargetFailure {
                    id,
                    name: cfg.name,
                    error: e.to_string(),
                });
                continue;
            }

            let running = state.outputs.contains_key(&id);
            if running {
                let unchanged = state
                    .last_configs
                    .get(&id)
                    .is_some_and(|old| !target_config_changed(old, &cfg));
                if unchanged {
                    // filter level and name are picked up without reconnecting
                    state.last_configs.insert(id, cfg);
                    continue;
                }
                self.stop(state, &id, &mut report).await;
            }

            match self.factory.build(&cfg).await {
                Ok(output) => {
                    let worker = OutputWorker::spawn(
                        id.clone(),
                        output,
                        self.queue_capacity,
                        Arc::clone(&self.hook.dropped_events),
                    );
                    state.outputs.insert(id.clone(), worker);
                    state.last_configs.insert(id.clone(), cfg);
                    if running {
                        report.restarted.push(id);
                    } else {
                        report.started.push(id);
                    }
                }
                Err(e) => {
                    if running {
                        report.stopped.push(id.clone());
                    }
                    report.failed.push(TargetFailure {
                        id,
                        name: cfg.name,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.publish(state);
        report.active = state.outputs.len();
        report
    }

    /// Remove a target from both maps and close its output. Does not
    /// publish.
    async fn stop(&self, state: &mut ManagerState, id: &str, report: &mut ReconcileReport) {
        let cfg = state.last_configs.remove(id);
        if let Some(worker) = state.outputs.remove(id) {
            if let Err(e) = worker.shutdown().await {
                report.close_errors.push(TargetFailure {
                    id: id.to_string(),
                    name: cfg.map(|c| c.name).unwrap_or_default(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn publish(&self, state: &ManagerState) {
        let routes = state
            .outputs
            .iter()
            .filter_map(|(id, worker)| {
                let filter = state.last_configs.get(id)?.filter_level().ok()?;
                Some(worker.route(filter))
            })
            .collect();
        self.slot.store(Arc::new(DispatchSnapshot::new(routes)));
    }

    /// Stop one target, wherever it came from. Returns whether it was
    /// running.
    pub async fn close_output(&self, id: &str) -> bool {
        let mut report = ReconcileReport::default();
        let was_running = {
            let mut state = self.state.write().await;
            let was_running = state.outputs.contains_key(id);
            self.stop(&mut state, id, &mut report).await;
            self.publish(&state);
            report.active = state.outputs.len();
            was_running
        };

        if was_running {
            report.stopped.push(id.to_string());
            report.log();
        }
        was_running
    }

    /// Stop every output and publish an empty snapshot.
    pub async fn close(&self) {
        let mut report = ReconcileReport::default();
        {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state.outputs.keys().cloned().collect();
            for id in ids {
                self.stop(&mut state, &id, &mut report).await;
                report.stopped.push(id);
            }
            state.last_configs.clear();
            self.publish(&state);
        }

        for f in &report.close_errors {
            warn!(target_id = %f.id, error = %f.error, "log target did not close cleanly");
        }
        info!(stopped = report.stopped.len(), "log targets closed");
    }

    /// Run a connectivity test against a stored target.
    pub async fn test_target(&self, id: &str) -> Result<(), ManagerError> {
        let store = self.target_store().ok_or(ManagerError::NoTargetStore)?;
        let cfg = store.get(id).await?;
        self.test_target_config(&cfg).await
    }

    /// Build a throwaway output from an unsaved config, send one test
    /// record through it and close it again.
    pub async fn test_target_config(&self, cfg: &TargetConfig) -> Result<(), ManagerError> {
        validate(cfg)?;
        let output = self.factory.build(cfg).await?;

        let record = LogRecord::new(Level::Info, "log target connectivity test")
            .with_field("action", "TestLogTarget")
            .with_field("target", cfg.name.clone());

        let delivered = async {
            output.write(&record).await?;
            output.flush().await
        }
        .await;
        let closed = output.close().await;

        delivered?;
        closed?;
        Ok(())
    }

    /// Number of outputs in the published snapshot.
    pub fn active_outputs(&self) -> usize {
        self.hook.active_routes()
    }

    /// Ids of the targets in the published snapshot.
    pub fn active_target_ids(&self) -> BTreeSet<String> {
        self.slot.load().routes().iter().map(|r| r.id().to_string()).collect()
    }

    /// The live output for `id`, if any.
    pub async fn active_output(&self, id: &str) -> Option<Arc<dyn Output>> {
        let state = self.state.read().await;
        state.outputs.get(id).map(|w| Arc::clone(w.output()))
    }

    /// Config the output for `id` was last reconciled with.
    pub async fn active_config(&self, id: &str) -> Option<TargetConfig> {
        self.state.read().await.last_configs.get(id).cloned()
    }
}
