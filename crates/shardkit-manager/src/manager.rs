//! Shard lifecycle facade
//!
//! `ShardManager` ties the strategy, router, health monitor and
//! migration coordinator together behind one API. Topology mutations
//! (add, remove, rebalance, shutdown) are serialized through a single
//! async mutex; reads and query dispatch never take it.

use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shardkit_core::{
    ShardError, ShardId, ShardInfo, ShardKey, ShardStatus, ShardingConfig, StrategyKind,
    DEFAULT_WEIGHT,
};
use shardkit_router::{
    build_strategy, AdapterFactory, GeographicStrategy, Placement, RebalanceReport, ShardHealth,
    ShardOperation, ShardResponse, ShardRouter, ShardTransactionResult, ShardingStrategy,
};

use crate::events::ShardEvent;
use crate::health::{HealthMonitor, HealthSignal};
use crate::migration::{MigrationCoordinator, MigrationExecutor};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Coarse bytes-per-row guess for migration estimates when only storage
/// usage is known; executors report the actual count
const APPROX_ROW_BYTES: u64 = 512;

pub struct ShardManager {
    config: RwLock<ShardingConfig>,
    strategy: Arc<dyn ShardingStrategy>,
    /// Typed handle kept alongside the trait object when the geographic
    /// strategy is selected; failover target computation needs it
    geo: Option<Arc<GeographicStrategy>>,
    router: Arc<ShardRouter>,
    factory: Arc<dyn AdapterFactory>,
    registry: Arc<RwLock<HashMap<ShardId, ShardInfo>>>,
    monitor: HealthMonitor,
    migrations: MigrationCoordinator,
    events: broadcast::Sender<ShardEvent>,
    topology: Mutex<()>,
    signal_rx: SyncMutex<Option<mpsc::UnboundedReceiver<HealthSignal>>>,
    failure_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl ShardManager {
    pub fn new(
        config: ShardingConfig,
        factory: Arc<dyn AdapterFactory>,
        executor: Arc<dyn MigrationExecutor>,
    ) -> Result<Self, ShardError> {
        config.validate()?;

        let (strategy, geo): (Arc<dyn ShardingStrategy>, Option<Arc<GeographicStrategy>>) =
            if config.strategy == StrategyKind::Geographic {
                let geo = Arc::new(GeographicStrategy::from_config(&config)?);
                (geo.clone(), Some(geo))
            } else {
                (build_strategy(&config)?, None)
            };

        let router = Arc::new(ShardRouter::new(strategy.clone()));

        let registry: HashMap<ShardId, ShardInfo> = config
            .shards
            .iter()
            .map(|info| (info.id.clone(), info.clone()))
            .collect();
        let registry = Arc::new(RwLock::new(registry));

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(
            router.clone(),
            registry.clone(),
            config.health_check.clone(),
            signal_tx,
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            strategy = %strategy.name(),
            shards = config.shards.len(),
            "Shard manager created"
        );

        Ok(Self {
            config: RwLock::new(config),
            strategy,
            geo,
            router,
            factory,
            registry,
            monitor,
            migrations: MigrationCoordinator::new(executor),
            events,
            topology: Mutex::new(()),
            signal_rx: SyncMutex::new(Some(signal_rx)),
            failure_task: SyncMutex::new(None),
        })
    }

    /// Connect every configured shard, start monitoring and emit
    /// `Initialized`
    pub async fn initialize(&self) -> Result<(), ShardError> {
        let _guard = self.topology.lock().await;

        let infos: Vec<ShardInfo> = {
            let registry = self.registry.read();
            registry.values().cloned().collect()
        };
        for info in &infos {
            let adapter = self.factory.create(info);
            self.router.register_adapter(info.id.clone(), adapter);
        }

        self.router.connect_all().await?;

        // Startup ping is advisory: a shard that answers initialize but
        // not ping stays registered and the monitor will report it
        for check in self.router.shard_health().await {
            if !check.healthy {
                warn!(
                    shard_id = %check.shard_id,
                    error = check.error.as_deref().unwrap_or("ping failed"),
                    "Shard unhealthy at startup"
                );
            }
        }

        self.spawn_failure_task();
        self.monitor.start();

        info!(shards = infos.len(), "Shard manager initialized");
        self.emit(ShardEvent::Initialized);
        Ok(())
    }

    /// Stop monitoring, close adapters and emit `Shutdown`
    pub async fn shutdown(&self) {
        let _guard = self.topology.lock().await;

        self.monitor.stop().await;
        if let Some(task) = self.failure_task.lock().take() {
            task.abort();
        }
        self.router.close_all().await;

        info!("Shard manager shut down");
        self.emit(ShardEvent::Shutdown);
    }

    /// Register a new shard and connect its adapter
    ///
    /// Registration is all-or-nothing: an adapter that fails to
    /// initialize unwinds the strategy registration.
    pub async fn add_shard(
        &self,
        info: ShardInfo,
        placement: Option<Placement>,
    ) -> Result<(), ShardError> {
        let _guard = self.topology.lock().await;

        if self.registry.read().contains_key(&info.id) {
            return Err(ShardError::ShardAlreadyExists(info.id));
        }

        // Without an explicit placement, derive one from the shard's own
        // declaration so the strategy and the registry agree: its region
        // under geographic sharding, its weight on the ring
        let placement = placement.or_else(|| {
            if self.geo.is_some() {
                info.region.clone().map(Placement::Region)
            } else if info.weight != DEFAULT_WEIGHT {
                Some(Placement::Weight(info.weight))
            } else {
                None
            }
        });

        self.strategy.add_shard(&info.id, placement)?;

        let adapter = self.factory.create(&info);
        if let Err(e) = adapter.initialize().await {
            warn!(shard_id = %info.id, error = %e, "Adapter failed to initialize, unwinding");
            if let Err(unwind) = self.strategy.remove_shard(&info.id) {
                warn!(shard_id = %info.id, error = %unwind, "Unwind failed");
            }
            return Err(e);
        }

        self.router.register_adapter(info.id.clone(), adapter);
        self.registry.write().insert(info.id.clone(), info.clone());
        self.config.write().shards.push(info.clone());

        info!(shard_id = %info.id, "Shard added");
        self.emit(ShardEvent::ShardAdded(info.id));
        self.emit(ShardEvent::ConfigUpdated);
        self.maybe_rebalance().await;
        Ok(())
    }

    /// Remove a shard, migrating its data to a sibling first when it
    /// holds any
    pub async fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError> {
        let _guard = self.topology.lock().await;

        let info = self
            .registry
            .read()
            .get(shard_id)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(shard_id.to_string()))?;

        if info.metrics.storage_used_bytes > 0 {
            self.drain_shard(&info).await?;
        }

        self.strategy.remove_shard(shard_id)?;

        if let Some(adapter) = self.router.deregister_adapter(shard_id) {
            if let Err(e) = adapter.close().await {
                warn!(shard_id = %shard_id, error = %e, "Adapter close failed");
            }
        }
        self.registry.write().remove(shard_id);
        self.config.write().shards.retain(|s| s.id != shard_id);

        info!(shard_id = %shard_id, "Shard removed");
        self.emit(ShardEvent::ShardRemoved(shard_id.to_string()));
        self.emit(ShardEvent::ConfigUpdated);
        self.maybe_rebalance().await;
        Ok(())
    }

    /// Rebalance after a topology change when `auto_rebalance` is set.
    /// Caller holds the topology lock. Failures are logged, never
    /// propagated; the topology change itself already succeeded.
    async fn maybe_rebalance(&self) {
        let enabled = self.config.read().auto_rebalance;
        if !enabled {
            return;
        }
        match self.strategy.rebalance().await {
            Ok(report) => {
                debug!(moved = report.moved, "Auto-rebalance finished");
                self.emit(ShardEvent::Rebalanced(report));
            }
            Err(e) => warn!(error = %e, "Auto-rebalance failed"),
        }
    }

    /// Migrate a departing shard's rows to a sibling. Failure aborts the
    /// removal; the shard keeps its data and its placement.
    async fn drain_shard(&self, info: &ShardInfo) -> Result<(), ShardError> {
        let target = self
            .strategy
            .shard_ids()
            .into_iter()
            .find(|id| id != &info.id)
            .ok_or_else(|| {
                ShardError::InvalidConfig(format!(
                    "cannot remove {}: no sibling shard to migrate its data to",
                    info.id
                ))
            })?;

        let estimated_rows = (info.metrics.storage_used_bytes / APPROX_ROW_BYTES).max(1);
        let plan_id = self
            .migrations
            .plan(info.id.clone(), target, "*", None, estimated_rows);
        self.emit(ShardEvent::MigrationStarted {
            plan_id: plan_id.to_string(),
        });

        match self.migrations.run(plan_id).await {
            Ok(rows) => {
                self.emit(ShardEvent::MigrationCompleted {
                    plan_id: plan_id.to_string(),
                    rows,
                });
                Ok(())
            }
            Err(e) => {
                self.emit(ShardEvent::MigrationFailed {
                    plan_id: plan_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run one rebalance pass on the active strategy, then re-validate
    /// every adapter with a ping
    pub async fn rebalance(&self) -> Result<RebalanceReport, ShardError> {
        let _guard = self.topology.lock().await;

        let report = self.strategy.rebalance().await?;
        info!(
            moved = report.moved,
            imbalance_before = report.imbalance_before,
            imbalance_after = report.imbalance_after,
            "Rebalance finished"
        );
        for check in self.router.shard_health().await {
            if !check.healthy {
                warn!(
                    shard_id = %check.shard_id,
                    error = check.error.as_deref().unwrap_or("ping failed"),
                    "Shard unhealthy after rebalance"
                );
            }
        }
        self.emit(ShardEvent::Rebalanced(report.clone()));
        Ok(report)
    }

    /// Operator-driven maintenance toggle
    pub fn set_maintenance(&self, shard_id: &str, enabled: bool) -> Result<(), ShardError> {
        let mut registry = self.registry.write();
        let info = registry
            .get_mut(shard_id)
            .ok_or_else(|| ShardError::ShardNotFound(shard_id.to_string()))?;
        info.status = if enabled {
            ShardStatus::Maintenance
        } else {
            ShardStatus::Active
        };
        info!(shard_id = %shard_id, enabled, "Maintenance mode");
        Ok(())
    }

    /// Resolve a key to its owning shard
    pub fn shard_for_key(&self, key: impl Into<ShardKey>) -> Result<ShardId, ShardError> {
        self.router.shard_for_key(key)
    }

    /// Execute an operation on the shard owning `key`
    pub async fn execute(
        &self,
        key: impl Into<ShardKey>,
        op: &ShardOperation,
    ) -> Result<ShardResponse, ShardError> {
        self.router.execute_query(key, op).await
    }

    /// Fan an operation out to every shard
    pub async fn execute_on_all(
        &self,
        op: &ShardOperation,
    ) -> Result<Vec<ShardResponse>, ShardError> {
        self.router.execute_on_all_shards(op).await
    }

    /// Run per-shard transactions grouped by key ownership
    pub async fn distributed_transaction(
        &self,
        operations: Vec<(ShardKey, ShardOperation)>,
    ) -> Result<Vec<ShardTransactionResult>, ShardError> {
        self.router.execute_distributed_transaction(operations).await
    }

    /// Ping every shard once
    pub async fn shard_health(&self) -> Vec<ShardHealth> {
        self.router.shard_health().await
    }

    /// All registered shards, sorted by id
    pub fn shards(&self) -> Vec<ShardInfo> {
        let mut shards: Vec<ShardInfo> = self.registry.read().values().cloned().collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    /// One shard's registration and metrics
    pub fn shard(&self, shard_id: &str) -> Option<ShardInfo> {
        self.registry.read().get(shard_id).cloned()
    }

    /// Snapshot of the stored configuration
    pub fn config(&self) -> ShardingConfig {
        self.config.read().clone()
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ShardEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn spawn_failure_task(&self) {
        let mut rx = match self.signal_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let registry = self.registry.clone();
        let geo = self.geo.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    HealthSignal::Changed {
                        shard_id,
                        healthy,
                        latency_ms,
                    } => {
                        debug!(shard_id = %shard_id, healthy, "Health transition");
                        let _ = events.send(ShardEvent::ShardHealthChanged {
                            shard_id,
                            healthy,
                            latency_ms,
                        });
                    }
                    HealthSignal::Failure { shard_id, error } => {
                        {
                            let mut registry = registry.write();
                            if let Some(info) = registry.get_mut(&shard_id) {
                                info.status = ShardStatus::Inactive;
                            }
                        }
                        warn!(shard_id = %shard_id, error = %error, "Shard failure");
                        let _ = events.send(ShardEvent::ShardFailure {
                            shard_id: shard_id.clone(),
                            error,
                        });

                        if let Some(geo) = &geo {
                            let failover = geo.failover_targets_for_shard(&shard_id);
                            info!(
                                shard_id = %shard_id,
                                targets = failover.len(),
                                "Failover targets computed"
                            );
                            let _ = events.send(ShardEvent::ShardFailureHandled {
                                shard_id,
                                failover,
                            });
                        }
                    }
                }
            }
        });
        *self.failure_task.lock() = Some(task);
    }
}
