//! Background health monitoring
//!
//! A spawned task pings every registered adapter on a fixed interval,
//! folds the results into the shared shard registry and reports
//! transitions over an mpsc channel. Crossing the consecutive-failure
//! threshold produces a [`HealthSignal::Failure`] exactly once per
//! outage; recovery resets the counter.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shardkit_core::{now_ms, HealthCheckConfig, ShardId, ShardInfo, ShardStatus};
use shardkit_router::ShardRouter;

/// What the monitor reports upward to the manager
#[derive(Debug, Clone)]
pub enum HealthSignal {
    /// A shard's observed health flipped
    Changed {
        shard_id: ShardId,
        healthy: bool,
        latency_ms: u64,
    },
    /// A shard failed `failure_threshold` consecutive checks
    Failure { shard_id: ShardId, error: String },
}

/// Per-shard counters kept across check rounds
#[derive(Default)]
struct CheckState {
    consecutive_failures: u32,
    total_checks: u64,
    failed_checks: u64,
    last_healthy: Option<bool>,
    failure_reported: bool,
}

pub struct HealthMonitor {
    router: Arc<ShardRouter>,
    registry: Arc<RwLock<HashMap<ShardId, ShardInfo>>>,
    config: HealthCheckConfig,
    signals: mpsc::UnboundedSender<HealthSignal>,
    shutdown: watch::Sender<bool>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        router: Arc<ShardRouter>,
        registry: Arc<RwLock<HashMap<ShardId, ShardInfo>>>,
        config: HealthCheckConfig,
        signals: mpsc::UnboundedSender<HealthSignal>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            router,
            registry,
            config,
            signals,
            shutdown,
            handle: RwLock::new(None),
        }
    }

    /// Spawn the periodic check task. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.write();
        if handle.is_some() {
            return;
        }

        let router = self.router.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let signals = self.signals.clone();
        let mut shutdown = self.shutdown.subscribe();

        info!(interval_ms = config.interval_ms, "Health monitor started");

        *handle = Some(tokio::spawn(async move {
            let mut states: HashMap<ShardId, CheckState> = HashMap::new();
            let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
            // First tick fires immediately; skip it so checks start one
            // interval after startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_checks(&router, &registry, &config, &signals, &mut states).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Health monitor stopping");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signal the check task and wait for it to exit
    pub async fn stop(&self) {
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task panicked");
            }
            info!("Health monitor stopped");
        }
    }

    /// Run one check round outside the interval schedule
    pub async fn check_now(&self) {
        let mut states = HashMap::new();
        run_checks(
            &self.router,
            &self.registry,
            &self.config,
            &self.signals,
            &mut states,
        )
        .await;
    }
}

async fn run_checks(
    router: &ShardRouter,
    registry: &RwLock<HashMap<ShardId, ShardInfo>>,
    config: &HealthCheckConfig,
    signals: &mpsc::UnboundedSender<HealthSignal>,
    states: &mut HashMap<ShardId, CheckState>,
) {
    let results = router.shard_health().await;

    // Shards that left the topology take their counters with them, so a
    // later shard under the same id starts from a clean slate
    states.retain(|id, _| results.iter().any(|check| &check.shard_id == id));

    for check in results {
        let state = states.entry(check.shard_id.clone()).or_default();
        state.total_checks += 1;

        if check.healthy {
            state.consecutive_failures = 0;
            state.failure_reported = false;
        } else {
            state.failed_checks += 1;
            state.consecutive_failures += 1;
        }

        {
            let mut registry = registry.write();
            if let Some(info) = registry.get_mut(&check.shard_id) {
                info.metrics.query_latency_ms = check.latency_ms;
                info.metrics.last_health_check_ms = Some(now_ms());
                info.metrics.error_rate = state.failed_checks as f64 / state.total_checks as f64;
                // Health checks never override an operator-set
                // maintenance status
                if info.status != ShardStatus::Maintenance {
                    info.status = if check.healthy {
                        ShardStatus::Active
                    } else {
                        ShardStatus::Inactive
                    };
                }
            }
        }

        let transitioned = state.last_healthy != Some(check.healthy);
        state.last_healthy = Some(check.healthy);

        if transitioned {
            debug!(
                shard_id = %check.shard_id,
                healthy = check.healthy,
                latency_ms = check.latency_ms,
                "Shard health changed"
            );
            let _ = signals.send(HealthSignal::Changed {
                shard_id: check.shard_id.clone(),
                healthy: check.healthy,
                latency_ms: check.latency_ms,
            });
        }

        if state.consecutive_failures >= config.failure_threshold && !state.failure_reported {
            state.failure_reported = true;
            let error = check
                .error
                .clone()
                .unwrap_or_else(|| "ping failed".to_string());
            warn!(
                shard_id = %check.shard_id,
                consecutive_failures = state.consecutive_failures,
                error = %error,
                "Shard crossed failure threshold"
            );
            let _ = signals.send(HealthSignal::Failure {
                shard_id: check.shard_id.clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkit_core::{HashFunction, ShardKey};
    use shardkit_router::{HashStrategy, MemoryAdapter};

    fn setup(
        shard_ids: &[&str],
    ) -> (
        Arc<ShardRouter>,
        Arc<RwLock<HashMap<ShardId, ShardInfo>>>,
        Vec<Arc<MemoryAdapter>>,
    ) {
        let strategy = Arc::new(HashStrategy::new(
            HashFunction::Blake3,
            shard_ids.iter().map(|s| s.to_string()).collect(),
        ));
        let router = Arc::new(ShardRouter::new(strategy));
        let mut adapters = Vec::new();
        let mut registry = HashMap::new();
        for (i, id) in shard_ids.iter().enumerate() {
            let adapter = Arc::new(MemoryAdapter::new(*id));
            router.register_adapter(*id, adapter.clone());
            adapters.push(adapter);
            registry.insert(
                id.to_string(),
                ShardInfo::new(*id, "localhost", 5432 + i as u16, "app"),
            );
        }
        (router, Arc::new(RwLock::new(registry)), adapters)
    }

    #[tokio::test]
    async fn test_check_updates_registry() {
        let (router, registry, _adapters) = setup(&["shard-1", "shard-2"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(
            router.clone(),
            registry.clone(),
            HealthCheckConfig::default(),
            tx,
        );

        monitor.check_now().await;

        let registry = registry.read();
        let info = registry.get("shard-1").unwrap();
        assert!(info.metrics.last_health_check_ms.is_some());
        assert_eq!(info.metrics.error_rate, 0.0);
        assert_eq!(info.status, ShardStatus::Active);

        // First round reports a transition from unknown to healthy
        let signal = rx.try_recv().unwrap();
        assert!(matches!(signal, HealthSignal::Changed { healthy: true, .. }));
    }

    #[tokio::test]
    async fn test_failure_threshold_fires_once() {
        let (router, registry, adapters) = setup(&["shard-1"]);
        adapters[0].set_healthy(false);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = HealthCheckConfig {
            interval_ms: 10_000,
            failure_threshold: 2,
        };
        let mut states = HashMap::new();

        for _ in 0..4 {
            run_checks(&router, &registry, &config, &tx, &mut states).await;
        }

        let mut changed = 0;
        let mut failures = 0;
        while let Ok(signal) = rx.try_recv() {
            match signal {
                HealthSignal::Changed { healthy, .. } => {
                    assert!(!healthy);
                    changed += 1;
                }
                HealthSignal::Failure { shard_id, .. } => {
                    assert_eq!(shard_id, "shard-1");
                    failures += 1;
                }
            }
        }
        assert_eq!(changed, 1);
        assert_eq!(failures, 1);

        assert_eq!(
            registry.read().get("shard-1").unwrap().status,
            ShardStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_recovery_resets_counter() {
        let (router, registry, adapters) = setup(&["shard-1"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = HealthCheckConfig {
            interval_ms: 10_000,
            failure_threshold: 3,
        };
        let mut states = HashMap::new();

        adapters[0].set_healthy(false);
        run_checks(&router, &registry, &config, &tx, &mut states).await;
        run_checks(&router, &registry, &config, &tx, &mut states).await;

        adapters[0].set_healthy(true);
        run_checks(&router, &registry, &config, &tx, &mut states).await;

        adapters[0].set_healthy(false);
        run_checks(&router, &registry, &config, &tx, &mut states).await;
        run_checks(&router, &registry, &config, &tx, &mut states).await;

        // Two failures, recovery, two failures: threshold of three never
        // crossed
        while let Ok(signal) = rx.try_recv() {
            assert!(matches!(signal, HealthSignal::Changed { .. }));
        }
    }

    #[tokio::test]
    async fn test_removed_shard_forgets_its_counters() {
        let (router, registry, adapters) = setup(&["shard-1", "shard-2"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = HealthCheckConfig {
            interval_ms: 10_000,
            failure_threshold: 3,
        };
        let mut states = HashMap::new();

        adapters[0].set_healthy(false);
        run_checks(&router, &registry, &config, &tx, &mut states).await;
        run_checks(&router, &registry, &config, &tx, &mut states).await;

        // The shard leaves and comes back under the same id
        assert!(router.deregister_adapter("shard-1").is_some());
        run_checks(&router, &registry, &config, &tx, &mut states).await;
        router.register_adapter("shard-1", adapters[0].clone());

        // Two more failures: below the threshold again, counters did
        // not survive the removal
        run_checks(&router, &registry, &config, &tx, &mut states).await;
        run_checks(&router, &registry, &config, &tx, &mut states).await;

        while let Ok(signal) = rx.try_recv() {
            assert!(
                !matches!(signal, HealthSignal::Failure { .. }),
                "stale counters crossed the threshold"
            );
        }
    }

    #[tokio::test]
    async fn test_maintenance_status_preserved() {
        let (router, registry, _adapters) = setup(&["shard-1"]);
        registry.write().get_mut("shard-1").unwrap().status = ShardStatus::Maintenance;

        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor =
            HealthMonitor::new(router, registry.clone(), HealthCheckConfig::default(), tx);
        monitor.check_now().await;

        assert_eq!(
            registry.read().get("shard-1").unwrap().status,
            ShardStatus::Maintenance
        );
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (router, registry, _adapters) = setup(&["shard-1"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = HealthCheckConfig {
            interval_ms: 5,
            failure_threshold: 3,
        };
        let monitor = HealthMonitor::new(router.clone(), registry.clone(), config, tx);

        monitor.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;

        assert!(registry
            .read()
            .get("shard-1")
            .unwrap()
            .metrics
            .last_health_check_ms
            .is_some());

        // Router still usable after the monitor is gone
        let key: ShardKey = "user:1".into();
        assert!(router.shard_for_key(key).is_ok());
    }
}
