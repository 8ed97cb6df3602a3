//! Shard Router
//!
//! Holds one adapter per live shard, resolves keys through the
//! configured strategy, and dispatches single-shard, multi-shard, and
//! all-shard operations. Fan-out operations join all-or-nothing: one
//! failed shard fails the whole group and partial results are not
//! returned. Health reporting is the exception and always yields one
//! entry per shard.

use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use shardkit_core::{ShardError, ShardId, ShardKey};

use crate::adapter::{ShardAdapter, ShardOperation};
use crate::strategy::ShardingStrategy;

/// Result of executing one operation on one shard
#[derive(Debug, Clone)]
pub struct ShardResponse {
    pub shard_id: ShardId,
    pub latency_ms: u64,
    pub value: Value,
}

/// Per-shard transaction results from a distributed transaction
#[derive(Debug, Clone)]
pub struct ShardTransactionResult {
    pub shard_id: ShardId,
    pub values: Vec<Value>,
}

/// Outcome of one shard's health probe
#[derive(Debug, Clone)]
pub struct ShardHealth {
    pub shard_id: ShardId,
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Routes operations to the shard that owns their key
pub struct ShardRouter {
    strategy: Arc<dyn ShardingStrategy>,
    adapters: RwLock<HashMap<ShardId, Arc<dyn ShardAdapter>>>,
}

impl ShardRouter {
    pub fn new(strategy: Arc<dyn ShardingStrategy>) -> Self {
        Self {
            strategy,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// The routing strategy backing this router
    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.strategy
    }

    /// Attach the adapter for a shard
    pub fn register_adapter(&self, shard_id: impl Into<ShardId>, adapter: Arc<dyn ShardAdapter>) {
        let shard_id = shard_id.into();
        debug!(shard_id = %shard_id, "Adapter registered");
        self.adapters.write().insert(shard_id, adapter);
    }

    /// Detach a shard's adapter, returning it for closing
    pub fn deregister_adapter(&self, shard_id: &str) -> Option<Arc<dyn ShardAdapter>> {
        let removed = self.adapters.write().remove(shard_id);
        if removed.is_some() {
            debug!(shard_id = %shard_id, "Adapter deregistered");
        }
        removed
    }

    fn adapter(&self, shard_id: &str) -> Result<Arc<dyn ShardAdapter>, ShardError> {
        self.adapters
            .read()
            .get(shard_id)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(shard_id.to_string()))
    }

    /// Ids of shards with a registered adapter, sorted
    pub fn adapter_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve an arbitrary key to its owning shard
    pub fn shard_for_key(&self, key: impl Into<ShardKey>) -> Result<ShardId, ShardError> {
        self.strategy.shard_for_key(&key.into())
    }

    /// Execute an operation on one specific shard
    pub async fn execute_on_shard(
        &self,
        shard_id: &str,
        op: &ShardOperation,
    ) -> Result<ShardResponse, ShardError> {
        let adapter = self.adapter(shard_id)?;
        let start = Instant::now();
        let value = adapter.execute(op).await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(shard_id = %shard_id, latency_ms, "Operation executed");
        Ok(ShardResponse {
            shard_id: shard_id.to_string(),
            latency_ms,
            value,
        })
    }

    /// Resolve a key and execute on its shard
    pub async fn execute_query(
        &self,
        key: impl Into<ShardKey>,
        op: &ShardOperation,
    ) -> Result<ShardResponse, ShardError> {
        let shard_id = self.shard_for_key(key)?;
        self.execute_on_shard(&shard_id, op).await
    }

    /// Fan an operation out to every shard with a registered adapter
    ///
    /// All-or-nothing: any shard's failure fails the call.
    pub async fn execute_on_all_shards(
        &self,
        op: &ShardOperation,
    ) -> Result<Vec<ShardResponse>, ShardError> {
        let ids = self.adapter_ids();
        self.execute_on_multiple_shards(&ids, op).await
    }

    /// Fan an operation out to a specific set of shards, all-or-nothing
    pub async fn execute_on_multiple_shards(
        &self,
        shard_ids: &[ShardId],
        op: &ShardOperation,
    ) -> Result<Vec<ShardResponse>, ShardError> {
        let futures = shard_ids
            .iter()
            .map(|id| self.execute_on_shard(id, op))
            .collect::<Vec<_>>();
        try_join_all(futures).await
    }

    /// Group per-key operations by shard and run each group as one
    /// shard-local transaction, all groups in parallel
    ///
    /// This is NOT a cross-shard atomic transaction: when one shard's
    /// transaction fails the call fails, but transactions already
    /// committed on other shards are not rolled back. Callers needing
    /// cross-shard atomicity must layer their own compensation on top.
    pub async fn execute_distributed_transaction(
        &self,
        operations: Vec<(ShardKey, ShardOperation)>,
    ) -> Result<Vec<ShardTransactionResult>, ShardError> {
        let mut groups: HashMap<ShardId, Vec<ShardOperation>> = HashMap::new();
        for (key, op) in operations {
            let shard_id = self.strategy.shard_for_key(&key)?;
            groups.entry(shard_id).or_default().push(op);
        }
        debug!(shard_count = groups.len(), "Distributed transaction grouped");

        let futures = groups
            .into_iter()
            .map(|(shard_id, ops)| async move {
                let adapter = self.adapter(&shard_id)?;
                let values = adapter.execute_transaction(&ops).await?;
                Ok::<_, ShardError>(ShardTransactionResult { shard_id, values })
            })
            .collect::<Vec<_>>();
        try_join_all(futures).await
    }

    /// Ping every shard in parallel and report each outcome
    pub async fn shard_health(&self) -> Vec<ShardHealth> {
        let adapters: Vec<(ShardId, Arc<dyn ShardAdapter>)> = {
            let map = self.adapters.read();
            map.iter().map(|(id, a)| (id.clone(), a.clone())).collect()
        };

        let futures = adapters.into_iter().map(|(shard_id, adapter)| async move {
            let start = Instant::now();
            let result = adapter.ping().await;
            let latency_ms = start.elapsed().as_millis() as u64;
            match result {
                Ok(()) => ShardHealth {
                    shard_id,
                    healthy: true,
                    latency_ms,
                    error: None,
                },
                Err(e) => ShardHealth {
                    shard_id,
                    healthy: false,
                    latency_ms,
                    error: Some(e.to_string()),
                },
            }
        });

        let mut healths = join_all(futures).await;
        healths.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        healths
    }

    /// Initialize every registered adapter; any failure aborts
    pub async fn connect_all(&self) -> Result<(), ShardError> {
        let adapters: Vec<(ShardId, Arc<dyn ShardAdapter>)> = {
            let map = self.adapters.read();
            map.iter().map(|(id, a)| (id.clone(), a.clone())).collect()
        };
        let futures = adapters.into_iter().map(|(id, adapter)| async move {
            adapter.initialize().await.map_err(|e| {
                warn!(shard_id = %id, error = %e, "Adapter initialization failed");
                e
            })
        });
        try_join_all(futures).await?;
        Ok(())
    }

    /// Close every registered adapter, best-effort
    pub async fn close_all(&self) {
        let adapters: Vec<(ShardId, Arc<dyn ShardAdapter>)> = {
            let map = self.adapters.read();
            map.iter().map(|(id, a)| (id.clone(), a.clone())).collect()
        };
        let futures = adapters.into_iter().map(|(id, adapter)| async move {
            if let Err(e) = adapter.close().await {
                warn!(shard_id = %id, error = %e, "Adapter close failed");
            }
        });
        join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::strategy::HashStrategy;
    use shardkit_core::HashFunction;

    fn router_with_memory_shards(count: usize) -> (ShardRouter, Vec<Arc<MemoryAdapter>>) {
        let ids: Vec<ShardId> = (1..=count).map(|i| format!("shard-{}", i)).collect();
        let strategy = Arc::new(HashStrategy::new(HashFunction::Blake3, ids.clone()));
        let router = ShardRouter::new(strategy);

        let mut adapters = Vec::new();
        for id in &ids {
            let adapter = Arc::new(MemoryAdapter::new(id.clone()));
            router.register_adapter(id.clone(), adapter.clone());
            adapters.push(adapter);
        }
        (router, adapters)
    }

    #[tokio::test]
    async fn test_execute_query_roundtrip() {
        let (router, _) = router_with_memory_shards(3);

        router
            .execute_query(
                "user:7",
                &ShardOperation::new("set user:7").with_params(vec![Value::from("alice")]),
            )
            .await
            .unwrap();

        let response = router
            .execute_query("user:7", &ShardOperation::new("get user:7"))
            .await
            .unwrap();
        assert_eq!(response.value, Value::from("alice"));
        // Both calls resolved to the same shard
        assert_eq!(
            response.shard_id,
            router.shard_for_key("user:7").unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_shard_fails() {
        let (router, _) = router_with_memory_shards(2);
        let result = router
            .execute_on_shard("shard-99", &ShardOperation::new("count"))
            .await;
        assert!(matches!(result, Err(ShardError::ShardNotFound(_))));
    }

    #[tokio::test]
    async fn test_all_shards_fan_out() {
        let (router, _) = router_with_memory_shards(3);
        let responses = router
            .execute_on_all_shards(&ShardOperation::new("count"))
            .await
            .unwrap();
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn test_fan_out_is_all_or_nothing() {
        let (router, adapters) = router_with_memory_shards(3);
        adapters[1].set_fail_execute(true);

        let result = router
            .execute_on_all_shards(&ShardOperation::new("count"))
            .await;
        assert!(matches!(result, Err(ShardError::Adapter { .. })));
    }

    #[tokio::test]
    async fn test_distributed_transaction_groups_by_shard() {
        let (router, _) = router_with_memory_shards(3);

        let keys: Vec<String> = (0..20).map(|i| format!("user:{}", i)).collect();
        let operations: Vec<(ShardKey, ShardOperation)> = keys
            .iter()
            .map(|k| {
                (
                    ShardKey::from(k.as_str()),
                    ShardOperation::new(format!("set {}", k)).with_params(vec![Value::from(1)]),
                )
            })
            .collect();

        let results = router
            .execute_distributed_transaction(operations)
            .await
            .unwrap();
        let total: usize = results.iter().map(|r| r.values.len()).sum();
        assert_eq!(total, 20);
        assert!(results.len() <= 3);
    }

    #[tokio::test]
    async fn test_distributed_transaction_not_atomic_across_shards() {
        // One shard's failure fails the call, but work already committed
        // on another shard stays committed.
        let (router, adapters) = router_with_memory_shards(2);

        // Find keys that land on different shards
        let mut key_a = None;
        let mut key_b = None;
        for i in 0..100 {
            let key = format!("user:{}", i);
            match router.shard_for_key(key.as_str()).unwrap().as_str() {
                "shard-1" if key_a.is_none() => key_a = Some(key),
                "shard-2" if key_b.is_none() => key_b = Some(key),
                _ => {}
            }
            if key_a.is_some() && key_b.is_some() {
                break;
            }
        }
        let (key_a, key_b) = (key_a.unwrap(), key_b.unwrap());
        // Delay shard-2 so shard-1 commits before the failure lands
        adapters[1].set_latency(std::time::Duration::from_millis(50));
        adapters[1].set_fail_execute(true);

        let result = router
            .execute_distributed_transaction(vec![
                (
                    ShardKey::from(key_a.as_str()),
                    ShardOperation::new(format!("set {}", key_a))
                        .with_params(vec![Value::from("committed")]),
                ),
                (
                    ShardKey::from(key_b.as_str()),
                    ShardOperation::new(format!("set {}", key_b))
                        .with_params(vec![Value::from("lost")]),
                ),
            ])
            .await;
        assert!(result.is_err());

        // Post-hoc read: shard-1's transaction committed even though the
        // overall call failed (documented limitation, no compensation).
        assert_eq!(adapters[0].stored(&key_a), Some(Value::from("committed")));
        assert!(adapters[1].stored(&key_b).is_none());
    }

    #[tokio::test]
    async fn test_health_reports_every_shard() {
        let (router, adapters) = router_with_memory_shards(3);
        adapters[2].set_healthy(false);

        let healths = router.shard_health().await;
        assert_eq!(healths.len(), 3);

        let unhealthy: Vec<_> = healths.iter().filter(|h| !h.healthy).collect();
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].shard_id, "shard-3");
        assert!(unhealthy[0].error.is_some());
    }

    #[tokio::test]
    async fn test_connect_all_aborts_on_failure() {
        let (router, adapters) = router_with_memory_shards(2);
        assert!(router.connect_all().await.is_ok());

        adapters[0].set_healthy(false);
        assert!(router.connect_all().await.is_err());
    }
}
