//! Static Hash Strategy
//!
//! The simplest variant: key hash modulo the sorted shard list. Every
//! topology change re-hashes the whole key space, so it is only suitable
//! when the shard set is effectively fixed.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use shardkit_core::{HashFunction, ShardError, ShardId, ShardKey, ShardingConfig};

use super::{hash_bytes, Placement, RebalanceReport, ShardingStrategy};

/// Modulo bucketing over a static shard list
pub struct HashStrategy {
    func: HashFunction,
    /// Sorted so the bucket order is independent of registration order
    shards: RwLock<Vec<ShardId>>,
}

impl HashStrategy {
    /// Create with an explicit shard list
    pub fn new(func: HashFunction, mut shard_ids: Vec<ShardId>) -> Self {
        shard_ids.sort();
        shard_ids.dedup();
        Self {
            func,
            shards: RwLock::new(shard_ids),
        }
    }

    /// Build from validated configuration
    pub fn from_config(config: &ShardingConfig) -> Result<Self, ShardError> {
        Ok(Self::new(config.hash_function, config.shard_ids()))
    }
}

#[async_trait]
impl ShardingStrategy for HashStrategy {
    fn shard_for_key(&self, key: &ShardKey) -> Result<ShardId, ShardError> {
        let shards = self.shards.read();
        if shards.is_empty() {
            return Err(ShardError::NoShardFound {
                key: key.routing_str(),
            });
        }
        let hash = hash_bytes(self.func, key.routing_str().as_bytes());
        let idx = (hash % shards.len() as u64) as usize;
        trace!(key = %key.routing_str(), shard_id = %shards[idx], "Hash bucket lookup");
        Ok(shards[idx].clone())
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.read().clone()
    }

    fn add_shard(&self, shard_id: &str, placement: Option<Placement>) -> Result<(), ShardError> {
        match placement {
            // Buckets are uniform; a weight hint carries no meaning here
            None | Some(Placement::Weight(_)) => {}
            Some(_) => {
                return Err(ShardError::InvalidConfig(
                    "hash strategy does not accept a placement".into(),
                ));
            }
        }
        let mut shards = self.shards.write();
        if shards.iter().any(|s| s == shard_id) {
            return Err(ShardError::ShardAlreadyExists(shard_id.to_string()));
        }
        shards.push(shard_id.to_string());
        shards.sort();
        debug!(shard_id = %shard_id, total = shards.len(), "Shard added to hash buckets");
        Ok(())
    }

    fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError> {
        let mut shards = self.shards.write();
        let before = shards.len();
        shards.retain(|s| s != shard_id);
        if shards.len() == before {
            return Err(ShardError::ShardNotFound(shard_id.to_string()));
        }
        debug!(shard_id = %shard_id, total = shards.len(), "Shard removed from hash buckets");
        Ok(())
    }

    async fn rebalance(&self) -> Result<RebalanceReport, ShardError> {
        // Buckets are uniform by construction; topology changes already
        // re-hash everything.
        Ok(RebalanceReport::noop(0.0))
    }

    fn name(&self) -> &'static str {
        "Hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(count: usize) -> HashStrategy {
        let ids = (1..=count).map(|i| format!("shard-{}", i)).collect();
        HashStrategy::new(HashFunction::Blake3, ids)
    }

    #[test]
    fn test_deterministic() {
        let s = strategy(4);
        let key: ShardKey = "user:42".into();
        assert_eq!(s.shard_for_key(&key).unwrap(), s.shard_for_key(&key).unwrap());
    }

    #[test]
    fn test_all_shards_receive_keys() {
        let s = strategy(4);
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let key: ShardKey = format!("user:{}", i).into();
            seen.insert(s.shard_for_key(&key).unwrap());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_empty_topology_fails() {
        let s = HashStrategy::new(HashFunction::Blake3, vec![]);
        let key: ShardKey = "user:1".into();
        assert!(matches!(
            s.shard_for_key(&key),
            Err(ShardError::NoShardFound { .. })
        ));
    }

    #[test]
    fn test_add_remove() {
        let s = strategy(2);
        s.add_shard("shard-3", None).unwrap();
        assert_eq!(s.shard_ids().len(), 3);

        assert!(matches!(
            s.add_shard("shard-3", None),
            Err(ShardError::ShardAlreadyExists(_))
        ));

        s.remove_shard("shard-3").unwrap();
        assert!(matches!(
            s.remove_shard("shard-3"),
            Err(ShardError::ShardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rebalance_is_noop() {
        let s = strategy(3);
        let before: Vec<_> = (0..50)
            .map(|i| s.shard_for_key(&format!("k{}", i).into()).unwrap())
            .collect();
        let report = s.rebalance().await.unwrap();
        assert_eq!(report.moved, 0);
        let after: Vec<_> = (0..50)
            .map(|i| s.shard_for_key(&format!("k{}", i).into()).unwrap())
            .collect();
        assert_eq!(before, after);
    }
}
