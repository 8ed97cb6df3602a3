//! Consistent Hashing Strategy
//!
//! Each shard contributes `virtual_nodes_per_shard` synthetic ring
//! points (scaled by its weight), hashed from `"{shard_id}:{i}"` into a
//! sorted map. A key routes to the first ring point at or above its own
//! hash, wrapping to the first point past the ring's end. Adding or
//! removing a shard only perturbs that shard's points, so roughly `1/N`
//! of keys move on a topology change.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

use shardkit_core::{HashFunction, ShardError, ShardId, ShardKey, ShardingConfig, DEFAULT_WEIGHT};

use super::{coefficient_of_variation, hash_bytes, Placement, RebalanceReport, ShardingStrategy};

/// Virtual nodes moved per rebalance step
const REBALANCE_STEP: u32 = 10;
/// Relative deviation from the mean that flags a shard for rebalancing
const REBALANCE_BAND: f64 = 0.2;

#[derive(Default)]
struct RingState {
    /// Virtual-node budget per shard; the ring is derived from this
    vnode_counts: BTreeMap<ShardId, u32>,
    /// hash -> owning shard, rebuilt wholesale on every change
    ring: BTreeMap<u64, ShardId>,
}

impl RingState {
    fn rebuild(&mut self, func: HashFunction) {
        self.ring.clear();
        for (shard_id, &count) in &self.vnode_counts {
            for vn in 0..count {
                let point = format!("{}:{}", shard_id, vn);
                self.ring
                    .insert(hash_bytes(func, point.as_bytes()), shard_id.clone());
            }
        }
    }

    fn imbalance(&self) -> f64 {
        let counts: Vec<f64> = self.vnode_counts.values().map(|&c| c as f64).collect();
        coefficient_of_variation(&counts)
    }
}

/// Hash-ring strategy with per-shard virtual node budgets
pub struct ConsistentHashStrategy {
    func: HashFunction,
    /// Virtual nodes for a shard at baseline weight
    base_virtual_nodes: u32,
    state: RwLock<RingState>,
}

impl ConsistentHashStrategy {
    /// Create an empty ring
    pub fn new(func: HashFunction, virtual_nodes_per_shard: u32) -> Self {
        Self {
            func,
            base_virtual_nodes: virtual_nodes_per_shard.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    /// Build from validated configuration; virtual-node budgets scale
    /// with shard weight
    pub fn from_config(config: &ShardingConfig) -> Result<Self, ShardError> {
        let strategy = Self::new(config.hash_function, config.virtual_nodes_per_shard);
        {
            let mut state = strategy.state.write();
            for shard in &config.shards {
                let count = strategy.scaled_count(shard.weight);
                state.vnode_counts.insert(shard.id.clone(), count);
            }
            state.rebuild(strategy.func);
        }
        Ok(strategy)
    }

    fn scaled_count(&self, weight: u32) -> u32 {
        let scaled = (self.base_virtual_nodes as u64 * weight as u64) / DEFAULT_WEIGHT as u64;
        (scaled as u32).max(1)
    }

    /// Load-balance quality: coefficient of variation of per-shard
    /// virtual-node counts (0.0 = perfectly even)
    pub fn imbalance(&self) -> f64 {
        self.state.read().imbalance()
    }

    /// Current virtual-node budget for a shard
    pub fn virtual_nodes(&self, shard_id: &str) -> Option<u32> {
        self.state.read().vnode_counts.get(shard_id).copied()
    }
}

#[async_trait]
impl ShardingStrategy for ConsistentHashStrategy {
    fn shard_for_key(&self, key: &ShardKey) -> Result<ShardId, ShardError> {
        let state = self.state.read();
        if state.ring.is_empty() {
            return Err(ShardError::NoShardFound {
                key: key.routing_str(),
            });
        }
        let hash = hash_bytes(self.func, key.routing_str().as_bytes());
        // First point >= the key's hash, wrapping to the ring start
        let shard_id = state
            .ring
            .range(hash..)
            .next()
            .or_else(|| state.ring.iter().next())
            .map(|(_, id)| id.clone())
            .ok_or_else(|| ShardError::NoShardFound {
                key: key.routing_str(),
            })?;
        trace!(key = %key.routing_str(), hash, shard_id = %shard_id, "Ring lookup");
        Ok(shard_id)
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.state.read().vnode_counts.keys().cloned().collect()
    }

    fn add_shard(&self, shard_id: &str, placement: Option<Placement>) -> Result<(), ShardError> {
        let count = match placement {
            None => self.base_virtual_nodes,
            Some(Placement::Weight(weight)) => self.scaled_count(weight),
            Some(_) => {
                return Err(ShardError::InvalidConfig(
                    "consistent hashing accepts only a weight placement".into(),
                ));
            }
        };
        let mut state = self.state.write();
        if state.vnode_counts.contains_key(shard_id) {
            return Err(ShardError::ShardAlreadyExists(shard_id.to_string()));
        }
        state.vnode_counts.insert(shard_id.to_string(), count);
        state.rebuild(self.func);
        debug!(
            shard_id = %shard_id,
            virtual_nodes = count,
            ring_points = state.ring.len(),
            "Shard added to ring"
        );
        Ok(())
    }

    fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError> {
        let mut state = self.state.write();
        if state.vnode_counts.remove(shard_id).is_none() {
            return Err(ShardError::ShardNotFound(shard_id.to_string()));
        }
        state.rebuild(self.func);
        debug!(shard_id = %shard_id, ring_points = state.ring.len(), "Shard removed from ring");
        Ok(())
    }

    /// Shift virtual nodes from over- to under-loaded shards
    ///
    /// Shards more than 20% above or below the mean budget are flagged;
    /// up to ten nodes move per step from the most-over to the
    /// most-under shard, then the ring is rebuilt once.
    async fn rebalance(&self) -> Result<RebalanceReport, ShardError> {
        let mut state = self.state.write();
        let before = state.imbalance();
        if state.vnode_counts.len() < 2 {
            return Ok(RebalanceReport::noop(before));
        }

        let mut moved = 0usize;
        loop {
            let total: u64 = state.vnode_counts.values().map(|&c| c as u64).sum();
            let mean = total as f64 / state.vnode_counts.len() as f64;
            let upper = mean * (1.0 + REBALANCE_BAND);
            let lower = mean * (1.0 - REBALANCE_BAND);

            let over = state
                .vnode_counts
                .iter()
                .filter(|(_, &c)| (c as f64) > upper)
                .max_by_key(|(_, &c)| c)
                .map(|(id, &c)| (id.clone(), c));
            let under = state
                .vnode_counts
                .iter()
                .filter(|(_, &c)| (c as f64) < lower)
                .min_by_key(|(_, &c)| c)
                .map(|(id, &c)| (id.clone(), c));

            let (donor, donor_count, recipient) = match (over, under) {
                (Some((d, dc)), Some((r, _))) => (d, dc, r),
                _ => break,
            };

            // Donor always keeps at least one virtual node
            let excess = (donor_count as f64 - mean).ceil() as u32;
            let step = REBALANCE_STEP.min(excess).min(donor_count - 1);
            if step == 0 {
                break;
            }

            if let Some(count) = state.vnode_counts.get_mut(&donor) {
                *count -= step;
            }
            if let Some(count) = state.vnode_counts.get_mut(&recipient) {
                *count += step;
            }
            moved += step as usize;
        }

        if moved > 0 {
            state.rebuild(self.func);
        }
        let after = state.imbalance();
        info!(moved, imbalance_before = before, imbalance_after = after, "Ring rebalanced");
        Ok(RebalanceReport {
            moved,
            imbalance_before: before,
            imbalance_after: after,
        })
    }

    fn name(&self) -> &'static str {
        "ConsistentHashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ring(shards: usize, vnodes: u32) -> ConsistentHashStrategy {
        let s = ConsistentHashStrategy::new(HashFunction::Blake3, vnodes);
        for i in 1..=shards {
            s.add_shard(&format!("shard-{}", i), None).unwrap();
        }
        s
    }

    fn placements(s: &ConsistentHashStrategy, n: usize) -> HashMap<String, ShardId> {
        (1..=n)
            .map(|i| {
                let key = format!("user:{}", i);
                let shard = s.shard_for_key(&key.as_str().into()).unwrap();
                (key, shard)
            })
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let s = ring(3, 100);
        let key: ShardKey = "user:1".into();
        assert_eq!(s.shard_for_key(&key).unwrap(), s.shard_for_key(&key).unwrap());
    }

    #[test]
    fn test_distribution_covers_all_shards() {
        let s = ring(3, 100);
        let mut counts: HashMap<ShardId, usize> = HashMap::new();
        for (_, shard) in placements(&s, 1000) {
            *counts.entry(shard).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        for (shard, count) in &counts {
            assert!(
                *count > 150 && *count < 600,
                "shard {} got {} of 1000 keys",
                shard,
                count
            );
        }
    }

    #[test]
    fn test_weighted_add_scales_virtual_nodes() {
        let s = ring(2, 100);

        // Dynamically added shards scale like configured ones
        s.add_shard("shard-heavy", Some(Placement::Weight(300)))
            .unwrap();
        assert_eq!(s.virtual_nodes("shard-heavy"), Some(300));

        s.add_shard("shard-light", Some(Placement::Weight(50)))
            .unwrap();
        assert_eq!(s.virtual_nodes("shard-light"), Some(50));

        s.add_shard("shard-plain", None).unwrap();
        assert_eq!(s.virtual_nodes("shard-plain"), Some(100));

        // Interval and region placements are meaningless on a ring
        assert!(s
            .add_shard("shard-bad", Some(Placement::Region("us".into())))
            .is_err());
    }

    #[test]
    fn test_add_shard_moves_about_a_quarter() {
        // 3 shards, 100 virtual nodes each, keys user:1..user:1000;
        // adding a 4th shard should move roughly 25% of keys.
        let s = ring(3, 100);
        let before = placements(&s, 1000);

        s.add_shard("shard-4", None).unwrap();
        let after = placements(&s, 1000);

        let moved = before.iter().filter(|(k, v)| after[*k] != **v).count();
        let fraction = moved as f64 / 1000.0;
        assert!(
            (0.10..=0.45).contains(&fraction),
            "expected ~0.25 of keys to move, got {}",
            fraction
        );
        // Every moved key must have landed on the new shard
        for (key, shard) in &after {
            if before[key] != *shard {
                assert_eq!(shard, "shard-4", "key {} moved between old shards", key);
            }
        }
    }

    #[test]
    fn test_remove_shard_only_disturbs_its_keys() {
        let s = ring(4, 100);
        let before = placements(&s, 1000);

        s.remove_shard("shard-2").unwrap();
        let after = placements(&s, 1000);

        for (key, shard) in &before {
            if shard != "shard-2" {
                assert_eq!(&after[key], shard, "key {} moved off a surviving shard", key);
            } else {
                assert_ne!(after[key], "shard-2");
            }
        }
    }

    #[test]
    fn test_weight_scales_virtual_nodes() {
        use shardkit_core::{ShardInfo, ShardingConfig, StrategyKind};

        let shards = vec![
            ShardInfo::new("light", "127.0.0.1", 5432, "app").with_weight(50),
            ShardInfo::new("heavy", "127.0.0.1", 5433, "app").with_weight(200),
        ];
        let mut config = ShardingConfig::new(StrategyKind::ConsistentHashing, shards);
        config.virtual_nodes_per_shard = 100;

        let s = ConsistentHashStrategy::from_config(&config).unwrap();
        assert_eq!(s.virtual_nodes("light"), Some(50));
        assert_eq!(s.virtual_nodes("heavy"), Some(200));
    }

    #[test]
    fn test_every_shard_keeps_a_virtual_node() {
        let s = ConsistentHashStrategy::new(HashFunction::Blake3, 1);
        s.add_shard("only", None).unwrap();
        assert_eq!(s.virtual_nodes("only"), Some(1));
    }

    #[tokio::test]
    async fn test_rebalance_evens_budgets() {
        use shardkit_core::{ShardInfo, ShardingConfig, StrategyKind};

        let shards = vec![
            ShardInfo::new("a", "127.0.0.1", 5432, "app").with_weight(300),
            ShardInfo::new("b", "127.0.0.1", 5433, "app").with_weight(100),
            ShardInfo::new("c", "127.0.0.1", 5434, "app").with_weight(100),
        ];
        let mut config = ShardingConfig::new(StrategyKind::ConsistentHashing, shards);
        config.virtual_nodes_per_shard = 100;

        let s = ConsistentHashStrategy::from_config(&config).unwrap();
        let report = s.rebalance().await.unwrap();
        assert!(report.moved > 0);
        assert!(report.imbalance_after < report.imbalance_before);
    }

    #[tokio::test]
    async fn test_rebalance_idempotent_when_balanced() {
        let s = ring(3, 100);
        let before = placements(&s, 200);

        let report = s.rebalance().await.unwrap();
        assert_eq!(report.moved, 0);
        assert_eq!(report.imbalance_before, report.imbalance_after);

        // Routing table unchanged for a fixed key set
        assert_eq!(before, placements(&s, 200));
    }

    #[test]
    fn test_empty_ring_fails() {
        let s = ConsistentHashStrategy::new(HashFunction::Blake3, 100);
        assert!(matches!(
            s.shard_for_key(&"user:1".into()),
            Err(ShardError::NoShardFound { .. })
        ));
    }
}
