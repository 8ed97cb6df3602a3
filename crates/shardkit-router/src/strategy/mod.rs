//! Sharding Strategies
//!
//! Four strategies implement the common [`ShardingStrategy`] contract:
//!
//! - `HashStrategy`: static modulo bucketing over the shard list
//! - `ConsistentHashStrategy`: virtual-node hash ring, bounded key
//!   movement on topology change
//! - `RangeStrategy`: ordered key intervals per shard
//! - `GeographicStrategy`: region buckets with in-region hashing
//!
//! Selection is a closed enum ([`StrategyKind`] in the config); there is
//! no runtime type inspection. Each strategy owns its routing table
//! behind a single `RwLock` and rebuilds it wholesale on every topology
//! change, so concurrent readers never observe a half-built structure.

mod consistent_hash;
mod geographic;
mod hash;
mod range;

pub use consistent_hash::ConsistentHashStrategy;
pub use geographic::GeographicStrategy;
pub use hash::HashStrategy;
pub use range::RangeStrategy;

use async_trait::async_trait;
use blake3::Hasher as Blake3Hasher;
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use shardkit_core::{HashFunction, KeyRange, ShardError, ShardId, ShardKey, ShardingConfig, StrategyKind};

/// Placement hint for a newly registered shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Explicit key interval (range strategy)
    Range(KeyRange),
    /// Region membership (geographic strategy)
    Region(String),
    /// Routing weight relative to the baseline of 100 (consistent
    /// hashing scales the shard's virtual-node budget by it; other
    /// strategies treat it as no hint)
    Weight(u32),
}

/// Outcome of a rebalance pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Placement units moved (virtual nodes, ranges, or shards)
    pub moved: usize,
    /// Imbalance score before the pass
    pub imbalance_before: f64,
    /// Imbalance score after the pass
    pub imbalance_after: f64,
}

impl RebalanceReport {
    /// Report for a pass that had nothing to do
    pub fn noop(imbalance: f64) -> Self {
        Self {
            moved: 0,
            imbalance_before: imbalance,
            imbalance_after: imbalance,
        }
    }
}

/// Common contract implemented by all four strategies
#[async_trait]
pub trait ShardingStrategy: Send + Sync {
    /// Resolve a key to its owning shard
    ///
    /// Pure with respect to the current topology. Fails with
    /// `NoShardFound` only when the key space is not covered, which is a
    /// configuration bug rather than a runtime condition.
    fn shard_for_key(&self, key: &ShardKey) -> Result<ShardId, ShardError>;

    /// All registered shard ids
    fn shard_ids(&self) -> Vec<ShardId>;

    /// Register a shard, assigning a default placement when none given
    fn add_shard(&self, shard_id: &str, placement: Option<Placement>) -> Result<(), ShardError>;

    /// Remove a shard's placement; data migration is the caller's job
    fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError>;

    /// Redistribute placement to reduce imbalance
    async fn rebalance(&self) -> Result<RebalanceReport, ShardError>;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

/// Build the strategy selected by the configuration
pub fn build_strategy(
    config: &ShardingConfig,
) -> Result<Arc<dyn ShardingStrategy>, ShardError> {
    let strategy: Arc<dyn ShardingStrategy> = match config.strategy {
        StrategyKind::Hash => Arc::new(HashStrategy::from_config(config)?),
        StrategyKind::ConsistentHashing => Arc::new(ConsistentHashStrategy::from_config(config)?),
        StrategyKind::Range => Arc::new(RangeStrategy::from_config(config)?),
        StrategyKind::Geographic => Arc::new(GeographicStrategy::from_config(config)?),
    };
    Ok(strategy)
}

/// Hash arbitrary bytes to a u64 ring position with the configured
/// function
pub(crate) fn hash_bytes(func: HashFunction, data: &[u8]) -> u64 {
    let bytes: [u8; 8] = match func {
        HashFunction::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            hasher.update(data);
            let hash = hasher.finalize();
            hash.as_bytes()[..8].try_into().unwrap()
        }
        HashFunction::Sha256 => {
            let digest = Sha256::digest(data);
            digest[..8].try_into().unwrap()
        }
        HashFunction::Md5 => {
            let digest = Md5::digest(data);
            digest[..8].try_into().unwrap()
        }
    };
    u64::from_le_bytes(bytes)
}

/// Coefficient of variation (stddev / mean); 0.0 for empty or zero-mean
/// input. Used as the imbalance score across strategies.
pub(crate) fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}
