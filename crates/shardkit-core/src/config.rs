//! Sharding configuration
//!
//! Loaded from a JSON file with optional environment overrides, then
//! validated before any routing structure is built. Validation fails
//! fast on coverage bugs (overlapping ranges, shards without a range or
//! region) so they never surface as routing errors later.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ShardError;
use crate::range::ShardRange;
use crate::types::{ShardId, ShardInfo};

/// Which sharding strategy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Hash,
    Range,
    Geographic,
    ConsistentHashing,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Hash => write!(f, "hash"),
            StrategyKind::Range => write!(f, "range"),
            StrategyKind::Geographic => write!(f, "geographic"),
            StrategyKind::ConsistentHashing => write!(f, "consistent-hashing"),
        }
    }
}

/// Target database flavor for the (external) adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgresql,
    Mongodb,
}

/// Hash function for key and virtual-node hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// Fast non-cryptographic default
    Blake3,
    Sha256,
    Md5,
}

impl Default for HashFunction {
    fn default() -> Self {
        Self::Blake3
    }
}

/// Connection pool settings passed through to adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 20,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Interval between ping rounds
    pub interval_ms: u64,

    /// Consecutive failed checks before a shard is reported failed
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            failure_threshold: 3,
        }
    }
}

/// Top-level sharding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Strategy selector
    pub strategy: StrategyKind,

    /// Registered shards
    pub shards: Vec<ShardInfo>,

    /// Adapter flavor
    pub database: DatabaseKind,

    /// Connection pool settings
    #[serde(default)]
    pub connection_pool: PoolConfig,

    /// Health check settings
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Virtual nodes per shard at weight 100 (consistent hashing)
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes_per_shard: u32,

    /// Hash function for hash-based strategies
    #[serde(default)]
    pub hash_function: HashFunction,

    /// Explicit range assignments (range strategy)
    #[serde(default)]
    pub ranges: Vec<ShardRange>,

    /// Region for keys that carry no region hint (geographic strategy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_region: Option<String>,

    /// Backup regions per region, in failover preference order
    #[serde(default)]
    pub failover_regions: HashMap<String, Vec<String>>,

    /// Rebalance automatically after topology changes
    #[serde(default)]
    pub auto_rebalance: bool,

    /// Imbalance score (coefficient of variation) above which a
    /// rebalance actually moves placement
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,
}

fn default_virtual_nodes() -> u32 {
    150
}

fn default_rebalance_threshold() -> f64 {
    0.2
}

impl ShardingConfig {
    /// Minimal config for a strategy and shard set, defaults elsewhere
    pub fn new(strategy: StrategyKind, shards: Vec<ShardInfo>) -> Self {
        Self {
            strategy,
            shards,
            database: DatabaseKind::Postgresql,
            connection_pool: PoolConfig::default(),
            health_check: HealthCheckConfig::default(),
            virtual_nodes_per_shard: default_virtual_nodes(),
            hash_function: HashFunction::default(),
            ranges: Vec::new(),
            default_region: None,
            failover_regions: HashMap::new(),
            auto_rebalance: false,
            rebalance_threshold: default_rebalance_threshold(),
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ShardError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ShardError::InvalidConfig(format!("read config: {}", e)))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ShardError::InvalidConfig(format!("parse config: {}", e)))?;
        Ok(config)
    }

    /// Apply environment overrides for fields that commonly vary per
    /// deployment
    pub fn apply_env(&mut self) {
        if let Ok(interval) = std::env::var("SHARDKIT_HEALTH_INTERVAL_MS") {
            if let Ok(interval) = interval.parse() {
                self.health_check.interval_ms = interval;
            }
        }
        if let Ok(vnodes) = std::env::var("SHARDKIT_VIRTUAL_NODES") {
            if let Ok(vnodes) = vnodes.parse() {
                self.virtual_nodes_per_shard = vnodes;
            }
        }
        if let Ok(auto) = std::env::var("SHARDKIT_AUTO_REBALANCE") {
            self.auto_rebalance = auto == "1" || auto.eq_ignore_ascii_case("true");
        }
    }

    /// Fail-fast validation, run before any routing structure is built
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.shards.is_empty() {
            return Err(ShardError::InvalidConfig("no shards configured".into()));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id.as_str()) {
                return Err(ShardError::ShardAlreadyExists(shard.id.clone()));
            }
        }

        match self.strategy {
            StrategyKind::Range => self.validate_ranges(),
            StrategyKind::Geographic => self.validate_regions(),
            StrategyKind::Hash | StrategyKind::ConsistentHashing => Ok(()),
        }
    }

    fn validate_ranges(&self) -> Result<(), ShardError> {
        for (i, a) in self.ranges.iter().enumerate() {
            for b in &self.ranges[i + 1..] {
                if a.range.overlaps(&b.range) {
                    return Err(ShardError::OverlappingRanges {
                        a: a.range.to_string(),
                        b: b.range.to_string(),
                    });
                }
            }
        }

        let owners: HashSet<&str> = self.ranges.iter().map(|r| r.shard_id.as_str()).collect();
        for shard in &self.shards {
            if !owners.contains(shard.id.as_str()) {
                return Err(ShardError::ShardWithoutRange(shard.id.clone()));
            }
        }

        for range in &self.ranges {
            if !self.shards.iter().any(|s| s.id == range.shard_id) {
                return Err(ShardError::ShardNotFound(range.shard_id.clone()));
            }
        }
        Ok(())
    }

    fn validate_regions(&self) -> Result<(), ShardError> {
        for shard in &self.shards {
            if shard.region.as_deref().map_or(true, |r| r.is_empty()) {
                return Err(ShardError::InvalidConfig(format!(
                    "shard {} has no region assigned",
                    shard.id
                )));
            }
        }

        let regions: HashSet<&str> = self
            .shards
            .iter()
            .filter_map(|s| s.region.as_deref())
            .collect();

        if let Some(default) = &self.default_region {
            if !regions.contains(default.as_str()) {
                return Err(ShardError::RegionNotFound(default.clone()));
            }
        }
        Ok(())
    }

    /// Ids of all configured shards
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.id.clone()).collect()
    }
}
