//! Error types shared across the shardkit crates

use thiserror::Error;

/// Errors produced by sharding strategies, the router and the manager
#[derive(Debug, Error)]
pub enum ShardError {
    /// The key space does not cover this key; a topology bug, never
    /// swallowed silently
    #[error("No shard found for key: {key}")]
    NoShardFound { key: String },

    /// Shard not registered
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    /// Shard id already registered
    #[error("Shard already exists: {0}")]
    ShardAlreadyExists(String),

    /// Region not registered with the geographic strategy
    #[error("Region not found: {0}")]
    RegionNotFound(String),

    /// Region still owns shards and cannot be removed
    #[error("Region {region} still owns {shard_count} shard(s)")]
    RegionNotEmpty { region: String, shard_count: usize },

    /// Two ranges intersect
    #[error("Overlapping ranges: [{a}] and [{b}]")]
    OverlappingRanges { a: String, b: String },

    /// A configured shard owns no range
    #[error("Shard {0} has no range assigned")]
    ShardWithoutRange(String),

    /// A range is too narrow to split at a midpoint
    #[error("Range cannot be split: {0}")]
    UnsplittableRange(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Adapter-level failure on a specific shard
    #[error("Adapter error on shard {shard_id}: {message}")]
    Adapter { shard_id: String, message: String },

    /// Migration run failed
    #[error("Migration {plan_id} failed: {message}")]
    MigrationFailed { plan_id: String, message: String },
}

impl ShardError {
    /// Convenience constructor for adapter failures
    pub fn adapter(shard_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            shard_id: shard_id.into(),
            message: message.into(),
        }
    }
}
