//! shardkit-core - Shared types for the shardkit workspace
//!
//! This crate provides the value types, configuration, and errors used
//! by the routing and management crates:
//!
//! - [`ShardKey`] / [`KeyValue`]: a routable key
//! - [`ShardInfo`]: identity, capacity, and health of one shard
//! - [`KeyRange`] / [`ShardRange`]: intervals for range sharding
//! - [`ShardingConfig`]: strategy selection and tuning
//! - [`ShardError`]: error type shared across all crates

pub mod config;
pub mod error;
pub mod range;
pub mod types;

pub use config::{
    DatabaseKind, HashFunction, HealthCheckConfig, PoolConfig, ShardingConfig, StrategyKind,
};
pub use error::ShardError;
pub use range::{KeyRange, ShardRange};
pub use types::{
    now_ms, KeyValue, ShardCapacity, ShardId, ShardInfo, ShardKey, ShardMetrics, ShardStatus,
    DEFAULT_WEIGHT,
};
