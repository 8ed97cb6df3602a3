//! shardkit-router - Key placement and dispatch
//!
//! Decides which shard owns a key and executes operations against the
//! right shard through a uniform adapter interface.
//!
//! # Architecture
//!
//! ```text
//! Key
//!  │
//!  ▼
//! ┌─────────────────────────┐
//! │    ShardingStrategy     │  Which shard owns this key?
//! │ (hash / ring / range /  │
//! │      geographic)        │
//! └───────────┬─────────────┘
//!             │
//!             ▼
//! ┌─────────────────────────┐
//! │      ShardRouter        │  Which adapter? Execute, fan out,
//! │                         │  group transactions.
//! └───────────┬─────────────┘
//!             │
//!             ▼
//!        ShardAdapter (one per shard)
//! ```
//!
//! # Strategies
//!
//! - **HashStrategy**: static modulo bucketing
//! - **ConsistentHashStrategy**: virtual-node ring, ~1/N key movement
//!   on topology change
//! - **RangeStrategy**: ordered key intervals
//! - **GeographicStrategy**: region buckets with in-region hashing

mod adapter;
mod router;
mod strategy;

// Re-exports: Adapter contract
pub use adapter::{
    AdapterFactory, MemoryAdapter, MemoryAdapterFactory, ShardAdapter, ShardOperation,
};

// Re-exports: Strategies
pub use strategy::{
    build_strategy, ConsistentHashStrategy, GeographicStrategy, HashStrategy, Placement,
    RangeStrategy, RebalanceReport, ShardingStrategy,
};

// Re-exports: Router
pub use router::{ShardHealth, ShardResponse, ShardRouter, ShardTransactionResult};
