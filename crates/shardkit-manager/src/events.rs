//! Lifecycle events emitted by the shard manager
//!
//! Events are delivered over a `tokio::sync::broadcast` channel.
//! Observers subscribe through [`crate::ShardManager::subscribe`]; the
//! stream is informational and never part of the routing contract.

use shardkit_core::ShardId;
use shardkit_router::RebalanceReport;

/// Everything observers can learn about the manager's lifecycle
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// Manager finished initialization
    Initialized,
    /// Manager shut down
    Shutdown,
    /// A shard was registered and its adapter connected
    ShardAdded(ShardId),
    /// A shard was fully removed
    ShardRemoved(ShardId),
    /// A shard's health transitioned
    ShardHealthChanged {
        shard_id: ShardId,
        healthy: bool,
        latency_ms: u64,
    },
    /// A shard crossed the consecutive-failure threshold
    ShardFailure { shard_id: ShardId, error: String },
    /// Failover targets were computed for a failed shard
    ShardFailureHandled {
        shard_id: ShardId,
        failover: Vec<ShardId>,
    },
    /// A rebalance pass finished
    Rebalanced(RebalanceReport),
    /// A migration plan started running
    MigrationStarted { plan_id: String },
    /// A migration plan finished
    MigrationCompleted { plan_id: String, rows: u64 },
    /// A migration plan failed
    MigrationFailed { plan_id: String, error: String },
    /// The persisted configuration changed
    ConfigUpdated,
}
