//! shardkit-manager - Shard lifecycle facade
//!
//! Owns everything above key routing: connecting adapters, watching
//! shard health, coordinating data migrations, and broadcasting
//! lifecycle events.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ShardManager                 │
//! │                                              │
//! │  HealthMonitor ──mpsc──► failure handling    │
//! │  MigrationCoordinator    broadcast events    │
//! └───────────────────┬──────────────────────────┘
//!                     │
//!                     ▼
//!               ShardRouter (shardkit-router)
//! ```

mod events;
mod health;
mod manager;
mod migration;

pub use events::ShardEvent;
pub use health::{HealthMonitor, HealthSignal};
pub use manager::ShardManager;
pub use migration::{
    MigrationCoordinator, MigrationExecutor, MigrationPlan, MigrationStatus, NoopExecutor,
};
