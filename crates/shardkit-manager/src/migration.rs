//! Migration plans and coordination
//!
//! A plan describes moving a key range's rows from one shard to
//! another. The coordinator owns every plan's lifecycle
//! (`Pending -> InProgress -> Completed | Failed`, terminal states are
//! final) and delegates the actual row copying to a
//! [`MigrationExecutor`], which is an external collaborator.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use shardkit_core::{now_ms, KeyRange, ShardError, ShardId};

/// Lifecycle state of a migration plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One planned data movement between two shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: Uuid,
    pub source_shard: ShardId,
    pub target_shard: ShardId,
    pub table_name: String,
    /// Keys to move; `None` means the source shard's full key set
    pub key_range: Option<KeyRange>,
    pub status: MigrationStatus,
    pub estimated_rows: u64,
    pub actual_rows: Option<u64>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub error: Option<String>,
}

impl MigrationPlan {
    fn new(
        source_shard: ShardId,
        target_shard: ShardId,
        table_name: String,
        key_range: Option<KeyRange>,
        estimated_rows: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_shard,
            target_shard,
            table_name,
            key_range,
            status: MigrationStatus::Pending,
            estimated_rows,
            actual_rows: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            error: None,
        }
    }
}

/// Copies rows for a plan (external collaborator)
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Copy the plan's rows and return how many moved
    async fn copy_rows(&self, plan: &MigrationPlan) -> Result<u64, ShardError>;
}

/// Executor that moves nothing and reports the estimate as copied
///
/// Stands in wherever no real copy engine is wired up.
pub struct NoopExecutor;

#[async_trait]
impl MigrationExecutor for NoopExecutor {
    async fn copy_rows(&self, plan: &MigrationPlan) -> Result<u64, ShardError> {
        Ok(plan.estimated_rows)
    }
}

/// Owns migration plans and drives them through their lifecycle
pub struct MigrationCoordinator {
    executor: Arc<dyn MigrationExecutor>,
    plans: RwLock<HashMap<Uuid, MigrationPlan>>,
}

impl MigrationCoordinator {
    pub fn new(executor: Arc<dyn MigrationExecutor>) -> Self {
        Self {
            executor,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Create a pending plan
    pub fn plan(
        &self,
        source_shard: impl Into<ShardId>,
        target_shard: impl Into<ShardId>,
        table_name: impl Into<String>,
        key_range: Option<KeyRange>,
        estimated_rows: u64,
    ) -> Uuid {
        let plan = MigrationPlan::new(
            source_shard.into(),
            target_shard.into(),
            table_name.into(),
            key_range,
            estimated_rows,
        );
        let id = plan.id;
        info!(
            plan_id = %id,
            source_shard = %plan.source_shard,
            target_shard = %plan.target_shard,
            estimated_rows,
            "Migration planned"
        );
        self.plans.write().insert(id, plan);
        id
    }

    /// Run a pending plan to a terminal state
    ///
    /// Failure leaves the source shard untouched; there is no automatic
    /// rollback of partially copied rows.
    pub async fn run(&self, plan_id: Uuid) -> Result<u64, ShardError> {
        let plan = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| ShardError::MigrationFailed {
                    plan_id: plan_id.to_string(),
                    message: "unknown plan".into(),
                })?;
            if plan.status.is_terminal() {
                return Err(ShardError::MigrationFailed {
                    plan_id: plan_id.to_string(),
                    message: format!("plan already {:?}", plan.status),
                });
            }
            plan.status = MigrationStatus::InProgress;
            plan.started_at_ms = Some(now_ms());
            plan.clone()
        };

        match self.executor.copy_rows(&plan).await {
            Ok(rows) => {
                let mut plans = self.plans.write();
                if let Some(plan) = plans.get_mut(&plan_id) {
                    plan.status = MigrationStatus::Completed;
                    plan.actual_rows = Some(rows);
                    plan.completed_at_ms = Some(now_ms());
                }
                info!(plan_id = %plan_id, rows, "Migration completed");
                Ok(rows)
            }
            Err(e) => {
                let message = e.to_string();
                let mut plans = self.plans.write();
                if let Some(plan) = plans.get_mut(&plan_id) {
                    plan.status = MigrationStatus::Failed;
                    plan.completed_at_ms = Some(now_ms());
                    plan.error = Some(message.clone());
                }
                warn!(plan_id = %plan_id, error = %message, "Migration failed");
                Err(ShardError::MigrationFailed {
                    plan_id: plan_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Look up one plan
    pub fn get(&self, plan_id: Uuid) -> Option<MigrationPlan> {
        self.plans.read().get(&plan_id).cloned()
    }

    /// Snapshot of all plans
    pub fn plans(&self) -> Vec<MigrationPlan> {
        self.plans.read().values().cloned().collect()
    }
}
