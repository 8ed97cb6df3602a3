//! Adapter contract for shard-local execution
//!
//! Concrete PostgreSQL/MongoDB adapters live outside this crate; the
//! router only needs the [`ShardAdapter`] seam. [`MemoryAdapter`] is an
//! in-process implementation with failure and latency injection, used
//! by the test suites.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use shardkit_core::{ShardError, ShardId, ShardInfo};

/// One operation executed against a shard's connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardOperation {
    /// Statement text (SQL, command, or adapter-specific)
    pub statement: String,

    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl ShardOperation {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

/// Connection to one shard (external collaborator)
#[async_trait]
pub trait ShardAdapter: Send + Sync {
    /// Open the underlying connection/pool
    async fn initialize(&self) -> Result<(), ShardError>;

    /// Execute one operation
    async fn execute(&self, op: &ShardOperation) -> Result<Value, ShardError>;

    /// Execute a group of operations as one shard-local transaction
    async fn execute_transaction(&self, ops: &[ShardOperation]) -> Result<Vec<Value>, ShardError>;

    /// Liveness check
    async fn ping(&self) -> Result<(), ShardError>;

    /// Release resources
    async fn close(&self) -> Result<(), ShardError>;
}

/// Produces adapters for newly registered shards
pub trait AdapterFactory: Send + Sync {
    fn create(&self, info: &ShardInfo) -> Arc<dyn ShardAdapter>;
}

/// In-process adapter backed by a key-value map
///
/// Statement grammar: `set <key>` (params\[0\] is the value),
/// `get <key>`, `delete <key>`, `count`. Unknown statements return
/// `null`. Failure and latency injection make it suitable for
/// exercising router and manager error paths.
pub struct MemoryAdapter {
    shard_id: ShardId,
    store: RwLock<HashMap<String, Value>>,
    healthy: AtomicBool,
    fail_execute: AtomicBool,
    ping_count: AtomicU64,
    /// Simulated per-call latency in milliseconds
    latency_ms: AtomicU64,
}

impl MemoryAdapter {
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            store: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            fail_execute: AtomicBool::new(false),
            ping_count: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate per-call latency
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Make `ping` succeed or fail
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `execute`/`execute_transaction` fail
    pub fn set_fail_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }

    /// Pings observed so far
    pub fn ping_count(&self) -> u64 {
        self.ping_count.load(Ordering::SeqCst)
    }

    /// Read a stored value directly (post-hoc verification in tests)
    pub fn stored(&self, key: &str) -> Option<Value> {
        self.store.read().get(key).cloned()
    }

    fn apply(&self, op: &ShardOperation, store: &mut HashMap<String, Value>) -> Value {
        let mut parts = op.statement.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("set"), Some(key)) => {
                let value = op.params.first().cloned().unwrap_or(Value::Null);
                store.insert(key.to_string(), value);
                Value::Bool(true)
            }
            (Some("get"), Some(key)) => store.get(key).cloned().unwrap_or(Value::Null),
            (Some("delete"), Some(key)) => Value::Bool(store.remove(key).is_some()),
            (Some("count"), _) => Value::from(store.len() as u64),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl ShardAdapter for MemoryAdapter {
    async fn initialize(&self) -> Result<(), ShardError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ShardError::adapter(self.shard_id.as_str(), "initialize refused"));
        }
        debug!(shard_id = %self.shard_id, "Memory adapter initialized");
        Ok(())
    }

    async fn execute(&self, op: &ShardOperation) -> Result<Value, ShardError> {
        self.simulate_latency().await;
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(ShardError::adapter(self.shard_id.as_str(), "injected execute failure"));
        }
        let mut store = self.store.write();
        Ok(self.apply(op, &mut store))
    }

    async fn execute_transaction(&self, ops: &[ShardOperation]) -> Result<Vec<Value>, ShardError> {
        self.simulate_latency().await;
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(ShardError::adapter(
                self.shard_id.as_str(),
                "injected transaction failure",
            ));
        }
        // Stage against a copy so a mid-transaction error cannot leave a
        // partial write; swap in on success.
        let mut staged = self.store.read().clone();
        let results = ops.iter().map(|op| self.apply(op, &mut staged)).collect();
        *self.store.write() = staged;
        Ok(results)
    }

    async fn ping(&self) -> Result<(), ShardError> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ShardError::adapter(self.shard_id.as_str(), "ping failed"))
        }
    }

    async fn close(&self) -> Result<(), ShardError> {
        debug!(shard_id = %self.shard_id, "Memory adapter closed");
        Ok(())
    }
}

/// Factory for [`MemoryAdapter`]s that keeps handles to everything it
/// created, so tests can reach into a specific shard afterwards
#[derive(Default)]
pub struct MemoryAdapterFactory {
    created: RwLock<HashMap<ShardId, Arc<MemoryAdapter>>>,
}

impl MemoryAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter previously created for a shard
    pub fn adapter(&self, shard_id: &str) -> Option<Arc<MemoryAdapter>> {
        self.created.read().get(shard_id).cloned()
    }
}

impl AdapterFactory for MemoryAdapterFactory {
    fn create(&self, info: &ShardInfo) -> Arc<dyn ShardAdapter> {
        let adapter = Arc::new(MemoryAdapter::new(info.id.clone()));
        self.created
            .write()
            .insert(info.id.clone(), adapter.clone());
        adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let adapter = MemoryAdapter::new("shard-1");
        adapter.initialize().await.unwrap();

        adapter
            .execute(&ShardOperation::new("set user:1").with_params(vec![Value::from("alice")]))
            .await
            .unwrap();
        let value = adapter
            .execute(&ShardOperation::new("get user:1"))
            .await
            .unwrap();
        assert_eq!(value, Value::from("alice"));
    }

    #[tokio::test]
    async fn test_transaction_applies_all_ops() {
        let adapter = MemoryAdapter::new("shard-1");
        let results = adapter
            .execute_transaction(&[
                ShardOperation::new("set a").with_params(vec![Value::from(1)]),
                ShardOperation::new("set b").with_params(vec![Value::from(2)]),
                ShardOperation::new("count"),
            ])
            .await
            .unwrap();
        assert_eq!(results[2], Value::from(2u64));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let adapter = MemoryAdapter::new("shard-1");
        adapter.set_fail_execute(true);
        let result = adapter.execute(&ShardOperation::new("get x")).await;
        assert!(matches!(result, Err(ShardError::Adapter { .. })));

        adapter.set_healthy(false);
        assert!(adapter.ping().await.is_err());
        assert_eq!(adapter.ping_count(), 1);
    }

    #[tokio::test]
    async fn test_factory_keeps_handles() {
        let factory = MemoryAdapterFactory::new();
        let info = ShardInfo::new("shard-9", "127.0.0.1", 5432, "app");
        let _ = factory.create(&info);
        assert!(factory.adapter("shard-9").is_some());
        assert!(factory.adapter("missing").is_none());
    }
}
