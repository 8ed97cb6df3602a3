//! Common types for shard routing
//!
//! Centralizes type definitions to avoid duplication across crates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Shard identifier
pub type ShardId = String;

/// Default routing weight for a shard (100 = baseline)
pub const DEFAULT_WEIGHT: u32 = 100;

/// The value part of a routable key
///
/// Numbers order before text; text (including UUIDs) compares bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum KeyValue {
    /// Arbitrary string key
    #[serde(rename = "string")]
    Str(String),
    /// Numeric key
    #[serde(rename = "number")]
    Num(i64),
    /// UUID key (stored in canonical string form)
    Uuid(String),
}

impl KeyValue {
    /// Canonical string used by hash-based strategies
    pub fn routing_str(&self) -> String {
        match self {
            KeyValue::Str(s) => s.clone(),
            KeyValue::Num(n) => n.to_string(),
            KeyValue::Uuid(u) => u.clone(),
        }
    }

    /// Text form for ordering; numbers are ordered separately
    fn text(&self) -> Option<&str> {
        match self {
            KeyValue::Str(s) => Some(s),
            KeyValue::Uuid(u) => Some(u),
            KeyValue::Num(_) => None,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Num(a), KeyValue::Num(b)) => a.cmp(b),
            // Numbers sort before any text key
            (KeyValue::Num(_), _) => Ordering::Less,
            (_, KeyValue::Num(_)) => Ordering::Greater,
            _ => self.text().cmp(&other.text()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.routing_str())
    }
}

/// A routable key
///
/// Used only for routing decisions; never persisted. The optional region
/// is a hint for the geographic strategy and is ignored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKey {
    /// Key value
    pub value: KeyValue,

    /// Explicit region hint (geographic strategy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl ShardKey {
    /// Create a key from any supported value
    pub fn new(value: KeyValue) -> Self {
        Self { value, region: None }
    }

    /// Attach an explicit region hint
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Canonical string used by hash-based strategies
    pub fn routing_str(&self) -> String {
        self.value.routing_str()
    }
}

impl From<&str> for ShardKey {
    fn from(s: &str) -> Self {
        Self::new(KeyValue::Str(s.to_string()))
    }
}

impl From<String> for ShardKey {
    fn from(s: String) -> Self {
        Self::new(KeyValue::Str(s))
    }
}

impl From<i64> for ShardKey {
    fn from(n: i64) -> Self {
        Self::new(KeyValue::Num(n))
    }
}

impl From<u64> for ShardKey {
    fn from(n: u64) -> Self {
        Self::new(KeyValue::Num(n as i64))
    }
}

/// Shard health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// Shard is serving traffic
    Active,
    /// Shard is unreachable or failed
    Inactive,
    /// Operator-driven maintenance window
    Maintenance,
}

impl Default for ShardStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStatus::Active => write!(f, "active"),
            ShardStatus::Inactive => write!(f, "inactive"),
            ShardStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Declared capacity limits for a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardCapacity {
    /// Maximum concurrent connections
    pub max_connections: u32,

    /// Storage budget in bytes
    pub storage_bytes: u64,

    /// Read operations per second
    pub read_ops_per_sec: u32,

    /// Write operations per second
    pub write_ops_per_sec: u32,
}

impl Default for ShardCapacity {
    fn default() -> Self {
        Self {
            max_connections: 100,
            storage_bytes: 10 * 1024 * 1024 * 1024,
            read_ops_per_sec: 5_000,
            write_ops_per_sec: 1_000,
        }
    }
}

/// Observed runtime metrics for a shard
///
/// Mutated by health monitoring; `storage_used_bytes` drives the
/// migration decision on shard removal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardMetrics {
    /// Current open connections
    pub connection_count: u32,

    /// Last observed query latency in milliseconds
    pub query_latency_ms: u64,

    /// Failed checks / total checks since registration
    pub error_rate: f64,

    /// Last health check, milliseconds since epoch
    pub last_health_check_ms: Option<u64>,

    /// Storage currently used in bytes
    pub storage_used_bytes: u64,
}

/// Information about a registered shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Unique shard identifier
    pub id: ShardId,

    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name on the shard
    pub database: String,

    /// Routing weight (higher = more virtual nodes / traffic)
    pub weight: u32,

    /// Current status
    #[serde(default)]
    pub status: ShardStatus,

    /// Region this shard belongs to (geographic strategy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Declared capacity
    #[serde(default)]
    pub capacity: ShardCapacity,

    /// Observed metrics
    #[serde(default)]
    pub metrics: ShardMetrics,
}

impl ShardInfo {
    /// Create a new shard description
    pub fn new(
        id: impl Into<ShardId>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            database: database.into(),
            weight: DEFAULT_WEIGHT,
            status: ShardStatus::Active,
            region: None,
            capacity: ShardCapacity::default(),
            metrics: ShardMetrics::default(),
        }
    }

    /// Set routing weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the shard's region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set declared capacity
    pub fn with_capacity(mut self, capacity: ShardCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Check if the shard is eligible for routing
    pub fn is_routable(&self) -> bool {
        matches!(self.status, ShardStatus::Active)
    }

    /// Storage utilization ratio (0.0 - 1.0)
    pub fn storage_ratio(&self) -> f64 {
        if self.capacity.storage_bytes == 0 {
            1.0
        } else {
            self.metrics.storage_used_bytes as f64 / self.capacity.storage_bytes as f64
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
