//! Range Sharding Strategy
//!
//! Maintains an explicit ordered table of key intervals. Validation
//! rejects overlapping intervals and shards that own no interval before
//! any routing happens. The topmost interval's upper bound is
//! effectively open: keys sorting past it still belong to the last
//! shard, so a declared maximum like `"ZZZZZZZZ"` caps the interval
//! without orphaning keys above it. Adding a shard without an explicit
//! range splits the most recently added range at its midpoint; removing
//! a shard merges its intervals into their neighbors so coverage never
//! gains a gap. Rebalancing shifts interval boundaries between existing
//! shards and never changes the shard set.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use shardkit_core::{KeyRange, ShardError, ShardId, ShardKey, ShardRange, ShardingConfig};

use super::{coefficient_of_variation, Placement, RebalanceReport, ShardingStrategy};

/// One row of the range table
#[derive(Debug, Clone)]
struct Entry {
    range: KeyRange,
    shard_id: ShardId,
    /// Registration order, drives the default-split choice
    seq: u64,
}

#[derive(Default)]
struct TableState {
    /// Sorted by range min; non-overlapping by construction
    entries: Vec<Entry>,
    next_seq: u64,
}

impl TableState {
    fn insert(&mut self, range: KeyRange, shard_id: ShardId) -> Result<(), ShardError> {
        for entry in &self.entries {
            if entry.range.overlaps(&range) {
                return Err(ShardError::OverlappingRanges {
                    a: entry.range.to_string(),
                    b: range.to_string(),
                });
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { range, shard_id, seq });
        self.entries.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        Ok(())
    }

    fn widths_per_range(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.range.width()).collect()
    }

    fn imbalance(&self) -> f64 {
        coefficient_of_variation(&self.widths_per_range())
    }
}

/// Ordered-interval strategy
pub struct RangeStrategy {
    rebalance_threshold: f64,
    state: RwLock<TableState>,
}

impl RangeStrategy {
    /// Create from explicit assignments
    pub fn new(ranges: Vec<ShardRange>, rebalance_threshold: f64) -> Result<Self, ShardError> {
        let mut state = TableState::default();
        for sr in ranges {
            state.insert(sr.range, sr.shard_id)?;
        }
        Ok(Self {
            rebalance_threshold,
            state: RwLock::new(state),
        })
    }

    /// Build from validated configuration
    pub fn from_config(config: &ShardingConfig) -> Result<Self, ShardError> {
        if config.ranges.is_empty() {
            return Err(ShardError::InvalidConfig(
                "range strategy requires explicit ranges".into(),
            ));
        }
        Self::new(config.ranges.clone(), config.rebalance_threshold)
    }

    /// Current imbalance score: coefficient of variation of range widths
    pub fn imbalance(&self) -> f64 {
        self.state.read().imbalance()
    }

    /// Snapshot of the current range table
    pub fn ranges(&self) -> Vec<ShardRange> {
        self.state
            .read()
            .entries
            .iter()
            .map(|e| ShardRange::new(e.range.clone(), e.shard_id.clone()))
            .collect()
    }
}

#[async_trait]
impl ShardingStrategy for RangeStrategy {
    fn shard_for_key(&self, key: &ShardKey) -> Result<ShardId, ShardError> {
        let state = self.state.read();
        // Entries are sorted by min; stop at the first containing range
        for entry in &state.entries {
            if entry.range.contains(&key.value) {
                trace!(key = %key.routing_str(), shard_id = %entry.shard_id, "Range lookup");
                return Ok(entry.shard_id.clone());
            }
        }
        // The topmost interval is open above: keys at or past its min
        // belong to it even beyond the declared max. Interior gaps and
        // keys below the table's minimum stay fatal.
        if let Some(last) = state.entries.last() {
            if key.value >= last.range.min {
                trace!(key = %key.routing_str(), shard_id = %last.shard_id, "Range lookup (open top)");
                return Ok(last.shard_id.clone());
            }
        }
        Err(ShardError::NoShardFound {
            key: key.routing_str(),
        })
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        let state = self.state.read();
        let mut ids: Vec<ShardId> = state.entries.iter().map(|e| e.shard_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn add_shard(&self, shard_id: &str, placement: Option<Placement>) -> Result<(), ShardError> {
        let mut state = self.state.write();
        if state.entries.iter().any(|e| e.shard_id == shard_id) {
            return Err(ShardError::ShardAlreadyExists(shard_id.to_string()));
        }

        match placement {
            Some(Placement::Range(range)) => {
                state.insert(range, shard_id.to_string())?;
            }
            Some(Placement::Region(_)) => {
                return Err(ShardError::InvalidConfig(
                    "range strategy does not accept a region placement".into(),
                ));
            }
            // A weight hint carries no meaning for interval ownership
            None | Some(Placement::Weight(_)) => {
                // Split the most recently added range at its midpoint;
                // the new shard takes the upper half.
                let idx = state
                    .entries
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, e)| e.seq)
                    .map(|(i, _)| i)
                    .ok_or_else(|| {
                        ShardError::InvalidConfig("no existing range to split".into())
                    })?;
                let mid = state.entries[idx].range.midpoint()?;
                let upper = KeyRange::new(mid.clone(), state.entries[idx].range.max.clone())?;
                state.entries[idx].range.max = mid;
                state.insert(upper, shard_id.to_string())?;
            }
        }
        debug!(shard_id = %shard_id, ranges = state.entries.len(), "Shard added to range table");
        Ok(())
    }

    fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError> {
        let mut state = self.state.write();
        if !state.entries.iter().any(|e| e.shard_id == shard_id) {
            return Err(ShardError::ShardNotFound(shard_id.to_string()));
        }

        // Merge each removed interval into its left neighbor, or the
        // right neighbor for the leftmost entry, so coverage holds.
        while let Some(idx) = state.entries.iter().position(|e| e.shard_id == shard_id) {
            let removed = state.entries.remove(idx);
            if state.entries.is_empty() {
                break;
            }
            if idx > 0 {
                state.entries[idx - 1].range.max = removed.range.max;
            } else {
                state.entries[0].range.min = removed.range.min;
            }
        }
        debug!(shard_id = %shard_id, ranges = state.entries.len(), "Shard removed from range table");
        Ok(())
    }

    /// Shift interval boundaries from the widest range toward its
    /// narrower neighbor when imbalance exceeds the configured
    /// threshold. The shard set never changes here; only ownership of
    /// key sub-ranges moves between shards that already exist.
    async fn rebalance(&self) -> Result<RebalanceReport, ShardError> {
        let mut state = self.state.write();
        let before = state.imbalance();
        if before <= self.rebalance_threshold || state.entries.len() < 2 {
            return Ok(RebalanceReport::noop(before));
        }

        let mut moved = 0usize;
        let mut current = before;
        for _ in 0..state.entries.len() {
            let widest = match state
                .entries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.range
                        .width()
                        .partial_cmp(&b.range.width())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
            {
                Some(i) => i,
                None => break,
            };

            // Adjacent entry that absorbs the widest range's upper or
            // lower half: prefer the narrower side
            let prev = widest.checked_sub(1);
            let next = (widest + 1 < state.entries.len()).then_some(widest + 1);
            let neighbor = match (prev, next) {
                (Some(p), Some(n)) => {
                    if state.entries[p].range.width() <= state.entries[n].range.width() {
                        p
                    } else {
                        n
                    }
                }
                (Some(p), None) => p,
                (None, Some(n)) => n,
                (None, None) => break,
            };

            let mid = match state.entries[widest].range.midpoint() {
                Ok(mid) => mid,
                // Too narrow to split further
                Err(_) => break,
            };
            let donor = state.entries[widest].shard_id.clone();
            let recipient = state.entries[neighbor].shard_id.clone();
            if neighbor > widest {
                state.entries[widest].range.max = mid.clone();
                state.entries[neighbor].range.min = mid;
            } else {
                state.entries[widest].range.min = mid.clone();
                state.entries[neighbor].range.max = mid;
            }
            moved += 1;
            info!(donor = %donor, recipient = %recipient, "Range boundary shifted");

            let now = state.imbalance();
            if now >= current || now <= self.rebalance_threshold {
                current = now;
                break;
            }
            current = now;
        }

        let after = state.imbalance();
        info!(
            moved,
            imbalance_before = before,
            imbalance_after = after,
            "Range table rebalanced"
        );
        Ok(RebalanceReport {
            moved,
            imbalance_before: before,
            imbalance_after: after,
        })
    }

    fn name(&self) -> &'static str {
        "Range"
    }
}
