//! Geographic Sharding Strategy
//!
//! Shards are grouped into named regions. A key's region comes from its
//! explicit region hint, from a colon prefix that names a known region
//! (`"us:42"`), or from the configured default region. Within a region
//! the key hashes onto one of the region's shards.
//!
//! Every registered shard belongs to exactly one region; a region with
//! live shards cannot be removed.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace, warn};

use shardkit_core::{HashFunction, KeyValue, ShardError, ShardId, ShardKey, ShardingConfig};

use super::{hash_bytes, Placement, RebalanceReport, ShardingStrategy};

#[derive(Default)]
struct GeoState {
    /// region -> shards, BTreeMap for a deterministic fallback order
    regions: BTreeMap<String, Vec<ShardId>>,
    /// Reverse index, kept consistent with `regions`
    shard_region: HashMap<ShardId, String>,
}

impl GeoState {
    fn insert(&mut self, shard_id: ShardId, region: String) {
        self.regions
            .entry(region.clone())
            .or_default()
            .push(shard_id.clone());
        self.shard_region.insert(shard_id, region);
    }

    fn remove(&mut self, shard_id: &str) -> Option<String> {
        let region = self.shard_region.remove(shard_id)?;
        if let Some(shards) = self.regions.get_mut(&region) {
            shards.retain(|s| s != shard_id);
        }
        Some(region)
    }
}

/// Region-bucketed strategy
pub struct GeographicStrategy {
    func: HashFunction,
    default_region: Option<String>,
    /// Backup regions per region, in preference order
    failover_regions: HashMap<String, Vec<String>>,
    state: RwLock<GeoState>,
}

impl GeographicStrategy {
    /// Create with no shards registered
    pub fn new(
        func: HashFunction,
        default_region: Option<String>,
        failover_regions: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            func,
            default_region,
            failover_regions,
            state: RwLock::new(GeoState::default()),
        }
    }

    /// Build from validated configuration (every shard carries a region)
    pub fn from_config(config: &ShardingConfig) -> Result<Self, ShardError> {
        let strategy = Self::new(
            config.hash_function,
            config.default_region.clone(),
            config.failover_regions.clone(),
        );
        {
            let mut state = strategy.state.write();
            for shard in &config.shards {
                let region = shard.region.clone().ok_or_else(|| {
                    ShardError::InvalidConfig(format!("shard {} has no region", shard.id))
                })?;
                state.insert(shard.id.clone(), region);
            }
        }
        Ok(strategy)
    }

    /// Resolve the region a key belongs to
    fn region_for_key(&self, state: &GeoState, key: &ShardKey) -> Result<String, ShardError> {
        if let Some(region) = &key.region {
            if !state.regions.contains_key(region) {
                return Err(ShardError::RegionNotFound(region.clone()));
            }
            return Ok(region.clone());
        }

        // Colon-prefixed string keys carry their region inline
        if let KeyValue::Str(s) = &key.value {
            if let Some((prefix, _)) = s.split_once(':') {
                if state.regions.contains_key(prefix) {
                    return Ok(prefix.to_string());
                }
            }
        }

        if let Some(default) = &self.default_region {
            if state.regions.contains_key(default) {
                return Ok(default.clone());
            }
        }

        // Last resort: first region in sorted order, so region-less keys
        // still route deterministically
        state
            .regions
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| ShardError::NoShardFound {
                key: key.routing_str(),
            })
    }

    /// Region of a registered shard
    pub fn region_of(&self, shard_id: &str) -> Option<String> {
        self.state.read().shard_region.get(shard_id).cloned()
    }

    /// All registered regions
    pub fn regions(&self) -> Vec<String> {
        self.state.read().regions.keys().cloned().collect()
    }

    /// Register an empty region
    pub fn add_region(&self, region: impl Into<String>) {
        let region = region.into();
        let mut state = self.state.write();
        state.regions.entry(region.clone()).or_default();
        debug!(region = %region, "Region registered");
    }

    /// Remove a region; fails while it still owns shards
    pub fn remove_region(&self, region: &str) -> Result<(), ShardError> {
        let mut state = self.state.write();
        match state.regions.get(region) {
            None => Err(ShardError::RegionNotFound(region.to_string())),
            Some(shards) if !shards.is_empty() => Err(ShardError::RegionNotEmpty {
                region: region.to_string(),
                shard_count: shards.len(),
            }),
            Some(_) => {
                state.regions.remove(region);
                debug!(region = %region, "Region removed");
                Ok(())
            }
        }
    }

    /// Failover shard ids for a failed region
    ///
    /// Drawn from the configured failover regions in preference order;
    /// falls back to any other region that still has shards.
    pub fn failover_targets(&self, region: &str) -> Vec<ShardId> {
        let state = self.state.read();
        let mut targets = Vec::new();

        if let Some(backups) = self.failover_regions.get(region) {
            for backup in backups {
                if let Some(shards) = state.regions.get(backup) {
                    targets.extend(shards.iter().cloned());
                }
            }
        }

        if targets.is_empty() {
            warn!(region = %region, "No configured failover region has capacity, using any region");
            for (name, shards) in &state.regions {
                if name != region {
                    targets.extend(shards.iter().cloned());
                }
            }
        }
        targets
    }

    /// Failover targets for a single failed shard, via its region
    pub fn failover_targets_for_shard(&self, shard_id: &str) -> Vec<ShardId> {
        match self.region_of(shard_id) {
            Some(region) => self
                .failover_targets(&region)
                .into_iter()
                .filter(|id| id != shard_id)
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl ShardingStrategy for GeographicStrategy {
    fn shard_for_key(&self, key: &ShardKey) -> Result<ShardId, ShardError> {
        let state = self.state.read();
        let region = self.region_for_key(&state, key)?;
        let shards = state
            .regions
            .get(&region)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ShardError::NoShardFound {
                key: key.routing_str(),
            })?;

        let hash = hash_bytes(self.func, key.routing_str().as_bytes());
        let idx = (hash % shards.len() as u64) as usize;
        trace!(key = %key.routing_str(), region = %region, shard_id = %shards[idx], "Region lookup");
        Ok(shards[idx].clone())
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        let state = self.state.read();
        let mut ids: Vec<ShardId> = state.shard_region.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn add_shard(&self, shard_id: &str, placement: Option<Placement>) -> Result<(), ShardError> {
        let region = match placement {
            Some(Placement::Region(region)) => region,
            Some(Placement::Range(_)) => {
                return Err(ShardError::InvalidConfig(
                    "geographic strategy does not accept a range placement".into(),
                ));
            }
            // A weight hint does not pick a region; fall through to the
            // default placement
            None | Some(Placement::Weight(_)) => {
                let state = self.state.read();
                self.default_region
                    .clone()
                    .filter(|r| state.regions.contains_key(r))
                    .or_else(|| state.regions.keys().next().cloned())
                    .ok_or_else(|| {
                        ShardError::InvalidConfig("no region available for placement".into())
                    })?
            }
        };

        let mut state = self.state.write();
        if state.shard_region.contains_key(shard_id) {
            return Err(ShardError::ShardAlreadyExists(shard_id.to_string()));
        }
        state.insert(shard_id.to_string(), region.clone());
        debug!(shard_id = %shard_id, region = %region, "Shard added to region");
        Ok(())
    }

    fn remove_shard(&self, shard_id: &str) -> Result<(), ShardError> {
        let mut state = self.state.write();
        match state.remove(shard_id) {
            Some(region) => {
                debug!(shard_id = %shard_id, region = %region, "Shard removed from region");
                Ok(())
            }
            None => Err(ShardError::ShardNotFound(shard_id.to_string())),
        }
    }

    /// Move shards from over-populated regions toward under-populated
    /// ones until per-region counts differ by at most one
    async fn rebalance(&self) -> Result<RebalanceReport, ShardError> {
        let mut state = self.state.write();
        let counts: Vec<f64> = state.regions.values().map(|s| s.len() as f64).collect();
        let before = super::coefficient_of_variation(&counts);
        if state.regions.len() < 2 {
            return Ok(RebalanceReport::noop(before));
        }

        let mut moved = 0usize;
        loop {
            let (max_region, max_count) = match state
                .regions
                .iter()
                .max_by_key(|(_, s)| s.len())
                .map(|(r, s)| (r.clone(), s.len()))
            {
                Some(v) => v,
                None => break,
            };
            let (min_region, min_count) = match state
                .regions
                .iter()
                .min_by_key(|(_, s)| s.len())
                .map(|(r, s)| (r.clone(), s.len()))
            {
                Some(v) => v,
                None => break,
            };
            if max_count <= min_count + 1 {
                break;
            }

            let shard = match state.regions.get_mut(&max_region).and_then(|s| s.pop()) {
                Some(shard) => shard,
                None => break,
            };
            if let Some(bucket) = state.regions.get_mut(&min_region) {
                bucket.push(shard.clone());
            }
            state.shard_region.insert(shard.clone(), min_region.clone());
            moved += 1;
            info!(shard_id = %shard, from = %max_region, to = %min_region, "Shard reassigned");
        }

        let counts: Vec<f64> = state.regions.values().map(|s| s.len() as f64).collect();
        let after = super::coefficient_of_variation(&counts);
        Ok(RebalanceReport {
            moved,
            imbalance_before: before,
            imbalance_after: after,
        })
    }

    fn name(&self) -> &'static str {
        "Geographic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkit_core::{ShardInfo, ShardingConfig, StrategyKind};

    fn two_region_strategy() -> GeographicStrategy {
        let shards = vec![
            ShardInfo::new("us-1", "127.0.0.1", 5432, "app").with_region("us"),
            ShardInfo::new("us-2", "127.0.0.1", 5433, "app").with_region("us"),
            ShardInfo::new("eu-1", "127.0.0.1", 5434, "app").with_region("eu"),
        ];
        let mut config = ShardingConfig::new(StrategyKind::Geographic, shards);
        config.default_region = Some("us".into());
        GeographicStrategy::from_config(&config).unwrap()
    }

    #[test]
    fn test_colon_prefix_routes_into_region() {
        let s = two_region_strategy();
        let shard = s.shard_for_key(&"us:42".into()).unwrap();
        assert!(shard.starts_with("us-"), "expected a us shard, got {}", shard);

        let shard = s.shard_for_key(&"eu:42".into()).unwrap();
        assert_eq!(shard, "eu-1");
    }

    #[test]
    fn test_explicit_region_hint() {
        let s = two_region_strategy();
        let key = ShardKey::from("42").with_region("eu");
        assert_eq!(s.shard_for_key(&key).unwrap(), "eu-1");
    }

    #[test]
    fn test_unknown_explicit_region_fails() {
        let s = two_region_strategy();
        let key = ShardKey::from("42").with_region("apac");
        assert!(matches!(
            s.shard_for_key(&key),
            Err(ShardError::RegionNotFound(_))
        ));
    }

    #[test]
    fn test_default_region_fallback() {
        let s = two_region_strategy();
        // No hint, no known prefix: lands in the default region
        let shard = s.shard_for_key(&"plain-key".into()).unwrap();
        assert!(shard.starts_with("us-"));
    }

    #[test]
    fn test_deterministic() {
        let s = two_region_strategy();
        let key: ShardKey = "us:alice".into();
        assert_eq!(s.shard_for_key(&key).unwrap(), s.shard_for_key(&key).unwrap());
    }

    #[test]
    fn test_coverage_property() {
        let s = two_region_strategy();
        for i in 0..300 {
            // Mixed keys: prefixed and plain, all must resolve
            let key = if i % 3 == 0 {
                format!("eu:item-{}", i)
            } else {
                format!("item-{}", i)
            };
            s.shard_for_key(&key.as_str().into()).unwrap();
        }
    }

    #[test]
    fn test_every_shard_has_one_region() {
        let s = two_region_strategy();
        for id in s.shard_ids() {
            assert!(s.region_of(&id).is_some());
        }
        assert_eq!(s.region_of("us-1").as_deref(), Some("us"));
    }

    #[test]
    fn test_remove_region_with_shards_fails() {
        let s = two_region_strategy();
        assert!(matches!(
            s.remove_region("eu"),
            Err(ShardError::RegionNotEmpty { .. })
        ));

        s.remove_shard("eu-1").unwrap();
        s.remove_region("eu").unwrap();
        assert!(matches!(
            s.remove_region("eu"),
            Err(ShardError::RegionNotFound(_))
        ));
    }

    #[test]
    fn test_failover_prefers_configured_regions() {
        let shards = vec![
            ShardInfo::new("us-1", "127.0.0.1", 5432, "app").with_region("us"),
            ShardInfo::new("eu-1", "127.0.0.1", 5433, "app").with_region("eu"),
            ShardInfo::new("ap-1", "127.0.0.1", 5434, "app").with_region("apac"),
        ];
        let mut config = ShardingConfig::new(StrategyKind::Geographic, shards);
        config
            .failover_regions
            .insert("us".into(), vec!["eu".into()]);
        let s = GeographicStrategy::from_config(&config).unwrap();

        assert_eq!(s.failover_targets("us"), vec!["eu-1".to_string()]);
        // No failover configured for eu: any other region with shards
        let fallback = s.failover_targets("eu");
        assert!(fallback.contains(&"us-1".to_string()));
        assert!(fallback.contains(&"ap-1".to_string()));
    }

    #[test]
    fn test_failover_for_shard_excludes_itself() {
        let s = two_region_strategy();
        let targets = s.failover_targets_for_shard("us-1");
        assert!(!targets.contains(&"us-1".to_string()));
    }

    #[test]
    fn test_add_shard_default_placement() {
        let s = two_region_strategy();
        s.add_shard("us-3", None).unwrap();
        assert_eq!(s.region_of("us-3").as_deref(), Some("us"));

        s.add_shard("eu-2", Some(Placement::Region("eu".into()))).unwrap();
        assert_eq!(s.region_of("eu-2").as_deref(), Some("eu"));
    }

    #[tokio::test]
    async fn test_rebalance_evens_region_counts() {
        let shards = vec![
            ShardInfo::new("us-1", "127.0.0.1", 5432, "app").with_region("us"),
            ShardInfo::new("us-2", "127.0.0.1", 5433, "app").with_region("us"),
            ShardInfo::new("us-3", "127.0.0.1", 5434, "app").with_region("us"),
            ShardInfo::new("us-4", "127.0.0.1", 5435, "app").with_region("us"),
            ShardInfo::new("eu-1", "127.0.0.1", 5436, "app").with_region("eu"),
        ];
        let config = ShardingConfig::new(StrategyKind::Geographic, shards);
        let s = GeographicStrategy::from_config(&config).unwrap();

        let report = s.rebalance().await.unwrap();
        assert!(report.moved >= 1);
        assert!(report.imbalance_after < report.imbalance_before);

        // Counts now differ by at most one
        let per_region: Vec<usize> = s
            .regions()
            .iter()
            .map(|r| {
                s.shard_ids()
                    .iter()
                    .filter(|id| s.region_of(id).as_deref() == Some(r.as_str()))
                    .count()
            })
            .collect();
        let max = per_region.iter().max().unwrap();
        let min = per_region.iter().min().unwrap();
        assert!(max - min <= 1);
    }
}
