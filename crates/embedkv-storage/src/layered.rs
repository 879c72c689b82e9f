//! Layered storage: composes up to three tiers and routes lookups,
//! promotions and evictions between them.
//!
//! Lookups walk tiers top to bottom. A hit below the top tier is tagged
//! with an explicit [`CopyBackHint`] and promoted by copy-then-publish:
//! a fresh slot is allocated from the top tier's pool, header and
//! payload are copied, and the slot is published with `try_insert`. If
//! the publish loses a race the fresh slot goes back to the pool and
//! the winner is used. The source tier's entry is unpublished either
//! way, keeping the per-tier id sets disjoint.
//!
//! Eviction runs on the background [`EvictionManager`]
//! (crate::evictor::EvictionManager): when a tier's cache outgrows its
//! slot budget, the coldest ids are moved down one tier in batches.

use std::sync::Arc;

use embedkv_core::config::{StorageConfig, StorageType};
use embedkv_core::error::{Result, StoreError};
use embedkv_table::cache::{create_cache, BatchCache};
use embedkv_table::{MemoryPool, SlotHandle, TierTag};

use crate::ssd_log::{SsdLog, SsdLogOptions};
use crate::tier::{MemTier, ShrinkPolicy, SsdTier, TierStorage};

/// How a lookup hit below the top tier must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyBackHint {
    /// Hit in the top tier; nothing to do.
    None,
    /// Hit in an in-memory lower tier: copy the slot up.
    CopyBack,
    /// Hit in the SSD tier: copy the transient slot up, then destroy it.
    CopyBackAndDestroy,
}

/// Pool block growth, in buffers.
const POOL_BLOCK_SIZE: usize = 512;

/// The tier stack behind one embedding variable.
pub struct LayeredStorage {
    tiers: Vec<Arc<dyn TierStorage>>,
    /// Tracks top-tier residency; drives eviction out of tier 0.
    cache: Box<dyn BatchCache>,
    /// Tracks tier 1 residency in three-tier stacks.
    dram_cache: Option<Box<dyn BatchCache>>,
    /// Per-tier slot budgets derived from the configured byte sizes.
    capacities: Vec<usize>,
    eviction_batch_size: usize,
    eviction_interval: std::time::Duration,
    storage_type: StorageType,
}

impl LayeredStorage {
    /// Builds the tier stack described by `config` for payloads of
    /// `total_dims` floats.
    pub fn new(config: &StorageConfig, total_dims: usize) -> Result<Self> {
        config.validate()?;
        if total_dims == 0 {
            return Err(StoreError::invalid_argument("total_dims must be non-zero"));
        }

        let total_bytes = total_dims * std::mem::size_of::<f32>();
        let slot_budget = |bytes: usize| (bytes / total_bytes).max(1);

        let mut tiers: Vec<Arc<dyn TierStorage>> = Vec::new();
        let mut capacities = Vec::new();

        match config.storage_type {
            StorageType::Dram => {
                let pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                tiers.push(Arc::new(MemTier::new(TierTag::Dram, pool, total_dims)));
                capacities.push(slot_budget(config.size[0]));
            }
            StorageType::DramSsd => {
                let pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                tiers.push(Arc::new(MemTier::new(TierTag::Dram, pool, total_dims)));
                tiers.push(Self::build_ssd_tier(config, total_dims)?);
                capacities.push(slot_budget(config.size[0]));
                capacities.push(usize::MAX);
            }
            StorageType::HbmDram => {
                let hbm_pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                let dram_pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                tiers.push(Arc::new(MemTier::new(TierTag::Hbm, hbm_pool, total_dims)));
                tiers.push(Arc::new(MemTier::new(TierTag::Dram, dram_pool, total_dims)));
                capacities.push(slot_budget(config.size[0]));
                capacities.push(slot_budget(config.size[1]));
            }
            StorageType::HbmDramSsd => {
                let hbm_pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                let dram_pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
                tiers.push(Arc::new(MemTier::new(TierTag::Hbm, hbm_pool, total_dims)));
                tiers.push(Arc::new(MemTier::new(TierTag::Dram, dram_pool, total_dims)));
                tiers.push(Self::build_ssd_tier(config, total_dims)?);
                capacities.push(slot_budget(config.size[0]));
                capacities.push(slot_budget(config.size[1]));
                capacities.push(usize::MAX);
            }
        }

        let dram_cache = if tiers.len() >= 3 {
            Some(create_cache(config.cache_strategy))
        } else {
            None
        };

        Ok(Self {
            tiers,
            cache: create_cache(config.cache_strategy),
            dram_cache,
            capacities,
            eviction_batch_size: config.eviction_batch_size,
            eviction_interval: std::time::Duration::from_millis(config.eviction_interval_ms),
            storage_type: config.storage_type,
        })
    }

    /// The configured period of the background eviction sweep.
    pub fn eviction_interval(&self) -> std::time::Duration {
        self.eviction_interval
    }

    fn build_ssd_tier(config: &StorageConfig, total_dims: usize) -> Result<Arc<dyn TierStorage>> {
        let log = SsdLog::open(
            &config.path,
            total_dims,
            SsdLogOptions {
                segment_bytes: config.segment_bytes,
                compaction_threshold: config.compaction_threshold,
                max_sealed_segments: config.max_sealed_segments,
                io_scheme: config.io_scheme,
                compaction_mode: config.compaction_mode,
            },
        )?;
        let pool = Arc::new(MemoryPool::new(total_dims, POOL_BLOCK_SIZE));
        Ok(Arc::new(SsdTier::new(log, pool)))
    }

    /// The configured tier stack.
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// Number of tiers.
    pub fn num_tiers(&self) -> usize {
        self.tiers.len()
    }

    /// Direct access to one tier.
    pub fn tier(&self, level: usize) -> &Arc<dyn TierStorage> {
        &self.tiers[level]
    }

    /// Slot budget of one tier.
    pub fn capacity(&self, level: usize) -> usize {
        self.capacities[level]
    }

    /// Total resident ids across all tiers.
    pub fn size(&self) -> usize {
        self.tiers.iter().map(|t| t.size()).sum()
    }

    /// Resident ids in one tier.
    pub fn size_level(&self, level: usize) -> usize {
        self.tiers.get(level).map_or(0, |t| t.size())
    }

    /// Which tier currently owns `key`.
    pub fn lookup_tier(&self, key: i64) -> Option<usize> {
        self.tiers.iter().position(|t| t.contains(key))
    }

    /// Walks tiers top to bottom; a hit below the top is returned with
    /// the copy-back hint the caller must honor.
    pub fn get(&self, key: i64) -> Option<(SlotHandle, CopyBackHint)> {
        self.get_with_tier(key)
            .map(|(handle, hint, _)| (handle, hint))
    }

    fn get_with_tier(&self, key: i64) -> Option<(SlotHandle, CopyBackHint, usize)> {
        for (level, tier) in self.tiers.iter().enumerate() {
            if let Some(handle) = tier.get(key) {
                let hint = if level == 0 {
                    CopyBackHint::None
                } else if tier.tier_tag() == TierTag::Ssd {
                    CopyBackHint::CopyBackAndDestroy
                } else {
                    CopyBackHint::CopyBack
                };
                return Some((handle, hint, level));
            }
        }
        None
    }

    /// Looks up `key`, promoting a lower-tier hit into the top tier.
    /// The returned handle is always top-tier resident.
    pub fn get_or_promote(&self, key: i64) -> Option<SlotHandle> {
        let (handle, hint, level) = self.get_with_tier(key)?;
        match hint {
            CopyBackHint::None => Some(handle),
            CopyBackHint::CopyBack | CopyBackHint::CopyBackAndDestroy => {
                Some(self.promote(key, handle, level))
            }
        }
    }

    /// Batch lookup with promotion; misses stay `None` for the caller
    /// to create (or filter) per its admission policy.
    pub fn batch_get_or_promote(&self, keys: &[i64]) -> Vec<Option<SlotHandle>> {
        keys.iter().map(|&key| self.get_or_promote(key)).collect()
    }

    /// Copy-back promotion: allocate at tier 0, copy header and payload,
    /// publish, resolve the race, and unpublish the source.
    fn promote(&self, key: i64, source: SlotHandle, source_level: usize) -> SlotHandle {
        let top = &self.tiers[0];
        let fresh = top.create_slot(key);
        fresh.copy_header_from(source.slot());
        fresh.copy_payload_from(source.slot());

        let winner = match top.try_insert(key, fresh) {
            Ok(()) => fresh,
            Err(winner) => {
                // Lost the publish race; the winner already promoted.
                top.destroy_slot(fresh);
                winner
            }
        };

        let source_tier = &self.tiers[source_level];
        if source_tier.tier_tag() == TierTag::Ssd {
            source_tier.remove(key);
            source_tier.destroy_slot(source);
        } else if let Some(published) = source_tier.remove(key) {
            source_tier.destroy_slot(published);
        }

        winner
    }

    /// Creates and publishes a zeroed slot for `key` at the top tier.
    /// On a publish race the fresh slot is returned to the pool and the
    /// winner's handle is used.
    pub fn create(&self, key: i64) -> SlotHandle {
        let top = &self.tiers[0];
        let fresh = top.create_slot(key);
        match top.try_insert(key, fresh) {
            Ok(()) => fresh,
            Err(winner) => {
                top.destroy_slot(fresh);
                winner
            }
        }
    }

    /// Records an access for eviction ranking.
    pub fn touch(&self, key: i64, count: i64) {
        self.cache.touch(key, count);
    }

    /// Records a batch of accesses in sequence order.
    pub fn touch_batch(&self, keys: &[i64]) {
        self.cache.update(keys);
    }

    /// Seeds the eviction ranking with ids expected to be hot soon.
    pub fn add_to_prefetch_list(&self, keys: &[i64]) {
        self.cache.add_to_prefetch_list(keys);
    }

    /// Commits prefetched ids as cache members.
    pub fn add_to_cache(&self, keys: &[i64]) {
        self.cache.add_to_cache(keys);
    }

    /// The cache ranking top-tier residency.
    pub fn cache(&self) -> &dyn BatchCache {
        self.cache.as_ref()
    }

    /// Removes `key` from every tier.
    pub fn remove(&self, key: i64) -> bool {
        let mut found = false;
        for tier in &self.tiers {
            if tier.tier_tag() == TierTag::Ssd {
                if tier.contains(key) {
                    tier.remove(key);
                    found = true;
                }
            } else if let Some(handle) = tier.remove(key) {
                tier.destroy_slot(handle);
                found = true;
            }
        }
        found
    }

    /// One eviction sweep: moves up to `eviction_batch_size` victims
    /// down each over-budget tier transition. Returns how many slots
    /// moved.
    pub fn evict_once(&self) -> Result<usize> {
        let mut moved = 0;

        if self.tiers.len() >= 2 {
            let over = self.cache.size().saturating_sub(self.capacities[0]);
            if over > 0 {
                let k = over.min(self.eviction_batch_size);
                let victims = self.cache.get_evict_ids(k);
                moved += self.demote(0, &victims)?;
                if let Some(dram_cache) = &self.dram_cache {
                    dram_cache.update(&victims);
                }
            }
        }

        if let Some(dram_cache) = &self.dram_cache {
            let over = dram_cache.size().saturating_sub(self.capacities[1]);
            if over > 0 {
                let k = over.min(self.eviction_batch_size);
                let victims = dram_cache.get_evict_ids(k);
                moved += self.demote(1, &victims)?;
            }
        }

        Ok(moved)
    }

    /// Moves `victims` from `level` to `level + 1` by batch commit.
    fn demote(&self, level: usize, victims: &[i64]) -> Result<usize> {
        let upper = &self.tiers[level];
        let lower = &self.tiers[level + 1];

        let mut entries = Vec::with_capacity(victims.len());
        for &key in victims {
            // Ids evicted from the cache may have been removed or
            // shrunk since their last touch.
            if let Some(handle) = upper.get(key) {
                entries.push((key, handle));
            }
        }
        if entries.is_empty() {
            return Ok(0);
        }

        lower.batch_commit(&entries)?;

        let mut moved = 0;
        for (key, _) in &entries {
            if let Some(published) = upper.remove(*key) {
                upper.destroy_slot(published);
                moved += 1;
            }
        }
        tracing::debug!(level, moved, "eviction batch demoted");
        Ok(moved)
    }

    /// Runs eviction sweeps until every tracked tier is within budget.
    /// Used by restore and by tests; the background task calls
    /// [`LayeredStorage::evict_once`] instead.
    pub fn evict_to_capacity(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let moved = self.evict_once()?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Snapshot of all in-memory resident entries, top tier first. The
    /// SSD remainder is enumerated lazily via [`LayeredStorage::ssd_keys`].
    pub fn snapshot_memory(&self) -> Vec<(i64, SlotHandle)> {
        let mut out = Vec::new();
        for tier in &self.tiers {
            if tier.tier_tag() != TierTag::Ssd {
                out.extend(tier.snapshot());
            }
        }
        out
    }

    /// Ids resident only on SSD.
    pub fn ssd_keys(&self) -> Vec<i64> {
        self.tiers
            .iter()
            .find(|t| t.tier_tag() == TierTag::Ssd)
            .map(|t| t.keys())
            .unwrap_or_default()
    }

    /// The SSD tier, if this stack has one.
    pub fn ssd_tier(&self) -> Option<&Arc<dyn TierStorage>> {
        self.tiers.iter().find(|t| t.tier_tag() == TierTag::Ssd)
    }

    /// Applies a shrink policy to every tier under per-tier exclusive
    /// iteration; returns the number of removed ids.
    pub fn shrink(&self, policy: &ShrinkPolicy) -> Result<usize> {
        let mut removed = 0;
        for tier in &self.tiers {
            removed += tier.shrink(policy)?;
        }
        if removed > 0 {
            tracing::info!(removed, "shrink pass removed ids");
        }
        Ok(removed)
    }

    /// Flushes SSD state.
    pub fn flush(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LayeredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: Vec<usize> = self.tiers.iter().map(|t| t.size()).collect();
        f.debug_struct("LayeredStorage")
            .field("storage_type", &self.storage_type)
            .field("sizes", &sizes)
            .field("capacities", &self.capacities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedkv_core::config::{CacheStrategy, CompactionMode, IoScheme};
    use tempfile::tempdir;

    const DIMS: usize = 4;

    fn dram_config(slots: usize) -> StorageConfig {
        let mut config = StorageConfig::new(StorageType::Dram, "");
        config.size[0] = slots * DIMS * 4;
        config
    }

    fn dram_ssd_config(dir: &std::path::Path, slots: usize) -> StorageConfig {
        let mut config = StorageConfig::new(StorageType::DramSsd, dir)
            .with_compaction_mode(CompactionMode::Sync)
            .with_io_scheme(IoScheme::Mmap)
            .with_cache_strategy(CacheStrategy::Lru);
        config.size[0] = slots * DIMS * 4;
        config
    }

    #[test]
    fn test_dram_only_create_and_get() {
        let storage = LayeredStorage::new(&dram_config(64), DIMS).unwrap();
        assert_eq!(storage.num_tiers(), 1);

        let handle = storage.create(5);
        handle.write_payload(0, &[5.0; DIMS]);
        storage.touch(5, 1);

        let (found, hint) = storage.get(5).unwrap();
        assert_eq!(hint, CopyBackHint::None);
        assert_eq!(found.payload(), &[5.0; DIMS]);
        assert_eq!(storage.size(), 1);
        assert_eq!(storage.lookup_tier(5), Some(0));
        assert!(storage.get(6).is_none());
    }

    #[test]
    fn test_create_race_returns_single_slot() {
        let storage = Arc::new(LayeredStorage::new(&dram_config(4096), DIMS).unwrap());
        let mut threads = Vec::new();
        for _ in 0..4 {
            let storage = Arc::clone(&storage);
            threads.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();
                for key in 0..500 {
                    ptrs.push(storage.create(key).as_ptr() as usize);
                }
                ptrs
            }));
        }
        let results: Vec<Vec<usize>> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        // Every thread resolved to the same winning slot per key.
        for key in 0..500 {
            let first = results[0][key];
            for result in &results {
                assert_eq!(result[key], first);
            }
        }
        assert_eq!(storage.size(), 500);
    }

    #[test]
    fn test_eviction_moves_cold_ids_to_ssd() {
        let dir = tempdir().unwrap();
        let storage = LayeredStorage::new(&dram_ssd_config(dir.path(), 4), DIMS).unwrap();

        for key in 0..10 {
            let handle = storage.create(key);
            handle.write_payload(0, &[key as f32; DIMS]);
            handle.update_version(key);
            storage.touch(key, 1);
        }
        assert_eq!(storage.size_level(0), 10);

        storage.evict_to_capacity().unwrap();

        // Budget is 4 slots; the 6 coldest ids moved to SSD.
        assert_eq!(storage.size_level(0), 4);
        assert_eq!(storage.size_level(1), 6);
        for key in 0..6 {
            assert_eq!(storage.lookup_tier(key), Some(1), "key {key}");
        }
        for key in 6..10 {
            assert_eq!(storage.lookup_tier(key), Some(0), "key {key}");
        }
        assert_eq!(storage.size(), 10);
    }

    #[test]
    fn test_promotion_from_ssd_preserves_state_and_disjointness() {
        let dir = tempdir().unwrap();
        let storage = LayeredStorage::new(&dram_ssd_config(dir.path(), 4), DIMS).unwrap();

        for key in 0..10 {
            let handle = storage.create(key);
            handle.write_payload(0, &[key as f32; DIMS]);
            handle.update_version(key);
            handle.add_frequency(key + 1, 1000);
            storage.touch(key, 1);
        }
        storage.evict_to_capacity().unwrap();
        assert_eq!(storage.lookup_tier(0), Some(1));

        // A lower-tier hit carries the destroy-after-copy hint.
        let (transient, hint) = storage.get(0).unwrap();
        assert_eq!(hint, CopyBackHint::CopyBackAndDestroy);
        storage.ssd_tier().unwrap().destroy_slot(transient);

        let promoted = storage.get_or_promote(0).unwrap();
        assert_eq!(promoted.payload(), &[0.0; DIMS]);
        assert_eq!(promoted.version(), 0);
        assert_eq!(promoted.frequency(), 1);
        assert_eq!(promoted.tier_tag(), TierTag::Dram);

        // Disjointness: the id now lives in exactly one tier.
        assert_eq!(storage.lookup_tier(0), Some(0));
        assert_eq!(storage.size_level(1), 5);
        assert_eq!(storage.size(), 10);
    }

    #[test]
    fn test_hbm_dram_eviction() {
        let mut config = StorageConfig::new(StorageType::HbmDram, "");
        config.size[0] = 4 * DIMS * 4;
        config.size[1] = 1 << 20;
        let storage = LayeredStorage::new(&config, DIMS).unwrap();
        assert_eq!(storage.num_tiers(), 2);

        for key in 0..12 {
            let handle = storage.create(key);
            handle.write_payload(0, &[key as f32; DIMS]);
            storage.touch(key, 1);
        }
        storage.evict_to_capacity().unwrap();

        assert_eq!(storage.size_level(0), 4);
        assert_eq!(storage.size_level(1), 8);
        // Promotion back up from DRAM.
        let promoted = storage.get_or_promote(0).unwrap();
        assert_eq!(promoted.payload(), &[0.0; DIMS]);
        assert_eq!(promoted.tier_tag(), TierTag::Hbm);
        assert_eq!(storage.lookup_tier(0), Some(0));
    }

    #[test]
    fn test_three_tier_cascade() {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::new(StorageType::HbmDramSsd, dir.path())
            .with_compaction_mode(CompactionMode::Sync)
            .with_io_scheme(IoScheme::Mmap);
        config.size[0] = 2 * DIMS * 4;
        config.size[1] = 4 * DIMS * 4;
        let storage = LayeredStorage::new(&config, DIMS).unwrap();
        assert_eq!(storage.num_tiers(), 3);

        for key in 0..10 {
            let handle = storage.create(key);
            handle.write_payload(0, &[key as f32; DIMS]);
            storage.touch(key, 1);
        }
        storage.evict_to_capacity().unwrap();

        assert_eq!(storage.size_level(0), 2);
        assert_eq!(storage.size_level(1), 4);
        assert_eq!(storage.size_level(2), 4);
        assert_eq!(storage.size(), 10);

        // The very coldest ids fell through to SSD and still read back.
        for key in 0..4 {
            assert_eq!(storage.lookup_tier(key), Some(2));
            let promoted = storage.get_or_promote(key).unwrap();
            assert_eq!(promoted.payload(), &[key as f32; DIMS]);
        }
    }

    #[test]
    fn test_remove_spans_tiers() {
        let dir = tempdir().unwrap();
        let storage = LayeredStorage::new(&dram_ssd_config(dir.path(), 4), DIMS).unwrap();
        for key in 0..8 {
            storage.create(key);
            storage.touch(key, 1);
        }
        storage.evict_to_capacity().unwrap();

        let ssd_resident = storage.ssd_keys()[0];
        assert!(storage.remove(ssd_resident));
        assert!(!storage.remove(ssd_resident));
        assert_eq!(storage.lookup_tier(ssd_resident), None);

        let top_resident = *storage
            .snapshot_memory()
            .first()
            .map(|(k, _)| k)
            .unwrap();
        assert!(storage.remove(top_resident));
        assert_eq!(storage.lookup_tier(top_resident), None);
    }

    #[test]
    fn test_shrink_across_tiers() {
        let dir = tempdir().unwrap();
        let storage = LayeredStorage::new(&dram_ssd_config(dir.path(), 4), DIMS).unwrap();
        for key in 0..10 {
            let handle = storage.create(key);
            handle.update_version(key);
            storage.touch(key, 1);
        }
        storage.evict_to_capacity().unwrap();

        let removed = storage
            .shrink(&ShrinkPolicy::StepsToLive {
                steps_to_live: 3,
                global_step: 10,
            })
            .unwrap();
        assert_eq!(removed, 8);
        assert_eq!(storage.size(), 2);
        assert!(storage.lookup_tier(8).is_some());
        assert!(storage.lookup_tier(9).is_some());
    }
}
