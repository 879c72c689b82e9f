//! Single-tier storage: a uniform interface over one level of the
//! memory hierarchy.
//!
//! Each variant bundles an index with the payload backing appropriate to
//! its device: the in-memory tiers pair a [`LockFreeMap`] with a
//! [`MemoryPool`]; the SSD tier pairs the log's manifest with on-disk
//! segments and materializes transient slots on read.

use std::sync::Arc;

use embedkv_core::error::Result;
use embedkv_core::layout::SubEmbedding;
use embedkv_table::{LockFreeMap, MemoryPool, SlotHandle, TierTag, ValueSlot};

use crate::ssd_log::{RecordRef, SsdLog};

/// Which slots a shrink pass removes.
#[derive(Debug, Clone, Copy)]
pub enum ShrinkPolicy {
    /// Remove ids whose version has fallen out of the TTL window: a slot
    /// survives iff `version > global_step - steps_to_live`.
    StepsToLive {
        /// TTL in steps.
        steps_to_live: i64,
        /// The current global step.
        global_step: i64,
    },
    /// Remove ids whose primary sub-embedding has a squared L2 norm
    /// below the threshold.
    L2Norm {
        /// Squared-norm threshold.
        threshold: f32,
        /// Location of the primary sub-embedding inside the payload.
        primary: SubEmbedding,
    },
}

impl ShrinkPolicy {
    /// Decides removal from a slot's version and payload.
    pub fn should_remove(&self, version: i64, payload: &[f32]) -> bool {
        match self {
            Self::StepsToLive {
                steps_to_live,
                global_step,
            } => version <= global_step - steps_to_live,
            Self::L2Norm { threshold, primary } => {
                let end = (primary.offset + primary.len).min(payload.len());
                let norm_sq: f32 = payload[primary.offset..end].iter().map(|v| v * v).sum();
                norm_sq < *threshold
            }
        }
    }
}

/// One level of the storage hierarchy.
///
/// Slot lifetime discipline: a slot returned by `remove` belongs to the
/// caller and must be destroyed through `destroy_slot` on the tier that
/// created it. `get` hands out a borrowed handle for in-memory tiers and
/// a transient owned slot for the SSD tier, which the caller destroys
/// after the copy-back.
pub trait TierStorage: Send + Sync {
    /// The tier tag stamped on slots created here.
    fn tier_tag(&self) -> TierTag;

    /// Looks up the handle currently published for `key`.
    fn get(&self, key: i64) -> Option<SlotHandle>;

    /// True if `key` is resident in this tier.
    fn contains(&self, key: i64) -> bool;

    /// Number of resident ids.
    fn size(&self) -> usize;

    /// Allocates a fresh, zeroed slot for `key` from this tier's pool.
    /// The slot is not published until inserted.
    fn create_slot(&self, key: i64) -> SlotHandle;

    /// Destroys a slot created by this tier, returning its payload to
    /// the pool. The slot must no longer be published.
    fn destroy_slot(&self, handle: SlotHandle);

    /// Publishes `(key, handle)` if absent; on a race returns the
    /// winner's handle, leaving ownership of `handle` with the caller.
    fn try_insert(&self, key: i64, handle: SlotHandle) -> std::result::Result<(), SlotHandle>;

    /// Publishes `(key, handle)`, destroying any displaced slot.
    fn insert(&self, key: i64, handle: SlotHandle);

    /// Unpublishes `key`, returning the slot for the caller to destroy.
    /// SSD removal has no slot to return.
    fn remove(&self, key: i64) -> Option<SlotHandle>;

    /// Write-through of one slot to this tier's persistence.
    fn commit(&self, key: i64, handle: SlotHandle) -> Result<()>;

    /// Write-through of a batch; the source slots stay owned by the
    /// caller.
    fn batch_commit(&self, entries: &[(i64, SlotHandle)]) -> Result<()>;

    /// Unordered snapshot of resident ids and handles. SSD-backed tiers
    /// return an empty snapshot; use [`TierStorage::keys`] and
    /// [`TierStorage::get`] to materialize lazily.
    fn snapshot(&self) -> Vec<(i64, SlotHandle)>;

    /// Resident ids, unordered.
    fn keys(&self) -> Vec<i64>;

    /// Removes every slot matching the policy; returns how many.
    fn shrink(&self, policy: &ShrinkPolicy) -> Result<usize>;

    /// Flushes buffered persistence state, if any.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory tier over a lock-free map and a slab pool; serves as both
/// the HBM-class and DRAM variants, distinguished by tag and by which
/// pool is injected at construction.
pub struct MemTier {
    tag: TierTag,
    map: LockFreeMap,
    pool: Arc<MemoryPool>,
    total_dims: usize,
}

impl MemTier {
    /// Creates a tier over a constructor-injected pool.
    pub fn new(tag: TierTag, pool: Arc<MemoryPool>, total_dims: usize) -> Self {
        debug_assert_eq!(pool.buffer_floats(), total_dims);
        Self {
            tag,
            map: LockFreeMap::new(),
            pool,
            total_dims,
        }
    }

    /// The pool backing this tier's payloads.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }
}

impl TierStorage for MemTier {
    fn tier_tag(&self) -> TierTag {
        self.tag
    }

    fn get(&self, key: i64) -> Option<SlotHandle> {
        self.map.lookup(key)
    }

    fn contains(&self, key: i64) -> bool {
        self.map.contains(key)
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn create_slot(&self, key: i64) -> SlotHandle {
        let payload = self.pool.allocate();
        SlotHandle::from_box(Box::new(ValueSlot::new(
            key,
            payload,
            self.total_dims,
            self.tag,
        )))
    }

    fn destroy_slot(&self, handle: SlotHandle) {
        let slot = unsafe { handle.into_box() };
        self.pool.deallocate(slot.payload_nonnull());
    }

    fn try_insert(&self, key: i64, handle: SlotHandle) -> std::result::Result<(), SlotHandle> {
        self.map.insert_if_absent(key, handle)
    }

    fn insert(&self, key: i64, handle: SlotHandle) {
        if let Some(displaced) = self.map.insert(key, handle) {
            self.destroy_slot(displaced);
        }
    }

    fn remove(&self, key: i64) -> Option<SlotHandle> {
        self.map.remove(key)
    }

    fn commit(&self, key: i64, handle: SlotHandle) -> Result<()> {
        // Memory tiers have no write-through target; committing a slot
        // owned elsewhere copies it into this tier.
        self.batch_commit(std::slice::from_ref(&(key, handle)))
    }

    fn batch_commit(&self, entries: &[(i64, SlotHandle)]) -> Result<()> {
        for (key, source) in entries {
            let fresh = self.create_slot(*key);
            fresh.copy_header_from(source.slot());
            fresh.copy_payload_from(source.slot());
            self.insert(*key, fresh);
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<(i64, SlotHandle)> {
        self.map.iter()
    }

    fn keys(&self) -> Vec<i64> {
        self.map.iter().into_iter().map(|(k, _)| k).collect()
    }

    fn shrink(&self, policy: &ShrinkPolicy) -> Result<usize> {
        let mut removed = 0;
        for (key, handle) in self.map.iter() {
            if policy.should_remove(handle.version(), handle.payload()) {
                if let Some(victim) = self.map.remove(key) {
                    self.destroy_slot(victim);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl Drop for MemTier {
    fn drop(&mut self) {
        // Slots published in the map are owned by this tier; reclaim
        // them before the map and pool go away.
        for (key, _) in self.map.iter() {
            if let Some(handle) = self.map.remove(key) {
                self.destroy_slot(handle);
            }
        }
    }
}

impl std::fmt::Debug for MemTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTier")
            .field("tag", &self.tag)
            .field("size", &self.size())
            .finish()
    }
}

/// SSD-backed tier: the bottom of the hierarchy. The index is the log
/// manifest; `get` materializes a transient slot from disk which the
/// caller destroys after promoting it.
pub struct SsdTier {
    log: Arc<SsdLog>,
    pool: Arc<MemoryPool>,
    total_dims: usize,
}

impl SsdTier {
    /// Creates a tier over an opened log, with a pool for transient
    /// slot payloads.
    pub fn new(log: Arc<SsdLog>, pool: Arc<MemoryPool>) -> Self {
        let total_dims = log.total_dims();
        debug_assert_eq!(pool.buffer_floats(), total_dims);
        Self {
            log,
            pool,
            total_dims,
        }
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<SsdLog> {
        &self.log
    }
}

impl TierStorage for SsdTier {
    fn tier_tag(&self) -> TierTag {
        TierTag::Ssd
    }

    fn get(&self, key: i64) -> Option<SlotHandle> {
        let record = match self.log.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                tracing::error!(key, error = %err, "SSD read failed");
                return None;
            }
        };
        let payload = self.pool.allocate();
        let slot = ValueSlot::new(key, payload, self.total_dims, TierTag::Ssd);
        slot.write_payload(0, &record.payload);
        slot.set_flags_raw(record.flags, TierTag::Ssd);
        slot.set_version(record.version);
        slot.set_frequency(record.frequency);
        Some(SlotHandle::from_box(Box::new(slot)))
    }

    fn contains(&self, key: i64) -> bool {
        self.log.contains(key)
    }

    fn size(&self) -> usize {
        self.log.len()
    }

    fn create_slot(&self, key: i64) -> SlotHandle {
        let payload = self.pool.allocate();
        SlotHandle::from_box(Box::new(ValueSlot::new(
            key,
            payload,
            self.total_dims,
            TierTag::Ssd,
        )))
    }

    fn destroy_slot(&self, handle: SlotHandle) {
        let slot = unsafe { handle.into_box() };
        self.pool.deallocate(slot.payload_nonnull());
    }

    fn try_insert(&self, key: i64, handle: SlotHandle) -> std::result::Result<(), SlotHandle> {
        // The manifest has no publish race to lose: committing always
        // wins, and the transient slot stays with the caller.
        match self.commit(key, handle) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(key, error = %err, "SSD insert failed");
                Err(handle)
            }
        }
    }

    fn insert(&self, key: i64, handle: SlotHandle) {
        if let Err(err) = self.commit(key, handle) {
            tracing::error!(key, error = %err, "SSD insert failed");
        }
        self.destroy_slot(handle);
    }

    fn remove(&self, key: i64) -> Option<SlotHandle> {
        self.log.remove(key);
        None
    }

    fn commit(&self, key: i64, handle: SlotHandle) -> Result<()> {
        let slot = handle.slot();
        self.log.commit(RecordRef {
            key,
            flags: slot.flags_raw(),
            version: slot.version(),
            frequency: slot.frequency(),
            payload: slot.payload(),
        })?;
        Ok(())
    }

    fn batch_commit(&self, entries: &[(i64, SlotHandle)]) -> Result<()> {
        let records: Vec<RecordRef<'_>> = entries
            .iter()
            .map(|(key, handle)| {
                let slot = handle.slot();
                RecordRef {
                    key: *key,
                    flags: slot.flags_raw(),
                    version: slot.version(),
                    frequency: slot.frequency(),
                    payload: slot.payload(),
                }
            })
            .collect();
        self.log.flush_batch(&records)?;
        Ok(())
    }

    fn snapshot(&self) -> Vec<(i64, SlotHandle)> {
        Vec::new()
    }

    fn keys(&self) -> Vec<i64> {
        self.log.keys()
    }

    fn shrink(&self, policy: &ShrinkPolicy) -> Result<usize> {
        let mut removed = 0;
        for key in self.log.keys() {
            if let Ok(Some(record)) = self.log.get(key) {
                if policy.should_remove(record.version, &record.payload) {
                    if self.log.remove(key) {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        self.log.flush()
    }
}

impl std::fmt::Debug for SsdTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsdTier").field("size", &self.size()).finish()
    }
}
