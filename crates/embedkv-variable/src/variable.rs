//! The embedding variable façade.
//!
//! [`EmbeddingVariable`] is what the optimizer kernels and checkpoint
//! I/O talk to: lookup-or-create on the hot path, header updates
//! through handles, snapshot and shrink at checkpoint boundaries, and
//! import for restore. The store only provides lifetime and placement
//! guarantees; payload updates are performed in place by the caller
//! that holds a handle.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use embedkv_core::config::{EmbeddingConfig, StorageConfig};
use embedkv_core::error::{Result, StoreError};
use embedkv_core::key::is_reserved;
use embedkv_core::layout::{EmbeddingLayout, SubEmbedding};
use embedkv_checkpoint::RestoreBuffer;
use embedkv_storage::{EvictionManager, LayeredStorage};
use embedkv_table::{
    AdmissionFilter, CountingBloomFilter, FrequencyThresholdFilter, SlotHandle,
};

use crate::shrink::{policies_for, ShrinkArgs};

struct DefaultValue {
    /// Row-major `[dim, value_len]` table of initial values.
    table: Vec<f32>,
    /// Number of rows.
    dim: usize,
}

/// An in-memory snapshot of a variable, with the SSD-only remainder
/// yielded lazily by [`SsdRemainder`].
pub struct Snapshot {
    /// Admitted ids resident in memory tiers.
    pub keys: Vec<i64>,
    /// Primary embedding per admitted id.
    pub values: Vec<Vec<f32>>,
    /// Version per admitted id.
    pub versions: Vec<i64>,
    /// Access count per admitted id.
    pub freqs: Vec<i64>,
    /// Shadow ids observed but not admitted.
    pub filtered_keys: Vec<i64>,
    /// Versions of shadow ids.
    pub filtered_versions: Vec<i64>,
    /// Access counts of shadow ids.
    pub filtered_freqs: Vec<i64>,
    /// Lazily materialized SSD-only ids.
    pub ssd_remainder: SsdRemainder,
}

/// Iterator over the ids resident only on SSD, materializing one record
/// at a time.
pub struct SsdRemainder {
    storage: Arc<LayeredStorage>,
    keys: std::vec::IntoIter<i64>,
    primary: SubEmbedding,
}

impl Iterator for SsdRemainder {
    /// `(key, primary embedding, version, frequency)`
    type Item = (i64, Vec<f32>, i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.next()?;
            let tier = self.storage.ssd_tier()?;
            if let Some(handle) = tier.get(key) {
                let payload = handle.payload();
                let row = payload[self.primary.offset..self.primary.offset + self.primary.len]
                    .to_vec();
                let item = (key, row, handle.version(), handle.frequency());
                tier.destroy_slot(handle);
                return Some(item);
            }
            // Removed between snapshot and materialization; skip.
        }
    }
}

/// Public façade over one tiered embedding variable.
pub struct EmbeddingVariable {
    name: String,
    config: EmbeddingConfig,
    layout: EmbeddingLayout,
    storage: Arc<LayeredStorage>,
    filter: AdmissionFilter,
    default_value: RwLock<Option<DefaultValue>>,
    evictor: Mutex<Option<EvictionManager>>,
}

impl EmbeddingVariable {
    /// Builds the variable and its tier stack.
    ///
    /// `value_len` is the unpadded length of one embedding; the payload
    /// also carries `config.slot_count - 1` co-located optimizer
    /// sub-embeddings, laid out per `config.layout`.
    pub fn new(
        storage_config: &StorageConfig,
        config: EmbeddingConfig,
        value_len: usize,
    ) -> Result<Self> {
        let layout = EmbeddingLayout::new(config.layout, value_len, config.slot_count)?;
        let storage = Arc::new(LayeredStorage::new(storage_config, layout.total_dims())?);

        let filter = if config.use_bloom_filter() {
            AdmissionFilter::Bloom(CountingBloomFilter::new(
                config.max_element_size,
                config.false_positive_probability,
                config.counter_type,
                config.filter_freq,
            ))
        } else if config.filter_enabled() {
            AdmissionFilter::Frequency(FrequencyThresholdFilter::new(
                config.filter_freq,
                config.max_freq,
            ))
        } else {
            AdmissionFilter::AdmitAll
        };

        Ok(Self {
            name: config.name.clone(),
            config,
            layout,
            storage,
            filter,
            default_value: RwLock::new(None),
            evictor: Mutex::new(None),
        })
    }

    /// The variable name, used in checkpoint tensor keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unpadded embedding length.
    pub fn value_len(&self) -> usize {
        self.layout.value_len()
    }

    /// The payload layout.
    pub fn layout(&self) -> &EmbeddingLayout {
        &self.layout
    }

    /// The variable configuration.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// The tier stack.
    pub fn storage(&self) -> &Arc<LayeredStorage> {
        &self.storage
    }

    /// The admission filter.
    pub fn filter(&self) -> &AdmissionFilter {
        &self.filter
    }

    /// Sets the default-value table new slots are initialized from; row
    /// `id % default_dim` seeds the primary embedding.
    pub fn init(&self, default_value: &[f32], default_dim: usize) -> Result<()> {
        if default_dim == 0 || default_value.len() != default_dim * self.value_len() {
            return Err(StoreError::invalid_argument(format!(
                "default table of {} floats does not match {} rows of {}",
                default_value.len(),
                default_dim,
                self.value_len()
            )));
        }
        *self.default_value.write() = Some(DefaultValue {
            table: default_value.to_vec(),
            dim: default_dim,
        });
        Ok(())
    }

    /// True once [`EmbeddingVariable::init`] has run.
    pub fn is_initialized(&self) -> bool {
        self.default_value.read().is_some()
    }

    /// Starts the background eviction sweep at the configured period.
    pub fn start_eviction(&self) {
        self.start_eviction_with_interval(self.storage.eviction_interval());
    }

    /// Starts the background eviction sweep at an explicit period.
    pub fn start_eviction_with_interval(&self, interval: Duration) {
        let mut evictor = self.evictor.lock();
        if evictor.is_none() {
            *evictor = Some(EvictionManager::start(Arc::clone(&self.storage), interval));
        }
    }

    /// Stops the background eviction sweep, draining the current batch.
    pub fn stop_eviction(&self) {
        if let Some(mut manager) = self.evictor.lock().take() {
            manager.shutdown();
        }
    }

    fn default_row(&self, id: i64, out: &mut [f32]) -> Result<()> {
        let guard = self.default_value.read();
        let default = guard
            .as_ref()
            .ok_or_else(|| StoreError::failed_precondition("variable not initialized"))?;
        let row = id.rem_euclid(default.dim as i64) as usize;
        let value_len = self.value_len();
        out.copy_from_slice(&default.table[row * value_len..(row + 1) * value_len]);
        Ok(())
    }

    fn init_slot_payload(&self, handle: SlotHandle, id: i64) -> Result<()> {
        let primary = self.layout.sub_embedding(0)?;
        let mut row = vec![0.0f32; primary.len];
        self.default_row(id, &mut row)?;
        handle.write_payload(primary.offset, &row);
        handle.set_initialized(0);
        Ok(())
    }

    fn validate_id(&self, id: i64) -> Result<()> {
        if is_reserved(id) {
            return Err(StoreError::invalid_argument(format!(
                "id {id} is reserved"
            )));
        }
        Ok(())
    }

    /// Looks up or creates a slot for `id` with the given batch
    /// multiplicity, resolving admission and shadow state. `None` means
    /// the id is (still) suppressed by the bloom filter.
    fn lookup_or_create_slot(&self, id: i64, count: i64) -> Result<Option<SlotHandle>> {
        self.validate_id(id)?;
        if !self.is_initialized() {
            return Err(StoreError::failed_precondition("variable not initialized"));
        }

        if let Some(handle) = self.storage.get_or_promote(id) {
            let admitted =
                self.filter
                    .observe_existing(handle.slot(), count, self.config.max_freq);
            if admitted && handle.is_shadow() {
                // Crossing the admission threshold turns a shadow slot
                // into a real one.
                self.init_slot_payload(handle, id)?;
                handle.set_shadow(false);
            }
            self.storage.touch(id, count);
            return Ok(Some(handle));
        }

        if !self.filter.observe_new(id, count) {
            return Ok(None);
        }

        let handle = self.storage.create(id);
        if self.filter.new_slot_is_shadow(count) {
            handle.set_shadow(true);
            handle.add_frequency(count, self.config.max_freq);
        } else {
            handle.add_frequency(count, self.config.max_freq);
            self.init_slot_payload(handle, id)?;
        }
        self.storage.touch(id, count);
        Ok(Some(handle))
    }

    /// Fast path: fills `out` with the embedding for `id`, creating the
    /// slot if admission allows.
    ///
    /// `default_value` overrides the init-time default row for this
    /// call; shadow and filtered ids read the default without the
    /// optimizer ever seeing a writable slot.
    pub fn lookup_or_create(
        &self,
        id: i64,
        out: &mut [f32],
        default_value: Option<&[f32]>,
    ) -> Result<()> {
        if out.len() != self.value_len() {
            return Err(StoreError::invalid_argument(format!(
                "output of {} floats does not match value_len {}",
                out.len(),
                self.value_len()
            )));
        }

        let fill_default = |out: &mut [f32]| -> Result<()> {
            match default_value {
                Some(row) => {
                    if row.len() != out.len() {
                        return Err(StoreError::invalid_argument(
                            "default row length mismatch",
                        ));
                    }
                    out.copy_from_slice(row);
                    Ok(())
                }
                None => self.default_row(id, out),
            }
        };

        match self.lookup_or_create_slot(id, 1)? {
            Some(handle) if !handle.is_shadow() => {
                let primary = self.layout.sub_embedding(0)?;
                let payload = handle.payload();
                out.copy_from_slice(&payload[primary.offset..primary.offset + primary.len]);
                Ok(())
            }
            // Shadow or suppressed: the caller sees the default and the
            // observation has been recorded.
            _ => fill_default(out),
        }
    }

    /// Looks up or creates the slot for `id`, returning the handle and
    /// whether the id is admitted for writes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` while the bloom filter still suppresses the
    /// id; optimizer kernels treat that as "skip this id in this batch".
    pub fn lookup_or_create_key(&self, id: i64) -> Result<(SlotHandle, bool)> {
        match self.lookup_or_create_slot(id, 1)? {
            Some(handle) => {
                let admitted = !handle.is_shadow();
                Ok((handle, admitted))
            }
            None => Err(StoreError::NotFound { id }),
        }
    }

    /// Batch lookup: fills `out` row-major, one `value_len` row per id.
    /// Admission observes each id's batch multiplicity.
    pub fn batch_lookup_or_create(&self, ids: &[i64], out: &mut [f32]) -> Result<()> {
        if out.len() != ids.len() * self.value_len() {
            return Err(StoreError::invalid_argument(format!(
                "output of {} floats does not match {} ids of {}",
                out.len(),
                ids.len(),
                self.value_len()
            )));
        }

        let mut multiplicity: HashMap<i64, i64> = HashMap::new();
        for &id in ids {
            *multiplicity.entry(id).or_default() += 1;
        }

        let value_len = self.value_len();
        let mut resolved: HashMap<i64, Option<SlotHandle>> = HashMap::new();
        for (&id, &count) in &multiplicity {
            resolved.insert(id, self.lookup_or_create_slot(id, count)?);
        }

        let primary = self.layout.sub_embedding(0)?;
        for (i, &id) in ids.iter().enumerate() {
            let out_row = &mut out[i * value_len..(i + 1) * value_len];
            match resolved.get(&id).copied().flatten() {
                Some(handle) if !handle.is_shadow() => {
                    let payload = handle.payload();
                    out_row
                        .copy_from_slice(&payload[primary.offset..primary.offset + primary.len]);
                }
                _ => self.default_row(id, out_row)?,
            }
        }
        Ok(())
    }

    /// Records the global training step on a handle.
    pub fn update_version(&self, handle: SlotHandle, step: i64) {
        handle.update_version(step);
    }

    /// Total ids across all tiers, shadow slots included.
    pub fn size(&self) -> usize {
        self.storage.size()
    }

    /// Ids resident in one tier.
    pub fn size_level(&self, level: usize) -> usize {
        self.storage.size_level(level)
    }

    /// Removes `id` from every tier.
    pub fn remove(&self, id: i64) -> Result<bool> {
        self.validate_id(id)?;
        Ok(self.storage.remove(id))
    }

    /// Assembles a dump of all ids: memory tiers eagerly, the SSD-only
    /// remainder through the returned lazy iterator.
    pub fn get_snapshot(&self) -> Result<Snapshot> {
        let primary = self.layout.sub_embedding(0)?;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut versions = Vec::new();
        let mut freqs = Vec::new();
        let mut filtered_keys = Vec::new();
        let mut filtered_versions = Vec::new();
        let mut filtered_freqs = Vec::new();

        for (key, handle) in self.storage.snapshot_memory() {
            if handle.is_shadow() {
                filtered_keys.push(key);
                filtered_versions.push(handle.version());
                filtered_freqs.push(handle.frequency());
            } else {
                let payload = handle.payload();
                keys.push(key);
                values.push(payload[primary.offset..primary.offset + primary.len].to_vec());
                versions.push(handle.version());
                freqs.push(handle.frequency());
            }
        }

        Ok(Snapshot {
            keys,
            values,
            versions,
            freqs,
            filtered_keys,
            filtered_versions,
            filtered_freqs,
            ssd_remainder: SsdRemainder {
                storage: Arc::clone(&self.storage),
                keys: self.storage.ssd_keys().into_iter(),
                primary,
            },
        })
    }

    /// Prunes ids per the configured policies, under per-tier exclusive
    /// iteration. Returns the number of removed ids.
    pub fn shrink(&self, args: ShrinkArgs) -> Result<usize> {
        let mut removed = 0;
        for policy in policies_for(&self.config, &self.layout, args) {
            removed += self.storage.shrink(&policy)?;
        }
        Ok(removed)
    }

    /// Restores ids from a checkpoint buffer, honoring partition
    /// sharding (`id % partition_num == partition_id`).
    ///
    /// Restored frequencies seed the eviction cache, so ids past the
    /// top tier's budget spill down exactly as a trained store would
    /// hold them. `filtered` buffers restore shadow ids without
    /// payloads.
    pub fn import(
        &self,
        buffer: &RestoreBuffer,
        partition_id: usize,
        partition_num: usize,
        filtered: bool,
    ) -> Result<usize> {
        if !self.is_initialized() {
            return Err(StoreError::failed_precondition("variable not initialized"));
        }
        if !filtered && buffer.value_len != self.value_len() {
            return Err(StoreError::invalid_argument(format!(
                "restore rows of {} floats do not match value_len {}",
                buffer.value_len,
                self.value_len()
            )));
        }

        let shard = buffer.filter_partition(partition_id, partition_num);
        let primary = self.layout.sub_embedding(0)?;

        for i in 0..shard.len() {
            let id = shard.keys[i];
            self.validate_id(id)?;
            let handle = self.storage.create(id);
            if filtered {
                handle.set_shadow(true);
            } else {
                handle.write_payload(primary.offset, shard.value_row(i));
                handle.set_initialized(0);
            }
            handle.set_version(shard.versions[i]);
            handle.set_frequency(shard.freqs[i]);
            if let AdmissionFilter::Bloom(bloom) = &self.filter {
                // Re-seed the filter so admission survives restore.
                bloom.observe(id, shard.freqs[i].max(1));
            }
            self.storage.touch(id, shard.freqs[i].max(1));
        }

        let imported = shard.len();
        self.storage.evict_to_capacity()?;
        tracing::info!(
            variable = %self.name,
            imported,
            filtered,
            "restored ids from checkpoint buffer"
        );
        Ok(imported)
    }
}

impl std::fmt::Debug for EmbeddingVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingVariable")
            .field("name", &self.name)
            .field("value_len", &self.value_len())
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for EmbeddingVariable {
    fn drop(&mut self) {
        self.stop_eviction();
    }
}
