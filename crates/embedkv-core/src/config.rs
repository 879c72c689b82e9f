//! Store configuration.
//!
//! Configuration is split the way the original system splits it: an
//! [`EmbeddingConfig`] describing one variable (admission, shrink and
//! layout parameters) and a [`StorageConfig`] describing the tier stack
//! backing it (capacities, paths, cache strategy, SSD tuning).
//!
//! Two knobs can be overridden through the environment, matching the
//! deployment practice of the original system:
//!
//! - `SSDHASH_ASYNC_COMPACTION` in {`true`, `false`}, default `true`
//! - `SSDHASH_IO_SCHEME` in {`directio`, `mmap`, `mmap_and_madvise`},
//!   default `mmap_and_madvise`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::layout::LayoutKind;

/// Which tier stack to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageType {
    /// Single in-memory tier.
    #[default]
    Dram,
    /// DRAM on top of an SSD hash log.
    DramSsd,
    /// HBM-class tier on top of DRAM.
    HbmDram,
    /// Full three-tier stack.
    HbmDramSsd,
}

impl StorageType {
    /// Number of tiers this stack builds.
    pub fn num_tiers(&self) -> usize {
        match self {
            Self::Dram => 1,
            Self::DramSsd | Self::HbmDram => 2,
            Self::HbmDramSsd => 3,
        }
    }

    /// True if the bottom tier is SSD-backed.
    pub fn has_ssd(&self) -> bool {
        matches!(self, Self::DramSsd | Self::HbmDramSsd)
    }
}

/// Cache ranking strategy used by the eviction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Least-recently-used ordering.
    #[default]
    Lru,
    /// Least-frequently-used ordering, ties broken by recency.
    Lfu,
}

/// Width of one counting-bloom-filter cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CounterType {
    /// 8-bit cells.
    Uint8,
    /// 16-bit cells.
    Uint16,
    /// 32-bit cells.
    Uint32,
    /// 64-bit cells.
    #[default]
    Uint64,
}

impl CounterType {
    /// Saturation ceiling of one cell.
    pub fn max_value(&self) -> u64 {
        match self {
            Self::Uint8 => u8::MAX as u64,
            Self::Uint16 => u16::MAX as u64,
            Self::Uint32 => u32::MAX as u64,
            Self::Uint64 => u64::MAX,
        }
    }
}

/// How SSD record reads are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoScheme {
    /// Aligned positional reads.
    DirectIo,
    /// Per-segment memory mapping, pages faulted lazily.
    Mmap,
    /// As `Mmap`, plus `madvise(WILLNEED)` on the touched range.
    MmapAndMadvise,
}

impl IoScheme {
    /// Reads the scheme from `SSDHASH_IO_SCHEME`, falling back to the
    /// default when unset or unrecognized.
    pub fn from_env() -> Self {
        match std::env::var("SSDHASH_IO_SCHEME").as_deref() {
            Ok("directio") => Self::DirectIo,
            Ok("mmap") => Self::Mmap,
            Ok("mmap_and_madvise") => Self::MmapAndMadvise,
            _ => Self::default(),
        }
    }
}

impl Default for IoScheme {
    fn default() -> Self {
        Self::MmapAndMadvise
    }
}

/// Whether SSD log compaction runs inline or on a dedicated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    /// Compaction runs inline after commit; the calling thread waits.
    Sync,
    /// A dedicated compactor task rewrites segments in the background.
    Async,
}

impl CompactionMode {
    /// Reads the mode from `SSDHASH_ASYNC_COMPACTION`, falling back to
    /// the default when unset or unrecognized.
    pub fn from_env() -> Self {
        match std::env::var("SSDHASH_ASYNC_COMPACTION").as_deref() {
            Ok("false") => Self::Sync,
            Ok("true") => Self::Async,
            _ => Self::default(),
        }
    }
}

impl Default for CompactionMode {
    fn default() -> Self {
        Self::Async
    }
}

/// Per-variable configuration: admission, shrink and layout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Variable name, used in checkpoint tensor keys.
    pub name: String,
    /// Number of co-located sub-embeddings (primary + optimizer state).
    pub slot_count: usize,
    /// How sub-embeddings are packed inside one slot.
    pub layout: LayoutKind,
    /// Step-based TTL for shrink; zero disables.
    pub steps_to_live: i64,
    /// Admission threshold; zero disables the admission filter.
    pub filter_freq: i64,
    /// Saturation ceiling for per-slot frequency counters.
    pub max_freq: i64,
    /// L2 shrink threshold, compared against the squared norm of the
    /// primary sub-embedding; negative disables.
    pub l2_weight_threshold: f32,
    /// Expected distinct-id count for sizing the counting bloom filter;
    /// zero selects the per-slot frequency filter instead.
    pub max_element_size: i64,
    /// Target false-positive probability of the bloom filter.
    pub false_positive_probability: f32,
    /// Cell width of the bloom counter array.
    pub counter_type: CounterType,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            slot_count: 1,
            layout: LayoutKind::Normal,
            steps_to_live: 0,
            filter_freq: 0,
            max_freq: 999_999,
            l2_weight_threshold: -1.0,
            max_element_size: 0,
            false_positive_probability: 0.01,
            counter_type: CounterType::Uint64,
        }
    }
}

impl EmbeddingConfig {
    /// Creates a configuration for a named variable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the number of co-located sub-embeddings.
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Sets the payload layout.
    pub fn with_layout(mut self, layout: LayoutKind) -> Self {
        self.layout = layout;
        self
    }

    /// Sets the step TTL used by shrink.
    pub fn with_steps_to_live(mut self, steps: i64) -> Self {
        self.steps_to_live = steps;
        self
    }

    /// Sets the admission threshold.
    pub fn with_filter_freq(mut self, freq: i64) -> Self {
        self.filter_freq = freq;
        self
    }

    /// Sets the frequency ceiling.
    pub fn with_max_freq(mut self, max_freq: i64) -> Self {
        self.max_freq = max_freq;
        self
    }

    /// Sets the L2 shrink threshold.
    pub fn with_l2_weight_threshold(mut self, threshold: f32) -> Self {
        self.l2_weight_threshold = threshold;
        self
    }

    /// Sizes the counting bloom filter.
    pub fn with_bloom_filter(
        mut self,
        max_element_size: i64,
        false_positive_probability: f32,
        counter_type: CounterType,
    ) -> Self {
        self.max_element_size = max_element_size;
        self.false_positive_probability = false_positive_probability;
        self.counter_type = counter_type;
        self
    }

    /// True if the admission filter is enabled at all.
    pub fn filter_enabled(&self) -> bool {
        self.filter_freq > 0
    }

    /// True if the counting bloom filter variant is selected.
    pub fn use_bloom_filter(&self) -> bool {
        self.filter_freq > 0 && self.max_element_size > 0
    }
}

/// Tier-stack configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which tier stack to build.
    pub storage_type: StorageType,
    /// Directory for SSD segments; ignored by memory-only stacks.
    pub path: PathBuf,
    /// Per-tier byte capacities, top tier first.
    pub size: [usize; 4],
    /// Cache ranking strategy for eviction.
    pub cache_strategy: CacheStrategy,
    /// Maximum victims moved per eviction sweep.
    pub eviction_batch_size: usize,
    /// Period of the background eviction sweep in milliseconds.
    pub eviction_interval_ms: u64,
    /// Maximum bytes per SSD segment before rotation.
    pub segment_bytes: u64,
    /// Live-ratio below which a sealed segment is compacted.
    pub compaction_threshold: f64,
    /// Sealed-segment count above which compaction runs regardless of
    /// live ratio.
    pub max_sealed_segments: usize,
    /// Sync or async compaction; seeded from the environment.
    pub compaction_mode: CompactionMode,
    /// SSD read scheme; seeded from the environment.
    pub io_scheme: IoScheme,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Dram,
            path: PathBuf::new(),
            size: [1 << 30, 1 << 30, 1 << 30, 1 << 30],
            cache_strategy: CacheStrategy::Lru,
            eviction_batch_size: 10_000,
            eviction_interval_ms: 100,
            segment_bytes: 64 * 1024 * 1024,
            compaction_threshold: 0.5,
            max_sealed_segments: 16,
            compaction_mode: CompactionMode::from_env(),
            io_scheme: IoScheme::from_env(),
        }
    }
}

impl StorageConfig {
    /// Creates a configuration for the given tier stack.
    pub fn new(storage_type: StorageType, path: impl Into<PathBuf>) -> Self {
        Self {
            storage_type,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets per-tier byte capacities, top tier first.
    pub fn with_sizes(mut self, size: [usize; 4]) -> Self {
        self.size = size;
        self
    }

    /// Sets the cache strategy.
    pub fn with_cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    /// Sets the eviction sweep batch size.
    pub fn with_eviction_batch_size(mut self, batch: usize) -> Self {
        self.eviction_batch_size = batch;
        self
    }

    /// Sets the SSD segment size.
    pub fn with_segment_bytes(mut self, bytes: u64) -> Self {
        self.segment_bytes = bytes;
        self
    }

    /// Sets the compaction live-ratio trigger.
    pub fn with_compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Overrides the compaction mode.
    pub fn with_compaction_mode(mut self, mode: CompactionMode) -> Self {
        self.compaction_mode = mode;
        self
    }

    /// Overrides the IO scheme.
    pub fn with_io_scheme(mut self, scheme: IoScheme) -> Self {
        self.io_scheme = scheme;
        self
    }

    /// Validates cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when an SSD-backed stack has no path,
    /// a tier has zero capacity, or the compaction threshold is outside
    /// `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.storage_type.has_ssd() && self.path.as_os_str().is_empty() {
            return Err(StoreError::invalid_argument(
                "SSD-backed storage requires a path",
            ));
        }
        for level in 0..self.storage_type.num_tiers() {
            if self.size[level] == 0 {
                return Err(StoreError::invalid_argument(format!(
                    "tier {level} has zero capacity"
                )));
            }
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(StoreError::invalid_argument(format!(
                "compaction_threshold {} outside (0, 1]",
                self.compaction_threshold
            )));
        }
        if self.eviction_batch_size == 0 {
            return Err(StoreError::invalid_argument(
                "eviction_batch_size must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_shape() {
        assert_eq!(StorageType::Dram.num_tiers(), 1);
        assert_eq!(StorageType::DramSsd.num_tiers(), 2);
        assert_eq!(StorageType::HbmDram.num_tiers(), 2);
        assert_eq!(StorageType::HbmDramSsd.num_tiers(), 3);
        assert!(StorageType::DramSsd.has_ssd());
        assert!(!StorageType::HbmDram.has_ssd());
    }

    #[test]
    fn test_counter_type_max() {
        assert_eq!(CounterType::Uint8.max_value(), 255);
        assert_eq!(CounterType::Uint16.max_value(), 65_535);
        assert_eq!(CounterType::Uint32.max_value(), u32::MAX as u64);
        assert_eq!(CounterType::Uint64.max_value(), u64::MAX);
    }

    #[test]
    fn test_embedding_config_filter_selection() {
        let config = EmbeddingConfig::new("ev");
        assert!(!config.filter_enabled());

        let config = EmbeddingConfig::new("ev").with_filter_freq(3);
        assert!(config.filter_enabled());
        assert!(!config.use_bloom_filter());

        let config = EmbeddingConfig::new("ev")
            .with_filter_freq(3)
            .with_bloom_filter(10, 0.01, CounterType::Uint16);
        assert!(config.use_bloom_filter());
    }

    #[test]
    fn test_storage_config_validation() {
        let config = StorageConfig::new(StorageType::Dram, "");
        config.validate().unwrap();

        let config = StorageConfig::new(StorageType::DramSsd, "");
        assert!(config.validate().is_err());

        let config = StorageConfig::new(StorageType::DramSsd, "/tmp/ev");
        config.validate().unwrap();

        let mut config = StorageConfig::new(StorageType::Dram, "");
        config.size[0] = 0;
        assert!(config.validate().is_err());

        let config =
            StorageConfig::new(StorageType::Dram, "").with_compaction_threshold(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SSDHASH_IO_SCHEME", "directio");
        assert_eq!(IoScheme::from_env(), IoScheme::DirectIo);
        std::env::set_var("SSDHASH_IO_SCHEME", "mmap");
        assert_eq!(IoScheme::from_env(), IoScheme::Mmap);
        std::env::remove_var("SSDHASH_IO_SCHEME");
        assert_eq!(IoScheme::from_env(), IoScheme::MmapAndMadvise);

        std::env::set_var("SSDHASH_ASYNC_COMPACTION", "false");
        assert_eq!(CompactionMode::from_env(), CompactionMode::Sync);
        std::env::remove_var("SSDHASH_ASYNC_COMPACTION");
        assert_eq!(CompactionMode::from_env(), CompactionMode::Async);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = EmbeddingConfig::new("user_id")
            .with_slot_count(3)
            .with_steps_to_live(5)
            .with_filter_freq(2);
        let json = serde_json::to_string(&config).unwrap();
        let back: EmbeddingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "user_id");
        assert_eq!(back.slot_count, 3);
        assert_eq!(back.steps_to_live, 5);
        assert_eq!(back.filter_freq, 2);
    }
}
