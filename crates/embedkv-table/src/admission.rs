//! Admission filtering: decide when an id is "seen enough" to store.
//!
//! Two policies, selected by configuration:
//!
//! - [`CountingBloomFilter`] keeps a flat counter array regardless of
//!   the key universe. It may over-admit (hash collisions) but never
//!   under-admits, and once an id is admitted it stays admitted.
//! - [`FrequencyThresholdFilter`] re-uses the per-slot frequency counter
//!   when the tier stores one; below the threshold a slot exists only as
//!   a shadow.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use embedkv_core::config::CounterType;
use embedkv_core::key::{mix64, remix64};

use crate::slot::ValueSlot;

const LN2: f64 = std::f64::consts::LN_2;

enum CounterCells {
    U8(Box<[AtomicU8]>),
    U16(Box<[AtomicU16]>),
    U32(Box<[AtomicU32]>),
    U64(Box<[AtomicU64]>),
}

macro_rules! saturating_cell_add {
    ($cells:expr, $idx:expr, $count:expr, $ty:ty) => {{
        let cell = &$cells[$idx];
        // Clamp before the cast so large batch counts saturate instead
        // of wrapping through the narrower cell width.
        let add = $count.min(<$ty>::MAX as u64) as $ty;
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(add);
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break next as u64,
                Err(actual) => current = actual,
            }
        }
    }};
}

impl CounterCells {
    fn new(counter_type: CounterType, len: usize) -> Self {
        match counter_type {
            CounterType::Uint8 => Self::U8((0..len).map(|_| AtomicU8::new(0)).collect()),
            CounterType::Uint16 => Self::U16((0..len).map(|_| AtomicU16::new(0)).collect()),
            CounterType::Uint32 => Self::U32((0..len).map(|_| AtomicU32::new(0)).collect()),
            CounterType::Uint64 => Self::U64((0..len).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    /// Adds `count` to a cell with saturation; returns the new value.
    fn add(&self, idx: usize, count: u64) -> u64 {
        match self {
            Self::U8(cells) => saturating_cell_add!(cells, idx, count, u8),
            Self::U16(cells) => saturating_cell_add!(cells, idx, count, u16),
            Self::U32(cells) => saturating_cell_add!(cells, idx, count, u32),
            Self::U64(cells) => saturating_cell_add!(cells, idx, count, u64),
        }
    }

    fn get(&self, idx: usize) -> u64 {
        match self {
            Self::U8(cells) => cells[idx].load(Ordering::Relaxed) as u64,
            Self::U16(cells) => cells[idx].load(Ordering::Relaxed) as u64,
            Self::U32(cells) => cells[idx].load(Ordering::Relaxed) as u64,
            Self::U64(cells) => cells[idx].load(Ordering::Relaxed),
        }
    }
}

/// Counting bloom filter over feature ids.
///
/// `observe(id, count)` increments the id's `k` cells with saturation
/// and reports whether all of them have crossed the admission threshold.
/// Counters only grow, so admission is monotonic: two racing observers
/// may both see "not yet" where serial execution would have admitted the
/// second, but once admitted an id stays admitted.
pub struct CountingBloomFilter {
    cells: CounterCells,
    num_cells: usize,
    num_hashes: usize,
    threshold: u64,
}

impl CountingBloomFilter {
    /// Sizes the filter for `max_element_size` distinct ids at the given
    /// false-positive probability, with cells of `counter_type` width
    /// and the admission threshold `threshold`.
    pub fn new(
        max_element_size: i64,
        false_positive_probability: f32,
        counter_type: CounterType,
        threshold: i64,
    ) -> Self {
        let n = max_element_size.max(1) as f64;
        let p = (false_positive_probability as f64).clamp(1e-9, 0.5);
        let m = (-n * p.ln() / (LN2 * LN2)).ceil() as usize;
        let num_cells = m.max(8);
        let k = ((num_cells as f64 / n) * LN2).round() as usize;
        let num_hashes = k.clamp(1, 16);

        Self {
            cells: CounterCells::new(counter_type, num_cells),
            num_cells,
            num_hashes,
            threshold: threshold.max(1) as u64,
        }
    }

    /// Builds a filter with explicit geometry, for tests and tooling.
    pub fn with_geometry(
        num_cells: usize,
        num_hashes: usize,
        counter_type: CounterType,
        threshold: i64,
    ) -> Self {
        assert!(num_cells > 0 && num_hashes > 0);
        Self {
            cells: CounterCells::new(counter_type, num_cells),
            num_cells,
            num_hashes,
            threshold: threshold.max(1) as u64,
        }
    }

    /// Number of counter cells.
    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    /// Number of hash probes per id.
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// The cell indices probed for `id`. Indices may repeat; each probe
    /// increments its cell independently.
    pub fn hash_indices(&self, id: i64) -> Vec<usize> {
        let h1 = mix64(id);
        let h2 = remix64(h1);
        (0..self.num_hashes)
            .map(|i| (h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.num_cells as u64) as usize)
            .collect()
    }

    /// Records `count` sightings of `id`; returns true once the id has
    /// crossed the admission threshold.
    pub fn observe(&self, id: i64, count: i64) -> bool {
        let count = count.max(0) as u64;
        let mut admitted = true;
        for idx in self.hash_indices(id) {
            let value = self.cells.add(idx, count);
            admitted &= value >= self.threshold;
        }
        admitted
    }

    /// Read-only admission check.
    pub fn is_admitted(&self, id: i64) -> bool {
        self.hash_indices(id)
            .into_iter()
            .all(|idx| self.cells.get(idx) >= self.threshold)
    }

    /// Current value of one counter cell.
    pub fn counter_value(&self, idx: usize) -> u64 {
        self.cells.get(idx)
    }
}

impl std::fmt::Debug for CountingBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBloomFilter")
            .field("num_cells", &self.num_cells)
            .field("num_hashes", &self.num_hashes)
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Frequency-threshold admission over the per-slot counter.
///
/// Slots below the threshold exist as shadows: the store returns the
/// caller-provided default on read and records the observation without
/// letting the optimizer mutate the payload.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyThresholdFilter {
    threshold: i64,
    max_freq: i64,
}

impl FrequencyThresholdFilter {
    /// Creates a filter admitting slots once their frequency reaches
    /// `threshold`, with counts saturating at `max_freq`.
    pub fn new(threshold: i64, max_freq: i64) -> Self {
        Self {
            threshold: threshold.max(1),
            max_freq,
        }
    }

    /// The admission threshold.
    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Records `count` sightings on the slot; returns true once the slot
    /// is admitted for writes.
    pub fn observe(&self, slot: &ValueSlot, count: i64) -> bool {
        slot.add_frequency(count, self.max_freq) >= self.threshold
    }

    /// Read-only admission check.
    pub fn is_admitted(&self, slot: &ValueSlot) -> bool {
        slot.frequency() >= self.threshold
    }
}

/// The admission policy attached to one variable.
pub enum AdmissionFilter {
    /// Every id is admitted on first sight.
    AdmitAll,
    /// Counting bloom filter over the id universe.
    Bloom(CountingBloomFilter),
    /// Per-slot frequency threshold with shadow slots.
    Frequency(FrequencyThresholdFilter),
}

impl AdmissionFilter {
    /// Records `count` sightings of an id that has no slot yet. Returns
    /// true if a real slot must now be created.
    pub fn observe_new(&self, id: i64, count: i64) -> bool {
        match self {
            Self::AdmitAll => true,
            Self::Bloom(filter) => filter.observe(id, count),
            // The frequency filter needs a (shadow) slot to count on, so
            // first sight always materializes one.
            Self::Frequency(_) => true,
        }
    }

    /// Records `count` sightings on an existing slot. Returns true if
    /// the slot is admitted for writes.
    pub fn observe_existing(&self, slot: &ValueSlot, count: i64, max_freq: i64) -> bool {
        match self {
            Self::AdmitAll => {
                slot.add_frequency(count, max_freq);
                true
            }
            Self::Bloom(filter) => {
                slot.add_frequency(count, max_freq);
                filter.observe(slot.key(), count)
            }
            Self::Frequency(filter) => filter.observe(slot, count),
        }
    }

    /// True if a brand-new slot starts in the shadow state under this
    /// policy.
    pub fn new_slot_is_shadow(&self, count: i64) -> bool {
        match self {
            Self::AdmitAll | Self::Bloom(_) => false,
            Self::Frequency(filter) => count < filter.threshold(),
        }
    }
}

impl std::fmt::Debug for AdmissionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdmitAll => f.write_str("AdmitAll"),
            Self::Bloom(filter) => filter.fmt(f),
            Self::Frequency(filter) => filter.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::slot::{SlotHandle, TierTag};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_bloom_sizing() {
        let filter = CountingBloomFilter::new(10, 0.01, CounterType::Uint64, 3);
        // Standard bloom formulas: m ≈ 9.6n, k ≈ 7 for p = 1%.
        assert_eq!(filter.num_cells(), 96);
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn test_bloom_admission_threshold() {
        let filter = CountingBloomFilter::new(100, 0.01, CounterType::Uint64, 3);
        assert!(!filter.observe(42, 1));
        assert!(!filter.observe(42, 1));
        assert!(filter.observe(42, 1));
        assert!(filter.is_admitted(42));
        // Monotonic: once admitted, stays admitted.
        for _ in 0..10 {
            assert!(filter.observe(42, 1));
        }
    }

    #[test]
    fn test_bloom_batched_count_admits_at_once() {
        let filter = CountingBloomFilter::new(100, 0.01, CounterType::Uint64, 3);
        assert!(filter.observe(7, 3));
    }

    #[test]
    fn test_bloom_counters_match_hash_multiset() {
        // Four threads, each observing one distinct id once: every cell
        // ends up holding the number of times it appears across the four
        // ids' probe sequences, regardless of counter width.
        for counter_type in [
            CounterType::Uint8,
            CounterType::Uint16,
            CounterType::Uint32,
            CounterType::Uint64,
        ] {
            let filter = Arc::new(CountingBloomFilter::with_geometry(
                97,
                7,
                counter_type,
                3,
            ));

            let mut expected: HashMap<usize, u64> = HashMap::new();
            for id in 1..=4 {
                for idx in filter.hash_indices(id) {
                    *expected.entry(idx).or_default() += 1;
                }
            }

            let mut threads = Vec::new();
            for id in 1..=4i64 {
                let filter = Arc::clone(&filter);
                threads.push(std::thread::spawn(move || {
                    filter.observe(id, 1);
                }));
            }
            for t in threads {
                t.join().unwrap();
            }

            for (idx, count) in expected {
                assert_eq!(
                    filter.counter_value(idx),
                    count,
                    "cell {idx} mismatch for {counter_type:?}"
                );
            }
        }
    }

    #[test]
    fn test_bloom_u8_saturates() {
        let filter = CountingBloomFilter::with_geometry(16, 2, CounterType::Uint8, 1);
        for _ in 0..300 {
            filter.observe(5, 1);
        }
        for idx in filter.hash_indices(5) {
            assert_eq!(filter.counter_value(idx), 255);
        }
        assert!(filter.is_admitted(5));
    }

    fn shadow_slot(pool: &MemoryPool, key: i64) -> SlotHandle {
        let payload = pool.allocate();
        SlotHandle::from_box(Box::new(ValueSlot::new(
            key,
            payload,
            pool.buffer_floats(),
            TierTag::Dram,
        )))
    }

    #[test]
    fn test_frequency_filter_admits_at_threshold() {
        let pool = MemoryPool::new(4, 8);
        let handle = shadow_slot(&pool, 9);
        let filter = FrequencyThresholdFilter::new(3, 1000);

        assert!(!filter.observe(handle.slot(), 1));
        assert!(!filter.observe(handle.slot(), 1));
        assert!(filter.observe(handle.slot(), 1));
        assert!(filter.is_admitted(handle.slot()));

        let slot = unsafe { handle.into_box() };
        pool.deallocate(slot.payload_nonnull());
    }

    #[test]
    fn test_admission_filter_dispatch() {
        let admit_all = AdmissionFilter::AdmitAll;
        assert!(admit_all.observe_new(1, 1));
        assert!(!admit_all.new_slot_is_shadow(1));

        let bloom = AdmissionFilter::Bloom(CountingBloomFilter::new(
            100,
            0.01,
            CounterType::Uint64,
            2,
        ));
        assert!(!bloom.observe_new(1, 1));
        assert!(bloom.observe_new(1, 1));
        assert!(!bloom.new_slot_is_shadow(1));

        let freq = AdmissionFilter::Frequency(FrequencyThresholdFilter::new(3, 1000));
        // The frequency filter always materializes a slot, shadowed
        // until the count crosses the threshold.
        assert!(freq.observe_new(1, 1));
        assert!(freq.new_slot_is_shadow(1));
        assert!(!freq.new_slot_is_shadow(3));
    }
}
