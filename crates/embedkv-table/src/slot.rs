//! Value slots: the header + payload pair stored for one feature id.
//!
//! A slot owns a small header (flags, version, frequency) with atomic
//! fields, plus a pointer to a fixed-length, 16-byte-aligned float
//! payload served by the tier's [`MemoryPool`](crate::pool::MemoryPool).
//! The store hands out [`SlotHandle`]s; the payload pointer is stable
//! until the slot is destroyed or migrated, and migration is always
//! copy-then-publish, never in-place relocation.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Which tier currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TierTag {
    /// Top tier, device-class memory.
    Hbm = 0,
    /// Host memory.
    Dram = 1,
    /// Transient slot materialized from the SSD log.
    Ssd = 2,
}

impl TierTag {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Hbm,
            1 => Self::Dram,
            _ => Self::Ssd,
        }
    }
}

// Flag word layout. The low 32 bits are one initialization bit per
// co-located sub-embedding; tier and state bits live above them.
const SHADOW_BIT: u64 = 1 << 32;
const FROZEN_BIT: u64 = 1 << 33;
const IN_POOL_BIT: u64 = 1 << 34;
const TIER_SHIFT: u32 = 36;
const TIER_MASK: u64 = 0b11 << TIER_SHIFT;

/// Version value of a slot that has never seen an optimizer step.
pub const UNSET_VERSION: i64 = -1;

/// Header + payload for one stored feature id.
///
/// All header fields are atomic; the payload is written in place by the
/// caller owning the handle. `frequency` uses relaxed ordering; exact
/// cross-thread ordering of counts is not required, only eventual sums.
pub struct ValueSlot {
    key: i64,
    total_dims: usize,
    payload: NonNull<f32>,
    flags: AtomicU64,
    version: AtomicI64,
    frequency: AtomicI64,
}

// The payload pointer is owned by this slot for its lifetime and the
// header fields are atomics; cross-thread payload writes are coordinated
// by the caller holding the handle.
unsafe impl Send for ValueSlot {}
unsafe impl Sync for ValueSlot {}

impl ValueSlot {
    /// Creates a slot over a payload buffer obtained from a pool.
    ///
    /// The buffer must hold at least `total_dims` floats and stays owned
    /// by the slot until it is destroyed, at which point the creating
    /// tier returns it to the pool.
    pub fn new(key: i64, payload: NonNull<f32>, total_dims: usize, tier: TierTag) -> Self {
        Self {
            key,
            total_dims,
            payload,
            flags: AtomicU64::new(((tier as u64) << TIER_SHIFT) | IN_POOL_BIT),
            version: AtomicI64::new(UNSET_VERSION),
            frequency: AtomicI64::new(0),
        }
    }

    /// The feature id this slot stores.
    #[inline]
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Payload size in floats.
    #[inline]
    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// Raw pointer to the payload, for optimizer kernels.
    #[inline]
    pub fn payload_ptr(&self) -> *mut f32 {
        self.payload.as_ptr()
    }

    /// The raw payload buffer, handed back to the owning pool when the
    /// slot is destroyed.
    #[inline]
    pub fn payload_nonnull(&self) -> NonNull<f32> {
        self.payload
    }

    /// Reads the payload as a slice.
    ///
    /// The caller-ordering contract applies: readers racing the handle
    /// owner's in-place writes may observe torn floats, never invalid
    /// memory.
    #[inline]
    pub fn payload(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.payload.as_ptr(), self.total_dims) }
    }

    /// Writes `values` at `offset` floats into the payload.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past `total_dims`.
    pub fn write_payload(&self, offset: usize, values: &[f32]) {
        assert!(
            offset + values.len() <= self.total_dims,
            "payload write out of bounds: {}+{} > {}",
            offset,
            values.len(),
            self.total_dims
        );
        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr(),
                self.payload.as_ptr().add(offset),
                values.len(),
            );
        }
    }

    /// Copies the entire payload from another slot of the same shape.
    pub fn copy_payload_from(&self, other: &ValueSlot) {
        debug_assert_eq!(self.total_dims, other.total_dims);
        unsafe {
            std::ptr::copy_nonoverlapping(
                other.payload.as_ptr(),
                self.payload.as_ptr(),
                self.total_dims,
            );
        }
    }

    /// Copies header state (flags, version, frequency) from another slot,
    /// preserving this slot's own tier tag. Used by copy-back promotion
    /// and eviction, which move a slot between tiers by copy-then-publish.
    pub fn copy_header_from(&self, other: &ValueSlot) {
        let tier = self.tier_tag();
        let mut flags = other.flags.load(Ordering::Acquire) & !TIER_MASK;
        flags |= (tier as u64) << TIER_SHIFT;
        self.flags.store(flags, Ordering::Release);
        self.version
            .store(other.version.load(Ordering::Acquire), Ordering::Release);
        self.frequency
            .store(other.frequency.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Last global step at which any sub-embedding was written.
    #[inline]
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Records the global training step. Monotonically non-decreasing.
    #[inline]
    pub fn update_version(&self, step: i64) {
        self.version.fetch_max(step, Ordering::AcqRel);
    }

    /// Restores a version value verbatim (checkpoint import path).
    #[inline]
    pub fn set_version(&self, version: i64) {
        self.version.store(version, Ordering::Release);
    }

    /// Access count since creation, saturated at the configured ceiling.
    #[inline]
    pub fn frequency(&self) -> i64 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Adds `count` accesses, saturating at `max_freq`.
    pub fn add_frequency(&self, count: i64, max_freq: i64) -> i64 {
        let mut current = self.frequency.load(Ordering::Relaxed);
        loop {
            let next = (current + count).min(max_freq);
            match self.frequency.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Restores a frequency value verbatim (checkpoint import path).
    #[inline]
    pub fn set_frequency(&self, freq: i64) {
        self.frequency.store(freq, Ordering::Relaxed);
    }

    /// True once sub-embedding `index` has been initialized.
    #[inline]
    pub fn is_initialized(&self, index: usize) -> bool {
        debug_assert!(index < 32);
        self.flags.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Marks sub-embedding `index` initialized.
    #[inline]
    pub fn set_initialized(&self, index: usize) {
        debug_assert!(index < 32);
        self.flags.fetch_or(1 << index, Ordering::AcqRel);
    }

    /// True while the id is observed but not yet admitted: reads return
    /// a default, the optimizer may not mutate the payload.
    #[inline]
    pub fn is_shadow(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SHADOW_BIT != 0
    }

    /// Sets or clears the shadow state.
    pub fn set_shadow(&self, shadow: bool) {
        if shadow {
            self.flags.fetch_or(SHADOW_BIT, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!SHADOW_BIT, Ordering::AcqRel);
        }
    }

    /// True if the slot is frozen against updates.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FROZEN_BIT != 0
    }

    /// Freezes or unfreezes the slot.
    pub fn set_frozen(&self, frozen: bool) {
        if frozen {
            self.flags.fetch_or(FROZEN_BIT, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FROZEN_BIT, Ordering::AcqRel);
        }
    }

    /// True while the payload buffer belongs to a memory pool (cleared
    /// for transient SSD materializations backed by one-off allocations).
    #[inline]
    pub fn in_memory_pool(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IN_POOL_BIT != 0
    }

    /// The tier currently owning this slot.
    #[inline]
    pub fn tier_tag(&self) -> TierTag {
        TierTag::from_bits((self.flags.load(Ordering::Acquire) & TIER_MASK) >> TIER_SHIFT)
    }

    /// Raw flag word, persisted verbatim into the SSD log.
    #[inline]
    pub fn flags_raw(&self) -> u64 {
        self.flags.load(Ordering::Acquire)
    }

    /// Restores a raw flag word from the SSD log, retagging to `tier`.
    pub fn set_flags_raw(&self, raw: u64, tier: TierTag) {
        let flags = (raw & !TIER_MASK) | ((tier as u64) << TIER_SHIFT);
        self.flags.store(flags, Ordering::Release);
    }
}

impl std::fmt::Debug for ValueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueSlot")
            .field("key", &self.key)
            .field("total_dims", &self.total_dims)
            .field("tier", &self.tier_tag())
            .field("version", &self.version())
            .field("frequency", &self.frequency())
            .field("shadow", &self.is_shadow())
            .finish()
    }
}

/// An opaque reference to a [`ValueSlot`], valid until the slot is
/// destroyed or migrated.
///
/// Handles are plain copyable pointers. The tier that published a slot
/// is the only place allowed to destroy it, and does so only after the
/// slot has been removed from its hash map, so a handle obtained from a
/// lookup stays valid for the caller's read-modify-write window.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    ptr: NonNull<ValueSlot>,
}

unsafe impl Send for SlotHandle {}
unsafe impl Sync for SlotHandle {}

impl SlotHandle {
    /// Takes ownership of a boxed slot, leaking it behind a handle. The
    /// matching [`SlotHandle::into_box`] reclaims it.
    pub fn from_box(slot: Box<ValueSlot>) -> Self {
        // Box::into_raw never returns null.
        Self {
            ptr: unsafe { NonNull::new_unchecked(Box::into_raw(slot)) },
        }
    }

    /// Rebuilds a handle from a raw pointer previously produced by
    /// [`SlotHandle::as_ptr`].
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live slot published through this crate.
    pub unsafe fn from_raw(ptr: *mut ValueSlot) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// The raw slot pointer, as stored in hash table cells.
    #[inline]
    pub fn as_ptr(&self) -> *mut ValueSlot {
        self.ptr.as_ptr()
    }

    /// Reclaims the boxed slot.
    ///
    /// # Safety
    ///
    /// The handle must have been created by [`SlotHandle::from_box`] and
    /// no copy of it may be dereferenced afterwards. Callers uphold this
    /// by tombstoning the slot's map entry first.
    pub unsafe fn into_box(self) -> Box<ValueSlot> {
        Box::from_raw(self.ptr.as_ptr())
    }

    /// Borrows the slot.
    #[inline]
    pub fn slot(&self) -> &ValueSlot {
        unsafe { self.ptr.as_ref() }
    }
}

impl std::ops::Deref for SlotHandle {
    type Target = ValueSlot;

    fn deref(&self) -> &Self::Target {
        self.slot()
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.slot().fmt(f)
    }
}
