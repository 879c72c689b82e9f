//! In-memory building blocks of the embedkv tiered embedding store.
//!
//! This crate carries the pieces one tier is assembled from:
//!
//! - [`ValueSlot`] / [`SlotHandle`] - the header + payload pair stored
//!   for one feature id, and the opaque reference handed to callers
//! - [`MemoryPool`] - slab allocator of fixed-size aligned payloads
//! - [`LockFreeMap`] - open-addressed id to handle map with wait-free
//!   readers and CAS-publishing writers
//! - [`AdmissionFilter`] - counting bloom filter or per-slot frequency
//!   threshold deciding when an id is stored
//! - [`BatchCache`] - LRU/LFU ranking with a prefetch list, consumed by
//!   the eviction engine
//!
//! # Example
//!
//! ```
//! use embedkv_table::{LockFreeMap, MemoryPool, SlotHandle, TierTag, ValueSlot};
//!
//! let pool = MemoryPool::new(8, 64);
//! let map = LockFreeMap::new();
//!
//! let payload = pool.allocate();
//! let handle = SlotHandle::from_box(Box::new(ValueSlot::new(7, payload, 8, TierTag::Dram)));
//! map.insert_if_absent(7, handle).unwrap();
//!
//! let found = map.lookup(7).unwrap();
//! assert_eq!(found.key(), 7);
//!
//! let removed = map.remove(7).unwrap();
//! let slot = unsafe { removed.into_box() };
//! pool.deallocate(slot.payload_nonnull());
//! # let _ = slot;
//! ```

pub mod admission;
pub mod cache;
pub mod map;
pub mod pool;
pub mod slot;

pub use admission::{AdmissionFilter, CountingBloomFilter, FrequencyThresholdFilter};
pub use cache::{create_cache, BatchCache, LfuCache, LruCache};
pub use map::LockFreeMap;
pub use pool::MemoryPool;
pub use slot::{SlotHandle, TierTag, ValueSlot, UNSET_VERSION};
