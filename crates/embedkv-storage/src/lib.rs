//! Tiered storage for the embedkv embedding store.
//!
//! The pieces, bottom up:
//!
//! - [`SsdLog`] - append-only segment files with checksummed records,
//!   an in-memory manifest, three read schemes and sync/async compaction
//! - [`TierStorage`] - one level of the hierarchy: in-memory tiers over
//!   a lock-free map and slab pool, or the SSD tier over the log
//! - [`LayeredStorage`] - composes up to three tiers; routes lookups,
//!   promotes lower-tier hits by copy-then-publish, demotes eviction
//!   victims
//! - [`EvictionManager`] - the background sweep moving cold ids down
//!   the hierarchy when a tier outgrows its slot budget

pub mod evictor;
pub mod layered;
pub mod ssd_log;
pub mod tier;

pub use evictor::EvictionManager;
pub use layered::{CopyBackHint, LayeredStorage};
pub use ssd_log::{OwnedRecord, RecordLocation, RecordRef, SsdLog, SsdLogOptions};
pub use tier::{MemTier, ShrinkPolicy, SsdTier, TierStorage};
