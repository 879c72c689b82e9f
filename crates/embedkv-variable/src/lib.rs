//! The embedkv embedding variable: the public façade over the tiered
//! store.
//!
//! # Overview
//!
//! An [`EmbeddingVariable`] maps sparse feature ids to fixed-length
//! float vectors across a memory hierarchy (HBM-class / DRAM / SSD)
//! with admission filtering, background eviction and crash-safe SSD
//! persistence. The optimizer looks embeddings up (creating them
//! lazily) on every training step and updates them in place through the
//! returned handles; checkpoint I/O uses snapshots, shard export and
//! import.
//!
//! # Example
//!
//! ```
//! use embedkv_core::{EmbeddingConfig, StorageConfig, StorageType};
//! use embedkv_variable::EmbeddingVariable;
//!
//! let storage = StorageConfig::new(StorageType::Dram, "");
//! let var = EmbeddingVariable::new(&storage, EmbeddingConfig::new("user_id"), 8).unwrap();
//! var.init(&[0.1; 8], 1).unwrap();
//!
//! let mut embedding = vec![0.0; 8];
//! var.lookup_or_create(42, &mut embedding, None).unwrap();
//! assert_eq!(embedding, vec![0.1; 8]);
//!
//! let (handle, admitted) = var.lookup_or_create_key(42).unwrap();
//! assert!(admitted);
//! var.update_version(handle, 100);
//! ```

pub mod export;
pub mod shrink;
pub mod variable;

pub use export::{export_shard, load_shard, restore_shard, save_shard};
pub use shrink::ShrinkArgs;
pub use variable::{EmbeddingVariable, Snapshot, SsdRemainder};
