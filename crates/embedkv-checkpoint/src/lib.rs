//! Checkpoint bundle format and shard layout for embedkv.
//!
//! A checkpoint is a set of **tensor bundles**, one per shard of each
//! embedding variable. A bundle maps tensor names to typed tensors and
//! is persisted as a checksummed, optionally gzip-compressed binary
//! file; tensor names are kept in alphabetical order, which restore
//! tooling depends on.
//!
//! Each variable shard contributes nine tensors (see [`shard`]): keys,
//! values, versions and freqs for admitted ids; keys, versions and
//! freqs for filtered (shadow) ids, which have never owned a payload;
//! and two int32 offset vectors giving per-sub-partition start indices.

pub mod bundle;
pub mod restore;
pub mod shard;

pub use bundle::{BundleReader, BundleWriter, Tensor, TensorBundle};
pub use restore::RestoreBuffer;
pub use shard::{shard_tensor_name, ShardTensors, SAVED_PARTITION_NUM};

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O error during bundle operations.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Bundle file not found.
    #[error("bundle not found: {0}")]
    NotFound(PathBuf),

    /// Bundle header or checksum mismatch.
    #[error("corrupted bundle {path}: {message}")]
    Corrupted {
        /// Path of the corrupted bundle.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    /// Serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// A tensor expected by the shard layout is missing or mis-typed.
    #[error("invalid bundle: {message}")]
    InvalidBundle {
        /// Description of the problem.
        message: String,
    },
}

/// A specialized Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;
