//! Core types for the embedkv tiered embedding store.
//!
//! This crate carries the pieces every other embedkv crate depends on:
//!
//! - [`StoreError`] / [`Result`] - the workspace error model
//! - [`EmbeddingConfig`] / [`StorageConfig`] - per-variable and per-stack
//!   configuration, including the environment-variable overrides for SSD
//!   compaction and IO scheme
//! - [`EmbeddingLayout`] - where each co-located sub-embedding lives
//!   inside one slot payload
//! - key utilities - reserved sentinel keys and the hash mixer shared by
//!   the lock-free table and the admission filter

pub mod config;
pub mod error;
pub mod key;
pub mod layout;

pub use config::{
    CacheStrategy, CompactionMode, CounterType, EmbeddingConfig, IoScheme, StorageConfig,
    StorageType,
};
pub use error::{Result, StoreError};
pub use layout::{aligned_len, EmbeddingLayout, LayoutKind, SubEmbedding};
