//! Slot payload layout.
//!
//! A stored value is one contiguous float buffer holding several
//! co-located sub-embeddings: the primary embedding plus whatever state
//! the optimizer keeps per id (Adam's m and v, Adagrad's accumulator,
//! and so on). The layout object records where each sub-embedding lives
//! inside the buffer so the store never hard-codes per-optimizer logic.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Alignment in floats required at the start of every sub-embedding.
///
/// Vectorized optimizer kernels read 16-byte lanes, so each
/// sub-embedding starts on a 16-byte boundary.
pub const SLOT_ALIGN_FLOATS: usize = 4;

/// Alignment in bytes of the payload buffer itself.
pub const SLOT_ALIGN_BYTES: usize = 16;

/// Rounds a length in floats up to the slot alignment.
#[inline]
pub fn aligned_len(value_len: usize) -> usize {
    (value_len + SLOT_ALIGN_FLOATS - 1) / SLOT_ALIGN_FLOATS * SLOT_ALIGN_FLOATS
}

/// One sub-embedding inside a slot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEmbedding {
    /// Offset in floats from the start of the payload.
    pub offset: usize,
    /// Logical length in floats (unpadded).
    pub len: usize,
}

/// How sub-embeddings are packed inside one slot.
///
/// `normal` and `light` lay each sub-embedding out in its own aligned
/// block; `normal_contiguous` packs the logical values back to back and
/// pads only the slot total. The distinction matters only to external
/// kernels; the store treats both through the same offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Each sub-embedding in its own aligned block.
    #[default]
    Normal,
    /// Like `Normal` but with a reduced header (no per-slot stats).
    Light,
    /// Sub-embeddings packed contiguously, single trailing pad.
    NormalContiguous,
}

/// The layout of one slot payload: sub-embedding offset table plus the
/// aligned total size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingLayout {
    kind: LayoutKind,
    /// Unpadded length of each sub-embedding.
    value_len: usize,
    sub_embeddings: Vec<SubEmbedding>,
    /// Total payload size in floats, padded to the alignment.
    total_dims: usize,
}

impl EmbeddingLayout {
    /// Builds a layout for `slot_count` sub-embeddings of `value_len`
    /// floats each.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `value_len` or `slot_count` is zero.
    pub fn new(kind: LayoutKind, value_len: usize, slot_count: usize) -> Result<Self> {
        if value_len == 0 {
            return Err(StoreError::invalid_argument("value_len must be non-zero"));
        }
        if slot_count == 0 {
            return Err(StoreError::invalid_argument("slot_count must be non-zero"));
        }

        let mut sub_embeddings = Vec::with_capacity(slot_count);
        let total_dims = match kind {
            LayoutKind::Normal | LayoutKind::Light => {
                let stride = aligned_len(value_len);
                for i in 0..slot_count {
                    sub_embeddings.push(SubEmbedding {
                        offset: i * stride,
                        len: value_len,
                    });
                }
                stride * slot_count
            }
            LayoutKind::NormalContiguous => {
                for i in 0..slot_count {
                    sub_embeddings.push(SubEmbedding {
                        offset: i * value_len,
                        len: value_len,
                    });
                }
                aligned_len(value_len * slot_count)
            }
        };

        Ok(Self {
            kind,
            value_len,
            sub_embeddings,
            total_dims,
        })
    }

    /// The layout kind.
    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    /// Unpadded length of each sub-embedding in floats.
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// Number of co-located sub-embeddings.
    pub fn slot_count(&self) -> usize {
        self.sub_embeddings.len()
    }

    /// Total payload size in floats, padded to the alignment.
    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// Total payload size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_dims * std::mem::size_of::<f32>()
    }

    /// The offset table entry for sub-embedding `index`.
    pub fn sub_embedding(&self, index: usize) -> Result<SubEmbedding> {
        self.sub_embeddings
            .get(index)
            .copied()
            .ok_or_else(|| {
                StoreError::invalid_argument(format!(
                    "sub-embedding index {index} out of range ({} configured)",
                    self.sub_embeddings.len()
                ))
            })
    }

    /// Iterates over all sub-embedding entries.
    pub fn sub_embeddings(&self) -> impl Iterator<Item = SubEmbedding> + '_ {
        self.sub_embeddings.iter().copied()
    }
}
