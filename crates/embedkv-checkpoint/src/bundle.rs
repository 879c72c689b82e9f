//! Tensor bundles: named, typed tensors persisted as one checksummed
//! file.
//!
//! Tensor names are held in a `BTreeMap`, so enumeration is always
//! alphabetical; the shard layout and its tests rely on that ordering.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::{CheckpointError, Result};

/// Magic bytes at the start of a bundle file.
const BUNDLE_MAGIC: u32 = 0x454b_4250; // "EKBP"
/// Bundle format version.
const BUNDLE_VERSION: u16 = 1;
/// Header flag: body is gzip-compressed.
const FLAG_GZIP: u16 = 1;
/// Bytes of the bundle file header.
const HEADER_BYTES: usize = 16;

/// One typed tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    /// Row-major float matrix.
    F32 {
        /// Shape, outermost dimension first.
        shape: Vec<usize>,
        /// Row-major data.
        data: Vec<f32>,
    },
    /// 1-D int64 vector.
    I64(Vec<i64>),
    /// 1-D int32 vector.
    I32(Vec<i32>),
}

impl Tensor {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Tensor::F32 { data, .. } => data.len(),
            Tensor::I64(data) => data.len(),
            Tensor::I32(data) => data.len(),
        }
    }

    /// True if the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the int64 data, if this is an int64 tensor.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Tensor::I64(data) => Some(data),
            _ => None,
        }
    }

    /// Borrows the int32 data, if this is an int32 tensor.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Tensor::I32(data) => Some(data),
            _ => None,
        }
    }

    /// Borrows the float data and shape, if this is a float tensor.
    pub fn as_f32(&self) -> Option<(&[usize], &[f32])> {
        match self {
            Tensor::F32 { shape, data } => Some((shape, data)),
            _ => None,
        }
    }
}

/// Named tensors, enumerated alphabetically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorBundle {
    tensors: BTreeMap<String, Tensor>,
}

impl TensorBundle {
    /// Creates an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Looks up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// A required tensor, as an error if missing.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name).ok_or_else(|| CheckpointError::InvalidBundle {
            message: format!("missing tensor {name}"),
        })
    }

    /// Tensor names in alphabetical order.
    pub fn keys(&self) -> Vec<&str> {
        self.tensors.keys().map(|k| k.as_str()).collect()
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True if the bundle holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Merges another bundle into this one.
    pub fn merge(&mut self, other: TensorBundle) {
        self.tensors.extend(other.tensors);
    }
}

/// Writes bundles to disk with optional compression.
#[derive(Debug, Clone, Default)]
pub struct BundleWriter {
    gzip: bool,
}

impl BundleWriter {
    /// Creates an uncompressed writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables gzip compression of the bundle body.
    pub fn with_gzip(mut self) -> Self {
        self.gzip = true;
        self
    }

    /// Serializes `bundle` to `path`.
    pub fn write_to_file(&self, path: &Path, bundle: &TensorBundle) -> Result<()> {
        tracing::info!(
            path = %path.display(),
            tensors = bundle.len(),
            gzip = self.gzip,
            "writing bundle"
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let body = bincode::serialize(bundle).map_err(|e| CheckpointError::Serialization {
            message: e.to_string(),
        })?;
        let body = if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .and_then(|_| encoder.finish())
                .map_err(|e| CheckpointError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?
        } else {
            body
        };

        let mut out = Vec::with_capacity(HEADER_BYTES + body.len());
        out.extend_from_slice(&BUNDLE_MAGIC.to_le_bytes());
        out.extend_from_slice(&BUNDLE_VERSION.to_le_bytes());
        out.extend_from_slice(&(if self.gzip { FLAG_GZIP } else { 0u16 }).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);

        std::fs::write(path, &out).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Reads bundles written by [`BundleWriter`].
#[derive(Debug, Clone, Default)]
pub struct BundleReader;

impl BundleReader {
    /// Creates a reader.
    pub fn new() -> Self {
        Self
    }

    /// Deserializes a bundle from `path`, verifying the checksum.
    pub fn read_from_file(&self, path: &Path) -> Result<TensorBundle> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if raw.len() < HEADER_BYTES
            || u32::from_le_bytes(raw[0..4].try_into().unwrap()) != BUNDLE_MAGIC
        {
            return Err(CheckpointError::Corrupted {
                path: path.to_path_buf(),
                message: "bad magic".to_string(),
            });
        }
        let version = u16::from_le_bytes(raw[4..6].try_into().unwrap());
        if version != BUNDLE_VERSION {
            return Err(CheckpointError::Corrupted {
                path: path.to_path_buf(),
                message: format!("unsupported bundle version {version}"),
            });
        }
        let flags = u16::from_le_bytes(raw[6..8].try_into().unwrap());
        let checksum = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        let body_len = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as usize;
        if raw.len() < HEADER_BYTES + body_len {
            return Err(CheckpointError::Corrupted {
                path: path.to_path_buf(),
                message: "truncated body".to_string(),
            });
        }
        let body = &raw[HEADER_BYTES..HEADER_BYTES + body_len];
        if crc32fast::hash(body) != checksum {
            return Err(CheckpointError::Corrupted {
                path: path.to_path_buf(),
                message: "checksum mismatch".to_string(),
            });
        }

        let body = if flags & FLAG_GZIP != 0 {
            let mut decoder = GzDecoder::new(body);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| CheckpointError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            decompressed
        } else {
            body.to_vec()
        };

        bincode::deserialize(&body).map_err(|e| CheckpointError::Serialization {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_bundle() -> TensorBundle {
        let mut bundle = TensorBundle::new();
        bundle.insert("ev/part_0-keys", Tensor::I64(vec![1, 2, 3]));
        bundle.insert(
            "ev/part_0-values",
            Tensor::F32 {
                shape: vec![3, 2],
                data: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            },
        );
        bundle.insert("ev/part_0-versions", Tensor::I64(vec![7, 8, 9]));
        bundle.insert("ev/part_0-partition_offset", Tensor::I32(vec![0, 3]));
        bundle
    }

    #[test]
    fn test_keys_are_alphabetical() {
        let bundle = sample_bundle();
        let keys = bundle.keys();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys[0], "ev/part_0-keys");
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.bundle");
        let bundle = sample_bundle();

        BundleWriter::new().write_to_file(&path, &bundle).unwrap();
        let restored = BundleReader::new().read_from_file(&path).unwrap();
        assert_eq!(restored, bundle);
    }

    #[test]
    fn test_roundtrip_gzip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.bundle.gz");
        let bundle = sample_bundle();

        BundleWriter::new()
            .with_gzip()
            .write_to_file(&path, &bundle)
            .unwrap();
        let restored = BundleReader::new().read_from_file(&path).unwrap();
        assert_eq!(restored, bundle);
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.bundle");
        BundleWriter::new()
            .write_to_file(&path, &sample_bundle())
            .unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let err = BundleReader::new().read_from_file(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }), "{err}");
    }

    #[test]
    fn test_missing_file() {
        let err = BundleReader::new()
            .read_from_file(Path::new("/nonexistent/shard.bundle"))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test]
    fn test_require() {
        let bundle = sample_bundle();
        assert!(bundle.require("ev/part_0-keys").is_ok());
        assert!(bundle.require("ev/part_0-freqs").is_err());
    }

    #[test]
    fn test_tensor_accessors() {
        let bundle = sample_bundle();
        assert_eq!(
            bundle.get("ev/part_0-keys").unwrap().as_i64().unwrap(),
            &[1, 2, 3]
        );
        let (shape, data) = bundle.get("ev/part_0-values").unwrap().as_f32().unwrap();
        assert_eq!(shape, &[3, 2]);
        assert_eq!(data.len(), 6);
        assert!(bundle.get("ev/part_0-keys").unwrap().as_i32().is_none());
    }
}
