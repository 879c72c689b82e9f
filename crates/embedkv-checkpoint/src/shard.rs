//! Per-shard tensor layout.
//!
//! A variable `v` partitioned into `p` shards emits nine tensors per
//! shard:
//!
//! - `v/part_p-keys`, `v/part_p-values`, `v/part_p-versions`,
//!   `v/part_p-freqs` for admitted ids (values are `[num_keys,
//!   value_len]` row-major float32; the rest are 1-D int64);
//! - `v/part_p-keys_filtered`, `v/part_p-versions_filtered`,
//!   `v/part_p-freqs_filtered` for shadow ids below the admission
//!   threshold, which have never owned a payload;
//! - `v/part_p-partition_offset` and `v/part_p-partition_filter_offset`,
//!   int32 vectors of length [`SAVED_PARTITION_NUM`]` + 1` giving
//!   per-sub-partition start indices.
//!
//! Keys inside a shard are ordered by `(sub_partition, key)` so the
//! offset vectors delimit contiguous runs.

use crate::bundle::{Tensor, TensorBundle};
use crate::{CheckpointError, Result};

/// Number of fixed sub-partitions every shard's keys are bucketed into.
pub const SAVED_PARTITION_NUM: usize = 1000;

/// Builds the bundle name of one shard tensor.
pub fn shard_tensor_name(variable: &str, partition: usize, suffix: &str) -> String {
    format!("{variable}/part_{partition}-{suffix}")
}

fn sub_partition(key: i64) -> usize {
    key.rem_euclid(SAVED_PARTITION_NUM as i64) as usize
}

/// The tensors of one shard, in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardTensors {
    /// Admitted ids.
    pub keys: Vec<i64>,
    /// Row-major `[keys.len(), value_len]` payload matrix.
    pub values: Vec<f32>,
    /// Length of one value row.
    pub value_len: usize,
    /// Last written step per admitted id.
    pub versions: Vec<i64>,
    /// Access count per admitted id.
    pub freqs: Vec<i64>,
    /// Shadow ids observed but not admitted.
    pub filtered_keys: Vec<i64>,
    /// Versions of shadow ids.
    pub filtered_versions: Vec<i64>,
    /// Access counts of shadow ids.
    pub filtered_freqs: Vec<i64>,
}

impl ShardTensors {
    /// Creates an empty shard for rows of `value_len` floats.
    pub fn new(value_len: usize) -> Self {
        Self {
            value_len,
            ..Self::default()
        }
    }

    /// Appends one admitted id.
    pub fn push(&mut self, key: i64, value_row: &[f32], version: i64, freq: i64) {
        debug_assert_eq!(value_row.len(), self.value_len);
        self.keys.push(key);
        self.values.extend_from_slice(value_row);
        self.versions.push(version);
        self.freqs.push(freq);
    }

    /// Appends one shadow id.
    pub fn push_filtered(&mut self, key: i64, version: i64, freq: i64) {
        self.filtered_keys.push(key);
        self.filtered_versions.push(version);
        self.filtered_freqs.push(freq);
    }

    /// Number of admitted ids.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the shard holds no admitted ids.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Orders both key sets by `(sub_partition, key)`, carrying their
    /// companion tensors along. Must run before [`ShardTensors::into_bundle`].
    pub fn sort_for_save(&mut self) {
        let mut order: Vec<usize> = (0..self.keys.len()).collect();
        order.sort_by_key(|&i| (sub_partition(self.keys[i]), self.keys[i]));
        self.keys = order.iter().map(|&i| self.keys[i]).collect();
        self.versions = order.iter().map(|&i| self.versions[i]).collect();
        self.freqs = order.iter().map(|&i| self.freqs[i]).collect();
        let mut values = Vec::with_capacity(self.values.len());
        for &i in &order {
            values.extend_from_slice(&self.values[i * self.value_len..(i + 1) * self.value_len]);
        }
        self.values = values;

        let mut order: Vec<usize> = (0..self.filtered_keys.len()).collect();
        order.sort_by_key(|&i| (sub_partition(self.filtered_keys[i]), self.filtered_keys[i]));
        self.filtered_keys = order.iter().map(|&i| self.filtered_keys[i]).collect();
        self.filtered_versions = order.iter().map(|&i| self.filtered_versions[i]).collect();
        self.filtered_freqs = order.iter().map(|&i| self.filtered_freqs[i]).collect();
    }

    fn offsets(keys: &[i64]) -> Vec<i32> {
        let mut offsets = vec![0i32; SAVED_PARTITION_NUM + 1];
        for &key in keys {
            offsets[sub_partition(key) + 1] += 1;
        }
        for i in 1..offsets.len() {
            offsets[i] += offsets[i - 1];
        }
        offsets
    }

    /// Emits the nine shard tensors into a bundle.
    ///
    /// The shard must be ordered by [`ShardTensors::sort_for_save`]
    /// first so the offset vectors delimit contiguous key runs.
    pub fn into_bundle(self, variable: &str, partition: usize) -> TensorBundle {
        let mut bundle = TensorBundle::new();
        let name = |suffix: &str| shard_tensor_name(variable, partition, suffix);

        let partition_offset = Self::offsets(&self.keys);
        let partition_filter_offset = Self::offsets(&self.filtered_keys);
        let num_keys = self.keys.len();

        bundle.insert(name("keys"), Tensor::I64(self.keys));
        bundle.insert(
            name("values"),
            Tensor::F32 {
                shape: vec![num_keys, self.value_len],
                data: self.values,
            },
        );
        bundle.insert(name("versions"), Tensor::I64(self.versions));
        bundle.insert(name("freqs"), Tensor::I64(self.freqs));
        bundle.insert(name("keys_filtered"), Tensor::I64(self.filtered_keys));
        bundle.insert(
            name("versions_filtered"),
            Tensor::I64(self.filtered_versions),
        );
        bundle.insert(name("freqs_filtered"), Tensor::I64(self.filtered_freqs));
        bundle.insert(name("partition_offset"), Tensor::I32(partition_offset));
        bundle.insert(
            name("partition_filter_offset"),
            Tensor::I32(partition_filter_offset),
        );
        bundle
    }

    /// Parses the nine shard tensors back out of a bundle.
    pub fn from_bundle(bundle: &TensorBundle, variable: &str, partition: usize) -> Result<Self> {
        let name = |suffix: &str| shard_tensor_name(variable, partition, suffix);
        let i64_tensor = |suffix: &str| -> Result<Vec<i64>> {
            bundle
                .require(&name(suffix))?
                .as_i64()
                .map(<[i64]>::to_vec)
                .ok_or_else(|| CheckpointError::InvalidBundle {
                    message: format!("{} is not int64", name(suffix)),
                })
        };

        let keys = i64_tensor("keys")?;
        let (shape, data) = bundle
            .require(&name("values"))?
            .as_f32()
            .ok_or_else(|| CheckpointError::InvalidBundle {
                message: format!("{} is not float32", name("values")),
            })?;
        if shape.len() != 2 || shape[0] != keys.len() || shape[0] * shape[1] != data.len() {
            return Err(CheckpointError::InvalidBundle {
                message: format!(
                    "{} shape {:?} inconsistent with {} keys",
                    name("values"),
                    shape,
                    keys.len()
                ),
            });
        }

        Ok(Self {
            value_len: shape[1],
            values: data.to_vec(),
            keys,
            versions: i64_tensor("versions")?,
            freqs: i64_tensor("freqs")?,
            filtered_keys: i64_tensor("keys_filtered")?,
            filtered_versions: i64_tensor("versions_filtered")?,
            filtered_freqs: i64_tensor("freqs_filtered")?,
        })
    }

    /// The value row of admitted id index `i`.
    pub fn value_row(&self, i: usize) -> &[f32] {
        &self.values[i * self.value_len..(i + 1) * self.value_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shard() -> ShardTensors {
        let mut shard = ShardTensors::new(2);
        shard.push(2001, &[1.0, 1.1], 10, 3);
        shard.push(1, &[2.0, 2.1], 11, 4);
        shard.push(1001, &[3.0, 3.1], 12, 5);
        shard.push(5, &[4.0, 4.1], 13, 6);
        shard.push_filtered(7, 0, 1);
        shard.push_filtered(1007, 0, 2);
        shard
    }

    #[test]
    fn test_sort_groups_by_sub_partition() {
        let mut shard = sample_shard();
        shard.sort_for_save();
        // Sub-partitions: 2001, 1 and 1001 land in bucket 1; 5 lands in bucket 5.
        assert_eq!(shard.keys, vec![1, 1001, 2001, 5]);
        assert_eq!(shard.versions, vec![11, 12, 10, 13]);
        assert_eq!(shard.freqs, vec![4, 5, 3, 6]);
        assert_eq!(shard.value_row(0), &[2.0, 2.1]);
        assert_eq!(shard.value_row(2), &[1.0, 1.1]);
        assert_eq!(shard.filtered_keys, vec![7, 1007]);
    }

    #[test]
    fn test_bundle_has_nine_tensors_alphabetical() {
        let mut shard = sample_shard();
        shard.sort_for_save();
        let bundle = shard.into_bundle("ev", 0);

        assert_eq!(bundle.len(), 9);
        let keys = bundle.keys();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted, "bundle keys must be alphabetical");
        assert_eq!(
            keys,
            vec![
                "ev/part_0-freqs",
                "ev/part_0-freqs_filtered",
                "ev/part_0-keys",
                "ev/part_0-keys_filtered",
                "ev/part_0-partition_filter_offset",
                "ev/part_0-partition_offset",
                "ev/part_0-values",
                "ev/part_0-versions",
                "ev/part_0-versions_filtered",
            ]
        );
    }

    #[test]
    fn test_partition_offsets_delimit_runs() {
        let mut shard = sample_shard();
        shard.sort_for_save();
        let bundle = shard.into_bundle("ev", 0);

        let offsets = bundle
            .get("ev/part_0-partition_offset")
            .unwrap()
            .as_i32()
            .unwrap();
        assert_eq!(offsets.len(), SAVED_PARTITION_NUM + 1);
        assert_eq!(offsets[0], 0);
        // Sub-partition 1 holds keys {1, 1001, 2001}.
        assert_eq!(offsets[1], 0);
        assert_eq!(offsets[2], 3);
        // Sub-partition 5 holds key {5}.
        assert_eq!(offsets[5], 3);
        assert_eq!(offsets[6], 4);
        assert_eq!(offsets[SAVED_PARTITION_NUM], 4);

        let filter_offsets = bundle
            .get("ev/part_0-partition_filter_offset")
            .unwrap()
            .as_i32()
            .unwrap();
        // Shadow ids 7 and 1007 both land in sub-partition 7.
        assert_eq!(filter_offsets[7], 0);
        assert_eq!(filter_offsets[8], 2);
        assert_eq!(filter_offsets[SAVED_PARTITION_NUM], 2);
    }

    #[test]
    fn test_bundle_roundtrip() {
        let mut shard = sample_shard();
        shard.sort_for_save();
        let expected = shard.clone();
        let bundle = shard.into_bundle("ev", 3);

        let restored = ShardTensors::from_bundle(&bundle, "ev", 3).unwrap();
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_from_bundle_rejects_shape_mismatch() {
        let mut shard = sample_shard();
        shard.sort_for_save();
        let mut bundle = shard.into_bundle("ev", 0);
        bundle.insert(
            "ev/part_0-values",
            Tensor::F32 {
                shape: vec![2, 2],
                data: vec![0.0; 4],
            },
        );
        let err = ShardTensors::from_bundle(&bundle, "ev", 0).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidBundle { .. }), "{err}");
    }

    #[test]
    fn test_negative_keys_bucket_non_negatively() {
        let mut shard = ShardTensors::new(1);
        shard.push(-1, &[0.5], 0, 1);
        shard.push(-1001, &[0.6], 0, 1);
        shard.sort_for_save();
        let bundle = shard.into_bundle("ev", 0);
        let offsets = bundle
            .get("ev/part_0-partition_offset")
            .unwrap()
            .as_i32()
            .unwrap();
        // rem_euclid keeps the bucket in range: both -1 and -1001 land in 999.
        assert_eq!(offsets[999], 0);
        assert_eq!(offsets[1000], 2);
    }
}
