//! Restore buffers: the flat key/value/version/freq arrays a store is
//! repopulated from.
//!
//! Restore may run with a different shard count than save, so the
//! buffer exposes partition filtering: a consumer restoring shard
//! `partition_id` of `partition_num` takes only the ids with
//! `id % partition_num == partition_id`.

use crate::shard::ShardTensors;

/// Flat restore arrays for one variable.
#[derive(Debug, Clone, Default)]
pub struct RestoreBuffer {
    /// Ids to restore.
    pub keys: Vec<i64>,
    /// Row-major `[keys.len(), value_len]` payload matrix. Empty for
    /// filtered-only buffers.
    pub values: Vec<f32>,
    /// Length of one value row.
    pub value_len: usize,
    /// Version per id.
    pub versions: Vec<i64>,
    /// Access count per id.
    pub freqs: Vec<i64>,
}

impl RestoreBuffer {
    /// Creates an empty buffer for rows of `value_len` floats.
    pub fn new(value_len: usize) -> Self {
        Self {
            value_len,
            ..Self::default()
        }
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the buffer holds no ids.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Appends one id.
    pub fn push(&mut self, key: i64, value_row: &[f32], version: i64, freq: i64) {
        debug_assert_eq!(value_row.len(), self.value_len);
        self.keys.push(key);
        self.values.extend_from_slice(value_row);
        self.versions.push(version);
        self.freqs.push(freq);
    }

    /// The value row of id index `i`; empty when the buffer carries no
    /// payloads (filtered ids).
    pub fn value_row(&self, i: usize) -> &[f32] {
        if self.values.is_empty() {
            return &[];
        }
        &self.values[i * self.value_len..(i + 1) * self.value_len]
    }

    /// The admitted ids of a loaded shard, as a restore buffer.
    pub fn from_shard(shard: &ShardTensors) -> Self {
        Self {
            keys: shard.keys.clone(),
            values: shard.values.clone(),
            value_len: shard.value_len,
            versions: shard.versions.clone(),
            freqs: shard.freqs.clone(),
        }
    }

    /// The filtered (shadow) ids of a loaded shard, as a payload-less
    /// restore buffer.
    pub fn filtered_from_shard(shard: &ShardTensors) -> Self {
        Self {
            keys: shard.filtered_keys.clone(),
            values: Vec::new(),
            value_len: shard.value_len,
            versions: shard.filtered_versions.clone(),
            freqs: shard.filtered_freqs.clone(),
        }
    }

    /// Keeps only the ids belonging to `partition_id` of
    /// `partition_num` restore shards.
    pub fn filter_partition(&self, partition_id: usize, partition_num: usize) -> Self {
        assert!(partition_num > 0, "partition_num must be non-zero");
        assert!(partition_id < partition_num, "partition_id out of range");
        let mut out = Self::new(self.value_len);
        for i in 0..self.len() {
            let key = self.keys[i];
            if key.rem_euclid(partition_num as i64) as usize != partition_id {
                continue;
            }
            out.keys.push(key);
            out.versions.push(self.versions[i]);
            out.freqs.push(self.freqs[i]);
            if !self.values.is_empty() {
                out.values.extend_from_slice(self.value_row(i));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_buffer() -> RestoreBuffer {
        let mut buffer = RestoreBuffer::new(2);
        for key in 0..10 {
            buffer.push(key, &[key as f32, key as f32 + 0.5], key, key * 10);
        }
        buffer
    }

    #[test]
    fn test_partition_filter() {
        let buffer = sample_buffer();
        let shard0 = buffer.filter_partition(0, 3);
        let shard1 = buffer.filter_partition(1, 3);
        let shard2 = buffer.filter_partition(2, 3);

        assert_eq!(shard0.keys, vec![0, 3, 6, 9]);
        assert_eq!(shard1.keys, vec![1, 4, 7]);
        assert_eq!(shard2.keys, vec![2, 5, 8]);
        assert_eq!(
            shard0.len() + shard1.len() + shard2.len(),
            buffer.len()
        );
        assert_eq!(shard1.value_row(1), &[4.0, 4.5]);
        assert_eq!(shard1.versions, vec![1, 4, 7]);
        assert_eq!(shard1.freqs, vec![10, 40, 70]);
    }

    #[test]
    fn test_single_partition_keeps_all() {
        let buffer = sample_buffer();
        let all = buffer.filter_partition(0, 1);
        assert_eq!(all.keys, buffer.keys);
        assert_eq!(all.values, buffer.values);
    }

    #[test]
    fn test_negative_keys_partition() {
        let mut buffer = RestoreBuffer::new(1);
        buffer.push(-3, &[1.0], 0, 0);
        buffer.push(-2, &[2.0], 0, 0);
        // rem_euclid keeps negative ids in a valid shard.
        let shard1 = buffer.filter_partition(1, 2);
        assert_eq!(shard1.keys, vec![-3]);
        let shard0 = buffer.filter_partition(0, 2);
        assert_eq!(shard0.keys, vec![-2]);
    }

    #[test]
    fn test_filtered_buffer_has_no_payload() {
        let mut shard = ShardTensors::new(2);
        shard.push(1, &[1.0, 2.0], 5, 6);
        shard.push_filtered(2, 0, 1);

        let admitted = RestoreBuffer::from_shard(&shard);
        assert_eq!(admitted.keys, vec![1]);
        assert_eq!(admitted.value_row(0), &[1.0, 2.0]);

        let filtered = RestoreBuffer::filtered_from_shard(&shard);
        assert_eq!(filtered.keys, vec![2]);
        assert!(filtered.value_row(0).is_empty());
        assert_eq!(filtered.freqs, vec![1]);
    }
}
