//! Checkpoint export and restore of embedding variables.
//!
//! Export assembles a [`ShardTensors`] from a variable's snapshot (the
//! SSD remainder drained lazily), orders it for save, and writes it as
//! one tensor bundle per shard. Restore loads the bundle back into
//! buffers and feeds them through [`EmbeddingVariable::import`], shadow
//! ids included.

use std::path::{Path, PathBuf};

use embedkv_core::error::{Result, StoreError};
use embedkv_checkpoint::{
    BundleReader, BundleWriter, CheckpointError, RestoreBuffer, ShardTensors,
};

use crate::variable::EmbeddingVariable;

fn from_checkpoint_err(err: CheckpointError) -> StoreError {
    match err {
        CheckpointError::Io { path, source } => StoreError::Io { path, source },
        CheckpointError::NotFound(path) => StoreError::Io {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "bundle not found"),
            path,
        },
        CheckpointError::Corrupted { path, message } => StoreError::Corruption {
            path,
            offset: 0,
            message,
        },
        CheckpointError::Serialization { message }
        | CheckpointError::InvalidBundle { message } => StoreError::InvalidArgument { message },
    }
}

/// File name of one shard bundle.
pub fn shard_file_name(variable: &str, partition_id: usize) -> String {
    format!("{}.part_{partition_id}.ckpt", variable.replace('/', "_"))
}

/// Assembles the shard tensors for `partition_id` of `partition_num`,
/// draining all tiers and ordering keys for save.
pub fn export_shard(
    variable: &EmbeddingVariable,
    partition_id: usize,
    partition_num: usize,
) -> Result<ShardTensors> {
    if partition_num == 0 || partition_id >= partition_num {
        return Err(StoreError::invalid_argument(format!(
            "partition {partition_id}/{partition_num} out of range"
        )));
    }
    let in_shard =
        |key: i64| key.rem_euclid(partition_num as i64) as usize == partition_id;

    let snapshot = variable.get_snapshot()?;
    let mut shard = ShardTensors::new(variable.value_len());

    for (i, &key) in snapshot.keys.iter().enumerate() {
        if in_shard(key) {
            shard.push(
                key,
                &snapshot.values[i],
                snapshot.versions[i],
                snapshot.freqs[i],
            );
        }
    }
    for (i, &key) in snapshot.filtered_keys.iter().enumerate() {
        if in_shard(key) {
            shard.push_filtered(
                key,
                snapshot.filtered_versions[i],
                snapshot.filtered_freqs[i],
            );
        }
    }
    for (key, row, version, freq) in snapshot.ssd_remainder {
        if in_shard(key) {
            shard.push(key, &row, version, freq);
        }
    }

    shard.sort_for_save();
    Ok(shard)
}

/// Exports one shard to `dir`, returning the bundle path.
pub fn save_shard(
    variable: &EmbeddingVariable,
    dir: &Path,
    partition_id: usize,
    partition_num: usize,
) -> Result<PathBuf> {
    let shard = export_shard(variable, partition_id, partition_num)?;
    let count = shard.len();
    let bundle = shard.into_bundle(variable.name(), partition_id);
    let path = dir.join(shard_file_name(variable.name(), partition_id));
    BundleWriter::new()
        .write_to_file(&path, &bundle)
        .map_err(from_checkpoint_err)?;
    tracing::info!(
        variable = variable.name(),
        partition = partition_id,
        keys = count,
        path = %path.display(),
        "shard exported"
    );
    Ok(path)
}

/// Loads the shard tensors saved for `saved_partition` of `variable`.
pub fn load_shard(dir: &Path, variable: &str, saved_partition: usize) -> Result<ShardTensors> {
    let path = dir.join(shard_file_name(variable, saved_partition));
    let bundle = BundleReader::new()
        .read_from_file(&path)
        .map_err(from_checkpoint_err)?;
    ShardTensors::from_bundle(&bundle, variable, saved_partition).map_err(from_checkpoint_err)
}

/// Restores a saved shard into `variable`, admitted and shadow ids
/// alike, honoring the restore-side partitioning. Returns how many ids
/// were imported.
pub fn restore_shard(
    variable: &EmbeddingVariable,
    dir: &Path,
    saved_partition: usize,
    partition_id: usize,
    partition_num: usize,
) -> Result<usize> {
    let shard = load_shard(dir, variable.name(), saved_partition)?;
    let admitted = RestoreBuffer::from_shard(&shard);
    let filtered = RestoreBuffer::filtered_from_shard(&shard);

    let mut imported = variable.import(&admitted, partition_id, partition_num, false)?;
    imported += variable.import(&filtered, partition_id, partition_num, true)?;
    Ok(imported)
}
