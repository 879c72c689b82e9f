//! Append-only, compacted SSD log of serialized value slots.
//!
//! The log is a sequence of segment files, each a magic header followed
//! by fixed-length records:
//!
//! ```text
//! [key:8][flags:8][version:8][freq:8][checksum:4][padding:4][payload: total_dims*4]
//! ```
//!
//! An in-memory manifest maps each id to the `(segment, offset, length)`
//! of its most recently committed record; per-segment live-byte counters
//! drive compaction. Segments have no footer: a torn trailing record is
//! detected by its checksum on restart and truncated away.
//!
//! Reads go through one of three schemes selected at startup
//! (`directio`, `mmap`, `mmap_and_madvise`); all three yield identical
//! bytes. Compaction runs inline after commit or on a dedicated task,
//! rewriting live records into the current write segment before
//! republishing their manifest entries and unlinking the source.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use memmap2::{Advice, Mmap};
use parking_lot::{Condvar, Mutex, RwLock};

use embedkv_core::config::{CompactionMode, IoScheme};
use embedkv_core::error::{Result, StoreError};

/// Magic bytes at the start of every segment file.
const SEGMENT_MAGIC: u32 = 0x454b_5653; // "EKVS"
/// Segment format version.
const SEGMENT_VERSION: u16 = 1;
/// Bytes of the segment header.
const SEGMENT_HEADER_BYTES: u64 = 8;
/// Bytes of one record header.
const RECORD_HEADER_BYTES: usize = 40;
/// Alignment of direct-io read windows.
const DIRECT_IO_ALIGN: u64 = 4096;

/// Location of one committed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Segment file number.
    pub segment: u64,
    /// Byte offset of the record header inside the segment.
    pub offset: u64,
    /// Total record length in bytes.
    pub length: u32,
}

/// Borrowed view of a record to be committed.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    /// Feature id.
    pub key: i64,
    /// Raw slot flag word.
    pub flags: u64,
    /// Last written global step.
    pub version: i64,
    /// Accumulated access count.
    pub frequency: i64,
    /// Payload floats; must be `total_dims` long.
    pub payload: &'a [f32],
}

/// Owned record read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedRecord {
    /// Feature id.
    pub key: i64,
    /// Raw slot flag word.
    pub flags: u64,
    /// Last written global step.
    pub version: i64,
    /// Accumulated access count.
    pub frequency: i64,
    /// Payload floats.
    pub payload: Vec<f32>,
}

struct Segment {
    id: u64,
    path: PathBuf,
    live_bytes: AtomicU64,
    total_bytes: AtomicU64,
    sealed: AtomicBool,
    mmap: Mutex<Option<Arc<Mmap>>>,
}

impl Segment {
    fn new(id: u64, path: PathBuf) -> Self {
        Self {
            id,
            path,
            live_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(SEGMENT_HEADER_BYTES),
            sealed: AtomicBool::new(false),
            mmap: Mutex::new(None),
        }
    }

    fn live_ratio(&self) -> f64 {
        let total = self
            .total_bytes
            .load(Ordering::Acquire)
            .saturating_sub(SEGMENT_HEADER_BYTES);
        if total == 0 {
            return 1.0;
        }
        self.live_bytes.load(Ordering::Acquire) as f64 / total as f64
    }

    fn mapping(&self) -> std::io::Result<Arc<Mmap>> {
        let mut guard = self.mmap.lock();
        if let Some(map) = guard.as_ref() {
            return Ok(Arc::clone(map));
        }
        let file = File::open(&self.path)?;
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        *guard = Some(Arc::clone(&map));
        Ok(map)
    }
}

struct Writer {
    file: File,
    segment: Arc<Segment>,
}

/// The append-only SSD log.
pub struct SsdLog {
    dir: PathBuf,
    total_dims: usize,
    segment_bytes: u64,
    compaction_threshold: f64,
    max_sealed_segments: usize,
    io_scheme: IoScheme,
    compaction_mode: CompactionMode,
    manifest: RwLock<HashMap<i64, RecordLocation>>,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
    writer: Mutex<Writer>,
    next_segment: AtomicU64,
    shutdown: Arc<AtomicBool>,
    compactor_wake: Arc<(Mutex<bool>, Condvar)>,
    compactor: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_lock: Mutex<()>,
}

/// Options for opening a log; the caller derives them from
/// [`StorageConfig`](embedkv_core::StorageConfig).
#[derive(Debug, Clone)]
pub struct SsdLogOptions {
    /// Maximum segment size before rotation.
    pub segment_bytes: u64,
    /// Live-ratio below which a sealed segment is compacted.
    pub compaction_threshold: f64,
    /// Sealed-segment count above which compaction runs regardless.
    pub max_sealed_segments: usize,
    /// Read scheme.
    pub io_scheme: IoScheme,
    /// Inline or background compaction.
    pub compaction_mode: CompactionMode,
}

impl Default for SsdLogOptions {
    fn default() -> Self {
        Self {
            segment_bytes: 64 * 1024 * 1024,
            compaction_threshold: 0.5,
            max_sealed_segments: 16,
            io_scheme: IoScheme::default(),
            compaction_mode: CompactionMode::default(),
        }
    }
}

impl SsdLog {
    /// Opens (or creates) a log in `dir` for payloads of `total_dims`
    /// floats, scanning any existing segments to rebuild the manifest.
    pub fn open(dir: impl Into<PathBuf>, total_dims: usize, options: SsdLogOptions) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut segments = BTreeMap::new();
        let mut manifest = HashMap::new();
        let mut max_id = 0u64;
        let record_len = (RECORD_HEADER_BYTES + total_dims * 4) as u64;

        let mut paths: Vec<(u64, PathBuf)> = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if let Some(id) = parse_segment_id(&path) {
                paths.push((id, path));
            }
        }
        paths.sort_by_key(|(id, _)| *id);

        for (id, path) in paths {
            max_id = max_id.max(id);
            let segment = Arc::new(Segment::new(id, path.clone()));
            recover_segment(&segment, total_dims, record_len, &mut manifest, &segments)?;
            segment.sealed.store(true, Ordering::Release);
            segments.insert(id, segment);
        }

        let next_id = max_id + 1;
        let (file, segment) = create_segment(&dir, next_id)?;
        segments.insert(next_id, Arc::clone(&segment));

        let log = Arc::new(Self {
            dir,
            total_dims,
            segment_bytes: options.segment_bytes,
            compaction_threshold: options.compaction_threshold,
            max_sealed_segments: options.max_sealed_segments,
            io_scheme: options.io_scheme,
            compaction_mode: options.compaction_mode,
            manifest: RwLock::new(manifest),
            segments: RwLock::new(segments),
            writer: Mutex::new(Writer { file, segment }),
            next_segment: AtomicU64::new(next_id + 1),
            shutdown: Arc::new(AtomicBool::new(false)),
            compactor_wake: Arc::new((Mutex::new(false), Condvar::new())),
            compactor: Mutex::new(None),
            compaction_lock: Mutex::new(()),
        });

        if log.compaction_mode == CompactionMode::Async {
            // The worker holds only a weak reference so dropping the
            // last external handle still shuts the log down.
            let worker = Arc::downgrade(&log);
            let shutdown = Arc::clone(&log.shutdown);
            let wake = Arc::clone(&log.compactor_wake);
            let handle = std::thread::Builder::new()
                .name("embedkv-compactor".into())
                .spawn(move || {
                    loop {
                        {
                            let (lock, cv) = &*wake;
                            let mut pending = lock.lock();
                            if !*pending {
                                cv.wait_for(&mut pending, Duration::from_millis(50));
                            }
                            *pending = false;
                        }
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let Some(log) = worker.upgrade() else {
                            break;
                        };
                        if let Err(err) = log.compact_now() {
                            tracing::warn!(error = %err, "background compaction failed");
                        }
                    }
                })
                .expect("spawn compactor thread");
            *log.compactor.lock() = Some(handle);
        }

        tracing::info!(
            path = %log.dir.display(),
            records = log.len(),
            "SSD log opened"
        );
        Ok(log)
    }

    /// Payload size in floats of every record.
    pub fn total_dims(&self) -> usize {
        self.total_dims
    }

    /// Number of ids currently in the manifest.
    pub fn len(&self) -> usize {
        self.manifest.read().len()
    }

    /// True if no ids are committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` has a committed record.
    pub fn contains(&self, key: i64) -> bool {
        self.manifest.read().contains_key(&key)
    }

    /// All committed ids, unordered.
    pub fn keys(&self) -> Vec<i64> {
        self.manifest.read().keys().copied().collect()
    }

    fn record_len(&self) -> u64 {
        (RECORD_HEADER_BYTES + self.total_dims * 4) as u64
    }

    /// Appends `records` sequentially, fsyncs, and publishes their
    /// manifest entries. Returns the written locations.
    pub fn flush_batch(&self, records: &[RecordRef<'_>]) -> Result<Vec<RecordLocation>> {
        let mut locations = Vec::with_capacity(records.len());
        {
            let mut writer = self.writer.lock();
            for record in records {
                let location = self.append_one(&mut writer, record, None)?;
                if let Some(location) = location {
                    locations.push(location);
                }
            }
            writer.file.sync_data().map_err(|e| StoreError::Io {
                path: writer.segment.path.clone(),
                source: e,
            })?;
        }
        self.after_commit()?;
        Ok(locations)
    }

    /// Commits one record.
    pub fn commit(&self, record: RecordRef<'_>) -> Result<RecordLocation> {
        let mut locations = self.flush_batch(std::slice::from_ref(&record))?;
        Ok(locations.pop().expect("single record committed"))
    }

    fn after_commit(&self) -> Result<()> {
        match self.compaction_mode {
            CompactionMode::Sync => self.compact_now(),
            CompactionMode::Async => {
                let (lock, cv) = &*self.compactor_wake;
                *lock.lock() = true;
                cv.notify_one();
                Ok(())
            }
        }
    }

    /// Appends one record under the writer lock. When `expect` is set
    /// (compaction), the manifest entry is republished only if it still
    /// points at the expected source location; otherwise the bytes are
    /// left dead and `None` is returned.
    fn append_one(
        &self,
        writer: &mut Writer,
        record: &RecordRef<'_>,
        expect: Option<RecordLocation>,
    ) -> Result<Option<RecordLocation>> {
        if record.payload.len() != self.total_dims {
            return Err(StoreError::invalid_argument(format!(
                "payload of {} floats does not match total_dims {}",
                record.payload.len(),
                self.total_dims
            )));
        }

        let record_len = self.record_len();
        let offset = writer.segment.total_bytes.load(Ordering::Acquire);
        let offset = if offset + record_len > self.segment_bytes.max(SEGMENT_HEADER_BYTES + record_len)
        {
            self.rotate(writer)?;
            writer.segment.total_bytes.load(Ordering::Acquire)
        } else {
            offset
        };

        let bytes = encode_record(record);
        writer.file.write_all(&bytes).map_err(|e| StoreError::Io {
            path: writer.segment.path.clone(),
            source: e,
        })?;
        writer
            .segment
            .total_bytes
            .store(offset + record_len, Ordering::Release);

        let location = RecordLocation {
            segment: writer.segment.id,
            offset,
            length: record_len as u32,
        };

        let previous = {
            let mut manifest = self.manifest.write();
            if let Some(expected) = expect {
                match manifest.get(&record.key) {
                    Some(current) if *current == expected => {}
                    // Overwritten while compaction was scanning; the
                    // fresher record wins and these bytes stay dead.
                    _ => return Ok(None),
                }
            }
            manifest.insert(record.key, location)
        };

        writer
            .segment
            .live_bytes
            .fetch_add(record_len, Ordering::AcqRel);
        if let Some(previous) = previous {
            self.release_location(previous);
        }
        Ok(Some(location))
    }

    fn rotate(&self, writer: &mut Writer) -> Result<()> {
        writer.file.sync_data().map_err(|e| StoreError::Io {
            path: writer.segment.path.clone(),
            source: e,
        })?;
        writer.segment.sealed.store(true, Ordering::Release);

        let id = self.next_segment.fetch_add(1, Ordering::AcqRel);
        let (file, segment) = create_segment(&self.dir, id)?;
        self.segments.write().insert(id, Arc::clone(&segment));
        tracing::debug!(segment = id, "SSD log rotated");
        writer.file = file;
        writer.segment = segment;
        Ok(())
    }

    fn release_location(&self, location: RecordLocation) {
        let segments = self.segments.read();
        if let Some(segment) = segments.get(&location.segment) {
            segment
                .live_bytes
                .fetch_sub(location.length as u64, Ordering::AcqRel);
        }
    }

    /// Removes `key` from the manifest. Returns true if it was present.
    pub fn remove(&self, key: i64) -> bool {
        let removed = self.manifest.write().remove(&key);
        match removed {
            Some(location) => {
                self.release_location(location);
                true
            }
            None => false,
        }
    }

    /// Reads the most recently committed record for `key`.
    pub fn get(&self, key: i64) -> Result<Option<OwnedRecord>> {
        let location = match self.manifest.read().get(&key) {
            Some(location) => *location,
            None => return Ok(None),
        };
        let segment = {
            let segments = self.segments.read();
            match segments.get(&location.segment) {
                Some(segment) => Arc::clone(segment),
                None => return Ok(None),
            }
        };

        let bytes = self.read_record_bytes(&segment, location)?;
        match decode_record(&bytes, self.total_dims) {
            Some(record) => Ok(Some(record)),
            None => {
                // Drop the damaged record so later lookups miss cleanly.
                tracing::error!(key, segment = segment.id, offset = location.offset,
                    "dropping record with bad checksum");
                self.manifest.write().remove(&key);
                self.release_location(location);
                Err(StoreError::Corruption {
                    path: segment.path.clone(),
                    offset: location.offset,
                    message: format!("checksum mismatch reading key {key}"),
                })
            }
        }
    }

    fn read_record_bytes(&self, segment: &Segment, location: RecordLocation) -> Result<Vec<u8>> {
        let sealed = segment.sealed.load(Ordering::Acquire);
        let use_mmap = sealed && self.io_scheme != IoScheme::DirectIo;
        if use_mmap {
            let map = segment.mapping().map_err(|e| StoreError::Io {
                path: segment.path.clone(),
                source: e,
            })?;
            let start = location.offset as usize;
            let end = start + location.length as usize;
            if end > map.len() {
                return Err(StoreError::Corruption {
                    path: segment.path.clone(),
                    offset: location.offset,
                    message: "record past end of mapped segment".to_string(),
                });
            }
            if self.io_scheme == IoScheme::MmapAndMadvise {
                let page = DIRECT_IO_ALIGN as usize;
                let astart = start / page * page;
                let alen = (end - astart + page - 1) / page * page;
                let alen = alen.min(map.len() - astart);
                if let Err(err) = map.advise_range(Advice::WillNeed, astart, alen) {
                    tracing::debug!(error = %err, "madvise(WILLNEED) failed");
                }
            }
            return Ok(map[start..end].to_vec());
        }

        // Aligned positional read; also the fallback for the unsealed
        // write segment under the mmap schemes.
        let file = File::open(&segment.path).map_err(|e| StoreError::Io {
            path: segment.path.clone(),
            source: e,
        })?;
        let start = location.offset / DIRECT_IO_ALIGN * DIRECT_IO_ALIGN;
        let end = location.offset + location.length as u64;
        let window = (end - start + DIRECT_IO_ALIGN - 1) / DIRECT_IO_ALIGN * DIRECT_IO_ALIGN;
        let mut buffer = vec![0u8; window as usize];
        let needed = (end - start) as usize;
        let mut filled = 0usize;
        while filled < needed {
            let n = file
                .read_at(&mut buffer[filled..], start + filled as u64)
                .map_err(|e| StoreError::Io {
                    path: segment.path.clone(),
                    source: e,
                })?;
            if n == 0 {
                return Err(StoreError::Corruption {
                    path: segment.path.clone(),
                    offset: location.offset,
                    message: "record truncated".to_string(),
                });
            }
            filled += n;
        }
        let skip = (location.offset - start) as usize;
        Ok(buffer[skip..skip + location.length as usize].to_vec())
    }

    /// Runs compaction passes until no sealed segment is eligible.
    ///
    /// A sealed segment is eligible when its live ratio falls below the
    /// configured threshold, or when the number of sealed segments
    /// exceeds the cap (oldest first).
    pub fn compact_now(&self) -> Result<()> {
        let _guard = self.compaction_lock.lock();
        loop {
            let victim = self.pick_victim();
            let victim = match victim {
                Some(victim) => victim,
                None => return Ok(()),
            };
            self.compact_segment(&victim)?;
        }
    }

    fn sealed_segments(&self) -> Vec<Arc<Segment>> {
        self.segments
            .read()
            .values()
            .filter(|s| s.sealed.load(Ordering::Acquire))
            .cloned()
            .collect()
    }

    fn pick_victim(&self) -> Option<Arc<Segment>> {
        let sealed = self.sealed_segments();
        // Dead segments first: they only need unlinking.
        if let Some(dead) = sealed
            .iter()
            .find(|s| s.live_bytes.load(Ordering::Acquire) == 0)
        {
            return Some(Arc::clone(dead));
        }
        let below = sealed
            .iter()
            .filter(|s| s.live_ratio() < self.compaction_threshold)
            .min_by_key(|s| s.id);
        if let Some(victim) = below {
            return Some(Arc::clone(victim));
        }
        if sealed.len() > self.max_sealed_segments {
            return sealed.into_iter().min_by_key(|s| s.id);
        }
        None
    }

    fn compact_segment(&self, victim: &Arc<Segment>) -> Result<()> {
        tracing::debug!(
            segment = victim.id,
            live_ratio = victim.live_ratio(),
            "compacting segment"
        );
        let data = std::fs::read(&victim.path).map_err(|e| StoreError::Io {
            path: victim.path.clone(),
            source: e,
        })?;
        let record_len = self.record_len() as usize;
        let mut offset = SEGMENT_HEADER_BYTES as usize;

        while offset + record_len <= data.len() {
            let bytes = &data[offset..offset + record_len];
            if let Some(record) = decode_record(bytes, self.total_dims) {
                let source = RecordLocation {
                    segment: victim.id,
                    offset: offset as u64,
                    length: record_len as u32,
                };
                let still_live = self.manifest.read().get(&record.key) == Some(&source);
                if still_live {
                    let record_ref = RecordRef {
                        key: record.key,
                        flags: record.flags,
                        version: record.version,
                        frequency: record.frequency,
                        payload: &record.payload,
                    };
                    // Republishing moves the manifest entry off the
                    // victim and releases its live bytes.
                    let mut writer = self.writer.lock();
                    self.append_one(&mut writer, &record_ref, Some(source))?;
                }
            }
            offset += record_len;
        }

        {
            let writer = self.writer.lock();
            writer.file.sync_data().map_err(|e| StoreError::Io {
                path: writer.segment.path.clone(),
                source: e,
            })?;
        }

        // Every live record has been republished; unlink the source.
        self.segments.write().remove(&victim.id);
        if let Err(err) = std::fs::remove_file(&victim.path) {
            tracing::warn!(path = %victim.path.display(), error = %err,
                "failed to unlink compacted segment");
        }
        tracing::debug!(segment = victim.id, "segment compacted");
        Ok(())
    }

    /// Seals the current write segment and fsyncs it.
    pub fn flush(&self) -> Result<()> {
        let writer = self.writer.lock();
        writer.file.sync_data().map_err(|e| StoreError::Io {
            path: writer.segment.path.clone(),
            source: e,
        })
    }

    /// Number of segment files currently on disk.
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }
}

impl Drop for SsdLog {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let (lock, cv) = &*self.compactor_wake;
        *lock.lock() = true;
        cv.notify_all();
        if let Some(handle) = self.compactor.lock().take() {
            // The final drop can land on the compactor itself (it holds
            // a transient strong reference while compacting); a thread
            // cannot join itself, so detach in that case.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for SsdLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsdLog")
            .field("dir", &self.dir)
            .field("total_dims", &self.total_dims)
            .field("records", &self.len())
            .field("segments", &self.segment_count())
            .finish()
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg_{id:08}.emb"))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix("seg_")?.strip_suffix(".emb")?;
    stem.parse().ok()
}

fn create_segment(dir: &Path, id: u64) -> Result<(File, Arc<Segment>)> {
    let path = segment_path(dir, id);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
    let mut header = Vec::with_capacity(SEGMENT_HEADER_BYTES as usize);
    header.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    header.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes());
    file.write_all(&header).map_err(|e| StoreError::Io {
        path: path.clone(),
        source: e,
    })?;
    Ok((file, Arc::new(Segment::new(id, path))))
}

fn encode_record(record: &RecordRef<'_>) -> Vec<u8> {
    let payload_bytes = record.payload.len() * 4;
    let mut bytes = Vec::with_capacity(RECORD_HEADER_BYTES + payload_bytes);
    bytes.extend_from_slice(&record.key.to_le_bytes());
    bytes.extend_from_slice(&record.flags.to_le_bytes());
    bytes.extend_from_slice(&record.version.to_le_bytes());
    bytes.extend_from_slice(&record.frequency.to_le_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..32]);
    for value in record.payload {
        hasher.update(&value.to_le_bytes());
    }
    let checksum = hasher.finalize();

    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    for value in record.payload {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_record(bytes: &[u8], total_dims: usize) -> Option<OwnedRecord> {
    if bytes.len() < RECORD_HEADER_BYTES + total_dims * 4 {
        return None;
    }
    let key = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let flags = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
    let version = i64::from_le_bytes(bytes[16..24].try_into().ok()?);
    let frequency = i64::from_le_bytes(bytes[24..32].try_into().ok()?);
    let stored_checksum = u32::from_le_bytes(bytes[32..36].try_into().ok()?);

    let payload_bytes = &bytes[RECORD_HEADER_BYTES..RECORD_HEADER_BYTES + total_dims * 4];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..32]);
    hasher.update(payload_bytes);
    if hasher.finalize() != stored_checksum {
        return None;
    }

    let mut payload = Vec::with_capacity(total_dims);
    for chunk in payload_bytes.chunks_exact(4) {
        payload.push(f32::from_le_bytes(chunk.try_into().ok()?));
    }
    Some(OwnedRecord {
        key,
        flags,
        version,
        frequency,
        payload,
    })
}

/// Scans a recovered segment, rebuilding manifest entries (latest wins)
/// and truncating a torn tail.
fn recover_segment(
    segment: &Arc<Segment>,
    total_dims: usize,
    record_len: u64,
    manifest: &mut HashMap<i64, RecordLocation>,
    earlier: &BTreeMap<u64, Arc<Segment>>,
) -> Result<()> {
    let data = std::fs::read(&segment.path).map_err(|e| StoreError::Io {
        path: segment.path.clone(),
        source: e,
    })?;

    if data.len() < SEGMENT_HEADER_BYTES as usize
        || u32::from_le_bytes(data[0..4].try_into().unwrap()) != SEGMENT_MAGIC
    {
        tracing::warn!(path = %segment.path.display(), "segment missing magic, skipping");
        return Ok(());
    }

    let mut offset = SEGMENT_HEADER_BYTES;
    let mut valid_end = offset;
    loop {
        let start = offset as usize;
        if start + record_len as usize > data.len() {
            // Torn trailing record, or a clean end of segment.
            break;
        }
        let bytes = &data[start..start + record_len as usize];
        match decode_record(bytes, total_dims) {
            Some(record) => {
                let location = RecordLocation {
                    segment: segment.id,
                    offset,
                    length: record_len as u32,
                };
                if let Some(previous) = manifest.insert(record.key, location) {
                    if previous.segment == segment.id {
                        segment
                            .live_bytes
                            .fetch_sub(record_len, Ordering::AcqRel);
                    } else if let Some(prev_segment) = earlier.get(&previous.segment) {
                        prev_segment
                            .live_bytes
                            .fetch_sub(record_len, Ordering::AcqRel);
                    }
                }
                segment.live_bytes.fetch_add(record_len, Ordering::AcqRel);
                offset += record_len;
                valid_end = offset;
            }
            None => {
                tracing::error!(
                    path = %segment.path.display(),
                    offset,
                    "corrupt record during recovery, truncating"
                );
                break;
            }
        }
    }

    if (valid_end as usize) < data.len() {
        let file = OpenOptions::new()
            .write(true)
            .open(&segment.path)
            .map_err(|e| StoreError::Io {
                path: segment.path.clone(),
                source: e,
            })?;
        file.set_len(valid_end).map_err(|e| StoreError::Io {
            path: segment.path.clone(),
            source: e,
        })?;
    }
    segment.total_bytes.store(valid_end, Ordering::Release);
    Ok(())
}
