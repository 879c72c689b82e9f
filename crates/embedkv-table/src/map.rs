//! Lock-free open-addressed map from feature id to slot handle.
//!
//! One map indexes one tier. Readers are wait-free: they probe the
//! current table with acquire loads and never mutate cells. Writers
//! publish `(key, handle)` pairs with CAS and park on a resize condition
//! while a doubling resize is in flight. Tombstones left by removals are
//! not reused during probing and are reclaimed by the next resize.
//!
//! Retired tables are kept alive until the map is dropped so that a
//! reader still probing a pre-resize table always dereferences valid
//! memory; with doubling growth the retired tables sum to less than the
//! final table's size.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use embedkv_core::key::{is_reserved, mix64, EMPTY_KEY, TOMBSTONE_KEY};

use crate::slot::{SlotHandle, ValueSlot};

/// Load factor (live + tombstones over capacity) above which the table
/// doubles.
const MAX_LOAD_NUM: usize = 7;
const MAX_LOAD_DEN: usize = 10;

struct Cell {
    key: AtomicI64,
    value: AtomicPtr<ValueSlot>,
}

struct Table {
    cells: Box<[Cell]>,
    mask: usize,
}

impl Table {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let cells = (0..capacity)
            .map(|_| Cell {
                key: AtomicI64::new(EMPTY_KEY),
                value: AtomicPtr::new(std::ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cells,
            mask: capacity - 1,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

struct Retired {
    tables: Vec<*mut Table>,
}

unsafe impl Send for Retired {}

/// Lock-free map from id to [`SlotHandle`].
///
/// The map stores handles only; slot lifetime is managed by the owning
/// tier, which destroys a slot only after removing it here.
pub struct LockFreeMap {
    current: AtomicPtr<Table>,
    retired: Mutex<Retired>,
    /// Live entries (exact, maintained by atomic counter).
    live: AtomicUsize,
    /// Claimed cells in the current table: live + tombstones.
    used: AtomicUsize,
    resizing: AtomicBool,
    active_writers: AtomicUsize,
    resize_lock: Mutex<()>,
    resize_cv: Condvar,
}

unsafe impl Send for LockFreeMap {}
unsafe impl Sync for LockFreeMap {}

impl LockFreeMap {
    /// Creates a map with at least `capacity` cells.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(16);
        let table = Box::into_raw(Box::new(Table::new(capacity)));
        Self {
            current: AtomicPtr::new(table),
            retired: Mutex::new(Retired {
                tables: vec![table],
            }),
            live: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            active_writers: AtomicUsize::new(0),
            resize_lock: Mutex::new(()),
            resize_cv: Condvar::new(),
        }
    }

    /// Creates a map with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    #[inline]
    fn table(&self) -> &Table {
        // The pointed-to table is freed only on drop.
        unsafe { &*self.current.load(Ordering::Acquire) }
    }

    /// Exact count of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// True if no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait-free lookup of the currently published handle for `key`.
    pub fn lookup(&self, key: i64) -> Option<SlotHandle> {
        debug_assert!(!is_reserved(key));
        let table = self.table();
        let mut idx = mix64(key) as usize & table.mask;
        loop {
            let cell = &table.cells[idx];
            let k = cell.key.load(Ordering::Acquire);
            if k == EMPTY_KEY {
                return None;
            }
            if k == key {
                let ptr = cell.value.load(Ordering::Acquire);
                if ptr.is_null() {
                    // Publish or removal in flight; linearize as absent.
                    return None;
                }
                return Some(unsafe { SlotHandle::from_raw(ptr) });
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// True if `key` is currently published.
    pub fn contains(&self, key: i64) -> bool {
        self.lookup(key).is_some()
    }

    fn writer_enter(&self) {
        loop {
            if self.resizing.load(Ordering::Acquire) {
                let mut guard = self.resize_lock.lock();
                while self.resizing.load(Ordering::Acquire) {
                    self.resize_cv.wait(&mut guard);
                }
            }
            self.active_writers.fetch_add(1, Ordering::AcqRel);
            if !self.resizing.load(Ordering::Acquire) {
                return;
            }
            // A resize started between the check and the registration;
            // back out and park.
            self.active_writers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[inline]
    fn writer_exit(&self) {
        self.active_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// CAS-inserts `(key, handle)`. On collision returns the winner's
    /// handle without modifying the table.
    ///
    /// # Panics
    ///
    /// Panics on a reserved key; callers validate ids before reaching
    /// the table.
    pub fn insert_if_absent(
        &self,
        key: i64,
        handle: SlotHandle,
    ) -> std::result::Result<(), SlotHandle> {
        assert!(!is_reserved(key), "reserved key {key} rejected");
        self.writer_enter();
        let result = self.insert_if_absent_inner(key, handle);
        self.writer_exit();
        if result.is_ok() {
            self.maybe_resize();
        }
        result
    }

    fn insert_if_absent_inner(
        &self,
        key: i64,
        handle: SlotHandle,
    ) -> std::result::Result<(), SlotHandle> {
        'restart: loop {
            let table = self.table();
            let mut idx = mix64(key) as usize & table.mask;
            loop {
                let cell = &table.cells[idx];
                let k = cell.key.load(Ordering::Acquire);
                if k == key {
                    // Someone claimed this key; wait for their publish.
                    loop {
                        let ptr = cell.value.load(Ordering::Acquire);
                        if !ptr.is_null() {
                            return Err(unsafe { SlotHandle::from_raw(ptr) });
                        }
                        if cell.key.load(Ordering::Acquire) != key {
                            // The claim turned into a removal; probe again.
                            continue 'restart;
                        }
                        std::hint::spin_loop();
                    }
                }
                if k == EMPTY_KEY {
                    match cell.key.compare_exchange(
                        EMPTY_KEY,
                        key,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            cell.value.store(handle.as_ptr(), Ordering::Release);
                            self.used.fetch_add(1, Ordering::AcqRel);
                            self.live.fetch_add(1, Ordering::AcqRel);
                            return Ok(());
                        }
                        Err(_) => {
                            // Lost the cell; re-examine it.
                            continue;
                        }
                    }
                }
                // Tombstone or another key: keep probing. Tombstones are
                // not reused so concurrent probe chains stay intact.
                idx = (idx + 1) & table.mask;
            }
        }
    }

    /// Replaces the published handle for `key`, inserting if absent.
    /// Returns the displaced handle, whose slot the caller now owns.
    ///
    /// Must not race a `remove` of the same key; the import and commit
    /// paths that use it hold that by construction.
    pub fn insert(&self, key: i64, handle: SlotHandle) -> Option<SlotHandle> {
        assert!(!is_reserved(key), "reserved key {key} rejected");
        loop {
            match self.insert_if_absent(key, handle) {
                Ok(()) => return None,
                Err(_winner) => {
                    self.writer_enter();
                    let displaced = self.replace_inner(key, handle);
                    self.writer_exit();
                    match displaced {
                        Some(old) => return Some(old),
                        // The winner vanished between the attempts; retry
                        // the plain insert.
                        None => continue,
                    }
                }
            }
        }
    }

    fn replace_inner(&self, key: i64, handle: SlotHandle) -> Option<SlotHandle> {
        let table = self.table();
        let mut idx = mix64(key) as usize & table.mask;
        loop {
            let cell = &table.cells[idx];
            let k = cell.key.load(Ordering::Acquire);
            if k == EMPTY_KEY {
                return None;
            }
            if k == key {
                let old = cell.value.swap(handle.as_ptr(), Ordering::AcqRel);
                if old.is_null() {
                    return None;
                }
                return Some(unsafe { SlotHandle::from_raw(old) });
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// Tombstones `key` and returns the handle that was published; the
    /// caller is responsible for destroying the slot.
    pub fn remove(&self, key: i64) -> Option<SlotHandle> {
        debug_assert!(!is_reserved(key));
        self.writer_enter();
        let result = self.remove_inner(key);
        self.writer_exit();
        result
    }

    fn remove_inner(&self, key: i64) -> Option<SlotHandle> {
        let table = self.table();
        let mut idx = mix64(key) as usize & table.mask;
        loop {
            let cell = &table.cells[idx];
            let k = cell.key.load(Ordering::Acquire);
            if k == EMPTY_KEY {
                return None;
            }
            if k == key {
                let ptr = cell.value.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if ptr.is_null() {
                    // Another remover won, or the insert never published.
                    return None;
                }
                cell.key.store(TOMBSTONE_KEY, Ordering::Release);
                self.live.fetch_sub(1, Ordering::AcqRel);
                return Some(unsafe { SlotHandle::from_raw(ptr) });
            }
            idx = (idx + 1) & table.mask;
        }
    }

    /// Unordered snapshot of the live entries.
    ///
    /// Does not block writers; inserts concurrent with the walk may be
    /// missed.
    pub fn iter(&self) -> Vec<(i64, SlotHandle)> {
        let table = self.table();
        let mut out = Vec::with_capacity(self.len());
        for cell in table.cells.iter() {
            let k = cell.key.load(Ordering::Acquire);
            if is_reserved(k) {
                continue;
            }
            let ptr = cell.value.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            out.push((k, unsafe { SlotHandle::from_raw(ptr) }));
        }
        out
    }

    fn maybe_resize(&self) {
        let table = self.table();
        if self.used.load(Ordering::Acquire) * MAX_LOAD_DEN <= table.capacity() * MAX_LOAD_NUM {
            return;
        }

        let _guard = self.resize_lock.lock();
        // Re-check under the lock; another writer may have resized.
        let table_ptr = self.current.load(Ordering::Acquire);
        let table = unsafe { &*table_ptr };
        if self.used.load(Ordering::Acquire) * MAX_LOAD_DEN <= table.capacity() * MAX_LOAD_NUM {
            return;
        }

        self.resizing.store(true, Ordering::Release);
        // Freeze: wait for in-flight writers to drain off the old table.
        while self.active_writers.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        // Size for the live count; tombstones are dropped here.
        let live = self.live.load(Ordering::Acquire);
        let mut new_capacity = table.capacity();
        while live * MAX_LOAD_DEN > new_capacity * MAX_LOAD_NUM / 2 {
            new_capacity *= 2;
        }
        let new_table = Box::new(Table::new(new_capacity));

        let mut copied = 0usize;
        for cell in table.cells.iter() {
            let k = cell.key.load(Ordering::Acquire);
            if is_reserved(k) {
                continue;
            }
            let ptr = cell.value.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            // Writers are frozen; plain probing stores suffice.
            let mut idx = mix64(k) as usize & new_table.mask;
            loop {
                let dst = &new_table.cells[idx];
                if dst.key.load(Ordering::Relaxed) == EMPTY_KEY {
                    dst.key.store(k, Ordering::Relaxed);
                    dst.value.store(ptr, Ordering::Relaxed);
                    break;
                }
                idx = (idx + 1) & new_table.mask;
            }
            copied += 1;
        }

        let new_ptr = Box::into_raw(new_table);
        self.retired.lock().tables.push(new_ptr);
        self.used.store(copied, Ordering::Release);
        self.current.store(new_ptr, Ordering::Release);
        self.resizing.store(false, Ordering::Release);
        self.resize_cv.notify_all();

        tracing::debug!(
            capacity = new_capacity,
            live = copied,
            "hash table resized"
        );
    }
}

impl Default for LockFreeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockFreeMap {
    fn drop(&mut self) {
        let retired = self.retired.get_mut();
        for table in retired.tables.drain(..) {
            drop(unsafe { Box::from_raw(table) });
        }
    }
}

impl std::fmt::Debug for LockFreeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeMap")
            .field("len", &self.len())
            .field("capacity", &self.table().capacity())
            .finish()
    }
}
