//! Fixed-size payload pool.
//!
//! One pool serves one tier's payload buffers: all buffers share a
//! single size (the tier's `total_dims` floats) and 16-byte alignment.
//! The free list grows by whole blocks from the underlying allocator and
//! never returns memory to it while the pool is alive, which is what
//! keeps published payload pointers valid for the process lifetime.
//!
//! The pool sits on the eviction/promotion path, which is already rate
//! limited by cache hit rates, so a single lightweight exclusive lock
//! around the free list is sufficient.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;

use embedkv_core::layout::SLOT_ALIGN_BYTES;

struct PoolInner {
    free: Vec<NonNull<f32>>,
    blocks: Vec<NonNull<u8>>,
    total_buffers: usize,
}

// NonNull is !Send/!Sync; the inner state is only reached through the
// pool's mutex.
unsafe impl Send for PoolInner {}

/// Slab allocator of fixed-size, 16-byte-aligned float buffers.
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
    buffer_floats: usize,
    block_size: usize,
}

unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Creates a pool of buffers holding `buffer_floats` floats each,
    /// growing `block_size` buffers at a time.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(buffer_floats: usize, block_size: usize) -> Self {
        assert!(buffer_floats > 0, "buffer_floats must be non-zero");
        assert!(block_size > 0, "block_size must be non-zero");
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                blocks: Vec::new(),
                total_buffers: 0,
            }),
            buffer_floats,
            block_size,
        }
    }

    /// Size of each buffer in floats.
    pub fn buffer_floats(&self) -> usize {
        self.buffer_floats
    }

    fn buffer_bytes(&self) -> usize {
        // Round each buffer up to the alignment so every buffer in a
        // block starts on a 16-byte boundary.
        let bytes = self.buffer_floats * std::mem::size_of::<f32>();
        (bytes + SLOT_ALIGN_BYTES - 1) / SLOT_ALIGN_BYTES * SLOT_ALIGN_BYTES
    }

    fn block_layout(&self) -> Layout {
        Layout::from_size_align(self.buffer_bytes() * self.block_size, SLOT_ALIGN_BYTES)
            .expect("pool block layout")
    }

    /// Hands out one zeroed buffer. O(1) unless the free list is empty,
    /// in which case a new block is carved into the free list first.
    pub fn allocate(&self) -> NonNull<f32> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            self.grow(&mut inner);
        }
        let ptr = inner.free.pop().expect("free list refilled by grow");
        drop(inner);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, self.buffer_floats);
        }
        ptr
    }

    fn grow(&self, inner: &mut PoolInner) {
        let layout = self.block_layout();
        let block = unsafe { alloc(layout) };
        let block = NonNull::new(block).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        let stride = self.buffer_bytes();
        for i in 0..self.block_size {
            let ptr = unsafe { block.as_ptr().add(i * stride) } as *mut f32;
            inner.free.push(unsafe { NonNull::new_unchecked(ptr) });
        }
        inner.blocks.push(block);
        inner.total_buffers += self.block_size;
        tracing::debug!(
            buffers = inner.total_buffers,
            block_bytes = layout.size(),
            "memory pool grew"
        );
    }

    /// Returns one buffer to the free list.
    pub fn deallocate(&self, ptr: NonNull<f32>) {
        self.inner.lock().free.push(ptr);
    }

    /// Returns a batch of buffers to the free list under one lock hold.
    pub fn deallocate_many(&self, ptrs: impl IntoIterator<Item = NonNull<f32>>) {
        let mut inner = self.inner.lock();
        inner.free.extend(ptrs);
    }

    /// Number of buffers currently handed out.
    pub fn allocated(&self) -> usize {
        let inner = self.inner.lock();
        inner.total_buffers - inner.free.len()
    }

    /// Total buffers ever carved from the underlying allocator.
    pub fn capacity(&self) -> usize {
        self.inner.lock().total_buffers
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let layout = self.block_layout();
        let inner = self.inner.get_mut();
        for block in inner.blocks.drain(..) {
            unsafe { dealloc(block.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryPool")
            .field("buffer_floats", &self.buffer_floats)
            .field("block_size", &self.block_size)
            .field("total_buffers", &inner.total_buffers)
            .field("free", &inner.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_reuse() {
        let pool = MemoryPool::new(8, 4);
        assert_eq!(pool.capacity(), 0);

        let a = pool.allocate();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.allocated(), 1);

        pool.deallocate(a);
        assert_eq!(pool.allocated(), 0);

        // The freed buffer is handed out again before the pool grows.
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.allocate());
        }
        assert_eq!(pool.capacity(), 4);
        assert!(seen.iter().any(|p| p.as_ptr() == a.as_ptr()));
        pool.deallocate_many(seen);
    }

    #[test]
    fn test_grows_by_blocks() {
        let pool = MemoryPool::new(4, 2);
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.allocate());
        }
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.allocated(), 5);
        pool.deallocate_many(held);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.capacity(), 6);
    }

    #[test]
    fn test_buffers_are_aligned_and_zeroed() {
        let pool = MemoryPool::new(3, 8);
        let mut held = Vec::new();
        for _ in 0..16 {
            let ptr = pool.allocate();
            assert_eq!(ptr.as_ptr() as usize % SLOT_ALIGN_BYTES, 0);
            let values = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 3) };
            assert_eq!(values, &[0.0, 0.0, 0.0]);
            held.push(ptr);
        }
        pool.deallocate_many(held);
    }

    #[test]
    fn test_recycled_buffer_is_zeroed_again() {
        let pool = MemoryPool::new(4, 2);
        let ptr = pool.allocate();
        unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr(), 4).copy_from_slice(&[1.0; 4]);
        }
        pool.deallocate(ptr);

        let mut held = Vec::new();
        for _ in 0..2 {
            let p = pool.allocate();
            let values = unsafe { std::slice::from_raw_parts(p.as_ptr(), 4) };
            assert_eq!(values, &[0.0; 4]);
            held.push(p);
        }
        pool.deallocate_many(held);
    }

    #[test]
    fn test_concurrent_allocate() {
        use std::sync::Arc;

        let pool = Arc::new(MemoryPool::new(8, 64));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            threads.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..256 {
                    held.push(pool.allocate());
                }
                pool.deallocate_many(held);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(pool.allocated(), 0);
    }
}
