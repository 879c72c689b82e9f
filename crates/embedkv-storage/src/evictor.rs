//! Background eviction.
//!
//! One dedicated thread per storage stack sweeps over-budget tiers on a
//! fixed period, observing a shutdown flag at batch boundaries so drops
//! drain cleanly. The sweep itself lives in
//! [`LayeredStorage::evict_once`]; tests drive it directly through
//! [`EvictionManager::trigger`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::layered::LayeredStorage;

/// Owns the eviction thread for one storage stack.
pub struct EvictionManager {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EvictionManager {
    /// Spawns the eviction thread, sweeping every `interval`.
    pub fn start(storage: Arc<LayeredStorage>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("embedkv-evictor".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match storage.evict_once() {
                        Ok(moved) if moved > 0 => {
                            tracing::debug!(moved, "eviction sweep");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            // Background tasks log and continue on
                            // transient errors.
                            tracing::warn!(error = %err, "eviction sweep failed");
                        }
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("spawn evictor thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Runs one sweep on the calling thread.
    pub fn trigger(storage: &LayeredStorage) -> embedkv_core::Result<usize> {
        storage.evict_once()
    }

    /// Signals the thread to stop and joins it.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
