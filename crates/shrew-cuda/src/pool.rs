// Device buffer cache — reuse freed GPU buffers of the same byte size
//
// Freed buffers are not returned to the driver; they go into a free list
// keyed by byte size and serve the next allocation of that size. The cache
// is released as a whole with `empty_cache` or when the pool is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice, DriverError};

/// Snapshot of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Bytes held by cached (free) buffers.
    pub cached_bytes: usize,
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that went to the driver.
    pub misses: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferPool: {} cached buffers ({} bytes), {} hits, {} misses",
            self.cached_buffers, self.cached_bytes, self.hits, self.misses
        )
    }
}

pub(crate) struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<CudaSlice<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        BufferPool {
            buckets: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<usize, Vec<CudaSlice<u8>>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A buffer of exactly `size` bytes. Contents are undefined.
    pub(crate) fn alloc(&self, dev: &Arc<CudaDevice>, size: usize) -> Result<CudaSlice<u8>, DriverError> {
        if let Some(buf) = self.buckets().get_mut(&size).and_then(|stack| stack.pop()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buf);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        dev.alloc_zeros::<u8>(size)
    }

    pub(crate) fn reclaim(&self, buf: CudaSlice<u8>) {
        self.buckets().entry(buf.len()).or_default().push(buf);
    }

    /// Drop every cached buffer, releasing it to the driver.
    pub(crate) fn empty_cache(&self) {
        self.buckets().clear();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let buckets = self.buckets();
        let (cached_buffers, cached_bytes) = buckets
            .iter()
            .fold((0, 0), |(n, b), (size, stack)| (n + stack.len(), b + size * stack.len()));
        PoolStats {
            cached_bytes,
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
