// Device memory glue — raw byte buffers for generated GPU code
//
// Buffers are untyped byte ranges. Every copy and fill takes an explicit
// byte count that must fit the buffers involved.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, DeviceSlice};
use log::{debug, trace};
use shrew_core::{Error, Result};

use crate::pool::{BufferPool, PoolStats};

fn driver_err(what: &str, e: impl std::fmt::Display) -> Error {
    Error::msg(format!("{what} failed: {e}"))
}

/// A device allocation of `len()` bytes.
pub struct GpuBuffer {
    slice: CudaSlice<u8>,
}

impl GpuBuffer {
    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.len() == 0
    }
}

/// Device handle plus a cache of freed buffers.
pub struct GpuMemory {
    dev: Arc<CudaDevice>,
    pool: BufferPool,
    ordinal: usize,
}

impl GpuMemory {
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = CudaDevice::new(ordinal).map_err(|e| driver_err("CUDA device creation", e))?;
        debug!("gpu memory: opened device {}", ordinal);
        Ok(GpuMemory {
            dev,
            pool: BufferPool::new(),
            ordinal,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn check_fits(what: &str, size: usize, available: usize) -> Result<()> {
        if size > available {
            return Err(Error::msg(format!(
                "{what}: {size} bytes requested, buffer holds {available}"
            )));
        }
        Ok(())
    }

    /// Allocate `size` bytes, reusing a freed buffer of the same size.
    pub fn create_gpu_buffer(&self, size: usize) -> Result<GpuBuffer> {
        let slice = self
            .pool
            .alloc(&self.dev, size)
            .map_err(|e| driver_err("cudaMalloc", e))?;
        trace!("gpu memory: buffer of {} bytes", size);
        Ok(GpuBuffer { slice })
    }

    /// Return a buffer to the cache.
    pub fn free_gpu_buffer(&self, buffer: GpuBuffer) {
        self.pool.reclaim(buffer.slice);
    }

    /// Release cached buffers to the driver.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Copy `src` into the start of `dst`.
    pub fn memcpy_htod(&self, dst: &mut GpuBuffer, src: &[u8]) -> Result<()> {
        Self::check_fits("memcpy host to device", src.len(), dst.len())?;
        let mut view = dst.slice.slice_mut(0..src.len());
        self.dev
            .htod_sync_copy_into(src, &mut view)
            .map_err(|e| driver_err("memcpy host to device", e))
    }

    /// Copy the first `dst.len()` bytes of `src` to the host.
    pub fn memcpy_dtoh(&self, dst: &mut [u8], src: &GpuBuffer) -> Result<()> {
        Self::check_fits("memcpy device to host", dst.len(), src.len())?;
        let view = src.slice.slice(0..dst.len());
        self.dev
            .dtoh_sync_copy_into(&view, dst)
            .map_err(|e| driver_err("memcpy device to host", e))
    }

    /// Copy the first `size` bytes of `src` into `dst`.
    pub fn memcpy_dtod(&self, dst: &mut GpuBuffer, src: &GpuBuffer, size: usize) -> Result<()> {
        Self::check_fits("memcpy device to device", size, src.len().min(dst.len()))?;
        let from = src.slice.slice(0..size);
        let mut to = dst.slice.slice_mut(0..size);
        self.dev
            .dtod_copy(&from, &mut to)
            .map_err(|e| driver_err("memcpy device to device", e))
    }

    /// Fill the first `size` bytes of `dst` with `value`.
    pub fn memset(&self, dst: &mut GpuBuffer, value: u8, size: usize) -> Result<()> {
        Self::check_fits("memset", size, dst.len())?;
        let mut view = dst.slice.slice_mut(0..size);
        let res = if value == 0 {
            self.dev.memset_zeros(&mut view)
        } else {
            self.dev.htod_sync_copy_into(&vec![value; size], &mut view)
        };
        res.map_err(|e| driver_err("memset", e))
    }

    /// `{a, b, c}` rendering of the first `count` f32 values in `buffer`.
    pub fn format_f32_tensor(&self, buffer: &GpuBuffer, count: usize) -> Result<String> {
        let mut bytes = vec![0u8; count * std::mem::size_of::<f32>()];
        self.memcpy_dtoh(&mut bytes, buffer)?;
        let values: Vec<String> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]).to_string())
            .collect();
        Ok(format!("{{{}}}", values.join(", ")))
    }
}
