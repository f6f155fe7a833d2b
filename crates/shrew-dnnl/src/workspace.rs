// Workspace Manager — scratch buffers shared across kernel pairs
//
// Some kernels need memory beyond their declared inputs and outputs: max
// pooling records the argmax of each window for its backward pass, and RNN
// cells stash per-gate intermediates. The emitter allocates those buffers
// here, hands out a WorkspaceHandle, and records the handle in every
// dependency list that uses the buffer (both halves of a forward/backward
// pair reference the same one).
//
// Buffers are zero-initialised host memory aligned to the engine's workspace
// alignment. They live exactly as long as the manager; there is no per-buffer
// release.

use std::fmt;

use log::trace;

use crate::error::{Error, Result};
use crate::primitive::WorkspaceHandle;

/// One aligned scratch allocation.
pub struct WorkspaceBuffer {
    // The boxed slice never moves its heap allocation, so `offset` stays valid.
    storage: Box<[u8]>,
    offset: usize,
    size: usize,
}

impl WorkspaceBuffer {
    fn new(size: usize, alignment: usize) -> Result<Self> {
        let padded = size.checked_add(alignment - 1).ok_or_else(|| {
            Error::msg(format!(
                "workspace of {} bytes overflows with alignment {}",
                size, alignment
            ))
        })?;
        let storage = vec![0u8; padded].into_boxed_slice();
        let addr = storage.as_ptr() as usize;
        let offset = (alignment - addr % alignment) % alignment;
        Ok(WorkspaceBuffer {
            storage,
            offset,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.size]
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage[self.offset..].as_mut_ptr()
    }
}

impl fmt::Debug for WorkspaceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceBuffer")
            .field("size", &self.size)
            .field("ptr", &self.as_slice().as_ptr())
            .finish()
    }
}

/// Snapshot of what the manager holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkspaceStats {
    /// Number of buffers allocated.
    pub buffers: usize,
    /// Sum of the requested sizes.
    pub total_bytes: usize,
    /// Largest single buffer.
    pub peak_buffer_bytes: usize,
}

/// Owner of every workspace buffer of one compiled program.
#[derive(Debug)]
pub struct WorkspaceManager {
    buffers: Vec<WorkspaceBuffer>,
    alignment: usize,
}

impl WorkspaceManager {
    /// `alignment` must be a power of two.
    pub fn new(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(Error::msg(format!(
                "workspace alignment {} is not a power of two",
                alignment
            )));
        }
        Ok(WorkspaceManager {
            buffers: Vec::new(),
            alignment,
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Allocate a zeroed buffer of `size` bytes.
    pub fn insert(&mut self, size: usize) -> Result<WorkspaceHandle> {
        let buffer = WorkspaceBuffer::new(size, self.alignment)?;
        let handle = WorkspaceHandle(self.buffers.len());
        self.buffers.push(buffer);
        trace!("workspace: {} bytes at {}", size, handle);
        Ok(handle)
    }

    pub fn get(&self, handle: WorkspaceHandle) -> Result<&WorkspaceBuffer> {
        self.buffers
            .get(handle.0)
            .ok_or(Error::UnknownWorkspace(handle.0))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Raw pointers of every buffer, indexed by workspace handle, for
    /// runtime pointer patching.
    pub fn buffer_ptrs(&mut self) -> Vec<*mut u8> {
        self.buffers.iter_mut().map(|b| b.as_mut_ptr()).collect()
    }

    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            buffers: self.buffers.len(),
            total_bytes: self.buffers.iter().map(|b| b.size).sum(),
            peak_buffer_bytes: self.buffers.iter().map(|b| b.size).max().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_is_honoured() {
        let mut ws = WorkspaceManager::new(64).unwrap();
        ws.insert(10).unwrap();
        ws.insert(1000).unwrap();
        for ptr in ws.buffer_ptrs() {
            assert_eq!(ptr as usize % 64, 0);
        }
    }

    #[test]
    fn test_zeroed_and_sized() {
        let mut ws = WorkspaceManager::new(16).unwrap();
        let h = ws.insert(33).unwrap();
        let buf = ws.get(h).unwrap();
        assert_eq!(buf.size(), 33);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_handles_are_sequential() {
        let mut ws = WorkspaceManager::new(8).unwrap();
        let a = ws.insert(4).unwrap();
        let b = ws.insert(8).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(ws.get(WorkspaceHandle(2)).is_err());
        let stats = ws.stats();
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.total_bytes, 12);
        assert_eq!(stats.peak_buffer_bytes, 8);
    }

    #[test]
    fn test_oversized_request_is_an_error() {
        let mut ws = WorkspaceManager::new(64).unwrap();
        assert!(ws.insert(usize::MAX - 8).is_err());
        assert!(ws.is_empty());
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert!(WorkspaceManager::new(24).is_err());
        assert!(WorkspaceManager::new(0).is_err());
    }
}
