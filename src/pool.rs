//! # Staging Buffer Pool
//!
//! Fixed set of pinned, DMA-addressable host buffers sized at engine
//! init. The pool never grows or shrinks afterwards: completion tokens
//! index into it, and an in-flight command holds the buffer's physical
//! address, so reallocation would invalidate both.

use log::{debug, error};

use crate::error::TransferError;
use crate::geometry::HOST_PAGE_SIZE;
use crate::nvme::{DmaBuffer, NvmeController};

/// Pool of exactly `depth` staging buffers of equal capacity
pub struct StagingPool {
    buffers: Vec<Box<dyn DmaBuffer>>,
    buffer_len: usize,
}

impl StagingPool {
    /// Allocate `depth` buffers of `buffer_len` bytes (rounded up to a
    /// whole host page), each checked for physical translatability.
    ///
    /// Creation is all-or-nothing: on any failure the buffers allocated
    /// so far are released and an error is returned.
    pub fn allocate(
        controller: &dyn NvmeController,
        depth: usize,
        buffer_len: usize,
    ) -> Result<Self, TransferError> {
        let buffer_len =
            (buffer_len + HOST_PAGE_SIZE - 1) / HOST_PAGE_SIZE * HOST_PAGE_SIZE;

        let mut buffers: Vec<Box<dyn DmaBuffer>> = Vec::with_capacity(depth);
        for index in 0..depth {
            let buf = match controller.alloc_dma_buffer(buffer_len, HOST_PAGE_SIZE) {
                Ok(buf) => buf,
                Err(err) => {
                    error!(
                        "staging pool: buffer {}/{} allocation failed: {}",
                        index + 1,
                        depth,
                        err
                    );
                    return Err(err);
                }
            };
            if buf.len() < buffer_len {
                error!("staging pool: buffer {} shorter than requested", index);
                return Err(TransferError::Environment("short DMA allocation"));
            }
            // NVMe DMA needs a physical address; an untranslatable buffer
            // would fault the controller mid-command.
            if buf.physical_addr().is_none() {
                error!("staging pool: buffer {} has no physical translation", index);
                return Err(TransferError::Environment(
                    "DMA buffer not physically translatable",
                ));
            }
            buffers.push(buf);
        }

        debug!(
            "staging pool ready: {} buffers x {} bytes",
            depth, buffer_len
        );
        Ok(Self {
            buffers,
            buffer_len,
        })
    }

    /// Capacity of each buffer in bytes
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Number of buffers in the pool
    pub fn depth(&self) -> usize {
        self.buffers.len()
    }

    /// Shared view of buffer `index`
    pub fn buffer(&self, index: usize) -> &dyn DmaBuffer {
        self.buffers[index].as_ref()
    }

    /// Exclusive view of buffer `index`
    pub fn buffer_mut(&mut self, index: usize) -> &mut dyn DmaBuffer {
        self.buffers[index].as_mut()
    }
}
