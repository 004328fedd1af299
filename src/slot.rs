//! # Pipeline Slot
//!
//! Per-chunk work record bound 1:1 to a staging buffer. A slot is either
//! in the free ring or claimed by exactly one chunk; while claimed it is
//! the sole owner of its buffer. The state set is shared between the
//! write and read directions; the scheduler knows which direction it is
//! driving.

use core::fmt;
use std::time::Instant;

use crate::error::TransferError;
use crate::npu::{DevicePtr, EventHandle, StreamHandle};

/// Lifecycle states of a pipeline slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Unclaimed, index sits in the free ring
    Free,
    /// Device-to-host copy in flight (write stage A)
    CopyingFromDevice,
    /// Staging buffer holds settled data, ready for the next stage
    CopyDone,
    /// NVMe command in flight
    StorageSubmitted,
    /// NVMe command completed, awaiting recycling
    StorageCompleted,
    /// Host-to-device copy in flight (read stage A')
    CopyingToDevice,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Free => write!(f, "FREE"),
            SlotState::CopyingFromDevice => write!(f, "COPYING_FROM_DEVICE"),
            SlotState::CopyDone => write!(f, "COPY_DONE"),
            SlotState::StorageSubmitted => write!(f, "STORAGE_SUBMITTED"),
            SlotState::StorageCompleted => write!(f, "STORAGE_COMPLETED"),
            SlotState::CopyingToDevice => write!(f, "COPYING_TO_DEVICE"),
        }
    }
}

/// Profiling timestamps captured across a slot's lifecycle
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotTiming {
    /// Accelerator copy started
    pub copy_start: Option<Instant>,
    /// Accelerator copy finished
    pub copy_done: Option<Instant>,
    /// NVMe command submitted
    pub submit: Option<Instant>,
    /// NVMe completion drained
    pub complete: Option<Instant>,
}

impl SlotTiming {
    /// Microseconds spent in the accelerator copy, when both ends were
    /// stamped
    pub fn copy_micros(&self) -> u64 {
        match (self.copy_start, self.copy_done) {
            (Some(start), Some(done)) => done.duration_since(start).as_micros() as u64,
            _ => 0,
        }
    }

    /// Microseconds between submission and completion
    pub fn storage_micros(&self) -> u64 {
        match (self.submit, self.complete) {
            (Some(submit), Some(complete)) => {
                complete.duration_since(submit).as_micros() as u64
            }
            _ => 0,
        }
    }
}

/// One pipelined work unit
#[derive(Debug)]
pub struct Slot {
    /// Slot id, doubles as the completion token
    pub id: u16,
    /// Index of the owned staging buffer (fixed 1:1 binding)
    pub buffer_index: usize,
    /// Current lifecycle state
    pub state: SlotState,
    /// First error recorded against the current chunk
    pub error: Option<TransferError>,
    /// Payload bytes of the current chunk
    pub chunk_len: usize,
    /// Sector-aligned byte length of the device command
    pub aligned_len: usize,
    /// Starting logical block of the device command
    pub lba: u64,
    /// Block count of the device command
    pub nblocks: u32,
    /// Batch item this chunk was peeled from
    pub item_index: usize,
    /// Byte offset of this chunk within its item
    pub item_offset: u64,
    /// Accelerator address of the chunk's device-side data
    pub device_ptr: DevicePtr,
    /// Per-slot stream for asynchronous copies
    pub stream: Option<StreamHandle>,
    /// Per-slot completion event for asynchronous copies
    pub event: Option<EventHandle>,
    /// Profiling timestamps
    pub timing: SlotTiming,
}

impl Slot {
    /// Create a free slot bound to staging buffer `buffer_index`
    pub fn new(id: u16, buffer_index: usize) -> Self {
        Self {
            id,
            buffer_index,
            state: SlotState::Free,
            error: None,
            chunk_len: 0,
            aligned_len: 0,
            lba: 0,
            nblocks: 0,
            item_index: 0,
            item_offset: 0,
            device_ptr: DevicePtr(0),
            stream: None,
            event: None,
            timing: SlotTiming::default(),
        }
    }

    /// Record an error against the current chunk, keeping the first one
    pub fn record_error(&mut self, err: TransferError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Move to `next`, checking the transition is one the state machine
    /// allows. Errored slots may short-circuit to `StorageCompleted` so
    /// they still traverse the recycle path and return their buffer.
    pub fn transition(&mut self, next: SlotState) {
        debug_assert!(
            self.transition_allowed(next),
            "slot {}: illegal transition {} -> {}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    fn transition_allowed(&self, next: SlotState) -> bool {
        use SlotState::*;
        if self.error.is_some() && next == StorageCompleted {
            return true;
        }
        matches!(
            (self.state, next),
            (Free, CopyingFromDevice)        // write, async stage A
                | (Free, CopyDone)           // write, sync stage A
                | (Free, StorageSubmitted)   // read, stage B first
                | (CopyingFromDevice, CopyDone)
                | (CopyDone, StorageSubmitted)
                | (StorageSubmitted, StorageCompleted)
                | (StorageCompleted, CopyingToDevice) // read, async stage A'
                | (StorageCompleted, CopyDone)        // read, sync stage A'
                | (CopyingToDevice, CopyDone)
                | (StorageCompleted, Free)
                | (CopyDone, Free)           // read, copy-back finished
        )
    }

    /// Return the slot to `Free`, clearing chunk bindings and the error
    /// flag. The stream/event pair outlives recycling; it belongs to the
    /// slot, not the chunk.
    pub fn recycle(&mut self) {
        self.state = SlotState::Free;
        self.error = None;
        self.chunk_len = 0;
        self.aligned_len = 0;
        self.lba = 0;
        self.nblocks = 0;
        self.item_index = 0;
        self.item_offset = 0;
        self.device_ptr = DevicePtr(0);
        self.timing = SlotTiming::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_path_transitions() {
        let mut slot = Slot::new(0, 0);
        slot.transition(SlotState::CopyingFromDevice);
        slot.transition(SlotState::CopyDone);
        slot.transition(SlotState::StorageSubmitted);
        slot.transition(SlotState::StorageCompleted);
        slot.transition(SlotState::Free);
        assert_eq!(slot.state, SlotState::Free);
    }

    #[test]
    fn test_read_path_transitions() {
        let mut slot = Slot::new(0, 0);
        slot.transition(SlotState::StorageSubmitted);
        slot.transition(SlotState::StorageCompleted);
        slot.transition(SlotState::CopyingToDevice);
        slot.transition(SlotState::CopyDone);
        slot.transition(SlotState::Free);
        assert_eq!(slot.state, SlotState::Free);
    }

    #[test]
    fn test_read_path_with_inline_copy_back() {
        let mut slot = Slot::new(0, 0);
        slot.transition(SlotState::StorageSubmitted);
        slot.transition(SlotState::StorageCompleted);
        slot.transition(SlotState::CopyDone);
        slot.transition(SlotState::Free);
        assert_eq!(slot.state, SlotState::Free);
    }

    #[test]
    fn test_errored_slot_short_circuits_to_completed() {
        let mut slot = Slot::new(3, 3);
        slot.transition(SlotState::CopyingFromDevice);
        slot.record_error(TransferError::Copy);
        slot.transition(SlotState::StorageCompleted);
        slot.transition(SlotState::Free);
        assert_eq!(slot.state, SlotState::Free);
    }

    #[test]
    fn test_first_error_wins() {
        let mut slot = Slot::new(1, 1);
        slot.record_error(TransferError::Capacity);
        slot.record_error(TransferError::Copy);
        assert_eq!(slot.error, Some(TransferError::Capacity));
    }

    #[test]
    fn test_recycle_clears_chunk_state() {
        let mut slot = Slot::new(2, 2);
        slot.chunk_len = 4096;
        slot.lba = 10;
        slot.nblocks = 8;
        slot.record_error(TransferError::Media {
            status_code_type: 0,
            status_code: 1,
        });
        slot.recycle();
        assert_eq!(slot.state, SlotState::Free);
        assert!(slot.error.is_none());
        assert_eq!(slot.chunk_len, 0);
        assert_eq!(slot.nblocks, 0);
    }
}
