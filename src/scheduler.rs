//! # Batch Scheduler
//!
//! Drives a batch of transfer items through the two-stage pipeline:
//! chunks are peeled off items in order, each chunk claims a staging
//! slot, runs its accelerator copy and its NVMe command, and returns the
//! slot to the free ring. Everything happens on the calling thread in a
//! cooperative polling loop; backpressure falls out of the free ring
//! holding at most `depth` entries.
//!
//! Ordering: chunks of one item are submitted to storage in ascending
//! intra-item offset; chunks of different items may interleave.
//! Completion order is whatever the device delivers.

use core::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::engine::{CopyMode, TransferItem};
use crate::error::TransferError;
use crate::geometry::DeviceGeometry;
use crate::npu::{DevicePtr, NpuRuntime};
use crate::nvme::IoQueuePair;
use crate::pool::StagingPool;
use crate::profile::{BatchProfile, ChunkTiming};
use crate::ring::SlotRing;
use crate::slot::{Slot, SlotState};

/// Sleep applied when a tick makes no forward progress
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Direction of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// NPU memory to storage
    Write,
    /// Storage to NPU memory
    Read,
}

impl TransferDirection {
    /// Conventional profiling file name for this direction
    pub fn profile_file(&self) -> &'static str {
        match self {
            TransferDirection::Write => "time_write.csv",
            TransferDirection::Read => "time_read.csv",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Write => write!(f, "write"),
            TransferDirection::Read => write!(f, "read"),
        }
    }
}

/// One chunk peeled from a batch item, possibly pre-rejected
struct ChunkDesc {
    item_index: usize,
    item_offset: u64,
    device_ptr: DevicePtr,
    len: usize,
    aligned_len: usize,
    lba: u64,
    nblocks: u32,
    error: Option<TransferError>,
}

/// Borrowed engine state a batch runs against
pub(crate) struct BatchContext<'a> {
    pub direction: TransferDirection,
    pub copy_mode: CopyMode,
    pub items: &'a [TransferItem],
    pub npu: &'a dyn NpuRuntime,
    pub qpair: &'a mut dyn IoQueuePair,
    pub pool: &'a mut StagingPool,
    pub ring: &'a mut SlotRing,
    pub slots: &'a mut [Slot],
    pub geometry: &'a DeviceGeometry,
    pub max_transfer: usize,
    pub watchdog_timeout: Duration,
    pub profiling: bool,
}

/// Result of a finished batch, before the engine shapes it for the caller
pub(crate) struct BatchOutcome {
    pub chunks: usize,
    pub failed_chunks: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub error: Option<TransferError>,
    pub profile: BatchProfile,
}

/// Scheduler state for one batch call
pub(crate) struct BatchScheduler<'a> {
    ctx: BatchContext<'a>,
    /// Item currently being sliced
    item_cursor: usize,
    /// Byte offset inside the current item
    offset_cursor: u64,
    /// Per-item next offset eligible for storage submission; keeps
    /// intra-item submission order even when copies finish out of order
    submit_cursor: Vec<u64>,
    total_chunks: usize,
    completed_chunks: usize,
    failed_chunks: usize,
    bytes_done: u64,
    first_error: Option<TransferError>,
    profile: BatchProfile,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(ctx: BatchContext<'a>) -> Self {
        let m = ctx.max_transfer;
        let total_chunks = ctx
            .items
            .iter()
            .map(|item| {
                if item.len == 0 {
                    1
                } else {
                    (item.len + m - 1) / m
                }
            })
            .sum();
        let submit_cursor = vec![0u64; ctx.items.len()];
        Self {
            ctx,
            item_cursor: 0,
            offset_cursor: 0,
            submit_cursor,
            total_chunks,
            completed_chunks: 0,
            failed_chunks: 0,
            bytes_done: 0,
            first_error: None,
            profile: BatchProfile::new(),
        }
    }

    /// Run the batch to completion (or watchdog abort) and report
    pub fn run(mut self) -> BatchOutcome {
        let started = Instant::now();
        let mut last_progress = started;

        debug!(
            "{} batch: {} items, {} chunks, max transfer {}",
            self.ctx.direction,
            self.ctx.items.len(),
            self.total_chunks,
            self.ctx.max_transfer
        );

        while self.completed_chunks < self.total_chunks {
            if self.tick() {
                last_progress = Instant::now();
            } else {
                if last_progress.elapsed() >= self.ctx.watchdog_timeout {
                    warn!(
                        "{} batch stalled for {:?}, aborting",
                        self.ctx.direction, self.ctx.watchdog_timeout
                    );
                    self.abort();
                    break;
                }
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        BatchOutcome {
            chunks: self.completed_chunks,
            failed_chunks: self.failed_chunks,
            bytes: self.bytes_done,
            elapsed: started.elapsed(),
            error: self.first_error,
            profile: self.profile,
        }
    }

    /// One pass over the pipeline phases; true when anything moved
    fn tick(&mut self) -> bool {
        let mut progress = self.dispatch();
        progress |= self.promote();
        if self.ctx.direction == TransferDirection::Write {
            progress |= self.submit_ready();
        }
        progress |= self.drain_completions();
        progress |= self.recycle();
        progress
    }

    // ---- phase 1: dispatch ------------------------------------------------

    /// Claim free slots for prepared chunks and start their first stage
    fn dispatch(&mut self) -> bool {
        let mut progress = false;
        while !self.ctx.ring.is_empty() {
            let chunk = match self.next_chunk() {
                Some(chunk) => chunk,
                None => break,
            };

            if let Some(err) = chunk.error {
                // Rejected chunks are accounted as submitted and completed
                // in the same tick and never consume a buffer.
                warn!(
                    "{} batch: item {} offset {} rejected: {}",
                    self.ctx.direction, chunk.item_index, chunk.item_offset, err
                );
                self.note_error(err);
                self.completed_chunks += 1;
                self.failed_chunks += 1;
                let end = chunk.item_offset + chunk.len as u64;
                if self.submit_cursor[chunk.item_index] < end {
                    self.submit_cursor[chunk.item_index] = end;
                }
                progress = true;
                continue;
            }

            let slot_index = match self.ctx.ring.pop() {
                Some(index) => index,
                None => break,
            };
            {
                let slot = &mut self.ctx.slots[slot_index];
                slot.chunk_len = chunk.len;
                slot.aligned_len = chunk.aligned_len;
                slot.lba = chunk.lba;
                slot.nblocks = chunk.nblocks;
                slot.item_index = chunk.item_index;
                slot.item_offset = chunk.item_offset;
                slot.device_ptr = chunk.device_ptr;
            }
            trace!(
                "slot {}: item {} offset {} lba {} x{} blocks",
                slot_index,
                chunk.item_index,
                chunk.item_offset,
                chunk.lba,
                chunk.nblocks
            );

            match self.ctx.direction {
                TransferDirection::Write => self.start_copy_out(slot_index),
                TransferDirection::Read => self.submit_storage(slot_index),
            }
            progress = true;
        }
        progress
    }

    /// Slice the next chunk off the item list, attaching a validation
    /// verdict. Returns `None` when every chunk has been produced.
    fn next_chunk(&mut self) -> Option<ChunkDesc> {
        while self.item_cursor < self.ctx.items.len() {
            let item = &self.ctx.items[self.item_cursor];
            let item_index = self.item_cursor;
            let sector = self.ctx.geometry.sector_size as u64;

            if item.len == 0 {
                self.item_cursor += 1;
                self.offset_cursor = 0;
                return Some(ChunkDesc {
                    item_index,
                    item_offset: 0,
                    device_ptr: item.device_ptr,
                    len: 0,
                    aligned_len: 0,
                    lba: 0,
                    nblocks: 0,
                    error: Some(TransferError::Configuration("zero-size item")),
                });
            }

            let remaining = item.len as u64 - self.offset_cursor;
            if remaining == 0 {
                self.item_cursor += 1;
                self.offset_cursor = 0;
                continue;
            }

            let item_offset = self.offset_cursor;
            let len = remaining.min(self.ctx.max_transfer as u64) as usize;
            let aligned_len = self.ctx.geometry.align_to_sector(len);
            let lba = (item.storage_offset + item_offset) / sector;
            let nblocks = (aligned_len as u64 / sector) as u32;

            let error = if item.storage_offset % sector != 0 {
                Some(TransferError::Configuration("unaligned storage offset"))
            } else if aligned_len > self.ctx.pool.buffer_len() {
                Some(TransferError::Configuration("chunk exceeds staging capacity"))
            } else if !self.ctx.geometry.contains(lba, nblocks) {
                Some(TransferError::Capacity)
            } else {
                None
            };

            self.offset_cursor += len as u64;
            if self.offset_cursor >= item.len as u64 {
                self.item_cursor += 1;
                self.offset_cursor = 0;
            }

            return Some(ChunkDesc {
                item_index,
                item_offset,
                device_ptr: item.device_ptr.offset(item_offset),
                len,
                aligned_len,
                lba,
                nblocks,
                error,
            });
        }
        None
    }

    /// Start stage A for a write chunk: device-to-host copy into the
    /// slot's staging buffer
    fn start_copy_out(&mut self, index: usize) {
        let npu = self.ctx.npu;
        let (chunk_len, aligned_len, device_ptr, buffer_index) = {
            let slot = &self.ctx.slots[index];
            (slot.chunk_len, slot.aligned_len, slot.device_ptr, slot.buffer_index)
        };

        if self.ctx.profiling {
            self.ctx.slots[index].timing.copy_start = Some(Instant::now());
        }

        match self.ctx.copy_mode {
            CopyMode::Sync => {
                let result = {
                    let buf = self.ctx.pool.buffer_mut(buffer_index);
                    let slice = buf.as_mut_slice();
                    // Padding sectors carry zeros, not stale bytes from an
                    // earlier chunk, so identical batches stay identical
                    // on media.
                    slice[chunk_len..aligned_len].fill(0);
                    npu.copy_to_host(device_ptr, &mut slice[..chunk_len])
                };
                let profiling = self.ctx.profiling;
                let slot = &mut self.ctx.slots[index];
                match result {
                    Ok(()) => {
                        if profiling {
                            slot.timing.copy_done = Some(Instant::now());
                        }
                        slot.transition(SlotState::CopyDone);
                    }
                    Err(err) => {
                        warn!("slot {}: device copy failed: {}", index, err);
                        slot.record_error(err);
                        slot.transition(SlotState::StorageCompleted);
                    }
                }
            }
            CopyMode::Async => {
                let (stream, event) = {
                    let slot = &self.ctx.slots[index];
                    (slot.stream, slot.event)
                };
                let result = match (stream, event) {
                    (Some(stream), Some(event)) => {
                        let ptr = {
                            let buf = self.ctx.pool.buffer_mut(buffer_index);
                            buf.as_mut_slice()[chunk_len..aligned_len].fill(0);
                            buf.as_mut_ptr()
                        };
                        // Safe per the slot contract: the buffer stays
                        // exclusively bound to this slot until the event
                        // has signaled.
                        unsafe { npu.copy_to_host_async(device_ptr, ptr, chunk_len, stream) }
                            .and_then(|_| npu.record_event(event, stream))
                    }
                    _ => Err(TransferError::Environment("slot missing stream or event")),
                };
                let slot = &mut self.ctx.slots[index];
                match result {
                    Ok(()) => slot.transition(SlotState::CopyingFromDevice),
                    Err(err) => {
                        warn!("slot {}: async device copy failed: {}", index, err);
                        slot.record_error(err);
                        slot.transition(SlotState::StorageCompleted);
                    }
                }
            }
        }
    }

    // ---- phase 2: promote -------------------------------------------------

    /// Poll per-slot events and promote finished asynchronous copies
    fn promote(&mut self) -> bool {
        if self.ctx.copy_mode != CopyMode::Async {
            return false;
        }
        let npu = self.ctx.npu;
        let profiling = self.ctx.profiling;
        let mut progress = false;
        for index in 0..self.ctx.slots.len() {
            let (state, event) = {
                let slot = &self.ctx.slots[index];
                (slot.state, slot.event)
            };
            if !matches!(
                state,
                SlotState::CopyingFromDevice | SlotState::CopyingToDevice
            ) {
                continue;
            }
            let event = match event {
                Some(event) => event,
                None => continue,
            };
            match npu.event_signaled(event) {
                Ok(true) => {
                    let slot = &mut self.ctx.slots[index];
                    if profiling {
                        slot.timing.copy_done = Some(Instant::now());
                    }
                    slot.transition(SlotState::CopyDone);
                    trace!("slot {}: copy event signaled", index);
                    progress = true;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("slot {}: event query failed: {}", index, err);
                    let slot = &mut self.ctx.slots[index];
                    slot.record_error(err);
                    slot.transition(SlotState::StorageCompleted);
                    progress = true;
                }
            }
        }
        progress
    }

    // ---- phase 3: submit --------------------------------------------------

    /// Submit every copy-complete write chunk whose intra-item
    /// predecessors have already been submitted
    fn submit_ready(&mut self) -> bool {
        let mut progress = false;
        loop {
            let mut advanced = false;
            for index in 0..self.ctx.slots.len() {
                let ready = {
                    let slot = &self.ctx.slots[index];
                    slot.state == SlotState::CopyDone
                        && self.submit_cursor[slot.item_index] == slot.item_offset
                };
                if ready {
                    self.submit_storage(index);
                    advanced = true;
                    progress = true;
                }
            }
            if !advanced {
                break;
            }
        }
        progress
    }

    /// Submit the slot's NVMe command (write or read per direction)
    fn submit_storage(&mut self, index: usize) {
        let (token, buffer_index, lba, nblocks, chunk_len, item_index, item_offset) = {
            let slot = &self.ctx.slots[index];
            (
                slot.id,
                slot.buffer_index,
                slot.lba,
                slot.nblocks,
                slot.chunk_len,
                slot.item_index,
                slot.item_offset,
            )
        };

        if self.ctx.profiling {
            self.ctx.slots[index].timing.submit = Some(Instant::now());
        }

        let result = {
            let buf = self.ctx.pool.buffer(buffer_index);
            match self.ctx.direction {
                TransferDirection::Write => self.ctx.qpair.submit_write(token, buf, lba, nblocks),
                TransferDirection::Read => self.ctx.qpair.submit_read(token, buf, lba, nblocks),
            }
        };

        let end = item_offset + chunk_len as u64;
        if self.submit_cursor[item_index] < end {
            self.submit_cursor[item_index] = end;
        }

        let slot = &mut self.ctx.slots[index];
        match result {
            Ok(()) => {
                slot.transition(SlotState::StorageSubmitted);
                trace!("slot {}: submitted lba {} x{} blocks", index, lba, nblocks);
            }
            Err(err) => {
                warn!("slot {}: submission failed: {}", index, err);
                slot.record_error(err);
                slot.transition(SlotState::StorageCompleted);
            }
        }
    }

    // ---- phase 4: drain ---------------------------------------------------

    /// Poll the completion queue once and retire finished commands onto
    /// their slots
    fn drain_completions(&mut self) -> bool {
        let completions = self.ctx.qpair.process_completions(0);
        let progress = !completions.is_empty();
        for completion in completions {
            let index = completion.token as usize;
            if index >= self.ctx.slots.len() {
                warn!("spurious completion token {}", completion.token);
                continue;
            }
            let slot = &mut self.ctx.slots[index];
            if slot.state != SlotState::StorageSubmitted {
                warn!(
                    "completion for slot {} in state {}, dropping",
                    index, slot.state
                );
                continue;
            }
            if self.ctx.profiling {
                slot.timing.complete = Some(Instant::now());
            }
            if let Some(err) = completion.status.as_error() {
                warn!("slot {}: completion status {}", index, completion.status);
                slot.record_error(err);
            }
            slot.transition(SlotState::StorageCompleted);
            trace!("slot {}: storage completed", index);
        }
        progress
    }

    // ---- phase 5: recycle -------------------------------------------------

    /// Retire terminal slots: read chunks copy back to device memory,
    /// then every finished slot returns to the free ring
    fn recycle(&mut self) -> bool {
        let mut progress = false;
        for index in 0..self.ctx.slots.len() {
            let (state, errored) = {
                let slot = &self.ctx.slots[index];
                (slot.state, slot.error.is_some())
            };
            match (self.ctx.direction, state) {
                (TransferDirection::Write, SlotState::StorageCompleted) => {
                    self.finish_slot(index);
                    progress = true;
                }
                (TransferDirection::Read, SlotState::StorageCompleted) => {
                    if errored {
                        self.finish_slot(index);
                    } else {
                        self.start_copy_back(index);
                    }
                    progress = true;
                }
                (TransferDirection::Read, SlotState::CopyDone) => {
                    self.finish_slot(index);
                    progress = true;
                }
                _ => {}
            }
        }
        progress
    }

    /// Start stage A' for a read chunk: host-to-device copy of the data
    /// the device just delivered
    fn start_copy_back(&mut self, index: usize) {
        let npu = self.ctx.npu;
        let (chunk_len, device_ptr, buffer_index) = {
            let slot = &self.ctx.slots[index];
            (slot.chunk_len, slot.device_ptr, slot.buffer_index)
        };

        if self.ctx.profiling {
            self.ctx.slots[index].timing.copy_start = Some(Instant::now());
        }

        match self.ctx.copy_mode {
            CopyMode::Sync => {
                let result = {
                    let buf = self.ctx.pool.buffer(buffer_index);
                    npu.copy_from_host(&buf.as_slice()[..chunk_len], device_ptr)
                };
                let profiling = self.ctx.profiling;
                let slot = &mut self.ctx.slots[index];
                match result {
                    Ok(()) => {
                        if profiling {
                            slot.timing.copy_done = Some(Instant::now());
                        }
                        slot.transition(SlotState::CopyDone);
                    }
                    Err(err) => {
                        warn!("slot {}: copy back failed: {}", index, err);
                        slot.record_error(err);
                    }
                }
                self.finish_slot(index);
            }
            CopyMode::Async => {
                let (stream, event) = {
                    let slot = &self.ctx.slots[index];
                    (slot.stream, slot.event)
                };
                let result = match (stream, event) {
                    (Some(stream), Some(event)) => {
                        let ptr = self.ctx.pool.buffer(buffer_index).as_ptr();
                        // Safe per the slot contract: the buffer stays
                        // exclusively bound to this slot until the event
                        // has signaled.
                        unsafe { npu.copy_from_host_async(ptr, chunk_len, device_ptr, stream) }
                            .and_then(|_| npu.record_event(event, stream))
                    }
                    _ => Err(TransferError::Environment("slot missing stream or event")),
                };
                let slot = &mut self.ctx.slots[index];
                match result {
                    Ok(()) => slot.transition(SlotState::CopyingToDevice),
                    Err(err) => {
                        warn!("slot {}: async copy back failed: {}", index, err);
                        slot.record_error(err);
                        self.finish_slot(index);
                    }
                }
            }
        }
    }

    /// Account the slot's chunk, return the slot to the free ring
    fn finish_slot(&mut self, index: usize) {
        let (error, chunk_len, item_index, item_offset, buffer_index, timing) = {
            let slot = &self.ctx.slots[index];
            (
                slot.error,
                slot.chunk_len,
                slot.item_index,
                slot.item_offset,
                slot.buffer_index,
                slot.timing,
            )
        };

        self.completed_chunks += 1;
        match error {
            Some(err) => {
                self.failed_chunks += 1;
                self.note_error(err);
            }
            None => {
                self.bytes_done += chunk_len as u64;
                if self.ctx.profiling {
                    self.profile.record(ChunkTiming {
                        item_index,
                        buffer_index,
                        copy_micros: timing.copy_micros(),
                        storage_micros: timing.storage_micros(),
                    });
                }
            }
        }

        // A chunk that never reached submission still unblocks its
        // intra-item successors.
        let end = item_offset + chunk_len as u64;
        if self.submit_cursor[item_index] < end {
            self.submit_cursor[item_index] = end;
        }

        self.ctx.slots[index].recycle();
        if let Err(err) = self.ctx.ring.push(index) {
            warn!("slot {}: {}", index, err);
        }
        trace!(
            "slot {}: recycled ({}/{} chunks done)",
            index,
            self.completed_chunks,
            self.total_chunks
        );
    }

    // ---- watchdog ---------------------------------------------------------

    /// Abort after a stall: drain what the device still owes, fail every
    /// claimed slot, and hand the buffers back
    fn abort(&mut self) {
        // Submitted commands cannot be rescinded; the buffers they
        // reference must not be touched until each one has completed.
        while self
            .ctx
            .slots
            .iter()
            .any(|slot| slot.state == SlotState::StorageSubmitted)
        {
            self.drain_completions();
        }

        for index in 0..self.ctx.slots.len() {
            if self.ctx.slots[index].state != SlotState::Free {
                {
                    let slot = &mut self.ctx.slots[index];
                    slot.record_error(TransferError::Timeout);
                    if slot.state != SlotState::StorageCompleted {
                        slot.transition(SlotState::StorageCompleted);
                    }
                }
                self.finish_slot(index);
            }
        }

        self.first_error = Some(TransferError::Timeout);
    }

    fn note_error(&mut self, err: TransferError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        self.ctx.ring.len()
    }

    #[cfg(test)]
    fn busy_slots(&self) -> usize {
        self.ctx
            .slots
            .iter()
            .filter(|slot| slot.state != SlotState::Free)
            .count()
    }
}
