//! # In-Memory Collaborators
//!
//! RAM-backed implementations of the accelerator-runtime and NVMe-driver
//! seams. They preserve the timing structure of the real collaborators
//! (deferred copy events, deferred command completions, both counted in
//! poll ticks) so the pipeline's overlap and state machine are exercised
//! without hardware. Error injection knobs cover the failure paths the
//! engine must survive.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use spin::Mutex;

use crate::env::OnceEnv;
use crate::error::TransferError;
use crate::npu::{DevicePtr, EventHandle, NpuRuntime, StreamHandle};
use crate::nvme::{
    CompletionStatus, ControllerInfo, DmaBuffer, IoCompletion, IoQueuePair, NvmeController,
    NvmeDriver, PciAddress,
};

// ============================================================================
// MOCK ACCELERATOR RUNTIME
// ============================================================================

struct EventState {
    recorded: bool,
    remaining: u32,
}

struct NpuShared {
    arena: Vec<u8>,
    next_alloc: usize,
    bound: Option<u32>,
    event_latency: u32,
    fail_copies: bool,
    next_handle: u64,
    events: BTreeMap<u64, EventState>,
    live_streams: usize,
}

/// RAM-backed accelerator runtime
///
/// Device memory is a flat arena; `DevicePtr` values are offsets into
/// it. Asynchronous copies move the data immediately but report their
/// event as signaled only after `event_latency` queries, so slots really
/// dwell in the copying states.
#[derive(Clone)]
pub struct MockNpu {
    shared: Arc<Mutex<NpuShared>>,
}

impl MockNpu {
    /// Create a runtime with `arena_len` bytes of device memory
    pub fn new(arena_len: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(NpuShared {
                arena: vec![0; arena_len],
                next_alloc: 0,
                bound: None,
                event_latency: 0,
                fail_copies: false,
                next_handle: 1,
                events: BTreeMap::new(),
                live_streams: 0,
            })),
        }
    }

    /// Carve `len` bytes out of device memory
    pub fn alloc(&self, len: usize) -> DevicePtr {
        let mut shared = self.shared.lock();
        let start = (shared.next_alloc + 63) & !63;
        assert!(
            start + len <= shared.arena.len(),
            "mock device memory exhausted"
        );
        shared.next_alloc = start + len;
        DevicePtr(start as u64)
    }

    /// Fill `len` bytes of device memory with `byte`
    pub fn fill(&self, ptr: DevicePtr, byte: u8, len: usize) {
        let mut shared = self.shared.lock();
        let start = ptr.0 as usize;
        shared.arena[start..start + len].fill(byte);
    }

    /// Copy `data` into device memory at `ptr`
    pub fn write(&self, ptr: DevicePtr, data: &[u8]) {
        let mut shared = self.shared.lock();
        let start = ptr.0 as usize;
        shared.arena[start..start + data.len()].copy_from_slice(data);
    }

    /// Read `len` bytes of device memory at `ptr`
    pub fn read(&self, ptr: DevicePtr, len: usize) -> Vec<u8> {
        let shared = self.shared.lock();
        let start = ptr.0 as usize;
        shared.arena[start..start + len].to_vec()
    }

    /// Number of event queries before an async copy reports done
    pub fn set_event_latency(&self, polls: u32) {
        self.shared.lock().event_latency = polls;
    }

    /// Make every subsequent copy fail
    pub fn set_fail_copies(&self, fail: bool) {
        self.shared.lock().fail_copies = fail;
    }

    /// Currently bound device, if any
    pub fn bound_device(&self) -> Option<u32> {
        self.shared.lock().bound
    }

    /// Streams created and not yet destroyed
    pub fn live_streams(&self) -> usize {
        self.shared.lock().live_streams
    }

    /// Events created and not yet destroyed
    pub fn live_events(&self) -> usize {
        self.shared.lock().events.len()
    }

    fn check_range(shared: &NpuShared, ptr: DevicePtr, len: usize) -> Result<(), TransferError> {
        if shared.fail_copies {
            return Err(TransferError::Copy);
        }
        let start = ptr.0 as usize;
        if start + len > shared.arena.len() {
            return Err(TransferError::Copy);
        }
        Ok(())
    }
}

impl NpuRuntime for MockNpu {
    fn bind_device(&self, device_id: u32) -> Result<(), TransferError> {
        self.shared.lock().bound = Some(device_id);
        Ok(())
    }

    fn reset_device(&self, _device_id: u32) -> Result<(), TransferError> {
        self.shared.lock().bound = None;
        Ok(())
    }

    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<(), TransferError> {
        let shared = self.shared.lock();
        Self::check_range(&shared, src, dst.len())?;
        let start = src.0 as usize;
        dst.copy_from_slice(&shared.arena[start..start + dst.len()]);
        Ok(())
    }

    fn copy_from_host(&self, src: &[u8], dst: DevicePtr) -> Result<(), TransferError> {
        let mut shared = self.shared.lock();
        Self::check_range(&shared, dst, src.len())?;
        let start = dst.0 as usize;
        shared.arena[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn create_stream(&self) -> Result<StreamHandle, TransferError> {
        let mut shared = self.shared.lock();
        let handle = shared.next_handle;
        shared.next_handle += 1;
        shared.live_streams += 1;
        Ok(StreamHandle(handle))
    }

    fn destroy_stream(&self, _stream: StreamHandle) {
        let mut shared = self.shared.lock();
        shared.live_streams = shared.live_streams.saturating_sub(1);
    }

    unsafe fn copy_to_host_async(
        &self,
        src: DevicePtr,
        dst: *mut u8,
        len: usize,
        _stream: StreamHandle,
    ) -> Result<(), TransferError> {
        let shared = self.shared.lock();
        Self::check_range(&shared, src, len)?;
        // Data moves now; only the completion event is deferred.
        std::ptr::copy_nonoverlapping(shared.arena.as_ptr().add(src.0 as usize), dst, len);
        Ok(())
    }

    unsafe fn copy_from_host_async(
        &self,
        src: *const u8,
        len: usize,
        dst: DevicePtr,
        _stream: StreamHandle,
    ) -> Result<(), TransferError> {
        let mut shared = self.shared.lock();
        Self::check_range(&shared, dst, len)?;
        let start = dst.0 as usize;
        std::ptr::copy_nonoverlapping(src, shared.arena.as_mut_ptr().add(start), len);
        Ok(())
    }

    fn create_event(&self) -> Result<EventHandle, TransferError> {
        let mut shared = self.shared.lock();
        let handle = shared.next_handle;
        shared.next_handle += 1;
        shared.events.insert(
            handle,
            EventState {
                recorded: false,
                remaining: 0,
            },
        );
        Ok(EventHandle(handle))
    }

    fn record_event(
        &self,
        event: EventHandle,
        _stream: StreamHandle,
    ) -> Result<(), TransferError> {
        let mut shared = self.shared.lock();
        let latency = shared.event_latency;
        match shared.events.get_mut(&event.0) {
            Some(state) => {
                state.recorded = true;
                state.remaining = latency;
                Ok(())
            }
            None => Err(TransferError::Copy),
        }
    }

    fn event_signaled(&self, event: EventHandle) -> Result<bool, TransferError> {
        let mut shared = self.shared.lock();
        match shared.events.get_mut(&event.0) {
            Some(state) => {
                if !state.recorded {
                    return Ok(false);
                }
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return Ok(false);
                }
                Ok(true)
            }
            None => Err(TransferError::Copy),
        }
    }

    fn destroy_event(&self, event: EventHandle) {
        self.shared.lock().events.remove(&event.0);
    }
}

// ============================================================================
// MOCK NVME DRIVER
// ============================================================================

/// One submission as seen by the mock queue pair
#[derive(Debug, Clone, Copy)]
pub struct SubmittedIo {
    /// True for writes
    pub write: bool,
    /// Completion token the command carried
    pub token: u16,
    /// Starting logical block
    pub lba: u64,
    /// Block count
    pub nblocks: u32,
}

struct PendingIo {
    token: u16,
    write: bool,
    lba: u64,
    nblocks: u32,
    host: *mut u8,
    remaining: u32,
}

struct NvmeShared {
    media: Vec<u8>,
    sector_size: u32,
    total_sectors: u64,
    mdts: u8,
    completion_latency: u32,
    pending: Vec<PendingIo>,
    inflight_peak: usize,
    media_error_lba: Option<u64>,
    submits_allowed: Option<usize>,
    submission_log: Vec<SubmittedIo>,
    dma_allocs_allowed: Option<usize>,
    live_dma: usize,
    deny_phys: bool,
    env_inits: usize,
}

/// RAM-backed user-space NVMe driver
///
/// Media is a flat byte vector addressed in `sector_size` units.
/// Submitted commands complete after `completion_latency` polls of the
/// queue pair, moving data between the media and the caller's DMA
/// buffer at completion time.
#[derive(Clone)]
pub struct MockNvme {
    shared: Arc<Mutex<NvmeShared>>,
    env: Arc<OnceEnv>,
}

impl MockNvme {
    /// Create a namespace of `total_sectors` blocks of `sector_size`
    /// bytes
    pub fn new(sector_size: u32, total_sectors: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(NvmeShared {
                media: vec![0; (sector_size as u64 * total_sectors) as usize],
                sector_size,
                total_sectors,
                mdts: 0,
                completion_latency: 0,
                pending: Vec::new(),
                inflight_peak: 0,
                media_error_lba: None,
                submits_allowed: None,
                submission_log: Vec::new(),
                dma_allocs_allowed: None,
                live_dma: 0,
                deny_phys: false,
                env_inits: 0,
            })),
            env: Arc::new(OnceEnv::new()),
        }
    }

    /// Set the raw MDTS field reported at identify
    pub fn set_mdts(&self, mdts: u8) {
        self.shared.lock().mdts = mdts;
    }

    /// Polls of the queue pair before a submitted command completes
    pub fn set_completion_latency(&self, polls: u32) {
        self.shared.lock().completion_latency = polls;
    }

    /// Commands touching `lba` complete with a media error status
    pub fn inject_media_error_at(&self, lba: u64) {
        self.shared.lock().media_error_lba = Some(lba);
    }

    /// Refuse submissions once `n` commands have been accepted
    pub fn fail_submissions_after(&self, n: usize) {
        self.shared.lock().submits_allowed = Some(n);
    }

    /// Fail DMA allocations once `n` buffers have been handed out
    pub fn fail_dma_allocs_after(&self, n: usize) {
        self.shared.lock().dma_allocs_allowed = Some(n);
    }

    /// Make allocated DMA buffers report no physical translation
    pub fn deny_phys_translation(&self) {
        self.shared.lock().deny_phys = true;
    }

    /// DMA buffers currently alive
    pub fn live_dma_buffers(&self) -> usize {
        self.shared.lock().live_dma
    }

    /// How often the process environment was actually initialized
    pub fn env_init_count(&self) -> usize {
        self.shared.lock().env_inits
    }

    /// Highest number of commands that were in flight at once
    pub fn inflight_peak(&self) -> usize {
        self.shared.lock().inflight_peak
    }

    /// Every submission accepted so far, in order
    pub fn submissions(&self) -> Vec<SubmittedIo> {
        self.shared.lock().submission_log.clone()
    }

    /// Read raw media bytes
    pub fn read_media(&self, byte_offset: u64, len: usize) -> Vec<u8> {
        let shared = self.shared.lock();
        let start = byte_offset as usize;
        shared.media[start..start + len].to_vec()
    }

    /// Overwrite raw media bytes
    pub fn write_media(&self, byte_offset: u64, data: &[u8]) {
        let mut shared = self.shared.lock();
        let start = byte_offset as usize;
        shared.media[start..start + data.len()].copy_from_slice(data);
    }
}

impl NvmeDriver for MockNvme {
    fn ensure_env(&self) -> Result<(), TransferError> {
        let shared = Arc::clone(&self.shared);
        self.env.ensure(move || {
            shared.lock().env_inits += 1;
            Ok(())
        })
    }

    fn probe(&self, _addr: &PciAddress) -> Result<Box<dyn NvmeController>, TransferError> {
        let shared = self.shared.lock();
        let info = ControllerInfo {
            model: "MOCKNVME 1TB".into(),
            serial: "MN000001".into(),
            sector_size: shared.sector_size,
            total_sectors: shared.total_sectors,
            mdts: shared.mdts,
        };
        drop(shared);
        Ok(Box::new(MockController {
            shared: Arc::clone(&self.shared),
            info,
        }))
    }
}

struct MockController {
    shared: Arc<Mutex<NvmeShared>>,
    info: ControllerInfo,
}

impl NvmeController for MockController {
    fn info(&self) -> &ControllerInfo {
        &self.info
    }

    fn alloc_io_qpair(&mut self) -> Result<Box<dyn IoQueuePair>, TransferError> {
        Ok(Box::new(MockQpair {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn alloc_dma_buffer(
        &self,
        len: usize,
        align: usize,
    ) -> Result<Box<dyn DmaBuffer>, TransferError> {
        let mut shared = self.shared.lock();
        if let Some(allowed) = shared.dma_allocs_allowed {
            if allowed == 0 {
                return Err(TransferError::Environment("DMA allocation refused"));
            }
            shared.dma_allocs_allowed = Some(allowed - 1);
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| TransferError::Environment("bad DMA layout"))?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(TransferError::Environment("DMA allocation failed"))?;
        shared.live_dma += 1;
        Ok(Box::new(MockDmaBuffer {
            ptr,
            len,
            layout,
            phys_ok: !shared.deny_phys,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockDmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    phys_ok: bool,
    shared: Arc<Mutex<NvmeShared>>,
}

impl DmaBuffer for MockDmaBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn physical_addr(&self) -> Option<u64> {
        // Identity translation stands in for the real page walk.
        if self.phys_ok {
            Some(self.ptr.as_ptr() as u64)
        } else {
            None
        }
    }
}

impl Drop for MockDmaBuffer {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.live_dma = shared.live_dma.saturating_sub(1);
        drop(shared);
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct MockQpair {
    shared: Arc<Mutex<NvmeShared>>,
}

impl MockQpair {
    fn submit(
        &mut self,
        write: bool,
        token: u16,
        buf: &dyn DmaBuffer,
        lba: u64,
        nblocks: u32,
    ) -> Result<(), TransferError> {
        let mut shared = self.shared.lock();
        if let Some(allowed) = shared.submits_allowed {
            if allowed == 0 {
                return Err(TransferError::Submission);
            }
            shared.submits_allowed = Some(allowed - 1);
        }
        let bytes = nblocks as usize * shared.sector_size as usize;
        if nblocks == 0 || bytes > buf.len() {
            return Err(TransferError::Submission);
        }
        shared.submission_log.push(SubmittedIo {
            write,
            token,
            lba,
            nblocks,
        });
        let latency = shared.completion_latency;
        shared.pending.push(PendingIo {
            token,
            write,
            lba,
            nblocks,
            host: buf.as_mut_ptr(),
            remaining: latency,
        });
        if shared.pending.len() > shared.inflight_peak {
            shared.inflight_peak = shared.pending.len();
        }
        Ok(())
    }
}

impl IoQueuePair for MockQpair {
    fn submit_write(
        &mut self,
        token: u16,
        buf: &dyn DmaBuffer,
        lba: u64,
        nblocks: u32,
    ) -> Result<(), TransferError> {
        self.submit(true, token, buf, lba, nblocks)
    }

    fn submit_read(
        &mut self,
        token: u16,
        buf: &dyn DmaBuffer,
        lba: u64,
        nblocks: u32,
    ) -> Result<(), TransferError> {
        self.submit(false, token, buf, lba, nblocks)
    }

    fn process_completions(&mut self, max: u32) -> Vec<IoCompletion> {
        let mut shared = self.shared.lock();
        let sector = shared.sector_size as usize;
        let media_error_lba = shared.media_error_lba;
        let mut completions = Vec::new();
        let mut index = 0;
        while index < shared.pending.len() {
            if max != 0 && completions.len() as u32 >= max {
                break;
            }
            if shared.pending[index].remaining > 0 {
                shared.pending[index].remaining -= 1;
                index += 1;
                continue;
            }
            let io = shared.pending.remove(index);
            let bytes = io.nblocks as usize * sector;
            let start = io.lba as usize * sector;
            let errored = media_error_lba
                .map(|bad| io.lba <= bad && bad < io.lba + io.nblocks as u64)
                .unwrap_or(false);
            let status = if errored {
                // Generic media access error: sct 0x2 (media), sc 0x81.
                CompletionStatus::from_parts(0x2, 0x81)
            } else {
                // The DMA happens at completion time, like real hardware.
                unsafe {
                    if io.write {
                        std::ptr::copy_nonoverlapping(
                            io.host,
                            shared.media.as_mut_ptr().add(start),
                            bytes,
                        );
                    } else {
                        std::ptr::copy_nonoverlapping(
                            shared.media.as_ptr().add(start),
                            io.host,
                            bytes,
                        );
                    }
                }
                CompletionStatus::SUCCESS
            };
            completions.push(IoCompletion {
                token: io.token,
                status,
            });
        }
        completions
    }
}
