//! # Transfer Engine
//!
//! Lifecycle and public surface of the NPU-to-NVMe transfer engine. One
//! engine pairs one accelerator device with one NVMe namespace and owns
//! one I/O queue pair, one staging pool, and one scheduler loop; running
//! several engines in a process is fine as long as each has its own
//! pairing. All engine calls happen on one thread.

use std::time::Duration;

use log::{info, warn};

use crate::error::TransferError;
use crate::geometry::{DeviceGeometry, DEFAULT_MDTS_CEILING, HOST_PAGE_SIZE};
use crate::npu::{DevicePtr, NpuRuntime};
use crate::nvme::{IoQueuePair, NvmeController, NvmeDriver, PciAddress};
use crate::pool::StagingPool;
use crate::ring::SlotRing;
use crate::scheduler::{BatchContext, BatchScheduler, TransferDirection};
use crate::slot::Slot;

/// Most staging buffers (and therefore in-flight chunks) an engine may
/// have
pub const MAX_PIPELINE_DEPTH: usize = 16;

/// How stage A copies are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Blocking copy inline in the dispatch phase; simple, but stage A
    /// serializes with scheduling
    Sync,
    /// Stream-ordered copy with a per-slot completion event; overlaps
    /// accelerator copies with storage I/O across slots
    Async,
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of staging buffers, clamped to `[1, 16]`
    pub pipeline_depth: usize,
    /// Requested chunk size in bytes; must be a positive multiple of
    /// 4 KiB, capped by the controller transfer limit
    pub chunk_size: usize,
    /// Stage A strategy
    pub copy_mode: CopyMode,
    /// Abort a batch when no forward progress happens for this long
    pub watchdog_timeout: Duration,
    /// Upper bound applied to the controller-reported transfer limit
    pub mdts_ceiling: usize,
    /// Emit per-chunk timing CSVs after each batch
    pub enable_profiling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 4,
            chunk_size: 4 * 1024 * 1024,
            copy_mode: CopyMode::Async,
            watchdog_timeout: Duration::from_secs(60),
            mdts_ceiling: DEFAULT_MDTS_CEILING,
            enable_profiling: false,
        }
    }
}

impl EngineConfig {
    /// Set the pipeline depth
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set the requested chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the stage A strategy
    pub fn with_copy_mode(mut self, copy_mode: CopyMode) -> Self {
        self.copy_mode = copy_mode;
        self
    }

    /// Set the watchdog limit
    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Enable per-chunk profiling output
    pub fn with_profiling(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }
}

/// One caller request inside a batch
#[derive(Debug, Clone, Copy)]
pub struct TransferItem {
    /// Base address of the item's data in accelerator memory
    pub device_ptr: DevicePtr,
    /// Byte offset on storage; must be sector-aligned
    pub storage_offset: u64,
    /// Byte count; split into chunks of at most `max_transfer`
    pub len: usize,
}

/// Summary of a completed batch
#[derive(Debug, Clone, Copy)]
pub struct BatchReport {
    /// Chunks processed
    pub chunks: usize,
    /// Payload bytes moved
    pub bytes: u64,
    /// Wall-clock duration of the batch
    pub elapsed: Duration,
}

impl BatchReport {
    /// Effective throughput in MB/s
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        }
    }
}

/// Pipelined batch transfer engine for one (NPU device, NVMe namespace)
/// pairing
pub struct TransferEngine {
    npu: Box<dyn NpuRuntime>,
    controller: Option<Box<dyn NvmeController>>,
    qpair: Option<Box<dyn IoQueuePair>>,
    pool: Option<StagingPool>,
    ring: SlotRing,
    slots: Vec<Slot>,
    geometry: DeviceGeometry,
    max_transfer: usize,
    copy_mode: CopyMode,
    watchdog_timeout: Duration,
    profiling: bool,
    device_id: u32,
    device_bound: bool,
}

impl TransferEngine {
    /// Bring up an engine: process environment, accelerator bind, NVMe
    /// attach, geometry capture, queue pair, staging pool, free ring.
    ///
    /// Atomic from the caller's perspective: on any failure everything
    /// acquired so far is torn down in reverse and only the error is
    /// returned.
    pub fn init(
        npu: Box<dyn NpuRuntime>,
        driver: &dyn NvmeDriver,
        pci_address: &PciAddress,
        device_id: u32,
        config: EngineConfig,
    ) -> Result<Self, TransferError> {
        if config.chunk_size == 0 || config.chunk_size % HOST_PAGE_SIZE != 0 {
            return Err(TransferError::Configuration(
                "chunk size must be a positive multiple of 4 KiB",
            ));
        }
        let depth = config.pipeline_depth.clamp(1, MAX_PIPELINE_DEPTH);

        driver.ensure_env()?;
        npu.bind_device(device_id)?;

        match Self::bring_up(npu.as_ref(), driver, pci_address, depth, &config) {
            Ok((controller, qpair, pool, geometry, max_transfer, slots, ring)) => {
                info!(
                    "engine ready at {}: depth {}, chunk {} bytes, sector {} bytes",
                    pci_address, depth, max_transfer, geometry.sector_size
                );
                Ok(Self {
                    npu,
                    controller: Some(controller),
                    qpair: Some(qpair),
                    pool: Some(pool),
                    ring,
                    slots,
                    geometry,
                    max_transfer,
                    copy_mode: config.copy_mode,
                    watchdog_timeout: config.watchdog_timeout,
                    profiling: config.enable_profiling,
                    device_id,
                    device_bound: true,
                })
            }
            Err(err) => {
                // Unwind the accelerator bind; everything later is owned
                // by bring_up and already released.
                if let Err(reset_err) = npu.reset_device(device_id) {
                    warn!("device reset during init unwind failed: {}", reset_err);
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn bring_up(
        npu: &dyn NpuRuntime,
        driver: &dyn NvmeDriver,
        pci_address: &PciAddress,
        depth: usize,
        config: &EngineConfig,
    ) -> Result<
        (
            Box<dyn NvmeController>,
            Box<dyn IoQueuePair>,
            StagingPool,
            DeviceGeometry,
            usize,
            Vec<Slot>,
            SlotRing,
        ),
        TransferError,
    > {
        let mut controller = driver.probe(pci_address)?;
        let info = controller.info().clone();
        info!(
            "attached {} (serial {}) at {}: {} sectors x {} bytes, mdts {}",
            info.model, info.serial, pci_address, info.total_sectors, info.sector_size, info.mdts
        );

        let geometry = DeviceGeometry::from_info(&info, config.mdts_ceiling)?;
        let max_transfer = geometry.effective_max_transfer(config.chunk_size);
        if max_transfer == 0 {
            return Err(TransferError::Configuration(
                "chunk size smaller than one sector",
            ));
        }

        let qpair = controller.alloc_io_qpair()?;
        let pool = StagingPool::allocate(controller.as_ref(), depth, max_transfer)?;
        let slots = Self::build_slots(npu, depth, config.copy_mode)?;
        let mut ring = SlotRing::with_capacity(depth);
        for index in 0..depth {
            ring.push(index)?;
        }

        Ok((controller, qpair, pool, geometry, max_transfer, slots, ring))
    }

    /// Create the slot table; in async mode each slot gets its own
    /// stream/event pair. Cleans up the handles created so far when a
    /// later one fails.
    fn build_slots(
        npu: &dyn NpuRuntime,
        depth: usize,
        copy_mode: CopyMode,
    ) -> Result<Vec<Slot>, TransferError> {
        let mut slots: Vec<Slot> = Vec::with_capacity(depth);
        for index in 0..depth {
            let mut slot = Slot::new(index as u16, index);
            if copy_mode == CopyMode::Async {
                let stream = match npu.create_stream() {
                    Ok(stream) => stream,
                    Err(err) => {
                        Self::destroy_slot_resources(npu, &mut slots);
                        return Err(err);
                    }
                };
                let event = match npu.create_event() {
                    Ok(event) => event,
                    Err(err) => {
                        npu.destroy_stream(stream);
                        Self::destroy_slot_resources(npu, &mut slots);
                        return Err(err);
                    }
                };
                slot.stream = Some(stream);
                slot.event = Some(event);
            }
            slots.push(slot);
        }
        Ok(slots)
    }

    fn destroy_slot_resources(npu: &dyn NpuRuntime, slots: &mut [Slot]) {
        for slot in slots {
            if let Some(event) = slot.event.take() {
                npu.destroy_event(event);
            }
            if let Some(stream) = slot.stream.take() {
                npu.destroy_stream(stream);
            }
        }
    }

    /// Largest chunk the engine will move in one command
    pub fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    /// Geometry of the attached namespace
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Configured pipeline depth
    pub fn pipeline_depth(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently in the free ring; equals the depth whenever no
    /// batch is running
    pub fn free_slots(&self) -> usize {
        self.ring.len()
    }

    /// Write a batch of items from accelerator memory to storage
    pub fn write_batch(&mut self, items: &[TransferItem]) -> Result<BatchReport, TransferError> {
        self.run_batch(TransferDirection::Write, items)
    }

    /// Read a batch of items from storage into accelerator memory
    pub fn read_batch(&mut self, items: &[TransferItem]) -> Result<BatchReport, TransferError> {
        self.run_batch(TransferDirection::Read, items)
    }

    fn run_batch(
        &mut self,
        direction: TransferDirection,
        items: &[TransferItem],
    ) -> Result<BatchReport, TransferError> {
        let qpair = self
            .qpair
            .as_deref_mut()
            .ok_or(TransferError::Environment("engine is shut down"))?;
        let pool = self
            .pool
            .as_mut()
            .ok_or(TransferError::Environment("engine is shut down"))?;

        let outcome = BatchScheduler::new(BatchContext {
            direction,
            copy_mode: self.copy_mode,
            items,
            npu: self.npu.as_ref(),
            qpair,
            pool,
            ring: &mut self.ring,
            slots: self.slots.as_mut_slice(),
            geometry: &self.geometry,
            max_transfer: self.max_transfer,
            watchdog_timeout: self.watchdog_timeout,
            profiling: self.profiling,
        })
        .run();

        if self.profiling {
            outcome.profile.emit(direction.profile_file());
        }

        match outcome.error {
            Some(err) => {
                warn!(
                    "{} batch failed: {} ({} of {} chunks errored)",
                    direction, err, outcome.failed_chunks, outcome.chunks
                );
                Err(err)
            }
            None => Ok(BatchReport {
                chunks: outcome.chunks,
                bytes: outcome.bytes,
                elapsed: outcome.elapsed,
            }),
        }
    }

    /// Tear the engine down: queue pair, staging pool, per-slot
    /// stream/event pairs, controller, accelerator binding. Idempotent,
    /// and tolerant of a partially initialized engine.
    pub fn cleanup(&mut self) {
        // The queue pair goes before the pool: staging buffers must not
        // be released while a command could still reference them.
        if let Some(mut qpair) = self.qpair.take() {
            let _ = qpair.process_completions(0);
        }
        self.pool.take();

        for slot in &mut self.slots {
            if let Some(event) = slot.event.take() {
                self.npu.destroy_event(event);
            }
            if let Some(stream) = slot.stream.take() {
                self.npu.destroy_stream(stream);
            }
        }

        self.controller.take();

        if self.device_bound {
            if let Err(err) = self.npu.reset_device(self.device_id) {
                warn!("device reset failed during cleanup: {}", err);
            }
            self.device_bound = false;
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNpu, MockNvme};

    fn addr() -> PciAddress {
        "0000:83:00.0".parse().unwrap()
    }

    fn mk_engine(npu: &MockNpu, driver: &MockNvme, config: EngineConfig) -> TransferEngine {
        TransferEngine::init(Box::new(npu.clone()), driver, &addr(), 0, config).unwrap()
    }

    #[test]
    fn test_init_reports_geometry() {
        let npu = MockNpu::new(1024 * 1024);
        let driver = MockNvme::new(512, 1 << 16);
        let engine = mk_engine(&npu, &driver, EngineConfig::default().with_chunk_size(65536));
        assert_eq!(engine.max_transfer(), 65536);
        assert_eq!(engine.geometry().sector_size, 512);
        assert_eq!(engine.pipeline_depth(), 4);
        assert_eq!(engine.free_slots(), 4);
        assert_eq!(npu.bound_device(), Some(0));
    }

    #[test]
    fn test_init_rejects_bad_chunk_size() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        for chunk in [0usize, 1000, 4097] {
            let result = TransferEngine::init(
                Box::new(npu.clone()),
                &driver,
                &addr(),
                0,
                EngineConfig::default().with_chunk_size(chunk),
            );
            assert!(matches!(result, Err(TransferError::Configuration(_))));
        }
    }

    #[test]
    fn test_init_clamps_depth() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        let engine = mk_engine(&npu, &driver, EngineConfig::default().with_depth(64));
        assert_eq!(engine.pipeline_depth(), MAX_PIPELINE_DEPTH);
        let engine = mk_engine(&npu, &driver, EngineConfig::default().with_depth(0));
        assert_eq!(engine.pipeline_depth(), 1);
    }

    #[test]
    fn test_chunk_size_capped_by_controller_limit() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        driver.set_mdts(5); // 2^17 = 128 KiB
        let engine = mk_engine(
            &npu,
            &driver,
            EngineConfig::default().with_chunk_size(1024 * 1024),
        );
        assert_eq!(engine.max_transfer(), 128 * 1024);
    }

    #[test]
    fn test_init_failure_unwinds_device_bind() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        driver.fail_dma_allocs_after(1);
        let result = TransferEngine::init(
            Box::new(npu.clone()),
            &driver,
            &addr(),
            0,
            EngineConfig::default().with_depth(4),
        );
        assert!(matches!(result, Err(TransferError::Environment(_))));
        assert_eq!(npu.bound_device(), None);
        assert_eq!(driver.live_dma_buffers(), 0);
        assert_eq!(npu.live_streams(), 0);
        assert_eq!(npu.live_events(), 0);
    }

    #[test]
    fn test_init_fails_without_phys_translation() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        driver.deny_phys_translation();
        let result = TransferEngine::init(
            Box::new(npu.clone()),
            &driver,
            &addr(),
            0,
            EngineConfig::default(),
        );
        assert!(matches!(result, Err(TransferError::Environment(_))));
        assert_eq!(driver.live_dma_buffers(), 0);
    }

    #[test]
    fn test_env_init_shared_across_engines() {
        let driver = MockNvme::new(512, 1 << 16);
        let npu = MockNpu::new(4096);
        let first = mk_engine(&npu, &driver, EngineConfig::default());
        let second = mk_engine(&npu, &driver, EngineConfig::default());
        assert_eq!(driver.env_init_count(), 1);
        drop(first);
        drop(second);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_releases_resources() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        let mut engine = mk_engine(&npu, &driver, EngineConfig::default().with_depth(3));
        assert_eq!(npu.live_streams(), 3);
        assert_eq!(npu.live_events(), 3);
        engine.cleanup();
        engine.cleanup();
        assert_eq!(driver.live_dma_buffers(), 0);
        assert_eq!(npu.live_streams(), 0);
        assert_eq!(npu.live_events(), 0);
        assert_eq!(npu.bound_device(), None);
        assert!(engine.write_batch(&[]).is_err());
    }

    #[test]
    fn test_sync_mode_creates_no_streams() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        let _engine = mk_engine(
            &npu,
            &driver,
            EngineConfig::default().with_copy_mode(CopyMode::Sync),
        );
        assert_eq!(npu.live_streams(), 0);
        assert_eq!(npu.live_events(), 0);
    }

    #[test]
    fn test_empty_batch_is_noop_success() {
        let npu = MockNpu::new(4096);
        let driver = MockNvme::new(512, 1 << 16);
        let mut engine = mk_engine(&npu, &driver, EngineConfig::default());
        let report = engine.write_batch(&[]).unwrap();
        assert_eq!(report.chunks, 0);
        assert_eq!(report.bytes, 0);
        assert_eq!(engine.free_slots(), engine.pipeline_depth());
    }
}
