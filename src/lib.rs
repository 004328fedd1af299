//! # npu-nvme
//!
//! Pipelined bulk transfer engine between an accelerator's (NPU)
//! on-device memory and an NVMe namespace attached to the same host,
//! built on user-space polled I/O. Neither device can DMA into the
//! other, so the engine owns a pool of pinned staging buffers and runs a
//! two-stage pipeline per chunk: a device copy into (or out of) a
//! staging buffer, and an NVMe command that DMAs the same buffer to or
//! from media.
//!
//! The accelerator runtime and the NVMe driver are consumed through the
//! traits in [`npu`] and [`nvme`]; RAM-backed implementations for tests
//! live in [`testing`].
//!
//! ## Example
//!
//! ```no_run
//! use npu_nvme::{EngineConfig, TransferEngine, TransferItem};
//! use npu_nvme::testing::{MockNpu, MockNvme};
//!
//! let npu = MockNpu::new(8 * 1024 * 1024);
//! let driver = MockNvme::new(512, 1 << 20);
//! let mut engine = TransferEngine::init(
//!     Box::new(npu.clone()),
//!     &driver,
//!     &"0000:83:00.0".parse().unwrap(),
//!     0,
//!     EngineConfig::default(),
//! ).unwrap();
//!
//! let data = npu.alloc(1 << 20);
//! engine.write_batch(&[TransferItem {
//!     device_ptr: data,
//!     storage_offset: 0,
//!     len: 1 << 20,
//! }]).unwrap();
//! ```

pub mod engine;
pub mod env;
pub mod error;
pub mod geometry;
pub mod npu;
pub mod nvme;
pub mod profile;
pub mod testing;

mod pool;
mod ring;
mod scheduler;
mod slot;

pub use engine::{
    BatchReport, CopyMode, EngineConfig, TransferEngine, TransferItem, MAX_PIPELINE_DEPTH,
};
pub use error::{ErrorSeverity, TransferError};
pub use geometry::DeviceGeometry;
pub use npu::{DevicePtr, EventHandle, NpuRuntime, StreamHandle};
pub use nvme::{
    CompletionStatus, ControllerInfo, DmaBuffer, IoCompletion, IoQueuePair, NvmeController,
    NvmeDriver, PciAddress,
};
pub use profile::ChunkTiming;
pub use scheduler::TransferDirection;
