//! # Accelerator Runtime Interface
//!
//! Seam between the transfer engine and the NPU runtime. The engine only
//! needs explicit copies between device memory and pinned host memory,
//! plus streams and events for the asynchronous copy mode; device
//! selection and runtime bring-up stay on the runtime's side of the seam.

use crate::error::TransferError;

/// Address in accelerator device memory
///
/// Opaque to the host: it is only ever handed back to the runtime's copy
/// primitives, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Address `bytes` past this one
    pub fn offset(&self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Handle to an accelerator stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(pub u64);

/// Handle to an accelerator event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(pub u64);

/// Accelerator runtime operations consumed by the engine
///
/// All methods are called from the engine's scheduler thread only.
pub trait NpuRuntime {
    /// Bind the calling process to an accelerator device
    fn bind_device(&self, device_id: u32) -> Result<(), TransferError>;

    /// Reset the previously bound device, releasing its contexts
    fn reset_device(&self, device_id: u32) -> Result<(), TransferError>;

    /// Blocking device-to-host copy
    fn copy_to_host(&self, src: DevicePtr, dst: &mut [u8]) -> Result<(), TransferError>;

    /// Blocking host-to-device copy
    fn copy_from_host(&self, src: &[u8], dst: DevicePtr) -> Result<(), TransferError>;

    /// Create a stream for ordered asynchronous copies
    fn create_stream(&self) -> Result<StreamHandle, TransferError>;

    /// Destroy a stream; outstanding work on it must have drained
    fn destroy_stream(&self, stream: StreamHandle);

    /// Enqueue a device-to-host copy on `stream`.
    ///
    /// # Safety
    ///
    /// `dst` must point to at least `len` writable bytes that stay valid
    /// and unaliased until an event recorded on `stream` after this call
    /// reports signaled.
    unsafe fn copy_to_host_async(
        &self,
        src: DevicePtr,
        dst: *mut u8,
        len: usize,
        stream: StreamHandle,
    ) -> Result<(), TransferError>;

    /// Enqueue a host-to-device copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must point to at least `len` readable bytes that stay valid
    /// and unmodified until an event recorded on `stream` after this call
    /// reports signaled.
    unsafe fn copy_from_host_async(
        &self,
        src: *const u8,
        len: usize,
        dst: DevicePtr,
        stream: StreamHandle,
    ) -> Result<(), TransferError>;

    /// Create an event for completion tracking
    fn create_event(&self) -> Result<EventHandle, TransferError>;

    /// Record `event` at the current tail of `stream`
    fn record_event(&self, event: EventHandle, stream: StreamHandle)
        -> Result<(), TransferError>;

    /// Non-blocking query: has everything before the recorded point
    /// finished?
    fn event_signaled(&self, event: EventHandle) -> Result<bool, TransferError>;

    /// Destroy an event
    fn destroy_event(&self, event: EventHandle);
}
