//! # NVMe User-Space Driver Interface
//!
//! Seam between the transfer engine and the user-space NVMe driver.
//! The engine consumes controller attach, namespace geometry, DMA-capable
//! buffer allocation, and one polled I/O queue pair through the traits in
//! this module; the driver behind them owns the PCIe plumbing.
//!
//! Completions are matched to their originating pipeline slot by a `u16`
//! token carried through the queue pair. The token is the slot index into
//! a fixed table, so a completion writes exactly one slot record.

use core::fmt;
use core::str::FromStr;

use crate::error::TransferError;

/// PCI function address in domain:bus:device.function form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// PCI domain (segment group)
    pub domain: u16,
    /// Bus number
    pub bus: u8,
    /// Device number (0..32)
    pub device: u8,
    /// Function number (0..8)
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = TransferError;

    /// Parse a textual address such as `0000:83:00.0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const BAD: TransferError = TransferError::Configuration("malformed PCI address");

        let (rest, function) = s.rsplit_once('.').ok_or(BAD)?;
        let mut parts = rest.split(':');
        let domain = parts.next().ok_or(BAD)?;
        let bus = parts.next().ok_or(BAD)?;
        let device = parts.next().ok_or(BAD)?;
        if parts.next().is_some() {
            return Err(BAD);
        }

        let addr = PciAddress {
            domain: u16::from_str_radix(domain, 16).map_err(|_| BAD)?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| BAD)?,
            device: u8::from_str_radix(device, 16).map_err(|_| BAD)?,
            function: u8::from_str_radix(function, 16).map_err(|_| BAD)?,
        };
        if addr.device >= 32 || addr.function >= 8 {
            return Err(BAD);
        }
        Ok(addr)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Identify data the engine needs from an attached controller
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    /// Model number string
    pub model: String,
    /// Serial number string
    pub serial: String,
    /// Logical block size of the active namespace in bytes
    pub sector_size: u32,
    /// Total logical blocks in the active namespace
    pub total_sectors: u64,
    /// Raw MDTS field from identify controller data (0 = unreported)
    pub mdts: u8,
}

bitflags::bitflags! {
    /// Flag bits of the completion status word
    pub struct StatusFlags: u16 {
        /// Phase tag
        const PHASE = 1 << 0;
        /// More status information available via Get Log Page
        const MORE = 1 << 14;
        /// Do Not Retry
        const DNR = 1 << 15;
    }
}

/// Decoded completion status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    raw: u16,
}

impl CompletionStatus {
    /// Status word reporting generic success
    pub const SUCCESS: CompletionStatus = CompletionStatus { raw: 0 };

    /// Wrap a raw status field from a completion queue entry
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    /// Build a status word from status code type and status code
    pub fn from_parts(status_code_type: u8, status_code: u8) -> Self {
        Self {
            raw: (((status_code_type as u16) & 0x7) << 9) | ((status_code as u16) << 1),
        }
    }

    /// Status code field
    pub fn status_code(&self) -> u8 {
        ((self.raw >> 1) & 0xff) as u8
    }

    /// Status code type field
    pub fn status_code_type(&self) -> u8 {
        ((self.raw >> 9) & 0x7) as u8
    }

    /// Flag bits (phase, more, do-not-retry)
    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.raw)
    }

    /// Check whether the command completed successfully
    pub fn is_error(&self) -> bool {
        self.status_code() != 0 || self.status_code_type() != 0
    }

    /// Convert a failed status into the engine error representation
    pub fn as_error(&self) -> Option<TransferError> {
        if self.is_error() {
            Some(TransferError::Media {
                status_code_type: self.status_code_type(),
                status_code: self.status_code(),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            write!(
                f,
                "sct {:#x} sc {:#x}{}",
                self.status_code_type(),
                self.status_code(),
                if self.flags().contains(StatusFlags::DNR) {
                    " (dnr)"
                } else {
                    ""
                }
            )
        } else {
            write!(f, "success")
        }
    }
}

/// One drained completion from the queue pair
#[derive(Debug, Clone, Copy)]
pub struct IoCompletion {
    /// Token the command was submitted with
    pub token: u16,
    /// Decoded command status
    pub status: CompletionStatus,
}

/// Pinned, DMA-addressable host buffer
///
/// The memory behind the buffer stays mapped at a stable virtual and
/// physical address for the buffer's whole lifetime; the device may be
/// programmed with `physical_addr` at any point before the buffer drops.
pub trait DmaBuffer {
    /// Buffer capacity in bytes
    fn len(&self) -> usize;

    /// True when the buffer has zero capacity
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read pointer to the start of the buffer
    fn as_ptr(&self) -> *const u8;

    /// Write pointer to the start of the buffer.
    ///
    /// Takes `&self` because the device mutates the buffer through DMA
    /// regardless of Rust borrows; exclusive use is enforced one level up
    /// by slot ownership.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Physical address usable in a device descriptor, or `None` when the
    /// translation is unavailable (the buffer is then not DMA-safe)
    fn physical_addr(&self) -> Option<u64>;

    /// View the buffer as a byte slice
    fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// View the buffer as a mutable byte slice
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len()) }
    }
}

/// One NVMe submission/completion queue pair owned by a single engine
///
/// All methods are called from the engine's scheduler thread only.
pub trait IoQueuePair {
    /// Submit a write of `nblocks` logical blocks starting at `lba`,
    /// sourced from `buf`.
    ///
    /// The buffer must stay valid and unmodified until the completion
    /// carrying `token` has been drained; the engine guarantees this by
    /// keeping the owning slot claimed for the in-flight window.
    fn submit_write(
        &mut self,
        token: u16,
        buf: &dyn DmaBuffer,
        lba: u64,
        nblocks: u32,
    ) -> Result<(), TransferError>;

    /// Submit a read of `nblocks` logical blocks starting at `lba` into
    /// `buf`. Same buffer-lifetime contract as `submit_write`.
    fn submit_read(
        &mut self,
        token: u16,
        buf: &dyn DmaBuffer,
        lba: u64,
        nblocks: u32,
    ) -> Result<(), TransferError>;

    /// Poll the completion queue once and drain finished commands.
    ///
    /// `max` bounds how many completions are reaped; 0 means no bound.
    fn process_completions(&mut self, max: u32) -> Vec<IoCompletion>;
}

/// Attached NVMe controller with one active namespace
pub trait NvmeController {
    /// Identify data captured at attach
    fn info(&self) -> &ControllerInfo;

    /// Allocate an I/O queue pair. The engine allocates exactly one per
    /// controller handle.
    fn alloc_io_qpair(&mut self) -> Result<Box<dyn IoQueuePair>, TransferError>;

    /// Allocate a pinned DMA buffer of at least `len` bytes aligned to
    /// `align`
    fn alloc_dma_buffer(&self, len: usize, align: usize)
        -> Result<Box<dyn DmaBuffer>, TransferError>;
}

/// Entry point into the user-space NVMe driver
pub trait NvmeDriver {
    /// One-time process-wide environment bring-up (hugepages, IOMMU
    /// grouping). Must be idempotent: every call after the first succeeds
    /// without re-initializing.
    fn ensure_env(&self) -> Result<(), TransferError>;

    /// Probe the controller at `addr` and attach to its first active
    /// namespace
    fn probe(&self, addr: &PciAddress) -> Result<Box<dyn NvmeController>, TransferError>;
}
