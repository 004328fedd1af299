//! # Transfer Error Types
//!
//! Shared error enum for the transfer engine and its collaborator seams.
//! Every driver-facing trait and every engine operation reports through
//! `TransferError`, so a batch carries exactly one error representation
//! from submission to the caller.

use core::fmt;

/// Errors reported by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Invalid parameters to init or a batch call
    Configuration(&'static str),
    /// Environment bring-up failed: hugepages, device bind, probe,
    /// queue-pair or DMA buffer allocation
    Environment(&'static str),
    /// Accelerator copy failed (either direction)
    Copy,
    /// NVMe command could not be submitted
    Submission,
    /// NVMe completion returned a non-success status
    Media {
        /// Status code type field of the completion
        status_code_type: u8,
        /// Status code field of the completion
        status_code: u8,
    },
    /// Requested range exceeds device capacity
    Capacity,
    /// Watchdog fired before the batch completed
    Timeout,
}

impl TransferError {
    /// Severity classification used when logging error paths
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransferError::Configuration(_) => ErrorSeverity::Warning,
            TransferError::Capacity => ErrorSeverity::Warning,
            TransferError::Environment(_) => ErrorSeverity::Critical,
            TransferError::Copy => ErrorSeverity::Error,
            TransferError::Submission => ErrorSeverity::Error,
            TransferError::Media { .. } => ErrorSeverity::Error,
            TransferError::Timeout => ErrorSeverity::Critical,
        }
    }

    /// True for errors detected before any hardware was touched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransferError::Configuration(_) | TransferError::Capacity
        )
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Configuration(what) => write!(f, "Invalid configuration: {}", what),
            TransferError::Environment(what) => write!(f, "Environment failure: {}", what),
            TransferError::Copy => write!(f, "Accelerator copy failed"),
            TransferError::Submission => write!(f, "Command submission failed"),
            TransferError::Media {
                status_code_type,
                status_code,
            } => write!(
                f,
                "Media error (sct {:#x}, sc {:#x})",
                status_code_type, status_code
            ),
            TransferError::Capacity => write!(f, "Range exceeds device capacity"),
            TransferError::Timeout => write!(f, "Batch watchdog expired"),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}
