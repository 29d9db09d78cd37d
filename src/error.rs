//! Error taxonomy for the acquisition core (spec.md §7).

use std::io;
use std::time::SystemTimeError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdqError>;

/// All of the ways a control, DMA, or recording operation can fail.
///
/// Variants map directly onto the abstract error kinds named in spec.md §7;
/// nothing here is specific to one transport (ioctl vs. in-process).
#[derive(Debug, Error)]
pub enum AdqError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("operation not valid in current device mode: {0}")]
    InvalidMode(&'static str),

    #[error("invalid object handle")]
    InvalidObjectHandle,

    #[error("device is busy")]
    Busy,

    #[error("failed to allocate a DMA buffer of {requested_bytes} bytes")]
    DmaBufAllocFail { requested_bytes: usize },

    #[error("buffer too small: need {needed} bytes, have {have} bytes")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("invalid DMA address")]
    InvalidDmaAddr,

    #[error("operation timed out")]
    TimedOut,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("PCI FIFO overflow; samples were dropped")]
    FifoOverflow,

    #[error("clock generator DCMs failed to lock")]
    DcmSyncFailed,

    #[error("timestamp FIFO overflowed")]
    TimestampFifoOverflow,

    #[error("file I/O error: {0}")]
    FileIo(#[from] io::Error),

    #[error("system clock error: {0}")]
    SystemTime(#[from] SystemTimeError),

    #[error("disk full")]
    DiskFull,

    #[error("out of memory")]
    OutOfMemory,

    #[error("resource allocation failure")]
    ResourceAllocFailure,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("not implemented in current firmware (requires >= {required_version:#06x})")]
    NotImplementedInFirmware { required_version: u32 },

    #[error("unexpected internal state: {0}")]
    Unexpected(&'static str),
}

impl AdqError {
    /// True for errors a recording session should treat as fatal to the run
    /// (as opposed to a cancellation it asked for itself).
    pub fn is_recording_fatal(&self) -> bool {
        !matches!(self, AdqError::Cancelled)
    }
}
