//! Error and status types shared by the writer, the capture routine and the
//! service entry points.
//!
//! Three layers exist:
//!
//! - [`KcdataError`] comes out of the buffer writer. `BufferFull` is the only
//!   variant the retry loop reacts to.
//! - [`CaptureError`] comes out of the atomic capture routine.
//! - [`Status`] is what an external caller sees.

use std::fmt;

use serde::Serialize;

/// Errors raised by [`crate::kcdata::KcdataWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcdataError {
    /// The remaining capacity cannot hold the requested item.
    BufferFull,
    /// The buffer itself could not be allocated.
    NoMemory { bytes: usize },
    /// A container was opened past the configured nesting limit.
    NestingTooDeep { depth: usize },
    /// An end marker did not match the innermost open container, or the
    /// buffer was finalized with containers or windows still open.
    UnbalancedContainer,
    /// A compression window was closed without being opened.
    WindowNotOpen,
    /// The deflate stream reported an error.
    Compression,
    /// A previous failure left the buffer in an unknown state.
    Poisoned,
}

impl fmt::Display for KcdataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KcdataError::BufferFull => write!(f, "kcdata buffer is full"),
            KcdataError::NoMemory { bytes } => {
                write!(f, "cannot allocate a {} byte kcdata buffer", bytes)
            }
            KcdataError::NestingTooDeep { depth } => {
                write!(f, "container nesting exceeds depth {}", depth)
            }
            KcdataError::UnbalancedContainer => write!(f, "unbalanced container markers"),
            KcdataError::WindowNotOpen => write!(f, "no compression window is open"),
            KcdataError::Compression => write!(f, "compression stream failure"),
            KcdataError::Poisoned => write!(f, "kcdata buffer was poisoned by an earlier error"),
        }
    }
}

impl std::error::Error for KcdataError {}

/// Errors raised while a capture is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    /// Ran out of space; the orchestrator grows the buffer and retries.
    BufferFull,
    /// No memory for a buffer of the requested size. Not retried.
    NoMemory { bytes: usize },
    /// A kernel object failed validation before it could be read.
    InvalidObject { kva: u64 },
    /// Any other writer failure. The buffer cannot be trusted.
    Kcdata(KcdataError),
}

impl From<KcdataError> for CaptureError {
    fn from(err: KcdataError) -> Self {
        match err {
            KcdataError::BufferFull => CaptureError::BufferFull,
            KcdataError::NoMemory { bytes } => CaptureError::NoMemory { bytes },
            other => CaptureError::Kcdata(other),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::BufferFull => write!(f, "capture buffer is full"),
            CaptureError::NoMemory { bytes } => {
                write!(f, "no memory for a {} byte capture buffer", bytes)
            }
            CaptureError::InvalidObject { kva } => {
                write!(f, "kernel object at {:#x} failed validation", kva)
            }
            CaptureError::Kcdata(err) => write!(f, "kcdata: {}", err),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Status codes returned to callers of [`crate::service::StackshotService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    /// Malformed request or a flag combination that makes no sense.
    InvalidArgument,
    /// Valid flags that cannot be combined in this implementation.
    NotSupported,
    /// The caller is not allowed to use the requested flags.
    NoAccess,
    /// Another capture holds the lock and the caller asked not to wait.
    AlreadyRunning,
    /// The buffer could not grow any further, or could not be allocated.
    ResourceShortage,
    /// A retained buffer already exists.
    MemoryPresent,
    /// Retrieval was requested but nothing is retained.
    NotInSet,
    /// A fixed-size caller buffer was too small.
    InsufficientBufferSize,
    /// The capture hit an internal inconsistency.
    Failure,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::InvalidArgument => "invalid argument",
            Status::NotSupported => "not supported",
            Status::NoAccess => "no access",
            Status::AlreadyRunning => "a stackshot is already running",
            Status::ResourceShortage => "resource shortage",
            Status::MemoryPresent => "a retained buffer is already present",
            Status::NotInSet => "no retained buffer",
            Status::InsufficientBufferSize => "insufficient buffer size",
            Status::Failure => "failure",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for Status {}

impl From<CaptureError> for Status {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::BufferFull => Status::InsufficientBufferSize,
            CaptureError::NoMemory { .. } => Status::ResourceShortage,
            CaptureError::InvalidObject { .. } | CaptureError::Kcdata(_) => Status::Failure,
        }
    }
}
