//! ZENEDGE error values.
//!
//! Errors are values at every boundary: nothing in this crate
//! unwinds. Every variant here is recoverable from the caller's point of
//! view; the flight recorder, not a panic, is the record of what happened.

use core::fmt;

/// Which budget a contract violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Cpu,
    Memory,
}

/// Why `Contract::admit` rejected a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    Memory,
    NoResources,
    Cpu,
    Priority,
}

/// Semantic error kinds raised by the core. Names mirror the
/// spec's vocabulary rather than inventing new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No frames, or no contiguous run of the requested length.
    OutOfMemory,
    /// Contract violation; recorded, never fatal.
    BudgetExceeded(BudgetKind),
    /// Allocation refused because the contract is in SAFE_MODE.
    SafeModeDenied,
    /// Returned from `admit_job`.
    AdmissionRejected(AdmissionReason),
    /// Producer found the ring full.
    RingFull,
    /// Consumer found the ring empty.
    RingEmpty,
    /// Adaptive poll exhausted its deadline.
    Timeout,
    /// Bad magic, out-of-bounds offset, or inconsistent tensor shape.
    BlobInvalid,
    /// Diagnostic warning: blob or page freed twice.
    DoubleFree,
    /// Diagnostic warning: free of an address that was never allocated.
    InvalidFree,
    /// A bounded collection (steps, tensors, deps, spans, contracts, blob
    /// index, ...) is at capacity.
    Capacity,
    /// A step/tensor/job id referenced by the caller does not exist.
    UnknownId,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::BudgetExceeded(BudgetKind::Cpu) => write!(f, "cpu budget exceeded"),
            Error::BudgetExceeded(BudgetKind::Memory) => write!(f, "memory budget exceeded"),
            Error::SafeModeDenied => write!(f, "contract is in SAFE_MODE"),
            Error::AdmissionRejected(r) => write!(f, "admission rejected: {:?}", r),
            Error::RingFull => write!(f, "ring full"),
            Error::RingEmpty => write!(f, "ring empty"),
            Error::Timeout => write!(f, "timeout"),
            Error::BlobInvalid => write!(f, "blob invalid"),
            Error::DoubleFree => write!(f, "double free"),
            Error::InvalidFree => write!(f, "invalid free"),
            Error::Capacity => write!(f, "capacity exceeded"),
            Error::UnknownId => write!(f, "unknown id"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
