//! Operation status codes.
//!
//! `Status` is the terminal result surfaced to callers; `OpStatus` is the
//! richer internal result the operation engine routes through its dispatcher.

use std::fmt;

/// Result of a public store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed.
    #[default]
    Ok = 0,
    /// Operation needs a disk read; complete it via `complete_pending`.
    Pending = 1,
    /// Key does not exist (terminal, not an error).
    NotFound = 2,
    /// Memory budget exhausted and eviction could not free a page.
    OutOfMemory = 3,
    /// Device or checkpoint I/O failed.
    IoError = 4,
    /// Persistent data failed validation.
    Corruption = 5,
    /// Operation was aborted (CAS conflict surfaced, or user refusal).
    Aborted = 6,
    /// Invalid argument or contradictory settings.
    InvalidArgument = 7,
    /// Operation not valid in the current state.
    InvalidOperation = 8,
    /// Too many threads registered with the epoch manager.
    TooManyThreads = 9,
    /// Resource pressure (allocation stalled); refresh the epoch, then retry.
    RetryLater = 10,
}

impl Status {
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
            Status::TooManyThreads => "TooManyThreads",
            Status::RetryLater => "RetryLater",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal status produced by one attempt of an operation.
///
/// Non-terminal variants are handled by the engine's dispatcher and never
/// reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpStatus {
    /// Attempt succeeded.
    Success,
    /// Key not found in memory or on disk.
    NotFound,
    /// The record lives below the head address; async I/O required.
    RecordOnDisk,
    /// Transient conflict (CAS raced); retry immediately.
    RetryNow,
    /// Resource pressure (allocation stalled); refresh the epoch, then retry.
    RetryLater,
    /// The checkpoint state machine moved under this operation; the session
    /// must refresh its version/phase before re-dispatching.
    CprShiftDetected,
    /// Attempt failed terminally.
    Aborted,
    /// Device I/O failed.
    IoError,
}

impl OpStatus {
    #[inline]
    pub const fn needs_retry(&self) -> bool {
        matches!(self, OpStatus::RetryNow | OpStatus::RetryLater)
    }

    /// Map a terminal internal status to the caller-visible status.
    pub const fn to_status(&self) -> Status {
        match self {
            OpStatus::Success => Status::Ok,
            OpStatus::NotFound => Status::NotFound,
            OpStatus::RecordOnDisk
            | OpStatus::RetryNow
            | OpStatus::RetryLater
            | OpStatus::CprShiftDetected => Status::Pending,
            OpStatus::Aborted => Status::Aborted,
            OpStatus::IoError => Status::IoError,
        }
    }
}

/// Which public operation a pending/retry frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Read,
    Upsert,
    Rmw,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Read => write!(f, "Read"),
            OpKind::Upsert => write!(f, "Upsert"),
            OpKind::Rmw => write!(f, "RMW"),
            OpKind::Delete => write!(f, "Delete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        assert!(Status::Ok.is_ok());
        assert!(Status::Pending.is_pending());
        assert!(Status::NotFound.is_not_found());
        assert!(!Status::NotFound.is_error());
        assert!(Status::IoError.is_error());
        assert!(Status::TooManyThreads.is_error());
    }

    #[test]
    fn op_status_mapping() {
        assert_eq!(OpStatus::Success.to_status(), Status::Ok);
        assert_eq!(OpStatus::NotFound.to_status(), Status::NotFound);
        assert_eq!(OpStatus::RecordOnDisk.to_status(), Status::Pending);
        assert_eq!(OpStatus::CprShiftDetected.to_status(), Status::Pending);
        assert_eq!(OpStatus::Aborted.to_status(), Status::Aborted);
        assert!(OpStatus::RetryNow.needs_retry());
        assert!(OpStatus::RetryLater.needs_retry());
        assert!(!OpStatus::RecordOnDisk.needs_retry());
    }

    #[test]
    fn display_strings() {
        assert_eq!(Status::Ok.to_string(), "Ok");
        assert_eq!(Status::OutOfMemory.to_string(), "OutOfMemory");
        assert_eq!(OpKind::Rmw.to_string(), "RMW");
    }
}
