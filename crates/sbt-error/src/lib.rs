#![forbid(unsafe_code)]
//! Error types for the sbt btree engine.
//!
//! # Error Taxonomy
//!
//! | Family | Variants | Handling |
//! |--------|----------|----------|
//! | Restart | `Restart(RestartReason)` | Caught and retried by the nearest transaction-attempt loop |
//! | Resource | `NoMemory` | Hard error only when the heap itself refuses the allocation |
//! | I/O / corruption | `Io`, `Corruption` | Propagated verbatim, never retried |
//! | Emergency read-only | `ReadOnly` | Every commit after a failed node write-back |
//! | Collaborator | `Journal` | Returned by the commit hook, never retried |
//! | Caller misuse | `NotFound`, `InvalidSnapshot`, `Invalid`, `Exists` | Propagated verbatim |
//!
//! Programming invariant violations (lock refcount underflow, path index out
//! of range, a closure reporting success while its transaction is in restart)
//! are not errors: they `panic!`.
//!
//! ## Restart reasons
//!
//! | Reason | Raised when |
//! |--------|-------------|
//! | `LockNotAvailable` | A node lock could not be taken without risking deadlock, or the bounded wait expired |
//! | `LockSeqStale` | A node changed since a should-be-locked path last observed it |
//! | `TooManyPaths` | The path table is full even after a reclaim pass |
//! | `FaultInjected` | Debug builds only: a configured random restart fired |
//! | `Nested` | A nested retry loop succeeded, but only after restarting |
//!
//! ## errno Mapping
//!
//! Every `SbtError` variant maps to exactly one POSIX errno via
//! [`SbtError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Restart` | `EAGAIN` |
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Journal` | `EIO` |
//! | `NoMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `InvalidSnapshot` | `EINVAL` |
//! | `Invalid` | `EINVAL` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |

use std::fmt;
use thiserror::Error;

/// Why a transaction attempt had to be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestartReason {
    LockNotAvailable,
    LockSeqStale,
    TooManyPaths,
    FaultInjected,
    Nested,
}

impl RestartReason {
    /// Every reason, in counter-index order.
    pub const ALL: [Self; 5] = [
        Self::LockNotAvailable,
        Self::LockSeqStale,
        Self::TooManyPaths,
        Self::FaultInjected,
        Self::Nested,
    ];

    /// Stable index for per-reason counters.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::LockNotAvailable => 0,
            Self::LockSeqStale => 1,
            Self::TooManyPaths => 2,
            Self::FaultInjected => 3,
            Self::Nested => 4,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LockNotAvailable => "lock_not_available",
            Self::LockSeqStale => "lock_seq_stale",
            Self::TooManyPaths => "too_many_paths",
            Self::FaultInjected => "fault_injected",
            Self::Nested => "nested",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unified error type for all sbt operations.
#[derive(Debug, Error)]
pub enum SbtError {
    /// Recoverable transaction-attempt failure. Never crosses a retry loop.
    #[error("transaction restart: {0}")]
    Restart(RestartReason),

    /// Node I/O failure reported by the node loader.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A loaded node does not match what its parent pointer promised.
    #[error("corrupt btree node {node}: {detail}")]
    Corruption { node: u64, detail: String },

    /// The heap refused an arena promotion.
    #[error("out of memory allocating {bytes} bytes")]
    NoMemory { bytes: usize },

    /// The commit hook (journal) failed.
    #[error("journal error: {0}")]
    Journal(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Snapshot workflow rejected an operation on `id`.
    #[error("invalid snapshot {id}: {detail}")]
    InvalidSnapshot { id: u32, detail: String },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("already exists: {0}")]
    Exists(String),

    /// A committed update could not be written back; commits are refused.
    #[error("read-only: {0}")]
    ReadOnly(String),
}

impl SbtError {
    /// True for the restart family.
    #[must_use]
    pub const fn is_restart(&self) -> bool {
        matches!(self, Self::Restart(_))
    }

    #[must_use]
    pub const fn restart_reason(&self) -> Option<RestartReason> {
        match self {
            Self::Restart(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// A restart reaching this point means a retry loop was skipped; it
    /// still maps to `EAGAIN` so a front end can ask its caller to retry.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Restart(_) => libc::EAGAIN,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Journal(_) => libc::EIO,
            Self::NoMemory { .. } => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::InvalidSnapshot { .. } | Self::Invalid(_) => libc::EINVAL,
            Self::Exists(_) => libc::EEXIST,
            Self::ReadOnly(_) => libc::EROFS,
        }
    }
}

/// Result alias using `SbtError`.
pub type Result<T> = std::result::Result<T, SbtError>;
