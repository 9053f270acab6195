use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for FerroDB storage operations.
///
/// Modeled on the classic embedded-database error codes: lock contention is
/// always retryable, I/O errors are fatal to the in-flight operation but not
/// to the connection, corruption is surfaced and never retried internally.
#[derive(Error, Debug)]
pub enum FerroError {
    // === Lock contention ===
    /// A lock transition conflicted with another connection.
    ///
    /// Always retryable by the caller, optionally through a busy-handler.
    #[error("database is busy")]
    Busy,

    /// A lock primitive failed for a reason other than contention.
    #[error("file locking failed: {detail}")]
    LockFailed { detail: String },

    // === I/O Errors ===
    /// File I/O error, propagated verbatim from the VFS.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === WAL Errors ===
    /// The WAL or wal-index is corrupt beyond what recovery can rebuild.
    #[error("write-ahead log is corrupt: {detail}")]
    WalCorrupt { detail: String },

    // === VFS Errors ===
    /// Cannot open a file.
    #[error("unable to open file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// Operation is not supported by the current VFS backend.
    #[error("unsupported operation")]
    Unsupported,

    // === Resource Errors ===
    /// Allocation failure while growing the wal-index or scratch space.
    #[error("out of memory")]
    OutOfMemory,

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric result codes for host notification hooks and FFI surfaces.
///
/// The values match the classic SQLite code assignments so embedders can
/// reuse existing retry/abort policies unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Lock contention; retry.
    Busy = 5,
    /// Out of memory.
    NoMem = 7,
    /// Disk I/O error.
    IoErr = 10,
    /// On-disk image is malformed.
    Corrupt = 11,
    /// Unable to open file.
    CantOpen = 14,
}

impl FerroError {
    /// Map this error to its numeric code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Busy | Self::LockFailed { .. } => ErrorCode::Busy,
            Self::Io(_) | Self::ShortRead { .. } => ErrorCode::IoErr,
            Self::WalCorrupt { .. } => ErrorCode::Corrupt,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Unsupported => ErrorCode::Error,
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    ///
    /// Higher layers use this to decide between re-running a transaction
    /// and aborting it; see the busy-handler protocol on checkpoint.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::LockFailed { .. })
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::WalCorrupt {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `FerroError`.
pub type Result<T> = std::result::Result<T, FerroError>;
