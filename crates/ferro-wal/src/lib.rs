//! Write-ahead log for FerroDB.
//!
//! Readers see a consistent snapshot of the database while a single writer
//! appends new page versions; a checkpoint folds the log back into the main
//! database file. See `Wal` for the connection-level API.

mod frame;
mod index;
mod iterator;
mod lock;
mod wal;

pub use frame::{
    WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WalChecksum, WalFileHeader, WalSalts, decode_frame,
    encode_frame, frame_offset,
};
pub use index::WalIndexHdr;
pub use wal::{DirtyPage, SavepointMark, Wal, WalLimits};
