//! Flag sets passed through the VFS layer.

use bitflags::bitflags;

bitflags! {
    /// Sync behavior requested on `VfsFile::sync`.
    ///
    /// An empty set means "no durability barrier requested"; callers that
    /// hold dirty commit frames test this with [`SyncFlags::is_empty`]
    /// before paying for sector padding and fsync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        /// Normal fsync.
        const NORMAL = 0x0000_0001;
        /// Full barrier sync (F_FULLFSYNC where supported).
        const FULL = 0x0000_0002;
        /// Data-only sync (fdatasync).
        const DATAONLY = 0x0000_0010;
    }
}

bitflags! {
    /// How and what kind of file to open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VfsOpenFlags: u32 {
        /// Open read-write.
        const READWRITE = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE = 0x0000_0004;
        /// The main database file.
        const MAIN_DB = 0x0000_0100;
        /// A write-ahead log file.
        const WAL = 0x0008_0000;
        /// Delete the file when the handle is closed.
        const DELETEONCLOSE = 0x0000_0008;
    }
}

bitflags! {
    /// Access checks performed by `Vfs::access`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Does the file exist?
        const EXISTS = 0x0000_0001;
        /// Is the file readable and writable?
        const READWRITE = 0x0000_0002;
    }
}
