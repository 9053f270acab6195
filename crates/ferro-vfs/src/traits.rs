use std::path::{Path, PathBuf};

use ferro_error::Result;
use ferro_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};

/// A virtual filesystem implementation.
///
/// This trait abstracts all file system operations, allowing different
/// backends: real files (Unix), in-memory (testing), or custom
/// implementations supplied by an embedder.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g., "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `flags` describes what kind of file (main DB, WAL) and how to open
    /// it. Returns the opened file and the flags actually used (the VFS may
    /// add flags like `READWRITE` when `CREATE` is specified).
    fn open(&self, path: &Path, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file.
    ///
    /// If `sync_dir` is true, the directory entry removal should be synced
    /// to ensure durability.
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()>;

    /// Check file access.
    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a potentially relative path into an absolute path.
    ///
    /// Connections to the same database must agree on this value: it keys
    /// the shared wal-index directory.
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;

    /// Fill `buf` with bytes suitable for seeding WAL salts.
    ///
    /// The default implementation is deterministic (xorshift) for
    /// reproducible tests; real VFS implementations should override this
    /// with OS-provided randomness.
    fn randomness(&self, buf: &mut [u8]) {
        let mut state: u64 = 0x5DEE_CE66_D1A4_F681;
        for chunk in buf.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bytes = state.to_le_bytes();
            for (dst, &src) in chunk.iter_mut().zip(bytes.iter()) {
                *dst = src;
            }
        }
    }
}

/// A file handle opened by a VFS.
pub trait VfsFile: Send + Sync {
    /// Close the file. After this call, the handle should not be used.
    fn close(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are zeroed.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte offset `offset`, extending the file if
    /// needed.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Return the current file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Return the sector size for this file.
    ///
    /// The sector size is the minimum write granularity of the underlying
    /// storage; commit frames are padded out to this boundary before a
    /// durability sync. Defaults to 4096 bytes.
    fn sector_size(&self) -> u32 {
        4096
    }
}
