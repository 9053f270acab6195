use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferro_error::{FerroError, Result};
use ferro_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use parking_lot::Mutex;

use crate::traits::{Vfs, VfsFile};

/// Shared storage for one file in the memory VFS.
#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
}

/// Shared state for the entire memory VFS.
#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
}

/// An in-memory VFS for testing and in-memory databases.
///
/// All files are stored in memory with no persistence. Clones share the
/// same underlying file map, so multiple connections opened from clones of
/// one `MemoryVfs` see the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &Path, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        let mut inner = self.inner.lock();

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let storage = if let Some(existing) = inner.files.get(path) {
            Arc::clone(existing)
        } else if is_create {
            let storage = Arc::new(Mutex::new(FileStorage::default()));
            inner.files.insert(path.to_path_buf(), Arc::clone(&storage));
            storage
        } else {
            return Err(FerroError::CannotOpen {
                path: path.to_path_buf(),
            });
        };
        drop(inner);

        let file = MemoryFile {
            path: path.to_path_buf(),
            storage,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            vfs: Arc::clone(&self.inner),
        };

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }
        Ok((file, out_flags))
    }

    fn delete(&self, path: &Path, _sync_dir: bool) -> Result<()> {
        self.inner.lock().files.remove(path);
        Ok(())
    }

    fn access(&self, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(path))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(Path::new("/").join(path))
        }
    }
}

/// A file handle in the memory VFS.
///
/// Reads and writes operate on a shared `Vec<u8>` protected by a mutex.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<Mutex<FileStorage>>,
    delete_on_close: bool,
    vfs: Arc<Mutex<MemoryVfsInner>>,
}

impl VfsFile for MemoryFile {
    fn close(&mut self) -> Result<()> {
        if self.delete_on_close {
            self.vfs.lock().files.remove(&self.path);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let storage = self.storage.lock();

        let offset = offset as usize;
        let file_len = storage.data.len();

        if offset >= file_len {
            drop(storage);
            buf.fill(0);
            return Ok(0);
        }

        let available = file_len - offset;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        drop(storage);

        if to_read < buf.len() {
            buf[to_read..].fill(0);
        }
        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let mut storage = self.storage.lock();

        let offset = offset as usize;
        let end = offset + buf.len();
        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }
        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, size: u64) -> Result<()> {
        self.storage.lock().data.truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.storage.lock().data.len() as u64)
    }
}
