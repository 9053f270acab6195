use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use ferro_error::{FerroError, Result};
use ferro_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};

use crate::traits::{Vfs, VfsFile};

/// The default VFS for Unix-like systems.
///
/// Uses positional reads and writes (`pread`/`pwrite` via `FileExt`) so a
/// single handle never needs seek coordination.
#[derive(Debug, Clone, Default)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new Unix VFS.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, path: &Path, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        let mut options = OpenOptions::new();
        options.read(true);
        if flags.contains(VfsOpenFlags::READWRITE) || flags.contains(VfsOpenFlags::CREATE) {
            options.write(true);
        }
        if flags.contains(VfsOpenFlags::CREATE) {
            options.create(true);
        }

        let file = options.open(path).map_err(|_| FerroError::CannotOpen {
            path: path.to_path_buf(),
        })?;

        let mut out_flags = flags;
        if flags.contains(VfsOpenFlags::CREATE) {
            out_flags |= VfsOpenFlags::READWRITE;
        }

        Ok((
            UnixFile {
                file: Some(file),
                path: path.to_path_buf(),
                delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            },
            out_flags,
        ))
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if sync_dir {
            if let Some(dir) = path.parent() {
                if let Ok(d) = File::open(dir) {
                    let _ = d.sync_all();
                }
            }
        }
        Ok(())
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        if flags.contains(AccessFlags::READWRITE) {
            let meta = match fs::metadata(path) {
                Ok(m) => m,
                Err(_) => return Ok(false),
            };
            return Ok(!meta.permissions().readonly());
        }
        Ok(path.exists())
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            let cwd = std::env::current_dir()?;
            Ok(cwd.join(path))
        }
    }

    fn randomness(&self, buf: &mut [u8]) {
        // /dev/urandom never blocks once seeded. Leave the buffer untouched
        // on failure; callers mix it into per-connection xorshift state.
        if let Ok(mut f) = File::open("/dev/urandom") {
            let _ = f.read_exact(buf);
        }
    }
}

/// A file handle backed by a real Unix file descriptor.
#[derive(Debug)]
pub struct UnixFile {
    file: Option<File>,
    path: PathBuf,
    delete_on_close: bool,
}

impl UnixFile {
    fn handle(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| FerroError::internal("file used after close"))
    }
}

impl VfsFile for UnixFile {
    fn close(&mut self) -> Result<()> {
        self.file = None;
        if self.delete_on_close {
            let _ = fs::remove_file(&self.path);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.handle()?;
        let mut total = 0;
        while total < buf.len() {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.handle()?.write_all_at(buf, offset)?;
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.handle()?.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let file = self.handle()?;
        if flags.contains(SyncFlags::DATAONLY) {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.handle()?.metadata()?.len())
    }
}
