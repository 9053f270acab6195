//! Shared wal-index memory and the five-state lock arbiter.
//!
//! This replaces the raw `volatile u32*` pointer casts of classic WAL
//! implementations with a safe, bounds-checked, word-addressed region, and
//! the process-global summary list with an explicit, path-keyed directory.
//!
//! One [`ShmHandle`] exists per WAL file; every connection to that WAL
//! holds an `Arc` to it. The handle carries both the index region and the
//! lock arbiter that serializes access to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ferro_error::{FerroError, Result};
use ferro_types::{ReadLockVariant, WalLockState};
use parking_lot::Mutex;

/// Increment by which the wal-index region grows.
pub const SHM_GROWTH_BYTES: usize = 64 * 1024;

/// A growable, zero-initialized shared-memory region.
///
/// The wal-index addresses the region in 32-bit words, stored in native
/// byte order (the region is rebuilt from the WAL after a crash, so it
/// never needs to be portable across architectures). All access is
/// bounds-checked; growth is explicit and never shrinks.
#[derive(Debug, Default)]
pub struct ShmRegion {
    data: Mutex<Vec<u8>>,
}

impl ShmRegion {
    /// Create a new empty region.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current region size in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.data.lock().len()
    }

    /// Grow the region to at least `bytes`, zero-filling new space.
    ///
    /// Growth is rounded up to the next [`SHM_GROWTH_BYTES`] multiple.
    /// Never shrinks. Allocation failure is reported as `OutOfMemory`
    /// rather than aborting the process.
    pub fn grow_to(&self, bytes: usize) -> Result<()> {
        let mut data = self.data.lock();
        if bytes <= data.len() {
            return Ok(());
        }
        let target = bytes.div_ceil(SHM_GROWTH_BYTES) * SHM_GROWTH_BYTES;
        let additional = target - data.len();
        data.try_reserve_exact(additional)
            .map_err(|_| FerroError::OutOfMemory)?;
        data.resize(target, 0);
        Ok(())
    }

    /// Read the native-order u32 at word index `word`.
    ///
    /// # Panics
    ///
    /// Panics if the word lies outside the mapped region.
    #[must_use]
    pub fn read_word(&self, word: usize) -> u32 {
        let data = self.data.lock();
        let off = word * 4;
        let bytes: [u8; 4] = data[off..off + 4]
            .try_into()
            .expect("slice is exactly 4 bytes");
        u32::from_ne_bytes(bytes)
    }

    /// Write the native-order u32 at word index `word`.
    ///
    /// # Panics
    ///
    /// Panics if the word lies outside the mapped region.
    pub fn write_word(&self, word: usize, value: u32) {
        let mut data = self.data.lock();
        let off = word * 4;
        data[off..off + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Read `out.len()` consecutive words starting at word index `word`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the mapped region.
    pub fn read_words(&self, word: usize, out: &mut [u32]) {
        let data = self.data.lock();
        let off = word * 4;
        for (i, slot) in out.iter_mut().enumerate() {
            let bytes: [u8; 4] = data[off + i * 4..off + i * 4 + 4]
                .try_into()
                .expect("slice is exactly 4 bytes");
            *slot = u32::from_ne_bytes(bytes);
        }
    }

    /// Write consecutive words starting at word index `word`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the mapped region.
    pub fn write_words(&self, word: usize, values: &[u32]) {
        let mut data = self.data.lock();
        let off = word * 4;
        for (i, &value) in values.iter().enumerate() {
            data[off + i * 4..off + i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Copy `out.len()` bytes starting at byte offset `byte`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the mapped region.
    pub fn read_bytes(&self, byte: usize, out: &mut [u8]) {
        let data = self.data.lock();
        out.copy_from_slice(&data[byte..byte + out.len()]);
    }

    /// Write bytes starting at byte offset `byte`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the mapped region.
    pub fn write_bytes(&self, byte: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[byte..byte + src.len()].copy_from_slice(src);
    }
}

/// Connection identifier within one [`ShmHandle`].
pub type ShmConnectionId = u64;

#[derive(Debug, Default)]
struct LockTable {
    next_id: ShmConnectionId,
    holders: HashMap<ShmConnectionId, WalLockState>,
}

impl LockTable {
    fn conflicts(&self, me: ShmConnectionId, desired: WalLockState) -> bool {
        let mut others = self
            .holders
            .iter()
            .filter(|&(&id, _)| id != me)
            .map(|(_, &s)| s);
        match desired {
            WalLockState::Unlock => false,
            // Readers are blocked only while history is being rewritten.
            WalLockState::Read => others.any(|s| s == WalLockState::Recover),
            WalLockState::Write | WalLockState::Checkpoint => others.any(|s| {
                matches!(
                    s,
                    WalLockState::Write | WalLockState::Checkpoint | WalLockState::Recover
                )
            }),
            WalLockState::Recover => others.any(|s| s != WalLockState::Unlock),
        }
    }

    fn checkpoint_active(&self, me: ShmConnectionId) -> bool {
        self.holders
            .iter()
            .any(|(&id, &s)| id != me && s == WalLockState::Checkpoint)
    }
}

/// Shared per-WAL state: the index region plus the lock arbiter.
///
/// This is the in-process realization of the shared-region provider
/// contract (`get`/`resize`/`release`/`lock`); a cross-process embedding
/// would back the same surface with a mapped file and OS byte-range locks.
#[derive(Debug, Default)]
pub struct ShmHandle {
    region: ShmRegion,
    locks: Mutex<LockTable>,
}

impl ShmHandle {
    /// The shared wal-index region.
    #[must_use]
    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    /// Register a new connection and return its id.
    pub fn register(&self) -> ShmConnectionId {
        let mut table = self.locks.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.holders.insert(id, WalLockState::Unlock);
        id
    }

    /// Remove a connection, dropping whatever lock it held.
    pub fn deregister(&self, conn: ShmConnectionId) {
        self.locks.lock().holders.remove(&conn);
    }

    /// Number of currently registered connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.locks.lock().holders.len()
    }

    /// Request a transition of connection `conn` to `desired`.
    ///
    /// On success the previous state is released and the new one recorded
    /// atomically. Returns the read variant for `Read` grants (`Partial`
    /// while a checkpointer is active, `Full` otherwise); other grants
    /// report `Full`.
    ///
    /// Fails with `Busy` when the requested state conflicts with another
    /// holder; the caller's previous state is left untouched.
    pub fn lock(&self, conn: ShmConnectionId, desired: WalLockState) -> Result<ReadLockVariant> {
        let mut table = self.locks.lock();
        if !table.holders.contains_key(&conn) {
            return Err(FerroError::LockFailed {
                detail: format!("connection {conn} is not registered"),
            });
        }
        if table.conflicts(conn, desired) {
            return Err(FerroError::Busy);
        }
        let variant = if desired == WalLockState::Read && table.checkpoint_active(conn) {
            ReadLockVariant::Partial
        } else {
            ReadLockVariant::Full
        };
        table.holders.insert(conn, desired);
        Ok(variant)
    }
}

/// Registry of shared wal-index handles, keyed by canonical WAL path.
///
/// Holds weak references: a handle lives exactly as long as some connection
/// holds its `Arc`, so the wal-index disappears when the last connection
/// closes, and the next open starts from an empty region (which fails the
/// header checksum and routes through recovery).
#[derive(Debug, Default)]
pub struct ShmDirectory {
    entries: Mutex<HashMap<PathBuf, Weak<ShmHandle>>>,
}

impl ShmDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the shared handle for `path`.
    ///
    /// `path` must already be canonical (`Vfs::full_pathname`).
    pub fn acquire(&self, path: &Path) -> Arc<ShmHandle> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(path).and_then(Weak::upgrade) {
            return existing;
        }
        let handle = Arc::new(ShmHandle::default());
        entries.insert(path.to_path_buf(), Arc::downgrade(&handle));
        // Opportunistically drop entries whose last connection has closed.
        entries.retain(|_, weak| weak.strong_count() > 0);
        handle
    }

    /// Number of live (still-connected) entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
