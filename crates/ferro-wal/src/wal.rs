//! The WAL connection: snapshots, page reads, frame appends, rollback,
//! checkpointing, and crash recovery.
//!
//! Each database connection owns one `Wal`. Concurrency comes entirely
//! from multiple independent connections (each invoked by its own caller)
//! sharing the WAL file and the wal-index region; this module itself is
//! synchronous and never blocks internally. The only retry loop is the
//! caller-driven busy-handler on [`Wal::checkpoint`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferro_error::{FerroError, Result};
use ferro_types::flags::{SyncFlags, VfsOpenFlags};
use ferro_types::{PageData, PageNumber, PageSize, ReadLockVariant, WalLockState};
use ferro_vfs::{ShmDirectory, ShmHandle, Vfs, VfsFile};
use tracing::{debug, info, warn};

use crate::frame::{
    WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WalChecksum, WalFileHeader, WalSalts, decode_frame,
    encode_frame, frame_offset, read_be_u32_at,
};
use crate::index::{self, WalIndexHdr};
use crate::iterator::WalIterator;
use crate::lock::LockManager;

/// One dirty page queued for [`Wal::frames`].
#[derive(Debug, Clone, Copy)]
pub struct DirtyPage<'a> {
    pub page: PageNumber,
    pub data: &'a [u8],
}

/// Opaque marker returned by [`Wal::savepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointMark(u32);

/// Tunable limits consumed by recovery.
#[derive(Debug, Clone, Copy)]
pub struct WalLimits {
    /// Largest page size recovery will accept from a WAL header.
    pub max_page_size: u32,
}

impl Default for WalLimits {
    fn default() -> Self {
        Self {
            max_page_size: PageSize::MAX.get(),
        }
    }
}

/// A connection to the write-ahead log of one database file.
pub struct Wal<V: Vfs> {
    vfs: V,
    wal_file: V::File,
    wal_path: PathBuf,
    shm: Arc<ShmHandle>,
    lock: LockManager,
    /// Private wal-index header snapshot; fixed between `open_snapshot`
    /// and `close_snapshot`, advanced locally while writing.
    hdr: WalIndexHdr,
    /// Salts of the current WAL generation.
    salts: WalSalts,
    /// Xorshift state for generating the next generation's salts.
    rng: u64,
    /// Frame high-water mark of the last commit, drained by
    /// [`Wal::callback_value`].
    callback_frames: u32,
    limits: WalLimits,
}

impl<V: Vfs> Wal<V> {
    /// Open (creating if necessary) the WAL for the database at `db_path`.
    ///
    /// The caller is expected to hold a shared lock on the database file
    /// itself so the WAL cannot be unlinked underneath it. `directory`
    /// hands out the shared wal-index; all connections to one database
    /// must use the same directory instance.
    pub fn open(vfs: V, db_path: &Path, directory: &ShmDirectory) -> Result<Self> {
        let wal_path = wal_path_for(db_path);
        let canonical = vfs.full_pathname(&wal_path)?;
        let (wal_file, _) = vfs.open(
            &wal_path,
            VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
        )?;
        let shm = directory.acquire(&canonical);
        let lock = LockManager::new(Arc::clone(&shm));

        let mut seed = [0u8; 8];
        vfs.randomness(&mut seed);

        Ok(Self {
            vfs,
            wal_file,
            wal_path,
            shm,
            lock,
            hdr: WalIndexHdr::default(),
            salts: WalSalts::default(),
            // Force the seed odd so the xorshift stream never hits zero.
            rng: u64::from_le_bytes(seed) | 1,
            callback_frames: 0,
            limits: WalLimits::default(),
        })
    }

    /// Override recovery limits.
    pub fn set_limits(&mut self, limits: WalLimits) {
        self.limits = limits;
    }

    /// Close this connection.
    ///
    /// If this is the sole connection to the WAL, the log is checkpointed
    /// into `db_file` and the WAL file is unlinked; a `Busy` checkpoint
    /// (another process raced in) downgrades to a plain close. `scratch`
    /// must be one page in size for the checkpoint copy.
    pub fn close(mut self, db_file: &mut V::File, sync_flags: SyncFlags, scratch: &mut [u8]) -> Result<()> {
        let sole = self.shm.connections() == 1;
        if sole {
            let mut no_retry = || false;
            match self.checkpoint(db_file, sync_flags, scratch, &mut no_retry) {
                Ok(()) => {
                    self.wal_file.close()?;
                    self.vfs.delete(&self.wal_path, false)?;
                    debug!(wal = %self.wal_path.display(), "wal checkpointed and unlinked on close");
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    debug!("close: checkpoint contended, leaving wal in place");
                }
                Err(e) => {
                    let _ = self.wal_file.close();
                    return Err(e);
                }
            }
        }
        self.wal_file.close()
    }

    /// Take a read snapshot: acquire the shared read lock and fix this
    /// connection's view of the log.
    ///
    /// Returns `true` if the database has changed since this connection's
    /// previous snapshot, which tells the page cache to drop stale pages.
    pub fn open_snapshot(&mut self) -> Result<bool> {
        self.lock.set(WalLockState::Read)?;
        match self.read_header() {
            Ok(changed) => Ok(changed),
            Err(e) => {
                self.close_snapshot();
                Err(e)
            }
        }
    }

    /// Release the read snapshot.
    pub fn close_snapshot(&mut self) {
        if self.lock.state() == WalLockState::Read {
            self.lock.unlock();
        }
    }

    /// Read the newest committed version of `page` from the log.
    ///
    /// `Ok(None)` means the log holds no version of this page and the
    /// caller should read the main database file instead; a genuine miss
    /// is never an error.
    pub fn read(&mut self, page: PageNumber) -> Result<Option<PageData>> {
        debug_assert!(matches!(
            self.lock.state(),
            WalLockState::Read | WalLockState::Write
        ));
        if self.hdr.last_frame == 0 {
            return Ok(None);
        }
        let Some(frame) = index::frame_for_page(self.shm.region(), self.hdr.last_frame, page.get())
        else {
            return Ok(None);
        };

        let page_size = PageSize::new(self.hdr.page_size).ok_or_else(|| {
            FerroError::corrupt(format!(
                "wal-index header carries invalid page size {}",
                self.hdr.page_size
            ))
        })?;
        let mut data = PageData::zeroed(page_size);
        let offset = frame_offset(frame, page_size.get()) + WAL_FRAME_HEADER_SIZE as u64;
        let n = self.wal_file.read(data.as_bytes_mut(), offset)?;
        if n < page_size.as_usize() {
            return Err(FerroError::ShortRead {
                expected: page_size.as_usize(),
                actual: n,
            });
        }
        Ok(Some(data))
    }

    /// Logical database size in pages, as of this connection's snapshot.
    #[must_use]
    pub fn db_size(&self) -> u32 {
        self.hdr.page_count
    }

    /// Acquire (`true`) or release (`false`) the writer lock.
    ///
    /// Acquisition re-checks the shared header against the snapshot taken
    /// at `open_snapshot` time: if another writer committed in between,
    /// the lock is released and `Busy` is returned (first-committer-wins).
    pub fn write_lock(&mut self, acquire: bool) -> Result<()> {
        if acquire {
            if self.lock.state() != WalLockState::Read {
                return Err(FerroError::internal(
                    "write lock requires an open read snapshot",
                ));
            }
            self.lock.set(WalLockState::Write)?;
            let fresh = index::try_read_header(self.shm.region());
            if fresh != Some(self.hdr) {
                self.lock.set(WalLockState::Read)?;
                return Err(FerroError::Busy);
            }
            Ok(())
        } else {
            if self.lock.state() == WalLockState::Write {
                self.lock.set(WalLockState::Read)?;
            }
            Ok(())
        }
    }

    /// Append frames for `pages` to the log.
    ///
    /// On `is_commit`, the final page's frame carries `truncate_size` (the
    /// new logical database size in pages), the frames are padded with
    /// copies of the commit frame to the next sector boundary when
    /// `sync_flags` requests durability, and the shared header is
    /// published — the commit point visible to new readers.
    pub fn frames(
        &mut self,
        page_size: PageSize,
        pages: &[DirtyPage<'_>],
        truncate_size: u32,
        is_commit: bool,
        sync_flags: SyncFlags,
    ) -> Result<()> {
        if self.lock.state() != WalLockState::Write {
            return Err(FerroError::internal("frames() requires the write lock"));
        }
        if pages.is_empty() {
            return Ok(());
        }
        let ps = page_size.get();
        for p in pages {
            if p.data.len() != page_size.as_usize() {
                return Err(FerroError::internal(format!(
                    "dirty page {} is {} bytes, page size is {ps}",
                    p.page,
                    p.data.len()
                )));
            }
        }
        if self.hdr.page_size != 0 && self.hdr.last_frame != 0 && self.hdr.page_size != ps {
            return Err(FerroError::internal(format!(
                "page size changed mid-log: {} -> {ps}",
                self.hdr.page_size
            )));
        }

        let mut frame = self.hdr.last_frame;
        let mut checksum = self.hdr.frame_checksum;

        if frame == 0 {
            // New generation: fresh salts make any frames left over from
            // before the last checkpoint undecodable.
            self.salts = self.next_salts();
            let file_hdr = WalFileHeader {
                page_size: ps,
                salts: self.salts,
            };
            self.wal_file.write(&file_hdr.to_bytes(), 0)?;
            checksum = self.salts.seed();
            debug!(page_size = ps, "starting new wal generation");
        }

        for (i, p) in pages.iter().enumerate() {
            let truncate = if is_commit && i + 1 == pages.len() {
                truncate_size
            } else {
                0
            };
            frame += 1;
            let offset = frame_offset(frame, ps);
            let (header, next) = encode_frame(checksum, p.page.get(), truncate, p.data);
            self.wal_file.write(&header, offset)?;
            self.wal_file
                .write(p.data, offset + WAL_FRAME_HEADER_SIZE as u64)?;
            checksum = next;
        }

        // A torn sector write must not be able to clip the commit frame:
        // fill the rest of the sector with copies of it, then fsync.
        let mut padded = 0u32;
        if is_commit && !sync_flags.is_empty() {
            let last = &pages[pages.len() - 1];
            let sector = u64::from(self.wal_file.sector_size().max(512));
            let boundary = frame_offset(frame + 1, ps).div_ceil(sector) * sector;
            while frame_offset(frame + 1, ps) < boundary {
                frame += 1;
                let offset = frame_offset(frame, ps);
                let (header, next) = encode_frame(checksum, last.page.get(), truncate_size, last.data);
                self.wal_file.write(&header, offset)?;
                self.wal_file
                    .write(last.data, offset + WAL_FRAME_HEADER_SIZE as u64)?;
                checksum = next;
                padded += 1;
            }
            self.wal_file.sync(sync_flags)?;
        }

        // Index the new frames. The write lock guarantees no other writer,
        // and nothing an existing reader can see is overwritten.
        let mut indexed = self.hdr.last_frame;
        for p in pages {
            indexed += 1;
            index::append(self.shm.region(), indexed, p.page.get())?;
        }
        let last = &pages[pages.len() - 1];
        for _ in 0..padded {
            indexed += 1;
            index::append(self.shm.region(), indexed, last.page.get())?;
        }
        debug_assert_eq!(indexed, frame);

        self.hdr.last_frame = frame;
        self.hdr.frame_checksum = checksum;
        self.hdr.page_size = ps;
        if is_commit {
            self.hdr.change_counter = self.hdr.change_counter.wrapping_add(1);
            self.hdr.page_count = truncate_size;
            index::write_header(self.shm.region(), &self.hdr)?;
            self.callback_frames = frame;
            debug!(last_frame = frame, db_pages = truncate_size, "commit published");
        }
        Ok(())
    }

    /// Roll back every frame written since the last commit.
    ///
    /// `callback` is invoked once per discarded frame with its page number
    /// so the page cache can revert in-memory copies. No-op unless the
    /// write lock is held.
    pub fn undo(&mut self, mut callback: impl FnMut(PageNumber) -> Result<()>) -> Result<()> {
        if self.lock.state() != WalLockState::Write {
            return Ok(());
        }
        let uncommitted_end = self.hdr.last_frame;
        self.read_header()?;
        if self.hdr.last_frame < uncommitted_end {
            debug!(
                discarded = uncommitted_end - self.hdr.last_frame,
                "discarding uncommitted frames"
            );
        }
        for frame in self.hdr.last_frame + 1..=uncommitted_end {
            let page = index::page_at(self.shm.region(), frame);
            let page = PageNumber::new(page)
                .ok_or_else(|| FerroError::internal("wal-index entry holds page zero"))?;
            callback(page)?;
        }
        Ok(())
    }

    /// Record the current (uncommitted) write position.
    #[must_use]
    pub fn savepoint(&self) -> SavepointMark {
        SavepointMark(self.hdr.last_frame)
    }

    /// Rewind the write position to `mark`.
    ///
    /// The checksum chain state is reloaded from the checksum words
    /// physically stored in frame `mark`, so subsequent appends continue
    /// the chain correctly.
    pub fn savepoint_undo(&mut self, mark: SavepointMark) -> Result<()> {
        if self.lock.state() != WalLockState::Write {
            return Err(FerroError::internal(
                "savepoint rollback requires the write lock",
            ));
        }
        if mark.0 > self.hdr.last_frame {
            return Err(FerroError::internal("savepoint mark is ahead of the log"));
        }
        if mark.0 == self.hdr.last_frame {
            return Ok(());
        }

        self.hdr.frame_checksum = if mark.0 == 0 {
            // The next append starts a new generation and reseeds from
            // fresh salts; the sentinel is never fed into a frame.
            WalChecksum::EMPTY
        } else {
            let mut header = [0u8; WAL_FRAME_HEADER_SIZE];
            let n = self.wal_file.read(&mut header, frame_offset(mark.0, self.hdr.page_size))?;
            if n < WAL_FRAME_HEADER_SIZE {
                return Err(FerroError::ShortRead {
                    expected: WAL_FRAME_HEADER_SIZE,
                    actual: n,
                });
            }
            WalChecksum::from_words(read_be_u32_at(&header, 8), read_be_u32_at(&header, 12))
        };
        self.hdr.last_frame = mark.0;
        Ok(())
    }

    /// Checkpoint the log into `db_file`.
    ///
    /// Copies the newest version of every WAL-resident page into the
    /// database file, truncates it to the committed page count, then
    /// resets the shared header so new readers perceive an empty log.
    /// `Busy` lock acquisition retries through `busy_handler` until it
    /// returns `false`. A failure before the header reset leaves the
    /// committed state untouched, so a failed checkpoint loses nothing and
    /// is safe to retry.
    pub fn checkpoint(
        &mut self,
        db_file: &mut V::File,
        sync_flags: SyncFlags,
        scratch: &mut [u8],
        busy_handler: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        // A connection may arrive here still holding its snapshot lock.
        self.lock.unlock();
        loop {
            match self.lock.set(WalLockState::Checkpoint) {
                Ok(()) => break,
                Err(FerroError::Busy) if busy_handler() => {}
                Err(e) => return Err(e),
            }
        }
        let result = self.checkpoint_locked(db_file, sync_flags, scratch);
        self.lock.unlock();
        result
    }

    fn checkpoint_locked(
        &mut self,
        db_file: &mut V::File,
        sync_flags: SyncFlags,
        scratch: &mut [u8],
    ) -> Result<()> {
        let changed = self.read_header()?;
        let outcome = self.copy_back(db_file, sync_flags, scratch);
        if changed {
            // The snapshot cached before this checkpoint is stale; zero it
            // so the next open_snapshot reloads from shared memory.
            self.hdr = WalIndexHdr::default();
        }
        outcome
    }

    fn copy_back(
        &mut self,
        db_file: &mut V::File,
        sync_flags: SyncFlags,
        scratch: &mut [u8],
    ) -> Result<()> {
        if self.hdr.last_frame == 0 {
            debug!("checkpoint: log already empty");
            return Ok(());
        }
        let page_size = self.hdr.page_size;
        if scratch.len() != page_size as usize {
            return Err(FerroError::corrupt(format!(
                "checkpoint buffer is {} bytes, page size is {page_size}",
                scratch.len()
            )));
        }

        // Write barrier: every frame must be durable before any of it is
        // copied over the database file.
        if !sync_flags.is_empty() {
            self.wal_file.sync(sync_flags)?;
        }

        let mut iter = WalIterator::new(self.shm.region(), self.hdr.last_frame)?;
        let mut pages_copied = 0u32;
        while let Some((page, frame)) = iter.next() {
            let offset = frame_offset(frame, page_size) + WAL_FRAME_HEADER_SIZE as u64;
            let n = self.wal_file.read(scratch, offset)?;
            if n < scratch.len() {
                return Err(FerroError::ShortRead {
                    expected: scratch.len(),
                    actual: n,
                });
            }
            db_file.write(scratch, u64::from(page - 1) * u64::from(page_size))?;
            pages_copied += 1;
        }

        db_file.truncate(u64::from(self.hdr.page_count) * u64::from(page_size))?;
        if !sync_flags.is_empty() {
            db_file.sync(sync_flags)?;
        }

        // From this instant new readers read entirely from the database.
        self.hdr.last_frame = 0;
        self.hdr.frame_checksum = WalChecksum::EMPTY;
        index::write_header(self.shm.region(), &self.hdr)?;
        info!(
            pages_copied,
            db_pages = self.hdr.page_count,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Frames written as of the last commit, for host notification hooks.
    ///
    /// Returns 0 if no commit happened since the last call.
    pub fn callback_value(&mut self) -> u32 {
        std::mem::take(&mut self.callback_frames)
    }

    /// Load the shared header into `self.hdr`, running recovery if it
    /// cannot be validated.
    ///
    /// The first attempt is lock-free and may race a concurrent header
    /// writer; only a failure that persists under an exclusive lock means
    /// the wal-index genuinely needs to be rebuilt.
    fn read_header(&mut self) -> Result<bool> {
        if let Some(changed) = self.try_apply_header() {
            return Ok(changed);
        }

        let prev = self.lock.state();
        if !prev.is_exclusive() {
            if self.lock.read_variant() == ReadLockVariant::Partial {
                // A checkpointer owns the index right now; recovery would
                // have to wait for it anyway.
                return Err(FerroError::Busy);
            }
            self.lock.set(WalLockState::Recover)?;
        }

        let result = match self.try_apply_header() {
            Some(_) => Ok(true),
            None => self.recover().map(|()| true),
        };

        if !prev.is_exclusive() {
            self.lock.set(WalLockState::Read)?;
        }
        result
    }

    fn try_apply_header(&mut self) -> Option<bool> {
        let fresh = index::try_read_header(self.shm.region())?;
        let changed = fresh != self.hdr;
        if changed {
            self.hdr = fresh;
        }
        Some(changed)
    }

    /// Rebuild the wal-index by replaying the WAL file.
    ///
    /// Requires an exclusive lock. An invalid file header means the WAL
    /// carries no usable data and the index is published empty; a frame
    /// that fails to decode is the expected end of a partially written
    /// log, not an error.
    fn recover(&mut self) -> Result<()> {
        debug_assert!(self.lock.state().is_exclusive());
        info!(wal = %self.wal_path.display(), "rebuilding wal-index from log file");

        let mut hdr = WalIndexHdr::default();
        let size = self.wal_file.file_size()?;
        let mut frames_scanned = 0u32;

        if size > WAL_HEADER_SIZE as u64 {
            let mut header_buf = [0u8; WAL_HEADER_SIZE];
            let n = self.wal_file.read(&mut header_buf, 0)?;
            if n < WAL_HEADER_SIZE {
                return Err(FerroError::ShortRead {
                    expected: WAL_HEADER_SIZE,
                    actual: n,
                });
            }
            let file_hdr = WalFileHeader::from_bytes(&header_buf)?;
            let ps = file_hdr.page_size;

            if ps.is_power_of_two() && (512..=self.limits.max_page_size).contains(&ps) {
                self.salts = file_hdr.salts;
                let frame_size = WAL_FRAME_HEADER_SIZE + ps as usize;
                let mut checksum = file_hdr.salts.seed();
                let mut buf = vec![0u8; frame_size];
                let mut frame = 0u32;
                let mut offset = WAL_HEADER_SIZE as u64;

                while offset + frame_size as u64 <= size {
                    let n = self.wal_file.read(&mut buf, offset)?;
                    if n < frame_size {
                        break;
                    }
                    let Some((page, truncate, next)) = decode_frame(
                        checksum,
                        &buf[..WAL_FRAME_HEADER_SIZE],
                        &buf[WAL_FRAME_HEADER_SIZE..],
                    ) else {
                        break;
                    };
                    frame += 1;
                    index::append(self.shm.region(), frame, page)?;
                    checksum = next;
                    if truncate != 0 {
                        hdr.last_frame = frame;
                        hdr.page_count = truncate;
                        hdr.page_size = ps;
                        hdr.frame_checksum = checksum;
                    }
                    offset += frame_size as u64;
                }
                frames_scanned = frame;
            } else {
                warn!(page_size = ps, "invalid wal header; treating log as empty");
            }
        }

        self.hdr = hdr;
        index::write_header(self.shm.region(), &self.hdr)?;
        info!(
            frames_scanned,
            last_frame = self.hdr.last_frame,
            page_count = self.hdr.page_count,
            "wal-index recovery complete"
        );
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn next_salts(&mut self) -> WalSalts {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        WalSalts {
            salt1: (x & 0xFFFF_FFFF) as u32,
            salt2: (x >> 32) as u32,
        }
    }
}

fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}
