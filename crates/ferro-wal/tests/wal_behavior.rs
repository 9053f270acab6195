//! End-to-end WAL behavior across multiple connections.

use std::path::Path;

use ferro_error::FerroError;
use ferro_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use ferro_types::{PageNumber, PageSize};
use ferro_vfs::{MemoryVfs, ShmDirectory, Vfs, VfsFile};
use ferro_wal::{DirtyPage, Wal};

const DB: &str = "test.db";
const WAL: &str = "test.db-wal";
const PS: PageSize = PageSize::DEFAULT;

fn pgno(n: u32) -> PageNumber {
    PageNumber::new(n).expect("nonzero page number")
}

fn payload(fill: u8) -> Vec<u8> {
    vec![fill; PS.as_usize()]
}

fn open_conn(vfs: &MemoryVfs, dir: &ShmDirectory) -> Wal<MemoryVfs> {
    Wal::open(vfs.clone(), Path::new(DB), dir).expect("open wal")
}

fn open_db_file(vfs: &MemoryVfs) -> ferro_vfs::MemoryFile {
    let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    vfs.open(Path::new(DB), flags).expect("open db file").0
}

/// Run one committed write transaction through the full lock protocol.
fn commit_tx(
    wal: &mut Wal<MemoryVfs>,
    pages: &[(u32, Vec<u8>)],
    db_pages: u32,
    sync_flags: SyncFlags,
) {
    wal.open_snapshot().expect("open snapshot");
    wal.write_lock(true).expect("acquire write lock");
    let dirty: Vec<DirtyPage<'_>> = pages
        .iter()
        .map(|(n, data)| DirtyPage {
            page: pgno(*n),
            data,
        })
        .collect();
    wal.frames(PS, &dirty, db_pages, true, sync_flags)
        .expect("append frames");
    wal.write_lock(false).expect("release write lock");
    wal.close_snapshot();
}

#[test]
fn concrete_commit_scenario() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    commit_tx(&mut wal, &[(3, payload(0x41))], 5, SyncFlags::empty());

    wal.open_snapshot().unwrap();
    assert_eq!(wal.db_size(), 5);

    let page3 = wal.read(pgno(3)).unwrap().expect("page 3 is in the wal");
    assert_eq!(page3.len(), 4096);
    assert!(page3.as_bytes().iter().all(|&b| b == 0x41));

    assert!(wal.read(pgno(4)).unwrap().is_none(), "page 4 never written");
    wal.close_snapshot();
}

#[test]
fn latest_version_wins() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    commit_tx(&mut wal, &[(7, payload(0x01))], 10, SyncFlags::empty());
    commit_tx(&mut wal, &[(7, payload(0x02))], 10, SyncFlags::empty());

    wal.open_snapshot().unwrap();
    let page = wal.read(pgno(7)).unwrap().expect("page in wal");
    assert!(page.as_bytes().iter().all(|&b| b == 0x02));
    wal.close_snapshot();
}

#[test]
fn latest_version_wins_within_one_transaction() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    commit_tx(
        &mut wal,
        &[(2, payload(0xAA)), (2, payload(0xBB))],
        4,
        SyncFlags::empty(),
    );

    wal.open_snapshot().unwrap();
    let page = wal.read(pgno(2)).unwrap().expect("page in wal");
    assert!(page.as_bytes().iter().all(|&b| b == 0xBB));
    wal.close_snapshot();
}

#[test]
fn snapshot_isolation_across_connections() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut writer = open_conn(&vfs, &dir);
    let mut reader = open_conn(&vfs, &dir);

    commit_tx(&mut writer, &[(1, payload(0x10))], 1, SyncFlags::empty());

    reader.open_snapshot().unwrap();
    let before = reader.read(pgno(1)).unwrap().expect("page in wal");
    assert!(before.as_bytes().iter().all(|&b| b == 0x10));
    assert_eq!(reader.db_size(), 1);

    // Another connection commits while the reader's snapshot is open.
    commit_tx(&mut writer, &[(1, payload(0x20)), (2, payload(0x22))], 2, SyncFlags::empty());

    // The reader still sees its snapshot.
    let during = reader.read(pgno(1)).unwrap().expect("page in wal");
    assert!(during.as_bytes().iter().all(|&b| b == 0x10));
    assert_eq!(reader.db_size(), 1);
    assert!(reader.read(pgno(2)).unwrap().is_none());

    // A fresh snapshot observes the new commit.
    reader.close_snapshot();
    let changed = reader.open_snapshot().unwrap();
    assert!(changed, "snapshot must report the database changed");
    let after = reader.read(pgno(1)).unwrap().expect("page in wal");
    assert!(after.as_bytes().iter().all(|&b| b == 0x20));
    assert_eq!(reader.db_size(), 2);
    reader.close_snapshot();
}

#[test]
fn writers_are_mutually_exclusive() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut a = open_conn(&vfs, &dir);
    let mut b = open_conn(&vfs, &dir);

    a.open_snapshot().unwrap();
    b.open_snapshot().unwrap();
    a.write_lock(true).unwrap();

    assert!(matches!(b.write_lock(true), Err(FerroError::Busy)));

    a.write_lock(false).unwrap();
    b.write_lock(true).unwrap();
    b.write_lock(false).unwrap();
}

#[test]
fn stale_snapshot_writer_gets_busy() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut a = open_conn(&vfs, &dir);
    let mut b = open_conn(&vfs, &dir);

    a.open_snapshot().unwrap();
    // b commits after a's snapshot was taken.
    commit_tx(&mut b, &[(1, payload(0x33))], 1, SyncFlags::empty());

    // First-committer-wins: a's snapshot is stale, so it may not write.
    assert!(matches!(a.write_lock(true), Err(FerroError::Busy)));

    // After refreshing the snapshot the write lock is granted.
    a.close_snapshot();
    a.open_snapshot().unwrap();
    a.write_lock(true).unwrap();
    a.write_lock(false).unwrap();
    a.close_snapshot();
}

#[test]
fn checkpoint_copies_newest_versions_and_resets_log() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);
    let mut db_file = open_db_file(&vfs);

    commit_tx(&mut wal, &[(1, payload(0x11)), (3, payload(0x13))], 3, SyncFlags::empty());
    commit_tx(&mut wal, &[(1, payload(0x21)), (2, payload(0x22))], 3, SyncFlags::empty());

    let mut scratch = vec![0u8; PS.as_usize()];
    wal.checkpoint(&mut db_file, SyncFlags::NORMAL, &mut scratch, &mut || false)
        .expect("checkpoint");

    // The database file holds the newest version of every page.
    assert_eq!(db_file.file_size().unwrap(), 3 * 4096);
    let mut buf = vec![0u8; PS.as_usize()];
    db_file.read(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0x21), "page 1 must be the newest version");
    db_file.read(&mut buf, 4096).unwrap();
    assert!(buf.iter().all(|&b| b == 0x22));
    db_file.read(&mut buf, 2 * 4096).unwrap();
    assert!(buf.iter().all(|&b| b == 0x13));

    // A fresh snapshot perceives the wal as empty and falls through to the
    // database file for every page.
    wal.open_snapshot().unwrap();
    assert!(wal.read(pgno(1)).unwrap().is_none());
    assert!(wal.read(pgno(2)).unwrap().is_none());
    assert!(wal.read(pgno(3)).unwrap().is_none());
    wal.close_snapshot();
}

#[test]
fn checkpoint_on_empty_log_is_a_noop() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);
    let mut db_file = open_db_file(&vfs);

    let mut scratch = vec![0u8; PS.as_usize()];
    wal.checkpoint(&mut db_file, SyncFlags::empty(), &mut scratch, &mut || false)
        .expect("empty checkpoint");
    assert_eq!(db_file.file_size().unwrap(), 0);
}

#[test]
fn recovery_rebuilds_committed_state_after_crash() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        commit_tx(&mut wal, &[(1, payload(0x51)), (2, payload(0x52))], 2, SyncFlags::empty());
        // Crash: the connection is dropped without close(); the shared
        // wal-index dies with it, the WAL file survives.
    }
    assert!(vfs.access(Path::new(WAL), AccessFlags::EXISTS).unwrap());

    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().expect("snapshot triggers recovery");
    assert_eq!(wal.db_size(), 2);
    let p1 = wal.read(pgno(1)).unwrap().expect("recovered page 1");
    assert!(p1.as_bytes().iter().all(|&b| b == 0x51));
    let p2 = wal.read(pgno(2)).unwrap().expect("recovered page 2");
    assert!(p2.as_bytes().iter().all(|&b| b == 0x52));
    wal.close_snapshot();
}

#[test]
fn recovery_ignores_uncommitted_tail_frames() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        commit_tx(&mut wal, &[(1, payload(0x61))], 1, SyncFlags::empty());

        // Start a second transaction but crash before committing.
        wal.open_snapshot().unwrap();
        wal.write_lock(true).unwrap();
        let data = payload(0x62);
        let dirty = [DirtyPage {
            page: pgno(1),
            data: &data,
        }];
        wal.frames(PS, &dirty, 0, false, SyncFlags::empty()).unwrap();
    }

    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().unwrap();
    // The uncommitted frame is physically in the file but logically
    // invisible: recovery stops the header at the last commit frame.
    let p1 = wal.read(pgno(1)).unwrap().expect("page 1");
    assert!(p1.as_bytes().iter().all(|&b| b == 0x61));
    assert_eq!(wal.db_size(), 1);
    wal.close_snapshot();
}

#[test]
fn recovery_stops_at_torn_frame() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        commit_tx(&mut wal, &[(1, payload(0x71))], 1, SyncFlags::empty());
        commit_tx(&mut wal, &[(2, payload(0x72))], 2, SyncFlags::empty());
    }

    // Corrupt the second frame's payload on disk.
    {
        let flags = VfsOpenFlags::WAL | VfsOpenFlags::READWRITE;
        let (mut wal_file, _) = vfs.open(Path::new(WAL), flags).unwrap();
        let frame2_payload = 12 + (4096 + 16) + 16;
        wal_file.write(&[0xFF; 8], frame2_payload as u64).unwrap();
    }

    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().unwrap();
    // Replay validates frame 1, rejects frame 2, and lands on commit 1.
    assert_eq!(wal.db_size(), 1);
    let p1 = wal.read(pgno(1)).unwrap().expect("page 1 survives");
    assert!(p1.as_bytes().iter().all(|&b| b == 0x71));
    assert!(wal.read(pgno(2)).unwrap().is_none());
    wal.close_snapshot();
}

#[test]
fn recovery_is_idempotent() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        commit_tx(&mut wal, &[(1, payload(0x81)), (4, payload(0x84))], 4, SyncFlags::empty());
    }

    let observe = |vfs: &MemoryVfs, dir: &ShmDirectory| {
        let mut wal = open_conn(vfs, dir);
        wal.open_snapshot().unwrap();
        let size = wal.db_size();
        let p4 = wal.read(pgno(4)).unwrap().map(|p| p.into_vec());
        wal.close_snapshot();
        (size, p4)
    };

    // Each call runs recovery from scratch (the index died with the
    // previous connection); both must reconstruct the same state.
    let first = observe(&vfs, &dir);
    let second = observe(&vfs, &dir);
    assert_eq!(first, second);
    assert_eq!(first.0, 4);
}

#[test]
fn stale_generation_frames_do_not_revalidate() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut db_file = open_db_file(&vfs);

    {
        let mut wal = open_conn(&vfs, &dir);
        // A long transaction, then a checkpoint, then a shorter one: old
        // generation frames remain physically beyond the new generation's
        // last frame.
        commit_tx(&mut wal, &[(1, payload(0x91)), (2, payload(0x92))], 2, SyncFlags::empty());
        let mut scratch = vec![0u8; PS.as_usize()];
        wal.checkpoint(&mut db_file, SyncFlags::empty(), &mut scratch, &mut || false)
            .unwrap();
        commit_tx(&mut wal, &[(1, payload(0xA1))], 2, SyncFlags::empty());
    }

    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().unwrap();
    // Only the new generation's single commit replays; the leftover frame
    // for page 2 fails its checksum against the fresh salts.
    let p1 = wal.read(pgno(1)).unwrap().expect("new generation page");
    assert!(p1.as_bytes().iter().all(|&b| b == 0xA1));
    assert!(wal.read(pgno(2)).unwrap().is_none());
    wal.close_snapshot();
}

#[test]
fn synced_commit_survives_crash() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        // Durability barrier: the commit frame is padded to the sector
        // boundary and fsynced.
        commit_tx(&mut wal, &[(5, payload(0xC5))], 5, SyncFlags::NORMAL);
    }

    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().unwrap();
    assert_eq!(wal.db_size(), 5);
    let p5 = wal.read(pgno(5)).unwrap().expect("synced page");
    assert!(p5.as_bytes().iter().all(|&b| b == 0xC5));
    wal.close_snapshot();
}

#[test]
fn undo_reports_and_discards_uncommitted_frames() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    commit_tx(&mut wal, &[(1, payload(0x01))], 1, SyncFlags::empty());

    wal.open_snapshot().unwrap();
    wal.write_lock(true).unwrap();
    let d2 = payload(0xD2);
    let d3 = payload(0xD3);
    let dirty = [
        DirtyPage {
            page: pgno(2),
            data: &d2,
        },
        DirtyPage {
            page: pgno(3),
            data: &d3,
        },
    ];
    wal.frames(PS, &dirty, 0, false, SyncFlags::empty()).unwrap();

    let mut reverted = Vec::new();
    wal.undo(|page| {
        reverted.push(page.get());
        Ok(())
    })
    .unwrap();
    assert_eq!(reverted, vec![2, 3]);

    wal.write_lock(false).unwrap();
    assert!(wal.read(pgno(2)).unwrap().is_none());
    assert!(wal.read(pgno(3)).unwrap().is_none());
    assert_eq!(wal.db_size(), 1);
    wal.close_snapshot();
}

#[test]
fn savepoint_rollback_keeps_the_chain_valid() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();

    {
        let mut wal = open_conn(&vfs, &dir);
        wal.open_snapshot().unwrap();
        wal.write_lock(true).unwrap();

        let keep = payload(0xE1);
        let dirty = [DirtyPage {
            page: pgno(1),
            data: &keep,
        }];
        wal.frames(PS, &dirty, 0, false, SyncFlags::empty()).unwrap();

        let mark = wal.savepoint();

        let discard = payload(0xE9);
        let dirty = [DirtyPage {
            page: pgno(2),
            data: &discard,
        }];
        wal.frames(PS, &dirty, 0, false, SyncFlags::empty()).unwrap();
        wal.savepoint_undo(mark).unwrap();

        // The rolled-back page is gone immediately.
        assert!(wal.read(pgno(2)).unwrap().is_none());

        // Committing after the rewind must continue the checksum chain
        // from frame `mark`, overwriting the discarded frame in place.
        let commit = payload(0xE2);
        let dirty = [DirtyPage {
            page: pgno(2),
            data: &commit,
        }];
        wal.frames(PS, &dirty, 2, true, SyncFlags::empty()).unwrap();
        wal.write_lock(false).unwrap();
        wal.close_snapshot();
    }

    // Crash-recover: if the chain had been broken at the rewind point,
    // replay would stop before the commit frame.
    let mut wal = open_conn(&vfs, &dir);
    wal.open_snapshot().unwrap();
    assert_eq!(wal.db_size(), 2);
    let p1 = wal.read(pgno(1)).unwrap().expect("page 1");
    assert!(p1.as_bytes().iter().all(|&b| b == 0xE1));
    let p2 = wal.read(pgno(2)).unwrap().expect("page 2");
    assert!(p2.as_bytes().iter().all(|&b| b == 0xE2));
    wal.close_snapshot();
}

#[test]
fn callback_value_drains_once() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    assert_eq!(wal.callback_value(), 0);
    commit_tx(&mut wal, &[(1, payload(0x0F))], 1, SyncFlags::empty());
    assert_eq!(wal.callback_value(), 1, "one frame committed");
    assert_eq!(wal.callback_value(), 0, "drained");
}

#[test]
fn closing_the_last_connection_checkpoints_and_unlinks() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);
    let mut db_file = open_db_file(&vfs);

    commit_tx(&mut wal, &[(1, payload(0x77))], 1, SyncFlags::empty());

    let mut scratch = vec![0u8; PS.as_usize()];
    wal.close(&mut db_file, SyncFlags::NORMAL, &mut scratch)
        .expect("close");

    assert!(
        !vfs.access(Path::new(WAL), AccessFlags::EXISTS).unwrap(),
        "wal file must be unlinked by the last close"
    );
    let mut buf = vec![0u8; PS.as_usize()];
    db_file.read(&mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 0x77));
}

#[test]
fn closing_with_other_connections_leaves_the_wal() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut a = open_conn(&vfs, &dir);
    let _b = open_conn(&vfs, &dir);
    let mut db_file = open_db_file(&vfs);

    commit_tx(&mut a, &[(1, payload(0x88))], 1, SyncFlags::empty());

    let mut scratch = vec![0u8; PS.as_usize()];
    a.close(&mut db_file, SyncFlags::empty(), &mut scratch)
        .expect("close");

    assert!(
        vfs.access(Path::new(WAL), AccessFlags::EXISTS).unwrap(),
        "wal must survive while another connection is open"
    );
}

#[test]
fn many_pages_cross_index_block_boundary() {
    let vfs = MemoryVfs::new();
    let dir = ShmDirectory::new();
    let mut wal = open_conn(&vfs, &dir);

    // 300 single-page commits push the index past the first 256-frame
    // block, exercising the sorted-index read path.
    for i in 1..=300_u32 {
        #[allow(clippy::cast_possible_truncation)]
        let fill = (i % 251) as u8;
        commit_tx(&mut wal, &[(i, vec![fill; PS.as_usize()])], 300, SyncFlags::empty());
    }

    wal.open_snapshot().unwrap();
    assert_eq!(wal.db_size(), 300);
    for &probe in &[1_u32, 100, 256, 257, 300] {
        let page = wal.read(pgno(probe)).unwrap().expect("page present");
        assert!(
            page.as_bytes().iter().all(|&b| b == (probe % 251) as u8),
            "page {probe} content mismatch"
        );
    }
    assert!(wal.read(pgno(301)).unwrap().is_none());
    wal.close_snapshot();
}
