//! The wal-index: a shared, append-only map from frame numbers to page
//! numbers, with an embedded sorted index per 256-frame block.
//!
//! Region layout, in native-order 32-bit words:
//!
//! ```text
//! word 0..6    header: changeCounter, pageSize, lastFrame, pageCount,
//!              running checksum s1, s2
//! word 6..8    header self-checksum (seeded {1,1})
//! word 8..10   reserved for lock bytes; never read or written as data
//! word 10..    alternating groups:
//!              256 words of page numbers (one per frame), then
//!              64 words (256 bytes) of sorted index over that group
//! ```
//!
//! The index block for a group is a permutation of `0..=255` ordering the
//! group's entries by page number; equal pages sort smaller-frame-first.
//! Only complete groups carry an index; the partial tail group is scanned
//! linearly by readers and sorted on the fly by the checkpoint iterator.
//!
//! The header self-checksum is what lets readers load the header without a
//! lock: a torn or concurrently-updated read fails validation and the
//! reader retries under an exclusive lock (and rebuilds via recovery if it
//! still fails).

use ferro_error::Result;
use ferro_vfs::ShmRegion;

use crate::frame::WalChecksum;

/// Words in the wal-index header proper.
const HDR_CONTENT_WORDS: usize = 6;

/// Words reserved ahead of the first frame entry: header, header checksum,
/// and a lock region kept clear of data for mandatory-file-lock hosts.
pub(crate) const PREFIX_WORDS: usize = HDR_CONTENT_WORDS + 2 + 2;

/// Frames per indexed group.
pub(crate) const FRAMES_PER_BLOCK: u32 = 256;

/// Words occupied by one sorted index block (256 bytes).
const INDEX_BLOCK_WORDS: usize = 64;

/// Keep this many words of headroom past the next entry before growing.
///
/// The margin covers the 64-word index block that append writes when it
/// completes a group, plus the entries that follow it.
const GROWTH_MARGIN_WORDS: usize = 128;

/// The authoritative commit state of the WAL, stored at the front of the
/// wal-index region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalIndexHdr {
    /// Counter incremented on each committed transaction.
    pub change_counter: u32,
    /// Database page size in bytes (0 until the first commit is recovered
    /// or written).
    pub page_size: u32,
    /// Address of the most recent valid frame; 0 means the log is empty.
    pub last_frame: u32,
    /// Logical database size in pages as of `last_frame`.
    pub page_count: u32,
    /// Running checksum state as of `last_frame`.
    pub frame_checksum: WalChecksum,
}

impl Default for WalIndexHdr {
    fn default() -> Self {
        Self {
            change_counter: 0,
            page_size: 0,
            last_frame: 0,
            page_count: 0,
            frame_checksum: WalChecksum::EMPTY,
        }
    }
}

impl WalIndexHdr {
    fn content_words(&self) -> [u32; HDR_CONTENT_WORDS] {
        [
            self.change_counter,
            self.page_size,
            self.last_frame,
            self.page_count,
            self.frame_checksum.s1,
            self.frame_checksum.s2,
        ]
    }

    fn from_content_words(words: [u32; HDR_CONTENT_WORDS]) -> Self {
        Self {
            change_counter: words[0],
            page_size: words[1],
            last_frame: words[2],
            page_count: words[3],
            frame_checksum: WalChecksum::from_words(words[4], words[5]),
        }
    }

    fn self_checksum(words: [u32; HDR_CONTENT_WORDS]) -> WalChecksum {
        let mut bytes = [0u8; HDR_CONTENT_WORDS * 4];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
        }
        WalChecksum::HEADER_SEED.advance(&bytes)
    }
}

/// Word index of the entry for `frame` (1-based).
pub(crate) fn entry_offset(frame: u32) -> usize {
    debug_assert!(frame >= 1);
    let group = ((frame - 1) / FRAMES_PER_BLOCK) as usize;
    PREFIX_WORDS + group * INDEX_BLOCK_WORDS + (frame as usize - 1)
}

/// Word index of the sorted index block for 0-based `block`.
pub(crate) fn index_block_offset(block: u32) -> usize {
    entry_offset(block * FRAMES_PER_BLOCK + 1) + FRAMES_PER_BLOCK as usize
}

/// Page number recorded for `frame`.
pub(crate) fn page_at(region: &ShmRegion, frame: u32) -> u32 {
    region.read_word(entry_offset(frame))
}

/// Record that `frame` holds page `page`, growing the region as needed and
/// building the sorted index when `frame` completes a 256-frame group.
pub(crate) fn append(region: &ShmRegion, frame: u32, page: u32) -> Result<()> {
    let slot = entry_offset(frame);
    region.grow_to((slot + GROWTH_MARGIN_WORDS) * 4)?;
    region.write_word(slot, page);

    if frame % FRAMES_PER_BLOCK == 0 {
        build_block_index(region, frame / FRAMES_PER_BLOCK - 1);
    }
    Ok(())
}

fn build_block_index(region: &ShmRegion, block: u32) {
    let base = entry_offset(block * FRAMES_PER_BLOCK + 1);
    let mut entries = [0u32; FRAMES_PER_BLOCK as usize];
    region.read_words(base, &mut entries);

    let mut index = [0u8; FRAMES_PER_BLOCK as usize];
    for (i, slot) in index.iter_mut().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        {
            *slot = i as u8;
        }
    }
    let mut scratch = [0u8; FRAMES_PER_BLOCK as usize];
    merge_sort_indices(&mut index, &mut scratch, |i| entries[usize::from(i)]);

    region.write_bytes(index_block_offset(block) * 4, &index);
}

/// Stable, iterative merge sort of `list` by `key`, bounded to 256
/// elements, using caller-owned scratch space.
///
/// `list` arrives in ascending frame order, so equal keys come out
/// smaller-frame-first: the newest duplicate of a page is always the
/// rightmost.
pub(crate) fn merge_sort_indices(list: &mut [u8], scratch: &mut [u8], key: impl Fn(u8) -> u32) {
    let n = list.len();
    debug_assert!(n <= 256);
    debug_assert!(scratch.len() >= n);

    let mut width = 1;
    while width < n {
        let mut start = 0;
        while start < n {
            let mid = (start + width).min(n);
            let end = (start + 2 * width).min(n);
            let (mut i, mut j, mut k) = (start, mid, start);
            while i < mid && j < end {
                if key(list[i]) <= key(list[j]) {
                    scratch[k] = list[i];
                    i += 1;
                } else {
                    scratch[k] = list[j];
                    j += 1;
                }
                k += 1;
            }
            while i < mid {
                scratch[k] = list[i];
                i += 1;
                k += 1;
            }
            while j < end {
                scratch[k] = list[j];
                j += 1;
                k += 1;
            }
            start = end;
        }
        list[..n].copy_from_slice(&scratch[..n]);
        width *= 2;
    }
}

/// Find the newest frame `<= last_frame` containing `page`.
///
/// Scans the unindexed tail newest-to-oldest, then binary-searches each
/// complete block newest-block-first. Entries past `last_frame` (stale
/// appends from an abandoned transaction, or a concurrent writer past this
/// reader's snapshot) are structurally invisible: the tail scan starts at
/// `last_frame` and only blocks fully below it are consulted.
pub(crate) fn frame_for_page(region: &ShmRegion, last_frame: u32, page: u32) -> Option<u32> {
    if last_frame == 0 {
        return None;
    }

    let tail_len = last_frame % FRAMES_PER_BLOCK;
    let indexed_end = last_frame - tail_len;

    let mut frame = last_frame;
    while frame > indexed_end {
        if page_at(region, frame) == page {
            return Some(frame);
        }
        frame -= 1;
    }

    let mut block = indexed_end / FRAMES_PER_BLOCK;
    while block > 0 {
        block -= 1;
        if let Some(hit) = search_block(region, block, page) {
            return Some(hit);
        }
    }
    None
}

/// Binary search one complete block's sorted index for `page`.
///
/// Duplicates sort smaller-frame-first, so the rightmost match is the
/// newest version within the block.
fn search_block(region: &ShmRegion, block: u32, page: u32) -> Option<u32> {
    let first_frame = block * FRAMES_PER_BLOCK + 1;
    let base = entry_offset(first_frame);

    let mut entries = [0u32; FRAMES_PER_BLOCK as usize];
    region.read_words(base, &mut entries);
    let mut index = [0u8; FRAMES_PER_BLOCK as usize];
    region.read_bytes(index_block_offset(block) * 4, &mut index);

    let mut lo: i32 = 0;
    let mut hi: i32 = FRAMES_PER_BLOCK as i32 - 1;
    let mut found: Option<u8> = None;
    while lo <= hi {
        let mid = (lo + hi) / 2;
        #[allow(clippy::cast_sign_loss)]
        let slot = index[mid as usize];
        let key = entries[usize::from(slot)];
        if key == page {
            found = Some(slot);
            lo = mid + 1;
        } else if key < page {
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    found.map(|slot| first_frame + u32::from(slot))
}

/// Try to read and validate the shared header without any lock.
///
/// Returns `None` when the region is too small (never initialized) or the
/// self-checksum does not match (torn read, or garbage after a crash) --
/// the caller then retries under an exclusive lock and finally runs
/// recovery.
pub(crate) fn try_read_header(region: &ShmRegion) -> Option<WalIndexHdr> {
    if region.len_bytes() < PREFIX_WORDS * 4 {
        return None;
    }
    let mut words = [0u32; HDR_CONTENT_WORDS + 2];
    region.read_words(0, &mut words);

    let content: [u32; HDR_CONTENT_WORDS] = words[..HDR_CONTENT_WORDS]
        .try_into()
        .expect("slice is exactly HDR_CONTENT_WORDS");
    let checksum = WalIndexHdr::self_checksum(content);
    if checksum.s1 != words[HDR_CONTENT_WORDS] || checksum.s2 != words[HDR_CONTENT_WORDS + 1] {
        return None;
    }
    Some(WalIndexHdr::from_content_words(content))
}

/// Publish `hdr` to the shared region, recomputing its self-checksum.
///
/// This is the commit point: a reader that validates the header afterwards
/// sees every index entry the writer stored before publishing.
pub(crate) fn write_header(region: &ShmRegion, hdr: &WalIndexHdr) -> Result<()> {
    region.grow_to(PREFIX_WORDS * 4)?;
    let content = hdr.content_words();
    let checksum = WalIndexHdr::self_checksum(content);
    let mut words = [0u32; HDR_CONTENT_WORDS + 2];
    words[..HDR_CONTENT_WORDS].copy_from_slice(&content);
    words[HDR_CONTENT_WORDS] = checksum.s1;
    words[HDR_CONTENT_WORDS + 1] = checksum.s2;
    region.write_words(0, &words);
    Ok(())
}
