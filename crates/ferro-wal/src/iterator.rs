//! K-way merge over wal-index blocks for checkpointing.
//!
//! Yields every page with at least one frame in the log exactly once, in
//! ascending page order, paired with its newest frame. Complete blocks use
//! their stored sorted index; the partial tail block is sorted on the fly
//! into iterator-owned scratch.
//!
//! Runs only while `Checkpoint` is held, so the snapshot copied at
//! construction cannot race an index writer.

use ferro_error::Result;
use ferro_vfs::ShmRegion;

use crate::index::{self, FRAMES_PER_BLOCK};

struct Segment {
    /// Frame number of entry 0, minus one.
    base: u32,
    /// Page number per frame slot, in frame order.
    pages: Vec<u32>,
    /// Permutation of `0..pages.len()` sorted by page, ties oldest-first.
    order: Vec<u8>,
    /// Next unconsumed position in `order`.
    next: usize,
}

impl Segment {
    /// Frame number of the entry at sorted position `pos`.
    fn frame(&self, pos: usize) -> u32 {
        self.base + 1 + u32::from(self.order[pos])
    }

    fn page(&self, pos: usize) -> u32 {
        self.pages[usize::from(self.order[pos])]
    }
}

/// Iterator over all WAL-resident pages in ascending page order.
pub(crate) struct WalIterator {
    segments: Vec<Segment>,
    prior: Option<u32>,
}

impl WalIterator {
    /// Snapshot the index for frames `1..=last_frame` and presort the tail.
    pub(crate) fn new(region: &ShmRegion, last_frame: u32) -> Result<Self> {
        let n_segments = (last_frame / FRAMES_PER_BLOCK) as usize + 1;
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(n_segments)
            .map_err(|_| ferro_error::FerroError::OutOfMemory)?;

        for seg in 0..n_segments {
            let base = seg as u32 * FRAMES_PER_BLOCK;
            let len = if seg == n_segments - 1 {
                (last_frame - base) as usize
            } else {
                FRAMES_PER_BLOCK as usize
            };
            if len == 0 {
                continue;
            }

            let mut pages = vec![0u32; len];
            region.read_words(index::entry_offset(base + 1), &mut pages);

            #[allow(clippy::cast_possible_truncation)]
            let mut order: Vec<u8> = (0..len as u32).map(|i| i as u8).collect();
            if len == FRAMES_PER_BLOCK as usize {
                // Complete block: reuse the index stored by append().
                region.read_bytes(index::index_block_offset(base / FRAMES_PER_BLOCK) * 4, &mut order);
            } else {
                let mut scratch = vec![0u8; len];
                index::merge_sort_indices(&mut order, &mut scratch, |i| pages[usize::from(i)]);
            }

            segments.push(Segment {
                base,
                pages,
                order,
                next: 0,
            });
        }

        Ok(Self {
            segments,
            prior: None,
        })
    }

    /// Return the next `(page, newest_frame)` pair, or `None` when every
    /// page has been emitted.
    pub(crate) fn next(&mut self) -> Option<(u32, u32)> {
        let prior = self.prior;
        let mut best: Option<(u32, u32)> = None;

        // Newest segment first, so on a page tie the frame from the newest
        // segment is kept (strict `<` below never replaces it).
        for seg in self.segments.iter_mut().rev() {
            while seg.next < seg.order.len()
                && prior.is_some_and(|p| seg.page(seg.next) <= p)
            {
                seg.next += 1;
            }
            if seg.next >= seg.order.len() {
                continue;
            }
            // Collapse a duplicate run to its last entry: ties sort
            // oldest-first, so the run's end is the newest frame.
            while seg.next + 1 < seg.order.len() && seg.page(seg.next + 1) == seg.page(seg.next) {
                seg.next += 1;
            }

            let candidate = (seg.page(seg.next), seg.frame(seg.next));
            match best {
                Some((page, _)) if candidate.0 >= page => {}
                _ => best = Some(candidate),
            }
        }

        if let Some((page, _)) = best {
            self.prior = Some(page);
        }
        best
    }
}
