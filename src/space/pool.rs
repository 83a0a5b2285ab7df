//! Free chunk lists.
//!
//! One doubly linked list per level, threaded through the chunk headers'
//! free links. Committed chunks go to the front and uncommitted ones to the
//! back, so popping from the front prefers memory that needs no commit.
//! A bitfield tracks which lists are non-empty. Free root chunks are also
//! indexed by address to find contiguous runs for oversized requests.

use std::collections::BTreeMap;

use crate::level::{ChunkLevel, NUM_LEVELS};

use super::chunk::{ChunkId, ChunkSlab, ChunkState};

#[derive(Debug, Default)]
pub(crate) struct ChunkPool {
    heads: [Option<ChunkId>; NUM_LEVELS],
    tails: [Option<ChunkId>; NUM_LEVELS],
    counts: [usize; NUM_LEVELS],
    /// Bit `n` is set if level `n` has free chunks.
    avails: u16,
    free_words: usize,
    /// Free root chunks by (segment, offset).
    roots: BTreeMap<(usize, usize), ChunkId>,
}

impl ChunkPool {
    #[inline]
    pub fn free_words(&self) -> usize {
        self.free_words
    }

    pub fn free_count(&self) -> usize {
        self.counts.iter().sum()
    }

    #[inline]
    pub fn count_at(&self, level: ChunkLevel) -> usize {
        self.counts[level.index()]
    }

    pub fn add(&mut self, slab: &mut ChunkSlab, id: ChunkId) {
        let header = &slab[id];
        debug_assert_eq!(header.state, ChunkState::Free);
        debug_assert!(header.free_prev.is_none() && header.free_next.is_none());

        let level = header.level;
        let li = level.index();
        let committed = header.committed > 0;

        if committed {
            slab[id].free_next = self.heads[li];
            match self.heads[li] {
                Some(head) => slab[head].free_prev = Some(id),
                None => self.tails[li] = Some(id),
            }
            self.heads[li] = Some(id);
        } else {
            slab[id].free_prev = self.tails[li];
            match self.tails[li] {
                Some(tail) => slab[tail].free_next = Some(id),
                None => self.heads[li] = Some(id),
            }
            self.tails[li] = Some(id);
        }

        self.counts[li] += 1;
        self.avails |= 1 << li;
        self.free_words += level.word_size();

        if level.is_root() {
            let header = &slab[id];
            self.roots.insert((header.segment, header.offset), id);
        }
    }

    pub fn remove(&mut self, slab: &mut ChunkSlab, id: ChunkId) {
        let header = &slab[id];
        debug_assert_eq!(header.state, ChunkState::Free);

        let level = header.level;
        let li = level.index();
        let (prev, next) = (header.free_prev, header.free_next);
        let key = (header.segment, header.offset);

        match prev {
            Some(prev) => slab[prev].free_next = next,
            None => self.heads[li] = next,
        }
        match next {
            Some(next) => slab[next].free_prev = prev,
            None => self.tails[li] = prev,
        }
        slab[id].free_prev = None;
        slab[id].free_next = None;

        self.counts[li] -= 1;
        if self.counts[li] == 0 {
            self.avails &= !(1 << li);
        }
        self.free_words -= level.word_size();

        if level.is_root() {
            self.roots.remove(&key);
        }
    }

    /// Pops a chunk of exactly `level`, committed ones first.
    pub fn pop(&mut self, slab: &mut ChunkSlab, level: ChunkLevel) -> Option<ChunkId> {
        let id = self.heads[level.index()]?;
        self.remove(slab, id);
        Some(id)
    }

    /// The smallest level at least as large as `level` with free chunks.
    pub fn smallest_available(&self, level: ChunkLevel) -> Option<ChunkLevel> {
        let mask = self.avails & ((1u32 << (level.index() + 1)) - 1) as u16;
        if mask == 0 {
            return None;
        }
        ChunkLevel::new((u16::BITS - 1 - mask.leading_zeros()) as u8)
    }

    /// Finds `count` free root chunks contiguous in one segment.
    pub fn contiguous_roots(&self, count: usize) -> Option<Vec<ChunkId>> {
        let root_words = ChunkLevel::ROOT.word_size();
        let mut run: Vec<ChunkId> = Vec::new();
        let mut last: Option<(usize, usize)> = None;

        for (&(segment, offset), &id) in &self.roots {
            let extends = matches!(last, Some((s, o)) if s == segment && o + root_words == offset);
            if !extends {
                run.clear();
            }
            run.push(id);
            last = Some((segment, offset));

            if run.len() == count {
                return Some(run);
            }
        }
        None
    }

    pub fn iter_level<'a>(&self, slab: &'a ChunkSlab, level: ChunkLevel) -> FreeListIter<'a> {
        FreeListIter { slab, cursor: self.heads[level.index()] }
    }

    pub fn iter<'a>(&'a self, slab: &'a ChunkSlab) -> impl Iterator<Item = ChunkId> + 'a {
        ChunkLevel::all().flat_map(move |level| self.iter_level(slab, level))
    }

    /// Panics if the lists disagree with the headers or the totals.
    pub fn verify(&self, slab: &ChunkSlab) {
        let mut free_words = 0;
        let mut roots = 0;

        for level in ChunkLevel::all() {
            let li = level.index();
            let mut count = 0;
            let mut prev = None;

            for id in self.iter_level(slab, level) {
                let header = &slab[id];
                assert_eq!(header.state, ChunkState::Free, "{id:?} in free list but not free");
                assert_eq!(header.level, level, "{id:?} in the wrong free list");
                assert_eq!(header.free_prev, prev, "{id:?} free list back link broken");

                count += 1;
                free_words += level.word_size();
                prev = Some(id);
            }

            assert_eq!(self.tails[li], prev, "free list tail of {level:?} broken");
            assert_eq!(self.counts[li], count, "free list count of {level:?} is off");
            assert_eq!(self.avails & (1 << li) != 0, count != 0, "availability bit of {level:?} is off");
            if level.is_root() {
                roots = count;
            }
        }

        assert_eq!(self.free_words, free_words, "free word total is off");
        assert_eq!(self.roots.len(), roots, "root index out of sync");
        for (&(segment, offset), &id) in &self.roots {
            assert_eq!((slab[id].segment, slab[id].offset), (segment, offset));
        }
    }
}

pub(crate) struct FreeListIter<'a> {
    slab: &'a ChunkSlab,
    cursor: Option<ChunkId>,
}

impl Iterator for FreeListIter<'_> {
    type Item = ChunkId;

    fn next(&mut self) -> Option<ChunkId> {
        let id = self.cursor?;
        self.cursor = self.slab[id].free_next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::chunk::ChunkHeader;

    fn free_chunk(slab: &mut ChunkSlab, segment: usize, offset: usize, level: ChunkLevel, committed: usize) -> ChunkId {
        let mut header = ChunkHeader::new(segment, offset, level);
        header.committed = committed;
        slab.insert(header)
    }

    #[test]
    fn committed_first() {
        let mut slab = ChunkSlab::default();
        let mut pool = ChunkPool::default();
        let level = ChunkLevel::SMALLEST;

        let cold = free_chunk(&mut slab, 0, 0, level, 0);
        let warm = free_chunk(&mut slab, 0, 128, level, 128);
        pool.add(&mut slab, cold);
        pool.add(&mut slab, warm);
        pool.verify(&slab);

        assert_eq!(pool.count_at(level), 2);
        assert_eq!(pool.free_words(), 256);
        assert_eq!(pool.pop(&mut slab, level), Some(warm));
        assert_eq!(pool.pop(&mut slab, level), Some(cold));
        assert_eq!(pool.pop(&mut slab, level), None);
        pool.verify(&slab);
    }

    #[test]
    fn smallest_available_level() {
        let mut slab = ChunkSlab::default();
        let mut pool = ChunkPool::default();
        assert_eq!(pool.smallest_available(ChunkLevel::SMALLEST), None);

        let root = free_chunk(&mut slab, 0, 0, ChunkLevel::ROOT, 0);
        pool.add(&mut slab, root);
        assert_eq!(pool.smallest_available(ChunkLevel::SMALLEST), Some(ChunkLevel::ROOT));

        let mid = ChunkLevel::new(5).unwrap();
        let chunk = free_chunk(&mut slab, 1, 0, mid, 0);
        pool.add(&mut slab, chunk);
        assert_eq!(pool.smallest_available(ChunkLevel::SMALLEST), Some(mid));
        assert_eq!(pool.smallest_available(mid), Some(mid));
        assert_eq!(pool.smallest_available(ChunkLevel::new(4).unwrap()), Some(ChunkLevel::ROOT));
        assert_eq!(pool.smallest_available(ChunkLevel::ROOT), Some(ChunkLevel::ROOT));

        pool.remove(&mut slab, root);
        assert_eq!(pool.smallest_available(ChunkLevel::new(4).unwrap()), None);
        pool.verify(&slab);
    }

    #[test]
    fn contiguous_root_runs() {
        let mut slab = ChunkSlab::default();
        let mut pool = ChunkPool::default();
        let root = ChunkLevel::ROOT.word_size();

        for (segment, index) in [(0, 0), (0, 2), (0, 3), (1, 0), (1, 1), (1, 2)] {
            let id = free_chunk(&mut slab, segment, index * root, ChunkLevel::ROOT, 0);
            pool.add(&mut slab, id);
        }

        let run = pool.contiguous_roots(2).unwrap();
        assert_eq!((slab[run[0]].segment, slab[run[0]].offset), (0, 2 * root));

        let run = pool.contiguous_roots(3).unwrap();
        assert!(run.iter().all(|&id| slab[id].segment == 1));
        assert!(pool.contiguous_roots(4).is_none());
        pool.verify(&slab);
    }
}
