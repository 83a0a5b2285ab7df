//! Chunk records.
//!
//! Every chunk a segment has sliced has a [`ChunkHeader`] in its space's
//! [`ChunkSlab`], addressed by [`ChunkId`]. Headers link to their address
//! neighbors within the segment and, while free, to their free list
//! neighbors. An arena holds a [`Chunk`] for each chunk it owns: the
//! owned handle carries the bump watermarks, the header stays behind
//! in the slab marked [`ChunkState::InUse`].

use core::fmt;
use core::ptr::NonNull;

use crate::MetaWord;
use crate::level::ChunkLevel;
use crate::ptr_utils;

/// Index of a chunk header within its space's slab.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Free,
    InUse,
    /// Absorbed by its buddy or purged; the header awaits reuse.
    Dead,
}

#[derive(Debug, Clone)]
pub(crate) struct ChunkHeader {
    pub segment: usize,
    /// Word offset from the segment base.
    pub offset: usize,
    pub level: ChunkLevel,
    pub state: ChunkState,
    /// Committed prefix in words. Only maintained while not in use.
    pub committed: usize,

    pub prev: Option<ChunkId>,
    pub next: Option<ChunkId>,

    pub free_prev: Option<ChunkId>,
    pub free_next: Option<ChunkId>,
}

impl ChunkHeader {
    pub fn new(segment: usize, offset: usize, level: ChunkLevel) -> Self {
        Self {
            segment,
            offset,
            level,
            state: ChunkState::Free,
            committed: 0,
            prev: None,
            next: None,
            free_prev: None,
            free_next: None,
        }
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.level.word_size()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.word_size()
    }

    /// Whether this chunk is the lower half of its buddy pair.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.level.is_root() || (self.offset / self.word_size()) % 2 == 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct ChunkSlab {
    headers: Vec<ChunkHeader>,
    dead: Vec<ChunkId>,
}

impl ChunkSlab {
    pub fn insert(&mut self, header: ChunkHeader) -> ChunkId {
        if let Some(id) = self.dead.pop() {
            debug_assert_eq!(self.headers[id.index()].state, ChunkState::Dead);
            self.headers[id.index()] = header;
            id
        } else {
            let id = ChunkId(u32::try_from(self.headers.len()).expect("chunk slab overflow"));
            self.headers.push(header);
            id
        }
    }

    pub fn remove(&mut self, id: ChunkId) {
        let header = &mut self.headers[id.index()];
        debug_assert_ne!(header.state, ChunkState::Dead);
        header.state = ChunkState::Dead;
        header.prev = None;
        header.next = None;
        header.free_prev = None;
        header.free_next = None;
        self.dead.push(id);
    }

    /// Number of live headers.
    pub fn len(&self) -> usize {
        self.headers.len() - self.dead.len()
    }
}

impl core::ops::Index<ChunkId> for ChunkSlab {
    type Output = ChunkHeader;

    #[inline]
    fn index(&self, id: ChunkId) -> &ChunkHeader {
        &self.headers[id.index()]
    }
}

impl core::ops::IndexMut<ChunkId> for ChunkSlab {
    #[inline]
    fn index_mut(&mut self, id: ChunkId) -> &mut ChunkHeader {
        &mut self.headers[id.index()]
    }
}

/// A chunk owned by an arena.
///
/// Not `Clone`: a chunk is owned by exactly one arena until it is handed
/// back to its space.
pub(crate) struct Chunk {
    pub(crate) id: ChunkId,
    base: NonNull<MetaWord>,
    level: ChunkLevel,
    used: usize,
    committed: usize,
}

// chunk memory is only touched by the owning arena
unsafe impl Send for Chunk {}

impl Chunk {
    pub(crate) fn new(id: ChunkId, base: NonNull<MetaWord>, level: ChunkLevel, committed: usize) -> Self {
        Self { id, base, level, used: 0, committed }
    }

    #[inline]
    pub fn base(&self) -> NonNull<MetaWord> {
        self.base
    }

    #[inline]
    pub fn level(&self) -> ChunkLevel {
        self.level
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.level.word_size()
    }

    #[inline]
    pub fn used_words(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn committed_words(&self) -> usize {
        self.committed
    }

    /// Words not yet handed out, committed or not.
    #[inline]
    pub fn free_words(&self) -> usize {
        self.word_size() - self.used
    }

    #[inline]
    pub fn free_below_committed_words(&self) -> usize {
        self.committed - self.used
    }

    /// First word past the used range.
    #[inline]
    pub fn top(&self) -> NonNull<MetaWord> {
        unsafe { ptr_utils::word_add(self.base, self.used) }
    }

    pub fn contains(&self, ptr: *const MetaWord) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + ptr_utils::words_to_bytes(self.word_size());
        (start..end).contains(&(ptr as usize))
    }

    /// Whether `[ptr, ptr + words)` lies within the used range.
    pub fn is_in_used_range(&self, ptr: *const MetaWord, words: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        let used_end = start + ptr_utils::words_to_bytes(self.used);
        let ptr = ptr as usize;
        ptr >= start && ptr + ptr_utils::words_to_bytes(words) <= used_end
    }

    /// Bumps the used watermark by `words`, returning the old top.
    pub fn allocate(&mut self, words: usize) -> NonNull<MetaWord> {
        assert!(words <= self.free_below_committed_words(), "bump past committed watermark");
        let top = self.top();
        self.used += words;
        top
    }

    pub(crate) fn set_committed(&mut self, committed: usize) {
        debug_assert!(self.used <= committed && committed <= self.word_size());
        self.committed = committed;
    }

    /// Doubles the chunk after its buddy has been absorbed.
    pub(crate) fn set_level(&mut self, level: ChunkLevel) {
        debug_assert!(level.word_size() >= self.used);
        self.level = level;
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} @ {:p} used {}/{} committed {}",
            self.id,
            self.level,
            self.base,
            self.used,
            self.word_size(),
            self.committed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_recycles_dead_headers() {
        let mut slab = ChunkSlab::default();
        let a = slab.insert(ChunkHeader::new(0, 0, ChunkLevel::SMALLEST));
        let b = slab.insert(ChunkHeader::new(0, 128, ChunkLevel::SMALLEST));
        assert_eq!(slab.len(), 2);

        slab.remove(a);
        assert_eq!(slab.len(), 1);
        assert_eq!(slab[a].state, ChunkState::Dead);

        let c = slab.insert(ChunkHeader::new(0, 256, ChunkLevel::SMALLEST));
        assert_eq!(c, a);
        assert_eq!(slab[c].offset, 256);
        assert_eq!(slab[b].offset, 128);
    }

    #[test]
    fn leaders() {
        let level = ChunkLevel::SMALLEST;
        assert!(ChunkHeader::new(0, 0, level).is_leader());
        assert!(!ChunkHeader::new(0, 128, level).is_leader());
        assert!(ChunkHeader::new(0, 256, level).is_leader());
        assert!(ChunkHeader::new(0, 0, ChunkLevel::ROOT).is_leader());
    }

    #[test]
    fn bump_allocation() {
        let mut buf = vec![0usize; 128];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut chunk = Chunk::new(ChunkId(0), base, ChunkLevel::SMALLEST, 64);

        let a = chunk.allocate(10);
        let b = chunk.allocate(54);
        assert_eq!(a, base);
        assert_eq!(ptr_utils::word_offset(base, b), 10);
        assert_eq!(chunk.free_below_committed_words(), 0);
        assert_eq!(chunk.free_words(), 64);
        assert!(chunk.is_in_used_range(b.as_ptr(), 54));
        assert!(!chunk.is_in_used_range(b.as_ptr(), 55));
        assert!(chunk.contains(unsafe { ptr_utils::word_add(base, 127) }.as_ptr()));
    }

    #[test]
    #[should_panic]
    fn bump_past_committed() {
        let mut buf = vec![0usize; 128];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut chunk = Chunk::new(ChunkId(0), base, ChunkLevel::SMALLEST, 0);
        chunk.allocate(1);
    }
}
