//! Reservation segments and the pool that owns them.
//!
//! A [`Segment`] is one root-chunk-aligned reservation. Chunks are sliced
//! off its unsliced tail in address order, so the sliced prefix is always
//! exactly tiled by chunks linked through their headers' neighbor links.

use core::ops::Range;
use core::ptr::NonNull;

use crate::MetaWord;
use crate::commit::CommitLimiter;
use crate::error::AllocError;
use crate::growth::MetadataKind;
use crate::level::{ChunkLevel, ROOT_CHUNK_WORDS};
use crate::ptr_utils;
use crate::vm::VirtualMemory;

use super::chunk::{ChunkHeader, ChunkId, ChunkSlab};
use super::commit_mask::CommitMask;

#[derive(Debug)]
pub(crate) struct Segment {
    base: NonNull<MetaWord>,
    reserved_words: usize,
    /// Words sliced into chunks so far.
    top: usize,
    pub mask: CommitMask,

    pub first: Option<ChunkId>,
    pub last: Option<ChunkId>,
    pub chunk_count: usize,
    pub in_use: usize,
}

// segment memory is only touched under the expansion lock
unsafe impl Send for Segment {}

impl Segment {
    fn new(base: NonNull<MetaWord>, reserved_words: usize, granule_words: usize) -> Self {
        debug_assert!(ptr_utils::is_aligned_to(
            base.as_ptr().cast(),
            ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS)
        ));

        Self {
            base,
            reserved_words,
            top: 0,
            mask: CommitMask::new(reserved_words, granule_words),
            first: None,
            last: None,
            chunk_count: 0,
            in_use: 0,
        }
    }

    #[inline]
    pub fn base(&self) -> NonNull<MetaWord> {
        self.base
    }

    #[inline]
    pub fn reserved_words(&self) -> usize {
        self.reserved_words
    }

    #[inline]
    pub fn sliced_words(&self) -> usize {
        self.top
    }

    pub fn committed_words(&self) -> usize {
        self.mask.committed_granules() * self.mask.granule_words()
    }

    #[inline]
    pub fn address_of(&self, offset: usize) -> NonNull<MetaWord> {
        debug_assert!(offset <= self.reserved_words);
        unsafe { ptr_utils::word_add(self.base, offset) }
    }

    pub fn contains(&self, ptr: *const MetaWord) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + ptr_utils::words_to_bytes(self.reserved_words);
        (start..end).contains(&(ptr as usize))
    }

    fn append(&mut self, slab: &mut ChunkSlab, index: usize, offset: usize, level: ChunkLevel) -> ChunkId {
        debug_assert_eq!(offset, self.top);
        let mut header = ChunkHeader::new(index, offset, level);
        header.prev = self.last;
        header.committed = self.mask.committed_prefix(offset..offset + level.word_size());

        let id = slab.insert(header);
        match self.last {
            Some(last) => slab[last].next = Some(id),
            None => self.first = Some(id),
        }
        self.last = Some(id);
        self.top = offset + level.word_size();
        self.chunk_count += 1;
        id
    }

    /// Tiles `[top, end)` with the largest naturally aligned chunks.
    fn pad_to(&mut self, slab: &mut ChunkSlab, index: usize, end: usize, padding: &mut Vec<ChunkId>) {
        while self.top < end {
            let mut size = if self.top == 0 {
                ROOT_CHUNK_WORDS
            } else {
                (1usize << self.top.trailing_zeros()).min(ROOT_CHUNK_WORDS)
            };
            while self.top + size > end {
                size /= 2;
            }

            let level = ChunkLevel::exact(size).expect("segment padding below smallest chunk");
            padding.push(self.append(slab, index, self.top, level));
        }
    }

    /// Slices `count` contiguous chunks of `level` off the tail.
    ///
    /// Padding created to reach alignment is pushed to `padding`. Returns
    /// `None` if the tail is too short.
    fn carve(
        &mut self,
        slab: &mut ChunkSlab,
        index: usize,
        level: ChunkLevel,
        count: usize,
        padding: &mut Vec<ChunkId>,
    ) -> Option<Vec<ChunkId>> {
        let size = level.word_size();
        let start = ptr_utils::align_up(self.top, size);
        let end = size.checked_mul(count).and_then(|words| words.checked_add(start))?;
        if end > self.reserved_words {
            return None;
        }

        self.pad_to(slab, index, start, padding);
        Some((0..count).map(|i| self.append(slab, index, start + i * size, level)).collect())
    }

    /// Grows the last sliced chunk over `words` of the tail.
    pub fn extend_last(&mut self, words: usize) -> bool {
        if self.top + words > self.reserved_words {
            return false;
        }
        self.top += words;
        true
    }

    /// Slices the whole remaining tail into padding chunks.
    fn retire(&mut self, slab: &mut ChunkSlab, index: usize, padding: &mut Vec<ChunkId>) {
        let end = self.reserved_words;
        self.pad_to(slab, index, end, padding);
    }

    /// Commits every granule overlapping `words`.
    pub fn commit<V: VirtualMemory>(
        &mut self,
        words: Range<usize>,
        vm: &mut V,
        limiter: &mut CommitLimiter,
    ) -> Result<(), AllocError> {
        let granules = self.mask.granules_of(words);
        let missing = self.mask.count_uncommitted(granules.clone());
        if missing == 0 {
            return Ok(());
        }

        let granule_words = self.mask.granule_words();
        if let Err(err) = limiter.check(missing * granule_words) {
            tracing::debug!(
                requested = missing * granule_words,
                headroom = limiter.possible_expansion_words(),
                %err,
                "commit over budget"
            );
            return Err(err);
        }

        for run in self.mask.runs_not_in_state(granules, true) {
            let run_words = run.len() * granule_words;
            let base = self.address_of(run.start * granule_words).cast::<u8>();

            if !unsafe { vm.commit(base, ptr_utils::words_to_bytes(run_words)) } {
                tracing::warn!(?base, run_words, "commit refused by the system");
                return Err(AllocError::CommitLimit { requested_words: missing * granule_words });
            }

            self.mask.mark(run, true);
            limiter.increase(run_words);
        }

        Ok(())
    }

    /// Uncommits the committed granules lying wholly within `words`.
    /// Returns the number of words uncommitted.
    pub fn uncommit<V: VirtualMemory>(
        &mut self,
        words: Range<usize>,
        vm: &mut V,
        limiter: &mut CommitLimiter,
    ) -> usize {
        let granule_words = self.mask.granule_words();
        let first = ptr_utils::align_up(words.start, granule_words) / granule_words;
        let end = words.end / granule_words;
        if first >= end {
            return 0;
        }

        let mut uncommitted = 0;
        for run in self.mask.runs_not_in_state(first..end, false) {
            let run_words = run.len() * granule_words;
            let base = self.address_of(run.start * granule_words).cast::<u8>();

            if !unsafe { vm.uncommit(base, ptr_utils::words_to_bytes(run_words)) } {
                tracing::warn!(?base, run_words, "uncommit refused by the system");
                continue;
            }

            self.mask.mark(run, false);
            limiter.decrease(run_words);
            uncommitted += run_words;
        }
        uncommitted
    }
}

/// The segments of one space.
///
/// A growable pool reserves a new segment whenever the current one is
/// exhausted. A fixed pool has exactly one segment reserved up front.
#[derive(Debug)]
pub(crate) struct SegmentPool {
    kind: MetadataKind,
    segments: Vec<Option<Segment>>,
    current: Option<usize>,
    fixed: bool,
    default_words: usize,
    reserved_words: usize,
    max_reserved_words: usize,
    granule_words: usize,
}

impl SegmentPool {
    pub fn growable(
        kind: MetadataKind,
        default_words: usize,
        max_reserved_words: usize,
        granule_words: usize,
    ) -> Self {
        Self {
            kind,
            segments: Vec::new(),
            current: None,
            fixed: false,
            default_words,
            reserved_words: 0,
            max_reserved_words,
            granule_words,
        }
    }

    pub fn fixed<V: VirtualMemory>(
        kind: MetadataKind,
        words: usize,
        granule_words: usize,
        vm: &mut V,
    ) -> Result<Self, AllocError> {
        let mut pool = Self {
            kind,
            segments: Vec::new(),
            current: None,
            fixed: true,
            default_words: words,
            reserved_words: 0,
            max_reserved_words: words,
            granule_words,
        };
        pool.reserve_segment(words, vm).map_err(|_| AllocError::AddressSpace { fixed: true })?;
        Ok(pool)
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    #[inline]
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    #[inline]
    pub fn reserved_words(&self) -> usize {
        self.reserved_words
    }

    #[inline]
    pub fn max_reserved_words(&self) -> usize {
        self.max_reserved_words
    }

    pub fn committed_words(&self) -> usize {
        self.iter().map(|(_, s)| s.committed_words()).sum()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[track_caller]
    pub fn get(&self, index: usize) -> &Segment {
        self.segments[index].as_ref().expect("segment was purged")
    }

    #[track_caller]
    pub fn get_mut(&mut self, index: usize) -> &mut Segment {
        self.segments[index].as_mut().expect("segment was purged")
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Segment)> {
        self.segments.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn find(&self, ptr: *const MetaWord) -> Option<usize> {
        self.iter().find(|(_, s)| s.contains(ptr)).map(|(i, _)| i)
    }

    fn reserve_segment<V: VirtualMemory>(&mut self, words: usize, vm: &mut V) -> Result<usize, AllocError> {
        let address_space = AllocError::AddressSpace { fixed: self.fixed };

        if self.reserved_words.saturating_add(words) > self.max_reserved_words {
            tracing::debug!(kind = self.kind.name(), words, "address budget exhausted");
            return Err(address_space);
        }

        let bytes = ptr_utils::words_to_bytes(words);
        let align = ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS);
        let base = vm.reserve(bytes, align).ok_or(address_space)?;

        let segment = Segment::new(base.cast(), words, self.granule_words);
        let index = match self.segments.iter().position(Option::is_none) {
            Some(free) => {
                self.segments[free] = Some(segment);
                free
            }
            None => {
                self.segments.push(Some(segment));
                self.segments.len() - 1
            }
        };

        self.reserved_words += words;
        self.current = Some(index);
        tracing::debug!(kind = self.kind.name(), index, ?base, bytes, "reserved segment");
        Ok(index)
    }

    /// Slices `count` contiguous chunks of `level`, retiring the current
    /// segment and reserving a new one if it is too short.
    ///
    /// Padding chunks are pushed to `padding` even when this fails.
    pub fn take<V: VirtualMemory>(
        &mut self,
        slab: &mut ChunkSlab,
        level: ChunkLevel,
        count: usize,
        vm: &mut V,
        padding: &mut Vec<ChunkId>,
    ) -> Result<Vec<ChunkId>, AllocError> {
        if let Some(index) = self.current {
            let segment = self.segments[index].as_mut().expect("current segment was purged");
            if let Some(chunks) = segment.carve(slab, index, level, count, padding) {
                return Ok(chunks);
            }
            segment.retire(slab, index, padding);
            tracing::debug!(kind = self.kind.name(), index, "retired segment");
            self.current = None;
        }

        if self.fixed {
            return Err(AllocError::AddressSpace { fixed: true });
        }

        let words = level
            .word_size()
            .checked_mul(count)
            .and_then(|needed| needed.max(self.default_words).checked_next_multiple_of(self.default_words))
            .ok_or(AllocError::AddressSpace { fixed: false })?;
        let index = self.reserve_segment(words, vm)?;

        let segment = self.get_mut(index);
        Ok(segment.carve(slab, index, level, count, padding).expect("fresh segment too small"))
    }

    /// Releases a segment. Its chunk headers must already be gone.
    pub fn release<V: VirtualMemory>(&mut self, index: usize, vm: &mut V, limiter: &mut CommitLimiter) {
        debug_assert_ne!(Some(index), self.current);

        let mut segment = self.segments[index].take().expect("segment was purged");
        debug_assert_eq!(segment.in_use, 0);

        let reserved = segment.reserved_words;
        segment.uncommit(0..reserved, vm, limiter);

        unsafe { vm.release(segment.base.cast(), ptr_utils::words_to_bytes(reserved)) };
        self.reserved_words -= reserved;
        tracing::debug!(kind = self.kind.name(), index, words = reserved, "released segment");
    }

    /// Releases every segment, regardless of use.
    pub fn release_all<V: VirtualMemory>(&mut self, vm: &mut V) {
        for segment in self.segments.drain(..).flatten() {
            let bytes = ptr_utils::words_to_bytes(segment.reserved_words);
            unsafe { vm.release(segment.base.cast(), bytes) };
        }
        self.current = None;
        self.reserved_words = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::vm::HeapMemory;

    const GRANULE: usize = 512;

    fn tiled_words(slab: &ChunkSlab, segment: &Segment) -> usize {
        let mut offset = 0;
        let mut cursor = segment.first;
        while let Some(id) = cursor {
            assert_eq!(slab[id].offset, offset);
            assert_eq!(slab[id].offset % slab[id].word_size(), 0);
            offset = slab[id].end();
            cursor = slab[id].next;
        }
        offset
    }

    #[test]
    fn carve_with_padding() {
        let mut vm = HeapMemory::new();
        let mut slab = ChunkSlab::default();
        let mut pool = SegmentPool::growable(MetadataKind::NonClass, ROOT_CHUNK_WORDS * 2, usize::MAX, GRANULE);
        let mut padding = Vec::new();

        let small = pool.take(&mut slab, ChunkLevel::SMALLEST, 1, &mut vm, &mut padding).unwrap();
        assert!(padding.is_empty());
        assert_eq!(slab[small[0]].offset, 0);

        // a 4-times larger chunk needs padding up to its alignment
        let level = ChunkLevel::SMALLEST.merged().merged();
        let big = pool.take(&mut slab, level, 1, &mut vm, &mut padding).unwrap();
        assert_eq!(slab[big[0]].offset, level.word_size());
        assert_eq!(padding.len(), 2);
        assert_eq!(slab[padding[0]].level, ChunkLevel::SMALLEST);
        assert_eq!(slab[padding[1]].level, ChunkLevel::SMALLEST.merged());

        let segment = pool.get(0);
        assert_eq!(tiled_words(&slab, segment), segment.sliced_words());
        assert_eq!(segment.chunk_count, 4);
    }

    #[test]
    fn exhaustion_retires_and_grows() {
        let mut vm = HeapMemory::new();
        let mut slab = ChunkSlab::default();
        let mut pool = SegmentPool::growable(MetadataKind::NonClass, ROOT_CHUNK_WORDS, usize::MAX, GRANULE);
        let mut padding = Vec::new();

        pool.take(&mut slab, ChunkLevel::SMALLEST, 1, &mut vm, &mut padding).unwrap();
        let root = pool.take(&mut slab, ChunkLevel::ROOT, 1, &mut vm, &mut padding).unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.current(), Some(1));
        assert_eq!(slab[root[0]].segment, 1);

        // the first segment's tail became padding and is fully tiled
        let first = pool.get(0);
        assert_eq!(first.sliced_words(), first.reserved_words());
        assert_eq!(tiled_words(&slab, first), ROOT_CHUNK_WORDS);
        assert_eq!(padding.len(), ChunkLevel::all().count() - 1);
    }

    #[test]
    fn address_budget() {
        let mut vm = HeapMemory::new();
        let mut slab = ChunkSlab::default();
        let mut pool =
            SegmentPool::growable(MetadataKind::NonClass, ROOT_CHUNK_WORDS, ROOT_CHUNK_WORDS, GRANULE);
        let mut padding = Vec::new();

        pool.take(&mut slab, ChunkLevel::ROOT, 1, &mut vm, &mut padding).unwrap();
        assert_eq!(
            pool.take(&mut slab, ChunkLevel::SMALLEST, 1, &mut vm, &mut padding).unwrap_err(),
            AllocError::AddressSpace { fixed: false }
        );
    }

    #[test]
    fn fixed_pool_never_grows() {
        let mut vm = HeapMemory::new();
        let mut slab = ChunkSlab::default();
        let mut pool =
            SegmentPool::fixed(MetadataKind::Class, ROOT_CHUNK_WORDS, GRANULE, &mut vm).unwrap();
        let mut padding = Vec::new();

        pool.take(&mut slab, ChunkLevel::ROOT.split(), 1, &mut vm, &mut padding).unwrap();
        assert_eq!(
            pool.take(&mut slab, ChunkLevel::ROOT, 1, &mut vm, &mut padding).unwrap_err(),
            AllocError::AddressSpace { fixed: true }
        );
        assert_eq!(pool.len(), 1);
        // the unusable tail is handed out as padding
        assert_eq!(padding.len(), 1);
    }

    #[test]
    fn commit_and_uncommit_granules() {
        let mut vm = HeapMemory::new();
        let mut limiter = CommitLimiter::new(&Settings::default());
        let mut slab = ChunkSlab::default();
        let mut pool = SegmentPool::growable(MetadataKind::NonClass, ROOT_CHUNK_WORDS, usize::MAX, GRANULE);
        let mut padding = Vec::new();
        pool.take(&mut slab, ChunkLevel::SMALLEST, 1, &mut vm, &mut padding).unwrap();

        let segment = pool.get_mut(0);
        segment.commit(0..1, &mut vm, &mut limiter).unwrap();
        assert_eq!(segment.committed_words(), GRANULE);
        segment.commit(100..GRANULE * 3, &mut vm, &mut limiter).unwrap();
        assert_eq!(segment.committed_words(), GRANULE * 3);
        assert_eq!(limiter.committed_words(), GRANULE * 3);
        assert_eq!(vm.commit_calls(), 2);

        // only whole granules are uncommitted
        assert_eq!(segment.uncommit(GRANULE / 2..GRANULE * 3, &mut vm, &mut limiter), GRANULE * 2);
        assert_eq!(limiter.committed_words(), GRANULE);
    }
}
