//! Chunk management for one metadata kind.
//!
//! A [`Space`] combines a [`SegmentPool`] with a [`ChunkPool`] into a buddy
//! allocator over power-of-two chunks. Every method runs under the context's
//! expansion lock; the [`Env`] carries the state shared by both spaces.
//!
//! Chunks leave the space as owned [`Chunk`]s and come back through
//! [`Space::return_chunk`], which coalesces them with free buddies.

use core::ptr::NonNull;

use crate::MetaWord;
use crate::commit::CommitLimiter;
use crate::error::AllocError;
use crate::growth::MetadataKind;
use crate::level::ChunkLevel;
use crate::ptr_utils;
use crate::settings::Settings;
use crate::stats::SpaceStats;
use crate::vm::VirtualMemory;

pub(crate) mod chunk;
mod commit_mask;
mod humongous;
mod pool;
mod segment;

pub(crate) use chunk::Chunk;
use chunk::{ChunkId, ChunkSlab, ChunkState};
use pool::ChunkPool;
use segment::SegmentPool;

/// State shared by all spaces of a context, guarded by the expansion lock.
#[derive(Debug)]
pub(crate) struct Env<V> {
    pub vm: V,
    pub limiter: CommitLimiter,
    pub granule_words: usize,
    pub page_words: usize,
    pub uncommit_free_chunks: bool,
}

impl<V: VirtualMemory> Env<V> {
    pub fn new(vm: V, settings: &Settings) -> Self {
        let page_words = ptr_utils::bytes_to_words(vm.page_size());
        Self {
            vm,
            limiter: CommitLimiter::new(settings),
            granule_words: settings.granule_words(),
            page_words,
            uncommit_free_chunks: settings.uncommit_free_chunks,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Space {
    kind: MetadataKind,
    slab: ChunkSlab,
    segments: SegmentPool,
    pool: ChunkPool,
}

impl Space {
    pub fn growable(kind: MetadataKind, settings: &Settings) -> Self {
        let max_reserved = settings.max_address_budget.min(isize::MAX as usize) / ptr_utils::WORD_SIZE;
        Self {
            kind,
            slab: ChunkSlab::default(),
            segments: SegmentPool::growable(
                kind,
                settings.segment_default_words(),
                max_reserved,
                settings.granule_words(),
            ),
            pool: ChunkPool::default(),
        }
    }

    pub fn fixed<V: VirtualMemory>(
        kind: MetadataKind,
        words: usize,
        env: &mut Env<V>,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            kind,
            slab: ChunkSlab::default(),
            segments: SegmentPool::fixed(kind, words, env.granule_words, &mut env.vm)?,
            pool: ChunkPool::default(),
        })
    }

    #[inline]
    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    pub fn reserved_words(&self) -> usize {
        self.segments.reserved_words()
    }

    pub fn committed_words(&self) -> usize {
        self.segments.committed_words()
    }

    pub fn free_words(&self) -> usize {
        self.pool.free_words()
    }

    /// The failure for requests this space can never hold.
    pub fn address_space_error(&self) -> AllocError {
        AllocError::AddressSpace { fixed: self.segments.is_fixed() }
    }

    pub fn contains(&self, ptr: *const MetaWord) -> bool {
        self.segments.find(ptr).is_some()
    }

    /// Address range of the first segment. For a fixed space, its whole range.
    pub fn first_range(&self) -> Option<core::ops::Range<usize>> {
        let (_, segment) = self.segments.iter().next()?;
        let start = segment.base().as_ptr() as usize;
        Some(start..start + ptr_utils::words_to_bytes(segment.reserved_words()))
    }

    fn refresh_committed(&mut self, id: ChunkId) {
        let header = &self.slab[id];
        let range = header.offset..header.end();
        let committed = self.segments.get(header.segment).mask.committed_prefix(range);
        self.slab[id].committed = committed;
    }

    /// Splits chunk `id`, which must be in no free list, down to `level`.
    /// The trailing halves go to the pool.
    fn split(&mut self, id: ChunkId, level: ChunkLevel) {
        while self.slab[id].level < level {
            let header = &self.slab[id];
            let half = header.level.split();
            let segment = header.segment;
            let next = header.next;

            let mut follower = chunk::ChunkHeader::new(segment, header.offset + half.word_size(), half);
            follower.prev = Some(id);
            follower.next = next;
            let follower = self.slab.insert(follower);

            match next {
                Some(next) => self.slab[next].prev = Some(follower),
                None => self.segments.get_mut(segment).last = Some(follower),
            }
            self.slab[id].next = Some(follower);
            self.slab[id].level = half;
            self.segments.get_mut(segment).chunk_count += 1;

            self.refresh_committed(follower);
            self.pool.add(&mut self.slab, follower);
        }
        self.refresh_committed(id);
    }

    /// Absorbs the follower `follower` into its leader `leader`.
    fn absorb(&mut self, leader: ChunkId, follower: ChunkId) {
        let segment = self.slab[leader].segment;
        let next = self.slab[follower].next;

        self.slab[leader].next = next;
        match next {
            Some(next) => self.slab[next].prev = Some(leader),
            None => self.segments.get_mut(segment).last = Some(leader),
        }
        self.slab[leader].level = self.slab[leader].level.merged();
        self.slab.remove(follower);
        self.segments.get_mut(segment).chunk_count -= 1;
    }

    /// The free buddy of `id` at the same level, if there is one.
    fn free_buddy(&self, id: ChunkId) -> Option<ChunkId> {
        let header = &self.slab[id];
        if header.level.is_root() {
            return None;
        }

        let buddy = if header.is_leader() { header.next } else { header.prev }?;
        let other = &self.slab[buddy];
        if other.state != ChunkState::Free || other.level != header.level {
            return None;
        }
        debug_assert_eq!(other.offset, header.offset ^ header.word_size());
        Some(buddy)
    }

    /// Merges free chunk `id`, which must be in no free list, with free
    /// buddies as far as possible. Returns the merged chunk.
    fn merge(&mut self, mut id: ChunkId) -> ChunkId {
        while let Some(buddy) = self.free_buddy(id) {
            self.pool.remove(&mut self.slab, buddy);
            let leader = if self.slab[id].is_leader() { id } else { buddy };
            let follower = if leader == id { buddy } else { id };
            self.absorb(leader, follower);
            id = leader;
        }
        self.refresh_committed(id);
        id
    }

    /// Marks `id` free, coalesces it and files it in the pool.
    fn release_header<V: VirtualMemory>(&mut self, id: ChunkId, env: &mut Env<V>) {
        self.slab[id].state = ChunkState::Free;
        let id = self.merge(id);

        let header = &self.slab[id];
        if env.uncommit_free_chunks && header.word_size() >= env.granule_words {
            let range = header.offset..header.end();
            let segment = self.segments.get_mut(header.segment);
            let words = segment.uncommit(range, &mut env.vm, &mut env.limiter);
            if words > 0 {
                tracing::trace!(kind = self.kind.name(), ?id, words, "uncommitted free chunk");
                self.refresh_committed(id);
            }
        }

        self.pool.add(&mut self.slab, id);
    }

    /// Takes a free chunk of `level`, splitting a larger one if needed.
    fn take_free(&mut self, level: ChunkLevel) -> Option<ChunkId> {
        let found = self.pool.smallest_available(level)?;
        let id = self.pool.pop(&mut self.slab, found)?;
        self.slab[id].state = ChunkState::InUse;
        self.split(id, level);
        Some(id)
    }

    /// Slices `count` new contiguous chunks of `level` from the segments.
    fn take_new<V: VirtualMemory>(
        &mut self,
        level: ChunkLevel,
        count: usize,
        env: &mut Env<V>,
    ) -> Result<Vec<ChunkId>, AllocError> {
        let mut padding = Vec::new();
        let taken = self.segments.take(&mut self.slab, level, count, &mut env.vm, &mut padding);

        if let Ok(ids) = &taken {
            for &id in ids {
                self.slab[id].state = ChunkState::InUse;
            }
        }
        // unpooled padding must not be mistaken for a free buddy
        for &id in &padding {
            self.slab[id].state = ChunkState::InUse;
        }
        for id in padding {
            self.release_header(id, env);
        }
        taken
    }

    /// Wraps a taken header into an owned chunk and commits its first `commit_words`.
    fn hand_out<V: VirtualMemory>(
        &mut self,
        id: ChunkId,
        commit_words: usize,
        env: &mut Env<V>,
    ) -> Result<Chunk, AllocError> {
        let header = &self.slab[id];
        debug_assert_eq!(header.state, ChunkState::InUse);

        let segment = self.segments.get_mut(header.segment);
        segment.in_use += 1;
        let base = segment.address_of(header.offset);
        let mut chunk = Chunk::new(id, base, header.level, header.committed);

        if let Err(err) = self.ensure_committed(&mut chunk, commit_words, env) {
            self.return_chunk(chunk, env);
            return Err(err);
        }
        Ok(chunk)
    }

    /// Acquires a chunk of `level` with at least `commit_words` committed.
    pub fn acquire<V: VirtualMemory>(
        &mut self,
        level: ChunkLevel,
        commit_words: usize,
        env: &mut Env<V>,
    ) -> Result<Chunk, AllocError> {
        debug_assert!(commit_words <= level.word_size());

        let id = match self.take_free(level) {
            Some(id) => id,
            None => match self.take_new(level, 1, env) {
                Ok(ids) => ids[0],
                // retiring the segment may have produced a fitting chunk
                Err(err) => self.take_free(level).ok_or(err)?,
            },
        };

        let chunk = self.hand_out(id, commit_words, env)?;
        self.scan_for_errors();
        Ok(chunk)
    }

    /// Returns a chunk to the pool, coalescing it with free buddies.
    pub fn return_chunk<V: VirtualMemory>(&mut self, chunk: Chunk, env: &mut Env<V>) {
        let id = chunk.id;
        debug_assert_eq!(self.slab[id].state, ChunkState::InUse);
        debug_assert_eq!(self.slab[id].level, chunk.level());

        let segment = self.slab[id].segment;
        self.segments.get_mut(segment).in_use -= 1;
        self.release_header(id, env);
    }

    /// Commits `chunk` up to `words`, rounded up to whole granules.
    pub fn ensure_committed<V: VirtualMemory>(
        &mut self,
        chunk: &mut Chunk,
        words: usize,
        env: &mut Env<V>,
    ) -> Result<(), AllocError> {
        if words <= chunk.committed_words() {
            return Ok(());
        }

        let target = ptr_utils::align_up(words, env.granule_words).min(chunk.word_size());
        let header = &self.slab[chunk.id];
        let offset = header.offset;
        let segment = self.segments.get_mut(header.segment);

        match segment.commit(offset + chunk.committed_words()..offset + target, &mut env.vm, &mut env.limiter) {
            Ok(()) => {
                chunk.set_committed(target);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(kind = self.kind.name(), ?chunk, target, %err, "chunk commit failed");
                Err(err)
            }
        }
    }

    /// Doubles `chunk` by absorbing its buddy. Fails unless `chunk` is a
    /// leader below root whose follower is free and unsplit, or not yet sliced.
    pub fn enlarge_in_place(&mut self, chunk: &mut Chunk) -> bool {
        let header = &self.slab[chunk.id];
        if header.level.is_root() || !header.is_leader() {
            return false;
        }

        if header.next.is_none() {
            // last sliced chunk: the follower is still segment tail
            let words = header.word_size();
            if !self.segments.get_mut(header.segment).extend_last(words) {
                return false;
            }
            self.slab[chunk.id].level = self.slab[chunk.id].level.merged();
        } else {
            let Some(buddy) = self.free_buddy(chunk.id) else {
                return false;
            };
            self.pool.remove(&mut self.slab, buddy);
            self.absorb(chunk.id, buddy);
        }
        chunk.set_level(self.slab[chunk.id].level);

        let header = &self.slab[chunk.id];
        let committed = self
            .segments
            .get(header.segment)
            .mask
            .committed_prefix(header.offset..header.end());
        chunk.set_committed(committed.max(chunk.committed_words()).min(chunk.word_size()));
        true
    }

    /// Releases every segment with no chunk in use, other than the current one.
    /// Returns the number of released segments.
    pub fn purge<V: VirtualMemory>(&mut self, env: &mut Env<V>) -> usize {
        if self.segments.is_fixed() {
            return 0;
        }

        let current = self.segments.current();
        let idle: Vec<usize> = self
            .segments
            .iter()
            .filter(|&(index, segment)| Some(index) != current && segment.in_use == 0)
            .map(|(index, _)| index)
            .collect();

        for &index in &idle {
            let mut cursor = self.segments.get(index).first;
            while let Some(id) = cursor {
                cursor = self.slab[id].next;
                self.pool.remove(&mut self.slab, id);
                self.slab.remove(id);
            }
            self.segments.release(index, &mut env.vm, &mut env.limiter);
        }

        self.scan_for_errors();
        idle.len()
    }

    /// Releases all reservations. Chunks still held by arenas dangle afterwards.
    pub fn release_all<V: VirtualMemory>(&mut self, vm: &mut V) {
        self.segments.release_all(vm);
        self.slab = ChunkSlab::default();
        self.pool = ChunkPool::default();
    }

    pub fn stats(&self) -> SpaceStats {
        let mut stats = SpaceStats {
            reserved_words: self.reserved_words(),
            committed_words: self.committed_words(),
            segments: self.segments.len(),
            free_words: self.pool.free_words(),
            free_chunks: self.pool.free_count(),
            ..SpaceStats::default()
        };

        for level in ChunkLevel::all() {
            stats.free_chunks_by_level[level.index()] = self.pool.count_at(level);
        }
        for id in self.pool.iter(&self.slab) {
            stats.free_committed_words += self.slab[id].committed;
        }
        stats
    }

    #[inline]
    fn scan_for_errors(&self) {
        #[cfg(any(test, feature = "error-scanning"))]
        self.verify();
    }

    /// Panics if the segments, chunk headers and free lists are inconsistent.
    pub fn verify(&self) {
        self.pool.verify(&self.slab);

        let mut live = 0;
        let mut free_words = 0;

        for (index, segment) in self.segments.iter() {
            let mut offset = 0;
            let mut count = 0;
            let mut in_use = 0;
            let mut prev = None;
            let mut cursor = segment.first;

            while let Some(id) = cursor {
                let header = &self.slab[id];
                assert_ne!(header.state, ChunkState::Dead, "{id:?} dead but linked");
                assert_eq!(header.segment, index, "{id:?} linked into the wrong segment");
                assert_eq!(header.offset, offset, "{id:?} breaks the tiling of segment {index}");
                assert_eq!(header.offset % header.word_size(), 0, "{id:?} misaligned");
                assert_eq!(header.prev, prev, "{id:?} neighbor back link broken");

                match header.state {
                    ChunkState::InUse => in_use += 1,
                    ChunkState::Free => {
                        free_words += header.word_size();
                        let committed = segment.mask.committed_prefix(header.offset..header.end());
                        assert!(header.committed <= committed, "{id:?} claims uncommitted memory");
                        assert!(self.free_buddy(id).is_none(), "{id:?} has an unmerged free buddy");
                    }
                    ChunkState::Dead => unreachable!(),
                }

                offset = header.end();
                count += 1;
                prev = Some(id);
                cursor = header.next;
            }

            assert_eq!(offset, segment.sliced_words(), "segment {index} tiling ends early");
            assert_eq!(segment.last, prev, "segment {index} tail link broken");
            assert_eq!(segment.chunk_count, count, "segment {index} chunk count is off");
            assert_eq!(segment.in_use, in_use, "segment {index} in-use count is off");
            live += count;
        }

        assert_eq!(self.slab.len(), live, "chunk headers leaked");
        assert_eq!(self.pool.free_words(), free_words, "pool free words disagree with segments");
    }
}

/// Start of the memory covered by `chunks`, which must be contiguous.
pub(crate) fn chain_base(chunks: &[Chunk]) -> Option<NonNull<MetaWord>> {
    debug_assert!(chunks.windows(2).all(|w| {
        let end = unsafe { ptr_utils::word_add(w[0].base(), w[0].word_size()) };
        end == w[1].base()
    }));
    chunks.first().map(Chunk::base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::ROOT_CHUNK_WORDS;
    use crate::vm::HeapMemory;

    const GRANULE_BYTES: usize = 4096;

    fn env(settings: &Settings) -> Env<HeapMemory> {
        Env::new(HeapMemory::new(), settings)
    }

    fn settings() -> Settings {
        Settings::default()
            .with_commit_granule_bytes(GRANULE_BYTES)
            .with_segment_default_bytes(ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS * 2))
    }

    #[test]
    fn split_then_coalesce_to_root() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);

        let root = space.acquire(ChunkLevel::ROOT, 0, &mut env).unwrap();
        space.return_chunk(root, &mut env);
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 1);

        // a small chunk splits the free root
        let small = space.acquire(ChunkLevel::SMALLEST, 1, &mut env).unwrap();
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 0);
        for level in ChunkLevel::all().skip(1) {
            assert_eq!(space.pool.count_at(level), 1);
        }
        assert_eq!(small.committed_words(), small.word_size());

        space.return_chunk(small, &mut env);
        assert_eq!(space.pool.free_count(), 1);
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 1);
        space.verify();
    }

    #[test]
    fn buddies_merge_only_when_both_free() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);
        let level = ChunkLevel::SMALLEST;

        let a = space.acquire(level, 0, &mut env).unwrap();
        let b = space.acquire(level, 0, &mut env).unwrap();
        assert_eq!(b.base(), unsafe { ptr_utils::word_add(a.base(), level.word_size()) });

        space.return_chunk(a, &mut env);
        assert_eq!(space.pool.count_at(level), 1);
        space.verify();

        space.return_chunk(b, &mut env);
        assert_eq!(space.pool.count_at(level), 0);
        space.verify();
    }

    #[test]
    fn released_chunk_is_handed_out_again() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);
        let level = ChunkLevel::new(6).unwrap();

        let a = space.acquire(level, 0, &mut env).unwrap();
        let b = space.acquire(level, 0, &mut env).unwrap();
        let base = a.base();

        // b is still in use, so a cannot coalesce and keeps its level
        space.return_chunk(a, &mut env);
        assert_eq!(space.pool.count_at(level), 1);

        let c = space.acquire(level, 0, &mut env).unwrap();
        assert_eq!(c.base(), base);
        assert_eq!(c.level(), level);
        space.verify();

        space.return_chunk(b, &mut env);
        space.return_chunk(c, &mut env);
        assert_eq!(space.pool.free_count(), 1);
        space.verify();
    }

    #[test]
    fn retiring_segment_behind_freed_chunk() {
        let settings = settings().with_segment_default_bytes(ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS));
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);

        // the tail of the segment follows a freed chunk
        let small = space.acquire(ChunkLevel::SMALLEST, 0, &mut env).unwrap();
        space.return_chunk(small, &mut env);
        assert_eq!(space.pool.count_at(ChunkLevel::SMALLEST), 1);

        // no room for a root chunk, so the segment is retired into padding
        let root = space.acquire(ChunkLevel::ROOT, 0, &mut env).unwrap();
        assert_eq!(space.segments.len(), 2);
        space.verify();

        // the padding coalesced with the freed chunk back into a whole root
        assert_eq!(space.pool.free_count(), 1);
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 1);

        space.return_chunk(root, &mut env);
        assert_eq!(space.purge(&mut env), 1);
        space.verify();
    }

    #[test]
    fn granule_sharing_small_chunks() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);
        let granule_words = env.granule_words;

        let a = space.acquire(ChunkLevel::SMALLEST, 1, &mut env).unwrap();
        assert_eq!(env.limiter.committed_words(), granule_words);

        // the neighbor shares the granule, no further commit needed
        let b = space.acquire(ChunkLevel::SMALLEST, 1, &mut env).unwrap();
        assert_eq!(env.limiter.committed_words(), granule_words);
        assert_eq!(env.vm.commit_calls(), 1);

        space.return_chunk(a, &mut env);
        space.return_chunk(b, &mut env);
        // the merged chunk is still smaller than a granule
        assert_eq!(space.pool.count_at(ChunkLevel::SMALLEST.merged()), 1);
        assert_eq!(env.limiter.committed_words(), granule_words);
        space.verify();
    }

    #[test]
    fn commit_failure_returns_chunk() {
        let settings = settings().with_max_commit_budget(GRANULE_BYTES);
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);
        let level = ChunkLevel::exact(env.granule_words * 2).unwrap();

        let err = space.acquire(level, level.word_size(), &mut env).unwrap_err();
        assert_eq!(err, AllocError::CommitLimit { requested_words: level.word_size() });
        assert_eq!(space.pool.free_words(), level.word_size());
        assert_eq!(env.limiter.committed_words(), 0);
        space.verify();
    }

    #[test]
    fn enlarge_needs_free_follower() {
        let settings = settings().with_uncommit_free_chunks(false);
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);
        let level = ChunkLevel::SMALLEST;

        let mut a = space.acquire(level, 0, &mut env).unwrap();
        let mut b = space.acquire(level, 0, &mut env).unwrap();
        assert!(!space.enlarge_in_place(&mut a));
        // followers never enlarge
        assert!(!space.enlarge_in_place(&mut b));

        space.return_chunk(b, &mut env);
        assert!(space.enlarge_in_place(&mut a));
        assert_eq!(a.level(), level.merged());
        space.verify();

        space.return_chunk(a, &mut env);
        space.verify();
    }

    #[test]
    fn enlarge_into_unsliced_tail() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);

        let mut chunk = space.acquire(ChunkLevel::SMALLEST, 0, &mut env).unwrap();
        assert!(space.enlarge_in_place(&mut chunk));
        assert!(space.enlarge_in_place(&mut chunk));
        assert_eq!(chunk.level(), ChunkLevel::SMALLEST.merged().merged());
        assert_eq!(space.segments.get(0).sliced_words(), chunk.word_size());
        space.verify();

        space.return_chunk(chunk, &mut env);
        space.verify();
    }

    #[test]
    fn purge_releases_idle_segments() {
        let settings = settings();
        let mut env = env(&settings);
        let mut space = Space::growable(MetadataKind::NonClass, &settings);

        let chunks: Vec<_> = (0..3).map(|_| space.acquire(ChunkLevel::ROOT, 1, &mut env).unwrap()).collect();
        assert_eq!(space.segments.len(), 2);
        assert_eq!(space.purge(&mut env), 0);

        for chunk in chunks {
            space.return_chunk(chunk, &mut env);
        }
        assert_eq!(space.purge(&mut env), 1);
        assert_eq!(space.segments.len(), 1);
        assert_eq!(env.vm.reservation_count(), 1);
        space.verify();
    }
}
