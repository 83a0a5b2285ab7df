//! Per-loader bump allocation.
//!
//! An [`Arena`] owns a list of chunks, the last being the current chunk it
//! bumps into, plus a list of oversized chains. Deallocated blocks go to a
//! [`FreeBlocks`] list and are reused before bumping. Chunks only go back
//! to the context when the arena is released.
//!
//! Allocation runs under the owning handle's lock. The context's expansion
//! lock is only taken when the current chunk cannot serve a request from
//! already committed memory.

use core::ptr::NonNull;

use lock_api::RawMutex;

use crate::MetaWord;
use crate::context::MetaspaceContext;
use crate::error::AllocError;
use crate::growth::{GrowthPolicy, MetadataKind};
use crate::level::{ChunkLevel, ROOT_CHUNK_WORDS};
use crate::ptr_utils;
use crate::space::{self, Chunk, Env, Space};
use crate::stats::ArenaStats;
use crate::vm::VirtualMemory;

#[cfg(feature = "counters")]
use crate::counters::Counters;

mod free_blocks;

use free_blocks::{FreeBlocks, MIN_BLOCK_WORDS};

/// Pattern written over released memory in debug builds.
#[cfg(debug_assertions)]
const MANGLE_BYTE: u8 = 0xf5;

pub(crate) struct Arena {
    kind: MetadataKind,
    policy: GrowthPolicy,
    alignment_words: usize,
    enlarge_in_place: bool,

    /// Owned chunks. The last one is current.
    chunks: Vec<Chunk>,
    /// Links of oversized allocations, in acquisition order.
    oversized: Vec<Chunk>,
    free_blocks: FreeBlocks,
    /// Growth policy cursor: chunks acquired so far.
    steps: usize,
    /// Words lost to dark matter and unsplittable remainders.
    wasted_words: usize,

    #[cfg(feature = "counters")]
    counters: Counters,
}

impl Arena {
    pub fn new(kind: MetadataKind, policy: GrowthPolicy, alignment_words: usize, enlarge_in_place: bool) -> Self {
        debug_assert!(alignment_words.is_power_of_two());
        Self {
            kind,
            policy,
            alignment_words,
            enlarge_in_place,
            chunks: Vec::new(),
            oversized: Vec::new(),
            free_blocks: FreeBlocks::default(),
            steps: 0,
            wasted_words: 0,
            #[cfg(feature = "counters")]
            counters: Counters::new(),
        }
    }

    #[cfg(feature = "counters")]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Size actually taken from the arena for a request of `words`, or
    /// `None` if it does not fit the address space.
    #[inline]
    fn raw_word_size(&self, words: usize) -> Option<usize> {
        words.max(1).checked_next_multiple_of(self.alignment_words)
    }

    fn current(&mut self) -> Option<&mut Chunk> {
        self.chunks.last_mut()
    }

    pub fn allocate<V: VirtualMemory, R: RawMutex>(
        &mut self,
        words: usize,
        ctx: &MetaspaceContext<V, R>,
    ) -> Result<NonNull<MetaWord>, AllocError> {
        let raw = self.raw_word_size(words);
        let result = match raw {
            Some(raw) => self.allocate_raw(raw, ctx),
            None => match ctx.expansion().lock().space_mut(self.kind) {
                Ok((space, _)) => Err(space.address_space_error()),
                Err(err) => Err(err),
            },
        };

        #[cfg(feature = "counters")]
        match result {
            Ok(_) => self.counters.account_alloc(raw.unwrap_or(words)),
            Err(_) => self.counters.failed_allocation_count += 1,
        }

        result
    }

    fn allocate_raw<V: VirtualMemory, R: RawMutex>(
        &mut self,
        words: usize,
        ctx: &MetaspaceContext<V, R>,
    ) -> Result<NonNull<MetaWord>, AllocError> {
        if let Some(block) = self.allocate_from_free_blocks(words) {
            return Ok(block);
        }
        if words > ROOT_CHUNK_WORDS {
            return self.allocate_oversized(words, ctx);
        }

        match self.current() {
            Some(current) if current.free_below_committed_words() >= words => {
                let block = current.allocate(words);
                ctx.add_used(self.kind, words);
                Ok(block)
            }
            _ => {
                let mut expansion = ctx.expansion().lock();
                let (space, env) = expansion.space_mut(self.kind)?;
                self.allocate_slow(words, space, env, ctx)
            }
        }
    }

    fn allocate_from_free_blocks(&mut self, words: usize) -> Option<NonNull<MetaWord>> {
        if self.free_blocks.is_empty() {
            return None;
        }

        let (block, size) = self.free_blocks.remove_best_fit(words)?;
        let remainder = size - words;
        if remainder >= MIN_BLOCK_WORDS {
            self.free_blocks.add(unsafe { ptr_utils::word_add(block, words) }, remainder);
        } else {
            // too small to track, stays attached to the allocation
            self.wasted_words += remainder;
        }

        #[cfg(feature = "counters")]
        {
            self.counters.free_block_hits += 1;
        }
        Some(block)
    }

    /// Everything past the committed part of the current chunk.
    fn allocate_slow<V: VirtualMemory, R: RawMutex>(
        &mut self,
        words: usize,
        space: &mut Space,
        env: &mut Env<V>,
        ctx: &MetaspaceContext<V, R>,
    ) -> Result<NonNull<MetaWord>, AllocError> {
        let next_level = self.policy.level_at(self.steps);
        let enlarge = self.enlarge_in_place;

        if let Some(current) = self.chunks.last_mut() {
            let mut fits = current.free_words() >= words;
            if !fits && enlarge && Self::try_enlarge(current, words, next_level, space) {
                fits = true;
                #[cfg(feature = "counters")]
                {
                    self.counters.chunks_enlarged += 1;
                }
            }

            if fits {
                let target = current.used_words() + words;
                space.ensure_committed(current, target, env)?;
                let block = current.allocate(words);
                ctx.add_used(self.kind, words);
                return Ok(block);
            }
        }

        // a larger chunk than the policy asks for if the request needs it
        let level = match ChunkLevel::fitting(words) {
            Some(fitting) => fitting.min(next_level),
            None => unreachable!("oversized requests take the chain path"),
        };

        let mut chunk = space.acquire(level, words, env)?;
        self.steps += 1;

        if let Some(mut retired) = self.chunks.pop() {
            self.salvage(&mut retired, ctx);
            self.chunks.push(retired);
        }

        let block = chunk.allocate(words);
        ctx.add_used(self.kind, words);
        tracing::trace!(kind = self.kind.name(), ?chunk, step = self.steps, "new current chunk");
        self.chunks.push(chunk);

        #[cfg(feature = "counters")]
        {
            self.counters.chunks_acquired += 1;
        }
        Ok(block)
    }

    /// Attempts to double the current chunk so that `words` more words fit.
    fn try_enlarge(current: &mut Chunk, words: usize, next_level: ChunkLevel, space: &mut Space) -> bool {
        if current.level().is_root() {
            return false;
        }
        let enlarged = current.level().merged();
        // never larger than the chunk the policy would hand out next
        if enlarged < next_level {
            return false;
        }
        if current.used_words() + words > enlarged.word_size() {
            return false;
        }

        let enlarged = space.enlarge_in_place(current);
        if enlarged {
            tracing::trace!(?current, "enlarged chunk in place");
        }
        enlarged
    }

    /// Moves the committed, unused tail of a chunk to the free block list.
    fn salvage<V: VirtualMemory, R: RawMutex>(&mut self, chunk: &mut Chunk, ctx: &MetaspaceContext<V, R>) {
        let remaining = chunk.free_below_committed_words();
        if remaining == 0 {
            return;
        }

        let block = chunk.allocate(remaining);
        ctx.add_used(self.kind, remaining);
        mangle(block, remaining);

        if remaining >= MIN_BLOCK_WORDS {
            self.free_blocks.add(block, remaining);
        } else {
            self.wasted_words += remaining;
        }
    }

    fn allocate_oversized<V: VirtualMemory, R: RawMutex>(
        &mut self,
        words: usize,
        ctx: &MetaspaceContext<V, R>,
    ) -> Result<NonNull<MetaWord>, AllocError> {
        let mut chain = {
            let mut expansion = ctx.expansion().lock();
            let (space, env) = expansion.space_mut(self.kind)?;
            space.acquire_chain(words, env)?
        };

        let base = space::chain_base(&chain).expect("empty oversized chain");
        ctx.add_used(self.kind, chain.iter().map(Chunk::used_words).sum());

        if let Some(last) = chain.last_mut() {
            self.salvage(last, ctx);
        }
        self.oversized.append(&mut chain);

        #[cfg(feature = "counters")]
        {
            self.counters.oversized_count += 1;
        }
        Ok(base)
    }

    /// Hands a block back for reuse by this arena.
    ///
    /// # Safety
    /// `block` must have been allocated by this arena with the same `words`
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, block: NonNull<MetaWord>, words: usize) {
        let Some(words) = self.raw_word_size(words) else {
            debug_assert!(false, "{block:p} spans more than the address space");
            return;
        };
        debug_assert!(self.holds_allocation(block, words), "{block:p} was not allocated by this arena");

        mangle(block, words);

        #[cfg(feature = "counters")]
        self.counters.account_dealloc(words);

        if words < MIN_BLOCK_WORDS {
            // dark matter
            self.wasted_words += words;
            return;
        }
        self.free_blocks.add(block, words);
    }

    /// Whether `words` words at `block` lie within used memory of one chunk
    /// or of one contiguous oversized chain.
    fn holds_allocation(&self, block: NonNull<MetaWord>, words: usize) -> bool {
        if self.chunks.iter().any(|c| c.is_in_used_range(block.as_ptr(), words)) {
            return true;
        }

        let start = block.as_ptr() as usize;
        let end = start + ptr_utils::words_to_bytes(words);
        let mut covered = start;
        for link in &self.oversized {
            let base = link.base().as_ptr() as usize;
            let used_end = base + ptr_utils::words_to_bytes(link.used_words());
            if (base..used_end).contains(&covered) {
                covered = used_end;
                if end <= covered {
                    return true;
                }
            }
        }
        false
    }

    pub fn owns(&self, ptr: *const MetaWord) -> bool {
        self.chunks.iter().chain(&self.oversized).any(|c| c.contains(ptr))
    }

    pub fn used_words(&self) -> usize {
        self.chunks.iter().chain(&self.oversized).map(Chunk::used_words).sum()
    }

    pub fn committed_words(&self) -> usize {
        self.chunks.iter().chain(&self.oversized).map(Chunk::committed_words).sum()
    }

    pub fn capacity_words(&self) -> usize {
        self.chunks.iter().chain(&self.oversized).map(Chunk::word_size).sum()
    }

    /// Hands every chunk back to the context.
    ///
    /// Takes the expansion lock once per chunk.
    pub fn release<V: VirtualMemory, R: RawMutex>(&mut self, ctx: &MetaspaceContext<V, R>) {
        let used = self.used_words();
        let chunks = self.chunks.len() + self.oversized.len();

        for chunk in self.chunks.drain(..).chain(self.oversized.drain(..)) {
            let mut expansion = ctx.expansion().lock();
            ctx.sub_used(self.kind, chunk.used_words());
            match expansion.space_mut(self.kind) {
                Ok((space, env)) => space.return_chunk(chunk, env),
                Err(_) => unreachable!("arena holds chunks of a missing space"),
            }
        }

        self.free_blocks = FreeBlocks::default();
        self.steps = 0;
        self.wasted_words = 0;

        if chunks > 0 {
            tracing::debug!(kind = self.kind.name(), chunks, used, "released arena");
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats::empty(self.kind);
        for chunk in &self.chunks {
            stats.chunks_by_level[chunk.level().index()] += 1;
        }

        stats.chunk_count = self.chunks.len();
        stats.oversized_links = self.oversized.len();
        stats.capacity_words = self.capacity_words();
        stats.committed_words = self.committed_words();
        stats.used_words = self.used_words();
        stats.free_block_words = self.free_blocks.total_words();
        stats.free_block_count = self.free_blocks.count();
        stats.wasted_words = self.wasted_words;
        stats
    }

    /// Panics if the chunks or free blocks are inconsistent.
    pub fn verify(&self) {
        for chunk in self.chunks.iter().chain(&self.oversized) {
            assert!(chunk.used_words() <= chunk.committed_words(), "{chunk:?} used past committed");
            assert!(chunk.committed_words() <= chunk.word_size(), "{chunk:?} committed past its end");
        }
        for chunk in self.chunks.iter().rev().skip(1) {
            assert_eq!(chunk.free_below_committed_words(), 0, "{chunk:?} retired without salvage");
        }

        let mut free_words = 0;
        for (block, words) in self.free_blocks.iter() {
            assert!(words >= MIN_BLOCK_WORDS);
            assert!(self.owns(block.as_ptr()), "free block {block:p} outside the arena");
            free_words += words;
        }
        assert_eq!(free_words, self.free_blocks.total_words());

        let stats = self.stats();
        assert!(stats.used_words <= stats.committed_words);
        assert!(stats.committed_words <= stats.capacity_words);
        assert!(stats.free_block_words + stats.wasted_words <= stats.used_words);
    }
}

#[inline]
fn mangle(block: NonNull<MetaWord>, words: usize) {
    #[cfg(debug_assertions)]
    unsafe {
        block.as_ptr().cast::<u8>().write_bytes(MANGLE_BYTE, ptr_utils::words_to_bytes(words));
    }
    #[cfg(not(debug_assertions))]
    let _ = (block, words);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::growth::{GrowthPolicyTable, SpaceType};
    use crate::settings::Settings;
    use crate::test_utils::{TestContext, test_context};

    fn arena(ctx: &Arc<TestContext>, kind: MetadataKind, space_type: SpaceType) -> Arena {
        let settings = ctx.settings();
        Arena::new(
            kind,
            settings.growth_policies.get(space_type, kind).clone(),
            settings.alignment_words(kind),
            settings.enlarge_chunks_in_place,
        )
    }

    #[test]
    fn first_allocation_smallest_chunk() {
        let ctx = test_context(Settings::default());
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Reflection);

        arena.allocate(1, &ctx).unwrap();
        assert_eq!(arena.capacity_words(), ChunkLevel::SMALLEST.word_size());
        assert_eq!(arena.committed_words(), ChunkLevel::SMALLEST.word_size());
        assert_eq!(arena.used_words(), 1);

        arena.release(&ctx);
        ctx.verify();
    }

    #[test]
    fn deallocated_block_is_reused() {
        let ctx = test_context(Settings::default());
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Standard);

        arena.allocate(3, &ctx).unwrap();
        let block = arena.allocate(12, &ctx).unwrap();
        let before = arena.stats();

        unsafe { arena.deallocate(block, 12) };
        assert_eq!(arena.allocate(12, &ctx).unwrap(), block);

        let after = arena.stats();
        assert_eq!(before.capacity_words, after.capacity_words);
        assert_eq!(before.committed_words, after.committed_words);
        assert_eq!(after.free_block_count, 0);

        // a smaller request splits the block, keeping the remainder
        unsafe { arena.deallocate(block, 12) };
        assert_eq!(arena.allocate(5, &ctx).unwrap(), block);
        assert_eq!(arena.stats().free_block_words, 7);

        arena.verify();
        arena.release(&ctx);
    }

    #[test]
    fn dark_matter() {
        let ctx = test_context(Settings::default());
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Standard);

        let block = arena.allocate(1, &ctx).unwrap();
        unsafe { arena.deallocate(block, 1) };
        assert_eq!(arena.stats().free_block_count, 0);
        assert_eq!(arena.stats().wasted_words, 1);
        assert_eq!(arena.stats().live_words(), 0);

        arena.release(&ctx);
    }

    #[test]
    fn exhausted_chunk_is_retired_and_salvaged() {
        let settings = Settings::default()
            .with_enlarge_chunks_in_place(false)
            .with_growth_policies(GrowthPolicyTable::uniform(GrowthPolicy::constant(ChunkLevel::SMALLEST)));
        let ctx = test_context(settings);
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Standard);
        let chunk_words = ChunkLevel::SMALLEST.word_size();

        arena.allocate(chunk_words - 10, &ctx).unwrap();
        arena.allocate(20, &ctx).unwrap();

        let stats = arena.stats();
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.capacity_words, chunk_words * 2);
        // the old chunk's 10-word tail now sits in the free block list
        assert_eq!(stats.free_block_words, 10);
        assert_eq!(arena.allocate(10, &ctx).unwrap(), unsafe {
            ptr_utils::word_add(arena.chunks[0].base(), chunk_words - 10)
        });

        arena.verify();
        arena.release(&ctx);
        ctx.verify();
    }

    #[test]
    fn exhausted_chunk_is_enlarged() {
        let settings = Settings::default().with_growth_policies(GrowthPolicyTable::uniform(
            GrowthPolicy::new(&[ChunkLevel::SMALLEST, ChunkLevel::SMALLEST.merged()]).unwrap(),
        ));
        let ctx = test_context(settings);
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Standard);
        let chunk_words = ChunkLevel::SMALLEST.word_size();

        let first = arena.allocate(chunk_words - 10, &ctx).unwrap();
        let second = arena.allocate(20, &ctx).unwrap();

        let stats = arena.stats();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.capacity_words, chunk_words * 2);
        assert_eq!(ptr_utils::word_offset(first, second), chunk_words - 10);

        arena.verify();
        arena.release(&ctx);
        ctx.verify();
    }

    #[test]
    fn class_alignment() {
        let settings = Settings::default()
            .with_class_space_bytes(Some(ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS)))
            .with_class_alignment_words(4);
        let ctx = test_context(settings);
        let mut arena = arena(&ctx, MetadataKind::Class, SpaceType::Standard);

        for words in [1, 3, 5, 8, 13] {
            let block = arena.allocate(words, &ctx).unwrap();
            assert!(ptr_utils::is_aligned_to(block.as_ptr().cast(), 4 * ptr_utils::WORD_SIZE));
        }
        assert_eq!(arena.used_words(), 4 + 4 + 8 + 8 + 16);

        arena.release(&ctx);
    }

    #[test]
    fn oversized_allocation() {
        let ctx = test_context(Settings::default());
        let mut arena = arena(&ctx, MetadataKind::NonClass, SpaceType::Standard);
        let words = ROOT_CHUNK_WORDS * 2 + 5;

        let block = arena.allocate(words, &ctx).unwrap();
        unsafe { block.as_ptr().add(words - 1).write(0xdead) };

        let stats = arena.stats();
        assert_eq!(stats.oversized_links, 3);
        assert_eq!(stats.chunk_count, 0);
        assert!(arena.owns(unsafe { block.as_ptr().add(words - 1) }));
        // the last link's committed tail is reusable
        assert!(stats.free_block_words > 0);
        let small = arena.allocate(4, &ctx).unwrap();
        assert!(small > block);

        arena.verify();
        arena.release(&ctx);
        ctx.verify();
    }
}
