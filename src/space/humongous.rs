//! Requests larger than a root chunk.
//!
//! Such a request is served by a chain of contiguous root chunks. The last
//! link is split down to the smallest level still covering the remainder;
//! the split-off halves stay in the pool. Links are never split or
//! coalesced while chained.

use crate::error::AllocError;
use crate::level::{ChunkLevel, ROOT_CHUNK_WORDS};
use crate::vm::VirtualMemory;

use super::chunk::{ChunkId, ChunkState};
use super::{Chunk, Env, Space};

impl Space {
    fn take_free_roots(&mut self, count: usize) -> Option<Vec<ChunkId>> {
        let ids = self.pool.contiguous_roots(count)?;
        for &id in &ids {
            self.pool.remove(&mut self.slab, id);
            self.slab[id].state = ChunkState::InUse;
        }
        Some(ids)
    }

    /// Acquires committed, fully used chunks covering `words` contiguous words.
    pub fn acquire_chain<V: VirtualMemory>(
        &mut self,
        words: usize,
        env: &mut Env<V>,
    ) -> Result<Vec<Chunk>, AllocError> {
        let count = words.div_ceil(ROOT_CHUNK_WORDS);
        debug_assert!(count > 1);

        let fits = count.checked_mul(ROOT_CHUNK_WORDS).is_some_and(|w| w <= self.segments.max_reserved_words());
        if !fits {
            tracing::debug!(kind = self.kind().name(), words, "oversized allocation exceeds the address budget");
            return Err(self.address_space_error());
        }

        let ids = match self.take_free_roots(count) {
            Some(ids) => ids,
            None => match self.take_new(ChunkLevel::ROOT, count, env) {
                Ok(ids) => ids,
                Err(err) => self.take_free_roots(count).ok_or(err)?,
            },
        };

        let tail_words = words - (count - 1) * ROOT_CHUNK_WORDS;
        let tail_level = ChunkLevel::fitting(tail_words).expect("chain tail exceeds a root chunk");
        let last = ids[count - 1];
        self.split(last, tail_level);

        let mut chunks = Vec::with_capacity(count);
        for (i, &id) in ids.iter().enumerate() {
            let link_words = if id == last { tail_words } else { ROOT_CHUNK_WORDS };

            match self.hand_out(id, link_words, env) {
                Ok(mut chunk) => {
                    chunk.allocate(link_words);
                    chunks.push(chunk);
                }
                Err(err) => {
                    for chunk in chunks {
                        self.return_chunk(chunk, env);
                    }
                    for &rest in &ids[i + 1..] {
                        self.release_header(rest, env);
                    }
                    tracing::debug!(kind = self.kind().name(), words, %err, "oversized allocation failed");
                    return Err(err);
                }
            }
        }

        tracing::debug!(kind = self.kind().name(), words, links = count, ?tail_level, "oversized chain");
        self.scan_for_errors();
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::growth::MetadataKind;
    use crate::ptr_utils;
    use crate::settings::Settings;
    use crate::vm::HeapMemory;

    fn setup(budget_bytes: usize) -> (Space, Env<HeapMemory>) {
        let settings = Settings::default()
            .with_commit_granule_bytes(64 << 10)
            .with_segment_default_bytes(ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS * 4))
            .with_max_commit_budget(budget_bytes);
        let env = Env::new(HeapMemory::new(), &settings);
        (Space::growable(MetadataKind::NonClass, &settings), env)
    }

    #[test]
    fn chain_is_contiguous() {
        let (mut space, mut env) = setup(usize::MAX);
        let words = ROOT_CHUNK_WORDS * 2 + 1000;

        let chain = space.acquire_chain(words, &mut env).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].level(), ChunkLevel::ROOT);
        assert_eq!(chain[2].level(), ChunkLevel::fitting(1000).unwrap());
        assert_eq!(chain[2].used_words(), 1000);

        let base = super::super::chain_base(&chain).unwrap();
        let end = unsafe { ptr_utils::word_add(chain[2].base(), chain[2].used_words()) };
        assert_eq!(ptr_utils::word_offset(base, end), words);

        space.verify();
        for chunk in chain {
            space.return_chunk(chunk, &mut env);
        }
        space.verify();
        // three roots were sliced, the segment's fourth is untouched
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 3);
        assert_eq!(space.pool.free_count(), 3);
        assert_eq!(env.limiter.committed_words(), 0);
    }

    #[test]
    fn chain_reuses_free_roots() {
        let (mut space, mut env) = setup(usize::MAX);

        let chain = space.acquire_chain(ROOT_CHUNK_WORDS * 3, &mut env).unwrap();
        let first = chain[0].base();
        for chunk in chain {
            space.return_chunk(chunk, &mut env);
        }

        let chain = space.acquire_chain(ROOT_CHUNK_WORDS + 1, &mut env).unwrap();
        assert_eq!(chain[0].base(), first);
        assert_eq!(env.vm.reservation_count(), 1);
        for chunk in chain {
            space.return_chunk(chunk, &mut env);
        }
        space.verify();
    }

    #[test]
    fn chain_commit_failure_rolls_back() {
        let (mut space, mut env) = setup(ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS));

        let err = space.acquire_chain(ROOT_CHUNK_WORDS * 2, &mut env).unwrap_err();
        assert!(matches!(err, AllocError::CommitLimit { .. }));
        assert_eq!(env.limiter.committed_words(), 0);
        assert_eq!(space.pool.count_at(ChunkLevel::ROOT), 2);
        space.verify();
    }
}
