//! Usage numbers and statistics reports.

use core::fmt;

use crate::growth::{MetadataKind, SpaceType};
use crate::level::{ChunkLevel, NUM_LEVELS};
use crate::ptr_utils::words_to_bytes;

/// Used, committed and reserved words.
///
/// `used <= committed <= reserved` holds for every snapshot taken under
/// the expansion lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Words handed out by arenas, including their free and wasted blocks.
    pub used_words: usize,
    pub committed_words: usize,
    pub reserved_words: usize,
}

impl Usage {
    pub fn used_bytes(&self) -> usize {
        words_to_bytes(self.used_words)
    }

    pub fn committed_bytes(&self) -> usize {
        words_to_bytes(self.committed_words)
    }

    pub fn reserved_bytes(&self) -> usize {
        words_to_bytes(self.reserved_words)
    }
}

impl core::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            used_words: self.used_words + rhs.used_words,
            committed_words: self.committed_words + rhs.committed_words,
            reserved_words: self.reserved_words + rhs.reserved_words,
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used {}K, committed {}K, reserved {}K",
            self.used_bytes() >> 10,
            self.committed_bytes() >> 10,
            self.reserved_bytes() >> 10
        )
    }
}

/// Snapshot of one space's segments and free chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpaceStats {
    pub reserved_words: usize,
    pub committed_words: usize,
    pub segments: usize,
    /// Words in free chunks.
    pub free_words: usize,
    pub free_chunks: usize,
    /// Free chunk count, indexed by level.
    pub free_chunks_by_level: [usize; NUM_LEVELS],
    /// Committed words within free chunks.
    pub free_committed_words: usize,
}

impl fmt::Display for SpaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} segments, reserved {}K, committed {}K",
            self.segments,
            words_to_bytes(self.reserved_words) >> 10,
            words_to_bytes(self.committed_words) >> 10
        )?;
        write!(
            f,
            "{} free chunks, {}K ({}K committed):",
            self.free_chunks,
            words_to_bytes(self.free_words) >> 10,
            words_to_bytes(self.free_committed_words) >> 10
        )?;
        for level in ChunkLevel::all() {
            let count = self.free_chunks_by_level[level.index()];
            if count > 0 {
                write!(f, " {level}:{count}")?;
            }
        }
        Ok(())
    }
}

/// Snapshot of one arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    pub kind: MetadataKind,
    /// Owned chunk count, indexed by level. Oversized links are not included.
    pub chunks_by_level: [usize; NUM_LEVELS],
    pub chunk_count: usize,
    pub oversized_links: usize,
    /// Words in all owned chunks.
    pub capacity_words: usize,
    pub committed_words: usize,
    /// Words bumped off chunks.
    pub used_words: usize,
    /// Deallocated words awaiting reuse.
    pub free_block_words: usize,
    pub free_block_count: usize,
    /// Words lost to dark matter and unsplittable remainders.
    pub wasted_words: usize,
}

impl ArenaStats {
    pub(crate) fn empty(kind: MetadataKind) -> Self {
        Self {
            kind,
            chunks_by_level: [0; NUM_LEVELS],
            chunk_count: 0,
            oversized_links: 0,
            capacity_words: 0,
            committed_words: 0,
            used_words: 0,
            free_block_words: 0,
            free_block_count: 0,
            wasted_words: 0,
        }
    }

    /// Words in live allocations.
    pub fn live_words(&self) -> usize {
        self.used_words - self.free_block_words - self.wasted_words
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} chunks", self.kind.name(), self.chunk_count)?;
        if self.chunk_count > 0 {
            write!(f, " (")?;
            let mut first = true;
            for level in ChunkLevel::all() {
                let count = self.chunks_by_level[level.index()];
                if count > 0 {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{level}:{count}")?;
                    first = false;
                }
            }
            write!(f, ")")?;
        }
        if self.oversized_links > 0 {
            write!(f, ", {} oversized links", self.oversized_links)?;
        }
        write!(
            f,
            ", capacity {}, committed {}, used {}, free blocks {} ({}), waste {}",
            self.capacity_words,
            self.committed_words,
            self.used_words,
            self.free_block_words,
            self.free_block_count,
            self.wasted_words
        )
    }
}

/// Snapshot of both arenas of a [`Metaspace`](crate::Metaspace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaspaceStats {
    pub space_type: SpaceType,
    pub non_class: ArenaStats,
    pub class: Option<ArenaStats>,
}

impl MetaspaceStats {
    /// Usage summed over both arenas. Reserved words are the chunk capacity.
    pub fn usage(&self) -> Usage {
        self.arenas()
            .map(|a| Usage {
                used_words: a.used_words,
                committed_words: a.committed_words,
                reserved_words: a.capacity_words,
            })
            .fold(Usage::default(), |sum, u| sum + u)
    }

    pub fn arenas(&self) -> impl Iterator<Item = &ArenaStats> {
        core::iter::once(&self.non_class).chain(self.class.as_ref())
    }
}

impl fmt::Display for MetaspaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} metaspace", self.space_type)?;
        for arena in self.arenas() {
            write!(f, "\n  {arena}")?;
        }
        Ok(())
    }
}

/// Snapshot of a whole [`MetaspaceContext`](crate::MetaspaceContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStats {
    pub non_class: SpaceStats,
    pub class: Option<SpaceStats>,
    /// Used words per kind, indexed by [`MetadataKind`] order.
    pub used_words: [usize; 2],
    pub committed_words: usize,
    pub commit_limit_words: usize,
    pub gc_threshold_words: Option<usize>,
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "non-class space: {} words used", self.used_words[0])?;
        writeln!(f, "{}", self.non_class)?;
        if let Some(class) = &self.class {
            writeln!(f, "class space: {} words used", self.used_words[1])?;
            writeln!(f, "{class}")?;
        }
        write!(f, "committed {}K", words_to_bytes(self.committed_words) >> 10)?;
        if self.commit_limit_words != usize::MAX / crate::ptr_utils::WORD_SIZE {
            write!(f, " of {}K", words_to_bytes(self.commit_limit_words) >> 10)?;
        }
        if let Some(threshold) = self.gc_threshold_words {
            write!(f, ", collection threshold {}K", words_to_bytes(threshold) >> 10)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_display() {
        let usage = Usage { used_words: 128, committed_words: 1024, reserved_words: 1 << 20 };
        assert_eq!(usage.to_string(), "used 1K, committed 8K, reserved 8192K");

        let sum = usage + usage;
        assert_eq!(sum.committed_words, 2048);
    }

    #[test]
    fn arena_stats_display() {
        let mut stats = ArenaStats::empty(MetadataKind::Class);
        assert_eq!(
            stats.to_string(),
            "class: 0 chunks, capacity 0, committed 0, used 0, free blocks 0 (0), waste 0"
        );

        stats.chunk_count = 3;
        stats.chunks_by_level[ChunkLevel::SMALLEST.index()] = 2;
        stats.chunks_by_level[ChunkLevel::ROOT.index()] = 1;
        assert!(stats.to_string().starts_with("class: 3 chunks (4M:1 1K:2)"));
    }
}
