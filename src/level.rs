//! Chunk size classes.
//!
//! Chunks are power-of-two sized, from the root chunk at level 0 down to
//! the smallest chunk at [`ChunkLevel::SMALLEST`]. Each level halves the
//! size of the previous one.

use core::fmt;

/// Words in a root chunk (4 MiB with 8-byte words).
pub const ROOT_CHUNK_WORDS: usize = 1 << ROOT_CHUNK_WORDS_LOG2;
const ROOT_CHUNK_WORDS_LOG2: u32 = 19;

/// Words in the smallest chunk (1 KiB with 8-byte words).
pub const MIN_CHUNK_WORDS: usize = ROOT_CHUNK_WORDS >> (NUM_LEVELS - 1);

/// Number of distinct chunk levels.
pub const NUM_LEVELS: usize = 13;

/// A chunk size class. Lower levels are larger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkLevel(u8);

impl ChunkLevel {
    pub const ROOT: Self = Self(0);
    pub const SMALLEST: Self = Self(NUM_LEVELS as u8 - 1);

    pub const fn new(raw: u8) -> Option<Self> {
        if (raw as usize) < NUM_LEVELS { Some(Self(raw)) } else { None }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Size in words of a chunk at this level.
    #[inline]
    pub const fn word_size(self) -> usize {
        ROOT_CHUNK_WORDS >> self.0
    }

    /// The smallest level whose chunks hold at least `words` words,
    /// or `None` if `words` exceeds a root chunk.
    pub const fn fitting(words: usize) -> Option<Self> {
        if words > ROOT_CHUNK_WORDS {
            return None;
        }
        if words <= MIN_CHUNK_WORDS {
            return Some(Self::SMALLEST);
        }
        let ceil_log2 = usize::BITS - (words - 1).leading_zeros();
        Some(Self((ROOT_CHUNK_WORDS_LOG2 - ceil_log2) as u8))
    }

    /// The level whose chunks are exactly `words` words, if any.
    pub const fn exact(words: usize) -> Option<Self> {
        if !words.is_power_of_two() || words < MIN_CHUNK_WORDS || words > ROOT_CHUNK_WORDS {
            return None;
        }
        Some(Self((ROOT_CHUNK_WORDS_LOG2 - words.trailing_zeros()) as u8))
    }

    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_smallest(self) -> bool {
        self.0 == Self::SMALLEST.0
    }

    /// Level of the halves this chunk splits into.
    #[inline]
    pub fn split(self) -> Self {
        debug_assert!(!self.is_smallest());
        Self(self.0 + 1)
    }

    /// Level of the chunk two buddies at this level merge into.
    #[inline]
    pub fn merged(self) -> Self {
        debug_assert!(!self.is_root());
        Self(self.0 - 1)
    }

    /// All levels, largest chunks first.
    pub fn all() -> impl DoubleEndedIterator<Item = Self> + ExactSizeIterator {
        (0..NUM_LEVELS as u8).map(Self)
    }
}

impl fmt::Debug for ChunkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lv{:02}", self.0)
    }
}

impl fmt::Display for ChunkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = crate::ptr_utils::words_to_bytes(self.word_size());
        if bytes >= 1 << 20 {
            write!(f, "{}M", bytes >> 20)
        } else {
            write!(f, "{}K", bytes >> 10)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes() {
        assert_eq!(ChunkLevel::ROOT.word_size(), ROOT_CHUNK_WORDS);
        assert_eq!(ChunkLevel::SMALLEST.word_size(), MIN_CHUNK_WORDS);
        assert_eq!(MIN_CHUNK_WORDS, 128);

        for level in ChunkLevel::all() {
            assert_eq!(ChunkLevel::exact(level.word_size()), Some(level));
            assert_eq!(ChunkLevel::fitting(level.word_size()), Some(level));
            if !level.is_root() {
                assert_eq!(ChunkLevel::fitting(level.word_size() + 1), Some(level.merged()));
                assert_eq!(level.merged().word_size(), level.word_size() * 2);
            }
        }
    }

    #[test]
    fn fitting_edges() {
        assert_eq!(ChunkLevel::fitting(0), Some(ChunkLevel::SMALLEST));
        assert_eq!(ChunkLevel::fitting(1), Some(ChunkLevel::SMALLEST));
        assert_eq!(ChunkLevel::fitting(ROOT_CHUNK_WORDS + 1), None);
        assert_eq!(ChunkLevel::exact(100), None);
        assert_eq!(ChunkLevel::exact(64), None);
        assert_eq!(ChunkLevel::new(NUM_LEVELS as u8), None);
    }
}
