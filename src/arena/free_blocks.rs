//! Deallocated blocks awaiting reuse within one arena.
//!
//! Blocks are indexed by size for best-fit lookup. The index lives outside
//! the blocks, so blocks of any size can be tracked; the minimum only keeps
//! it from filling up with unusable slivers. Debug builds mangle block
//! memory before it is added here.

use core::ptr::NonNull;
use std::collections::BTreeMap;

use crate::MetaWord;

/// Smallest block worth keeping. Anything smaller is dark matter.
pub(crate) const MIN_BLOCK_WORDS: usize = 2;

#[derive(Debug, Default)]
pub(crate) struct FreeBlocks {
    by_size: BTreeMap<usize, Vec<NonNull<MetaWord>>>,
    /// Start address to size, for overlap detection.
    #[cfg(debug_assertions)]
    by_address: BTreeMap<usize, usize>,
    count: usize,
    words: usize,
}

// block memory belongs to the owning arena
unsafe impl Send for FreeBlocks {}

impl FreeBlocks {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn total_words(&self) -> usize {
        self.words
    }

    pub fn add(&mut self, block: NonNull<MetaWord>, words: usize) {
        debug_assert!(words >= MIN_BLOCK_WORDS);

        #[cfg(debug_assertions)]
        {
            let start = block.as_ptr() as usize;
            let end = start + crate::ptr_utils::words_to_bytes(words);
            if let Some((&prev, &prev_words)) = self.by_address.range(..=start).next_back() {
                assert!(
                    prev + crate::ptr_utils::words_to_bytes(prev_words) <= start,
                    "block {block:p} overlaps a free block: double deallocation?"
                );
            }
            if let Some((&next, _)) = self.by_address.range(start..).next() {
                assert!(end <= next, "block {block:p} overlaps a free block: double deallocation?");
            }
            self.by_address.insert(start, words);
        }

        self.by_size.entry(words).or_default().push(block);
        self.count += 1;
        self.words += words;
    }

    /// Removes the smallest block of at least `words` words.
    /// Returns the block and its full size.
    pub fn remove_best_fit(&mut self, words: usize) -> Option<(NonNull<MetaWord>, usize)> {
        let (&size, list) = self.by_size.range_mut(words..).next()?;
        let block = list.pop()?;
        if list.is_empty() {
            self.by_size.remove(&size);
        }

        #[cfg(debug_assertions)]
        self.by_address.remove(&(block.as_ptr() as usize));

        self.count -= 1;
        self.words -= size;
        Some((block, size))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NonNull<MetaWord>, usize)> + '_ {
        self.by_size.iter().flat_map(|(&size, list)| list.iter().map(move |&b| (b, size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr_utils::word_add;

    #[test]
    fn best_fit() {
        let mut buf = vec![0usize; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut blocks = FreeBlocks::default();

        unsafe {
            blocks.add(base, 8);
            blocks.add(word_add(base, 10), 4);
            blocks.add(word_add(base, 20), 16);
        }
        assert_eq!(blocks.count(), 3);
        assert_eq!(blocks.total_words(), 28);

        assert_eq!(blocks.remove_best_fit(3), Some((unsafe { word_add(base, 10) }, 4)));
        assert_eq!(blocks.remove_best_fit(5), Some((base, 8)));
        assert_eq!(blocks.remove_best_fit(17), None);
        assert_eq!(blocks.remove_best_fit(16).map(|(_, w)| w), Some(16));
        assert!(blocks.is_empty());
        assert_eq!(blocks.total_words(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double deallocation")]
    fn double_free_detected() {
        let mut buf = vec![0usize; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut blocks = FreeBlocks::default();

        blocks.add(base, 8);
        blocks.add(unsafe { word_add(base, 4) }, 8);
    }
}
