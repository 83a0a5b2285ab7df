//! Per-segment record of which commit granules are committed.
//!
//! A granule bit is the commit state shared by every chunk overlapping the
//! granule. Chunks at least one granule large own their granules outright;
//! smaller chunks share one.

use core::ops::Range;

const BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub(crate) struct CommitMask {
    bits: Vec<u64>,
    granules: usize,
    granule_words: usize,
}

impl CommitMask {
    pub fn new(reserved_words: usize, granule_words: usize) -> Self {
        debug_assert!(reserved_words % granule_words == 0);
        let granules = reserved_words / granule_words;
        Self { bits: vec![0; (granules + BITS - 1) / BITS], granules, granule_words }
    }

    #[inline]
    pub fn granule_words(&self) -> usize {
        self.granule_words
    }

    #[inline]
    fn is_set(&self, granule: usize) -> bool {
        self.bits[granule / BITS] & (1 << (granule % BITS)) != 0
    }

    #[inline]
    fn set(&mut self, granule: usize, committed: bool) {
        let bit = 1 << (granule % BITS);
        if committed {
            self.bits[granule / BITS] |= bit;
        } else {
            self.bits[granule / BITS] &= !bit;
        }
    }

    /// Granules overlapping a word range.
    #[inline]
    pub fn granules_of(&self, words: Range<usize>) -> Range<usize> {
        debug_assert!(words.start < words.end);
        let first = words.start / self.granule_words;
        let last = (words.end - 1) / self.granule_words;
        debug_assert!(last < self.granules);
        first..last + 1
    }

    pub fn count_uncommitted(&self, granules: Range<usize>) -> usize {
        granules.filter(|&g| !self.is_set(g)).count()
    }

    /// Maximal runs of granules in `granules` whose state differs from `committed`.
    pub fn runs_not_in_state(&self, granules: Range<usize>, committed: bool) -> Vec<Range<usize>> {
        let mut runs = Vec::new();
        let mut run_start = None;

        for g in granules.clone() {
            match (self.is_set(g) != committed, run_start) {
                (true, None) => run_start = Some(g),
                (false, Some(start)) => {
                    runs.push(start..g);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push(start..granules.end);
        }
        runs
    }

    pub fn mark(&mut self, granules: Range<usize>, committed: bool) {
        for g in granules {
            self.set(g, committed);
        }
    }

    /// Length in words of the committed prefix of `words`.
    ///
    /// A range within a single granule is either wholly committed or not.
    pub fn committed_prefix(&self, words: Range<usize>) -> usize {
        let len = words.end - words.start;
        let mut prefix = 0;
        for g in self.granules_of(words.clone()) {
            if !self.is_set(g) {
                break;
            }
            prefix = (g + 1) * self.granule_words - words.start;
        }
        prefix.min(len)
    }

    /// Total committed granules.
    pub fn committed_granules(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}
