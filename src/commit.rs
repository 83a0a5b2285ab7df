//! Context-wide commit accounting.
//!
//! The [`CommitLimiter`] is pure arithmetic: segments ask it before
//! committing and report back after committing or uncommitting. Besides the
//! hard budget it tracks an optional collection threshold that callers raise
//! after a reclamation pass.

use crate::error::AllocError;
use crate::ptr_utils;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub(crate) struct CommitLimiter {
    committed_words: usize,
    max_words: usize,
    threshold_words: Option<usize>,
    min_expansion_words: usize,
    max_expansion_words: usize,
}

impl CommitLimiter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            committed_words: 0,
            max_words: settings.max_commit_budget / ptr_utils::WORD_SIZE,
            threshold_words: settings.gc_threshold_bytes.map(|b| b / ptr_utils::WORD_SIZE),
            min_expansion_words: ptr_utils::bytes_to_words(settings.min_expansion_bytes),
            max_expansion_words: ptr_utils::bytes_to_words(settings.max_expansion_bytes),
        }
    }

    #[inline]
    pub fn committed_words(&self) -> usize {
        self.committed_words
    }

    #[inline]
    pub fn max_words(&self) -> usize {
        self.max_words
    }

    #[inline]
    pub fn threshold_words(&self) -> Option<usize> {
        self.threshold_words
    }

    pub fn set_threshold_words(&mut self, words: Option<usize>) {
        self.threshold_words = words;
    }

    /// Words that may still be committed before either limit is hit.
    pub fn possible_expansion_words(&self) -> usize {
        let limit = match self.threshold_words {
            Some(threshold) => threshold.min(self.max_words),
            None => self.max_words,
        };
        limit.saturating_sub(self.committed_words)
    }

    /// Checks whether `words` more words may be committed.
    pub fn check(&self, words: usize) -> Result<(), AllocError> {
        let after = self.committed_words.saturating_add(words);
        if after > self.max_words {
            return Err(AllocError::CommitLimit { requested_words: words });
        }
        if let Some(threshold) = self.threshold_words {
            if after > threshold {
                return Err(AllocError::GcThreshold { requested_words: words });
            }
        }
        Ok(())
    }

    pub fn increase(&mut self, words: usize) {
        debug_assert!(self.committed_words + words <= self.max_words);
        self.committed_words += words;
    }

    pub fn decrease(&mut self, words: usize) {
        debug_assert!(words <= self.committed_words);
        self.committed_words -= words;
    }

    /// Step by which to raise the threshold so that `words` more words fit.
    pub fn expansion_delta(&self, words: usize, page_words: usize) -> usize {
        let delta = ptr_utils::align_up(words, page_words);
        if delta <= self.min_expansion_words {
            self.min_expansion_words
        } else if delta <= self.max_expansion_words {
            self.max_expansion_words
        } else {
            // leave headroom for the next allocation too
            delta + self.min_expansion_words
        }
    }

    /// Raises the threshold so that at least `words` more words may be
    /// committed. Returns the new threshold, or `None` if there is none.
    pub fn raise_threshold(&mut self, words: usize, page_words: usize) -> Option<usize> {
        let threshold = self.threshold_words?;
        let delta = self.expansion_delta(words, page_words);
        let raised = threshold.max(self.committed_words).saturating_add(delta).min(self.max_words);
        self.threshold_words = Some(raised);
        Some(raised)
    }
}
