//! Configuration of a [`MetaspaceContext`](crate::MetaspaceContext).

use crate::error::SettingsError;
use crate::growth::{GrowthPolicy, GrowthPolicyTable, MetadataKind, SpaceType};
use crate::level::{ROOT_CHUNK_WORDS, MIN_CHUNK_WORDS};
use crate::ptr_utils::{self, words_to_bytes};

const ROOT_CHUNK_BYTES: usize = words_to_bytes(ROOT_CHUNK_WORDS);

/// Context-wide options. Sizes are in bytes.
///
/// ```
/// # use metaspace::Settings;
/// let settings = Settings::default()
///     .with_commit_granule_bytes(16 << 10)
///     .with_max_commit_budget(64 << 20)
///     .with_class_space_bytes(Some(8 << 20));
/// assert!(settings.validate(4096).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Unit of commit and uncommit. A power of two multiple of the page size,
    /// no larger than a root chunk.
    pub commit_granule_bytes: usize,
    /// Size of each non-class segment reservation. A multiple of the root chunk size.
    pub segment_default_bytes: usize,
    /// Upper bound on address space reserved for non-class segments.
    pub max_address_budget: usize,
    /// Upper bound on memory committed across the whole context.
    pub max_commit_budget: usize,
    /// Initial collection threshold. `None` disables it.
    pub gc_threshold_bytes: Option<usize>,
    /// Smallest step by which the collection threshold is raised.
    pub min_expansion_bytes: usize,
    /// Step by which the collection threshold is raised when the minimum is not enough.
    pub max_expansion_bytes: usize,
    /// Size of the fixed class space. `None` means no class arenas.
    pub class_space_bytes: Option<usize>,
    /// Alignment of class allocations, in words.
    pub class_alignment_words: usize,
    /// Chunk level sequence per space type and metadata kind.
    pub growth_policies: GrowthPolicyTable,
    /// Let arenas double their current chunk by merging with a free buddy.
    pub enlarge_chunks_in_place: bool,
    /// Uncommit chunks that return to the pool once they cover whole granules.
    pub uncommit_free_chunks: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            commit_granule_bytes: 64 << 10,
            segment_default_bytes: 16 << 20,
            max_address_budget: usize::MAX,
            max_commit_budget: usize::MAX,
            gc_threshold_bytes: None,
            min_expansion_bytes: 256 << 10,
            max_expansion_bytes: 4 << 20,
            class_space_bytes: None,
            class_alignment_words: 1,
            growth_policies: GrowthPolicyTable::default(),
            enlarge_chunks_in_place: true,
            uncommit_free_chunks: true,
        }
    }
}

impl Settings {
    pub fn with_commit_granule_bytes(mut self, bytes: usize) -> Self {
        self.commit_granule_bytes = bytes;
        self
    }

    pub fn with_segment_default_bytes(mut self, bytes: usize) -> Self {
        self.segment_default_bytes = bytes;
        self
    }

    pub fn with_max_address_budget(mut self, bytes: usize) -> Self {
        self.max_address_budget = bytes;
        self
    }

    pub fn with_max_commit_budget(mut self, bytes: usize) -> Self {
        self.max_commit_budget = bytes;
        self
    }

    pub fn with_gc_threshold_bytes(mut self, bytes: Option<usize>) -> Self {
        self.gc_threshold_bytes = bytes;
        self
    }

    pub fn with_expansion_bytes(mut self, min: usize, max: usize) -> Self {
        self.min_expansion_bytes = min;
        self.max_expansion_bytes = max;
        self
    }

    pub fn with_class_space_bytes(mut self, bytes: Option<usize>) -> Self {
        self.class_space_bytes = bytes;
        self
    }

    pub fn with_class_alignment_words(mut self, words: usize) -> Self {
        self.class_alignment_words = words;
        self
    }

    pub fn with_growth_policy(
        mut self,
        space_type: SpaceType,
        kind: MetadataKind,
        policy: GrowthPolicy,
    ) -> Self {
        self.growth_policies.set(space_type, kind, policy);
        self
    }

    pub fn with_growth_policies(mut self, table: GrowthPolicyTable) -> Self {
        self.growth_policies = table;
        self
    }

    pub fn with_enlarge_chunks_in_place(mut self, enabled: bool) -> Self {
        self.enlarge_chunks_in_place = enabled;
        self
    }

    pub fn with_uncommit_free_chunks(mut self, enabled: bool) -> Self {
        self.uncommit_free_chunks = enabled;
        self
    }

    /// Checks the settings against the virtual memory backend's `page_size`.
    pub fn validate(&self, page_size: usize) -> Result<(), SettingsError> {
        let granule = self.commit_granule_bytes;
        if !granule.is_power_of_two()
            || granule < page_size
            || granule % page_size != 0
            || granule > ROOT_CHUNK_BYTES
        {
            return Err(SettingsError::CommitGranule { bytes: granule });
        }

        let segment = self.segment_default_bytes;
        if segment == 0 || segment % ROOT_CHUNK_BYTES != 0 {
            return Err(SettingsError::SegmentSize { bytes: segment });
        }

        if let Some(class) = self.class_space_bytes {
            if class == 0 || class % ROOT_CHUNK_BYTES != 0 {
                return Err(SettingsError::ClassSpaceSize { bytes: class });
            }
        }

        let align = self.class_alignment_words;
        if !align.is_power_of_two() || align > MIN_CHUNK_WORDS {
            return Err(SettingsError::ClassAlignment { words: align });
        }

        if self.min_expansion_bytes > self.max_expansion_bytes {
            return Err(SettingsError::Expansion {
                min_bytes: self.min_expansion_bytes,
                max_bytes: self.max_expansion_bytes,
            });
        }

        Ok(())
    }

    pub(crate) fn granule_words(&self) -> usize {
        ptr_utils::bytes_to_words(self.commit_granule_bytes)
    }

    pub(crate) fn segment_default_words(&self) -> usize {
        ptr_utils::bytes_to_words(self.segment_default_bytes)
    }

    pub(crate) fn alignment_words(&self, kind: MetadataKind) -> usize {
        match kind {
            MetadataKind::NonClass => 1,
            MetadataKind::Class => self.class_alignment_words,
        }
    }
}
