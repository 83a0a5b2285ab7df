//! Track allocation counters for an arena.

/// Per-arena event counts, available with the `counters` feature.
///
/// Word counts use raw sizes, i.e. after alignment padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Total number of allocations.
    pub total_allocation_count: u64,

    /// Words held by live allocations.
    pub allocated_words: usize,
    /// Words ever allocated.
    pub total_allocated_words: u64,

    /// Number of requests that failed.
    pub failed_allocation_count: u64,
    /// Allocations served from deallocated blocks.
    pub free_block_hits: u64,

    /// Chunks acquired from the context.
    pub chunks_acquired: u64,
    /// Current chunks doubled in place.
    pub chunks_enlarged: u64,
    /// Allocations larger than a root chunk.
    pub oversized_count: u64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_words: 0,
            total_allocated_words: 0,
            failed_allocation_count: 0,
            free_block_hits: 0,
            chunks_acquired: 0,
            chunks_enlarged: 0,
            oversized_count: 0,
        }
    }

    /// Returns the total number of allocated words handed back.
    pub const fn total_freed_words(&self) -> u64 {
        self.total_allocated_words - self.allocated_words as u64
    }

    pub(crate) fn account_alloc(&mut self, words: usize) {
        self.allocation_count += 1;
        self.allocated_words += words;

        self.total_allocation_count += 1;
        self.total_allocated_words += words as u64;
    }

    pub(crate) fn account_dealloc(&mut self, words: usize) {
        self.allocation_count -= 1;
        self.allocated_words -= words;
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Counters) {
        self.allocation_count += other.allocation_count;
        self.total_allocation_count += other.total_allocation_count;
        self.allocated_words += other.allocated_words;
        self.total_allocated_words += other.total_allocated_words;
        self.failed_allocation_count += other.failed_allocation_count;
        self.free_block_hits += other.free_block_hits;
        self.chunks_acquired += other.chunks_acquired;
        self.chunks_enlarged += other.chunks_enlarged;
        self.oversized_count += other.oversized_count;
    }
}
