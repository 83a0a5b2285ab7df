use core::ptr::NonNull;
use std::alloc::{self, Layout};

use super::VirtualMemory;

const PAGE_SIZE: usize = 4096;

/// Portable [`VirtualMemory`] over the global allocator.
///
/// Reservations are ordinary aligned heap allocations, so commit and uncommit
/// only do bookkeeping. Useful for tests, which can inspect the counters
/// and make commits fail on demand.
#[derive(Debug, Default)]
pub struct HeapMemory {
    reservations: Vec<(NonNull<u8>, Layout)>,
    committed_bytes: usize,
    commit_calls: usize,
    uncommit_calls: usize,
    fail_commits: bool,
}

unsafe impl Send for HeapMemory {}

impl HeapMemory {
    pub const fn new() -> Self {
        Self {
            reservations: Vec::new(),
            committed_bytes: 0,
            commit_calls: 0,
            uncommit_calls: 0,
            fail_commits: false,
        }
    }

    /// Bytes currently committed, as seen by the backend.
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservations.iter().map(|(_, layout)| layout.size()).sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls
    }

    pub fn uncommit_calls(&self) -> usize {
        self.uncommit_calls
    }

    /// Make every following commit fail, as if the system were out of memory.
    pub fn set_fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }
}

unsafe impl VirtualMemory for HeapMemory {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn reserve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align.max(PAGE_SIZE)).ok()?;
        if layout.size() == 0 {
            return None;
        }

        // SAFETY: layout size is nonzero
        let base = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.reservations.push((base, layout));
        Some(base)
    }

    unsafe fn release(&mut self, base: NonNull<u8>, size: usize) {
        let index = self
            .reservations
            .iter()
            .position(|&(b, layout)| b == base && layout.size() == size)
            .expect("released range does not match a reservation");

        let (base, layout) = self.reservations.swap_remove(index);
        alloc::dealloc(base.as_ptr(), layout);
    }

    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        debug_assert!(base.as_ptr() as usize % PAGE_SIZE == 0 && size % PAGE_SIZE == 0);

        if self.fail_commits {
            return false;
        }
        self.commit_calls += 1;
        self.committed_bytes += size;
        true
    }

    unsafe fn uncommit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        debug_assert!(base.as_ptr() as usize % PAGE_SIZE == 0 && size % PAGE_SIZE == 0);

        self.uncommit_calls += 1;
        self.committed_bytes -= size;
        true
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        for (base, layout) in self.reservations.drain(..) {
            unsafe { alloc::dealloc(base.as_ptr(), layout) };
        }
    }
}
