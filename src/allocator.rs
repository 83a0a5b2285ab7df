use core::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator, Layout};
use lock_api::RawMutex;

use crate::growth::MetadataKind;
use crate::metaspace::Metaspace;
use crate::ptr_utils::{bytes_to_words, words_to_bytes};
use crate::vm::VirtualMemory;

/// A [`Metaspace`] reference implementing [`Allocator`] for one metadata kind.
///
/// Deallocated memory is kept by the arena for reuse and only returned to the
/// context when the [`Metaspace`] is dropped. Layouts aligned beyond the arena's
/// alignment are refused.
#[derive(Debug)]
pub struct MetaspaceRef<'a, V: VirtualMemory, R: RawMutex> {
    metaspace: &'a Metaspace<V, R>,
    kind: MetadataKind,
}

impl<V: VirtualMemory, R: RawMutex> Clone for MetaspaceRef<'_, V, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: VirtualMemory, R: RawMutex> Copy for MetaspaceRef<'_, V, R> {}

impl<'a, V: VirtualMemory, R: RawMutex> MetaspaceRef<'a, V, R> {
    pub(crate) fn new(metaspace: &'a Metaspace<V, R>, kind: MetadataKind) -> Self {
        Self { metaspace, kind }
    }

    /// Largest alignment this allocator can satisfy, in bytes.
    pub fn max_align(&self) -> usize {
        words_to_bytes(self.metaspace.context().settings().alignment_words(self.kind))
    }
}

unsafe impl<V: VirtualMemory, R: RawMutex> Allocator for MetaspaceRef<'_, V, R> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // SAFETY: alignments are nonzero
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        if layout.align() > self.max_align() {
            return Err(AllocError);
        }

        let words = bytes_to_words(layout.size());
        self.metaspace
            .allocate(words, self.kind)
            .map(|block| NonNull::slice_from_raw_parts(block.cast(), words_to_bytes(words)))
            .map_err(|_| AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.metaspace.deallocate(ptr.cast(), bytes_to_words(layout.size()), self.kind);
        }
    }
}
