//! The per-loader allocation handle.

use core::ptr::NonNull;
use std::sync::Arc;

use lock_api::{Mutex, RawMutex};

use crate::MetaWord;
use crate::allocator::MetaspaceRef;
use crate::arena::Arena;
use crate::context::MetaspaceContext;
use crate::error::AllocError;
use crate::growth::{MetadataKind, SpaceType};
use crate::stats::{MetaspaceStats, Usage};
use crate::vm::VirtualMemory;

#[cfg(feature = "counters")]
use crate::counters::Counters;

struct Arenas {
    non_class: Arena,
    class: Option<Arena>,
}

impl Arenas {
    fn get_mut(&mut self, kind: MetadataKind) -> Result<&mut Arena, AllocError> {
        match kind {
            MetadataKind::NonClass => Ok(&mut self.non_class),
            MetadataKind::Class => self.class.as_mut().ok_or(AllocError::ClassSpaceMissing),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Arena> {
        core::iter::once(&self.non_class).chain(self.class.as_ref())
    }
}

/// Metadata allocator for one loader.
///
/// A handle owns a non-class arena and, if the context has a class space,
/// a class arena. Memory is handed out in words and stays valid until the
/// handle is dropped, which returns every chunk to the context at once.
///
/// ```
/// # use std::sync::Arc;
/// # use metaspace::{HeapMemory, MetadataKind, Metaspace, MetaspaceContext, Settings, SpaceType};
/// let context: Arc<MetaspaceContext<HeapMemory, spin::Mutex<()>>> =
///     Arc::new(MetaspaceContext::new(HeapMemory::new(), Settings::default()).unwrap());
///
/// let metaspace = Metaspace::new(&context, SpaceType::Standard);
/// let block = metaspace.allocate(16, MetadataKind::NonClass).unwrap();
/// assert!(metaspace.contains(block.as_ptr()));
///
/// drop(metaspace);
/// assert_eq!(context.usage_numbers(MetadataKind::NonClass).used_words, 0);
/// ```
pub struct Metaspace<V: VirtualMemory, R: RawMutex> {
    context: Arc<MetaspaceContext<V, R>>,
    space_type: SpaceType,
    arenas: Mutex<R, Arenas>,
}

impl<V: VirtualMemory, R: RawMutex> Metaspace<V, R> {
    pub fn new(context: &Arc<MetaspaceContext<V, R>>, space_type: SpaceType) -> Self {
        let settings = context.settings();
        let arena = |kind: MetadataKind| {
            Arena::new(
                kind,
                settings.growth_policies.get(space_type, kind).clone(),
                settings.alignment_words(kind),
                settings.enlarge_chunks_in_place,
            )
        };

        let arenas = Arenas {
            non_class: arena(MetadataKind::NonClass),
            class: context.has_class_space().then(|| arena(MetadataKind::Class)),
        };

        Self { context: Arc::clone(context), space_type, arenas: Mutex::new(arenas) }
    }

    #[inline]
    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    #[inline]
    pub fn context(&self) -> &Arc<MetaspaceContext<V, R>> {
        &self.context
    }

    /// Allocates `words` words of `kind` metadata.
    ///
    /// Class allocations are aligned to the configured class alignment;
    /// zero-word requests take one word.
    pub fn allocate(&self, words: usize, kind: MetadataKind) -> Result<NonNull<MetaWord>, AllocError> {
        let mut arenas = self.arenas.lock();
        let arena = arenas.get_mut(kind)?;
        arena.allocate(words, &self.context)
    }

    /// Hands a block back to its arena for reuse.
    ///
    /// The memory itself is only returned to the context when the handle is dropped.
    ///
    /// # Safety
    /// `block` must have been returned by [`allocate`](Self::allocate) on this
    /// handle with the same `words` and `kind`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, block: NonNull<MetaWord>, words: usize, kind: MetadataKind) {
        let mut arenas = self.arenas.lock();
        let Ok(arena) = arenas.get_mut(kind) else {
            debug_assert!(false, "{block:p} deallocated from a missing {} arena", kind.name());
            return;
        };
        arena.deallocate(block, words);
    }

    /// Like [`allocate`](Self::allocate), but on a commit failure runs the
    /// context's [`CommitPressure`](crate::CommitPressure) hook with no lock
    /// held and, if it reports relief, retries once through
    /// [`expand_and_allocate`](Self::expand_and_allocate).
    pub fn allocate_or_reclaim(&self, words: usize, kind: MetadataKind) -> Result<NonNull<MetaWord>, AllocError> {
        match self.allocate(words, kind) {
            Err(err) if err.is_retryable() => {
                tracing::debug!(kind = kind.name(), words, %err, "allocation failed, relieving pressure");
                if self.context.pressure().relieve(kind, words, err) {
                    self.expand_and_allocate(words, kind)
                } else {
                    Err(err)
                }
            }
            result => result,
        }
    }

    /// Raises the collection threshold so that `words` more words may be
    /// committed, then allocates.
    pub fn expand_and_allocate(&self, words: usize, kind: MetadataKind) -> Result<NonNull<MetaWord>, AllocError> {
        self.context.raise_threshold(words);
        self.allocate(words, kind)
    }

    /// Whether `ptr` lies within a chunk owned by this handle.
    pub fn contains(&self, ptr: *const MetaWord) -> bool {
        self.arenas.lock().iter().any(|arena| arena.owns(ptr))
    }

    /// Used, committed and capacity words of the `kind` arena.
    ///
    /// All zero for [`MetadataKind::Class`] without a class space.
    pub fn usage_numbers(&self, kind: MetadataKind) -> Usage {
        let mut arenas = self.arenas.lock();
        match arenas.get_mut(kind) {
            Ok(arena) => Usage {
                used_words: arena.used_words(),
                committed_words: arena.committed_words(),
                reserved_words: arena.capacity_words(),
            },
            Err(_) => Usage::default(),
        }
    }

    pub fn stats(&self) -> MetaspaceStats {
        let arenas = self.arenas.lock();
        MetaspaceStats {
            space_type: self.space_type,
            non_class: arenas.non_class.stats(),
            class: arenas.class.as_ref().map(Arena::stats),
        }
    }

    /// Allocation counters summed over both arenas.
    #[cfg(feature = "counters")]
    pub fn counters(&self) -> Counters {
        let mut counters = Counters::new();
        for arena in self.arenas.lock().iter() {
            counters.merge(arena.counters());
        }
        counters
    }

    /// An [`Allocator`](allocator_api2::alloc::Allocator) serving `kind` metadata.
    pub fn allocator(&self, kind: MetadataKind) -> MetaspaceRef<'_, V, R> {
        MetaspaceRef::new(self, kind)
    }

    /// Panics if either arena is inconsistent.
    pub fn verify(&self) {
        for arena in self.arenas.lock().iter() {
            arena.verify();
        }
    }
}

impl<V: VirtualMemory, R: RawMutex> Drop for Metaspace<V, R> {
    fn drop(&mut self) {
        let arenas = self.arenas.get_mut();
        arenas.non_class.release(&self.context);
        if let Some(class) = &mut arenas.class {
            class.release(&self.context);
        }
    }
}

impl<V: VirtualMemory, R: RawMutex> core::fmt::Debug for Metaspace<V, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Metaspace").field("space_type", &self.space_type).finish_non_exhaustive()
    }
}
