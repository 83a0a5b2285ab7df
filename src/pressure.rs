use crate::error::AllocError;
use crate::growth::MetadataKind;

/// Hook run by [`Metaspace::allocate_or_reclaim`](crate::Metaspace::allocate_or_reclaim)
/// when an allocation fails for lack of committable memory.
///
/// The hook runs with no metaspace lock held, so it may destroy other
/// [`Metaspace`](crate::Metaspace)s or call [`MetaspaceContext::purge`](crate::MetaspaceContext::purge).
pub trait CommitPressure: Send + Sync {
    /// Given the metadata `kind`, requested `words` and the `error` that
    /// stopped the allocation, free memory and return `true` to have the
    /// allocation retried once, or return `false` to fail it.
    ///
    /// A retry raises the collection threshold before allocating.
    fn relieve(&self, kind: MetadataKind, words: usize, error: AllocError) -> bool;
}

/// Doesn't handle commit pressure, the allocation error is returned immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReclaim;

impl CommitPressure for NoReclaim {
    fn relieve(&self, _: MetadataKind, _: usize, _: AllocError) -> bool {
        false
    }
}

impl<F> CommitPressure for F
where
    F: Fn(MetadataKind, usize, AllocError) -> bool + Send + Sync,
{
    fn relieve(&self, kind: MetadataKind, words: usize, error: AllocError) -> bool {
        self(kind, words, error)
    }
}
