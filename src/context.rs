//! State shared by every [`Metaspace`](crate::Metaspace) of a process.
//!
//! The context owns the virtual memory backend, the commit limiter and one
//! space per metadata kind, all behind a single expansion lock. Handles take
//! their own lock first and the expansion lock second, never the reverse.

use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use lock_api::{Mutex, RawMutex};

use crate::MetaWord;
use crate::error::{AllocError, ContextError};
use crate::growth::MetadataKind;
use crate::pressure::{CommitPressure, NoReclaim};
use crate::ptr_utils;
use crate::settings::Settings;
use crate::space::{Env, Space};
use crate::stats::{ContextStats, Usage};
use crate::vm::VirtualMemory;

/// Everything guarded by the expansion lock.
pub(crate) struct Expansion<V: VirtualMemory> {
    env: Env<V>,
    non_class: Space,
    class: Option<Space>,
}

impl<V: VirtualMemory> Expansion<V> {
    /// The space serving `kind` along with the shared environment.
    pub fn space_mut(&mut self, kind: MetadataKind) -> Result<(&mut Space, &mut Env<V>), AllocError> {
        let space = match kind {
            MetadataKind::NonClass => &mut self.non_class,
            MetadataKind::Class => self.class.as_mut().ok_or(AllocError::ClassSpaceMissing)?,
        };
        Ok((space, &mut self.env))
    }

    fn space(&self, kind: MetadataKind) -> Option<&Space> {
        match kind {
            MetadataKind::NonClass => Some(&self.non_class),
            MetadataKind::Class => self.class.as_ref(),
        }
    }

    fn spaces(&self) -> impl Iterator<Item = &Space> {
        core::iter::once(&self.non_class).chain(self.class.as_ref())
    }
}

impl<V: VirtualMemory> Drop for Expansion<V> {
    fn drop(&mut self) {
        self.non_class.release_all(&mut self.env.vm);
        if let Some(class) = &mut self.class {
            class.release_all(&mut self.env.vm);
        }
    }
}

/// The chunk manager behind every [`Metaspace`](crate::Metaspace).
///
/// Share it through an [`Arc`](std::sync::Arc); each handle keeps it alive.
pub struct MetaspaceContext<V: VirtualMemory, R: RawMutex> {
    settings: Settings,
    expansion: Mutex<R, Expansion<V>>,
    /// Used words per kind. Updated by arenas, possibly outside the expansion lock.
    used_words: [AtomicUsize; 2],
    pressure: Box<dyn CommitPressure>,
}

impl<V: VirtualMemory, R: RawMutex> MetaspaceContext<V, R> {
    /// Validates `settings` and reserves the class space, if one is configured.
    pub fn new(vm: V, settings: Settings) -> Result<Self, ContextError> {
        settings.validate(vm.page_size())?;

        let mut env = Env::new(vm, &settings);
        let class = match settings.class_space_bytes {
            Some(bytes) => {
                let words = ptr_utils::bytes_to_words(bytes);
                let space = Space::fixed(MetadataKind::Class, words, &mut env)
                    .map_err(|_| ContextError::ClassSpace { bytes })?;
                Some(space)
            }
            None => None,
        };
        let non_class = Space::growable(MetadataKind::NonClass, &settings);

        tracing::debug!(
            granule_bytes = settings.commit_granule_bytes,
            class_space_bytes = settings.class_space_bytes,
            "created metaspace context"
        );

        Ok(Self {
            settings,
            expansion: Mutex::new(Expansion { env, non_class, class }),
            used_words: [AtomicUsize::new(0), AtomicUsize::new(0)],
            pressure: Box::new(NoReclaim),
        })
    }

    /// Installs the hook run by [`Metaspace::allocate_or_reclaim`](crate::Metaspace::allocate_or_reclaim).
    pub fn with_pressure(mut self, pressure: impl CommitPressure + 'static) -> Self {
        self.pressure = Box::new(pressure);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn expansion(&self) -> &Mutex<R, Expansion<V>> {
        &self.expansion
    }

    pub(crate) fn pressure(&self) -> &dyn CommitPressure {
        &*self.pressure
    }

    #[inline]
    pub(crate) fn add_used(&self, kind: MetadataKind, words: usize) {
        self.used_words[kind.index()].fetch_add(words, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub_used(&self, kind: MetadataKind, words: usize) {
        self.used_words[kind.index()].fetch_sub(words, Ordering::Relaxed);
    }

    /// Whether a class space is configured.
    pub fn has_class_space(&self) -> bool {
        self.settings.class_space_bytes.is_some()
    }

    /// Used, committed and reserved words of the space serving `kind`.
    ///
    /// All zero for [`MetadataKind::Class`] without a class space.
    pub fn usage_numbers(&self, kind: MetadataKind) -> Usage {
        let expansion = self.expansion.lock();
        match expansion.space(kind) {
            Some(space) => Usage {
                used_words: self.used_words[kind.index()].load(Ordering::Relaxed),
                committed_words: space.committed_words(),
                reserved_words: space.reserved_words(),
            },
            None => Usage::default(),
        }
    }

    /// Usage numbers summed over both kinds.
    pub fn total_usage(&self) -> Usage {
        self.usage_numbers(MetadataKind::NonClass) + self.usage_numbers(MetadataKind::Class)
    }

    /// Words committed across the context, as seen by the commit limiter.
    pub fn committed_words(&self) -> usize {
        self.expansion.lock().env.limiter.committed_words()
    }

    /// Current collection threshold in words, if one is set.
    pub fn gc_threshold_words(&self) -> Option<usize> {
        self.expansion.lock().env.limiter.threshold_words()
    }

    /// Replaces the collection threshold. `None` disables it.
    pub fn set_gc_threshold_bytes(&self, bytes: Option<usize>) {
        let words = bytes.map(|b| b / ptr_utils::WORD_SIZE);
        self.expansion.lock().env.limiter.set_threshold_words(words);
        tracing::debug!(?words, "set collection threshold");
    }

    /// Raises the collection threshold so that `words` more words fit.
    pub(crate) fn raise_threshold(&self, words: usize) -> Option<usize> {
        let mut expansion = self.expansion.lock();
        let page_words = expansion.env.page_words;
        let raised = expansion.env.limiter.raise_threshold(words, page_words);
        if let Some(threshold) = raised {
            tracing::debug!(words, threshold, "raised collection threshold");
        }
        raised
    }

    /// Releases every non-class segment without chunks in use, other than
    /// the one currently being sliced. Returns the number released.
    pub fn purge(&self) -> usize {
        let mut expansion = self.expansion.lock();
        let Expansion { env, non_class, class } = &mut *expansion;

        let mut released = non_class.purge(env);
        if let Some(class) = class {
            released += class.purge(env);
        }

        if released > 0 {
            tracing::debug!(released, committed = env.limiter.committed_words(), "purged segments");
        }
        released
    }

    /// Whether `ptr` lies within memory reserved by this context.
    pub fn contains(&self, ptr: *const MetaWord) -> bool {
        self.expansion.lock().spaces().any(|space| space.contains(ptr))
    }

    /// Address range of the class space, if one is configured.
    pub fn class_space_range(&self) -> Option<Range<usize>> {
        self.expansion.lock().class.as_ref()?.first_range()
    }

    pub fn stats(&self) -> ContextStats {
        let expansion = self.expansion.lock();
        ContextStats {
            non_class: expansion.non_class.stats(),
            class: expansion.class.as_ref().map(Space::stats),
            used_words: [
                self.used_words[0].load(Ordering::Relaxed),
                self.used_words[1].load(Ordering::Relaxed),
            ],
            committed_words: expansion.env.limiter.committed_words(),
            commit_limit_words: expansion.env.limiter.max_words(),
            gc_threshold_words: expansion.env.limiter.threshold_words(),
        }
    }

    /// Runs `f` on the virtual memory backend under the expansion lock.
    pub fn with_vm<T>(&self, f: impl FnOnce(&V) -> T) -> T {
        f(&self.expansion.lock().env.vm)
    }

    /// Panics if any space is inconsistent or the totals disagree.
    pub fn verify(&self) {
        let expansion = self.expansion.lock();

        let mut committed = 0;
        for space in expansion.spaces() {
            space.verify();
            let used = self.used_words[space.kind().index()].load(Ordering::Relaxed);
            assert!(used <= space.committed_words(), "{} space used past committed", space.kind().name());
            assert!(space.committed_words() <= space.reserved_words());
            committed += space.committed_words();
        }

        let limiter = &expansion.env.limiter;
        assert_eq!(committed, limiter.committed_words(), "commit limiter out of sync");
        assert!(limiter.committed_words() <= limiter.max_words());
    }
}

impl<V: VirtualMemory, R: RawMutex> core::fmt::Debug for MetaspaceContext<V, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetaspaceContext")
            .field("settings", &self.settings)
            .field("used_words", &self.used_words)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::ROOT_CHUNK_WORDS;
    use crate::test_utils::{TestContext, test_context};
    use crate::vm::HeapMemory;
    use crate::{Metaspace, SpaceType};

    const ROOT_BYTES: usize = ptr_utils::words_to_bytes(ROOT_CHUNK_WORDS);

    #[test]
    fn invalid_settings_rejected() {
        let settings = Settings::default().with_commit_granule_bytes(1000);
        let err = TestContext::new(HeapMemory::new(), settings).unwrap_err();
        assert_eq!(err, ContextError::Settings(crate::SettingsError::CommitGranule { bytes: 1000 }));
    }

    #[test]
    fn class_space_reserved_up_front() {
        let ctx = test_context(Settings::default().with_class_space_bytes(Some(ROOT_BYTES * 2)));

        let range = ctx.class_space_range().unwrap();
        assert_eq!(range.len(), ROOT_BYTES * 2);
        assert!(ctx.contains(range.start as *const MetaWord));
        assert_eq!(ctx.usage_numbers(MetadataKind::Class).reserved_words, ROOT_CHUNK_WORDS * 2);
        assert_eq!(ctx.usage_numbers(MetadataKind::NonClass), Usage::default());
        assert_eq!(ctx.with_vm(HeapMemory::reservation_count), 1);
    }

    #[test]
    fn no_class_space() {
        let ctx = test_context(Settings::default());
        assert!(!ctx.has_class_space());
        assert_eq!(ctx.class_space_range(), None);
        assert_eq!(ctx.usage_numbers(MetadataKind::Class), Usage::default());
    }

    #[test]
    fn purge_after_handles_die() {
        let ctx = test_context(Settings::default().with_segment_default_bytes(ROOT_BYTES));

        let handles: Vec<_> = (0..3).map(|_| Metaspace::new(&ctx, SpaceType::Boot)).collect();
        for handle in &handles {
            // boot loaders start with a root chunk
            handle.allocate(16, MetadataKind::NonClass).unwrap();
        }
        assert_eq!(ctx.stats().non_class.segments, 3);
        assert_eq!(ctx.purge(), 0);

        drop(handles);
        // the current segment is kept
        assert_eq!(ctx.purge(), 2);
        assert_eq!(ctx.stats().non_class.segments, 1);
        assert_eq!(ctx.with_vm(HeapMemory::reservation_count), 1);
        ctx.verify();
    }

    #[test]
    fn gc_threshold_round_trip() {
        let ctx = test_context(Settings::default().with_gc_threshold_bytes(Some(1 << 20)));
        assert_eq!(ctx.gc_threshold_words(), Some((1 << 20) / ptr_utils::WORD_SIZE));

        ctx.set_gc_threshold_bytes(None);
        assert_eq!(ctx.gc_threshold_words(), None);
        assert_eq!(ctx.raise_threshold(100), None);
    }

    #[test]
    fn stats_report() {
        let ctx = test_context(Settings::default().with_class_space_bytes(Some(ROOT_BYTES)));
        let metaspace = Metaspace::new(&ctx, SpaceType::Standard);
        metaspace.allocate(100, MetadataKind::NonClass).unwrap();
        metaspace.allocate(10, MetadataKind::Class).unwrap();

        let stats = ctx.stats();
        assert_eq!(stats.used_words, [100, 10]);
        assert_eq!(stats.class.as_ref().unwrap().reserved_words, ROOT_CHUNK_WORDS);

        let report = stats.to_string();
        assert!(report.contains("non-class space: 100 words used"));
        assert!(report.contains("class space: 10 words used"));
    }
}
