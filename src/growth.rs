//! Arena growth policies.
//!
//! A [`GrowthPolicy`] tells an arena which chunk level to request for its
//! n-th chunk. Policies differ by [`SpaceType`] and [`MetadataKind`]: a boot
//! loader loads many classes and starts big, a reflection loader typically
//! loads a single class and starts with the smallest chunk.

use crate::level::ChunkLevel;

/// Which arena of a [`Metaspace`](crate::Metaspace) a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// General metadata, served from the growable non-class space.
    NonClass,
    /// Class descriptors, served from the fixed class space.
    Class,
}

impl MetadataKind {
    pub(crate) const fn index(self) -> usize {
        match self {
            MetadataKind::NonClass => 0,
            MetadataKind::Class => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MetadataKind::NonClass => "non-class",
            MetadataKind::Class => "class",
        }
    }
}

/// The kind of loader a [`Metaspace`](crate::Metaspace) serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpaceType {
    /// An ordinary loader.
    #[default]
    Standard,
    /// The bootstrap loader.
    Boot,
    /// A short-lived loader holding one reflection or hidden class.
    Reflection,
}

impl SpaceType {
    pub const ALL: [SpaceType; 3] = [SpaceType::Standard, SpaceType::Boot, SpaceType::Reflection];

    const fn index(self) -> usize {
        match self {
            SpaceType::Standard => 0,
            SpaceType::Boot => 1,
            SpaceType::Reflection => 2,
        }
    }
}

const fn lv(raw: u8) -> ChunkLevel {
    match ChunkLevel::new(raw) {
        Some(level) => level,
        None => panic!("invalid chunk level"),
    }
}

// sizes in the comments assume 8-byte words
const LV_4M: ChunkLevel = lv(0);
const LV_1M: ChunkLevel = lv(2);
const LV_256K: ChunkLevel = lv(4);
const LV_16K: ChunkLevel = lv(8);
const LV_8K: ChunkLevel = lv(9);
const LV_4K: ChunkLevel = lv(10);
const LV_2K: ChunkLevel = lv(11);
const LV_1K: ChunkLevel = lv(12);

const STANDARD_NON_CLASS: &[ChunkLevel] = &[LV_4K, LV_4K, LV_4K, LV_8K, LV_16K];
const STANDARD_CLASS: &[ChunkLevel] = &[LV_2K, LV_2K, LV_4K, LV_8K, LV_16K];
const BOOT_NON_CLASS: &[ChunkLevel] = &[LV_4M, LV_1M];
const BOOT_CLASS: &[ChunkLevel] = &[LV_1M, LV_256K];
const REFLECTION_NON_CLASS: &[ChunkLevel] = &[LV_1K, LV_2K];
const REFLECTION_CLASS: &[ChunkLevel] = &[LV_1K];

/// Ordered "arena step → chunk level" table. The last entry repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowthPolicy {
    steps: Vec<ChunkLevel>,
}

impl GrowthPolicy {
    /// Returns `None` if `steps` is empty.
    pub fn new(steps: &[ChunkLevel]) -> Option<Self> {
        if steps.is_empty() {
            return None;
        }
        Some(Self { steps: steps.to_vec() })
    }

    /// A policy that always requests chunks of `level`.
    pub fn constant(level: ChunkLevel) -> Self {
        Self { steps: vec![level] }
    }

    /// Chunk level to request for the chunk acquired at `step` (zero-based).
    #[inline]
    pub fn level_at(&self, step: usize) -> ChunkLevel {
        self.steps[step.min(self.steps.len() - 1)]
    }

    pub fn steps(&self) -> &[ChunkLevel] {
        &self.steps
    }
}

/// Growth policies for every [`SpaceType`] and [`MetadataKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowthPolicyTable {
    policies: [[GrowthPolicy; 2]; 3],
}

impl GrowthPolicyTable {
    pub fn get(&self, space_type: SpaceType, kind: MetadataKind) -> &GrowthPolicy {
        &self.policies[space_type.index()][kind.index()]
    }

    pub fn set(&mut self, space_type: SpaceType, kind: MetadataKind, policy: GrowthPolicy) {
        self.policies[space_type.index()][kind.index()] = policy;
    }

    /// Every space type and kind uses `policy`.
    pub fn uniform(policy: GrowthPolicy) -> Self {
        let pair = [policy.clone(), policy];
        Self { policies: [pair.clone(), pair.clone(), pair] }
    }
}

impl Default for GrowthPolicyTable {
    fn default() -> Self {
        let p = |steps: &[ChunkLevel]| GrowthPolicy { steps: steps.to_vec() };
        Self {
            policies: [
                [p(STANDARD_NON_CLASS), p(STANDARD_CLASS)],
                [p(BOOT_NON_CLASS), p(BOOT_CLASS)],
                [p(REFLECTION_NON_CLASS), p(REFLECTION_CLASS)],
            ],
        }
    }
}
