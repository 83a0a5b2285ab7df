//! A segmented, growable metadata allocator.
//!
//! Memory is reserved in segments, sliced into power-of-two chunks managed
//! by a buddy allocator, and handed to per-loader arenas that bump-allocate
//! from them. When a loader dies its [`Metaspace`] is dropped and every
//! chunk goes back to the shared [`MetaspaceContext`] at once.
//!
//! Your first step will be `MetaspaceContext::new(...)`, wrapped in an
//! [`Arc`](std::sync::Arc). Each loader then gets a `Metaspace::new(&context, ...)`.
//!
//! ```
//! # use std::sync::Arc;
//! use metaspace::*;
//!
//! let settings = Settings::default().with_class_space_bytes(Some(8 << 20));
//! let context: Arc<MetaspaceContext<HeapMemory, spin::Mutex<()>>> =
//!     Arc::new(MetaspaceContext::new(HeapMemory::new(), settings).unwrap());
//!
//! let loader = Metaspace::new(&context, SpaceType::Standard);
//! let klass = loader.allocate(64, MetadataKind::Class).unwrap();
//! let method = loader.allocate(24, MetadataKind::NonClass).unwrap();
//! assert!(context.class_space_range().unwrap().contains(&(klass.as_ptr() as usize)));
//! # let _ = method;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// The allocation unit. Every size in this crate is a word count unless named otherwise.
pub type MetaWord = usize;

#[cfg(test)]
mod test_utils;
pub(crate) mod ptr_utils;

mod allocator;
mod arena;
mod commit;
mod context;
#[cfg(feature = "counters")]
mod counters;
mod error;
mod growth;
mod level;
mod metaspace;
mod pressure;
mod settings;
mod space;
mod stats;

pub mod vm;

pub use allocator::MetaspaceRef;
pub use context::MetaspaceContext;
#[cfg(feature = "counters")]
pub use counters::Counters;
pub use error::{AllocError, ContextError, SettingsError};
pub use growth::{GrowthPolicy, GrowthPolicyTable, MetadataKind, SpaceType};
pub use level::{ChunkLevel, MIN_CHUNK_WORDS, NUM_LEVELS, ROOT_CHUNK_WORDS};
pub use metaspace::Metaspace;
pub use pressure::{CommitPressure, NoReclaim};
pub use settings::Settings;
pub use stats::{ArenaStats, ContextStats, MetaspaceStats, SpaceStats, Usage};
pub use vm::{HeapMemory, VirtualMemory};
