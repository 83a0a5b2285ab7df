//! Error types surfaced by metaspace allocation and configuration.
//!
//! Internal invariant violations are not represented here; they panic.

use std::fmt;

/// Reasons an allocation request could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Committing more memory would exceed the commit budget.
    CommitLimit {
        /// Words that would have needed committing.
        requested_words: usize,
    },

    /// Committing more memory would cross the collection threshold.
    ///
    /// Recoverable by reclaiming memory and retrying with
    /// [`Metaspace::expand_and_allocate`](crate::Metaspace::expand_and_allocate).
    GcThreshold {
        /// Words that would have needed committing.
        requested_words: usize,
    },

    /// No address space is left to serve the request.
    AddressSpace {
        /// Whether the exhausted segment pool is fixed and cannot grow.
        fixed: bool,
    },

    /// A class allocation was requested but no class space is configured.
    ClassSpaceMissing,
}

impl AllocError {
    /// Whether reclaiming memory elsewhere may let a retry succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AllocError::AddressSpace { fixed: true } | AllocError::ClassSpaceMissing)
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::CommitLimit { requested_words } => {
                write!(f, "commit budget exhausted: {requested_words} words requested")
            }
            AllocError::GcThreshold { requested_words } => {
                write!(f, "collection threshold reached: {requested_words} words requested")
            }
            AllocError::AddressSpace { fixed: true } => {
                write!(f, "fixed address space exhausted")
            }
            AllocError::AddressSpace { fixed: false } => {
                write!(f, "address space budget exhausted")
            }
            AllocError::ClassSpaceMissing => write!(f, "no class space configured"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Invalid [`Settings`](crate::Settings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// The commit granule must be a power of two multiple of the page size
    /// no larger than a root chunk.
    CommitGranule {
        /// The configured granule in bytes.
        bytes: usize,
    },

    /// The default segment size must be a nonzero multiple of the root chunk size.
    SegmentSize {
        /// The configured size in bytes.
        bytes: usize,
    },

    /// The class space size must be a nonzero multiple of the root chunk size.
    ClassSpaceSize {
        /// The configured size in bytes.
        bytes: usize,
    },

    /// Class alignment must be a power of two number of words.
    ClassAlignment {
        /// The configured alignment in words.
        words: usize,
    },

    /// The minimum expansion must not exceed the maximum expansion.
    Expansion {
        /// Minimum expansion in bytes.
        min_bytes: usize,
        /// Maximum expansion in bytes.
        max_bytes: usize,
    },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::CommitGranule { bytes } => write!(
                f,
                "invalid commit granule of {bytes} bytes: must be a power of two page multiple within a root chunk"
            ),
            SettingsError::SegmentSize { bytes } => {
                write!(f, "invalid segment size of {bytes} bytes: must be a multiple of the root chunk size")
            }
            SettingsError::ClassSpaceSize { bytes } => {
                write!(f, "invalid class space size of {bytes} bytes: must be a multiple of the root chunk size")
            }
            SettingsError::ClassAlignment { words } => {
                write!(f, "invalid class alignment of {words} words: must be a power of two")
            }
            SettingsError::Expansion { min_bytes, max_bytes } => {
                write!(f, "minimum expansion {min_bytes} exceeds maximum expansion {max_bytes}")
            }
        }
    }
}

impl std::error::Error for SettingsError {}

/// Reasons a [`MetaspaceContext`](crate::MetaspaceContext) could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The settings are invalid for the virtual memory backend.
    Settings(SettingsError),

    /// The class space could not be reserved.
    ClassSpace {
        /// The requested class space size in bytes.
        bytes: usize,
    },
}

impl From<SettingsError> for ContextError {
    fn from(err: SettingsError) -> Self {
        ContextError::Settings(err)
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Settings(err) => err.fmt(f),
            ContextError::ClassSpace { bytes } => write!(f, "failed to reserve {bytes} bytes of class space"),
        }
    }
}

impl std::error::Error for ContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContextError::Settings(err) => Some(err),
            ContextError::ClassSpace { .. } => None,
        }
    }
}
