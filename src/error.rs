//! Error types.

use std::alloc::Layout;

use thiserror::Error;

/// The memory resource could not satisfy an allocation request, even after
/// one collection-and-retry pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory resource failed to allocate {bytes} bytes (alignment {align})")]
pub struct AllocError {
    /// Requested size in bytes.
    pub bytes: usize,
    /// Requested alignment in bytes.
    pub align: usize,
}

impl AllocError {
    /// The error for a request described by `layout`.
    #[must_use]
    pub const fn for_layout(layout: Layout) -> Self {
        Self {
            bytes: layout.size(),
            align: layout.align(),
        }
    }
}
