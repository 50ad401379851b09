//! # Arena Handles
//!
//! Two kinds of identifiers travel around the allocator:
//! - [`ArenaPtr`]: what clients hold, the byte offset of a payload
//! - [`BlockHandle`]: what the allocator holds, a slot in the header pool

use std::fmt;

/// A pointer into the arena.
///
/// This is the byte offset of a payload from the start of the arena, so it
/// stays valid across threads and never aliases real memory. A pointer is
/// meaningful until it (or one of its owners) is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ArenaPtr(usize);

impl ArenaPtr {
    /// Creates a pointer from a raw arena offset.
    #[inline]
    #[must_use]
    pub(crate) const fn from_offset(offset: usize) -> Self {
        Self(offset)
    }

    /// Returns the byte offset of this pointer within the arena.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Returns a pointer `bytes` further into the arena.
    ///
    /// Interior pointers are accepted by the lookup operations
    /// (`is_allocated`, `attach`, ...) exactly like payload starts.
    #[inline]
    #[must_use]
    pub const fn byte_add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for ArenaPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a block header in the header pool.
///
/// Handles are reused once the header they named is merged away, so they
/// are never handed out to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct BlockHandle(u32);

impl BlockHandle {
    #[inline]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}
