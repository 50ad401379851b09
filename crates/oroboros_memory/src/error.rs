//! # Memory Error Types
//!
//! Recoverable failures of the arena. Corruption and misuse of pointers are
//! not in here: those abort the operation with a panic.

use crate::handle::ArenaPtr;
use thiserror::Error;

/// Errors that can occur while allocating from or configuring the arena.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// No free block is large enough for the request.
    #[error("out of memory: requested {requested} bytes, largest free block is {largest_free} bytes")]
    OutOfMemory {
        /// Aligned size that was requested.
        requested: usize,
        /// Largest free payload currently available.
        largest_free: usize,
    },

    /// The backing buffer could not be reserved at startup.
    #[error("unable to claim {size} bytes for the arena")]
    ArenaClaimFailed {
        /// Size of the failed reservation.
        size: usize,
    },

    /// The configured arena cannot hold even a single minimum block.
    #[error("arena of {size} bytes is too small, need at least {minimum}")]
    ArenaTooSmall {
        /// Configured size.
        size: usize,
        /// Smallest usable size.
        minimum: usize,
    },

    /// Payload access through a pointer that is not an in-use block.
    #[error("pointer {0} does not address an allocated block")]
    InvalidPointer(ArenaPtr),

    /// Payload access past the end of a block.
    #[error("access of {len} bytes at offset {offset} exceeds block {ptr} of {size} bytes")]
    OutOfBounds {
        /// The block being accessed.
        ptr: ArenaPtr,
        /// Offset into the payload.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Payload size of the block.
        size: usize,
    },

    /// The payload cannot be viewed as the requested element type.
    #[error("cannot view block {ptr} as a typed slice: {reason:?}")]
    TypedView {
        /// The block being viewed.
        ptr: ArenaPtr,
        /// Why the cast was refused.
        reason: bytemuck::PodCastError,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for arena operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
