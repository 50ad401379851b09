//! # OROBOROS Memory Arena
//!
//! One fixed-size arena, claimed at startup and shared by every subsystem
//! that allocates.
//!
//! ## Design Principles
//!
//! 1. **One claim** - The arena is reserved once at startup and never grows
//! 2. **First-fit with coalescing** - Free neighbours are always merged before a call returns
//! 3. **Hierarchical ownership** - Blocks can own blocks; releasing an owner releases its subtree
//! 4. **Fail fast on corruption** - A corrupted arena panics, it is never repaired
//!
//! ## Thread Safety
//!
//! [`Arena`] is `Send + Sync`. Every operation takes the arena's single
//! lock once, so operations are totally ordered.
//!
//! ## Example
//!
//! ```rust,ignore
//! use oroboros_memory::{megabytes, Arena};
//!
//! let arena = Arena::with_capacity(megabytes(64))?;
//!
//! let world = arena.allocate(16 * 1024)?.expect("non-zero size");
//! let chunks = arena.allocate(4 * 1024)?.expect("non-zero size");
//! arena.attach(world, chunks);
//!
//! let chunks = arena.resize(chunks, 8 * 1024)?.expect("non-zero size");
//!
//! // Releases `chunks` as well.
//! arena.release(world);
//! assert!(!arena.is_allocated(chunks));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod arena;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod handle;
pub mod header;
mod ownership;

pub use arena::Arena;
pub use config::{kilobytes, megabytes, ArenaConfig};
pub use diagnostics::{Corruption, MemoryReport};
pub use error::{MemoryError, MemoryResult};
pub use handle::ArenaPtr;
pub use header::{align_size, ALIGN, GUARD_VALUE, HEADER_SIZE, MIN_ALLOC_SIZE};
