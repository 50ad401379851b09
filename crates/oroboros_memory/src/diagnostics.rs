//! # Arena Diagnostics
//!
//! Integrity checks, usage reports and header dumps.
//!
//! [`Arena::check`] walks the whole block list once. `verify` turns a
//! failed check into a panic, `get_verify` into a `false`. With
//! [`ArenaConfig::verify_every_change`](crate::ArenaConfig) the arena runs
//! the check around every mutation on its own.

use crate::arena::{contract_violation, Arena, ArenaState};
use crate::handle::{ArenaPtr, BlockHandle};
use crate::header::{read_guards, GUARD_VALUE, HEADER_SIZE};
use std::fmt;
use std::fmt::Write as _;
use thiserror::Error;

/// A failed integrity check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// The guard at the start of a header was overwritten.
    #[error("block at {offset:#x}: front guard is {found:#010x}")]
    FrontGuard {
        /// Header offset.
        offset: usize,
        /// Value found instead of the guard.
        found: u32,
    },

    /// The guard at the end of a header was overwritten.
    #[error("block at {offset:#x}: back guard is {found:#010x}")]
    BackGuard {
        /// Header offset.
        offset: usize,
        /// Value found instead of the guard.
        found: u32,
    },

    /// A block's `prev` does not name the block before it.
    #[error("block at {offset:#x}: previous link does not match the list")]
    BrokenLink {
        /// Header offset.
        offset: usize,
    },

    /// A block does not start where the previous one ends.
    #[error("block at {offset:#x} should start at {expected:#x}")]
    Misplaced {
        /// Header offset.
        offset: usize,
        /// End of the previous block.
        expected: usize,
    },

    /// The blocks do not add up to the arena size.
    #[error("blocks cover {covered} of {total} bytes")]
    SizeMismatch {
        /// Bytes covered by the list.
        covered: usize,
        /// Arena size.
        total: usize,
    },

    /// Two neighbouring blocks are both free.
    #[error("free blocks at {first:#x} and {second:#x} were not coalesced")]
    AdjacentFree {
        /// First header offset.
        first: usize,
        /// Second header offset.
        second: usize,
    },

    /// The address index and the block list disagree.
    #[error("address index holds {indexed} blocks, list reaches {listed}")]
    IndexMismatch {
        /// Entries in the index.
        indexed: usize,
        /// Blocks reached by walking the list.
        listed: usize,
    },

    /// The ownership links of a block are inconsistent.
    #[error("block at {offset:#x}: {reason}")]
    Ownership {
        /// Header offset.
        offset: usize,
        /// What is wrong.
        reason: &'static str,
    },
}

/// Aggregate usage of an arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryReport {
    /// Arena size in bytes.
    pub total: usize,
    /// Payload bytes of in-use blocks.
    pub in_use: usize,
    /// Bytes taken by headers.
    pub overhead: usize,
    /// Number of free blocks.
    pub fragments: usize,
}

impl MemoryReport {
    /// Payload bytes of free blocks.
    #[inline]
    #[must_use]
    pub const fn free(&self) -> usize {
        self.total - self.in_use - self.overhead
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes in use, {} free in {} fragments, {} bytes of headers",
            self.in_use,
            self.total,
            self.free(),
            self.fragments,
            self.overhead
        )
    }
}

/// The single address being traced.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Watch {
    address: usize,
}

impl ArenaState {
    pub(crate) fn check(&self) -> Result<(), Corruption> {
        let bytes = self.bytes();
        let indexed = self.blocks.len();
        let mut expected = 0;
        let mut listed = 0;
        let mut previous: Option<BlockHandle> = None;
        let mut cursor = self.blocks.head();

        while let Some(handle) = cursor {
            listed += 1;
            if listed > indexed {
                return Err(Corruption::IndexMismatch { indexed, listed });
            }

            let header = &self.blocks[handle];
            if header.offset != expected {
                return Err(Corruption::Misplaced { offset: header.offset, expected });
            }
            if header.end() > self.total {
                return Err(Corruption::SizeMismatch { covered: header.end(), total: self.total });
            }

            let (front, back) = read_guards(bytes, header.offset);
            if front != GUARD_VALUE {
                return Err(Corruption::FrontGuard { offset: header.offset, found: front });
            }
            if back != GUARD_VALUE {
                return Err(Corruption::BackGuard { offset: header.offset, found: back });
            }

            if header.prev != previous || self.blocks.find_by_payload(header.payload_offset()) != Some(handle) {
                return Err(Corruption::BrokenLink { offset: header.offset });
            }

            if header.is_in_use() {
                self.check_ownership(handle)?;
            } else {
                if let Some(prev) = previous.filter(|&p| !self.blocks[p].is_in_use()) {
                    return Err(Corruption::AdjacentFree {
                        first: self.blocks[prev].offset,
                        second: header.offset,
                    });
                }
                if header.has_ownership_links() {
                    return Err(Corruption::Ownership {
                        offset: header.offset,
                        reason: "free block carries ownership links",
                    });
                }
            }

            expected = header.end();
            previous = Some(handle);
            cursor = header.next;
        }

        if expected != self.total {
            return Err(Corruption::SizeMismatch { covered: expected, total: self.total });
        }
        if listed != indexed {
            return Err(Corruption::IndexMismatch { indexed, listed });
        }
        Ok(())
    }

    fn check_ownership(&self, handle: BlockHandle) -> Result<(), Corruption> {
        let header = &self.blocks[handle];
        let broken = |reason| Err(Corruption::Ownership { offset: header.offset, reason });

        let links = [header.parent, header.first_child, header.next_sibling];
        if links
            .into_iter()
            .flatten()
            .any(|link| !self.blocks.contains(link) || !self.blocks[link].is_in_use())
        {
            return broken("links to a block that is not in use");
        }

        if let Some(parent) = header.parent {
            if !self.children(parent).take(self.blocks.len()).any(|c| c == handle) {
                return broken("not reachable from its parent");
            }
        }
        if let Some(first) = header.first_child {
            if self.blocks[first].parent != Some(handle) {
                return broken("first child names another parent");
            }
        }
        if let Some(sibling) = header.next_sibling {
            if self.blocks[sibling].parent != header.parent {
                return broken("next sibling has another parent");
            }
        }
        Ok(())
    }

    pub(crate) fn verify(&self) {
        if let Err(corruption) = self.check() {
            contract_violation(&format!("arena corruption: {corruption}"));
        }
    }

    #[inline]
    pub(crate) fn verify_if_checked(&self) {
        if self.config.verify_every_change {
            self.verify();
        }
    }

    pub(crate) fn report(&self) -> MemoryReport {
        let mut report = MemoryReport {
            total: self.total,
            overhead: self.blocks.len() * HEADER_SIZE,
            ..MemoryReport::default()
        };
        for (_, header) in self.blocks.iter() {
            if header.is_in_use() {
                report.in_use += header.size;
            } else {
                report.fragments += 1;
            }
        }
        report
    }

    fn high_water_mark(&self) -> usize {
        self.blocks
            .iter()
            .filter(|(_, header)| header.is_in_use())
            .map(|(_, header)| header.end())
            .max()
            .unwrap_or(0)
    }

    /// One-line description of a header for the logs.
    fn describe(&self, handle: BlockHandle) -> String {
        let header = &self.blocks[handle];
        let state = if header.is_in_use() { "used" } else { "free" };
        let mut line = format!("block {:#x} [{} bytes, {state}]", header.offset, header.size);

        let links = [
            ("parent", header.parent),
            ("child", header.first_child),
            ("sibling", header.next_sibling),
        ];
        for (name, link) in links {
            if let Some(link) = link.filter(|&l| self.blocks.contains(l)) {
                let _ = write!(line, " {name}={:#x}", self.blocks[link].offset);
            }
        }
        if let Some(origin) = header.origin {
            let _ = write!(line, " ({} at {})", origin.note, origin.location);
        }
        line
    }

    pub(crate) fn log_watched_change(&self, handle: BlockHandle, note: &'static str) {
        let Some(watch) = self.watch else {
            return;
        };
        if self.blocks[handle].span().contains(&watch.address) {
            tracing::debug!("Watched {:#x} {}: {}", watch.address, note, self.describe(handle));
        }
    }
}

impl Arena {
    /// Walks the whole block list and reports the first inconsistency.
    ///
    /// # Errors
    ///
    /// The [`Corruption`] found, if any.
    pub fn check(&self) -> Result<(), Corruption> {
        self.state.lock().check()
    }

    /// Runs [`Arena::check`] and panics on corruption.
    ///
    /// # Panics
    ///
    /// Panics if the arena is corrupted.
    pub fn verify(&self) {
        self.state.lock().verify();
    }

    /// Runs [`Arena::check`] and returns whether the arena is intact.
    #[must_use]
    pub fn get_verify(&self) -> bool {
        match self.check() {
            Ok(()) => true,
            Err(corruption) => {
                tracing::warn!("Arena integrity check failed: {}", corruption);
                false
            }
        }
    }

    /// Asserts that `ptr` points into the payload of an allocated block.
    ///
    /// Interior pointers pass.
    ///
    /// # Arguments
    ///
    /// * `ptr` - Pointer to check
    /// * `allow_empty` - Whether an empty pointer passes
    ///
    /// # Panics
    ///
    /// Panics if the pointer does not pass.
    #[track_caller]
    pub fn verify_pointer(&self, ptr: impl Into<Option<ArenaPtr>>, allow_empty: bool) {
        match ptr.into() {
            Some(ptr) => {
                self.state.lock().expect_covering(ptr, "verify pointer");
            }
            None if allow_empty => {}
            None => contract_violation("verify pointer: empty pointer not allowed"),
        }
    }

    /// Whether `ptr` points into the payload of an in-use block.
    ///
    /// Interior pointers count.
    #[must_use]
    pub fn is_allocated(&self, ptr: ArenaPtr) -> bool {
        self.state.lock().blocks.find_covering(ptr.offset(), true).is_some()
    }

    /// Usage statistics over the whole arena.
    #[must_use]
    pub fn report(&self) -> MemoryReport {
        self.state.lock().report()
    }

    /// Logs [`Arena::report`].
    pub fn log_report(&self) {
        tracing::debug!("Memory arena: {}", self.report());
    }

    /// Logs every header in address order.
    pub fn log_dump(&self) {
        let state = self.state.lock();
        tracing::debug!("Memory arena dump: {}", state.report());
        for (handle, _) in state.blocks.iter() {
            tracing::debug!("  {}", state.describe(handle));
        }
    }

    /// Logs the header of the block containing `ptr`.
    pub fn log_block(&self, ptr: ArenaPtr, extra: &str) {
        let state = self.state.lock();
        match state.blocks.find_covering(ptr.offset(), false) {
            Some(handle) => tracing::debug!("{}: {}", extra, state.describe(handle)),
            None => tracing::debug!("{}: {} is not inside any payload", extra, ptr),
        }
    }

    /// Starts tracing every change to the block containing `ptr`.
    ///
    /// Replaces any previously watched address.
    pub fn watch_address(&self, ptr: ArenaPtr) {
        let mut state = self.state.lock();
        state.watch = Some(Watch { address: ptr.offset() });
        match state.blocks.find_covering(ptr.offset(), false) {
            Some(handle) => tracing::debug!("Watching {}: {}", ptr, state.describe(handle)),
            None => tracing::debug!("Watching {} (not inside any payload)", ptr),
        }
    }

    /// Stops tracing `ptr` if it is the watched address.
    pub fn unwatch_address(&self, ptr: ArenaPtr) {
        let mut state = self.state.lock();
        if state.watch.is_some_and(|w| w.address == ptr.offset()) {
            state.watch = None;
            tracing::debug!("Stopped watching {}", ptr);
        }
    }

    /// Whether an address is being watched.
    #[must_use]
    pub fn watched_address(&self) -> Option<ArenaPtr> {
        self.state.lock().watch.map(|w| ArenaPtr::from_offset(w.address))
    }

    /// Payload bytes currently in use.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.report().in_use
    }

    /// Offset one past the last in-use payload byte.
    ///
    /// Everything beyond is free, so this is how much of the arena the
    /// current allocations actually need.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.state.lock().high_water_mark()
    }

    /// Returns the high-water mark, logging it if it rose since the last call.
    pub fn check_high_water(&self) -> usize {
        let mut state = self.state.lock();
        let mark = state.high_water_mark();
        if mark > state.high_water {
            tracing::debug!(
                "Memory high water: {} of {} bytes ({} more)",
                mark,
                state.total,
                mark - state.high_water
            );
            state.high_water = mark;
        }
        mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{kilobytes, ArenaConfig};

    fn test_arena(verify_every_change: bool) -> Arena {
        Arena::new(ArenaConfig {
            total_size: kilobytes(16),
            verify_every_change,
            debug_fill: true,
            track_origins: true,
        })
        .unwrap()
    }

    fn alloc(arena: &Arena, size: usize) -> ArenaPtr {
        arena.allocate(size).unwrap().unwrap()
    }

    #[test]
    fn test_report_counts() {
        let arena = test_arena(true);
        let a = alloc(&arena, 100);
        let b = alloc(&arena, 200);
        let _c = alloc(&arena, 300);
        arena.release(b);

        let report = arena.report();
        assert_eq!(report.total, kilobytes(16));
        assert_eq!(report.in_use, 112 + 304);
        assert_eq!(report.overhead, 4 * HEADER_SIZE);
        assert_eq!(report.fragments, 2);
        assert_eq!(report.free(), kilobytes(16) - 112 - 304 - 4 * HEADER_SIZE);
        assert_eq!(arena.memory_used(), 416);

        arena.release(a);
        assert_eq!(arena.report().fragments, 2);
    }

    #[test]
    fn test_coalescing_any_order() {
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let arena = test_arena(true);
            let blocks = [alloc(&arena, 100), alloc(&arena, 100), alloc(&arena, 100)];
            for i in order {
                arena.release(blocks[i]);
            }
            let report = arena.report();
            assert_eq!(report.fragments, 1, "order {order:?}");
            assert_eq!(report.overhead, HEADER_SIZE);
        }
    }

    #[test]
    fn test_report_display() {
        let report = MemoryReport { total: 1024, in_use: 256, overhead: 128, fragments: 2 };
        assert_eq!(
            report.to_string(),
            "256 of 1024 bytes in use, 640 free in 2 fragments, 128 bytes of headers"
        );
    }

    #[test]
    fn test_is_allocated_interior() {
        let arena = test_arena(true);
        let a = alloc(&arena, 100);
        assert!(arena.is_allocated(a));
        assert!(arena.is_allocated(a.byte_add(111)));
        assert!(!arena.is_allocated(a.byte_add(112)));
        assert!(!arena.is_allocated(ArenaPtr::from_offset(0)));
    }

    #[test]
    fn test_guard_corruption_detected() {
        let arena = test_arena(false);
        let a = alloc(&arena, 100);
        assert!(arena.get_verify());

        // Scribble over the front guard of the block after `a`.
        let next_header = a.offset() + 112;
        arena.state.lock().bytes_mut()[next_header] ^= 0xFF;

        assert_eq!(
            arena.check(),
            Err(Corruption::FrontGuard { offset: next_header, found: GUARD_VALUE ^ 0xFF })
        );
        assert!(!arena.get_verify());
    }

    #[test]
    #[should_panic(expected = "arena corruption")]
    fn test_corruption_aborts_next_operation() {
        let arena = test_arena(true);
        let a = alloc(&arena, 100);
        let back_guard = a.offset() - 1;
        arena.state.lock().bytes_mut()[back_guard] = 0;
        let _ = arena.allocate(10);
    }

    #[test]
    fn test_broken_ownership_detected() {
        let arena = test_arena(false);
        let parent = alloc(&arena, 64);
        let child = alloc(&arena, 64);
        assert!(arena.attach(parent, child));

        {
            let mut state = arena.state.lock();
            let handle = state.blocks.find_by_payload(parent.offset()).unwrap();
            state.blocks[handle].first_child = None;
        }
        assert!(matches!(arena.check(), Err(Corruption::Ownership { .. })));
    }

    #[test]
    fn test_verify_pointer() {
        let arena = test_arena(true);
        let a = alloc(&arena, 64);
        arena.verify_pointer(a, false);
        arena.verify_pointer(None, true);
    }

    #[test]
    fn test_verify_pointer_accepts_interior() {
        let arena = test_arena(true);
        let a = alloc(&arena, 64);
        arena.verify_pointer(a.byte_add(16), false);
        arena.verify_pointer(a.byte_add(63), false);
    }

    #[test]
    #[should_panic(expected = "is not inside an allocated block")]
    fn test_verify_pointer_rejects_header() {
        let arena = test_arena(true);
        let _a = alloc(&arena, 64);
        let b = alloc(&arena, 64);
        arena.verify_pointer(ArenaPtr::from_offset(b.offset() - HEADER_SIZE / 2), false);
    }

    #[test]
    #[should_panic(expected = "is not inside an allocated block")]
    fn test_verify_pointer_rejects_free_block() {
        let arena = test_arena(true);
        let a = alloc(&arena, 64);
        let _b = alloc(&arena, 64);
        arena.release(a);
        arena.verify_pointer(a, false);
    }

    #[test]
    #[should_panic(expected = "empty pointer not allowed")]
    fn test_verify_pointer_rejects_empty() {
        let arena = test_arena(true);
        arena.verify_pointer(None, false);
    }

    #[test]
    fn test_high_water() {
        let arena = test_arena(true);
        assert_eq!(arena.high_water_mark(), 0);

        let a = alloc(&arena, 100);
        let b = alloc(&arena, 100);
        assert_eq!(arena.check_high_water(), b.offset() + 112);

        arena.release(b);
        assert_eq!(arena.high_water_mark(), a.offset() + 112);
        assert_eq!(arena.check_high_water(), a.offset() + 112);
    }

    #[test]
    fn test_watch_and_dump() {
        let arena = test_arena(true);
        let a = alloc(&arena, 100);
        arena.watch_address(a.byte_add(4));
        assert_eq!(arena.watched_address(), Some(a.byte_add(4)));

        let grown = arena.resize(a, 300).unwrap().unwrap();
        arena.log_block(grown, "after grow");
        arena.log_dump();
        arena.log_report();

        arena.unwatch_address(a);
        assert!(arena.watched_address().is_some());
        arena.unwatch_address(a.byte_add(4));
        assert_eq!(arena.watched_address(), None);
    }

    #[test]
    fn test_origins_are_recorded() {
        let arena = test_arena(true);
        let a = alloc(&arena, 100);
        let state = arena.state.lock();
        let handle = state.blocks.find_by_payload(a.offset()).unwrap();
        let origin = state.blocks[handle].origin.unwrap();
        assert_eq!(origin.note, "Allocate");
        assert_eq!(origin.location.file(), file!());
        assert!(state.describe(handle).contains("Allocate at"));
    }
}
