//! # Arena Allocator
//!
//! One fixed-size region, claimed at startup, that every subsystem allocates
//! through. First-fit over the address-ordered block list, splitting large
//! free blocks and coalescing neighbours on release.
//!
//! ## Locking
//!
//! All state sits behind a single mutex. Each public call locks exactly once
//! and then works on [`ArenaState`] directly, so cascading releases never
//! re-enter the lock.

use crate::config::ArenaConfig;
use crate::diagnostics::Watch;
use crate::error::{MemoryError, MemoryResult};
use crate::handle::{ArenaPtr, BlockHandle};
use crate::header::{
    align_size, stamp_guards, BlockHeader, Chunk, HeaderList, Origin, HEADER_SIZE, MIN_ALLOC_SIZE,
};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::panic::Location;

/// Source location recorded on a header.
pub(crate) type Caller = &'static Location<'static>;

// Debug fill patterns.
const FILL_ALLOCATE: u8 = 0xCC;
const FILL_SPLIT: u8 = 0xDD;
const FILL_SLACK: u8 = 0xEE;
const FILL_SHRINK: u8 = 0xAA;
const FILL_RELEASE: u8 = 0xAB;

/// Reports a misuse of the arena and aborts the operation.
#[cold]
#[track_caller]
pub(crate) fn contract_violation(message: &str) -> ! {
    tracing::error!("{message}");
    panic!("{message}");
}

/// The unlocked arena: backing bytes plus the header list.
pub(crate) struct ArenaState {
    memory: Box<[Chunk]>,
    pub(crate) blocks: HeaderList,
    pub(crate) total: usize,
    pub(crate) config: ArenaConfig,
    pub(crate) watch: Option<Watch>,
    pub(crate) high_water: usize,
}

impl ArenaState {
    fn new(config: ArenaConfig, caller: Caller) -> MemoryResult<Self> {
        config.validate()?;
        let total = config.aligned_total_size();
        let chunks = config.chunk_count();

        let mut memory = Vec::new();
        memory
            .try_reserve_exact(chunks)
            .map_err(|_| MemoryError::ArenaClaimFailed { size: total })?;
        let initial = if config.debug_fill { Chunk::FILLED } else { Chunk::ZEROED };
        memory.resize(chunks, initial);

        let mut state = Self {
            memory: memory.into_boxed_slice(),
            blocks: HeaderList::new(),
            total,
            config,
            watch: None,
            high_water: 0,
        };
        state.create_block(0, None, None, total - HEADER_SIZE, caller);
        Ok(state)
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.memory[..])
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.memory[..])
    }

    fn fill(&mut self, range: Range<usize>, value: u8) {
        if self.config.debug_fill {
            self.bytes_mut()[range].fill(value);
        }
    }

    #[inline]
    pub(crate) fn ptr_of(&self, handle: BlockHandle) -> ArenaPtr {
        ArenaPtr::from_offset(self.blocks[handle].payload_offset())
    }

    /// Records who changed a block and traces it if it is being watched.
    pub(crate) fn touch(&mut self, handle: BlockHandle, caller: Caller, note: &'static str) {
        if self.config.track_origins {
            self.blocks[handle].origin = Some(Origin { location: caller, note });
        }
        self.log_watched_change(handle, note);
    }

    /// Resolves a payload pointer or aborts.
    pub(crate) fn expect_block(&self, ptr: ArenaPtr, operation: &str) -> BlockHandle {
        self.find_in_use(ptr)
            .unwrap_or_else(|| contract_violation(&format!("{operation}: {ptr} is not an allocated block")))
    }

    /// Resolves any address inside an in-use payload or aborts.
    pub(crate) fn expect_covering(&self, ptr: ArenaPtr, operation: &str) -> BlockHandle {
        self.blocks
            .find_covering(ptr.offset(), true)
            .unwrap_or_else(|| contract_violation(&format!("{operation}: {ptr} is not inside an allocated block")))
    }

    pub(crate) fn largest_free(&self) -> usize {
        self.blocks
            .iter()
            .filter(|(_, header)| !header.is_in_use())
            .map(|(_, header)| header.size)
            .max()
            .unwrap_or(0)
    }

    fn out_of_memory(&self, requested: usize) -> MemoryError {
        let largest_free = self.largest_free();
        tracing::warn!(
            "Arena out of memory: requested {} bytes, largest free block {} bytes",
            requested,
            largest_free
        );
        MemoryError::OutOfMemory { requested, largest_free }
    }

    fn aligned_request(&self, size: usize) -> MemoryResult<usize> {
        align_size(size).ok_or_else(|| self.out_of_memory(size))
    }

    // =========================================================================
    // Block list surgery
    // =========================================================================

    /// Creates a free header at `offset` and links it between `prev` and `next`.
    fn create_block(
        &mut self,
        offset: usize,
        prev: Option<BlockHandle>,
        next: Option<BlockHandle>,
        size: usize,
        caller: Caller,
    ) -> BlockHandle {
        let handle = self.blocks.insert(BlockHeader::new(offset, size, prev, next));
        if let Some(prev) = prev {
            self.blocks[prev].next = Some(handle);
        }
        if let Some(next) = next {
            self.blocks[next].prev = Some(handle);
        }
        stamp_guards(self.bytes_mut(), offset);
        self.touch(handle, caller, "Create");
        handle
    }

    /// Merges the block after `handle` into it, destroying the merged header.
    fn absorb_next(&mut self, handle: BlockHandle, next: BlockHandle) {
        self.log_watched_change(next, "Absorbed");
        let absorbed = self.blocks.remove(next);
        let header = &mut self.blocks[handle];
        header.size += absorbed.size + HEADER_SIZE;
        header.next = absorbed.next;
        if let Some(after) = absorbed.next {
            self.blocks[after].prev = Some(handle);
        }
    }

    /// Splits everything past `keep` payload bytes into a new free block,
    /// if the remainder can hold a header and a minimum block.
    fn split_tail(&mut self, handle: BlockHandle, keep: usize, caller: Caller) -> Option<BlockHandle> {
        let header = &self.blocks[handle];
        if header.size < keep + HEADER_SIZE + MIN_ALLOC_SIZE {
            return None;
        }
        let offset = header.payload_offset() + keep;
        let tail_size = header.size - keep - HEADER_SIZE;
        let next = header.next;

        self.blocks[handle].size = keep;
        Some(self.create_block(offset, Some(handle), next, tail_size, caller))
    }

    /// Merges the free block `start` with all free neighbours on both sides.
    ///
    /// Returns the surviving block.
    fn condense(&mut self, start: BlockHandle, caller: Caller) -> BlockHandle {
        debug_assert!(!self.blocks[start].is_in_use());

        let mut start = start;
        while let Some(prev) = self.blocks[start].prev {
            if self.blocks[prev].is_in_use() {
                break;
            }
            start = prev;
        }

        while let Some(next) = self.blocks[start].next {
            if self.blocks[next].is_in_use() {
                break;
            }
            self.absorb_next(start, next);
            self.touch(start, caller, "Condense");
        }

        start
    }

    // =========================================================================
    // Allocate / release / resize
    // =========================================================================

    /// First-fit allocation of `size` bytes.
    pub(crate) fn allocate_block(&mut self, size: usize, caller: Caller) -> MemoryResult<BlockHandle> {
        let size = self.aligned_request(size)?;

        let found = self
            .blocks
            .iter()
            .find(|(_, header)| !header.is_in_use() && header.size >= size)
            .map(|(handle, _)| handle);
        let Some(handle) = found else {
            return Err(self.out_of_memory(size));
        };

        self.blocks[handle].flags.set_in_use(true);
        if let Some(tail) = self.split_tail(handle, size, caller) {
            let range = self.blocks[tail].payload();
            self.fill(range, FILL_SPLIT);
        } else {
            // Too little left to split: the caller gets the slack too.
            let payload = self.blocks[handle].payload();
            self.fill(payload.start + size..payload.end, FILL_SLACK);
        }

        let start = self.blocks[handle].payload_offset();
        self.fill(start..start + size, FILL_ALLOCATE);
        self.touch(handle, caller, "Allocate");
        Ok(handle)
    }

    /// Releases `handle` and its whole ownership subtree.
    pub(crate) fn release_block(&mut self, handle: BlockHandle, caller: Caller) {
        let doomed = self.descendants(handle);
        self.detach(handle);

        // Descendants stay in use until freed here, so none of them can be
        // merged away before its turn.
        for descendant in doomed.into_iter().rev() {
            self.free_block(descendant, caller);
        }
        self.free_block(handle, caller);
    }

    fn free_block(&mut self, handle: BlockHandle, caller: Caller) {
        let header = &mut self.blocks[handle];
        debug_assert!(header.is_in_use(), "double free of block at {}", header.offset);
        header.flags.set_in_use(false);
        header.parent = None;
        header.first_child = None;
        header.next_sibling = None;
        self.touch(handle, caller, "Release");

        let merged = self.condense(handle, caller);
        let range = self.blocks[merged].payload();
        self.fill(range, FILL_RELEASE);
    }

    pub(crate) fn resize_block(
        &mut self,
        ptr: Option<ArenaPtr>,
        new_size: usize,
        caller: Caller,
    ) -> MemoryResult<Option<ArenaPtr>> {
        let Some(ptr) = ptr else {
            if new_size == 0 {
                return Ok(None);
            }
            let handle = self.allocate_block(new_size, caller)?;
            return Ok(Some(self.ptr_of(handle)));
        };

        let handle = self.expect_block(ptr, "resize");
        if new_size == 0 {
            self.release_block(handle, caller);
            return Ok(None);
        }

        let new_size = self.aligned_request(new_size)?;
        let handle = match new_size.cmp(&self.blocks[handle].size) {
            Ordering::Greater => self.grow(handle, new_size, caller)?,
            Ordering::Less => {
                self.shrink(handle, new_size, caller);
                handle
            }
            Ordering::Equal => handle,
        };
        Ok(Some(self.ptr_of(handle)))
    }

    /// Grows in place over free neighbours, or moves the block.
    ///
    /// The move keeps the block's slot in its parent's child chain and hands
    /// all of its children to the new block. On failure nothing changes.
    fn grow(&mut self, handle: BlockHandle, new_size: usize, caller: Caller) -> MemoryResult<BlockHandle> {
        let neighbours: usize = std::iter::successors(self.blocks[handle].next, |&h| self.blocks[h].next)
            .take_while(|&h| !self.blocks[h].is_in_use())
            .map(|h| self.blocks[h].size + HEADER_SIZE)
            .sum();

        if self.blocks[handle].size + neighbours >= new_size {
            while let Some(next) = self.blocks[handle].next {
                if self.blocks[next].is_in_use() {
                    break;
                }
                self.absorb_next(handle, next);
            }
            self.split_tail(handle, new_size, caller);
            self.touch(handle, caller, "Grow");
            return Ok(handle);
        }

        let moved = self.allocate_block(new_size, caller)?;
        let old_payload = self.blocks[handle].payload();
        let destination = self.blocks[moved].payload_offset();
        self.bytes_mut().copy_within(old_payload, destination);

        self.transfer_ownership(handle, moved);
        self.release_block(handle, caller);
        self.touch(moved, caller, "Move");
        Ok(moved)
    }

    /// Shrinks in place, returning the tail to the free list when it is
    /// large enough to be a block of its own.
    fn shrink(&mut self, handle: BlockHandle, new_size: usize, caller: Caller) {
        if let Some(tail) = self.split_tail(handle, new_size, caller) {
            let merged = self.condense(tail, caller);
            let range = self.blocks[merged].payload();
            self.fill(range, FILL_SHRINK);
            self.touch(handle, caller, "Shrink");
        }
    }

    // =========================================================================
    // Payload access
    // =========================================================================

    /// In-use block whose payload starts at `ptr`.
    fn find_in_use(&self, ptr: ArenaPtr) -> Option<BlockHandle> {
        self.blocks
            .find_by_payload(ptr.offset())
            .filter(|&h| self.blocks[h].is_in_use())
    }

    /// Byte range of `len` bytes at `offset` inside the payload of `ptr`.
    fn access(&self, ptr: ArenaPtr, offset: usize, len: usize) -> MemoryResult<Range<usize>> {
        let handle = self.find_in_use(ptr).ok_or(MemoryError::InvalidPointer(ptr))?;
        let header = &self.blocks[handle];
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= header.size)
            .ok_or(MemoryError::OutOfBounds { ptr, offset, len, size: header.size })?;
        Ok(header.payload_offset() + offset..header.payload_offset() + end)
    }

    fn payload_of(&self, ptr: ArenaPtr) -> MemoryResult<Range<usize>> {
        self.find_in_use(ptr)
            .map(|h| self.blocks[h].payload())
            .ok_or(MemoryError::InvalidPointer(ptr))
    }
}

/// The arena allocator.
///
/// One instance backs every allocation-consuming subsystem; share it with
/// an `Arc`. All operations are serialized by an internal mutex.
///
/// # Example
///
/// ```rust,ignore
/// let arena = Arena::with_capacity(megabytes(64))?;
///
/// let level = arena.allocate(4096)?.expect("non-zero size");
/// let entities = arena.allocate(1024)?.expect("non-zero size");
/// arena.attach(level, entities);
///
/// // Releases `entities` too.
/// arena.release(level);
/// ```
pub struct Arena {
    pub(crate) state: Mutex<ArenaState>,
    capacity: usize,
}

impl Arena {
    /// Claims the arena's memory and sets up a single free block.
    ///
    /// # Errors
    ///
    /// [`MemoryError::ArenaTooSmall`] if the configured size is unusable,
    /// [`MemoryError::ArenaClaimFailed`] if the memory cannot be reserved.
    #[track_caller]
    pub fn new(config: ArenaConfig) -> MemoryResult<Self> {
        let state = ArenaState::new(config, Location::caller())?;
        let capacity = state.total;
        tracing::info!("Memory arena initialized: {} bytes", capacity);
        Ok(Self {
            state: Mutex::new(state),
            capacity,
        })
    }

    /// Creates an arena of `total_size` bytes with the default settings.
    ///
    /// # Errors
    ///
    /// Same as [`Arena::new`].
    #[track_caller]
    pub fn with_capacity(total_size: usize) -> MemoryResult<Self> {
        Self::new(ArenaConfig::default().with_total_size(total_size))
    }

    /// Usable size of the arena in bytes, headers included.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a copy of the configuration the arena runs with.
    #[must_use]
    pub fn config(&self) -> ArenaConfig {
        self.state.lock().config.clone()
    }

    /// Logs a final report and releases the arena's memory.
    ///
    /// Every outstanding [`ArenaPtr`] is meaningless afterwards.
    pub fn teardown(self) {
        let report = self.report();
        tracing::info!(
            "Memory arena torn down: {} of {} bytes still in use",
            report.in_use,
            report.total
        );
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request.
    ///
    /// # Errors
    ///
    /// [`MemoryError::OutOfMemory`] when no free block is large enough. The
    /// arena is unchanged in that case.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> MemoryResult<Option<ArenaPtr>> {
        if size == 0 {
            return Ok(None);
        }
        let caller = Location::caller();
        let mut state = self.state.lock();
        state.verify_if_checked();
        let result = state.allocate_block(size, caller).map(|h| Some(state.ptr_of(h)));
        state.verify_if_checked();
        result
    }

    /// Allocates `count * member_size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// [`MemoryError::OutOfMemory`] if the product overflows or does not fit.
    #[track_caller]
    pub fn allocate_zeroed(&self, count: usize, member_size: usize) -> MemoryResult<Option<ArenaPtr>> {
        let caller = Location::caller();
        let mut state = self.state.lock();
        let Some(size) = count.checked_mul(member_size) else {
            return Err(state.out_of_memory(usize::MAX));
        };
        if size == 0 {
            return Ok(None);
        }

        state.verify_if_checked();
        let handle = state.allocate_block(size, caller)?;
        let payload = state.blocks[handle].payload();
        state.bytes_mut()[payload].fill(0);
        state.verify_if_checked();
        Ok(Some(state.ptr_of(handle)))
    }

    /// Resizes an allocation, possibly moving it.
    ///
    /// - `new_size == 0` releases `ptr` and returns `Ok(None)`
    /// - an empty `ptr` behaves like [`Arena::allocate`]
    /// - shrinking always returns the same pointer
    /// - growing returns the same pointer if the following free space is
    ///   enough, otherwise the data and the ownership links move
    ///
    /// # Errors
    ///
    /// [`MemoryError::OutOfMemory`] if the block cannot grow; the existing
    /// allocation is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an allocated block.
    #[track_caller]
    pub fn resize(&self, ptr: impl Into<Option<ArenaPtr>>, new_size: usize) -> MemoryResult<Option<ArenaPtr>> {
        let caller = Location::caller();
        let ptr = ptr.into();
        let mut state = self.state.lock();
        state.verify_if_checked();
        let result = state.resize_block(ptr, new_size, caller);
        state.verify_if_checked();
        result
    }

    /// Releases an allocation and everything attached below it.
    ///
    /// Releasing an empty pointer does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an allocated block (double release included).
    #[track_caller]
    pub fn release(&self, ptr: impl Into<Option<ArenaPtr>>) {
        let Some(ptr) = ptr.into() else {
            return;
        };
        let caller = Location::caller();
        let mut state = self.state.lock();
        state.verify_if_checked();
        let handle = state.expect_block(ptr, "release");
        state.release_block(handle, caller);
        state.verify_if_checked();
    }

    /// Payload size of an allocated block, slack included.
    #[must_use]
    pub fn size_of(&self, ptr: ArenaPtr) -> Option<usize> {
        let state = self.state.lock();
        state.find_in_use(ptr).map(|h| state.blocks[h].size)
    }

    /// Copies `data` into the payload of `ptr` at `offset`.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidPointer`] or [`MemoryError::OutOfBounds`].
    pub fn write(&self, ptr: ArenaPtr, offset: usize, data: &[u8]) -> MemoryResult<()> {
        let mut state = self.state.lock();
        let range = state.access(ptr, offset, data.len())?;
        state.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Copies payload bytes of `ptr` starting at `offset` into `out`.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidPointer`] or [`MemoryError::OutOfBounds`].
    pub fn read(&self, ptr: ArenaPtr, offset: usize, out: &mut [u8]) -> MemoryResult<()> {
        let state = self.state.lock();
        let range = state.access(ptr, offset, out.len())?;
        out.copy_from_slice(&state.bytes()[range]);
        Ok(())
    }

    /// Runs `f` over the whole payload of `ptr`.
    ///
    /// The arena stays locked while `f` runs; `f` must not call back into
    /// the arena.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidPointer`] if `ptr` is not allocated.
    pub fn with_bytes<R>(&self, ptr: ArenaPtr, f: impl FnOnce(&[u8]) -> R) -> MemoryResult<R> {
        let state = self.state.lock();
        let range = state.payload_of(ptr)?;
        Ok(f(&state.bytes()[range]))
    }

    /// Runs `f` over the whole payload of `ptr`, mutably.
    ///
    /// The arena stays locked while `f` runs; `f` must not call back into
    /// the arena.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidPointer`] if `ptr` is not allocated.
    pub fn with_bytes_mut<R>(&self, ptr: ArenaPtr, f: impl FnOnce(&mut [u8]) -> R) -> MemoryResult<R> {
        let mut state = self.state.lock();
        let range = state.payload_of(ptr)?;
        Ok(f(&mut state.bytes_mut()[range]))
    }

    /// Runs `f` over the payload of `ptr` viewed as a slice of `T`.
    ///
    /// Payloads are 16-byte aligned, so any `Pod` type with an alignment up
    /// to 16 can be viewed. Trailing bytes that do not fill a whole `T` are
    /// left out of the slice.
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidPointer`] if `ptr` is not allocated,
    /// [`MemoryError::TypedView`] if the bytes cannot be cast.
    pub fn with_slice_mut<T: Pod, R>(&self, ptr: ArenaPtr, f: impl FnOnce(&mut [T]) -> R) -> MemoryResult<R> {
        let mut state = self.state.lock();
        let range = state.payload_of(ptr)?;
        let element = std::mem::size_of::<T>().max(1);
        let usable = range.len() / element * element;
        let bytes = &mut state.bytes_mut()[range.start..range.start + usable];
        let slice = bytemuck::try_cast_slice_mut(bytes).map_err(|reason| MemoryError::TypedView { ptr, reason })?;
        Ok(f(slice))
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
