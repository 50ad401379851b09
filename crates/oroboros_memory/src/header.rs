//! # Block Header List
//!
//! Every byte of the arena belongs to exactly one block. Blocks are laid out
//! back to back and linked in address order:
//!
//! ```text
//!   offset 0                                                       total
//!   ┌────────┬──────────────┬────────┬─────────┬────────┬──────────┐
//!   │ header │   payload    │ header │ payload │ header │ payload  │
//!   │ (64 B) │  (in use)    │ (64 B) │ (free)  │ (64 B) │ (in use) │
//!   └────────┴──────────────┴────────┴─────────┴────────┴──────────┘
//!        ▲ prev/next ───────────▲ prev/next ─────────▲
//! ```
//!
//! The header region in the arena only carries the two guard values. The
//! bookkeeping itself lives in a slot pool indexed by [`BlockHandle`], with
//! a second index from payload offset to handle for pointer lookups.

use crate::handle::BlockHandle;
use bytemuck::{Pod, Zeroable};
use std::collections::BTreeMap;
use std::ops::{Index, IndexMut, Range};
use std::panic::Location;

/// Alignment of every header, payload and payload size.
pub const ALIGN: usize = 16;

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = 64;

/// Smallest payload worth splitting off as its own block.
pub const MIN_ALLOC_SIZE: usize = ALIGN;

/// Sentinel stamped at both ends of every header region.
pub const GUARD_VALUE: u32 = 0xDEAD_BEEF;

const GUARD_BYTES: usize = std::mem::size_of::<u32>();

/// Rounds `size` up to the next multiple of [`ALIGN`], `None` on overflow.
#[inline]
#[must_use]
pub const fn align_size(size: usize) -> Option<usize> {
    match size.checked_add(ALIGN - 1) {
        Some(padded) => Some(padded / ALIGN * ALIGN),
        None => None,
    }
}

/// Rounds `size` down to a multiple of [`ALIGN`].
#[inline]
#[must_use]
pub const fn align_down(size: usize) -> usize {
    size / ALIGN * ALIGN
}

/// One aligned unit of arena storage.
///
/// The arena is a slice of these, so every aligned offset is also aligned
/// in real memory.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(16))]
#[allow(dead_code)]
pub(crate) struct Chunk([u8; ALIGN]);

impl Chunk {
    pub(crate) const FILLED: Self = Self([0xFF; ALIGN]);
    pub(crate) const ZEROED: Self = Self([0; ALIGN]);
}

/// Writes both guard values into the header region at `offset`.
pub(crate) fn stamp_guards(bytes: &mut [u8], offset: usize) {
    let guard = GUARD_VALUE.to_le_bytes();
    bytes[offset..offset + GUARD_BYTES].copy_from_slice(&guard);
    let back = offset + HEADER_SIZE - GUARD_BYTES;
    bytes[back..back + GUARD_BYTES].copy_from_slice(&guard);
}

/// Reads the (front, back) guard values of the header region at `offset`.
pub(crate) fn read_guards(bytes: &[u8], offset: usize) -> (u32, u32) {
    let back = offset + HEADER_SIZE - GUARD_BYTES;
    let front: u32 = bytemuck::pod_read_unaligned(&bytes[offset..offset + GUARD_BYTES]);
    let back: u32 = bytemuck::pod_read_unaligned(&bytes[back..back + GUARD_BYTES]);
    (u32::from_le(front), u32::from_le(back))
}

/// Block state bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BlockFlags(u32);

impl BlockFlags {
    const IN_USE: u32 = 1 << 31;

    #[inline]
    pub(crate) const fn is_in_use(self) -> bool {
        self.0 & Self::IN_USE != 0
    }

    #[inline]
    pub(crate) fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.0 |= Self::IN_USE;
        } else {
            self.0 &= !Self::IN_USE;
        }
    }
}

/// Where a block was last changed, and how.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Origin {
    pub location: &'static Location<'static>,
    pub note: &'static str,
}

/// Bookkeeping for one block.
#[derive(Clone, Debug)]
pub(crate) struct BlockHeader {
    /// Offset of the header region in the arena.
    pub offset: usize,
    /// Payload bytes following the header.
    pub size: usize,
    pub flags: BlockFlags,

    // Address-ordered neighbours.
    pub prev: Option<BlockHandle>,
    pub next: Option<BlockHandle>,

    // Ownership tree.
    pub parent: Option<BlockHandle>,
    pub first_child: Option<BlockHandle>,
    pub next_sibling: Option<BlockHandle>,

    pub origin: Option<Origin>,
}

impl BlockHeader {
    /// Creates a free, unowned header.
    pub(crate) fn new(
        offset: usize,
        size: usize,
        prev: Option<BlockHandle>,
        next: Option<BlockHandle>,
    ) -> Self {
        Self {
            offset,
            size,
            flags: BlockFlags::default(),
            prev,
            next,
            parent: None,
            first_child: None,
            next_sibling: None,
            origin: None,
        }
    }

    #[inline]
    pub(crate) const fn payload_offset(&self) -> usize {
        self.offset + HEADER_SIZE
    }

    /// One past the last payload byte.
    #[inline]
    pub(crate) const fn end(&self) -> usize {
        self.payload_offset() + self.size
    }

    #[inline]
    pub(crate) fn payload(&self) -> Range<usize> {
        self.payload_offset()..self.end()
    }

    /// Header and payload together.
    #[inline]
    pub(crate) fn span(&self) -> Range<usize> {
        self.offset..self.end()
    }

    #[inline]
    pub(crate) const fn is_in_use(&self) -> bool {
        self.flags.is_in_use()
    }

    #[inline]
    pub(crate) const fn has_ownership_links(&self) -> bool {
        self.parent.is_some() || self.first_child.is_some() || self.next_sibling.is_some()
    }
}

/// The pool of live headers plus the address index.
///
/// Slots are recycled like the engine's pool allocator: destroyed headers
/// push their slot onto a free list.
pub(crate) struct HeaderList {
    slots: Vec<Option<BlockHeader>>,
    free_slots: Vec<u32>,
    by_payload: BTreeMap<usize, BlockHandle>,
    head: Option<BlockHandle>,
}

impl HeaderList {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::with_capacity(64),
            free_slots: Vec::new(),
            by_payload: BTreeMap::new(),
            head: None,
        }
    }

    /// First block in address order.
    #[inline]
    pub(crate) const fn head(&self) -> Option<BlockHandle> {
        self.head
    }

    /// Number of live headers.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.by_payload.len()
    }

    /// Stores a header and returns its handle.
    ///
    /// Does not touch the neighbours' links; the caller does.
    pub(crate) fn insert(&mut self, header: BlockHeader) -> BlockHandle {
        let payload = header.payload_offset();
        let is_head = header.prev.is_none();
        let handle = if let Some(index) = self.free_slots.pop() {
            self.slots[index as usize] = Some(header);
            BlockHandle::new(index)
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
                panic!("header pool exhausted at {} blocks", self.slots.len())
            });
            self.slots.push(Some(header));
            BlockHandle::new(index)
        };
        self.by_payload.insert(payload, handle);
        if is_head {
            self.head = Some(handle);
        }
        handle
    }

    /// Destroys a header, returning its last state.
    pub(crate) fn remove(&mut self, handle: BlockHandle) -> BlockHeader {
        let header = self.slots[handle.index()]
            .take()
            .unwrap_or_else(|| panic!("stale block handle {handle:?}"));
        self.by_payload.remove(&header.payload_offset());
        if self.head == Some(handle) {
            self.head = header.next;
        }
        self.free_slots.push(handle.index() as u32);
        header
    }

    /// Looks up the block whose payload starts exactly at `payload`.
    pub(crate) fn find_by_payload(&self, payload: usize) -> Option<BlockHandle> {
        self.by_payload.get(&payload).copied()
    }

    /// Looks up the block whose payload contains `address`.
    pub(crate) fn find_covering(&self, address: usize, ensure_in_use: bool) -> Option<BlockHandle> {
        let (_, &handle) = self.by_payload.range(..=address).next_back()?;
        let header = &self[handle];
        let covers = address < header.end();
        (covers && (!ensure_in_use || header.is_in_use())).then_some(handle)
    }

    /// Walks the blocks in address order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockHandle, &BlockHeader)> + '_ {
        std::iter::successors(self.head, move |&h| self[h].next).map(move |h| (h, &self[h]))
    }

    /// Whether `handle` names a live header.
    #[inline]
    pub(crate) fn contains(&self, handle: BlockHandle) -> bool {
        matches!(self.slots.get(handle.index()), Some(Some(_)))
    }
}

impl Index<BlockHandle> for HeaderList {
    type Output = BlockHeader;

    fn index(&self, handle: BlockHandle) -> &BlockHeader {
        match self.slots.get(handle.index()) {
            Some(Some(header)) => header,
            _ => panic!("stale block handle {handle:?}"),
        }
    }
}

impl IndexMut<BlockHandle> for HeaderList {
    fn index_mut(&mut self, handle: BlockHandle) -> &mut BlockHeader {
        match self.slots.get_mut(handle.index()) {
            Some(Some(header)) => header,
            _ => panic!("stale block handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(0), Some(0));
        assert_eq!(align_size(1), Some(ALIGN));
        assert_eq!(align_size(100), Some(112));
        assert_eq!(align_size(112), Some(112));
        assert_eq!(align_size(usize::MAX), None);
        assert_eq!(align_down(1000), 992);
    }

    #[test]
    fn test_header_size_is_aligned() {
        assert_eq!(HEADER_SIZE % ALIGN, 0);
        assert!(HEADER_SIZE >= 2 * GUARD_BYTES);
        assert_eq!(std::mem::size_of::<Chunk>(), ALIGN);
        assert_eq!(std::mem::align_of::<Chunk>(), ALIGN);
    }

    #[test]
    fn test_guard_stamping() {
        let mut bytes = vec![0u8; HEADER_SIZE * 2];
        stamp_guards(&mut bytes, HEADER_SIZE);
        assert_eq!(read_guards(&bytes, HEADER_SIZE), (GUARD_VALUE, GUARD_VALUE));
        assert_eq!(read_guards(&bytes, 0), (0, 0));

        bytes[HEADER_SIZE * 2 - 1] = 0;
        assert_ne!(read_guards(&bytes, HEADER_SIZE).1, GUARD_VALUE);
    }

    #[test]
    fn test_flags() {
        let mut flags = BlockFlags::default();
        assert!(!flags.is_in_use());
        flags.set_in_use(true);
        assert!(flags.is_in_use());
        flags.set_in_use(false);
        assert!(!flags.is_in_use());
    }

    #[test]
    fn test_list_lookup_and_slot_reuse() {
        let mut list = HeaderList::new();
        let first = list.insert(BlockHeader::new(0, 128, None, None));
        let second = list.insert(BlockHeader::new(HEADER_SIZE + 128, 64, Some(first), None));
        list[first].next = Some(second);
        list[first].flags.set_in_use(true);

        assert_eq!(list.head(), Some(first));
        assert_eq!(list.len(), 2);
        assert_eq!(list.find_by_payload(HEADER_SIZE), Some(first));
        assert_eq!(list.find_covering(HEADER_SIZE + 127, true), Some(first));
        assert_eq!(list.find_covering(HEADER_SIZE + 128, false), None);
        assert_eq!(list.find_covering(2 * HEADER_SIZE + 128, false), Some(second));
        assert_eq!(list.find_covering(2 * HEADER_SIZE + 128, true), None);
        assert_eq!(list.iter().count(), 2);

        list[first].next = None;
        let removed = list.remove(second);
        assert_eq!(removed.size, 64);
        assert!(!list.contains(second));

        let third = list.insert(BlockHeader::new(HEADER_SIZE + 128, 32, Some(first), None));
        assert_eq!(third, second);
    }
}
