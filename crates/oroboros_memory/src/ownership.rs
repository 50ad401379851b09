//! # Ownership Tree
//!
//! Blocks can own other blocks. Releasing an owner releases everything
//! below it, so a level, an entity list and all per-entity buffers can be
//! dropped with one call.
//!
//! The tree uses `parent` / `first_child` / `next_sibling` links on the
//! headers. New children go to the end of the sibling chain.

use crate::arena::{Arena, ArenaState};
use crate::handle::{ArenaPtr, BlockHandle};
use std::panic::Location;

impl ArenaState {
    /// Direct children of `parent`, in chain order.
    pub(crate) fn children(&self, parent: BlockHandle) -> impl Iterator<Item = BlockHandle> + '_ {
        std::iter::successors(self.blocks[parent].first_child, move |&c| self.blocks[c].next_sibling)
    }

    /// Owners of `handle`, nearest first.
    pub(crate) fn ancestors(&self, handle: BlockHandle) -> impl Iterator<Item = BlockHandle> + '_ {
        std::iter::successors(self.blocks[handle].parent, move |&p| self.blocks[p].parent)
    }

    /// Every block owned by `root`, directly or not, parents before children.
    pub(crate) fn descendants(&self, root: BlockHandle) -> Vec<BlockHandle> {
        let mut order = Vec::new();
        let mut stack: Vec<BlockHandle> = self.children(root).collect();
        stack.reverse();

        while let Some(handle) = stack.pop() {
            order.push(handle);
            let start = stack.len();
            stack.extend(self.children(handle));
            stack[start..].reverse();
        }
        order
    }

    /// The sibling linking to `child` in `parent`'s chain, `None` when
    /// `child` is the first child.
    fn sibling_before(&self, parent: BlockHandle, child: BlockHandle) -> Option<BlockHandle> {
        self.children(parent)
            .find(|&sibling| self.blocks[sibling].next_sibling == Some(child))
    }

    /// Unlinks `child` from its parent's chain. Roots are left alone.
    pub(crate) fn detach(&mut self, child: BlockHandle) {
        let Some(parent) = self.blocks[child].parent else {
            return;
        };
        let next = self.blocks[child].next_sibling;
        let before = self.sibling_before(parent, child);

        match before {
            Some(before) => self.blocks[before].next_sibling = next,
            None => self.blocks[parent].first_child = next,
        }

        let header = &mut self.blocks[child];
        header.parent = None;
        header.next_sibling = None;
    }

    /// Appends an unowned `child` to the end of `parent`'s chain.
    fn append_child(&mut self, parent: BlockHandle, child: BlockHandle) {
        debug_assert!(self.blocks[child].parent.is_none());

        let last = self.children(parent).last();
        match last {
            Some(last) => self.blocks[last].next_sibling = Some(child),
            None => self.blocks[parent].first_child = Some(child),
        }
        let header = &mut self.blocks[child];
        header.parent = Some(parent);
        header.next_sibling = None;
    }

    /// Turns every child of `parent` into a root.
    fn detach_children(&mut self, parent: BlockHandle) {
        let children: Vec<BlockHandle> = self.children(parent).collect();
        self.blocks[parent].first_child = None;
        for child in children {
            let header = &mut self.blocks[child];
            header.parent = None;
            header.next_sibling = None;
        }
    }

    /// Moves `old`'s place in the tree to `new`.
    ///
    /// `new` takes `old`'s slot in its parent's chain and adopts all of its
    /// children. `old` ends up with no links at all.
    pub(crate) fn transfer_ownership(&mut self, old: BlockHandle, new: BlockHandle) {
        debug_assert!(!self.blocks[new].has_ownership_links());

        let parent = self.blocks[old].parent;
        if let Some(parent) = parent {
            match self.sibling_before(parent, old) {
                Some(before) => self.blocks[before].next_sibling = Some(new),
                None => self.blocks[parent].first_child = Some(new),
            }
        }

        let children: Vec<BlockHandle> = self.children(old).collect();
        for child in children {
            self.blocks[child].parent = Some(new);
        }

        let old = &mut self.blocks[old];
        let (first_child, next_sibling) = (old.first_child.take(), old.next_sibling.take());
        old.parent = None;

        let new = &mut self.blocks[new];
        new.parent = parent;
        new.first_child = first_child;
        new.next_sibling = next_sibling;
    }
}

impl Arena {
    /// Makes `parent` the owner of `child`.
    ///
    /// `child` leaves its current owner first, and lands at the end of
    /// `parent`'s children. Interior pointers are accepted for both.
    ///
    /// # Returns
    ///
    /// `false` without changing anything if `child` is `parent` or one of
    /// its owners.
    ///
    /// # Panics
    ///
    /// Panics if either pointer is not inside an allocated block.
    #[track_caller]
    pub fn attach(&self, parent: ArenaPtr, child: ArenaPtr) -> bool {
        let caller = Location::caller();
        let mut state = self.state.lock();
        state.verify_if_checked();

        let parent_handle = state.expect_covering(parent, "attach");
        let child_handle = state.expect_covering(child, "attach");
        if parent_handle == child_handle || state.ancestors(parent_handle).any(|a| a == child_handle) {
            tracing::warn!("Refused to attach {} to {}: would create an ownership cycle", child, parent);
            return false;
        }

        state.detach(child_handle);
        state.append_child(parent_handle, child_handle);
        state.touch(child_handle, caller, "Attach");
        state.verify_if_checked();
        true
    }

    /// Makes `child` a root. It will outlive its former owner.
    ///
    /// # Panics
    ///
    /// Panics if `child` is not inside an allocated block.
    #[track_caller]
    pub fn detach_from_parent(&self, child: ArenaPtr) {
        let caller = Location::caller();
        let mut state = self.state.lock();
        state.verify_if_checked();

        let handle = state.expect_covering(child, "detach");
        state.detach(handle);
        state.touch(handle, caller, "Detach");
        state.verify_if_checked();
    }

    /// Makes every child of `parent` a root.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is not inside an allocated block.
    #[track_caller]
    pub fn detach_all_children(&self, parent: ArenaPtr) {
        let caller = Location::caller();
        let mut state = self.state.lock();
        state.verify_if_checked();

        let handle = state.expect_covering(parent, "detach children");
        state.detach_children(handle);
        state.touch(handle, caller, "Detach");
        state.verify_if_checked();
    }

    /// Owner of the block containing `ptr`, if any.
    #[must_use]
    pub fn parent_of(&self, ptr: ArenaPtr) -> Option<ArenaPtr> {
        let state = self.state.lock();
        let handle = state.blocks.find_covering(ptr.offset(), true)?;
        state.blocks[handle].parent.map(|p| state.ptr_of(p))
    }

    /// Blocks directly owned by the block containing `ptr`, in order.
    #[must_use]
    pub fn children_of(&self, ptr: ArenaPtr) -> Vec<ArenaPtr> {
        let state = self.state.lock();
        state
            .blocks
            .find_covering(ptr.offset(), true)
            .map(|handle| state.children(handle).map(|c| state.ptr_of(c)).collect())
            .unwrap_or_default()
    }
}
