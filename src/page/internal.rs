//! Internal page layout.
//!
//! Internal page format:
//!
//! ```text
//! | header (20 bytes) | key(0) child(0) | key(1) child(1) | ... |
//! ```
//!
//! The page represents `child(0) | key(1) child(1) | ... | key(n) child(n)`:
//! the key in slot 0 is a sentinel and ignored during lookup, and a key
//! `K` belongs to `child(i)`'s subtree when `key(i) <= K < key(i + 1)`.
//!
//! Moving a child between internal pages rewrites the child's parent
//! pointer, which goes through the buffer pool (fetch, mutate, unpin dirty).
//! The child page is not latched for that write: the mover holds the write
//! latches of the structural region, and parent pointers are only ever read
//! under those same latches.

use super::{
    init_header, node_max_size, node_page_id, node_parent_id, node_size, read_i32, read_i64,
    set_node_parent_id, set_node_size, write_i32, write_i64, ENTRY_SIZE, INTERNAL_HEADER_SIZE,
};
use crate::buffer::{BufferPoolManager, Frame};
use crate::error::{Result, StorageError};
use crate::types::{Key, NodeType, PageId};

/// Typed view of an internal page living in a frame's byte buffer.
///
/// Reads need the frame's read latch; mutation needs the write latch.
pub struct InternalView<'a> {
    frame: &'a Frame,
}

impl<'a> InternalView<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Self { frame }
    }

    /// Initialise a fresh internal page in-place
    pub fn init(&mut self, page_id: PageId, parent_id: PageId, max_size: usize) {
        init_header(
            self.frame.data_mut(),
            NodeType::Internal,
            page_id,
            parent_id,
            max_size,
        );
    }

    pub fn size(&self) -> usize {
        node_size(self.frame.data())
    }

    pub fn max_size(&self) -> usize {
        node_max_size(self.frame.data())
    }

    pub fn page_id(&self) -> PageId {
        node_page_id(self.frame.data())
    }

    pub fn parent_id(&self) -> PageId {
        node_parent_id(self.frame.data())
    }

    pub fn key_at(&self, index: usize) -> Key {
        read_i64(self.frame.data(), Self::offset(index))
    }

    /// Overwrite a separator key. Slot 0 is the sentinel; the tree only
    /// writes it through the move operations.
    pub fn set_key_at(&mut self, index: usize, key: Key) {
        debug_assert!(index > 0);
        write_i64(self.frame.data_mut(), Self::offset(index), key);
    }

    pub fn child_at(&self, index: usize) -> PageId {
        PageId::new(read_i32(self.frame.data(), Self::offset(index) + 8))
    }

    /// Slot of the given child page id, scanning left to right
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == child)
    }

    /// Child to descend into for `key`: the child left of the first
    /// separator greater than `key`, or the last child.
    ///
    /// The search starts at slot 1; the slot-0 key is ignored.
    pub fn lookup(&self, key: Key) -> PageId {
        let size = self.size();
        for i in 1..size {
            if key < self.key_at(i) {
                return self.child_at(i - 1);
            }
        }
        self.child_at(size - 1)
    }

    /// Turn an empty page into a two-child root, placing the lesser page id
    /// in slot 0.
    pub fn populate_new_root(&mut self, old_child: PageId, key: Key, new_child: PageId) {
        debug_assert_eq!(self.size(), 0);
        let (left, right) = if old_child.value() <= new_child.value() {
            (old_child, new_child)
        } else {
            (new_child, old_child)
        };

        let data = self.frame.data_mut();
        write_i32(data, Self::offset(0) + 8, left.value());
        write_i64(data, Self::offset(1), key);
        write_i32(data, Self::offset(1) + 8, right.value());
        set_node_size(data, 2);
    }

    /// Insert `(key, new_child)` immediately after the entry holding
    /// `old_child`.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: Key,
        new_child: PageId,
    ) -> Result<()> {
        let index = self.value_index(old_child).ok_or_else(|| {
            StorageError::invariant(format!(
                "page {} is not a child of page {}",
                old_child,
                self.page_id()
            ))
        })?;
        // Internal pages hold one entry above their configured maximum
        // between the overflowing insert and the split, so the bound here is
        // the page's physical capacity.
        let size = self.size();
        debug_assert!(size < super::INTERNAL_MAX_ENTRIES);

        let data = self.frame.data_mut();
        let start = Self::offset(index + 1);
        data.copy_within(start..Self::offset(size), start + ENTRY_SIZE);
        write_i64(data, start, key);
        write_i32(data, start + 8, new_child.value());
        set_node_size(data, size + 1);
        Ok(())
    }

    /// Remove the entry at `index`, shifting the tail left
    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        debug_assert!(index < size);

        let data = self.frame.data_mut();
        data.copy_within(Self::offset(index + 1)..Self::offset(size), Self::offset(index));
        set_node_size(data, size - 1);
    }

    /// Empty a single-child page and return that child.
    ///
    /// Root demotion only: the caller promotes the returned page.
    pub fn remove_only_child(&mut self) -> PageId {
        debug_assert_eq!(self.size(), 1);
        let child = self.child_at(0);
        set_node_size(self.frame.data_mut(), 0);
        child
    }

    /// Move the upper half of this page's entries to an empty recipient,
    /// re-parenting every moved child.
    ///
    /// The suffix starting at `ceil(size / 2)` moves, so this page keeps the
    /// larger half. The moved chunk's first key lands in the recipient's
    /// sentinel slot, where the caller reads it back as the key to push up.
    pub fn move_half_to(
        &mut self,
        recipient: &mut InternalView,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size();
        let move_start = (size + 1) / 2;

        recipient.append_raw(self.raw_entries(move_start, size), pool)?;
        set_node_size(self.frame.data_mut(), move_start);
        Ok(())
    }

    /// Move every entry to the recipient (assumed to be the left sibling),
    /// re-parenting every moved child.
    ///
    /// `middle_key` is the separator from the parent; it overwrites the
    /// first moved entry's sentinel key slot so the separator survives the
    /// merge.
    pub fn move_all_to(
        &mut self,
        recipient: &mut InternalView,
        middle_key: Key,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        let size = self.size();
        let join = recipient.size();

        recipient.append_raw(self.raw_entries(0, size), pool)?;
        recipient.set_key_at(join, middle_key);
        set_node_size(self.frame.data_mut(), 0);
        Ok(())
    }

    /// Move this page's first child to the end of the recipient (its left
    /// sibling), attaching it under `middle_key` from the parent.
    ///
    /// Afterwards this page's new sentinel key is the separator the caller
    /// writes back into the parent.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut InternalView,
        middle_key: Key,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        let size = self.size();
        let child = self.child_at(0);

        let rsize = recipient.size();
        let rdata = recipient.frame.data_mut();
        write_i64(rdata, Self::offset(rsize), middle_key);
        write_i32(rdata, Self::offset(rsize) + 8, child.value());
        set_node_size(rdata, rsize + 1);
        adopt(pool, child, recipient.page_id())?;

        let data = self.frame.data_mut();
        data.copy_within(Self::offset(1)..Self::offset(size), Self::offset(0));
        set_node_size(data, size - 1);
        Ok(())
    }

    /// Move this page's last child to the front of the recipient (its right
    /// sibling).
    ///
    /// The recipient shifts right by one slot; `middle_key` from the parent
    /// becomes the key over the recipient's old first child, and the moved
    /// entry (key intact) becomes the new sentinel slot, where the caller
    /// reads the separator to write back into the parent.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut InternalView,
        middle_key: Key,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        let size = self.size();
        let key = self.key_at(size - 1);
        let child = self.child_at(size - 1);

        let rsize = recipient.size();
        let rdata = recipient.frame.data_mut();
        rdata.copy_within(
            Self::offset(0)..Self::offset(rsize),
            Self::offset(0) + ENTRY_SIZE,
        );
        write_i64(rdata, Self::offset(1), middle_key);
        write_i64(rdata, Self::offset(0), key);
        write_i32(rdata, Self::offset(0) + 8, child.value());
        set_node_size(rdata, rsize + 1);
        adopt(pool, child, recipient.page_id())?;

        set_node_size(self.frame.data_mut(), size - 1);
        Ok(())
    }

    fn raw_entries(&self, from: usize, to: usize) -> &[u8] {
        &self.frame.data()[Self::offset(from)..Self::offset(to)]
    }

    /// Append whole encoded entries at the tail and adopt their children
    fn append_raw(&mut self, bytes: &[u8], pool: &BufferPoolManager) -> Result<()> {
        let n = bytes.len() / ENTRY_SIZE;
        let size = self.size();
        debug_assert!(size + n <= super::INTERNAL_MAX_ENTRIES);

        let data = self.frame.data_mut();
        let start = Self::offset(size);
        data[start..start + bytes.len()].copy_from_slice(bytes);
        set_node_size(data, size + n);

        let parent = self.page_id();
        for i in size..size + n {
            adopt(pool, self.child_at(i), parent)?;
        }
        Ok(())
    }

    const fn offset(index: usize) -> usize {
        INTERNAL_HEADER_SIZE + index * ENTRY_SIZE
    }
}

/// Rewrite a moved child's parent pointer through the buffer pool
fn adopt(pool: &BufferPoolManager, child: PageId, new_parent: PageId) -> Result<()> {
    let frame = pool.fetch_page(child)?;
    set_node_parent_id(frame.data_mut(), new_parent);
    pool.unpin_page(child, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LeafView;
    use crate::storage::DiskManager;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn test_pool(size: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(&dir.path().join("test.db")).unwrap();
        (BufferPoolManager::new(size, disk), dir)
    }

    /// Allocate `n` leaf pages to act as children, unpinned
    fn make_children(pool: &BufferPoolManager, n: usize) -> Vec<PageId> {
        (0..n)
            .map(|_| {
                let frame = pool.new_page().unwrap();
                let id = frame.page_id();
                LeafView::new(&frame).init(id, PageId::INVALID, 4);
                pool.unpin_page(id, true);
                id
            })
            .collect()
    }

    fn internal_frame(pool: &BufferPoolManager, max_size: usize) -> Arc<Frame> {
        let frame = pool.new_page().unwrap();
        let id = frame.page_id();
        InternalView::new(&frame).init(id, PageId::INVALID, max_size);
        frame
    }

    #[test]
    fn test_populate_new_root_and_lookup() {
        let (pool, _dir) = test_pool(10);
        let children = make_children(&pool, 2);
        let frame = internal_frame(&pool, 8);
        let mut node = InternalView::new(&frame);

        node.populate_new_root(children[0], 50, children[1]);

        assert_eq!(node.size(), 2);
        assert_eq!(node.child_at(0), children[0]);
        assert_eq!(node.child_at(1), children[1]);
        assert_eq!(node.lookup(10), children[0]);
        assert_eq!(node.lookup(50), children[1]);
        assert_eq!(node.lookup(99), children[1]);
    }

    #[test]
    fn test_insert_node_after_and_value_index() -> Result<()> {
        let (pool, _dir) = test_pool(10);
        let children = make_children(&pool, 4);
        let frame = internal_frame(&pool, 8);
        let mut node = InternalView::new(&frame);

        node.populate_new_root(children[0], 20, children[1]);
        node.insert_node_after(children[1], 30, children[2])?;
        node.insert_node_after(children[0], 10, children[3])?;

        // Layout: c0 | 10 c3 | 20 c1 | 30 c2
        assert_eq!(node.size(), 4);
        assert_eq!(node.value_index(children[3]), Some(1));
        assert_eq!(node.value_index(children[2]), Some(3));
        assert_eq!(node.value_index(PageId::new(999)), None);
        assert_eq!(node.lookup(15), children[3]);
        assert_eq!(node.lookup(25), children[1]);

        // Unknown anchors are an invariant violation.
        assert!(node
            .insert_node_after(PageId::new(999), 40, children[2])
            .is_err());

        Ok(())
    }

    #[test]
    fn test_move_half_reparents_children() -> Result<()> {
        let (pool, _dir) = test_pool(16);
        let children = make_children(&pool, 5);
        let frame = internal_frame(&pool, 8);
        let mut node = InternalView::new(&frame);

        node.populate_new_root(children[0], 10, children[1]);
        node.insert_node_after(children[1], 20, children[2])?;
        node.insert_node_after(children[2], 30, children[3])?;
        node.insert_node_after(children[3], 40, children[4])?;

        let other = internal_frame(&pool, 8);
        let mut recipient = InternalView::new(&other);
        node.move_half_to(&mut recipient, &pool)?;

        // 5 entries: source keeps ceil(5/2) = 3, recipient gets 2.
        assert_eq!(node.size(), 3);
        assert_eq!(recipient.size(), 2);
        // The pushed-up key sits in the recipient's sentinel slot.
        assert_eq!(recipient.key_at(0), 30);
        assert_eq!(recipient.child_at(0), children[3]);

        // Moved children now point at the recipient.
        for &child in &children[3..5] {
            let child_frame = pool.fetch_page(child)?;
            assert_eq!(node_parent_id(child_frame.data()), recipient.page_id());
            pool.unpin_page(child, false);
        }
        // Kept children still point wherever they pointed before.
        let kept = pool.fetch_page(children[0])?;
        assert_ne!(node_parent_id(kept.data()), recipient.page_id());
        pool.unpin_page(children[0], false);

        Ok(())
    }

    #[test]
    fn test_move_all_to_installs_middle_key() -> Result<()> {
        let (pool, _dir) = test_pool(16);
        let children = make_children(&pool, 4);

        let left_frame = internal_frame(&pool, 8);
        let mut left = InternalView::new(&left_frame);
        left.populate_new_root(children[0], 10, children[1]);

        let right_frame = internal_frame(&pool, 8);
        let mut right = InternalView::new(&right_frame);
        right.populate_new_root(children[2], 40, children[3]);

        right.move_all_to(&mut left, 30, &pool)?;

        // left: c0 | 10 c1 | 30 c2 | 40 c3
        assert_eq!(right.size(), 0);
        assert_eq!(left.size(), 4);
        assert_eq!(left.key_at(2), 30);
        assert_eq!(left.child_at(2), children[2]);
        assert_eq!(left.key_at(3), 40);

        for &child in &children[2..4] {
            let child_frame = pool.fetch_page(child)?;
            assert_eq!(node_parent_id(child_frame.data()), left.page_id());
            pool.unpin_page(child, false);
        }

        Ok(())
    }

    #[test]
    fn test_redistribution_moves() -> Result<()> {
        let (pool, _dir) = test_pool(16);
        let children = make_children(&pool, 5);

        let left_frame = internal_frame(&pool, 8);
        let mut left = InternalView::new(&left_frame);
        left.populate_new_root(children[0], 10, children[1]);
        left.insert_node_after(children[1], 20, children[2])?;

        let right_frame = internal_frame(&pool, 8);
        let mut right = InternalView::new(&right_frame);
        right.populate_new_root(children[3], 50, children[4]);

        // Borrow from the left under separator 30: left's last child moves
        // to the right's front, and its key becomes the new separator.
        left.move_last_to_front_of(&mut right, 30, &pool)?;

        assert_eq!(left.size(), 2);
        assert_eq!(right.size(), 3);
        assert_eq!(right.child_at(0), children[2]);
        // The moved key is readable from the sentinel slot.
        assert_eq!(right.key_at(0), 20);
        // The old separator now covers the right's old first child.
        assert_eq!(right.key_at(1), 30);
        assert_eq!(right.child_at(1), children[3]);
        assert_eq!(right.key_at(2), 50);

        let moved = pool.fetch_page(children[2])?;
        assert_eq!(node_parent_id(moved.data()), right.page_id());
        pool.unpin_page(children[2], false);

        // Borrow it back under separator 20.
        right.move_first_to_end_of(&mut left, 20, &pool)?;

        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 2);
        assert_eq!(left.key_at(2), 20);
        assert_eq!(left.child_at(2), children[2]);
        // The right's new sentinel key is the next separator.
        assert_eq!(right.key_at(0), 30);

        let back = pool.fetch_page(children[2])?;
        assert_eq!(node_parent_id(back.data()), left.page_id());
        pool.unpin_page(children[2], false);

        Ok(())
    }

    #[test]
    fn test_remove_and_only_child() -> Result<()> {
        let (pool, _dir) = test_pool(10);
        let children = make_children(&pool, 3);
        let frame = internal_frame(&pool, 8);
        let mut node = InternalView::new(&frame);

        node.populate_new_root(children[0], 10, children[1]);
        node.insert_node_after(children[1], 20, children[2])?;

        node.remove(1);
        assert_eq!(node.size(), 2);
        assert_eq!(node.child_at(0), children[0]);
        assert_eq!(node.child_at(1), children[2]);
        assert_eq!(node.key_at(1), 20);

        node.remove(1);
        assert_eq!(node.size(), 1);
        assert_eq!(node.remove_only_child(), children[0]);
        assert_eq!(node.size(), 0);

        Ok(())
    }
}
