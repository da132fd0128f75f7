//! Leaf page layout.
//!
//! Leaf page format (keys are stored strictly ascending):
//!
//! ```text
//! | header (24 bytes) | key(0) value(0) | key(1) value(1) | ... |
//! ```
//!
//! Leaves form a singly linked list in ascending key order through the
//! header's next-page pointer.

use super::{
    init_header, node_max_size, node_next_page_id, node_page_id, node_parent_id, node_size,
    read_i32, read_i64, set_node_next_page_id, set_node_size, write_i32, write_i64, ENTRY_SIZE,
    LEAF_HEADER_SIZE,
};
use crate::buffer::Frame;
use crate::types::{Key, NodeType, PageId, Value};

/// Typed view of a leaf page living in a frame's byte buffer.
///
/// Reads need the frame's read latch; mutation needs the write latch.
pub struct LeafView<'a> {
    frame: &'a Frame,
}

impl<'a> LeafView<'a> {
    pub fn new(frame: &'a Frame) -> Self {
        Self { frame }
    }

    /// Initialise a fresh leaf page in-place
    pub fn init(&mut self, page_id: PageId, parent_id: PageId, max_size: usize) {
        init_header(
            self.frame.data_mut(),
            NodeType::Leaf,
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

    pub fn next_page_id(&self) -> PageId {
        node_next_page_id(self.frame.data())
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        set_node_next_page_id(self.frame.data_mut(), next);
    }

    pub fn key_at(&self, index: usize) -> Key {
        read_i64(self.frame.data(), Self::offset(index))
    }

    pub fn value_at(&self, index: usize) -> Value {
        read_i32(self.frame.data(), Self::offset(index) + 8)
    }

    /// Lower-bound position for `key`: the first index whose key is >= `key`
    pub fn key_index(&self, key: Key) -> usize {
        let (mut lo, mut hi) = (0, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Binary-search for `key` and return its value if present
    pub fn lookup(&self, key: Key) -> Option<Value> {
        let pos = self.key_index(key);
        if pos < self.size() && self.key_at(pos) == key {
            Some(self.value_at(pos))
        } else {
            None
        }
    }

    /// Insert in sorted position. The caller must have ruled out a
    /// duplicate with [`lookup`](Self::lookup).
    pub fn insert(&mut self, key: Key, value: Value) {
        let pos = self.key_index(key);
        let size = self.size();
        debug_assert!(pos >= size || self.key_at(pos) != key, "duplicate key");
        debug_assert!(size < super::LEAF_MAX_ENTRIES);

        let data = self.frame.data_mut();
        let start = Self::offset(pos);
        data.copy_within(start..Self::offset(size), start + ENTRY_SIZE);
        write_i64(data, start, key);
        write_i32(data, start + 8, value);
        set_node_size(data, size + 1);
    }

    /// Remove `key` if present, shifting the tail left by one entry
    pub fn remove(&mut self, key: Key) -> bool {
        let pos = self.key_index(key);
        let size = self.size();
        if pos >= size || self.key_at(pos) != key {
            return false;
        }

        let data = self.frame.data_mut();
        data.copy_within(Self::offset(pos + 1)..Self::offset(size), Self::offset(pos));
        set_node_size(data, size - 1);
        true
    }

    /// Move the upper half of this page's entries to an empty recipient.
    ///
    /// The suffix starting at `ceil(size / 2)` moves, so this page keeps the
    /// larger half.
    pub fn move_half_to(&mut self, recipient: &mut LeafView) {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size();
        let move_start = (size + 1) / 2;

        recipient.append_raw(self.raw_entries(move_start, size));
        set_node_size(self.frame.data_mut(), move_start);
    }

    /// Move every entry to the recipient (assumed to be the left sibling)
    /// and hand it this page's next pointer.
    pub fn move_all_to(&mut self, recipient: &mut LeafView) {
        let size = self.size();
        recipient.append_raw(self.raw_entries(0, size));
        recipient.set_next_page_id(self.next_page_id());
        set_node_size(self.frame.data_mut(), 0);
    }

    /// Move this page's first entry to the end of the recipient
    pub fn move_first_to_end_of(&mut self, recipient: &mut LeafView) {
        let size = self.size();
        recipient.append_raw(self.raw_entries(0, 1));

        let data = self.frame.data_mut();
        data.copy_within(Self::offset(1)..Self::offset(size), Self::offset(0));
        set_node_size(data, size - 1);
    }

    /// Move this page's last entry to the front of the recipient
    pub fn move_last_to_front_of(&mut self, recipient: &mut LeafView) {
        let size = self.size();
        let key = self.key_at(size - 1);
        let value = self.value_at(size - 1);

        let rsize = recipient.size();
        let rdata = recipient.frame.data_mut();
        rdata.copy_within(
            Self::offset(0)..Self::offset(rsize),
            Self::offset(0) + ENTRY_SIZE,
        );
        write_i64(rdata, Self::offset(0), key);
        write_i32(rdata, Self::offset(0) + 8, value);
        set_node_size(rdata, rsize + 1);

        set_node_size(self.frame.data_mut(), size - 1);
    }

    fn raw_entries(&self, from: usize, to: usize) -> &[u8] {
        &self.frame.data()[Self::offset(from)..Self::offset(to)]
    }

    /// Append whole encoded entries at the tail
    fn append_raw(&mut self, bytes: &[u8]) {
        let n = bytes.len() / ENTRY_SIZE;
        let size = self.size();
        debug_assert!(size + n <= super::LEAF_MAX_ENTRIES);

        let data = self.frame.data_mut();
        let start = Self::offset(size);
        data[start..start + bytes.len()].copy_from_slice(bytes);
        set_node_size(data, size + n);
    }

    const fn offset(index: usize) -> usize {
        LEAF_HEADER_SIZE + index * ENTRY_SIZE
    }
}
