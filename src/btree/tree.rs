//! B+ tree core implementation.
//!
//! Internal pages direct the search and leaf pages hold the data. Only
//! unique keys are supported; the tree grows and shrinks dynamically.
//!
//! Concurrency follows latch crabbing: descent latches a child before
//! releasing its ancestors, and releases every ancestor as soon as the child
//! is safe (an insert cannot overflow it, a remove cannot underflow it).
//! The root page id is separate state under its own mutex; each operation
//! holds that mutex until the descent observes that the oldest page it still
//! holds is no longer the root.

use crate::btree::context::{Op, OpContext};
use crate::buffer::{BufferPoolManager, Frame};
use crate::error::{Result, StorageError};
use crate::page::{InternalView, LeafView, NodeView};
use crate::types::{Key, PageId, TreeConfig, Value};
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// A disk-resident B+ tree mapping fixed-width integer keys to values
pub struct BPlusTree {
    pool: Arc<BufferPoolManager>,
    /// Serialises the root-identifier window at the top of every operation
    root_mutex: Mutex<()>,
    /// Root page id; read and written only while `root_mutex` is held
    root_id: AtomicI32,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Create an empty tree with default node limits
    pub fn new(pool: Arc<BufferPoolManager>) -> Self {
        Self::with_config(pool, TreeConfig::default())
    }

    /// Create an empty tree with custom node limits
    pub fn with_config(pool: Arc<BufferPoolManager>, config: TreeConfig) -> Self {
        debug!(
            "opened tree, leaf max {} internal max {}",
            config.leaf_max_size, config.internal_max_size
        );
        Self {
            pool,
            root_mutex: Mutex::new(()),
            root_id: AtomicI32::new(PageId::INVALID.value()),
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
        }
    }

    /// Whether the tree holds no keys at all
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Look up `key` and return its value
    pub fn get_value(&self, key: Key) -> Result<Option<Value>> {
        let mut ctx = OpContext::new(&self.pool, Op::Read);
        let mut root_guard = Some(self.root_mutex.lock());

        if self.is_empty() {
            return Ok(None);
        }

        let leaf_frame = self.find_leaf(key, &mut ctx)?;
        self.maybe_release_root(&mut root_guard, &ctx);

        Ok(LeafView::new(&leaf_frame).lookup(key))
    }

    /// Insert a key-value pair.
    ///
    /// Returns false when the key already exists; only unique keys are
    /// supported.
    pub fn insert(&self, key: Key, value: Value) -> Result<bool> {
        let mut ctx = OpContext::new(&self.pool, Op::Insert);
        let mut root_guard = Some(self.root_mutex.lock());

        if self.is_empty() {
            self.start_new_tree(key, value)?;
            return Ok(true);
        }

        let leaf_frame = self.find_leaf(key, &mut ctx)?;
        self.maybe_release_root(&mut root_guard, &ctx);

        let mut leaf = LeafView::new(&leaf_frame);
        if leaf.lookup(key).is_some() {
            return Ok(false);
        }

        leaf.insert(key, value);

        // A leaf splits the moment it reaches its maximum, so its usable
        // capacity is one entry less; internal pages split one entry later.
        if leaf.size() == self.leaf_max_size {
            let new_frame = self.split_leaf(&leaf_frame)?;
            let promoted = LeafView::new(&new_frame).key_at(0);
            let propagated = self.insert_into_parent(&leaf_frame, promoted, &new_frame);
            self.pool.unpin_page(new_frame.page_id(), true);
            propagated?;
        }

        Ok(true)
    }

    /// Remove `key` and its value.
    ///
    /// Returns false when the key is absent.
    pub fn remove(&self, key: Key) -> Result<bool> {
        let mut ctx = OpContext::new(&self.pool, Op::Remove);
        let mut root_guard = Some(self.root_mutex.lock());

        if self.is_empty() {
            return Ok(false);
        }

        let leaf_frame = self.find_leaf(key, &mut ctx)?;
        self.maybe_release_root(&mut root_guard, &ctx);

        let mut leaf = LeafView::new(&leaf_frame);
        if !leaf.remove(key) {
            return Ok(false);
        }

        if leaf.size() < self.min_size(&leaf_frame) {
            self.coalesce_or_redistribute(&leaf_frame, &mut ctx)?;
        }

        Ok(true)
    }

    fn root_page_id(&self) -> PageId {
        PageId::new(self.root_id.load(Ordering::Acquire))
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_id.store(page_id.value(), Ordering::Release);
    }

    /// Build a single-leaf tree holding one entry.
    ///
    /// The caller holds the root mutex throughout; the page only becomes
    /// reachable once the root id is published.
    fn start_new_tree(&self, key: Key, value: Value) -> Result<()> {
        let frame = self.pool.new_page()?;
        let page_id = frame.page_id();

        let mut leaf = LeafView::new(&frame);
        leaf.init(page_id, PageId::INVALID, self.leaf_max_size);
        leaf.insert(key, value);
        self.set_root_page_id(page_id);

        debug!("started new tree at root {page_id}");
        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    /// Crabbing descent to the leaf responsible for `key`.
    ///
    /// Reads latch each page shared and immediately release the parent.
    /// Writes latch exclusive and release all ancestors only once the child
    /// is safe. The returned leaf is pinned, latched and owned by `ctx`.
    fn find_leaf(&self, key: Key, ctx: &mut OpContext) -> Result<Arc<Frame>> {
        let mut frame = self.pool.fetch_page(self.root_page_id())?;
        loop {
            if ctx.op().is_read() {
                frame.latch().rlock();
                ctx.release_pages();
            } else {
                frame.latch().wlock();
                if self.is_safe(&frame, ctx.op()) {
                    ctx.release_pages();
                }
            }
            ctx.push(Arc::clone(&frame));

            if NodeView::new(&frame).is_leaf() {
                return Ok(frame);
            }

            let child = InternalView::new(&frame).lookup(key);
            frame = self.pool.fetch_page(child)?;
        }
    }

    /// Drop the root mutex once the oldest held page is not the root
    fn maybe_release_root(&self, guard: &mut Option<MutexGuard<'_, ()>>, ctx: &OpContext) {
        if ctx.first_page_id() != Some(self.root_page_id()) {
            guard.take();
        }
    }

    /// Whether this node can absorb the operation without structural change
    fn is_safe(&self, frame: &Frame, op: Op) -> bool {
        let node = NodeView::new(frame);
        match op {
            Op::Read => true,
            Op::Insert => node.size() < self.max_size(frame),
            Op::Remove => {
                if node.is_root() {
                    // A root leaf has no minimum; a root internal node must
                    // keep at least two children.
                    node.is_leaf() || node.size() > 2
                } else {
                    node.size() > self.min_size(frame)
                }
            }
        }
    }

    /// Largest size a node may keep without splitting
    fn max_size(&self, frame: &Frame) -> usize {
        if NodeView::new(frame).is_leaf() {
            self.leaf_max_size - 1
        } else {
            self.internal_max_size
        }
    }

    /// Smallest size a non-root node may keep
    fn min_size(&self, frame: &Frame) -> usize {
        if NodeView::new(frame).is_leaf() {
            self.leaf_max_size / 2
        } else {
            (self.internal_max_size + 1) / 2
        }
    }

    /// Whether two sibling nodes fit into one after a merge
    fn fits_in_one(&self, a: &Frame, b: &Frame) -> bool {
        let total = NodeView::new(a).size() + NodeView::new(b).size();
        if NodeView::new(a).is_leaf() {
            total <= self.leaf_max_size - 1
        } else {
            total <= self.internal_max_size
        }
    }

    /// Split a full leaf, returning the pinned new right sibling.
    ///
    /// The new page is not latched: it is unreachable until the parent is
    /// updated, and the parent is write-latched by this operation.
    fn split_leaf(&self, frame: &Frame) -> Result<Arc<Frame>> {
        let new_frame = self.pool.new_page()?;
        let new_id = new_frame.page_id();

        let mut old = LeafView::new(frame);
        let mut new = LeafView::new(&new_frame);
        new.init(new_id, old.parent_id(), self.leaf_max_size);
        old.move_half_to(&mut new);
        new.set_next_page_id(old.next_page_id());
        old.set_next_page_id(new_id);

        debug!("split leaf {} into {new_id}", old.page_id());
        Ok(new_frame)
    }

    /// Split an overflowing internal page, returning the pinned new page
    fn split_internal(&self, frame: &Frame) -> Result<Arc<Frame>> {
        let new_frame = self.pool.new_page()?;
        let new_id = new_frame.page_id();

        let mut old = InternalView::new(frame);
        let mut new = InternalView::new(&new_frame);
        new.init(new_id, old.parent_id(), self.internal_max_size);
        old.move_half_to(&mut new, &self.pool)?;

        debug!("split internal {} into {new_id}", old.page_id());
        Ok(new_frame)
    }

    /// Hook a freshly split-off page into the tree above `old_frame`.
    ///
    /// `key` is the smallest key reachable through the new page: copied up
    /// from a split leaf, pushed up from a split internal page. Splitting
    /// the root grows the tree by one level; otherwise the parent (already
    /// write-latched via crabbing) takes the new entry and may split in
    /// turn.
    fn insert_into_parent(&self, old_frame: &Frame, key: Key, new_frame: &Frame) -> Result<()> {
        let old_node = NodeView::new(old_frame);
        if old_node.is_root() {
            let root_frame = self.pool.new_page()?;
            let root_id = root_frame.page_id();

            let mut root = InternalView::new(&root_frame);
            root.init(root_id, PageId::INVALID, self.internal_max_size);
            root.populate_new_root(old_node.page_id(), key, NodeView::new(new_frame).page_id());

            let mut old_node = NodeView::new(old_frame);
            old_node.set_parent_id(root_id);
            let mut new_node = NodeView::new(new_frame);
            new_node.set_parent_id(root_id);

            // The root was unsafe for this insert, so the root mutex is
            // still held and publishing the new root is race-free.
            self.set_root_page_id(root_id);
            debug!("grew tree with new root {root_id}");

            self.pool.unpin_page(root_id, true);
            return Ok(());
        }

        let parent_id = old_node.parent_id();
        let parent_frame = self.pool.fetch_page(parent_id)?;
        let result =
            self.insert_into_fetched_parent(&parent_frame, old_node.page_id(), key, new_frame);
        self.pool.unpin_page(parent_id, true);
        result
    }

    fn insert_into_fetched_parent(
        &self,
        parent_frame: &Frame,
        old_id: PageId,
        key: Key,
        new_frame: &Frame,
    ) -> Result<()> {
        let mut parent = InternalView::new(parent_frame);
        parent.insert_node_after(old_id, key, NodeView::new(new_frame).page_id())?;

        if parent.size() == self.internal_max_size + 1 {
            let new_parent_frame = self.split_internal(parent_frame)?;
            // The key sitting in the new page's sentinel slot moves up.
            let promoted = InternalView::new(&new_parent_frame).key_at(0);
            let propagated = self.insert_into_parent(parent_frame, promoted, &new_parent_frame);
            self.pool.unpin_page(new_parent_frame.page_id(), true);
            propagated?;
        }
        Ok(())
    }

    /// Restore the minimum-size invariant for an underfull node.
    ///
    /// The root only shrinks (or empties) the tree; any other node merges
    /// into a sibling when the two fit in one page, and borrows one entry
    /// otherwise. Exactly one of those must apply.
    fn coalesce_or_redistribute(&self, node_frame: &Frame, ctx: &mut OpContext) -> Result<()> {
        let node = NodeView::new(node_frame);
        if node.is_root() {
            if node.size() <= 1 && self.adjust_root(node_frame)? {
                ctx.mark_deleted(node.page_id());
            }
            return Ok(());
        }

        let parent_id = node.parent_id();
        let parent_frame = self.pool.fetch_page(parent_id)?;
        let result = self.repair_underflow(node_frame, &parent_frame, ctx);
        self.pool.unpin_page(parent_id, true);
        result
    }

    fn repair_underflow(
        &self,
        node_frame: &Frame,
        parent_frame: &Frame,
        ctx: &mut OpContext,
    ) -> Result<()> {
        let node_id = NodeView::new(node_frame).page_id();
        let node_is_leaf = NodeView::new(node_frame).is_leaf();
        let mut parent = InternalView::new(parent_frame);
        let index = parent.value_index(node_id).ok_or_else(|| {
            StorageError::invariant(format!(
                "page {node_id} is not a child of its parent {}",
                parent.page_id()
            ))
        })?;

        // Merge into the left sibling.
        if index > 0 {
            let left_id = parent.child_at(index - 1);
            let left_frame = self.pool.fetch_page(left_id)?;
            left_frame.latch().wlock();

            if self.fits_in_one(&left_frame, node_frame) {
                debug!("merging page {node_id} into left sibling {left_id}");
                let merged = self.merge(&left_frame, node_frame, parent.key_at(index));
                left_frame.latch().wunlock();
                self.pool.unpin_page(left_id, true);
                merged?;

                ctx.mark_deleted(node_id);
                parent.remove(index);
                if parent.size() < self.min_size(parent_frame) {
                    self.coalesce_or_redistribute(parent_frame, ctx)?;
                }
                return Ok(());
            }

            left_frame.latch().wunlock();
            self.pool.unpin_page(left_id, false);
        }

        // Merge the right sibling into this node.
        if index + 1 < parent.size() {
            let right_id = parent.child_at(index + 1);
            let right_frame = self.pool.fetch_page(right_id)?;
            right_frame.latch().wlock();

            if self.fits_in_one(node_frame, &right_frame) {
                debug!("merging right sibling {right_id} into page {node_id}");
                let merged = self.merge(node_frame, &right_frame, parent.key_at(index + 1));
                right_frame.latch().wunlock();
                self.pool.unpin_page(right_id, true);
                merged?;

                ctx.mark_deleted(right_id);
                parent.remove(index + 1);
                if parent.size() < self.min_size(parent_frame) {
                    self.coalesce_or_redistribute(parent_frame, ctx)?;
                }
                return Ok(());
            }

            right_frame.latch().wunlock();
            self.pool.unpin_page(right_id, false);
        }

        // Borrow the left sibling's last entry.
        if index > 0 {
            let left_id = parent.child_at(index - 1);
            let left_frame = self.pool.fetch_page(left_id)?;
            left_frame.latch().wlock();

            if NodeView::new(&left_frame).size() > self.min_size(&left_frame) {
                debug!("borrowing from left sibling {left_id} for page {node_id}");
                let borrowed = if node_is_leaf {
                    let mut left = LeafView::new(&left_frame);
                    let mut node = LeafView::new(node_frame);
                    left.move_last_to_front_of(&mut node);
                    parent.set_key_at(index, node.key_at(0));
                    Ok(())
                } else {
                    let mut left = InternalView::new(&left_frame);
                    let mut node = InternalView::new(node_frame);
                    let middle_key = parent.key_at(index);
                    let moved = left.move_last_to_front_of(&mut node, middle_key, &self.pool);
                    if moved.is_ok() {
                        parent.set_key_at(index, node.key_at(0));
                    }
                    moved
                };
                left_frame.latch().wunlock();
                self.pool.unpin_page(left_id, true);
                return borrowed;
            }

            left_frame.latch().wunlock();
            self.pool.unpin_page(left_id, false);
        }

        // Borrow the right sibling's first entry.
        if index + 1 < parent.size() {
            let right_id = parent.child_at(index + 1);
            let right_frame = self.pool.fetch_page(right_id)?;
            right_frame.latch().wlock();

            if NodeView::new(&right_frame).size() > self.min_size(&right_frame) {
                debug!("borrowing from right sibling {right_id} for page {node_id}");
                let borrowed = if node_is_leaf {
                    let mut right = LeafView::new(&right_frame);
                    let mut node = LeafView::new(node_frame);
                    right.move_first_to_end_of(&mut node);
                    parent.set_key_at(index + 1, right.key_at(0));
                    Ok(())
                } else {
                    let mut right = InternalView::new(&right_frame);
                    let mut node = InternalView::new(node_frame);
                    let middle_key = parent.key_at(index + 1);
                    let moved = right.move_first_to_end_of(&mut node, middle_key, &self.pool);
                    if moved.is_ok() {
                        parent.set_key_at(index + 1, right.key_at(0));
                    }
                    moved
                };
                right_frame.latch().wunlock();
                self.pool.unpin_page(right_id, true);
                return borrowed;
            }

            right_frame.latch().wunlock();
            self.pool.unpin_page(right_id, false);
        }

        Err(StorageError::invariant(format!(
            "page {node_id} cannot merge with or borrow from any sibling"
        )))
    }

    /// Merge `node_frame` into `recipient_frame` (its left neighbour in key
    /// order). `middle_key` is the parent separator between the two.
    fn merge(&self, recipient_frame: &Frame, node_frame: &Frame, middle_key: Key) -> Result<()> {
        if NodeView::new(node_frame).is_leaf() {
            let mut node = LeafView::new(node_frame);
            let mut recipient = LeafView::new(recipient_frame);
            node.move_all_to(&mut recipient);
            Ok(())
        } else {
            let mut node = InternalView::new(node_frame);
            let mut recipient = InternalView::new(recipient_frame);
            node.move_all_to(&mut recipient, middle_key, &self.pool)
        }
    }

    /// Shrink or clear the tree when the root falls below two entries.
    ///
    /// A root internal page with one child promotes that child; a root leaf
    /// with no entries empties the tree. Returns whether the old root page
    /// should be deleted. The root mutex is still held: an unsafe root never
    /// released it.
    fn adjust_root(&self, root_frame: &Frame) -> Result<bool> {
        let root = NodeView::new(root_frame);

        if !root.is_leaf() && root.size() == 1 {
            let mut internal = InternalView::new(root_frame);
            let child_id = internal.remove_only_child();

            let child_frame = self.pool.fetch_page(child_id)?;
            let mut child = NodeView::new(&child_frame);
            child.set_parent_id(PageId::INVALID);
            self.pool.unpin_page(child_id, true);

            self.set_root_page_id(child_id);
            debug!("demoted root to page {child_id}");
            return Ok(true);
        }

        if root.is_leaf() && root.size() == 0 {
            self.set_root_page_id(PageId::INVALID);
            debug!("removed last entry, tree is empty");
            return Ok(true);
        }

        Ok(false)
    }

    /// Number of levels from the root down to the leaves
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut depth = 1;
        let mut page_id = self.root_page_id();
        loop {
            let frame = self.pool.fetch_page(page_id).unwrap();
            if NodeView::new(&frame).is_leaf() {
                self.pool.unpin_page(page_id, false);
                return depth;
            }
            let child = InternalView::new(&frame).child_at(0);
            self.pool.unpin_page(page_id, false);
            page_id = child;
            depth += 1;
        }
    }

    /// Every entry in leaf-chain order, for verification in tests
    #[cfg(test)]
    pub(crate) fn collect_entries(&self) -> Vec<(Key, Value)> {
        let mut entries = Vec::new();
        for leaf_id in self.leaf_chain() {
            let frame = self.pool.fetch_page(leaf_id).unwrap();
            let leaf = LeafView::new(&frame);
            for i in 0..leaf.size() {
                entries.push((leaf.key_at(i), leaf.value_at(i)));
            }
            self.pool.unpin_page(leaf_id, false);
        }
        entries
    }

    /// Entry count per leaf, leftmost first
    #[cfg(test)]
    pub(crate) fn leaf_sizes(&self) -> Vec<usize> {
        self.leaf_chain()
            .into_iter()
            .map(|leaf_id| {
                let frame = self.pool.fetch_page(leaf_id).unwrap();
                let size = LeafView::new(&frame).size();
                self.pool.unpin_page(leaf_id, false);
                size
            })
            .collect()
    }

    #[cfg(test)]
    fn leaf_chain(&self) -> Vec<PageId> {
        let mut chain = Vec::new();
        if self.is_empty() {
            return chain;
        }

        let mut page_id = self.root_page_id();
        loop {
            let frame = self.pool.fetch_page(page_id).unwrap();
            if NodeView::new(&frame).is_leaf() {
                self.pool.unpin_page(page_id, false);
                break;
            }
            let child = InternalView::new(&frame).child_at(0);
            self.pool.unpin_page(page_id, false);
            page_id = child;
        }

        while page_id.is_valid() {
            chain.push(page_id);
            let frame = self.pool.fetch_page(page_id).unwrap();
            let next = LeafView::new(&frame).next_page_id();
            self.pool.unpin_page(page_id, false);
            page_id = next;
        }
        chain
    }
}
