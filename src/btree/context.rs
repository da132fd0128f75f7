//! Per-operation latch context.
//!
//! During crabbing descent every latched page is pushed here, oldest (the
//! one closest to the root) first. Ancestors are released early once a child
//! is known to absorb the operation; whatever is still held drains when the
//! context drops, which covers every exit path including duplicate-key
//! returns and errors.
//!
//! Structural merges also queue page deletions here. A page cannot be
//! deleted while it is pinned, and merged-away pages stay pinned (and
//! latched) until the context drains, so deletion happens after the drain.

use crate::buffer::{BufferPoolManager, Frame};
use crate::types::PageId;
use std::sync::Arc;

/// Access mode of a tree operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Insert,
    Remove,
}

impl Op {
    pub fn is_read(self) -> bool {
        matches!(self, Op::Read)
    }
}

/// The pages one tree operation currently holds latched and pinned
pub(crate) struct OpContext<'a> {
    pool: &'a BufferPoolManager,
    op: Op,
    pages: Vec<Arc<Frame>>,
    deleted: Vec<PageId>,
}

impl<'a> OpContext<'a> {
    pub fn new(pool: &'a BufferPoolManager, op: Op) -> Self {
        Self {
            pool,
            op,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Record a page as latched and pinned by this operation
    pub fn push(&mut self, frame: Arc<Frame>) {
        self.pages.push(frame);
    }

    /// Page id of the oldest still-held page.
    ///
    /// While this is the root's id, the root may still change under this
    /// operation and the root mutex must stay held.
    pub fn first_page_id(&self) -> Option<PageId> {
        self.pages.first().map(|frame| frame.page_id())
    }

    /// Queue a page for deletion after the final drain
    pub fn mark_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    /// Unlatch and unpin every held page, top-down.
    ///
    /// Write operations unpin dirty; reads unpin clean.
    pub fn release_pages(&mut self) {
        let is_read = self.op.is_read();
        for frame in self.pages.drain(..) {
            if is_read {
                frame.latch().runlock();
            } else {
                frame.latch().wunlock();
            }
            self.pool.unpin_page(frame.page_id(), !is_read);
        }
    }
}

impl Drop for OpContext<'_> {
    fn drop(&mut self) {
        self.release_pages();
        // Merged-away pages have no pins left now; a refused delete means a
        // racing operation still pinned the page, and the orphan is simply
        // left for eviction.
        for page_id in self.deleted.drain(..) {
            self.pool.delete_page(page_id);
        }
    }
}
