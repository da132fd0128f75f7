//! Page frame: one pre-allocated slot of the buffer pool.

use crate::buffer::Latch;
use crate::types::{FrameId, PageId, PAGE_SIZE};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// A fixed-size in-memory slot holding the content of at most one page.
///
/// Frames are allocated once at pool construction and live as long as the
/// pool; pages come and go through them. The metadata fields (resident page
/// id, pin count, dirty flag) are only mutated while the pool mutex is held;
/// they are atomics so pinned frames can be handed out as `Arc<Frame>` and
/// inspected without re-entering the pool.
///
/// The byte buffer has two disjoint access regimes:
/// - the pool touches it only for frames with pin count 0 (eviction write-back,
///   reading a page in, zeroing on reset), under the pool mutex;
/// - everyone else must pin the frame first and hold the content latch:
///   the read latch for [`Frame::data`], the write latch for
///   [`Frame::data_mut`].
pub struct Frame {
    id: FrameId,
    data: UnsafeCell<[u8; PAGE_SIZE]>,
    page_id: AtomicI32,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    latch: Latch,
}

// The access regimes above make the UnsafeCell safe to share.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    pub(crate) fn new(id: FrameId) -> Self {
        Self {
            id,
            data: UnsafeCell::new([0u8; PAGE_SIZE]),
            page_id: AtomicI32::new(PageId::INVALID.value()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            latch: Latch::new(),
        }
    }

    /// Index of this frame in the pool's frame vector
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Id of the page currently resident in this frame
    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub(super) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.value(), Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(super) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(super) fn unpin(&self) -> u32 {
        self.pin_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(super) fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(super) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// The content latch for this frame
    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Shared view of the page bytes.
    ///
    /// The caller must hold the read or write latch, or be the pool acting
    /// on an unpinned frame under the pool mutex.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*self.data.get() }
    }

    /// Exclusive view of the page bytes.
    ///
    /// The caller must hold the write latch, or be the pool acting on an
    /// unpinned frame under the pool mutex.
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *self.data.get() }
    }

    /// Clear the frame back to its empty state: no page, no pins, clean,
    /// zeroed bytes. Pool-internal, called with pin count 0.
    pub(super) fn reset(&self) {
        self.set_page_id(PageId::INVALID);
        self.pin_count.store(0, Ordering::Release);
        self.mark_clean();
        self.data_mut().fill(0);
    }
}
