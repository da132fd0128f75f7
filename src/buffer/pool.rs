//! Buffer pool manager.
//!
//! A fixed vector of page frames, a page-id to frame-id table, a free-frame
//! list and the LRU replacer, all guarded by a single pool mutex. Frame
//! acquisition prefers the free list and falls back to evicting the least
//! recently unpinned frame, writing it back first when dirty.
//!
//! The pool mutex is held across disk I/O, so `fetch_page` and `new_page`
//! may block on the disk. It is never held while acquiring a page content
//! latch; callers latch the frames the pool hands back.

use crate::buffer::frame::Frame;
use crate::buffer::lru::LruReplacer;
use crate::error::{Result, StorageError};
use crate::storage::DiskManager;
use crate::types::{FrameId, PageId};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Page cache with pin counting and strict-LRU eviction
pub struct BufferPoolManager {
    disk: DiskManager,
    /// Pre-allocated frames; the vector never changes after construction
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
}

/// Bookkeeping state guarded by the pool mutex
struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
}

impl BufferPoolManager {
    /// Create a pool of `pool_size` frames over the given disk manager
    pub fn new(pool_size: usize, disk: DiskManager) -> Self {
        let frames = (0..pool_size).map(|id| Arc::new(Frame::new(id))).collect();

        Self {
            disk,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).collect(),
                replacer: LruReplacer::new(pool_size),
            }),
        }
    }

    /// Number of frames in the pool
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Fetch a page, pinning its frame.
    ///
    /// A resident page just gains a pin; otherwise a frame is acquired and
    /// the page content is read from disk. Every successful fetch must be
    /// balanced by an [`unpin_page`](Self::unpin_page).
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Frame>> {
        if !self.disk.is_allocated(page_id) {
            return Err(StorageError::PageOutOfRange(page_id));
        }

        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            frame.pin();
            inner.replacer.pin(frame_id);
            return Ok(Arc::clone(frame));
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id];
        frame.set_page_id(page_id);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.pin(frame_id);
        self.disk.read_page(page_id, frame.data_mut())?;

        Ok(Arc::clone(frame))
    }

    /// Allocate a fresh page and pin it in a zeroed frame
    pub fn new_page(&self) -> Result<Arc<Frame>> {
        let mut inner = self.inner.lock();

        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = self.disk.allocate_page();
        let frame = &self.frames[frame_id];
        frame.set_page_id(page_id);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.pin(frame_id);

        debug!("created page {page_id} in frame {frame_id}");
        Ok(Arc::clone(frame))
    }

    /// Drop one pin on a resident page.
    ///
    /// `is_dirty` is ORed into the frame's dirty flag; dirtiness is sticky
    /// and only a flush clears it. Returns false when the page is not
    /// resident or has no pins to drop. The frame becomes evictable when its
    /// pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id];

        if is_dirty {
            frame.set_dirty();
        }

        if frame.pin_count() == 0 {
            return false;
        }
        if frame.unpin() == 0 {
            inner.replacer.unpin(frame_id);
        }
        true
    }

    /// Synchronously write a resident page and clear its dirty flag.
    ///
    /// Returns false when the page is not resident. The page must not be
    /// concurrently write-latched.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id];
        self.disk.write_page(page_id, frame.data())?;
        frame.mark_clean();
        Ok(true)
    }

    /// Write every resident page and clear its dirty flag
    pub fn flush_all_pages(&self) -> Result<()> {
        let inner = self.inner.lock();

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.frames[frame_id];
            self.disk.write_page(page_id, frame.data())?;
            frame.mark_clean();
        }
        Ok(())
    }

    /// Drop a page from the pool, returning its frame to the free list.
    ///
    /// Returns true when the page is not resident (nothing to do) and false
    /// when it is still pinned; a pinned page is never deleted. Disk space
    /// is not reclaimed.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id];
        if frame.pin_count() > 0 {
            return false;
        }

        trace!("deleting page {page_id} from frame {frame_id}");
        self.disk.deallocate_page(page_id);
        inner.page_table.remove(&page_id);
        // Take the frame out of the replacer entirely; it must not be handed
        // out twice once it sits on the free list.
        inner.replacer.pin(frame_id);
        frame.reset();
        inner.free_list.push_back(frame_id);
        true
    }

    /// Acquire an empty frame: free list first, then the LRU victim.
    /// A dirty victim is written back before its frame is recycled.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        if inner.replacer.size() == 0 {
            return Err(StorageError::PoolExhausted);
        }
        let frame_id = inner.replacer.victim().ok_or(StorageError::PoolExhausted)?;
        let frame = &self.frames[frame_id];
        debug_assert_eq!(frame.pin_count(), 0);

        trace!(
            "evicting page {} from frame {frame_id}, dirty: {}",
            frame.page_id(),
            frame.is_dirty()
        );
        if frame.is_dirty() {
            self.disk.write_page(frame.page_id(), frame.data())?;
        }
        inner.page_table.remove(&frame.page_id());
        frame.reset();
        Ok(frame_id)
    }

    #[cfg(test)]
    pub(crate) fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        let frame_id = *inner.page_table.get(&page_id)?;
        Some(self.frames[frame_id].pin_count())
    }

    #[cfg(test)]
    pub(crate) fn pinned_frame_count(&self) -> usize {
        let _inner = self.inner.lock();
        self.frames.iter().filter(|f| f.pin_count() > 0).count()
    }
}
