//! Disk manager implementation.
//!
//! The disk manager owns the backing file and performs whole-page reads and
//! writes at byte offset `page_id * PAGE_SIZE`. The file is a bare
//! concatenation of pages: no header page, no catalogue. Its logical length
//! is `(highest allocated id + 1) * PAGE_SIZE`, but pages beyond the
//! physical length read as all zeros, so an allocated page that was never
//! written is a page of zeros.

use crate::error::{Result, StorageError};
use crate::types::{PageId, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

/// File-backed page store with monotonic page id allocation
pub struct DiskManager {
    /// The database file
    file: Mutex<File>,
    /// Next page id to hand out; ids below this are considered allocated
    next_page_id: AtomicI32,
}

impl DiskManager {
    /// Open or create a database file
    ///
    /// For an existing file the allocation watermark resumes past every page
    /// the file already holds, so live ids are never re-allocated.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let next_page_id = len.div_ceil(PAGE_SIZE as u64) as i32;

        Ok(Self {
            file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    /// Allocate a new page id
    ///
    /// Ids start at 0 and increase monotonically. Allocation touches no
    /// bytes on disk; the first write extends the file.
    pub fn allocate_page(&self) -> PageId {
        PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Deallocate a page
    ///
    /// Space reclamation is not supported; ids are never reused.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Read a page into `buf`
    ///
    /// Short reads (the file has not grown past this page yet) zero-fill the
    /// tail, so reading an allocated-but-never-written page yields zeros.
    /// Reading an id at or beyond the watermark is an error.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if !self.is_allocated(page_id) {
            return Err(StorageError::PageOutOfRange(page_id));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);

        Ok(())
    }

    /// Write a page and flush it to the OS
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Check whether a page id has been handed out by `allocate_page`
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        page_id.is_valid() && page_id.value() < self.next_page_id.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_allocate_monotonic() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(&dir.path().join("test.db"))?;

        assert_eq!(dm.allocate_page(), PageId::new(0));
        assert_eq!(dm.allocate_page(), PageId::new(1));
        assert_eq!(dm.allocate_page(), PageId::new(2));

        Ok(())
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(&dir.path().join("test.db"))?;

        let page_id = dm.allocate_page();
        let mut data = [0u8; PAGE_SIZE];
        data[0..5].copy_from_slice(b"hello");
        data[PAGE_SIZE - 1] = 0xAB;
        dm.write_page(page_id, &data)?;

        let mut read_back = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_back)?;
        assert_eq!(read_back, data);

        Ok(())
    }

    #[test]
    fn test_read_unwritten_page_is_zeros() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(&dir.path().join("test.db"))?;

        // Allocated but never written; the file is still empty.
        let page_id = dm.allocate_page();

        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut buf)?;
        assert_eq!(buf, [0u8; PAGE_SIZE]);

        Ok(())
    }

    #[test]
    fn test_read_beyond_watermark_fails() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(&dir.path().join("test.db"))?;

        let mut buf = [0u8; PAGE_SIZE];
        assert!(matches!(
            dm.read_page(PageId::new(0), &mut buf),
            Err(StorageError::PageOutOfRange(_))
        ));
        assert!(matches!(
            dm.read_page(PageId::INVALID, &mut buf),
            Err(StorageError::PageOutOfRange(_))
        ));

        dm.allocate_page();
        assert!(dm.read_page(PageId::new(0), &mut buf).is_ok());

        Ok(())
    }

    #[test]
    fn test_reopen_resumes_watermark() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let dm = DiskManager::open(&path)?;
            let p0 = dm.allocate_page();
            let p1 = dm.allocate_page();
            let mut data = [0u8; PAGE_SIZE];
            data[0..4].copy_from_slice(b"test");
            dm.write_page(p0, &data)?;
            dm.write_page(p1, &data)?;
        }

        {
            let dm = DiskManager::open(&path)?;
            // Both persisted pages are below the watermark and readable.
            let mut buf = [0u8; PAGE_SIZE];
            dm.read_page(PageId::new(1), &mut buf)?;
            assert_eq!(&buf[0..4], b"test");
            // A fresh allocation does not collide with them.
            assert_eq!(dm.allocate_page(), PageId::new(2));
        }

        Ok(())
    }
}
