use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{TidepoolError, TidepoolResult};

/// File-backed block device: fixed-size page reads and writes plus page id
/// allocation. Ids grow monotonically; deallocation zeroes the page on disk.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> TidepoolResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;

        let file_len = db_file.metadata()?.len();
        let next_page_id = (file_len as usize / PAGE_SIZE) as PageId;
        debug!(
            "disk manager opened {:?}, next_page_id={}",
            db_path.as_ref(),
            next_page_id
        );

        Ok(DiskManager {
            db_file: Mutex::new(db_file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> TidepoolResult<[u8; PAGE_SIZE]> {
        let offset = Self::page_offset(page_id)?;
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        // A page past the current end of file reads as zeroes.
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e.into()),
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> TidepoolResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(TidepoolError::Storage(format!(
                "page data length {} is not {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let offset = Self::page_offset(page_id)?;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out the next page id. Ids are never reused.
    pub fn allocate_page(&self) -> TidepoolResult<PageId> {
        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Zero the page on disk. A later read of this id observes empty bytes.
    pub fn deallocate_page(&self, page_id: PageId) -> TidepoolResult<()> {
        static EMPTY_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];
        self.write_page(page_id, &EMPTY_PAGE)
    }

    pub fn db_file_len(&self) -> TidepoolResult<u64> {
        Ok(self.db_file.lock().metadata()?.len())
    }

    fn page_offset(page_id: PageId) -> TidepoolResult<u64> {
        if page_id < 0 {
            return Err(TidepoolError::InvalidPageId(page_id));
        }
        Ok(page_id as u64 * PAGE_SIZE as u64)
    }
}

/// Owned page bytes handed across the I/O boundary.
pub fn page_bytes(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(data)
}
