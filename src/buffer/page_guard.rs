use std::mem::ManuallyDrop;
use std::sync::Arc;

use log::error;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::buffer::buffer_pool::BufferPoolManager;
use crate::buffer::page::PageBuf;
use crate::buffer::{FrameId, PageId};

/// Pin-only handle on a resident page. Carries no latch; data access takes
/// the page latch for the duration of the closure. Upgradable into a latched
/// guard. Dropping releases the pin exactly once.
#[derive(Debug)]
pub struct BasicPageGuard {
    bpm: Arc<BufferPoolManager>,
    frame: Arc<RwLock<PageBuf>>,
    page_id: PageId,
    frame_id: FrameId,
    is_dirty: bool,
    released: bool,
}

impl BasicPageGuard {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        frame: Arc<RwLock<PageBuf>>,
        page_id: PageId,
        frame_id: FrameId,
    ) -> Self {
        BasicPageGuard {
            bpm,
            frame,
            page_id,
            frame_id,
            is_dirty: false,
            released: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.frame.read();
        f(&guard[..])
    }

    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.is_dirty = true;
        let mut guard = self.frame.write();
        f(&mut guard[..])
    }

    /// Trade the pin-only handle for one holding the latch in shared mode.
    pub fn upgrade_read(mut self) -> ReadPageGuard {
        self.released = true;
        let latch = self.frame.read_arc();
        ReadPageGuard {
            bpm: self.bpm.clone(),
            page_id: self.page_id,
            frame_id: self.frame_id,
            is_dirty: self.is_dirty,
            latch: ManuallyDrop::new(latch),
        }
    }

    /// Trade the pin-only handle for one holding the latch in exclusive mode.
    pub fn upgrade_write(mut self) -> WritePageGuard {
        self.released = true;
        let latch = self.frame.write_arc();
        WritePageGuard {
            bpm: self.bpm.clone(),
            page_id: self.page_id,
            frame_id: self.frame_id,
            is_dirty: self.is_dirty,
            latch: ManuallyDrop::new(latch),
        }
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        if !self.released && !self.bpm.unpin_page(self.page_id, self.is_dirty) {
            error!("failed to unpin page {}", self.page_id);
        }
    }
}

/// Shared-latched, pinned page handle. Dropping releases the latch first,
/// then the pin.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    frame_id: FrameId,
    is_dirty: bool,
    latch: ManuallyDrop<ArcRwLockReadGuard<RawRwLock, PageBuf>>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        &self.latch[..]
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Latch before pin: a blocked writer must never see this page pinned
        // by us after the latch is gone.
        unsafe {
            ManuallyDrop::drop(&mut self.latch);
        }
        if !self.bpm.unpin_page(self.page_id, self.is_dirty) {
            error!("failed to unpin page {}", self.page_id);
        }
    }
}

/// Exclusively-latched, pinned page handle. Mutable access marks the page
/// dirty; the dirty bit reaches the pool on drop.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    page_id: PageId,
    frame_id: FrameId,
    is_dirty: bool,
    latch: ManuallyDrop<ArcRwLockWriteGuard<RawRwLock, PageBuf>>,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        &self.latch[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.latch[..]
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Replace the whole page image.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.latch.len());
        self.data_mut().copy_from_slice(data);
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.latch);
        }
        if !self.bpm.unpin_page(self.page_id, self.is_dirty) {
            error!("failed to unpin page {}", self.page_id);
        }
    }
}
