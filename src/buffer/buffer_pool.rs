use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::buffer::page::{zeroed_page_buf, FrameMeta, PageBuf};
use crate::config::BufferPoolConfig;
use crate::buffer::page_guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::buffer::{FrameId, PageId, INVALID_PAGE_ID};
use crate::error::{TidepoolError, TidepoolResult};
use crate::storage::disk_manager::{page_bytes, DiskManager};
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

/// Page table, free list, and per-frame bookkeeping, all mutated under one
/// pool-wide mutex. Page latches are acquired only after this mutex is
/// released.
#[derive(Debug)]
struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    metas: Vec<FrameMeta>,
}

#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<Arc<RwLock<PageBuf>>>,
    inner: Mutex<PoolInner>,
    replacer: LRUKReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new_with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        Self::new(config.pool_size, config.replacer_k, disk_manager)
    }

    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut metas = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Arc::new(RwLock::new(zeroed_page_buf())));
            free_list.push_back(i);
            metas.push(FrameMeta::empty());
        }
        BufferPoolManager {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                metas,
            }),
            replacer: LRUKReplacer::new(pool_size, replacer_k),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Allocate a fresh page, pinned and zero-filled.
    pub fn new_page(self: &Arc<Self>) -> TidepoolResult<BasicPageGuard> {
        let mut inner = self.inner.lock();
        let frame_id = self.allocate_frame(&mut inner)?;
        let page_id = match self.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                inner.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        inner.page_table.insert(page_id, frame_id);
        inner.metas[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        self.frames[frame_id].write().fill(0);
        self.replacer.record_access(frame_id)?;
        self.replacer.set_evictable(frame_id, false)?;
        drop(inner);

        Ok(BasicPageGuard::new(
            self.clone(),
            self.frames[frame_id].clone(),
            page_id,
            frame_id,
        ))
    }

    /// Pin the page, reading it from disk if it is not resident.
    pub fn fetch_page_basic(self: &Arc<Self>, page_id: PageId) -> TidepoolResult<BasicPageGuard> {
        if page_id < 0 {
            return Err(TidepoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();
        let resident = inner.page_table.get(&page_id).copied();
        let frame_id = if let Some(frame_id) = resident {
            inner.metas[frame_id].pin_count += 1;
            frame_id
        } else {
            let frame_id = self.allocate_frame(&mut inner)?;
            // Read under the pool mutex so no other thread can observe the
            // mapping before the bytes have landed in the frame.
            let data = match self.disk_manager.read_page(page_id) {
                Ok(data) => data,
                Err(e) => {
                    inner.free_list.push_back(frame_id);
                    return Err(e);
                }
            };
            self.frames[frame_id].write().copy_from_slice(&data);
            inner.page_table.insert(page_id, frame_id);
            inner.metas[frame_id] = FrameMeta {
                page_id,
                pin_count: 1,
                is_dirty: false,
            };
            frame_id
        };
        self.replacer.record_access(frame_id)?;
        self.replacer.set_evictable(frame_id, false)?;
        drop(inner);

        Ok(BasicPageGuard::new(
            self.clone(),
            self.frames[frame_id].clone(),
            page_id,
            frame_id,
        ))
    }

    /// Pin the page and take its latch in shared mode.
    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> TidepoolResult<ReadPageGuard> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_read())
    }

    /// Pin the page and take its latch in exclusive mode.
    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> TidepoolResult<WritePageGuard> {
        Ok(self.fetch_page_basic(page_id)?.upgrade_write())
    }

    /// Drop one pin. Marks the frame evictable when the count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut inner.metas[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        if meta.pin_count == 0 {
            let _ = self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write the page back to disk and clear its dirty flag.
    ///
    /// The frame is pinned across the write so the latch is only ever taken
    /// on a frame that cannot become an eviction victim; the pool mutex is
    /// never held while the latch is, in either order. The dirty bit is
    /// cleared up front: a writer that touches the page after that point
    /// re-marks it dirty on its own unpin, so no write-back is lost.
    pub fn flush_page(&self, page_id: PageId) -> TidepoolResult<bool> {
        let frame = {
            let mut inner = self.inner.lock();
            let Some(&frame_id) = inner.page_table.get(&page_id) else {
                return Ok(false);
            };
            inner.metas[frame_id].pin_count += 1;
            inner.metas[frame_id].is_dirty = false;
            let _ = self.replacer.set_evictable(frame_id, false);
            self.frames[frame_id].clone()
        };

        let result = {
            let data = frame.read();
            let snapshot = page_bytes(&data[..]);
            self.disk_manager.write_page(page_id, &snapshot)
        };
        if result.is_err() {
            // The page never reached the disk; put the dirty bit back.
            let mut inner = self.inner.lock();
            let resident = inner.page_table.get(&page_id).copied();
            if let Some(frame_id) = resident {
                inner.metas[frame_id].is_dirty = true;
            }
        }
        self.unpin_page(page_id, false);
        result.map(|_| true)
    }

    pub fn flush_all_pages(&self) -> TidepoolResult<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock();
            inner.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and the block device. Fails (returns false)
    /// while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> TidepoolResult<bool> {
        let mut inner = self.inner.lock();
        let resident = inner.page_table.get(&page_id).copied();
        if let Some(frame_id) = resident {
            if inner.metas[frame_id].pin_count > 0 {
                return Ok(false);
            }
            inner.page_table.remove(&page_id);
            inner.metas[frame_id].reset();
            self.frames[frame_id].write().fill(0);
            self.replacer.remove(frame_id);
            inner.free_list.push_back(frame_id);
        }
        drop(inner);
        self.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Pick a usable frame: free list first, then a replacer victim whose
    /// dirty contents are written back before the frame is handed out.
    fn allocate_frame(&self, inner: &mut PoolInner) -> TidepoolResult<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        let Some(frame_id) = self.replacer.evict() else {
            return Err(TidepoolError::OutOfMemory(
                "buffer pool is full and no frame is evictable".to_string(),
            ));
        };
        let evicted = inner.metas[frame_id].clone();
        debug!(
            "evicting page {} from frame {} (dirty={})",
            evicted.page_id, frame_id, evicted.is_dirty
        );
        if evicted.is_dirty {
            let snapshot = page_bytes(&self.frames[frame_id].read()[..]);
            self.disk_manager.write_page(evicted.page_id, &snapshot)?;
        }
        if evicted.page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&evicted.page_id);
        }
        inner.metas[frame_id].reset();
        Ok(frame_id)
    }

    // Introspection used by tests and by the guards.

    pub fn free_frame_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    pub fn evictable_count(&self) -> usize {
        self.replacer.size()
    }

    pub fn resident_page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    pub fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| inner.metas[frame_id].pin_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let pool = Arc::new(BufferPoolManager::new(pool_size, 2, disk));
        (temp_dir, pool)
    }

    #[test]
    fn new_page_exhausts_pool_then_recovers_on_unpin() {
        let (_tmp, pool) = setup(3);

        let page1 = pool.new_page().unwrap();
        let page2 = pool.new_page().unwrap();
        let page3 = pool.new_page().unwrap();
        assert_eq!(pool.free_frame_count(), 0);

        // All frames pinned: no page can be created.
        assert!(matches!(
            pool.new_page(),
            Err(TidepoolError::OutOfMemory(_))
        ));

        let page1_id = page1.page_id();
        drop(page1);
        assert_eq!(pool.evictable_count(), 1);

        let page4 = pool.new_page().unwrap();
        assert_ne!(page4.page_id(), page1_id);
        assert!(pool.pin_count_of(page1_id).is_none());

        drop(page2);
        drop(page3);
        drop(page4);
    }

    #[test]
    fn fetch_resident_page_pins_it_again() {
        let (_tmp, pool) = setup(3);
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();
        assert_eq!(pool.pin_count_of(page_id), Some(1));

        let again = pool.fetch_page_basic(page_id).unwrap();
        assert_eq!(pool.pin_count_of(page_id), Some(2));
        drop(again);
        assert_eq!(pool.pin_count_of(page_id), Some(1));
        drop(page);
        assert_eq!(pool.pin_count_of(page_id), Some(0));
        assert_eq!(pool.evictable_count(), 1);
    }

    #[test]
    fn evicted_dirty_page_survives_on_disk() {
        let (_tmp, pool) = setup(1);
        let page_id = {
            let mut guard = pool.new_page().unwrap().upgrade_write();
            guard.data_mut()[0] = 42;
            guard.page_id()
        };

        // Force the only frame to be reused.
        let other = pool.new_page().unwrap();
        drop(other);

        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn flush_page_clears_dirty_and_persists_bytes() {
        let (_tmp, pool) = setup(2);
        let page_id = {
            let mut guard = pool.new_page().unwrap().upgrade_write();
            guard.data_mut()[7] = 9;
            guard.page_id()
        };
        assert!(pool.flush_page(page_id).unwrap());
        let on_disk = pool.disk_manager().read_page(page_id).unwrap();
        assert_eq!(on_disk[7], 9);
        assert!(!pool.flush_page(INVALID_PAGE_ID + 12345).unwrap());
    }

    #[test]
    fn delete_page_refuses_pinned_then_frees_frame() {
        let (_tmp, pool) = setup(2);
        let page = pool.new_page().unwrap();
        let page_id = page.page_id();

        assert!(!pool.delete_page(page_id).unwrap());
        drop(page);
        assert!(pool.delete_page(page_id).unwrap());
        assert_eq!(pool.free_frame_count(), 2);
        assert!(pool.pin_count_of(page_id).is_none());

        // Deleting an absent page is fine, and a re-fetch observes zeroes.
        assert!(pool.delete_page(page_id).unwrap());
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_table_plus_free_list_covers_the_pool() {
        let (_tmp, pool) = setup(4);
        let p1 = pool.new_page().unwrap();
        let p2 = pool.new_page().unwrap();
        assert_eq!(
            pool.resident_page_count() + pool.free_frame_count(),
            pool.pool_size()
        );
        drop(p1);
        drop(p2);
        assert_eq!(
            pool.resident_page_count() + pool.free_frame_count(),
            pool.pool_size()
        );
    }

    #[test]
    fn concurrent_readers_leave_no_pins_behind() {
        use std::sync::Barrier;
        use std::thread;

        const THREADS: usize = 8;
        let (_tmp, pool) = setup(4);
        let page_id = {
            let mut guard = pool.new_page().unwrap().upgrade_write();
            guard.data_mut()[0] = 42;
            guard.page_id()
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let pool = pool.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let guard = pool.fetch_page_read(page_id).unwrap();
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.pin_count_of(page_id), Some(0));
    }
}
