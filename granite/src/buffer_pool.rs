//! The buffer pool manager.
//!
//! A fixed array of frames caching disk pages. The page table mapping page
//! ids to frame indexes is the extendible hash table; victim selection is
//! the LRU replacer. Pinned frames are never evicted.

use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{EngineError, EngineResult};
use crate::hash_table::ExtendibleHashTable;
use crate::page::{Page, RwLatch};
use crate::pager::Pager;
use crate::replacer::LruReplacer;
use crate::PageId;

const PAGE_TABLE_BUCKET_SIZE: usize = 16;

/// A single frame in the buffer pool.
pub struct Frame {
    /// The crabbing latch. Held across buffer pool calls by index code;
    /// never taken by the pool itself.
    pub latch: RwLatch,
    page: RwLock<Page>,
    pin_count: Mutex<u32>,
    is_dirty: Mutex<bool>,
}

impl Frame {
    fn new() -> Self {
        Self {
            latch: RwLatch::new(),
            page: RwLock::new(Page::new(crate::INVALID_PAGE_ID)),
            pin_count: Mutex::new(0),
            is_dirty: Mutex::new(false),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        *self.is_dirty.lock() = true;
        self.page.write()
    }

    pub fn page_id(&self) -> PageId {
        self.page.read().id
    }

    pub fn pin_count(&self) -> u32 {
        *self.pin_count.lock()
    }
}

pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<Frame>>,
    page_table: ExtendibleHashTable<PageId, usize>,
    replacer: LruReplacer<usize>,
    free_list: Mutex<Vec<usize>>,
    pager: Mutex<Pager>,
    /// Serializes mapping changes (page table, pins, frame reuse).
    latch: Mutex<()>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, pager: Pager) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = Vec::with_capacity(pool_size);
        for i in (0..pool_size).rev() {
            free_list.push(i);
        }
        for _ in 0..pool_size {
            frames.push(Arc::new(Frame::new()));
        }
        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruReplacer::new(),
            free_list: Mutex::new(free_list),
            pager: Mutex::new(pager),
            latch: Mutex::new(()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocates a fresh page on disk and pins it in a frame.
    pub fn new_page(&self) -> EngineResult<(PageId, Arc<Frame>)> {
        let _guard = self.latch.lock();
        let frame_index = self
            .grab_frame()?
            .ok_or(EngineError::OutOfMemory)?;
        let frame = self.frames[frame_index].clone();

        let page_id = self.pager.lock().allocate_page();
        {
            let mut page = frame.page.write();
            page.reset(page_id);
        }
        *frame.is_dirty.lock() = true;
        *frame.pin_count.lock() = 1;
        self.page_table.insert(&page_id, &frame_index);
        debug!("new page {} in frame {}", page_id, frame_index);
        Ok((page_id, frame))
    }

    /// Returns a pinned frame holding `page_id`, reading it from disk if it
    /// is not cached.
    pub fn fetch_page(&self, page_id: PageId) -> EngineResult<Arc<Frame>> {
        let _guard = self.latch.lock();
        if let Some(frame_index) = self.page_table.find(&page_id) {
            let frame = self.frames[frame_index].clone();
            {
                let mut pin_count = frame.pin_count.lock();
                *pin_count += 1;
                if *pin_count == 1 {
                    self.replacer.erase(&frame_index);
                }
            }
            return Ok(frame);
        }

        let frame_index = self
            .grab_frame()?
            .ok_or(EngineError::AllPagesPinned)?;
        let frame = self.frames[frame_index].clone();

        let page = self.pager.lock().read_page(page_id)?;
        *frame.page.write() = page;
        *frame.is_dirty.lock() = false;
        *frame.pin_count.lock() = 1;
        self.page_table.insert(&page_id, &frame_index);
        Ok(frame)
    }

    /// Drops one pin. Unpinning to zero makes the frame a replacement
    /// candidate. Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _guard = self.latch.lock();
        let Some(frame_index) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_index];
        if is_dirty {
            *frame.is_dirty.lock() = true;
        }
        let mut pin_count = frame.pin_count.lock();
        if *pin_count == 0 {
            return false;
        }
        *pin_count -= 1;
        if *pin_count == 0 {
            self.replacer.insert(frame_index);
        }
        true
    }

    /// Writes the page back to disk if it is resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> EngineResult<bool> {
        let _guard = self.latch.lock();
        self.flush_frame_of(page_id)
    }

    pub fn flush_all(&self) -> EngineResult<()> {
        let _guard = self.latch.lock();
        let mut resident = Vec::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let id = frame.page.read().id;
            if id != crate::INVALID_PAGE_ID && self.page_table.find(&id) == Some(i) {
                resident.push(id);
            }
        }
        for page_id in resident {
            self.flush_frame_of(page_id)?;
        }
        Ok(())
    }

    /// Removes `page_id` from the pool and the disk allocator. Fails with
    /// `false` while the page is pinned; deleting a non-resident page
    /// succeeds trivially.
    pub fn delete_page(&self, page_id: PageId) -> EngineResult<bool> {
        let _guard = self.latch.lock();
        let Some(frame_index) = self.page_table.find(&page_id) else {
            self.pager.lock().deallocate_page(page_id);
            return Ok(true);
        };
        let frame = self.frames[frame_index].clone();
        if *frame.pin_count.lock() > 0 {
            return Ok(false);
        }
        self.page_table.remove(&page_id);
        self.replacer.erase(&frame_index);
        {
            let mut page = frame.page.write();
            page.reset(crate::INVALID_PAGE_ID);
        }
        *frame.is_dirty.lock() = false;
        self.free_list.lock().push(frame_index);
        self.pager.lock().deallocate_page(page_id);
        debug!("deleted page {}", page_id);
        Ok(true)
    }

    /// Finds a usable frame: the free list first, then an LRU victim whose
    /// old page is written back if dirty.
    fn grab_frame(&self) -> EngineResult<Option<usize>> {
        if let Some(frame_index) = self.free_list.lock().pop() {
            return Ok(Some(frame_index));
        }
        let Some(frame_index) = self.replacer.victim() else {
            return Ok(None);
        };
        let frame = &self.frames[frame_index];
        let old_id = frame.page.read().id;
        debug_assert_eq!(frame.pin_count(), 0);
        if *frame.is_dirty.lock() {
            let page = frame.page.read();
            self.pager.lock().write_page(&page)?;
        }
        *frame.is_dirty.lock() = false;
        self.page_table.remove(&old_id);
        debug!("evicted page {} from frame {}", old_id, frame_index);
        Ok(Some(frame_index))
    }

    fn flush_frame_of(&self, page_id: PageId) -> EngineResult<bool> {
        let Some(frame_index) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_index];
        let mut is_dirty = frame.is_dirty.lock();
        if *is_dirty {
            let page = frame.page.read();
            self.pager.lock().write_page(&page)?;
            *is_dirty = false;
        }
        Ok(true)
    }
}
