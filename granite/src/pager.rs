//! The pager for reading and writing pages to disk.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::{Page, PageId, HEADER_PAGE_ID, PAGE_SIZE};

pub struct Pager {
    file: File,
    num_pages: PageId,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path_ref)?;

        let file_size = file.metadata()?.len();
        // Page 0 is reserved for the header page even in a fresh file.
        let num_pages = ((file_size / PAGE_SIZE as u64) as PageId).max(HEADER_PAGE_ID + 1);
        debug!(
            "opened database file {:?}, size {}, num_pages {}",
            path_ref, file_size, num_pages
        );

        Ok(Self { file, num_pages })
    }

    /// Reads a page; pages that were allocated but never written come back
    /// zero-filled.
    pub fn read_page(&mut self, page_id: PageId) -> io::Result<Page> {
        assert!(page_id >= 0, "read of invalid page id {}", page_id);
        let mut page = Page::new(page_id);
        if page_id >= self.num_pages {
            return Ok(page);
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut page.data[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(page)
    }

    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        assert!(page.id >= 0, "write of invalid page id {}", page.id);
        let offset = page.id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.data)?;
        self.file.sync_all()?;
        if page.id >= self.num_pages {
            self.num_pages = page.id + 1;
        }
        Ok(())
    }

    pub fn allocate_page(&mut self) -> PageId {
        let page_id = self.num_pages;
        self.num_pages += 1;
        debug!("allocated page {}", page_id);
        page_id
    }

    // TODO: track freed pages in an on-disk free list instead of leaking
    // them until the file is rebuilt.
    pub fn deallocate_page(&mut self, _page_id: PageId) {}

    pub fn num_pages(&self) -> PageId {
        self.num_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pager_round_trip() {
        let temp_dir = tempdir().unwrap();
        let temp_path = temp_dir.path().join("test.db");

        let mut pager = Pager::open(&temp_path).unwrap();

        // Page 0 is reserved; the first allocation comes after it.
        let page_id = pager.allocate_page();
        assert_eq!(page_id, 1);

        let mut page = pager.read_page(page_id).unwrap();
        page.data[0] = 0xAB;
        page.data[PAGE_SIZE - 1] = 0xCD;
        pager.write_page(&page).unwrap();

        drop(pager);
        let mut pager = Pager::open(&temp_path).unwrap();
        let page = pager.read_page(page_id).unwrap();
        assert_eq!(page.data[0], 0xAB);
        assert_eq!(page.data[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_unwritten_page_reads_zeroed() {
        let temp_dir = tempdir().unwrap();
        let mut pager = Pager::open(temp_dir.path().join("fresh.db")).unwrap();
        let page = pager.read_page(0).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }
}
