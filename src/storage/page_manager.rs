//! # Page Manager
//!
//! The page manager owns every page of an environment: it allocates them
//! (from the freelist or by extending the device), serves them out of an
//! offset-keyed cache, tracks dirtiness, and writes them back.
//!
//! ## Cache Discipline
//!
//! The cache is a `hashbrown::HashMap<u64, Arc<Page>>` keyed by file offset.
//! There is never more than one live [`Page`] object per offset: concurrent
//! users of the same page share the `Arc`. The cache holds one strong
//! reference per entry, so `Arc::strong_count == 1` identifies pages with no
//! outstanding handles. Handles released on every exit path (they are plain
//! `Arc`s) mean a fetch is always balanced by a release.
//!
//! ## Eviction
//!
//! When the cache is at capacity, the manager evicts the least recently used
//! page that has no outstanding handles, preferring clean pages. A dirty
//! victim is written to the device first. The header page (offset 0) is
//! pinned and never evicted. If every page is referenced the cache grows
//! past its capacity until handles are released.
//!
//! ## Allocation
//!
//! `alloc` pops the freelist unless the caller passes [`IGNORE_FREELIST`];
//! an empty freelist extends the file by one page. Fresh pages are always
//! zero-initialized, regardless of what the freed extent contained.
//!
//! ## Freelist Maintenance
//!
//! The trunk-chain algorithms of [`super::freelist`] are driven from here;
//! the chain head is mirrored into the environment header page whenever it
//! moves, so a clean flush always persists a walkable freelist.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;

use crate::device::Device;

use super::freelist::{TrunkView, TrunkViewMut};
use super::headers::{EnvHeader, ENV_HEADER_OFFSET, ENV_HEADER_SIZE};
use super::page::{Page, PageType};
use super::parse_zerocopy_mut;

/// Allocate by extending the file even when the freelist has entries.
pub const IGNORE_FREELIST: u32 = 1 << 0;

pub struct PageManager {
    device: Box<dyn Device>,
    page_size: usize,
    capacity: usize,
    cache: HashMap<u64, Arc<Page>>,
    tick: u64,
    end_offset: u64,
    freelist_head: u64,
}

impl PageManager {
    pub fn new(device: Box<dyn Device>, page_size: usize, capacity: usize) -> Result<Self> {
        let end_offset = device.len()?;
        ensure!(
            end_offset % page_size as u64 == 0,
            "device size {} is not a multiple of the page size {}",
            end_offset,
            page_size
        );

        Ok(Self {
            device,
            page_size,
            capacity,
            cache: HashMap::new(),
            tick: 0,
            end_offset,
            freelist_head: 0,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages the file currently spans, the header page included.
    pub fn total_pages(&self) -> u64 {
        self.end_offset / self.page_size as u64
    }

    pub fn freelist_head(&self) -> u64 {
        self.freelist_head
    }

    /// Restores the freelist head read from the environment header on open.
    pub fn restore_freelist_head(&mut self, offset: u64) {
        self.freelist_head = offset;
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Returns the cached page for `offset`, reading it from the device on a
    /// miss.
    pub fn fetch(&mut self, offset: u64) -> Result<Arc<Page>> {
        ensure!(
            offset % self.page_size as u64 == 0 && offset < self.end_offset,
            "page offset {} out of bounds (end={})",
            offset,
            self.end_offset
        );

        let tick = self.next_tick();
        if let Some(page) = self.cache.get(&offset) {
            page.touch(tick);
            return Ok(Arc::clone(page));
        }

        self.make_room()?;

        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.device
            .read_at(offset, &mut buf)
            .wrap_err_with(|| format!("failed to fetch page at offset {}", offset))?;

        let page = Arc::new(Page::new(offset, buf));
        page.touch(tick);
        self.cache.insert(offset, Arc::clone(&page));
        Ok(page)
    }

    /// Returns a fresh zero-initialized page with its persisted header set
    /// to `page_type`.
    pub fn alloc(&mut self, page_type: PageType, flags: u32) -> Result<Arc<Page>> {
        let offset = if flags & IGNORE_FREELIST == 0 {
            self.pop_free()?
        } else {
            None
        };

        let offset = match offset {
            Some(offset) => offset,
            None => {
                let offset = self.end_offset;
                self.end_offset += self.page_size as u64;
                offset
            }
        };

        self.make_room()?;
        let tick = self.next_tick();

        // Reuse the cached object if one exists for this offset (a recycled
        // freelist trunk); the offset-uniqueness invariant forbids a second.
        let page = match self.cache.get(&offset) {
            Some(page) => {
                let page = Arc::clone(page);
                page.data_mut().fill(0);
                page
            }
            None => {
                let page = Arc::new(Page::new(
                    offset,
                    vec![0u8; self.page_size].into_boxed_slice(),
                ));
                self.cache.insert(offset, Arc::clone(&page));
                page
            }
        };

        page.touch(tick);
        page.mark_dirty();
        page.init_header(page_type, 0)?;
        Ok(page)
    }

    /// Returns the page's extent to the freelist and drops its cache entry.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        ensure!(offset != 0, "the header page cannot be freed");
        ensure!(
            offset % self.page_size as u64 == 0 && offset < self.end_offset,
            "free of page offset {} out of bounds (end={})",
            offset,
            self.end_offset
        );

        self.cache.remove(&offset);

        if self.freelist_head == 0 {
            self.init_trunk(offset, 0)?;
            return self.set_freelist_head(offset);
        }

        let head = self.fetch(self.freelist_head)?;
        let full = {
            let mut data = head.data_mut();
            let mut trunk = TrunkViewMut::new(&mut data);
            if trunk.is_full() {
                true
            } else {
                trunk.push(offset)?;
                false
            }
        };

        if full {
            let old_head = self.freelist_head;
            self.init_trunk(offset, old_head)?;
            self.set_freelist_head(offset)?;
        }
        Ok(())
    }

    fn init_trunk(&mut self, offset: u64, next: u64) -> Result<()> {
        let page = Arc::new(Page::new(
            offset,
            vec![0u8; self.page_size].into_boxed_slice(),
        ));
        let tick = self.next_tick();
        page.touch(tick);
        page.mark_dirty();
        page.init_header(PageType::Freelist, next)?;
        self.make_room()?;
        self.cache.insert(offset, page);
        Ok(())
    }

    fn pop_free(&mut self) -> Result<Option<u64>> {
        if self.freelist_head == 0 {
            return Ok(None);
        }

        let head_offset = self.freelist_head;
        let head = self.fetch(head_offset)?;

        let popped = {
            let mut data = head.data_mut();
            TrunkViewMut::new(&mut data).pop()?
        };
        if popped.is_some() {
            return Ok(popped);
        }

        // Empty trunk: the trunk page itself is the next allocation.
        let next = head.next_offset();
        drop(head);
        self.cache.remove(&head_offset);
        self.set_freelist_head(next)?;
        Ok(Some(head_offset))
    }

    fn set_freelist_head(&mut self, offset: u64) -> Result<()> {
        self.freelist_head = offset;

        let header_page = self.fetch(0)?;
        let mut data = header_page.data_mut();
        let header = parse_zerocopy_mut::<EnvHeader>(
            &mut data[ENV_HEADER_OFFSET..ENV_HEADER_OFFSET + ENV_HEADER_SIZE],
            "EnvHeader",
        )?;
        header.set_freelist_head(offset);
        Ok(())
    }

    /// Writes every dirty page to the device and flushes it.
    pub fn flush_all(&mut self) -> Result<usize> {
        let mut flushed = 0;
        let mut offsets: Vec<u64> = self
            .cache
            .values()
            .filter(|p| p.is_dirty())
            .map(|p| p.offset())
            .collect();
        offsets.sort_unstable();

        for offset in offsets {
            if let Some(page) = self.cache.get(&offset) {
                let data = page.data();
                self.device
                    .write_at(offset, &data)
                    .wrap_err_with(|| format!("failed to flush page at offset {}", offset))?;
                page.clear_dirty();
                flushed += 1;
            }
        }

        self.device.flush()?;
        Ok(flushed)
    }

    /// Evicts a page without writing it back (teardown and tests).
    pub fn remove(&mut self, offset: u64) {
        self.cache.remove(&offset);
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Total reusable pages: freelist entries plus the trunk pages holding
    /// them.
    pub fn free_page_count(&mut self) -> Result<u64> {
        let mut count = 0u64;
        let mut head = self.freelist_head;
        while head != 0 {
            let trunk = self.fetch(head)?;
            let entries = {
                let data = trunk.data();
                TrunkView::new(&data).count()?
            };
            count += entries as u64 + 1;
            head = trunk.next_offset();
        }
        Ok(count)
    }

    fn make_room(&mut self) -> Result<()> {
        if self.cache.len() < self.capacity {
            return Ok(());
        }

        // Only clean, unreferenced pages are evictable. Dirty pages must
        // not reach the device ahead of the recovery watermark, so they
        // stay cached until the next flush; the cache overflows its
        // capacity in the meantime.
        let victim = self
            .cache
            .iter()
            .filter(|(&offset, page)| {
                offset != 0 && Arc::strong_count(page) == 1 && !page.is_dirty()
            })
            .min_by_key(|(_, page)| page.last_use())
            .map(|(&offset, _)| offset);

        if let Some(offset) = victim {
            self.cache.remove(&offset);
        }
        Ok(())
    }

    /// Direct device flush, used after header updates outside the page path.
    pub fn sync_device(&self) -> Result<()> {
        self.device.flush()
    }
}

impl std::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageManager")
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("cached", &self.cache.len())
            .field("total_pages", &self.total_pages())
            .field("freelist_head", &self.freelist_head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::storage::headers::DESCRIPTOR_ARRAY_OFFSET;

    const PAGE_SIZE: usize = 1024;

    fn manager(capacity: usize) -> PageManager {
        let mut pm =
            PageManager::new(Box::new(MemoryDevice::new()), PAGE_SIZE, capacity).unwrap();
        // Format a minimal header page so freelist head updates have a home.
        let header = pm.alloc(PageType::Header, IGNORE_FREELIST).unwrap();
        {
            let mut data = header.data_mut();
            let env = EnvHeader::new(PAGE_SIZE as u32, 16);
            use zerocopy::IntoBytes;
            data[ENV_HEADER_OFFSET..ENV_HEADER_OFFSET + ENV_HEADER_SIZE]
                .copy_from_slice(env.as_bytes());
            assert!(DESCRIPTOR_ARRAY_OFFSET < PAGE_SIZE);
        }
        pm
    }

    #[test]
    fn alloc_extends_file_and_zeroes() {
        let mut pm = manager(16);

        let page = pm.alloc(PageType::BtreeNode, 0).unwrap();
        assert_eq!(page.offset(), PAGE_SIZE as u64);
        assert_eq!(pm.total_pages(), 2);
        assert!(page.data()[12..].iter().all(|&b| b == 0));
        assert_eq!(page.page_type(), PageType::BtreeNode);
    }

    #[test]
    fn fetch_returns_shared_object() {
        let mut pm = manager(16);
        let page = pm.alloc(PageType::Blob, 0).unwrap();
        let offset = page.offset();
        page.data_mut()[100] = 0x42;

        let again = pm.fetch(offset).unwrap();
        assert!(Arc::ptr_eq(&page, &again));
        assert_eq!(again.data()[100], 0x42);
    }

    #[test]
    fn fetch_out_of_bounds_fails() {
        let mut pm = manager(16);
        assert!(pm.fetch(10 * PAGE_SIZE as u64).is_err());
        assert!(pm.fetch(13).is_err());
    }

    #[test]
    fn free_then_alloc_reuses_extent() {
        let mut pm = manager(16);
        let a = pm.alloc(PageType::BtreeNode, 0).unwrap();
        let offset_a = a.offset();
        drop(a);

        pm.free(offset_a).unwrap();
        // offset_a became the freelist trunk; the next alloc recycles it.
        assert_eq!(pm.freelist_head(), offset_a);

        let b = pm.alloc(PageType::Blob, 0).unwrap();
        assert_eq!(b.offset(), offset_a);
        assert_eq!(pm.freelist_head(), 0);
        assert_eq!(pm.total_pages(), 2);
    }

    #[test]
    fn ignore_freelist_extends_anyway() {
        let mut pm = manager(16);
        let a = pm.alloc(PageType::BtreeNode, 0).unwrap();
        let offset_a = a.offset();
        drop(a);
        pm.free(offset_a).unwrap();

        let b = pm.alloc(PageType::BtreeNode, IGNORE_FREELIST).unwrap();
        assert_ne!(b.offset(), offset_a);
        assert_eq!(pm.free_page_count().unwrap(), 1);
    }

    #[test]
    fn free_page_count_spans_trunks() {
        let mut pm = manager(64);
        let offsets: Vec<u64> = (0..5)
            .map(|_| pm.alloc(PageType::Blob, 0).unwrap().offset())
            .collect();
        for offset in &offsets {
            pm.free(*offset).unwrap();
        }
        // One trunk page plus four entries.
        assert_eq!(pm.free_page_count().unwrap(), 5);
    }

    #[test]
    fn flush_all_persists_dirty_pages() {
        let mut pm = manager(16);
        let page = pm.alloc(PageType::Blob, 0).unwrap();
        let offset = page.offset();
        page.data_mut()[200] = 0x7E;
        drop(page);

        let flushed = pm.flush_all().unwrap();
        assert!(flushed >= 1);

        pm.remove(offset);
        let reread = pm.fetch(offset).unwrap();
        assert_eq!(reread.data()[200], 0x7E);
        assert!(!reread.is_dirty());
    }

    #[test]
    fn eviction_takes_clean_pages_only() {
        let mut pm = manager(4);
        let mut offsets = Vec::new();
        for _ in 0..8 {
            let page = pm.alloc(PageType::Blob, 0).unwrap();
            offsets.push(page.offset());
        }
        // All eight pages are dirty: the cache overflows rather than
        // letting unflushed pages reach the device.
        assert_eq!(pm.cached_pages(), 9);

        pm.flush_all().unwrap();
        for _ in 0..4 {
            let page = pm.alloc(PageType::Blob, 0).unwrap();
            offsets.push(page.offset());
        }
        // Clean pages made room for the new dirty ones.
        assert!(pm.cached_pages() < 13);

        // The header page survives any amount of pressure.
        let header = pm.fetch(0).unwrap();
        assert_eq!(header.offset(), 0);

        // An evicted page reads back from the device intact.
        let first = pm.fetch(offsets[0]).unwrap();
        assert_eq!(first.page_type(), PageType::Blob);
    }

    #[test]
    fn referenced_pages_are_not_evicted() {
        let mut pm = manager(4);
        let held: Vec<_> = (0..6).map(|_| pm.alloc(PageType::Blob, 0).unwrap()).collect();

        for page in &held {
            let again = pm.fetch(page.offset()).unwrap();
            assert!(Arc::ptr_eq(page, &again));
        }
    }

    #[test]
    fn remove_discards_without_flush() {
        let mut pm = manager(16);
        let page = pm.alloc(PageType::Blob, 0).unwrap();
        let offset = page.offset();
        pm.flush_all().unwrap();

        page.data_mut()[300] = 0x55;
        drop(page);
        pm.remove(offset);

        let reread = pm.fetch(offset).unwrap();
        assert_eq!(reread.data()[300], 0x00);
    }
}
