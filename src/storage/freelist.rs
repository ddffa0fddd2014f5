//! # Freelist Trunk Pages
//!
//! Pages released by the B-tree (merged nodes, freed blob chains, shrunk
//! duplicate tables) are not returned to the filesystem; they are recorded
//! in the freelist and handed out again by the page manager before the file
//! is extended.
//!
//! The freelist is a chain of trunk pages. Each trunk holds an array of
//! free page offsets; the chain link lives in the persisted page header's
//! `next_offset` field. The head of the chain is stored in the environment
//! header.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! 0       12    Persisted header (type = Freelist, next_offset = next trunk)
//! 12      4     count: number of offsets stored in this trunk
//! 16      8*N   free page offsets
//! ```
//!
//! ## Allocation Protocol
//!
//! - Pop from the head trunk while it has entries.
//! - An empty head trunk is itself the next allocation: the head moves to
//!   `next_offset` and the trunk page is recycled.
//! - Freeing a page pushes onto the head trunk; a full head trunk turns the
//!   freed page into the new head.
//!
//! The freelist is single-writer: only the page manager touches it, under
//! the environment core lock. Persistence is through ordinary page writes;
//! recovery reconstructs nothing, it simply walks the chain from the header.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;

use super::page::PERSISTED_HEADER_SIZE;
use super::{parse_zerocopy, parse_zerocopy_mut};

/// Offset of the entry count inside a trunk page.
const COUNT_OFFSET: usize = PERSISTED_HEADER_SIZE;

/// Offset of the first free-page entry inside a trunk page.
const ENTRIES_OFFSET: usize = COUNT_OFFSET + 4;

/// Number of offsets a trunk page can hold for the given page size.
pub fn trunk_capacity(page_size: usize) -> usize {
    (page_size - ENTRIES_OFFSET) / 8
}

pub struct TrunkView<'a> {
    data: &'a [u8],
}

impl<'a> TrunkView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn count(&self) -> Result<u32> {
        let count = parse_zerocopy::<U32>(&self.data[COUNT_OFFSET..], "trunk count")?;
        Ok(count.get())
    }

    pub fn entry(&self, index: u32) -> Result<u64> {
        ensure!(
            index < self.count()?,
            "freelist entry {} out of bounds (count={})",
            index,
            self.count()?
        );
        let start = ENTRIES_OFFSET + index as usize * 8;
        Ok(u64::from_le_bytes(
            self.data[start..start + 8].try_into().expect("8-byte entry"),
        ))
    }
}

pub struct TrunkViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> TrunkViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(
            self.data[COUNT_OFFSET..COUNT_OFFSET + 4]
                .try_into()
                .expect("4-byte count"),
        )
    }

    fn set_count(&mut self, count: u32) -> Result<()> {
        let field = parse_zerocopy_mut::<U32>(&mut self.data[COUNT_OFFSET..], "trunk count")?;
        *field = U32::new(count);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.count() as usize >= trunk_capacity(self.data.len())
    }

    pub fn push(&mut self, offset: u64) -> Result<()> {
        let count = self.count();
        ensure!(
            (count as usize) < trunk_capacity(self.data.len()),
            "push into full freelist trunk (count={})",
            count
        );
        let start = ENTRIES_OFFSET + count as usize * 8;
        self.data[start..start + 8].copy_from_slice(&offset.to_le_bytes());
        self.set_count(count + 1)
    }

    pub fn pop(&mut self) -> Result<Option<u64>> {
        let count = self.count();
        if count == 0 {
            return Ok(None);
        }
        let start = ENTRIES_OFFSET + (count - 1) as usize * 8;
        let offset = u64::from_le_bytes(
            self.data[start..start + 8].try_into().expect("8-byte entry"),
        );
        self.set_count(count - 1)?;
        Ok(Some(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_for_1k_pages() {
        // (1024 - 16) / 8
        assert_eq!(trunk_capacity(1024), 126);
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut data = vec![0u8; 1024];
        let mut trunk = TrunkViewMut::new(&mut data);

        trunk.push(2048).unwrap();
        trunk.push(4096).unwrap();
        assert_eq!(trunk.count(), 2);

        assert_eq!(trunk.pop().unwrap(), Some(4096));
        assert_eq!(trunk.pop().unwrap(), Some(2048));
        assert_eq!(trunk.pop().unwrap(), None);
    }

    #[test]
    fn read_view_sees_writes() {
        let mut data = vec![0u8; 1024];
        TrunkViewMut::new(&mut data).push(3072).unwrap();

        let view = TrunkView::new(&data);
        assert_eq!(view.count().unwrap(), 1);
        assert_eq!(view.entry(0).unwrap(), 3072);
        assert!(view.entry(1).is_err());
    }

    #[test]
    fn push_rejects_overflow() {
        let page_size = 64;
        let mut data = vec![0u8; page_size];
        let cap = trunk_capacity(page_size);

        for i in 0..cap {
            TrunkViewMut::new(&mut data).push(i as u64 * 64).unwrap();
        }
        assert!(TrunkViewMut::new(&mut data).is_full());
        assert!(TrunkViewMut::new(&mut data).push(9999).is_err());
    }
}
