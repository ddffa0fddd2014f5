//! # Pages and the Persisted Page Header
//!
//! Every page in an environment file begins with a 12-byte persisted header.
//! The header is deliberately small: pages are identified by their file
//! offset, so the header only needs the page's role and the link that blob
//! and freelist chains use to string pages together.
//!
//! ## Persisted Header Layout (12 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       2     flags        Page role in the low byte (PageType)
//! 2       2     reserved     Reserved, written as zero
//! 4       8     next_offset  Next page of an overflow chain (0 = none)
//! ```
//!
//! ## Page Roles
//!
//! A page is owned by exactly one logical role at a time:
//!
//! - **Header** (0x01): the environment header page at offset 0
//! - **BtreeNode** (0x02): a B-tree leaf or internal node
//! - **Blob** (0x03): overflow storage for records and extended keys
//! - **DupTable** (0x04): duplicate-table storage (blob-chained)
//! - **Freelist** (0x05): a freelist trunk page
//!
//! ## In-Memory Pages
//!
//! [`Page`] is the in-memory incarnation: the page cache hands out
//! `Arc<Page>` handles, guaranteeing at most one live object per offset.
//! The buffer sits behind a `parking_lot::RwLock`; dirtiness and LRU
//! recency are tracked with atomics so read paths never take a write lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::Result;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::parse_zerocopy_mut;

pub const PERSISTED_HEADER_SIZE: usize = 12;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Header = 0x01,
    BtreeNode = 0x02,
    Blob = 0x03,
    DupTable = 0x04,
    Freelist = 0x05,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::BtreeNode,
            0x03 => PageType::Blob,
            0x04 => PageType::DupTable,
            0x05 => PageType::Freelist,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PersistedHeader {
    flags: U16,
    reserved: U16,
    next_offset: U64,
}

impl PersistedHeader {
    pub fn page_type(&self) -> PageType {
        PageType::from_byte((self.flags.get() & 0xff) as u8)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        let flags = (self.flags.get() & !0xff) | page_type as u16;
        self.flags = U16::new(flags);
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset.get()
    }

    pub fn set_next_offset(&mut self, offset: u64) {
        self.next_offset = U64::new(offset);
    }
}

const _: () = assert!(size_of::<PersistedHeader>() == PERSISTED_HEADER_SIZE);

/// A cached page. Handles are `Arc<Page>`; the cache keeps the only other
/// strong reference, so `Arc::strong_count == 1` means the page is
/// unreferenced and evictable.
pub struct Page {
    offset: u64,
    buf: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    last_use: AtomicU64,
}

impl Page {
    pub fn new(offset: u64, buf: Box<[u8]>) -> Self {
        Self {
            offset,
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(false),
            last_use: AtomicU64::new(0),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read()
    }

    /// Mutable access to the page bytes; marks the page dirty.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.dirty.store(true, Ordering::Release);
        self.buf.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn touch(&self, tick: u64) {
        self.last_use.store(tick, Ordering::Relaxed);
    }

    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Relaxed)
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.data()[0])
    }

    pub fn next_offset(&self) -> u64 {
        let data = self.data();
        u64::from_le_bytes(data[4..12].try_into().expect("header slice is 8 bytes"))
    }

    pub fn set_next_offset(&self, next_offset: u64) -> Result<()> {
        let mut data = self.data_mut();
        let header = parse_zerocopy_mut::<PersistedHeader>(&mut data[..], "PersistedHeader")?;
        header.set_next_offset(next_offset);
        Ok(())
    }

    /// Rewrites the persisted header, assigning the page's role and chain
    /// link in one step.
    pub fn init_header(&self, page_type: PageType, next_offset: u64) -> Result<()> {
        let mut data = self.data_mut();
        let header = parse_zerocopy_mut::<PersistedHeader>(&mut data[..], "PersistedHeader")?;
        header.flags = U16::new(page_type as u16);
        header.reserved = U16::new(0);
        header.next_offset = U64::new(next_offset);
        Ok(())
    }
}
