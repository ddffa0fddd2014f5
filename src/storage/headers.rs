//! # Environment Header and Database Descriptors
//!
//! The page at offset 0 of an environment file is the header page. After the
//! 12-byte persisted page header it carries the environment header and the
//! database descriptor array.
//!
//! ## Environment Header Layout (44 bytes, at offset 12)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ------------------------------------
//! 0       4     magic            b"emb1"
//! 4       4     version          major, minor, revision, build
//! 8       4     serialno         File serial number
//! 12      4     page_size        Page size this file was created with
//! 16      2     max_databases    Descriptor slots in this file
//! 18      2     reserved
//! 20      8     freelist_head    First freelist trunk page (0 = none)
//! 28      8     last_flushed_lsn Recovery watermark: every mutation with
//!                                lsn <= this is in the main file
//! 36      1     dirty_shutdown   Nonzero while open with recovery enabled
//! 37      7     reserved
//! ```
//!
//! ## Database Descriptor Layout (32 bytes each, at offset 56)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ----------------------------------------
//! 0       2     name        Database name (0 = free slot)
//! 2       4     flags       Database flags (ENABLE_DUPLICATES, ...)
//! 6       8     root_page   Offset of the B-tree root page
//! 14      2     key_size    Inline key capacity of B-tree slots
//! 16      2     key_type    0 = binary/memcmp, 1 = u64 numeric
//! 18      14    reserved
//! ```
//!
//! `Environment::create` validates that `56 + max_databases * 32` fits the
//! configured page size, so the whole descriptor array always lives in the
//! header page.
//!
//! All multi-byte fields are little-endian via the zerocopy `U16`/`U32`/
//! `U64` wrapper types, which are alignment-1 and therefore safe to overlay
//! on any offset of a page buffer.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::PERSISTED_HEADER_SIZE;

pub const ENV_MAGIC: [u8; 4] = *b"emb1";
pub const ENV_VERSION: [u8; 4] = [1, 0, 0, 0];

pub const ENV_HEADER_SIZE: usize = 44;
pub const DB_DESCRIPTOR_SIZE: usize = 32;

/// Byte offset of the environment header inside the header page.
pub const ENV_HEADER_OFFSET: usize = PERSISTED_HEADER_SIZE;

/// Byte offset of the descriptor array inside the header page.
pub const DESCRIPTOR_ARRAY_OFFSET: usize = ENV_HEADER_OFFSET + ENV_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EnvHeader {
    magic: [u8; 4],
    version: [u8; 4],
    serialno: U32,
    page_size: U32,
    max_databases: U16,
    reserved: U16,
    freelist_head: U64,
    last_flushed_lsn: U64,
    dirty_shutdown: u8,
    reserved2: [u8; 7],
}

const _: () = assert!(size_of::<EnvHeader>() == ENV_HEADER_SIZE);

impl EnvHeader {
    pub fn new(page_size: u32, max_databases: u16) -> Self {
        Self {
            magic: ENV_MAGIC,
            version: ENV_VERSION,
            serialno: U32::new(0),
            page_size: U32::new(page_size),
            max_databases: U16::new(max_databases),
            reserved: U16::new(0),
            freelist_head: U64::new(0),
            last_flushed_lsn: U64::new(0),
            dirty_shutdown: 0,
            reserved2: [0u8; 7],
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic == ENV_MAGIC,
            "invalid magic bytes in environment header: {:02x?}",
            self.magic
        );
        ensure!(
            self.version[0] == ENV_VERSION[0],
            "unsupported file format version: {} (expected {})",
            self.version[0],
            ENV_VERSION[0]
        );
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn max_databases(&self) -> u16 {
        self.max_databases.get()
    }

    pub fn serialno(&self) -> u32 {
        self.serialno.get()
    }

    pub fn set_serialno(&mut self, serialno: u32) {
        self.serialno = U32::new(serialno);
    }

    pub fn freelist_head(&self) -> u64 {
        self.freelist_head.get()
    }

    pub fn set_freelist_head(&mut self, offset: u64) {
        self.freelist_head = U64::new(offset);
    }

    pub fn last_flushed_lsn(&self) -> u64 {
        self.last_flushed_lsn.get()
    }

    pub fn set_last_flushed_lsn(&mut self, lsn: u64) {
        self.last_flushed_lsn = U64::new(lsn);
    }

    pub fn dirty_shutdown(&self) -> bool {
        self.dirty_shutdown != 0
    }

    pub fn set_dirty_shutdown(&mut self, dirty: bool) {
        self.dirty_shutdown = dirty as u8;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbDescriptor {
    name: U16,
    flags: U32,
    root_page: U64,
    key_size: U16,
    key_type: U16,
    reserved: [u8; 14],
}

const _: () = assert!(size_of::<DbDescriptor>() == DB_DESCRIPTOR_SIZE);

impl DbDescriptor {
    pub fn new(name: u16, flags: u32, root_page: u64, key_size: u16, key_type: u16) -> Self {
        Self {
            name: U16::new(name),
            flags: U32::new(flags),
            root_page: U64::new(root_page),
            key_size: U16::new(key_size),
            key_type: U16::new(key_type),
            reserved: [0u8; 14],
        }
    }

    pub fn is_free(&self) -> bool {
        self.name.get() == 0
    }

    pub fn clear(&mut self) {
        *self = Self::new(0, 0, 0, 0, 0);
    }

    pub fn name(&self) -> u16 {
        self.name.get()
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn root_page(&self) -> u64 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, offset: u64) {
        self.root_page = U64::new(offset);
    }

    pub fn key_size(&self) -> u16 {
        self.key_size.get()
    }

    pub fn key_type(&self) -> u16 {
        self.key_type.get()
    }
}

/// Byte range of descriptor slot `index` inside the header page.
pub fn descriptor_range(index: u16) -> std::ops::Range<usize> {
    let start = DESCRIPTOR_ARRAY_OFFSET + index as usize * DB_DESCRIPTOR_SIZE;
    start..start + DB_DESCRIPTOR_SIZE
}
