//! # Blob Chains
//!
//! Records that do not fit inline in a key slot, keys longer than the
//! inline capacity, and duplicate tables all live in blob chains: one or
//! more whole pages strung together through the persisted header's
//! `next_offset` link.
//!
//! ## Blob Header Layout (24 bytes, first page of a chain only)
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ----------------------------------------
//! 0       8     total_size      Stored payload bytes across the chain
//! 8       8     allocated_size  Payload capacity of the allocated chain
//! 16      4     flags           Bit 0: payload is compressed
//! 20      4     raw_size        Pre-compression size (0 when uncompressed)
//! ```
//!
//! Payload begins after the blob header on the first page and directly
//! after the persisted header on continuation pages.
//!
//! ## Overwrite Strategy
//!
//! Overwriting reuses the existing chain when the new payload fits the
//! allocated capacity (`allocated_size` never shrinks), otherwise the chain
//! is freed and reallocated. Callers must treat the returned offset as the
//! blob's new identity.
//!
//! Compression happens above this module: callers hand in bytes that are
//! already compressed and tag them via `flags`/`raw_size`; reads hand the
//! stored bytes and the tag back.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::{
    parse_zerocopy, parse_zerocopy_mut, PageManager, PageType, PERSISTED_HEADER_SIZE,
};

pub const BLOB_HEADER_SIZE: usize = 24;

pub const BLOB_FLAG_COMPRESSED: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct BlobHeader {
    total_size: U64,
    allocated_size: U64,
    flags: U32,
    raw_size: U32,
}

const _: () = assert!(size_of::<BlobHeader>() == BLOB_HEADER_SIZE);

/// Payload capacity of the first page of a chain.
fn head_capacity(page_size: usize) -> usize {
    page_size - PERSISTED_HEADER_SIZE - BLOB_HEADER_SIZE
}

/// Payload capacity of continuation pages.
fn tail_capacity(page_size: usize) -> usize {
    page_size - PERSISTED_HEADER_SIZE
}

/// Metadata stored alongside a blob's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub total_size: u64,
    pub allocated_size: u64,
    pub flags: u32,
    pub raw_size: u32,
}

pub fn blob_info(pm: &mut PageManager, offset: u64) -> Result<BlobInfo> {
    let page = pm.fetch(offset)?;
    let data = page.data();
    let header = parse_zerocopy::<BlobHeader>(&data[PERSISTED_HEADER_SIZE..], "BlobHeader")?;
    Ok(BlobInfo {
        total_size: header.total_size.get(),
        allocated_size: header.allocated_size.get(),
        flags: header.flags.get(),
        raw_size: header.raw_size.get(),
    })
}

/// Allocates a chain holding `payload`, returning the head page offset.
pub fn blob_alloc(
    pm: &mut PageManager,
    payload: &[u8],
    page_type: PageType,
    flags: u32,
    raw_size: u32,
) -> Result<u64> {
    let page_size = pm.page_size();
    let head_cap = head_capacity(page_size);
    let tail_cap = tail_capacity(page_size);

    let head = pm.alloc(page_type, 0)?;
    let head_offset = head.offset();

    let mut allocated = head_cap as u64;
    let mut written = payload.len().min(head_cap);
    {
        let mut data = head.data_mut();
        let header = parse_zerocopy_mut::<BlobHeader>(
            &mut data[PERSISTED_HEADER_SIZE..],
            "BlobHeader",
        )?;
        header.total_size = U64::new(payload.len() as u64);
        header.flags = U32::new(flags);
        header.raw_size = U32::new(raw_size);
        let start = PERSISTED_HEADER_SIZE + BLOB_HEADER_SIZE;
        data[start..start + written].copy_from_slice(&payload[..written]);
    }

    let mut prev = head;
    while written < payload.len() {
        let next = pm.alloc(page_type, 0)?;
        prev.set_next_offset(next.offset())?;

        let chunk = (payload.len() - written).min(tail_cap);
        {
            let mut data = next.data_mut();
            data[PERSISTED_HEADER_SIZE..PERSISTED_HEADER_SIZE + chunk]
                .copy_from_slice(&payload[written..written + chunk]);
        }
        written += chunk;
        allocated += tail_cap as u64;
        prev = next;
    }

    let head = pm.fetch(head_offset)?;
    let mut data = head.data_mut();
    let header =
        parse_zerocopy_mut::<BlobHeader>(&mut data[PERSISTED_HEADER_SIZE..], "BlobHeader")?;
    header.allocated_size = U64::new(allocated);

    Ok(head_offset)
}

/// Reads the whole payload of the chain starting at `offset`.
pub fn blob_read(pm: &mut PageManager, offset: u64) -> Result<Vec<u8>> {
    let page_size = pm.page_size();
    let head = pm.fetch(offset)?;
    ensure!(
        matches!(head.page_type(), PageType::Blob | PageType::DupTable),
        "page at offset {} is not blob storage",
        offset
    );

    let total = {
        let data = head.data();
        parse_zerocopy::<BlobHeader>(&data[PERSISTED_HEADER_SIZE..], "BlobHeader")?
            .total_size
            .get() as usize
    };

    let mut out = Vec::with_capacity(total);
    let chunk = total.min(head_capacity(page_size));
    {
        let data = head.data();
        let start = PERSISTED_HEADER_SIZE + BLOB_HEADER_SIZE;
        out.extend_from_slice(&data[start..start + chunk]);
    }

    let mut next = head.next_offset();
    while out.len() < total {
        ensure!(next != 0, "blob chain at {} truncated: {} of {} bytes", offset, out.len(), total);
        let page = pm.fetch(next)?;
        let chunk = (total - out.len()).min(tail_capacity(page_size));
        {
            let data = page.data();
            out.extend_from_slice(&data[PERSISTED_HEADER_SIZE..PERSISTED_HEADER_SIZE + chunk]);
        }
        next = page.next_offset();
    }

    Ok(out)
}

/// Number of pages the chain starting at `offset` occupies.
pub fn blob_page_count(pm: &mut PageManager, offset: u64) -> Result<u64> {
    let mut count = 0;
    let mut current = offset;
    while current != 0 {
        count += 1;
        current = pm.fetch(current)?.next_offset();
    }
    Ok(count)
}

/// Frees every page of the chain starting at `offset`.
pub fn blob_free(pm: &mut PageManager, offset: u64) -> Result<()> {
    let mut current = offset;
    while current != 0 {
        let next = pm.fetch(current)?.next_offset();
        pm.free(current)?;
        current = next;
    }
    Ok(())
}

/// Replaces the chain's payload, reusing the allocation when it fits.
/// Returns the (possibly new) head offset.
pub fn blob_overwrite(
    pm: &mut PageManager,
    offset: u64,
    payload: &[u8],
    page_type: PageType,
    flags: u32,
    raw_size: u32,
) -> Result<u64> {
    let info = blob_info(pm, offset)?;
    if (payload.len() as u64) > info.allocated_size {
        blob_free(pm, offset)?;
        return blob_alloc(pm, payload, page_type, flags, raw_size);
    }

    let page_size = pm.page_size();
    let head = pm.fetch(offset)?;
    let chunk = payload.len().min(head_capacity(page_size));
    {
        let mut data = head.data_mut();
        let header =
            parse_zerocopy_mut::<BlobHeader>(&mut data[PERSISTED_HEADER_SIZE..], "BlobHeader")?;
        header.total_size = U64::new(payload.len() as u64);
        header.flags = U32::new(flags);
        header.raw_size = U32::new(raw_size);
        let start = PERSISTED_HEADER_SIZE + BLOB_HEADER_SIZE;
        data[start..start + chunk].copy_from_slice(&payload[..chunk]);
    }

    let mut written = chunk;
    let mut next = head.next_offset();
    while written < payload.len() {
        ensure!(
            next != 0,
            "blob chain at {} shorter than its allocated size",
            offset
        );
        let page = pm.fetch(next)?;
        let chunk = (payload.len() - written).min(tail_capacity(page_size));
        {
            let mut data = page.data_mut();
            data[PERSISTED_HEADER_SIZE..PERSISTED_HEADER_SIZE + chunk]
                .copy_from_slice(&payload[written..written + chunk]);
        }
        written += chunk;
        next = page.next_offset();
    }

    Ok(offset)
}
