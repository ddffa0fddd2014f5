//! # Storage Module
//!
//! The foundational storage layer of emberdb: pages, their on-disk headers,
//! the freelist, and the page manager that ties them to a [`crate::device`].
//!
//! ## Architecture Overview
//!
//! Everything above this module speaks in page offsets and `Arc<Page>`
//! handles; everything below it speaks in raw bytes. The page manager is the
//! only component that performs device I/O for data pages, and the only one
//! that creates `Page` objects, which is how the at-most-one-object-per-
//! offset invariant is enforced.
//!
//! ```text
//! B-tree / blobs / journal recovery
//!        │  fetch / alloc / free
//!        v
//!   PageManager ── freelist trunks ── env header mirror
//!        │  read_at / write_at / flush
//!        v
//!      Device (file or memory)
//! ```
//!
//! ## Page Size
//!
//! The page size is fixed per environment at creation time (512 B–64 KiB,
//! default 16 KiB) and recorded in the environment header; every derived
//! layout (node capacity, trunk capacity, blob payload) is computed from it
//! at runtime rather than baked in as a constant.
//!
//! ## Module Organization
//!
//! - `page`: the 12-byte persisted page header, page roles, cached pages
//! - `headers`: environment header and database descriptor array
//! - `freelist`: trunk-page free space tracking
//! - `page_manager`: allocation, fetch, eviction, dirty tracking

mod freelist;
mod headers;
mod page;
mod page_manager;

pub use freelist::{trunk_capacity, TrunkView, TrunkViewMut};
pub use headers::{
    descriptor_range, DbDescriptor, EnvHeader, DB_DESCRIPTOR_SIZE, DESCRIPTOR_ARRAY_OFFSET,
    ENV_HEADER_OFFSET, ENV_HEADER_SIZE, ENV_MAGIC, ENV_VERSION,
};
pub use page::{Page, PageType, PersistedHeader, PERSISTED_HEADER_SIZE};
pub use page_manager::{PageManager, IGNORE_FREELIST};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + Immutable + IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
