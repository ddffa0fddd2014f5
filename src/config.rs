//! # Configuration Constants
//!
//! This module centralizes all configuration constants for emberdb. Constants
//! that depend on each other are co-located and their relationships documented,
//! so a change in one place cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! page_size (per environment, DEFAULT_PAGE_SIZE when unset)
//!       │
//!       ├─> PERSISTED_HEADER_SIZE (12 bytes, fixed, start of every page)
//!       │
//!       ├─> node capacity (derived: (page_size - 12 - NODE_HEADER_SIZE)
//!       │                  / (SLOT_FIXED_SIZE + key_size))
//!       │     Must be at least MIN_NODE_CAPACITY or the B-tree cannot
//!       │     split/merge; create_db rejects such key sizes.
//!       │
//!       └─> blob payload per page (derived: page_size - 12 - BLOB_HEADER_SIZE
//!           on the first page of a chain, page_size - 12 afterwards)
//!
//! MAX_DATABASES_LIMIT
//!       │
//!       └─> The descriptor array (32 bytes per slot) must fit in the header
//!           page after ENV_HEADER_SIZE; Environment::create validates this
//!           against the configured page size.
//!
//! DEFAULT_JOURNAL_SWITCH_THRESHOLD
//!       │
//!       └─> Number of closed transactions in the current journal file after
//!           which the files are swapped and the idle file truncated.
//! ```
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{DEFAULT_PAGE_SIZE, MAX_KEY_SIZE};
//! ```

/// Default page size when `EnvOptions::page_size` is unset.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported page size. Below this a node cannot hold
/// `MIN_NODE_CAPACITY` slots even for tiny keys.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Number of cached pages when `EnvOptions::cache_capacity` is unset.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Smallest usable cache: header page plus one page per B-tree level of a
/// deep tree plus scratch for blob chains.
pub const MIN_CACHE_CAPACITY: usize = 16;

/// Default number of database descriptor slots in the environment header.
pub const DEFAULT_MAX_DATABASES: u16 = 16;

/// Hard ceiling for descriptor slots; the array must also fit the header
/// page, which is validated at create time.
pub const MAX_DATABASES_LIMIT: u16 = 512;

/// Default inline key capacity of a B-tree slot when `DbOptions::key_size`
/// is unset.
pub const DEFAULT_KEY_SIZE: u16 = 32;

/// Keys longer than this are rejected with `InvKeySize` even though they
/// would spill into an extended-key blob.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Records larger than this are rejected with `InvRecordSize`.
pub const MAX_RECORD_SIZE: usize = 1 << 30;

/// Records up to this many bytes are stored inline in the slot's record
/// pointer field instead of a blob chain.
pub const MAX_INLINE_RECORD_SIZE: usize = 8;

/// Duplicate-table entries carry this many payload bytes; larger records in
/// a duplicate table spill into their own blob chain.
pub const DUP_PAYLOAD_SIZE: usize = 16;

/// A node with fewer slots than this cannot participate in the
/// shift/merge protocol; `create_db` rejects key sizes that would produce
/// such nodes.
pub const MIN_NODE_CAPACITY: usize = 4;

/// Closed transactions in the current journal file before the writer swaps
/// to the other file.
pub const DEFAULT_JOURNAL_SWITCH_THRESHOLD: usize = 32;

/// Initial growth of duplicate tables; capacity doubles from here.
pub const DUP_TABLE_INITIAL_CAPACITY: u32 = 4;

const _: () = assert!(MIN_PAGE_SIZE >= 512);
const _: () = assert!(MIN_CACHE_CAPACITY >= 2, "header page plus one work page");
const _: () = assert!(MAX_INLINE_RECORD_SIZE == 8, "inline records live in the 8-byte record_ptr");
