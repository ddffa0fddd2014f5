//! # emberdb - Embedded Transactional Key/Value Store
//!
//! emberdb is an embedded, single-process storage engine: a transactional
//! B-tree index over paged storage, with a write-ahead journal providing
//! crash recovery. One environment is one file; an environment holds up to
//! a configurable number of named databases with variable-length keys and
//! records, optional duplicate keys, and overlapping long-lived
//! transactions whose effects become visible on commit.
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberdb::{Cursor, DbOptions, EnvOptions, Environment};
//! use emberdb::flags::ENV_ENABLE_TRANSACTIONS;
//!
//! let env = Environment::create(
//!     "data.edb".as_ref(),
//!     EnvOptions { flags: ENV_ENABLE_TRANSACTIONS, ..Default::default() },
//! )?;
//! let db = env.create_db(1, DbOptions::default())?;
//!
//! let txn = env.begin()?;
//! db.insert(Some(&txn), b"alpha", b"1", 0)?;
//! txn.commit()?;
//!
//! assert_eq!(db.find(None, b"alpha")?, b"1");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Public API (Environment/Database/Txn)   │
//! ├──────────────────────────────────────────┤
//! │  Cursor (merged B-tree + overlay view)   │
//! ├───────────────────┬──────────────────────┤
//! │ Transaction Table │  Transaction Overlay │
//! ├───────────────────┴──────────────────────┤
//! │  B-tree Index (blobs, duplicate tables)  │
//! ├──────────────────────────────────────────┤
//! │  Page Manager / Cache / Freelist         │     Journal (WAL)
//! ├──────────────────────────────────────────┤   ┌────────────────┐
//! │  Device (file or memory)                 │   │ .jrn0 / .jrn1  │
//! └──────────────────────────────────────────┘   └────────────────┘
//! ```
//!
//! Every mutation allocates an LSN, is appended (and synced) to the
//! journal, and only then lands in the overlay or the B-tree; recovery
//! replays committed journal entries above the last flush watermark.
//!
//! ## File Layout
//!
//! ```text
//! app_data/
//! ├── data.edb        # header page, descriptors, freelist, B-tree pages
//! ├── data.edb.jrn0   # journal file 0
//! └── data.edb.jrn1   # journal file 1
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, page cache, freelist, on-disk headers
//! - [`btree`]: ordered index with split/merge, duplicates, extended keys
//! - [`txn`]: transaction table and the per-database operation overlay
//! - [`cursor`]: unified iteration over B-tree plus overlay
//! - [`journal`]: two-file rotating write-ahead log and recovery
//! - [`env`]: the environment owning all of the above
//! - [`compress`]: record compression plug-in interface
//! - [`flags`]: public flag bitfields
//! - [`config`]: engine constants

pub mod btree;
pub mod compress;
pub mod config;
pub mod cursor;
pub mod device;
pub mod env;
pub mod error;
pub mod flags;
pub mod journal;
pub mod storage;
pub mod txn;

pub use compress::{Compressor, RleCompressor};
pub use cursor::Cursor;
pub use env::{Database, DbOptions, EnvOptions, Environment, Txn};
pub use error::ErrorKind;
