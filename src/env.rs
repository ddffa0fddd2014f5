//! # Environment and Database API
//!
//! An [`Environment`] is one storage file (plus its two journal files) and
//! owns every subsystem: the page manager, the journal, the transaction
//! table and the per-database overlays. There is no process-global state;
//! independent environments are fully isolated.
//!
//! ## Handles
//!
//! [`Database`], [`Txn`] and [`crate::cursor::Cursor`] are thin handles
//! sharing the environment core through an `Arc`; the core itself sits
//! behind a single `parking_lot::Mutex`, which realizes the engine's
//! single-threaded cooperative model: every public operation runs to
//! completion without suspension while holding the core.
//!
//! ## Write Path
//!
//! ```text
//! db.insert ──> validate ──> conflict/visibility check
//!     ──> allocate LSN ──> journal append (synced)
//!     ──> overlay append ──> [auto-commit: flush into B-tree]
//! ```
//!
//! The journal append always precedes the in-memory mutation (write-ahead)
//! and a failure before the overlay append leaves the transaction usable.
//! Commit applies the transaction's operations to the B-tree in LSN order
//! and removes them from the overlay; abort removes them unapplied.
//! Environments without transaction support apply mutations directly.
//!
//! ## Durability and Recovery
//!
//! The environment header tracks `last_flushed_lsn`: everything up to it
//! is in the main file. Recovery replays committed journal entries above
//! that watermark, truncates the journal, and continues the LSN and
//! transaction id sequences. Opening a dirty file without `AUTO_RECOVERY`
//! fails with `NeedRecovery`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use zerocopy::IntoBytes;

use crate::btree::{BtreeIndex, EraseMode, KeyType};
use crate::compress::Compressor;
use crate::config::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_JOURNAL_SWITCH_THRESHOLD, DEFAULT_KEY_SIZE,
    DEFAULT_MAX_DATABASES, DEFAULT_PAGE_SIZE, MAX_DATABASES_LIMIT, MAX_PAGE_SIZE, MIN_CACHE_CAPACITY,
    MIN_PAGE_SIZE,
};
use crate::device::{Device, FileDevice, MemoryDevice};
use crate::error::ErrorKind;
use crate::flags::{
    DB_ENABLE_DUPLICATES, DONT_CLEAR_LOG, DUPLICATE, DUPLICATE_INSERT_AFTER,
    DUPLICATE_INSERT_BEFORE, ENV_AUTO_RECOVERY, ENV_ENABLE_RECOVERY, ENV_ENABLE_TRANSACTIONS,
    ENV_IN_MEMORY, ERASE_ALL_DUPLICATES, OVERWRITE, PARTIAL, TXN_AUTO_COMMIT,
};
use crate::journal::{EntryType, Journal, JournalIterator, JournalPayload};
use crate::storage::{
    descriptor_range, parse_zerocopy, parse_zerocopy_mut, DbDescriptor, EnvHeader, PageManager,
    PageType, DESCRIPTOR_ARRAY_OFFSET, DB_DESCRIPTOR_SIZE, ENV_HEADER_OFFSET, ENV_HEADER_SIZE,
    IGNORE_FREELIST,
};
use crate::txn::overlay::{KeyView, OpKind, Overlay, OverlayOp};
use crate::txn::{TxnId, TxnOpRef, TxnState, TxnTable};

/// Options for [`Environment::create`] and [`Environment::open`].
#[derive(Clone)]
pub struct EnvOptions {
    pub flags: u32,
    pub page_size: usize,
    pub cache_capacity: usize,
    pub max_databases: u16,
    pub journal_switch_threshold: usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            flags: 0,
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_databases: DEFAULT_MAX_DATABASES,
            journal_switch_threshold: DEFAULT_JOURNAL_SWITCH_THRESHOLD,
        }
    }
}

/// Options for [`Environment::create_db`].
#[derive(Clone, Default)]
pub struct DbOptions {
    pub flags: u32,
    pub key_size: u16,
    pub key_type: KeyType,
    pub record_compressor: Option<Arc<dyn Compressor>>,
}

pub(crate) struct DbState {
    pub(crate) flags: u32,
    pub(crate) tree: BtreeIndex,
    pub(crate) overlay: Overlay,
}

pub(crate) struct Core {
    pub(crate) pm: PageManager,
    pub(crate) journal: Option<Journal>,
    pub(crate) txns: TxnTable,
    pub(crate) dbs: HashMap<u16, DbState>,
    pub(crate) next_lsn: u64,
    pub(crate) env_flags: u32,
    pub(crate) path: Option<PathBuf>,
    pub(crate) closed: bool,
}

impl Core {
    /// Whether writes go through the overlay/journal machinery.
    pub(crate) fn transactional(&self) -> bool {
        self.env_flags & ENV_ENABLE_TRANSACTIONS != 0 || self.journal.is_some()
    }

    pub(crate) fn alloc_lsn(&mut self) -> Result<u64> {
        ensure!(self.next_lsn < u64::MAX, ErrorKind::LimitsReached);
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        Ok(lsn)
    }

    fn write_env_header<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut EnvHeader),
    {
        let page = self.pm.fetch(0)?;
        let mut data = page.data_mut();
        let header = parse_zerocopy_mut::<EnvHeader>(
            &mut data[ENV_HEADER_OFFSET..ENV_HEADER_OFFSET + ENV_HEADER_SIZE],
            "EnvHeader",
        )?;
        update(header);
        Ok(())
    }

    fn read_env_header<T>(&mut self, read: impl FnOnce(&EnvHeader) -> T) -> Result<T> {
        let page = self.pm.fetch(0)?;
        let data = page.data();
        let header = parse_zerocopy::<EnvHeader>(
            &data[ENV_HEADER_OFFSET..ENV_HEADER_OFFSET + ENV_HEADER_SIZE],
            "EnvHeader",
        )?;
        Ok(read(header))
    }

    fn max_databases(&mut self) -> Result<u16> {
        self.read_env_header(|h| h.max_databases())
    }

    fn read_descriptor(&mut self, slot: u16) -> Result<DbDescriptor> {
        let page = self.pm.fetch(0)?;
        let data = page.data();
        let desc = parse_zerocopy::<DbDescriptor>(&data[descriptor_range(slot)], "DbDescriptor")?;
        Ok(*desc)
    }

    fn write_descriptor(&mut self, slot: u16, desc: &DbDescriptor) -> Result<()> {
        let page = self.pm.fetch(0)?;
        let mut data = page.data_mut();
        data[descriptor_range(slot)].copy_from_slice(desc.as_bytes());
        Ok(())
    }

    fn find_descriptor(&mut self, name: u16) -> Result<Option<(u16, DbDescriptor)>> {
        let max = self.max_databases()?;
        for slot in 0..max {
            let desc = self.read_descriptor(slot)?;
            if !desc.is_free() && desc.name() == name {
                return Ok(Some((slot, desc)));
            }
        }
        Ok(None)
    }

    /// Persists a database's possibly-moved root into its descriptor.
    fn sync_db_root(&mut self, name: u16) -> Result<()> {
        let root = match self.dbs.get(&name) {
            Some(db) => db.tree.root(),
            None => return Ok(()),
        };
        if let Some((slot, mut desc)) = self.find_descriptor(name)? {
            if desc.root_page() != root {
                desc.set_root_page(root);
                self.write_descriptor(slot, &desc)?;
            }
        }
        Ok(())
    }

    fn open_db_state(&mut self, name: u16) -> Result<()> {
        if self.dbs.contains_key(&name) {
            return Ok(());
        }
        let (_, desc) = self.find_descriptor(name)?.ok_or_else(|| {
            eyre::Report::from(ErrorKind::KeyNotFound)
                .wrap_err(format!("database {} not found in this environment", name))
        })?;

        let key_type = KeyType::from_u16(desc.key_type());
        let tree = BtreeIndex::open(
            desc.root_page(),
            desc.key_size(),
            key_type,
            desc.flags() & DB_ENABLE_DUPLICATES != 0,
        );
        self.dbs.insert(
            name,
            DbState {
                flags: desc.flags(),
                tree,
                overlay: Overlay::new(key_type),
            },
        );
        Ok(())
    }

    // -- transactions -------------------------------------------------------

    pub(crate) fn begin_txn(&mut self, flags: u32) -> Result<TxnId> {
        let lsn = self.alloc_lsn()?;
        let id = self.txns.next_txn_id();
        let file = match &mut self.journal {
            Some(journal) => journal.append_txn_begin(id, 0, lsn)?,
            None => 0,
        };
        let started = self.txns.begin(flags, lsn, file);
        debug_assert_eq!(started, id);
        Ok(id)
    }

    pub(crate) fn commit_txn(&mut self, id: TxnId) -> Result<()> {
        ensure!(self.txns.is_active(id), ErrorKind::InvParameter);
        let lsn = self.alloc_lsn()?;
        if let Some(journal) = &mut self.journal {
            let file = self.txns.get(id).map(|t| t.journal_file).unwrap_or(0);
            journal.append_txn_commit(id, file, lsn)?;
        }

        let ops = self.txns.finish(id, TxnState::Committed)?;
        let mut touched: Vec<u16> = Vec::new();
        for op_ref in ops {
            self.apply_committed_op(&op_ref)?;
            if !touched.contains(&op_ref.dbname) {
                touched.push(op_ref.dbname);
            }
        }
        for name in touched {
            self.sync_db_root(name)?;
        }
        self.txns.prune(id);
        Ok(())
    }

    fn apply_committed_op(&mut self, op_ref: &TxnOpRef) -> Result<()> {
        let Core {
            ref mut pm,
            ref mut dbs,
            ..
        } = *self;
        let db = dbs
            .get_mut(&op_ref.dbname)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        let Some(op) = db.overlay.remove_op(&op_ref.key, op_ref.lsn) else {
            return Ok(());
        };

        match op.kind {
            OpKind::Insert => db.tree.insert(pm, &op_ref.key, op.record.as_deref().unwrap_or(&[]), 0, None),
            OpKind::InsertOverwrite => {
                db.tree
                    .insert(pm, &op_ref.key, op.record.as_deref().unwrap_or(&[]), OVERWRITE, None)
            }
            OpKind::InsertDup => {
                let pos = if op.flags & (DUPLICATE_INSERT_BEFORE | DUPLICATE_INSERT_AFTER) != 0 {
                    Some(op.dup_index)
                } else {
                    None
                };
                db.tree
                    .insert(pm, &op_ref.key, op.record.as_deref().unwrap_or(&[]), DUPLICATE, pos)
            }
            OpKind::Erase => {
                let mode = if op.flags & ERASE_ALL_DUPLICATES != 0 {
                    EraseMode::All
                } else {
                    EraseMode::Duplicate(op.dup_index)
                };
                db.tree.erase(pm, &op_ref.key, mode)
            }
        }
    }

    pub(crate) fn abort_txn(&mut self, id: TxnId) -> Result<()> {
        ensure!(self.txns.is_active(id), ErrorKind::InvParameter);
        let lsn = self.alloc_lsn()?;
        if let Some(journal) = &mut self.journal {
            let file = self.txns.get(id).map(|t| t.journal_file).unwrap_or(0);
            journal.append_txn_abort(id, file, lsn)?;
        }

        let ops = self.txns.finish(id, TxnState::Aborted)?;
        for op_ref in ops {
            if let Some(db) = self.dbs.get_mut(&op_ref.dbname) {
                db.overlay.remove_txn_ops(&op_ref.key, id);
            }
        }
        self.txns.prune(id);
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    /// Visible record of `key` for `reader`; `KeyErasedInTxn` when a
    /// visible operation erased it, `KeyNotFound` when it is nowhere.
    ///
    /// Duplicates merge as: B-tree duplicates first (the overlay record,
    /// when set, shadows position 0), then overlay-appended duplicates.
    pub(crate) fn lookup(
        &mut self,
        name: u16,
        reader: Option<TxnId>,
        key: &[u8],
        dup_index: u32,
    ) -> Result<Vec<u8>> {
        let Core {
            ref mut pm,
            ref mut dbs,
            ref txns,
            ..
        } = *self;
        let db = dbs
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;

        let view = db
            .overlay
            .visible_state(key, reader, &|id| txns.state(id));
        if view.erased {
            return Err(ErrorKind::KeyErasedInTxn.into());
        }

        if dup_index == 0 {
            if let Some(record) = &view.record {
                return Ok(record.clone());
            }
        }

        let base = match db.tree.find(pm, key) {
            Ok(position) => Some(position),
            Err(err) if ErrorKind::of(&err) == Some(ErrorKind::KeyNotFound) => None,
            Err(err) => return Err(err),
        };

        match base {
            Some((leaf, slot)) => {
                let base_count = db.tree.dup_count_at(pm, leaf, slot)?;
                if dup_index < base_count {
                    db.tree.record_at(pm, leaf, slot, dup_index)
                } else {
                    view.dups
                        .get((dup_index - base_count) as usize)
                        .cloned()
                        .ok_or_else(|| ErrorKind::KeyNotFound.into())
                }
            }
            None => {
                let base_count = u32::from(view.record.is_some());
                view.dups
                    .get(dup_index.saturating_sub(base_count) as usize)
                    .cloned()
                    .ok_or_else(|| ErrorKind::KeyNotFound.into())
            }
        }
    }

    pub(crate) fn visible_view(
        &mut self,
        name: u16,
        reader: Option<TxnId>,
        key: &[u8],
    ) -> Result<KeyView> {
        let Core {
            ref mut dbs,
            ref txns,
            ..
        } = *self;
        let db = dbs
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        Ok(db.overlay.visible_state(key, reader, &|id| txns.state(id)))
    }

    /// Whether `key` currently reads as present for `reader`.
    pub(crate) fn key_exists(
        &mut self,
        name: u16,
        reader: Option<TxnId>,
        key: &[u8],
    ) -> Result<bool> {
        match self.lookup(name, reader, key, 0) {
            Ok(_) => Ok(true),
            Err(err) => match ErrorKind::of(&err) {
                Some(ErrorKind::KeyNotFound) | Some(ErrorKind::KeyErasedInTxn) => Ok(false),
                _ => Err(err),
            },
        }
    }

    pub(crate) fn dup_count(
        &mut self,
        name: u16,
        reader: Option<TxnId>,
        key: &[u8],
    ) -> Result<u32> {
        let view = self.visible_view(name, reader, key)?;
        if view.erased {
            return Err(ErrorKind::KeyErasedInTxn.into());
        }

        let Core {
            ref mut pm,
            ref mut dbs,
            ..
        } = *self;
        let db = dbs
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;

        // The overlay record shadows base position 0, so it never changes
        // the count; appended duplicates do.
        let base = match db.tree.find(pm, key) {
            Ok((leaf, slot)) => db.tree.dup_count_at(pm, leaf, slot)?,
            Err(err) if ErrorKind::of(&err) == Some(ErrorKind::KeyNotFound) => {
                u32::from(view.record.is_some())
            }
            Err(err) => return Err(err),
        };

        let total = base + view.dups.len() as u32;
        ensure!(total > 0, ErrorKind::KeyNotFound);
        Ok(total)
    }

    // -- writes -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert(
        &mut self,
        name: u16,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dup_pos: Option<u32>,
        partial_offset: u32,
    ) -> Result<()> {
        ensure!(
            !(flags & OVERWRITE != 0
                && flags & (DUPLICATE | DUPLICATE_INSERT_BEFORE | DUPLICATE_INSERT_AFTER) != 0),
            ErrorKind::InvParameter
        );
        if flags & DUPLICATE != 0 {
            let db = self
                .dbs
                .get(&name)
                .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
            ensure!(db.flags & DB_ENABLE_DUPLICATES != 0, ErrorKind::InvParameter);
        }

        if !self.transactional() {
            let resolved = self.resolve_partial(name, None, key, record, flags, partial_offset)?;
            let Core {
                ref mut pm,
                ref mut dbs,
                ..
            } = *self;
            let db = dbs
                .get_mut(&name)
                .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
            db.tree.insert(pm, key, &resolved, flags & !PARTIAL, dup_pos)?;
            return self.sync_db_root(name);
        }

        let (txn_id, implicit) = self.resolve_txn(txn)?;
        let result = self.insert_in_txn(name, txn_id, key, record, flags, dup_pos, partial_offset);
        self.finish_implicit(txn_id, implicit, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_in_txn(
        &mut self,
        name: u16,
        txn_id: TxnId,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dup_pos: Option<u32>,
        partial_offset: u32,
    ) -> Result<()> {
        self.check_conflict(name, txn_id, key)?;

        // A bare insert of a visible key is a duplicate; erased keys may be
        // re-inserted.
        if flags & (OVERWRITE | DUPLICATE) == 0 && self.key_exists(name, Some(txn_id), key)? {
            return Err(ErrorKind::DuplicateKey.into());
        }

        let resolved =
            self.resolve_partial(name, Some(txn_id), key, record, flags, partial_offset)?;

        let lsn = self.alloc_lsn()?;
        if let Some(journal) = &mut self.journal {
            let file = self.txns.get(txn_id).map(|t| t.journal_file).unwrap_or(0);
            journal.append_insert(
                name,
                txn_id,
                file,
                key,
                &resolved,
                flags,
                dup_pos.unwrap_or(0),
                partial_offset,
                if flags & PARTIAL != 0 { record.len() as u32 } else { 0 },
                lsn,
            )?;
        }

        let kind = if flags & DUPLICATE != 0 {
            OpKind::InsertDup
        } else if flags & OVERWRITE != 0 {
            OpKind::InsertOverwrite
        } else {
            OpKind::Insert
        };
        let db = self
            .dbs
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        db.overlay.append(
            key,
            OverlayOp {
                lsn,
                txn_id,
                kind,
                record: Some(resolved),
                flags,
                dup_index: dup_pos.unwrap_or(0),
            },
        );
        self.txns.record_op(
            txn_id,
            TxnOpRef {
                dbname: name,
                key: key.to_vec(),
                lsn,
            },
        )
    }

    pub(crate) fn erase(
        &mut self,
        name: u16,
        txn: Option<TxnId>,
        key: &[u8],
        mode: EraseMode,
    ) -> Result<()> {
        if !self.transactional() {
            let Core {
                ref mut pm,
                ref mut dbs,
                ..
            } = *self;
            let db = dbs
                .get_mut(&name)
                .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
            db.tree.erase(pm, key, mode)?;
            return self.sync_db_root(name);
        }

        let (txn_id, implicit) = self.resolve_txn(txn)?;
        let result = self.erase_in_txn(name, txn_id, key, mode);
        self.finish_implicit(txn_id, implicit, result)
    }

    fn erase_in_txn(
        &mut self,
        name: u16,
        txn_id: TxnId,
        key: &[u8],
        mode: EraseMode,
    ) -> Result<()> {
        self.check_conflict(name, txn_id, key)?;
        if !self.key_exists(name, Some(txn_id), key)? {
            return Err(ErrorKind::KeyNotFound.into());
        }

        let (flags, dup_index) = match mode {
            EraseMode::All => (ERASE_ALL_DUPLICATES, 0),
            EraseMode::Duplicate(i) => (0, i),
        };

        let lsn = self.alloc_lsn()?;
        if let Some(journal) = &mut self.journal {
            let file = self.txns.get(txn_id).map(|t| t.journal_file).unwrap_or(0);
            journal.append_erase(name, txn_id, file, key, flags, dup_index, lsn)?;
        }

        let db = self
            .dbs
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        db.overlay.append(
            key,
            OverlayOp {
                lsn,
                txn_id,
                kind: OpKind::Erase,
                record: None,
                flags,
                dup_index,
            },
        );
        self.txns.record_op(
            txn_id,
            TxnOpRef {
                dbname: name,
                key: key.to_vec(),
                lsn,
            },
        )
    }

    fn check_conflict(&mut self, name: u16, writer: TxnId, key: &[u8]) -> Result<()> {
        let Core {
            ref dbs, ref txns, ..
        } = *self;
        let db = dbs
            .get(&name)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        ensure!(
            !db.overlay.conflicts_with(key, writer, &|id| txns.state(id)),
            ErrorKind::TxnConflict
        );
        Ok(())
    }

    /// Resolves a `PARTIAL` write into the full record image: the partial
    /// bytes spliced into the currently visible record (zero-padded when
    /// the key is new or shorter).
    fn resolve_partial(
        &mut self,
        name: u16,
        reader: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        partial_offset: u32,
    ) -> Result<Vec<u8>> {
        if flags & PARTIAL == 0 {
            return Ok(record.to_vec());
        }

        let offset = partial_offset as usize;
        let mut base = match self.lookup(name, reader, key, 0) {
            Ok(existing) => existing,
            Err(err) => match ErrorKind::of(&err) {
                Some(ErrorKind::KeyNotFound) | Some(ErrorKind::KeyErasedInTxn) => Vec::new(),
                _ => return Err(err),
            },
        };
        if base.len() < offset + record.len() {
            base.resize(offset + record.len(), 0);
        }
        base[offset..offset + record.len()].copy_from_slice(record);
        Ok(base)
    }

    fn resolve_txn(&mut self, txn: Option<TxnId>) -> Result<(TxnId, bool)> {
        match txn {
            Some(id) => {
                ensure!(self.txns.is_active(id), ErrorKind::InvParameter);
                Ok((id, false))
            }
            None => Ok((self.begin_txn(TXN_AUTO_COMMIT)?, true)),
        }
    }

    fn finish_implicit(&mut self, txn_id: TxnId, implicit: bool, result: Result<()>) -> Result<()> {
        if !implicit {
            return result;
        }
        match result {
            Ok(()) => self.commit_txn(txn_id),
            Err(err) => {
                // Abort must not mask the original failure.
                let _ = self.abort_txn(txn_id);
                Err(err)
            }
        }
    }

    // -- counting -----------------------------------------------------------

    pub(crate) fn key_count(&mut self, name: u16, reader: Option<TxnId>) -> Result<u64> {
        let base = {
            let Core {
                ref mut pm,
                ref mut dbs,
                ..
            } = *self;
            let db = dbs
                .get_mut(&name)
                .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
            db.tree.key_count_total(pm, false)?
        };

        // Adjust for visible overlay state key by key.
        let overlay_keys: Vec<Vec<u8>> = {
            let db = self.dbs.get(&name).expect("database state checked above");
            let mut keys = Vec::new();
            let mut cursor: Option<Vec<u8>> = None;
            while let Some(next) = db.overlay.next_key(cursor.as_deref()) {
                keys.push(next.bytes.clone());
                cursor = Some(next.bytes.clone());
            }
            keys
        };

        let mut total = base as i64;
        for key in overlay_keys {
            let view = self.visible_view(name, reader, &key)?;
            if !view.any_visible {
                continue;
            }

            let in_base = {
                let Core {
                    ref mut pm,
                    ref mut dbs,
                    ..
                } = *self;
                let db = dbs.get_mut(&name).expect("database state checked above");
                match db.tree.find(pm, &key) {
                    Ok((leaf, slot)) => Some(db.tree.dup_count_at(pm, leaf, slot)? as i64),
                    Err(err) if ErrorKind::of(&err) == Some(ErrorKind::KeyNotFound) => None,
                    Err(err) => return Err(err),
                }
            };

            if view.erased {
                total -= in_base.unwrap_or(0);
            } else {
                let overlay_records =
                    i64::from(view.record.is_some() && in_base.is_none()) + view.dups.len() as i64;
                total += overlay_records;
            }
        }
        Ok(total.max(0) as u64)
    }

    // -- flush / close ------------------------------------------------------

    pub(crate) fn flush(&mut self) -> Result<()> {
        let last_lsn = self.next_lsn - 1;
        // Data pages first, the watermark after: a crash in between leaves
        // a low watermark and replays entries onto already-applied state,
        // which recovery tolerates; the reverse order would lose data.
        self.pm.flush_all()?;
        self.write_env_header(|h| h.set_last_flushed_lsn(last_lsn))?;
        self.pm.flush_all()?;

        if let Some(journal) = &mut self.journal {
            if self.txns.active_count() == 0 {
                // Everything durable in the main file: trim the log.
                journal.clear(last_lsn)?;
            } else {
                journal.append_checkpoint(last_lsn)?;
            }
        }
        Ok(())
    }

    pub(crate) fn close(&mut self, flags: u32) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if flags & DONT_CLEAR_LOG != 0 {
            // Crash simulation: nothing is flushed, the journal stays, the
            // dirty mark stays set.
            return Ok(());
        }

        let last_lsn = self.next_lsn - 1;
        self.pm.flush_all()?;
        self.write_env_header(|h| {
            h.set_last_flushed_lsn(last_lsn);
            h.set_dirty_shutdown(false);
        })?;
        self.pm.flush_all()?;
        if let Some(journal) = &mut self.journal {
            journal.close(true, last_lsn)?;
        }
        Ok(())
    }
}

pub(crate) struct EnvInner {
    pub(crate) core: Mutex<Core>,
}

pub struct Environment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Creates a new environment file (truncating an existing one) plus
    /// its journal files when transactions or recovery are enabled.
    pub fn create(path: &Path, options: EnvOptions) -> Result<Self> {
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&options.page_size)
                && options.page_size.is_power_of_two(),
            ErrorKind::InvPageSize
        );
        ensure!(
            options.max_databases > 0
                && options.max_databases <= MAX_DATABASES_LIMIT
                && DESCRIPTOR_ARRAY_OFFSET
                    + options.max_databases as usize * DB_DESCRIPTOR_SIZE
                    <= options.page_size,
            ErrorKind::InvParameter
        );

        let in_memory = options.flags & ENV_IN_MEMORY != 0;
        let device: Box<dyn Device> = if in_memory {
            Box::new(MemoryDevice::new())
        } else {
            Box::new(FileDevice::create(path)?)
        };

        let cache = options.cache_capacity.max(MIN_CACHE_CAPACITY);
        let mut pm = PageManager::new(device, options.page_size, cache)?;

        let wants_journal = !in_memory
            && options.flags & (ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY | ENV_AUTO_RECOVERY)
                != 0;

        // Format the header page.
        let header_page = pm.alloc(PageType::Header, IGNORE_FREELIST)?;
        {
            let mut data = header_page.data_mut();
            let mut header = EnvHeader::new(options.page_size as u32, options.max_databases);
            header.set_dirty_shutdown(wants_journal);
            data[ENV_HEADER_OFFSET..ENV_HEADER_OFFSET + ENV_HEADER_SIZE]
                .copy_from_slice(header.as_bytes());
        }
        drop(header_page);

        let journal = if wants_journal {
            match Journal::create(path, options.journal_switch_threshold) {
                Ok(journal) => Some(journal),
                Err(err) => {
                    // A half-created environment is useless: remove it.
                    let _ = std::fs::remove_file(path);
                    return Err(err).wrap_err("failed to create the environment journal");
                }
            }
        } else {
            None
        };

        let mut core = Core {
            pm,
            journal,
            txns: TxnTable::new(),
            dbs: HashMap::new(),
            next_lsn: 1,
            env_flags: options.flags,
            path: (!in_memory).then(|| path.to_path_buf()),
            closed: false,
        };
        if !in_memory {
            core.pm.flush_all()?;
        }

        Ok(Self {
            inner: Arc::new(EnvInner {
                core: Mutex::new(core),
            }),
        })
    }

    /// Opens an existing environment, running journal recovery when the
    /// file reports a dirty shutdown and `ENV_AUTO_RECOVERY` is set.
    pub fn open(path: &Path, options: EnvOptions) -> Result<Self> {
        let mut flags = options.flags;
        if flags & ENV_AUTO_RECOVERY != 0 {
            flags |= ENV_ENABLE_RECOVERY;
        }
        ensure!(flags & ENV_IN_MEMORY == 0, ErrorKind::InvParameter);

        // The page size lives in the header; peek at it before building
        // the page manager.
        let device = FileDevice::open(path)?;
        let mut raw = [0u8; ENV_HEADER_SIZE];
        device
            .read_at(ENV_HEADER_OFFSET as u64, &mut raw)
            .wrap_err("failed to read the environment header")?;
        let header = parse_zerocopy::<EnvHeader>(&raw, "EnvHeader")?;
        header.validate()?;
        let page_size = header.page_size() as usize;
        let dirty = header.dirty_shutdown();
        let freelist_head = header.freelist_head();
        let last_flushed = header.last_flushed_lsn();

        let cache = options.cache_capacity.max(MIN_CACHE_CAPACITY);
        let mut pm = PageManager::new(Box::new(device), page_size, cache)?;
        pm.restore_freelist_head(freelist_head);

        let wants_journal =
            flags & (ENV_ENABLE_TRANSACTIONS | ENV_ENABLE_RECOVERY) != 0;

        let mut core = Core {
            pm,
            journal: None,
            txns: TxnTable::new(),
            dbs: HashMap::new(),
            next_lsn: 1,
            env_flags: flags,
            path: Some(path.to_path_buf()),
            closed: false,
        };

        if wants_journal {
            let mut journal = Journal::open(path, options.journal_switch_threshold)?;

            if dirty && !journal.is_empty() {
                ensure!(flags & ENV_AUTO_RECOVERY != 0, ErrorKind::NeedRecovery);
                recover(&mut core, &mut journal, last_flushed)?;
            } else {
                let max_lsn = journal.max_lsn()?;
                core.next_lsn = max_lsn + 1;
            }
            core.journal = Some(journal);
            core.write_env_header(|h| h.set_dirty_shutdown(true))?;
            core.pm.flush_all()?;
        } else {
            ensure!(!dirty, ErrorKind::NeedRecovery);
        }

        Ok(Self {
            inner: Arc::new(EnvInner {
                core: Mutex::new(core),
            }),
        })
    }

    /// Creates a named database. Names are nonzero 16-bit identifiers.
    pub fn create_db(&self, name: u16, options: DbOptions) -> Result<Database> {
        let mut core = self.lock()?;
        ensure!(name != 0, ErrorKind::InvParameter);
        ensure!(
            core.find_descriptor(name)?.is_none(),
            ErrorKind::InvParameter
        );

        let max = core.max_databases()?;
        let mut free_slot = None;
        for slot in 0..max {
            if core.read_descriptor(slot)?.is_free() {
                free_slot = Some(slot);
                break;
            }
        }
        let slot = free_slot.ok_or_else(|| {
            eyre::Report::from(ErrorKind::LimitsReached)
                .wrap_err("all database descriptor slots are in use")
        })?;

        let key_size = if options.key_size == 0 {
            DEFAULT_KEY_SIZE
        } else {
            options.key_size
        };
        let dup_enabled = options.flags & DB_ENABLE_DUPLICATES != 0;
        let mut tree = BtreeIndex::create(&mut core.pm, key_size, options.key_type, dup_enabled)?;
        tree.set_compressor(options.record_compressor.clone());

        let desc = DbDescriptor::new(
            name,
            options.flags,
            tree.root(),
            key_size,
            options.key_type as u16,
        );
        core.write_descriptor(slot, &desc)?;
        core.dbs.insert(
            name,
            DbState {
                flags: options.flags,
                tree,
                overlay: Overlay::new(options.key_type),
            },
        );

        // Database structure must survive a crash that happens before the
        // first flush.
        if core.path.is_some() {
            core.pm.flush_all()?;
        }

        Ok(Database {
            inner: Arc::clone(&self.inner),
            name,
        })
    }

    pub fn open_db(&self, name: u16) -> Result<Database> {
        let mut core = self.lock()?;
        core.open_db_state(name)?;
        Ok(Database {
            inner: Arc::clone(&self.inner),
            name,
        })
    }

    /// Removes a database and every page reachable from it.
    pub fn erase_db(&self, name: u16) -> Result<()> {
        let mut core = self.lock()?;
        core.open_db_state(name)?;
        let (slot, _) = core
            .find_descriptor(name)?
            .expect("descriptor exists after open_db_state");

        let db = core.dbs.get(&name).expect("state opened above");
        ensure!(db.overlay.is_empty(), ErrorKind::TxnStillOpen);

        // Erase keys through the tree so blobs and dup tables are freed,
        // then drop the remaining root.
        loop {
            let Core {
                ref mut pm,
                ref mut dbs,
                ..
            } = *core;
            let db = dbs.get_mut(&name).expect("state opened above");
            match db.tree.first(pm)? {
                Some((leaf, slot_idx)) => {
                    let key = db.tree.key_at(pm, leaf, slot_idx)?;
                    db.tree.erase(pm, &key, EraseMode::All)?;
                }
                None => break,
            }
        }
        let root = core.dbs.get(&name).expect("state opened above").tree.root();
        core.pm.free(root)?;
        core.dbs.remove(&name);

        let mut desc = core.read_descriptor(slot)?;
        desc.clear();
        core.write_descriptor(slot, &desc)?;
        Ok(())
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Result<Vec<u16>> {
        let mut core = self.lock()?;
        let max = core.max_databases()?;
        let mut names = Vec::new();
        for slot in 0..max {
            let desc = core.read_descriptor(slot)?;
            if !desc.is_free() {
                names.push(desc.name());
            }
        }
        Ok(names)
    }

    /// Starts an explicit transaction.
    pub fn begin(&self) -> Result<Txn> {
        let mut core = self.lock()?;
        ensure!(
            core.env_flags & ENV_ENABLE_TRANSACTIONS != 0,
            ErrorKind::InvParameter
        );
        let id = core.begin_txn(0)?;
        Ok(Txn {
            inner: Arc::clone(&self.inner),
            id,
            finished: AtomicBool::new(false),
        })
    }

    /// Flushes dirty pages and checkpoints the journal.
    pub fn flush(&self) -> Result<()> {
        self.lock()?.flush()
    }

    /// Closes the environment. `DONT_CLEAR_LOG` skips the flush and leaves
    /// the journal (and the dirty mark) behind, simulating a crash.
    pub fn close(self, flags: u32) -> Result<()> {
        self.lock()?.close(flags)
    }

    /// Moves the LSN sequence, for tests exercising LSN exhaustion.
    #[doc(hidden)]
    pub fn set_next_lsn(&self, next_lsn: u64) {
        if let Ok(mut core) = self.lock() {
            core.next_lsn = next_lsn;
        }
    }

    #[doc(hidden)]
    pub fn next_lsn(&self) -> u64 {
        self.inner.core.lock().next_lsn
    }

    #[doc(hidden)]
    pub fn next_txn_id(&self) -> u64 {
        self.inner.core.lock().txns.next_txn_id()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        let core = self.inner.core.lock();
        ensure!(!core.closed, ErrorKind::InvParameter);
        Ok(core)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        if !core.closed {
            let _ = core.close(0);
        }
    }
}

fn recover(core: &mut Core, journal: &mut Journal, last_flushed: u64) -> Result<()> {
    #[derive(PartialEq)]
    enum Terminal {
        Unterminated,
        Committed,
        Aborted,
    }

    // Pass 1: terminal state of every transaction, plus sequence maxima.
    let mut terminals: HashMap<u64, Terminal> = HashMap::new();
    let mut max_lsn = journal.max_lsn()?;
    let mut max_txn_id = 0u64;
    let mut it = JournalIterator::default();
    while let Some(entry) = journal.next_entry(&mut it)? {
        max_lsn = max_lsn.max(entry.lsn);
        max_txn_id = max_txn_id.max(entry.txn_id);
        match entry.entry_type {
            EntryType::TxnBegin => {
                terminals.entry(entry.txn_id).or_insert(Terminal::Unterminated);
            }
            EntryType::TxnCommit => {
                terminals.insert(entry.txn_id, Terminal::Committed);
            }
            EntryType::TxnAbort => {
                terminals.insert(entry.txn_id, Terminal::Aborted);
            }
            _ => {}
        }
    }

    // Pass 2: re-apply committed mutations above the flush watermark, in
    // LSN order.
    let mut it = JournalIterator::default();
    while let Some(entry) = journal.next_entry(&mut it)? {
        if entry.lsn <= last_flushed {
            continue;
        }
        if terminals.get(&entry.txn_id) != Some(&Terminal::Committed) {
            continue;
        }

        match entry.payload {
            JournalPayload::Insert {
                ref key,
                ref record,
                flags,
                dup_index,
                ..
            } => {
                core.open_db_state(entry.dbname)?;
                let Core {
                    ref mut pm,
                    ref mut dbs,
                    ..
                } = *core;
                let db = dbs.get_mut(&entry.dbname).expect("opened above");
                let dup_pos = (flags & (DUPLICATE_INSERT_BEFORE | DUPLICATE_INSERT_AFTER) != 0)
                    .then_some(dup_index);
                // The journal stores resolved records: PARTIAL is already
                // applied. An entry whose effect already reached the main
                // file (crash between data flush and watermark update)
                // replays as a duplicate; skip it.
                match db.tree.insert(pm, key, record, flags & !PARTIAL, dup_pos) {
                    Ok(()) => {}
                    Err(err) if ErrorKind::of(&err) == Some(ErrorKind::DuplicateKey) => {}
                    Err(err) => {
                        return Err(err).wrap_err_with(|| {
                            format!("failed to re-apply journal insert at lsn {}", entry.lsn)
                        })
                    }
                }
                core.sync_db_root(entry.dbname)?;
            }
            JournalPayload::Erase {
                ref key,
                flags,
                dup_index,
            } => {
                core.open_db_state(entry.dbname)?;
                let Core {
                    ref mut pm,
                    ref mut dbs,
                    ..
                } = *core;
                let db = dbs.get_mut(&entry.dbname).expect("opened above");
                let mode = if flags & ERASE_ALL_DUPLICATES != 0 {
                    EraseMode::All
                } else {
                    EraseMode::Duplicate(dup_index)
                };
                match db.tree.erase(pm, key, mode) {
                    Ok(()) => {}
                    Err(err) if ErrorKind::of(&err) == Some(ErrorKind::KeyNotFound) => {}
                    Err(err) => {
                        return Err(err).wrap_err_with(|| {
                            format!("failed to re-apply journal erase at lsn {}", entry.lsn)
                        })
                    }
                }
                core.sync_db_root(entry.dbname)?;
            }
            JournalPayload::None => {}
        }
    }

    // The rebuilt state is authoritative: flush it, trim the journal, and
    // continue the sequences above everything we saw.
    core.next_lsn = max_lsn + 1;
    core.txns.restore_next_txn_id(max_txn_id + 1);
    core.write_env_header(|h| h.set_last_flushed_lsn(max_lsn))?;
    core.pm.flush_all()?;
    journal.clear(max_lsn)?;
    Ok(())
}

/// A named key→record map inside an environment.
pub struct Database {
    pub(crate) inner: Arc<EnvInner>,
    pub(crate) name: u16,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn name(&self) -> u16 {
        self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        let core = self.inner.core.lock();
        ensure!(!core.closed, ErrorKind::InvParameter);
        Ok(core)
    }

    /// Inserts `key` → `record`. See the operation flags in
    /// [`crate::flags`].
    pub fn insert(&self, txn: Option<&Txn>, key: &[u8], record: &[u8], flags: u32) -> Result<()> {
        let mut core = self.lock()?;
        core.insert(self.name, txn.map(Txn::id), key, record, flags, None, 0)
    }

    /// Splices `partial` into the record at `partial_offset`, zero-filling
    /// any gap, and stores the result under `key`.
    pub fn insert_partial(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        partial: &[u8],
        partial_offset: u32,
    ) -> Result<()> {
        let mut core = self.lock()?;
        core.insert(
            self.name,
            txn.map(Txn::id),
            key,
            partial,
            OVERWRITE | PARTIAL,
            None,
            partial_offset,
        )
    }

    /// Returns the record stored under `key` (the first duplicate when the
    /// key has several).
    pub fn find(&self, txn: Option<&Txn>, key: &[u8]) -> Result<Vec<u8>> {
        let mut core = self.lock()?;
        core.lookup(self.name, txn.map(Txn::id), key, 0)
            .map_err(erased_reads_as_not_found)
    }

    /// Approximate lookup honoring `FIND_LT_MATCH`/`FIND_GT_MATCH`.
    /// Returns the matched key and its record.
    pub fn find_approx(
        &self,
        txn: Option<&Txn>,
        key: &[u8],
        flags: u32,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut cursor = crate::cursor::Cursor::create(self, txn);
        cursor.find(key, flags)?;
        Ok((cursor.get_key()?, cursor.get_record()?))
    }

    /// Removes `key` with all of its duplicates.
    pub fn erase(&self, txn: Option<&Txn>, key: &[u8]) -> Result<()> {
        let mut core = self.lock()?;
        core.erase(self.name, txn.map(Txn::id), key, EraseMode::All)
            .map_err(erased_reads_as_not_found)
    }

    /// Removes one duplicate of `key` by position.
    pub fn erase_duplicate(&self, txn: Option<&Txn>, key: &[u8], dup_index: u32) -> Result<()> {
        let mut core = self.lock()?;
        core.erase(
            self.name,
            txn.map(Txn::id),
            key,
            EraseMode::Duplicate(dup_index),
        )
        .map_err(erased_reads_as_not_found)
    }

    /// Number of records in the database (duplicates counted).
    pub fn get_key_count(&self, txn: Option<&Txn>) -> Result<u64> {
        let mut core = self.lock()?;
        core.key_count(self.name, txn.map(Txn::id))
    }

    /// Number of duplicates stored under `key`.
    pub fn get_duplicate_count(&self, txn: Option<&Txn>, key: &[u8]) -> Result<u32> {
        let mut core = self.lock()?;
        core.dup_count(self.name, txn.map(Txn::id), key)
            .map_err(erased_reads_as_not_found)
    }
}

/// `KeyErasedInTxn` is an internal distinction; the public API reports
/// erased keys as missing.
fn erased_reads_as_not_found(err: eyre::Report) -> eyre::Report {
    if ErrorKind::of(&err) == Some(ErrorKind::KeyErasedInTxn) {
        ErrorKind::KeyNotFound.into()
    } else {
        err
    }
}

/// An explicit transaction. Aborts on drop unless committed.
pub struct Txn {
    inner: Arc<EnvInner>,
    id: TxnId,
    finished: AtomicBool,
}

impl Txn {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit(self) -> Result<()> {
        let result = {
            let mut core = self.inner.core.lock();
            core.commit_txn(self.id)
        };
        // A failed commit (LSN exhaustion, journal I/O before any flush)
        // leaves the transaction active; the drop below aborts it.
        if result.is_ok() {
            self.finished.store(true, Ordering::Release);
        }
        result
    }

    pub fn abort(self) -> Result<()> {
        let result = {
            let mut core = self.inner.core.lock();
            core.abort_txn(self.id)
        };
        if result.is_ok() {
            self.finished.store(true, Ordering::Release);
        }
        result
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            let mut core = self.inner.core.lock();
            // A closed environment (including the crash-simulating close)
            // takes no further journal writes.
            if !core.closed && core.txns.is_active(self.id) {
                let _ = core.abort_txn(self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plain_env(dir: &tempfile::TempDir) -> Environment {
        Environment::create(
            &dir.path().join("env.edb"),
            EnvOptions {
                page_size: 1024,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_bad_page_sizes() {
        let dir = tempdir().unwrap();
        for page_size in [0usize, 100, 1000, 256 * 1024] {
            let err = Environment::create(
                &dir.path().join("bad.edb"),
                EnvOptions {
                    page_size,
                    ..Default::default()
                },
            )
            .unwrap_err();
            assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvPageSize));
        }
    }

    #[test]
    fn create_rejects_oversized_descriptor_arrays() {
        let dir = tempdir().unwrap();
        let err = Environment::create(
            &dir.path().join("bad.edb"),
            EnvOptions {
                page_size: 1024,
                max_databases: 400,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvParameter));
    }

    #[test]
    fn plain_environment_round_trips_without_journal() {
        let dir = tempdir().unwrap();
        {
            let env = plain_env(&dir);
            let db = env.create_db(1, DbOptions::default()).unwrap();
            db.insert(None, b"alpha", b"1", 0).unwrap();
            db.insert(None, b"beta", b"2", 0).unwrap();
            env.close(0).unwrap();
        }
        assert!(!dir.path().join("env.edb.jrn0").exists());

        let env = Environment::open(
            &dir.path().join("env.edb"),
            EnvOptions::default(),
        )
        .unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(None, b"alpha").unwrap(), b"1");
        assert_eq!(db.get_key_count(None).unwrap(), 2);
    }

    #[test]
    fn database_directory_management() {
        let dir = tempdir().unwrap();
        let env = plain_env(&dir);

        env.create_db(3, DbOptions::default()).unwrap();
        env.create_db(7, DbOptions::default()).unwrap();
        assert_eq!(env.database_names().unwrap(), vec![3, 7]);

        // Duplicate names and the reserved name 0 are rejected.
        let err = env.create_db(3, DbOptions::default()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvParameter));
        let err = env.create_db(0, DbOptions::default()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvParameter));

        env.erase_db(3).unwrap();
        assert_eq!(env.database_names().unwrap(), vec![7]);
        let err = env.open_db(3).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn erase_db_returns_its_pages() {
        let dir = tempdir().unwrap();
        let env = plain_env(&dir);
        let db = env.create_db(1, DbOptions::default()).unwrap();

        for i in 0..50u32 {
            db.insert(None, &i.to_le_bytes(), &[0xAB; 300], 0).unwrap();
        }
        drop(db);
        env.erase_db(1).unwrap();

        let mut core = env.lock().unwrap();
        let total = core.pm.total_pages();
        let free = core.pm.free_page_count().unwrap();
        assert_eq!(total, free + 1, "only the header page stays allocated");
    }

    #[test]
    fn partial_writes_splice_into_existing_records() {
        let dir = tempdir().unwrap();
        let env = plain_env(&dir);
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"p", b"AAAAAAAAAA", 0).unwrap();
        db.insert_partial(None, b"p", b"xx", 3).unwrap();
        assert_eq!(db.find(None, b"p").unwrap(), b"AAAxxAAAAA");

        // A partial write past the end zero-fills the gap.
        db.insert_partial(None, b"q", b"zz", 4).unwrap();
        assert_eq!(db.find(None, b"q").unwrap(), b"\0\0\0\0zz");
    }

    #[test]
    fn find_approx_positions_around_gaps() {
        let dir = tempdir().unwrap();
        let env = plain_env(&dir);
        let db = env.create_db(1, DbOptions::default()).unwrap();

        db.insert(None, b"10", b"a", 0).unwrap();
        db.insert(None, b"30", b"b", 0).unwrap();

        let (key, record) = db
            .find_approx(None, b"20", crate::flags::FIND_GT_MATCH)
            .unwrap();
        assert_eq!(key, b"30");
        assert_eq!(record, b"b");

        let (key, _) = db
            .find_approx(None, b"20", crate::flags::FIND_LT_MATCH)
            .unwrap();
        assert_eq!(key, b"10");
    }

    #[test]
    fn operations_on_a_closed_environment_fail() {
        let dir = tempdir().unwrap();
        let env = plain_env(&dir);
        let db = env.create_db(1, DbOptions::default()).unwrap();
        env.close(0).unwrap();

        let err = db.insert(None, b"k", b"v", 0).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvParameter));
    }

    #[test]
    fn serialized_trees_survive_reopen_after_splits() {
        let dir = tempdir().unwrap();
        {
            let env = plain_env(&dir);
            let db = env
                .create_db(
                    1,
                    DbOptions {
                        key_size: 80,
                        ..Default::default()
                    },
                )
                .unwrap();
            for i in 0..200u32 {
                let mut key = vec![0u8; 80];
                key[..4].copy_from_slice(&i.to_le_bytes());
                db.insert(None, &key, &key, 0).unwrap();
            }
            env.close(0).unwrap();
        }

        let env = Environment::open(&dir.path().join("env.edb"), EnvOptions::default()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.get_key_count(None).unwrap(), 200);
        let mut probe = vec![0u8; 80];
        probe[..4].copy_from_slice(&137u32.to_le_bytes());
        assert_eq!(db.find(None, &probe).unwrap(), probe);
    }
}
