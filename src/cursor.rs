//! # Cursors
//!
//! A cursor is a movable position over the *merged* view of one database:
//! the B-tree below and the transaction overlay above it. Movement
//! operations walk both sequences under the database's compare function,
//! skip keys whose visible state is erased, and surface each key's
//! duplicates as one contiguous run (B-tree duplicates first, then
//! overlay-appended ones).
//!
//! ## States
//!
//! ```text
//!            find / move FIRST|LAST
//!   ┌─────┐ ──────────────────────> ┌─────────────────┐
//!   │ Nil │                         │ CoupledBtree or │
//!   └─────┘ <────────────────────── │ CoupledOverlay  │
//!            erase / failed move     └─────────────────┘
//! ```
//!
//! A `Nil` cursor holds no position and rejects `move_to`, `erase`,
//! `get_key`, `get_record` and `get_duplicate_count` with `CursorIsNil`.
//! The coupling tag records which layer was authoritative when the cursor
//! was positioned; reads always go through the merged view, so two
//! cursors on the same key observe the same record regardless of
//! coupling.
//!
//! Positions are stored as `(key, dup_index)` and re-resolved against the
//! tree on use; cached B-tree coordinates are a hint, not an anchor, so
//! splits, merges and erases by other cursors never mis-position this
//! one.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::btree::{compare_keys, EraseMode, KeyType};
use crate::env::{Core, Database, EnvInner, Txn};
use crate::error::ErrorKind;
use crate::flags::{
    DUPLICATE, DUPLICATE_INSERT_AFTER, DUPLICATE_INSERT_BEFORE, FIND_GT_MATCH, FIND_LT_MATCH,
    FIRST, LAST, NEXT, ONLY_DUPLICATES, PREVIOUS, SKIP_DUPLICATES,
};
use crate::txn::TxnId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Nil,
    /// Positioned on a key resident in the B-tree.
    CoupledBtree { key: Vec<u8>, dup_index: u32 },
    /// Positioned on a key that exists only in the overlay.
    CoupledOverlay { key: Vec<u8>, dup_index: u32 },
}

impl CursorState {
    fn position(&self) -> Option<(&[u8], u32)> {
        match self {
            CursorState::Nil => None,
            CursorState::CoupledBtree { key, dup_index }
            | CursorState::CoupledOverlay { key, dup_index } => Some((key, *dup_index)),
        }
    }
}

pub struct Cursor {
    inner: Arc<EnvInner>,
    db: u16,
    txn: Option<TxnId>,
    state: CursorState,
}

impl Cursor {
    /// Creates an unpositioned cursor over `db`, reading as `txn` (or as
    /// an outside observer when `None`).
    pub fn create(db: &Database, txn: Option<&Txn>) -> Cursor {
        Cursor {
            inner: Arc::clone(&db.inner),
            db: db.name,
            txn: txn.map(Txn::id),
            state: CursorState::Nil,
        }
    }

    /// Duplicates the cursor, including its position. `Clone` does the
    /// same.
    pub fn duplicate(&self) -> Cursor {
        Cursor {
            inner: Arc::clone(&self.inner),
            db: self.db,
            txn: self.txn,
            state: self.state.clone(),
        }
    }

    /// Releases the cursor's position. Dropping the cursor is equivalent.
    pub fn close(self) {}

    fn key_type(core: &Core, db: u16) -> Result<KeyType> {
        let db = core
            .dbs
            .get(&db)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        Ok(db.tree.key_type())
    }

    /// Positions the cursor. `FIND_GT_MATCH` / `FIND_LT_MATCH` allow
    /// approximate positioning; the default is an exact match.
    pub fn find(&mut self, key: &[u8], flags: u32) -> Result<()> {
        let mut core = lock_core(&self.inner)?;

        if key_visible(&mut core, self.db, self.txn, key)? {
            self.state = couple(&mut core, self.db, key, 0)?;
            return Ok(());
        }

        if flags & FIND_GT_MATCH != 0 {
            if let Some(next) = merged_next(&mut core, self.db, self.txn, Some(key))? {
                self.state = couple(&mut core, self.db, &next, 0)?;
                return Ok(());
            }
        }
        if flags & FIND_LT_MATCH != 0 {
            if let Some(prev) = merged_prev(&mut core, self.db, self.txn, Some(key))? {
                self.state = couple(&mut core, self.db, &prev, 0)?;
                return Ok(());
            }
        }

        Err(ErrorKind::KeyNotFound.into())
    }

    /// Moves the cursor; see the cursor move flags in [`crate::flags`].
    pub fn move_to(&mut self, flags: u32) -> Result<()> {
        let mut core = lock_core(&self.inner)?;

        if flags & FIRST != 0 {
            let Some(key) = merged_next(&mut core, self.db, self.txn, None)? else {
                return Err(ErrorKind::KeyNotFound.into());
            };
            self.state = couple(&mut core, self.db, &key, 0)?;
            return Ok(());
        }

        if flags & LAST != 0 {
            let Some(key) = merged_prev(&mut core, self.db, self.txn, None)? else {
                return Err(ErrorKind::KeyNotFound.into());
            };
            let dup_index = self.last_dup_index(&mut core, &key, flags)?;
            self.state = couple(&mut core, self.db, &key, dup_index)?;
            return Ok(());
        }

        let Some((key, dup_index)) = self.state.position().map(|(k, d)| (k.to_vec(), d)) else {
            return Err(ErrorKind::CursorIsNil.into());
        };

        if flags & NEXT != 0 {
            if flags & SKIP_DUPLICATES == 0 {
                let count = core.dup_count(self.db, self.txn, &key).unwrap_or(0);
                if dup_index + 1 < count {
                    self.state = couple(&mut core, self.db, &key, dup_index + 1)?;
                    return Ok(());
                }
            }
            ensure!(flags & ONLY_DUPLICATES == 0, ErrorKind::KeyNotFound);

            let Some(next) = merged_next(&mut core, self.db, self.txn, Some(&key))? else {
                return Err(ErrorKind::KeyNotFound.into());
            };
            self.state = couple(&mut core, self.db, &next, 0)?;
            return Ok(());
        }

        if flags & PREVIOUS != 0 {
            if flags & SKIP_DUPLICATES == 0 && dup_index > 0 {
                self.state = couple(&mut core, self.db, &key, dup_index - 1)?;
                return Ok(());
            }
            ensure!(flags & ONLY_DUPLICATES == 0, ErrorKind::KeyNotFound);

            let Some(prev) = merged_prev(&mut core, self.db, self.txn, Some(&key))? else {
                return Err(ErrorKind::KeyNotFound.into());
            };
            let dup_index = self.last_dup_index(&mut core, &prev, flags)?;
            self.state = couple(&mut core, self.db, &prev, dup_index)?;
            return Ok(());
        }

        Err(ErrorKind::InvParameter.into())
    }

    fn last_dup_index(&self, core: &mut Core, key: &[u8], flags: u32) -> Result<u32> {
        if flags & SKIP_DUPLICATES != 0 {
            return Ok(0);
        }
        Ok(core
            .dup_count(self.db, self.txn, key)?
            .saturating_sub(1))
    }

    /// Inserts through the cursor and couples it to the inserted key.
    /// `DUPLICATE_INSERT_BEFORE`/`AFTER` place a duplicate relative to the
    /// current position.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: u32) -> Result<()> {
        let mut core = lock_core(&self.inner)?;

        let positional = flags & (DUPLICATE_INSERT_BEFORE | DUPLICATE_INSERT_AFTER) != 0;
        let dup_pos = if positional {
            let Some((current_key, dup_index)) = self.state.position() else {
                return Err(ErrorKind::CursorIsNil.into());
            };
            let key_type = Self::key_type(&core, self.db)?;
            ensure!(
                compare_keys(key_type, current_key, key).is_eq(),
                ErrorKind::InvParameter
            );
            if flags & DUPLICATE_INSERT_BEFORE != 0 {
                Some(dup_index)
            } else {
                Some(dup_index + 1)
            }
        } else {
            None
        };

        let effective = if positional { flags | DUPLICATE } else { flags };
        core.insert(self.db, self.txn, key, record, effective, dup_pos, 0)?;

        let dup_index = match dup_pos {
            Some(position) => position,
            None if flags & DUPLICATE != 0 => {
                core.dup_count(self.db, self.txn, key)?.saturating_sub(1)
            }
            None => 0,
        };
        self.state = couple(&mut core, self.db, key, dup_index)?;
        Ok(())
    }

    /// Erases the duplicate under the cursor (the whole key when it is
    /// the last one) and uncouples the cursor.
    pub fn erase(&mut self) -> Result<()> {
        let mut core = lock_core(&self.inner)?;
        let Some((key, dup_index)) = self.state.position().map(|(k, d)| (k.to_vec(), d)) else {
            return Err(ErrorKind::CursorIsNil.into());
        };

        core.erase(self.db, self.txn, &key, EraseMode::Duplicate(dup_index))?;
        self.state = CursorState::Nil;
        Ok(())
    }

    pub fn get_key(&self) -> Result<Vec<u8>> {
        self.state
            .position()
            .map(|(key, _)| key.to_vec())
            .ok_or_else(|| ErrorKind::CursorIsNil.into())
    }

    pub fn get_record(&self) -> Result<Vec<u8>> {
        let mut core = lock_core(&self.inner)?;
        let Some((key, dup_index)) = self.state.position().map(|(k, d)| (k.to_vec(), d)) else {
            return Err(ErrorKind::CursorIsNil.into());
        };
        core.lookup(self.db, self.txn, &key, dup_index)
    }

    pub fn get_duplicate_count(&self) -> Result<u32> {
        let mut core = lock_core(&self.inner)?;
        let Some((key, _)) = self.state.position() else {
            return Err(ErrorKind::CursorIsNil.into());
        };
        let key = key.to_vec();
        core.dup_count(self.db, self.txn, &key)
    }

    /// Whether the cursor currently holds a position.
    pub fn is_nil(&self) -> bool {
        self.state == CursorState::Nil
    }
}

impl Clone for Cursor {
    fn clone(&self) -> Cursor {
        self.duplicate()
    }
}

fn lock_core(inner: &EnvInner) -> Result<parking_lot::MutexGuard<'_, Core>> {
    let core = inner.core.lock();
    ensure!(!core.closed, ErrorKind::InvParameter);
    Ok(core)
}

/// Builds the coupled state for `key`: to the B-tree when the key is
/// resident there, to the overlay otherwise.
fn couple(core: &mut Core, db: u16, key: &[u8], dup_index: u32) -> Result<CursorState> {
    Ok(if btree_has_key(core, db, key)? {
        CursorState::CoupledBtree {
            key: key.to_vec(),
            dup_index,
        }
    } else {
        CursorState::CoupledOverlay {
            key: key.to_vec(),
            dup_index,
        }
    })
}

fn btree_has_key(core: &mut Core, db: u16, key: &[u8]) -> Result<bool> {
    let Core {
        ref mut pm,
        ref mut dbs,
        ..
    } = *core;
    let state = dbs
        .get_mut(&db)
        .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
    match state.tree.find(pm, key) {
        Ok(_) => Ok(true),
        Err(err) if ErrorKind::of(&err) == Some(ErrorKind::KeyNotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Whether `key` reads as present in the merged view.
fn key_visible(core: &mut Core, db: u16, txn: Option<TxnId>, key: &[u8]) -> Result<bool> {
    core.key_exists(db, txn, key)
}

fn btree_next_key(core: &mut Core, db: u16, after: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
    let Core {
        ref mut pm,
        ref mut dbs,
        ..
    } = *core;
    let state = dbs
        .get_mut(&db)
        .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;

    let position = match after {
        None => state.tree.first(pm)?,
        Some(after) => match state.tree.lookup_ge(pm, after)? {
            Some((leaf, slot)) => {
                if state.tree.key_at(pm, leaf, slot)? == after {
                    state.tree.next_slot(pm, leaf, slot)?
                } else {
                    Some((leaf, slot))
                }
            }
            None => None,
        },
    };
    position
        .map(|(leaf, slot)| state.tree.key_at(pm, leaf, slot))
        .transpose()
}

fn btree_prev_key(core: &mut Core, db: u16, before: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
    let Core {
        ref mut pm,
        ref mut dbs,
        ..
    } = *core;
    let state = dbs
        .get_mut(&db)
        .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;

    let position = match before {
        None => state.tree.last(pm)?,
        Some(before) => match state.tree.lookup_le(pm, before)? {
            Some((leaf, slot)) => {
                if state.tree.key_at(pm, leaf, slot)? == before {
                    state.tree.prev_slot(pm, leaf, slot)?
                } else {
                    Some((leaf, slot))
                }
            }
            None => None,
        },
    };
    position
        .map(|(leaf, slot)| state.tree.key_at(pm, leaf, slot))
        .transpose()
}

/// Smallest visible key strictly greater than `after` in the merged view.
fn merged_next(
    core: &mut Core,
    db: u16,
    txn: Option<TxnId>,
    after: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let key_type = core
        .dbs
        .get(&db)
        .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?
        .tree
        .key_type();

    let mut bound = after.map(|k| k.to_vec());
    loop {
        let from_btree = btree_next_key(core, db, bound.as_deref())?;
        let from_overlay = core
            .dbs
            .get(&db)
            .expect("database state checked above")
            .overlay
            .next_key(bound.as_deref())
            .map(|k| k.bytes.clone());

        let candidate = match (from_btree, from_overlay) {
            (None, None) => return Ok(None),
            (Some(b), None) => b,
            (None, Some(o)) => o,
            (Some(b), Some(o)) => {
                if compare_keys(key_type, &b, &o).is_le() {
                    b
                } else {
                    o
                }
            }
        };

        if key_visible(core, db, txn, &candidate)? {
            return Ok(Some(candidate));
        }
        // Erased or invisible at this position: keep walking.
        bound = Some(candidate);
    }
}

/// Largest visible key strictly smaller than `before` in the merged view.
fn merged_prev(
    core: &mut Core,
    db: u16,
    txn: Option<TxnId>,
    before: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let key_type = core
        .dbs
        .get(&db)
        .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?
        .tree
        .key_type();

    let mut bound = before.map(|k| k.to_vec());
    loop {
        let from_btree = btree_prev_key(core, db, bound.as_deref())?;
        let from_overlay = core
            .dbs
            .get(&db)
            .expect("database state checked above")
            .overlay
            .prev_key(bound.as_deref())
            .map(|k| k.bytes.clone());

        let candidate = match (from_btree, from_overlay) {
            (None, None) => return Ok(None),
            (Some(b), None) => b,
            (None, Some(o)) => o,
            (Some(b), Some(o)) => {
                if compare_keys(key_type, &b, &o).is_ge() {
                    b
                } else {
                    o
                }
            }
        };

        if key_visible(core, db, txn, &candidate)? {
            return Ok(Some(candidate));
        }
        bound = Some(candidate);
    }
}
