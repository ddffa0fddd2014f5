//! # Transaction Management
//!
//! Transaction bookkeeping for the environment core: identifier
//! allocation, state tracking, and the per-transaction operation index
//! that commit and abort walk.
//!
//! ## Transaction Identifiers
//!
//! Transaction ids are 64-bit monotonically increasing integers owned by
//! the [`TxnTable`]. An id is never reused; after crash recovery the
//! sequence continues above the largest id seen in the journal.
//!
//! ## Transaction States
//!
//! ```text
//! ┌─────────┐    commit()     ┌───────────┐
//! │ Active  │ ──────────────> │ Committed │
//! └─────────┘                 └───────────┘
//!      │
//!      │ abort()
//!      v
//! ┌─────────┐
//! │ Aborted │
//! └─────────┘
//! ```
//!
//! Active transactions own an append-only list of `(database, key, lsn)`
//! references into the overlay; terminal transactions are immutable and
//! are pruned from the table once their overlay entries are gone.
//!
//! The public RAII handle (`Txn` in [`crate::env`]) aborts on drop when
//! neither `commit` nor `abort` was called.

pub mod overlay;

use eyre::{ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::error::ErrorKind;

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

/// A reference from a transaction to one of its overlay operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOpRef {
    pub dbname: u16,
    pub key: Vec<u8>,
    pub lsn: u64,
}

#[derive(Debug)]
pub struct TxnRecord {
    pub id: TxnId,
    pub flags: u32,
    pub state: TxnState,
    pub first_lsn: u64,
    /// Journal file holding this transaction's begin entry; the terminal
    /// entry must go to the same file.
    pub journal_file: usize,
    pub ops: SmallVec<[TxnOpRef; 16]>,
}

#[derive(Debug, Default)]
pub struct TxnTable {
    next_txn_id: TxnId,
    txns: HashMap<TxnId, TxnRecord>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            next_txn_id: 1,
            txns: HashMap::new(),
        }
    }

    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id
    }

    /// Continues the id sequence after recovery.
    pub fn restore_next_txn_id(&mut self, next: TxnId) {
        self.next_txn_id = next;
    }

    pub fn begin(&mut self, flags: u32, first_lsn: u64, journal_file: usize) -> TxnId {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(
            id,
            TxnRecord {
                id,
                flags,
                state: TxnState::Active,
                first_lsn,
                journal_file,
                ops: SmallVec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: TxnId) -> Option<&TxnRecord> {
        self.txns.get(&id)
    }

    /// State of a transaction; ids pruned from the table were committed or
    /// aborted long ago and resolve to `Committed` only through the
    /// overlay, which never outlives its transactions.
    pub fn state(&self, id: TxnId) -> Option<TxnState> {
        self.txns.get(&id).map(|t| t.state)
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.state(id) == Some(TxnState::Active)
    }

    pub fn active_count(&self) -> usize {
        self.txns
            .values()
            .filter(|t| t.state == TxnState::Active)
            .count()
    }

    /// Id of the oldest transaction still active, if any.
    pub fn oldest_active(&self) -> Option<TxnId> {
        self.txns
            .values()
            .filter(|t| t.state == TxnState::Active)
            .map(|t| t.id)
            .min()
    }

    pub fn record_op(&mut self, id: TxnId, op: TxnOpRef) -> Result<()> {
        let txn = self
            .txns
            .get_mut(&id)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        ensure!(txn.state == TxnState::Active, ErrorKind::TxnStillOpen);
        txn.ops.push(op);
        Ok(())
    }

    /// Moves the transaction to a terminal state and hands back its
    /// operation references, ordered by LSN.
    pub fn finish(&mut self, id: TxnId, state: TxnState) -> Result<Vec<TxnOpRef>> {
        debug_assert!(state != TxnState::Active);
        let txn = self
            .txns
            .get_mut(&id)
            .ok_or_else(|| eyre::Report::from(ErrorKind::InvParameter))?;
        ensure!(txn.state == TxnState::Active, ErrorKind::InvParameter);

        txn.state = state;
        let mut ops: Vec<TxnOpRef> = txn.ops.drain(..).collect();
        ops.sort_by_key(|op| op.lsn);
        Ok(ops)
    }

    /// Drops a terminal transaction's record once its overlay entries are
    /// cleaned up.
    pub fn prune(&mut self, id: TxnId) {
        if let Some(txn) = self.txns.get(&id) {
            if txn.state != TxnState::Active {
                self.txns.remove(&id);
            }
        }
    }
}
