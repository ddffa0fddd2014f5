//! # Transaction Overlay
//!
//! The overlay is the in-memory layer holding the uncommitted writes of
//! active transactions, one overlay per database. It is an ordered map
//! from key (under the database's compare function) to an append-only,
//! LSN-ordered list of operations.
//!
//! Reads compute the *visible state* of a key for a reader by scanning its
//! operation list head to tail and applying every visible operation — the
//! reader's own, plus those of committed transactions. If the scan decides
//! nothing, the B-tree below is authoritative.
//!
//! Commit eagerly applies a transaction's operations to the B-tree and
//! removes them from the overlay; abort just removes them. Either way the
//! overlay only ever holds operations of live transactions plus the
//! transient window inside commit itself.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::btree::{compare_keys, KeyType};
use crate::txn::{TxnId, TxnState};

/// A key ordered by the owning database's compare function.
#[derive(Debug, Clone)]
pub struct OverlayKey {
    pub bytes: Vec<u8>,
    key_type: KeyType,
}

impl OverlayKey {
    pub fn new(bytes: Vec<u8>, key_type: KeyType) -> Self {
        Self { bytes, key_type }
    }
}

impl PartialEq for OverlayKey {
    fn eq(&self, other: &Self) -> bool {
        compare_keys(self.key_type, &self.bytes, &other.bytes).is_eq()
    }
}

impl Eq for OverlayKey {}

impl PartialOrd for OverlayKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OverlayKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        compare_keys(self.key_type, &self.bytes, &other.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    InsertOverwrite,
    InsertDup,
    Erase,
}

#[derive(Debug, Clone)]
pub struct OverlayOp {
    pub lsn: u64,
    pub txn_id: TxnId,
    pub kind: OpKind,
    pub record: Option<Vec<u8>>,
    pub flags: u32,
    pub dup_index: u32,
}

/// The visible state of one key after scanning its operation list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyView {
    /// At least one operation was visible; when false the B-tree decides.
    pub any_visible: bool,
    /// A visible erase hides the key (and the B-tree state below it).
    pub erased: bool,
    /// Record set by the latest visible insert/overwrite.
    pub record: Option<Vec<u8>>,
    /// Duplicates appended by visible `InsertDup` operations, in order.
    pub dups: Vec<Vec<u8>>,
}

impl KeyView {
    /// Whether the key reads as present from the overlay alone.
    pub fn is_present(&self) -> bool {
        self.record.is_some() || !self.dups.is_empty()
    }

    /// The record a `find` should return when the overlay decides.
    pub fn first_record(&self) -> Option<&Vec<u8>> {
        self.record.as_ref().or_else(|| self.dups.first())
    }
}

#[derive(Debug)]
pub struct Overlay {
    key_type: KeyType,
    map: BTreeMap<OverlayKey, Vec<OverlayOp>>,
}

impl Overlay {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            map: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn probe(&self, key: &[u8]) -> OverlayKey {
        OverlayKey::new(key.to_vec(), self.key_type)
    }

    /// Appends an operation to the key's list. Lists are append-only and
    /// LSN-ordered; both invariants hold because LSNs are allocated under
    /// the environment lock.
    pub fn append(&mut self, key: &[u8], op: OverlayOp) {
        let ops = self.map.entry(self.probe(key)).or_default();
        debug_assert!(
            ops.last().map_or(true, |last| last.lsn < op.lsn),
            "overlay op list must stay LSN-ordered"
        );
        ops.push(op);
    }

    pub fn ops(&self, key: &[u8]) -> Option<&[OverlayOp]> {
        self.map.get(&self.probe(key)).map(|v| v.as_slice())
    }

    /// True when another active transaction has pending operations on the
    /// key.
    pub fn conflicts_with(
        &self,
        key: &[u8],
        writer: TxnId,
        state_of: &dyn Fn(TxnId) -> Option<TxnState>,
    ) -> bool {
        self.ops(key).is_some_and(|ops| {
            ops.iter().any(|op| {
                op.txn_id != writer && state_of(op.txn_id) == Some(TxnState::Active)
            })
        })
    }

    /// Computes the visible state of a key for `reader` (`None` reads as
    /// an outside observer seeing only committed state).
    pub fn visible_state(
        &self,
        key: &[u8],
        reader: Option<TxnId>,
        state_of: &dyn Fn(TxnId) -> Option<TxnState>,
    ) -> KeyView {
        let mut view = KeyView::default();
        let Some(ops) = self.ops(key) else {
            return view;
        };

        for op in ops {
            let own = reader == Some(op.txn_id);
            let committed = state_of(op.txn_id) == Some(TxnState::Committed);
            if !own && !committed {
                continue;
            }
            view.any_visible = true;
            match op.kind {
                OpKind::Insert | OpKind::InsertOverwrite => {
                    view.erased = false;
                    view.record = op.record.clone();
                }
                OpKind::InsertDup => {
                    view.erased = false;
                    if let Some(record) = &op.record {
                        if op.flags & crate::flags::DUPLICATE_INSERT_BEFORE != 0 {
                            view.dups.insert(0, record.clone());
                        } else {
                            view.dups.push(record.clone());
                        }
                    }
                }
                OpKind::Erase => {
                    view.erased = true;
                    view.record = None;
                    view.dups.clear();
                }
            }
        }
        view
    }

    /// Removes the operation `(key, lsn)`, dropping the key node when its
    /// list empties. Returns the removed operation.
    pub fn remove_op(&mut self, key: &[u8], lsn: u64) -> Option<OverlayOp> {
        let probe = self.probe(key);
        let ops = self.map.get_mut(&probe)?;
        let idx = ops.iter().position(|op| op.lsn == lsn)?;
        let op = ops.remove(idx);
        if ops.is_empty() {
            self.map.remove(&probe);
        }
        Some(op)
    }

    /// Removes every operation of `txn` under `key`.
    pub fn remove_txn_ops(&mut self, key: &[u8], txn: TxnId) {
        let probe = self.probe(key);
        if let Some(ops) = self.map.get_mut(&probe) {
            ops.retain(|op| op.txn_id != txn);
            if ops.is_empty() {
                self.map.remove(&probe);
            }
        }
    }

    /// Smallest overlay key strictly greater than `after` (or the first
    /// key when `after` is `None`).
    pub fn next_key(&self, after: Option<&[u8]>) -> Option<&OverlayKey> {
        match after {
            None => self.map.keys().next(),
            Some(after) => {
                let probe = self.probe(after);
                self.map
                    .range((Bound::Excluded(probe), Bound::Unbounded))
                    .map(|(k, _)| k)
                    .next()
            }
        }
    }

    /// Largest overlay key strictly smaller than `before` (or the last
    /// key when `before` is `None`).
    pub fn prev_key(&self, before: Option<&[u8]>) -> Option<&OverlayKey> {
        match before {
            None => self.map.keys().next_back(),
            Some(before) => {
                let probe = self.probe(before);
                self.map
                    .range((Bound::Unbounded, Bound::Excluded(probe)))
                    .map(|(k, _)| k)
                    .next_back()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::DUPLICATE_INSERT_BEFORE;

    fn op(lsn: u64, txn_id: TxnId, kind: OpKind, record: Option<&[u8]>) -> OverlayOp {
        OverlayOp {
            lsn,
            txn_id,
            kind,
            record: record.map(|r| r.to_vec()),
            flags: 0,
            dup_index: 0,
        }
    }

    fn states<'a>(active: &'a [TxnId], committed: &'a [TxnId]) -> impl Fn(TxnId) -> Option<TxnState> + 'a {
        move |id| {
            if active.contains(&id) {
                Some(TxnState::Active)
            } else if committed.contains(&id) {
                Some(TxnState::Committed)
            } else {
                None
            }
        }
    }

    #[test]
    fn own_writes_are_visible_others_are_not() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::Insert, Some(b"v1")));

        let state_of = states(&[1], &[]);
        let own = overlay.visible_state(b"k", Some(1), &state_of);
        assert!(own.any_visible);
        assert_eq!(own.first_record().unwrap(), b"v1");

        let other = overlay.visible_state(b"k", Some(2), &state_of);
        assert!(!other.any_visible);

        let outsider = overlay.visible_state(b"k", None, &state_of);
        assert!(!outsider.any_visible);
    }

    #[test]
    fn committed_writes_are_visible_to_everyone() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::Insert, Some(b"v1")));

        let state_of = states(&[], &[1]);
        let view = overlay.visible_state(b"k", Some(9), &state_of);
        assert_eq!(view.first_record().unwrap(), b"v1");
    }

    #[test]
    fn later_ops_shadow_earlier_ones() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::Insert, Some(b"v1")));
        overlay.append(b"k", op(2, 1, OpKind::InsertOverwrite, Some(b"v2")));

        let state_of = states(&[1], &[]);
        let view = overlay.visible_state(b"k", Some(1), &state_of);
        assert_eq!(view.first_record().unwrap(), b"v2");

        overlay.append(b"k", op(3, 1, OpKind::Erase, None));
        let view = overlay.visible_state(b"k", Some(1), &state_of);
        assert!(view.erased);
        assert!(!view.is_present());

        // An insert after the erase resurrects the key.
        overlay.append(b"k", op(4, 1, OpKind::Insert, Some(b"v3")));
        let view = overlay.visible_state(b"k", Some(1), &state_of);
        assert!(!view.erased);
        assert_eq!(view.first_record().unwrap(), b"v3");
    }

    #[test]
    fn dup_ops_accumulate_in_order() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::InsertDup, Some(b"b")));
        overlay.append(b"k", op(2, 1, OpKind::InsertDup, Some(b"c")));
        let mut before = op(3, 1, OpKind::InsertDup, Some(b"a"));
        before.flags = DUPLICATE_INSERT_BEFORE;
        overlay.append(b"k", before);

        let state_of = states(&[1], &[]);
        let view = overlay.visible_state(b"k", Some(1), &state_of);
        assert_eq!(view.dups, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn conflict_detection_sees_other_active_writers() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::Insert, Some(b"v")));

        let state_of = states(&[1], &[]);
        assert!(overlay.conflicts_with(b"k", 2, &|id| state_of(id)));
        assert!(!overlay.conflicts_with(b"k", 1, &|id| state_of(id)));

        // Once txn 1 is committed the conflict is gone.
        let state_of = states(&[], &[1]);
        assert!(!overlay.conflicts_with(b"k", 2, &|id| state_of(id)));
    }

    #[test]
    fn remove_op_drops_empty_key_nodes() {
        let mut overlay = Overlay::new(KeyType::Binary);
        overlay.append(b"k", op(1, 1, OpKind::Insert, Some(b"v")));
        overlay.append(b"k", op(2, 1, OpKind::Erase, None));

        let removed = overlay.remove_op(b"k", 1).unwrap();
        assert_eq!(removed.kind, OpKind::Insert);
        assert!(!overlay.is_empty());

        overlay.remove_op(b"k", 2).unwrap();
        assert!(overlay.is_empty());
        assert!(overlay.remove_op(b"k", 2).is_none());
    }

    #[test]
    fn key_iteration_respects_compare_function() {
        let mut overlay = Overlay::new(KeyType::U64);
        for value in [300u64, 2, 70000] {
            overlay.append(&value.to_le_bytes(), op(value, 1, OpKind::Insert, Some(b"v")));
        }

        let first = overlay.next_key(None).unwrap();
        assert_eq!(first.bytes, 2u64.to_le_bytes());

        let after = overlay.next_key(Some(&2u64.to_le_bytes())).unwrap();
        assert_eq!(after.bytes, 300u64.to_le_bytes());

        let last = overlay.prev_key(None).unwrap();
        assert_eq!(last.bytes, 70000u64.to_le_bytes());

        assert!(overlay.next_key(Some(&70000u64.to_le_bytes())).is_none());
    }
}
