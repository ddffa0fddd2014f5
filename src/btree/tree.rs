//! # B-tree Index Operations
//!
//! The ordered key→record map: descent, insertion with node splits,
//! erasure with the shift/merge/rebalance protocol, enumeration, and the
//! approximate lookups cursors are built on.
//!
//! ## Structure
//!
//! All data lives in the slots; internal nodes store separator keys whose
//! `record_ptr` is the child holding keys >= the separator, with the
//! leftmost child in the node header's `ptr_down`. Nodes on each level are
//! doubly linked through their sibling pointers, which gives enumeration
//! and cursor scans a pointer-chasing walk instead of repeated descents.
//!
//! ## Insert
//!
//! Descend to the target leaf recording the path. A full leaf splits at
//! the median: the upper half moves to a fresh right sibling and the right
//! half's first key is promoted into the parent. Promotion recurses up the
//! recorded path; a split of the root grows the tree by one level.
//!
//! ## Erase
//!
//! Remove the slot from its leaf. A node that drops below half occupancy
//! first tries to take one slot from its left sibling, then from its right
//! sibling, and otherwise merges (into the left node when one exists).
//! Merges remove a separator from the parent and propagate the underflow
//! check upward. An internal root left with a single child is replaced by
//! that child; erasing the last key leaves an empty leaf root.
//!
//! Shifts and merges between internal nodes rotate separator keys through
//! the parent, so the children arrays stay aligned with the separators.
//!
//! ## Storage Ownership
//!
//! Moving raw slot images between sibling nodes preserves blob ownership
//! (extended keys, spilled records, duplicate tables travel with their
//! slot). Whenever a key is *copied* into a parent as a separator it is
//! re-encoded, allocating a fresh extended-key blob if needed; removing a
//! separator frees that blob.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::compress::Compressor;
use crate::config::{MAX_INLINE_RECORD_SIZE, MAX_KEY_SIZE, MAX_RECORD_SIZE, MIN_NODE_CAPACITY};
use crate::error::ErrorKind;
use crate::flags::{DUPLICATE, OVERWRITE};
use crate::storage::{Page, PageManager, PageType};

use super::blob::{blob_alloc, blob_free, blob_info, blob_page_count, blob_read, BLOB_FLAG_COMPRESSED};
use super::dupes::{
    dup_count, dup_entry_blob, dup_erase, dup_free_all, dup_get, dup_insert, dup_set,
    dup_table_create,
};
use super::node::{
    merge_threshold, node_capacity, NodeView, NodeViewMut, SlotFields, SLOT_DUPLICATES,
    SLOT_EXTENDED_KEY, SLOT_RECORD_INLINE,
};
use super::{compare_keys, compare_prefix, KeyType};

/// What `erase` removes from a key's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// The key with all of its duplicates.
    All,
    /// A single duplicate by its position.
    Duplicate(u32),
}

/// Callbacks for [`BtreeIndex::enumerate`].
pub trait BtreeVisitor {
    fn visit_node(&mut self, offset: u64, is_leaf: bool, key_count: usize) -> Result<()> {
        let _ = (offset, is_leaf, key_count);
        Ok(())
    }

    fn visit_key(&mut self, key: &[u8], dup_count: u32) -> Result<()> {
        let _ = (key, dup_count);
        Ok(())
    }
}

pub struct BtreeIndex {
    root: u64,
    key_size: u16,
    key_type: KeyType,
    dup_enabled: bool,
    compressor: Option<Arc<dyn Compressor>>,
}

impl std::fmt::Debug for BtreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeIndex")
            .field("root", &self.root)
            .field("key_size", &self.key_size)
            .field("key_type", &self.key_type)
            .field("dup_enabled", &self.dup_enabled)
            .finish_non_exhaustive()
    }
}

impl BtreeIndex {
    /// Attaches to an existing tree.
    pub fn open(root: u64, key_size: u16, key_type: KeyType, dup_enabled: bool) -> Self {
        Self {
            root,
            key_size,
            key_type,
            dup_enabled,
            compressor: None,
        }
    }

    /// Allocates an empty-leaf root for a fresh database.
    pub fn create(
        pm: &mut PageManager,
        key_size: u16,
        key_type: KeyType,
        dup_enabled: bool,
    ) -> Result<Self> {
        ensure!(
            key_size >= 8 && node_capacity(pm.page_size(), key_size) >= MIN_NODE_CAPACITY,
            ErrorKind::InvKeySize
        );

        let root = Self::alloc_node(pm, key_size, true)?;
        Ok(Self {
            root,
            key_size,
            key_type,
            dup_enabled,
            compressor: None,
        })
    }

    pub fn set_compressor(&mut self, compressor: Option<Arc<dyn Compressor>>) {
        self.compressor = compressor;
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn key_size(&self) -> u16 {
        self.key_size
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn alloc_node(pm: &mut PageManager, key_size: u16, leaf: bool) -> Result<u64> {
        let page = pm.alloc(PageType::BtreeNode, 0)?;
        let offset = page.offset();
        let mut data = page.data_mut();
        NodeViewMut::init(&mut data[..], key_size, leaf)?;
        Ok(offset)
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        ensure!(!key.is_empty() && key.len() <= MAX_KEY_SIZE, ErrorKind::InvKeySize);
        if self.key_type == KeyType::U64 {
            ensure!(key.len() == 8, ErrorKind::InvKeySize);
        }
        Ok(())
    }

    // -- node access helpers ------------------------------------------------

    fn is_leaf(&self, page: &Arc<Page>) -> Result<bool> {
        let data = page.data();
        NodeView::new(&data, self.key_size).is_leaf()
    }

    fn key_count(&self, page: &Arc<Page>) -> Result<usize> {
        let data = page.data();
        NodeView::new(&data, self.key_size).key_count()
    }

    fn child_at(&self, page: &Arc<Page>, child_idx: usize) -> Result<u64> {
        let data = page.data();
        let view = NodeView::new(&data, self.key_size);
        if child_idx == 0 {
            view.ptr_down()
        } else {
            Ok(view.fields(child_idx - 1)?.record_ptr)
        }
    }

    /// Binary search for `key` inside one node. Returns `(found, index)`
    /// with `index` being the insertion point when not found.
    fn search_node(
        &self,
        pm: &mut PageManager,
        page: &Arc<Page>,
        key: &[u8],
    ) -> Result<(bool, usize)> {
        let data = page.data();
        let view = NodeView::new(&data, self.key_size);
        view.search(|i| {
            let fields = view.fields(i)?;
            let prefix = view.inline_key(i)?;
            if fields.flags & SLOT_EXTENDED_KEY == 0 {
                Ok(compare_keys(self.key_type, key, prefix))
            } else {
                match compare_prefix(self.key_type, key, prefix, fields.key_size as usize) {
                    Some(ordering) => Ok(ordering),
                    None => {
                        let full = blob_read(pm, view.extended_key_offset(i)?)?;
                        Ok(compare_keys(self.key_type, key, &full))
                    }
                }
            }
        })
    }

    /// Full bytes of the key in `slot`.
    pub fn key_at(&self, pm: &mut PageManager, page_offset: u64, slot: usize) -> Result<Vec<u8>> {
        let page = pm.fetch(page_offset)?;
        let (extended, blob, inline) = {
            let data = page.data();
            let view = NodeView::new(&data, self.key_size);
            let fields = view.fields(slot)?;
            if fields.flags & SLOT_EXTENDED_KEY != 0 {
                (true, view.extended_key_offset(slot)?, Vec::new())
            } else {
                (false, 0, view.inline_key(slot)?.to_vec())
            }
        };
        if extended {
            blob_read(pm, blob)
        } else {
            Ok(inline)
        }
    }

    /// Record bytes of `slot`; for a key with duplicates, the duplicate at
    /// `dup_index`.
    pub fn record_at(
        &self,
        pm: &mut PageManager,
        page_offset: u64,
        slot: usize,
        dup_index: u32,
    ) -> Result<Vec<u8>> {
        let page = pm.fetch(page_offset)?;
        let fields = {
            let data = page.data();
            NodeView::new(&data, self.key_size).fields(slot)?
        };

        if fields.flags & SLOT_DUPLICATES != 0 {
            return dup_get(pm, fields.record_ptr, dup_index);
        }
        ensure!(dup_index == 0, ErrorKind::KeyNotFound);

        if fields.flags & SLOT_RECORD_INLINE != 0 {
            let bytes = fields.record_ptr.to_le_bytes();
            return Ok(bytes[..fields.inline_record_size as usize].to_vec());
        }

        self.read_record_blob(pm, fields.record_ptr)
    }

    fn read_record_blob(&self, pm: &mut PageManager, offset: u64) -> Result<Vec<u8>> {
        let info = blob_info(pm, offset)?;
        let stored = blob_read(pm, offset)?;
        if info.flags & BLOB_FLAG_COMPRESSED != 0 {
            let compressor = self.compressor.as_ref().ok_or_else(|| {
                eyre::Report::from(ErrorKind::InvParameter)
                    .wrap_err("record is compressed but the database has no compressor")
            })?;
            compressor.decompress(&stored, info.raw_size as usize)
        } else {
            Ok(stored)
        }
    }

    /// Number of duplicates stored under the key in `slot` (1 when the
    /// key has no duplicate table).
    pub fn dup_count_at(
        &self,
        pm: &mut PageManager,
        page_offset: u64,
        slot: usize,
    ) -> Result<u32> {
        let page = pm.fetch(page_offset)?;
        let fields = {
            let data = page.data();
            NodeView::new(&data, self.key_size).fields(slot)?
        };
        if fields.flags & SLOT_DUPLICATES != 0 {
            dup_count(pm, fields.record_ptr)
        } else {
            Ok(1)
        }
    }

    // -- encoding helpers ---------------------------------------------------

    /// Produces the inline byte image of a key, spilling long keys into an
    /// extended-key blob.
    fn encode_key(&self, pm: &mut PageManager, key: &[u8]) -> Result<(Vec<u8>, bool)> {
        let cap = self.key_size as usize;
        if key.len() <= cap {
            Ok((key.to_vec(), false))
        } else {
            let blob = blob_alloc(pm, key, PageType::Blob, 0, 0)?;
            let mut inline = key[..cap - 8].to_vec();
            inline.extend_from_slice(&blob.to_le_bytes());
            Ok((inline, true))
        }
    }

    /// Encodes a record into `(record_ptr, flag bits, inline size)`.
    fn encode_record(&self, pm: &mut PageManager, record: &[u8]) -> Result<(u64, u8, u8)> {
        if record.len() <= MAX_INLINE_RECORD_SIZE {
            let mut bytes = [0u8; 8];
            bytes[..record.len()].copy_from_slice(record);
            return Ok((
                u64::from_le_bytes(bytes),
                SLOT_RECORD_INLINE,
                record.len() as u8,
            ));
        }

        let (stored, blob_flags, raw_size) = match &self.compressor {
            Some(compressor) => {
                let compressed = compressor.compress(record, None)?;
                if compressed.len() < record.len() {
                    (compressed, BLOB_FLAG_COMPRESSED, record.len() as u32)
                } else {
                    (record.to_vec(), 0, 0)
                }
            }
            None => (record.to_vec(), 0, 0),
        };
        let offset = blob_alloc(pm, &stored, PageType::Blob, blob_flags, raw_size)?;
        Ok((offset, 0, 0))
    }

    fn free_record_storage(&self, pm: &mut PageManager, fields: SlotFields) -> Result<()> {
        if fields.flags & SLOT_DUPLICATES != 0 {
            dup_free_all(pm, fields.record_ptr)
        } else if fields.flags & SLOT_RECORD_INLINE == 0 {
            blob_free(pm, fields.record_ptr)
        } else {
            Ok(())
        }
    }

    fn free_key_storage(&self, pm: &mut PageManager, page: &Arc<Page>, slot: usize) -> Result<()> {
        let (extended, blob) = {
            let data = page.data();
            let view = NodeView::new(&data, self.key_size);
            let fields = view.fields(slot)?;
            if fields.flags & SLOT_EXTENDED_KEY != 0 {
                (true, view.extended_key_offset(slot)?)
            } else {
                (false, 0)
            }
        };
        if extended {
            blob_free(pm, blob)?;
        }
        Ok(())
    }

    // -- descent ------------------------------------------------------------

    /// Walks from the root to the leaf responsible for `key`, recording
    /// `(node, taken child index)` for every internal node passed.
    fn descend(&self, pm: &mut PageManager, key: &[u8]) -> Result<(Vec<(u64, usize)>, u64)> {
        let mut path = Vec::new();
        let mut current = self.root;
        loop {
            let page = pm.fetch(current)?;
            if self.is_leaf(&page)? {
                return Ok((path, current));
            }
            let (found, idx) = self.search_node(pm, &page, key)?;
            // An equal separator routes into its right subtree: separators
            // carry the smallest key of the child they point to.
            let child_idx = if found { idx + 1 } else { idx };
            path.push((current, child_idx));
            current = self.child_at(&page, child_idx)?;
        }
    }

    /// Exact lookup. Returns the `(leaf page, slot)` coordinates.
    pub fn find(&self, pm: &mut PageManager, key: &[u8]) -> Result<(u64, usize)> {
        self.validate_key(key)?;
        let (_, leaf) = self.descend(pm, key)?;
        let page = pm.fetch(leaf)?;
        let (found, idx) = self.search_node(pm, &page, key)?;
        ensure!(found, ErrorKind::KeyNotFound);
        Ok((leaf, idx))
    }

    /// Positions on the smallest key >= `key`.
    pub fn lookup_ge(&self, pm: &mut PageManager, key: &[u8]) -> Result<Option<(u64, usize)>> {
        let (_, leaf) = self.descend(pm, key)?;
        let page = pm.fetch(leaf)?;
        let (found, idx) = self.search_node(pm, &page, key)?;
        if found {
            return Ok(Some((leaf, idx)));
        }
        self.skip_forward(pm, leaf, idx)
    }

    /// Positions on the largest key <= `key`.
    pub fn lookup_le(&self, pm: &mut PageManager, key: &[u8]) -> Result<Option<(u64, usize)>> {
        let (_, leaf) = self.descend(pm, key)?;
        let page = pm.fetch(leaf)?;
        let (found, idx) = self.search_node(pm, &page, key)?;
        if found {
            return Ok(Some((leaf, idx)));
        }
        if idx > 0 {
            return Ok(Some((leaf, idx - 1)));
        }
        // Walk left along the sibling chain for the predecessor.
        let mut current = {
            let data = page.data();
            NodeView::new(&data, self.key_size).left_sibling()?
        };
        while current != 0 {
            let page = pm.fetch(current)?;
            let count = self.key_count(&page)?;
            if count > 0 {
                return Ok(Some((current, count - 1)));
            }
            let data = page.data();
            current = NodeView::new(&data, self.key_size).left_sibling()?;
        }
        Ok(None)
    }

    /// First slot at or after `(leaf, idx)`, following the sibling chain.
    fn skip_forward(
        &self,
        pm: &mut PageManager,
        leaf: u64,
        idx: usize,
    ) -> Result<Option<(u64, usize)>> {
        let mut current = leaf;
        let mut slot = idx;
        loop {
            let page = pm.fetch(current)?;
            if slot < self.key_count(&page)? {
                return Ok(Some((current, slot)));
            }
            let data = page.data();
            current = NodeView::new(&data, self.key_size).right_sibling()?;
            slot = 0;
            if current == 0 {
                return Ok(None);
            }
        }
    }

    /// Slot following `(page, slot)` in key order.
    pub fn next_slot(
        &self,
        pm: &mut PageManager,
        page: u64,
        slot: usize,
    ) -> Result<Option<(u64, usize)>> {
        self.skip_forward(pm, page, slot + 1)
    }

    /// Slot preceding `(page, slot)` in key order.
    pub fn prev_slot(
        &self,
        pm: &mut PageManager,
        page: u64,
        slot: usize,
    ) -> Result<Option<(u64, usize)>> {
        if slot > 0 {
            return Ok(Some((page, slot - 1)));
        }
        let mut current = {
            let page = pm.fetch(page)?;
            let data = page.data();
            NodeView::new(&data, self.key_size).left_sibling()?
        };
        while current != 0 {
            let page = pm.fetch(current)?;
            let count = self.key_count(&page)?;
            if count > 0 {
                return Ok(Some((current, count - 1)));
            }
            let data = page.data();
            current = NodeView::new(&data, self.key_size).left_sibling()?;
        }
        Ok(None)
    }

    /// Leftmost slot of the tree.
    pub fn first(&self, pm: &mut PageManager) -> Result<Option<(u64, usize)>> {
        let leaf = self.leftmost_leaf(pm)?;
        self.skip_forward(pm, leaf, 0)
    }

    /// Rightmost slot of the tree.
    pub fn last(&self, pm: &mut PageManager) -> Result<Option<(u64, usize)>> {
        let mut current = self.root;
        loop {
            let page = pm.fetch(current)?;
            if self.is_leaf(&page)? {
                break;
            }
            let count = self.key_count(&page)?;
            current = self.child_at(&page, count)?;
        }
        // The rightmost leaf of a rebalanced tree is only empty when the
        // whole tree is.
        let page = pm.fetch(current)?;
        let count = self.key_count(&page)?;
        if count == 0 {
            Ok(None)
        } else {
            Ok(Some((current, count - 1)))
        }
    }

    fn leftmost_leaf(&self, pm: &mut PageManager) -> Result<u64> {
        let mut current = self.root;
        loop {
            let page = pm.fetch(current)?;
            if self.is_leaf(&page)? {
                return Ok(current);
            }
            current = self.child_at(&page, 0)?;
        }
    }

    // -- insert -------------------------------------------------------------

    /// Inserts `key` → `record`. `OVERWRITE` replaces an existing record;
    /// `DUPLICATE` appends one (at `dup_pos` when given); a bare insert of
    /// an existing key fails with `DuplicateKey`.
    pub fn insert(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dup_pos: Option<u32>,
    ) -> Result<()> {
        self.validate_key(key)?;
        ensure!(record.len() <= MAX_RECORD_SIZE, ErrorKind::InvRecordSize);

        let (path, leaf) = self.descend(pm, key)?;
        let page = pm.fetch(leaf)?;
        let (found, idx) = self.search_node(pm, &page, key)?;

        if found {
            return self.insert_into_existing(pm, &page, idx, record, flags, dup_pos);
        }

        let (record_ptr, record_flags, inline_record_size) = self.encode_record(pm, record)?;
        let fields = SlotFields {
            record_ptr,
            flags: record_flags,
            inline_record_size,
            key_size: key.len() as u16,
        };

        let target = if self.key_count(&page)? < node_capacity(pm.page_size(), self.key_size) {
            leaf
        } else {
            drop(page);
            let (separator, right) = self.split_node(pm, leaf)?;
            let target = if compare_keys(self.key_type, key, &separator) == Ordering::Less {
                leaf
            } else {
                right
            };
            self.propagate_split(pm, path, leaf, separator, right)?;
            target
        };

        let (inline, extended) = self.encode_key(pm, key)?;
        let fields = SlotFields {
            flags: fields.flags | if extended { SLOT_EXTENDED_KEY } else { 0 },
            ..fields
        };

        let page = pm.fetch(target)?;
        let (_, idx) = self.search_node(pm, &page, key)?;
        let mut data = page.data_mut();
        NodeViewMut::new(&mut data[..], self.key_size).insert_slot(idx, fields, &inline)
    }

    fn insert_into_existing(
        &self,
        pm: &mut PageManager,
        page: &Arc<Page>,
        idx: usize,
        record: &[u8],
        flags: u32,
        dup_pos: Option<u32>,
    ) -> Result<()> {
        let fields = {
            let data = page.data();
            NodeView::new(&data, self.key_size).fields(idx)?
        };

        if flags & DUPLICATE != 0 {
            ensure!(self.dup_enabled, ErrorKind::InvParameter);

            let table = if fields.flags & SLOT_DUPLICATES != 0 {
                dup_insert(pm, fields.record_ptr, dup_pos, record)?
            } else {
                // Second record under this key: build the table from the
                // resident record plus the new one.
                let existing = if fields.flags & SLOT_RECORD_INLINE != 0 {
                    let bytes = fields.record_ptr.to_le_bytes();
                    bytes[..fields.inline_record_size as usize].to_vec()
                } else {
                    self.read_record_blob(pm, fields.record_ptr)?
                };
                if fields.flags & SLOT_RECORD_INLINE == 0 {
                    blob_free(pm, fields.record_ptr)?;
                }
                if dup_pos == Some(0) {
                    dup_table_create(pm, record, &existing)?
                } else {
                    dup_table_create(pm, &existing, record)?
                }
            };

            let slot_flags =
                (fields.flags & SLOT_EXTENDED_KEY) | SLOT_DUPLICATES;
            let mut data = page.data_mut();
            return NodeViewMut::new(&mut data[..], self.key_size)
                .set_record(idx, table, slot_flags, 0);
        }

        if flags & OVERWRITE != 0 {
            if fields.flags & SLOT_DUPLICATES != 0 {
                let table = dup_set(pm, fields.record_ptr, dup_pos.unwrap_or(0), record)?;
                let mut data = page.data_mut();
                return NodeViewMut::new(&mut data[..], self.key_size)
                    .set_record(idx, table, fields.flags, 0);
            }

            if fields.flags & SLOT_RECORD_INLINE == 0 {
                blob_free(pm, fields.record_ptr)?;
            }
            let (record_ptr, record_flags, inline_record_size) =
                self.encode_record(pm, record)?;
            let slot_flags = (fields.flags & SLOT_EXTENDED_KEY) | record_flags;
            let mut data = page.data_mut();
            return NodeViewMut::new(&mut data[..], self.key_size).set_record(
                idx,
                record_ptr,
                slot_flags,
                inline_record_size,
            );
        }

        Err(ErrorKind::DuplicateKey.into())
    }

    /// Splits `node` at the median, returning the promoted separator (full
    /// key bytes) and the new right sibling.
    fn split_node(&mut self, pm: &mut PageManager, node: u64) -> Result<(Vec<u8>, u64)> {
        let page = pm.fetch(node)?;
        let leaf = self.is_leaf(&page)?;
        let count = self.key_count(&page)?;
        let mid = count / 2;
        debug_assert!(mid > 0 && mid < count, "split of node with {} slots", count);

        let right = Self::alloc_node(pm, self.key_size, leaf)?;
        let right_page = pm.fetch(right)?;

        let (separator, old_right_sibling) = if leaf {
            let separator = self.key_at(pm, node, mid)?;
            {
                let data = page.data();
                let view = NodeView::new(&data, self.key_size);
                let image: Vec<u8> = (mid..count)
                    .map(|i| view.slot_bytes(i))
                    .collect::<Result<Vec<_>>>()?
                    .concat();
                let mut right_data = right_page.data_mut();
                NodeViewMut::new(&mut right_data[..], self.key_size).append_raw(&image)?;
            }
            {
                let mut data = page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).truncate(count - mid)?;
            }
            let data = page.data();
            (separator, NodeView::new(&data, self.key_size).right_sibling()?)
        } else {
            // The median separator moves up; its right subtree becomes the
            // new node's leftmost child.
            let separator = self.key_at(pm, node, mid)?;
            let mid_child = {
                let data = page.data();
                NodeView::new(&data, self.key_size).fields(mid)?.record_ptr
            };
            {
                let data = page.data();
                let view = NodeView::new(&data, self.key_size);
                let image: Vec<u8> = (mid + 1..count)
                    .map(|i| view.slot_bytes(i))
                    .collect::<Result<Vec<_>>>()?
                    .concat();
                let mut right_data = right_page.data_mut();
                let mut right_node = NodeViewMut::new(&mut right_data[..], self.key_size);
                right_node.set_ptr_down(mid_child)?;
                right_node.append_raw(&image)?;
            }
            // The promoted slot leaves both halves; its extended-key blob
            // goes with it (the parent re-encodes the separator).
            self.free_key_storage(pm, &page, mid)?;
            {
                let mut data = page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).truncate(count - mid)?;
            }
            let data = page.data();
            (separator, NodeView::new(&data, self.key_size).right_sibling()?)
        };

        // Stitch the sibling chain on this level.
        {
            let mut right_data = right_page.data_mut();
            let mut right_node = NodeViewMut::new(&mut right_data[..], self.key_size);
            right_node.set_left_sibling(node)?;
            right_node.set_right_sibling(old_right_sibling)?;
        }
        {
            let mut data = page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).set_right_sibling(right)?;
        }
        if old_right_sibling != 0 {
            let next = pm.fetch(old_right_sibling)?;
            let mut data = next.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).set_left_sibling(right)?;
        }

        Ok((separator, right))
    }

    /// Pushes a split's separator into the ancestors, splitting them as
    /// needed; a split that outgrows the recorded path creates a new root.
    fn propagate_split(
        &mut self,
        pm: &mut PageManager,
        mut path: Vec<(u64, usize)>,
        split_node: u64,
        separator: Vec<u8>,
        right: u64,
    ) -> Result<()> {
        let mut lower = split_node;
        let mut separator = separator;
        let mut right = right;

        while let Some((parent, _)) = path.pop() {
            let page = pm.fetch(parent)?;
            if self.key_count(&page)? < node_capacity(pm.page_size(), self.key_size) {
                return self.insert_separator(pm, parent, &separator, right);
            }

            drop(page);
            let (promoted, parent_right) = self.split_node(pm, parent)?;
            let target = if compare_keys(self.key_type, &separator, &promoted) == Ordering::Less
            {
                parent
            } else {
                parent_right
            };
            self.insert_separator(pm, target, &separator, right)?;

            lower = parent;
            separator = promoted;
            right = parent_right;
        }

        // The root itself split: grow the tree by one level.
        let new_root = Self::alloc_node(pm, self.key_size, false)?;
        {
            let page = pm.fetch(new_root)?;
            let mut data = page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).set_ptr_down(lower)?;
        }
        self.insert_separator(pm, new_root, &separator, right)?;
        self.root = new_root;
        Ok(())
    }

    /// Inserts a separator slot `{key, child}` into an internal node with
    /// free space.
    fn insert_separator(
        &self,
        pm: &mut PageManager,
        node: u64,
        separator: &[u8],
        child: u64,
    ) -> Result<()> {
        let page = pm.fetch(node)?;
        let (found, idx) = self.search_node(pm, &page, separator)?;
        debug_assert!(!found, "separator already present in parent");

        let (inline, extended) = self.encode_key(pm, separator)?;
        let fields = SlotFields {
            record_ptr: child,
            flags: if extended { SLOT_EXTENDED_KEY } else { 0 },
            inline_record_size: 0,
            key_size: separator.len() as u16,
        };
        let mut data = page.data_mut();
        NodeViewMut::new(&mut data[..], self.key_size).insert_slot(idx, fields, &inline)
    }

    // -- erase --------------------------------------------------------------

    /// Removes `key` (or one of its duplicates) and rebalances.
    pub fn erase(&mut self, pm: &mut PageManager, key: &[u8], mode: EraseMode) -> Result<()> {
        self.validate_key(key)?;

        let (path, leaf) = self.descend(pm, key)?;
        let page = pm.fetch(leaf)?;
        let (found, idx) = self.search_node(pm, &page, key)?;
        ensure!(found, ErrorKind::KeyNotFound);

        let fields = {
            let data = page.data();
            NodeView::new(&data, self.key_size).fields(idx)?
        };

        if let EraseMode::Duplicate(dup_index) = mode {
            if fields.flags & SLOT_DUPLICATES != 0 {
                let (table, remaining) = dup_erase(pm, fields.record_ptr, dup_index)?;
                if remaining > 0 {
                    let mut data = page.data_mut();
                    return NodeViewMut::new(&mut data[..], self.key_size)
                        .set_record(idx, table, fields.flags, 0);
                }
                // Last duplicate gone: drop the emptied table and the key.
                blob_free(pm, table)?;
            } else {
                ensure!(dup_index == 0, ErrorKind::KeyNotFound);
                self.free_record_storage(pm, fields)?;
            }
        } else {
            self.free_record_storage(pm, fields)?;
        }

        self.free_key_storage(pm, &page, idx)?;
        {
            let mut data = page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).remove_slot(idx)?;
        }
        drop(page);

        self.rebalance(pm, leaf, path)
    }

    /// Restores the occupancy invariant from `node` up to the root.
    fn rebalance(
        &mut self,
        pm: &mut PageManager,
        node: u64,
        mut path: Vec<(u64, usize)>,
    ) -> Result<()> {
        let mut node = node;
        loop {
            let Some(&(parent, child_idx)) = path.last() else {
                return self.collapse_root(pm, node);
            };

            let page = pm.fetch(node)?;
            let count = self.key_count(&page)?;
            if count >= merge_threshold(pm.page_size(), self.key_size) {
                return Ok(());
            }
            let leaf = self.is_leaf(&page)?;
            drop(page);

            let parent_page = pm.fetch(parent)?;
            let parent_children = self.key_count(&parent_page)? + 1;
            let threshold = merge_threshold(pm.page_size(), self.key_size);

            // Shift one slot from the left sibling when it can spare one.
            if child_idx > 0 {
                let left = self.child_at(&parent_page, child_idx - 1)?;
                let left_page = pm.fetch(left)?;
                if self.key_count(&left_page)? > threshold {
                    return self.shift_from_left(pm, parent, child_idx, left, node, leaf);
                }
            }

            // Then from the right sibling.
            if child_idx + 1 < parent_children {
                let right = self.child_at(&parent_page, child_idx + 1)?;
                let right_page = pm.fetch(right)?;
                if self.key_count(&right_page)? > threshold {
                    return self.shift_from_right(pm, parent, child_idx, node, right, leaf);
                }
            }

            // Merge, preferring the left sibling as the surviving node.
            drop(parent_page);
            if child_idx > 0 {
                let parent_page = pm.fetch(parent)?;
                let left = self.child_at(&parent_page, child_idx - 1)?;
                drop(parent_page);
                self.merge_nodes(pm, parent, child_idx - 1, left, node, leaf)?;
            } else {
                let parent_page = pm.fetch(parent)?;
                let right = self.child_at(&parent_page, child_idx + 1)?;
                drop(parent_page);
                self.merge_nodes(pm, parent, child_idx, node, right, leaf)?;
            }

            path.pop();
            node = parent;
        }
    }

    fn collapse_root(&mut self, pm: &mut PageManager, root: u64) -> Result<()> {
        let page = pm.fetch(root)?;
        if self.is_leaf(&page)? {
            return Ok(());
        }
        if self.key_count(&page)? == 0 {
            let only_child = self.child_at(&page, 0)?;
            drop(page);
            pm.free(root)?;
            self.root = only_child;
        }
        Ok(())
    }

    /// Replaces the separator key in `parent`'s slot `sep_idx`, keeping the
    /// child pointer.
    fn replace_separator(
        &self,
        pm: &mut PageManager,
        parent: u64,
        sep_idx: usize,
        new_key: &[u8],
    ) -> Result<()> {
        let page = pm.fetch(parent)?;
        self.free_key_storage(pm, &page, sep_idx)?;
        let child = {
            let data = page.data();
            NodeView::new(&data, self.key_size).fields(sep_idx)?.record_ptr
        };

        let (inline, extended) = self.encode_key(pm, new_key)?;
        let fields = SlotFields {
            record_ptr: child,
            flags: if extended { SLOT_EXTENDED_KEY } else { 0 },
            inline_record_size: 0,
            key_size: new_key.len() as u16,
        };
        let mut data = page.data_mut();
        NodeViewMut::new(&mut data[..], self.key_size).write_slot(sep_idx, fields, &inline)
    }

    fn shift_from_left(
        &mut self,
        pm: &mut PageManager,
        parent: u64,
        child_idx: usize,
        left: u64,
        node: u64,
        leaf: bool,
    ) -> Result<()> {
        let left_page = pm.fetch(left)?;
        let left_count = self.key_count(&left_page)?;
        let node_page = pm.fetch(node)?;

        if leaf {
            let image = {
                let data = left_page.data();
                NodeView::new(&data, self.key_size)
                    .slot_bytes(left_count - 1)?
                    .to_vec()
            };
            {
                let mut data = node_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).prepend_raw(&image)?;
            }
            {
                let mut data = left_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).truncate(1)?;
            }
            let new_first = self.key_at(pm, node, 0)?;
            self.replace_separator(pm, parent, child_idx - 1, &new_first)
        } else {
            // Rotate through the parent: the separator comes down, the left
            // sibling's last key goes up.
            let old_separator = self.key_at(pm, parent, child_idx - 1)?;
            let left_last_key = self.key_at(pm, left, left_count - 1)?;
            let left_last_child = {
                let data = left_page.data();
                NodeView::new(&data, self.key_size)
                    .fields(left_count - 1)?
                    .record_ptr
            };
            let old_ptr_down = {
                let data = node_page.data();
                NodeView::new(&data, self.key_size).ptr_down()?
            };

            let (inline, extended) = self.encode_key(pm, &old_separator)?;
            {
                let mut data = node_page.data_mut();
                let mut view = NodeViewMut::new(&mut data[..], self.key_size);
                view.insert_slot(
                    0,
                    SlotFields {
                        record_ptr: old_ptr_down,
                        flags: if extended { SLOT_EXTENDED_KEY } else { 0 },
                        inline_record_size: 0,
                        key_size: old_separator.len() as u16,
                    },
                    &inline,
                )?;
                view.set_ptr_down(left_last_child)?;
            }
            self.free_key_storage(pm, &left_page, left_count - 1)?;
            {
                let mut data = left_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).truncate(1)?;
            }
            self.replace_separator(pm, parent, child_idx - 1, &left_last_key)
        }
    }

    fn shift_from_right(
        &mut self,
        pm: &mut PageManager,
        parent: u64,
        child_idx: usize,
        node: u64,
        right: u64,
        leaf: bool,
    ) -> Result<()> {
        let right_page = pm.fetch(right)?;
        let node_page = pm.fetch(node)?;

        if leaf {
            let image = {
                let data = right_page.data();
                NodeView::new(&data, self.key_size).slot_bytes(0)?.to_vec()
            };
            {
                let mut data = node_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).append_raw(&image)?;
            }
            {
                let mut data = right_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).remove_slot(0)?;
            }
            let new_first = self.key_at(pm, right, 0)?;
            self.replace_separator(pm, parent, child_idx, &new_first)
        } else {
            let old_separator = self.key_at(pm, parent, child_idx)?;
            let right_first_key = self.key_at(pm, right, 0)?;
            let right_first_child = {
                let data = right_page.data();
                NodeView::new(&data, self.key_size).fields(0)?.record_ptr
            };
            let right_ptr_down = {
                let data = right_page.data();
                NodeView::new(&data, self.key_size).ptr_down()?
            };

            let (inline, extended) = self.encode_key(pm, &old_separator)?;
            {
                let node_count = self.key_count(&node_page)?;
                let mut data = node_page.data_mut();
                NodeViewMut::new(&mut data[..], self.key_size).insert_slot(
                    node_count,
                    SlotFields {
                        record_ptr: right_ptr_down,
                        flags: if extended { SLOT_EXTENDED_KEY } else { 0 },
                        inline_record_size: 0,
                        key_size: old_separator.len() as u16,
                    },
                    &inline,
                )?;
            }
            self.free_key_storage(pm, &right_page, 0)?;
            {
                let mut data = right_page.data_mut();
                let mut view = NodeViewMut::new(&mut data[..], self.key_size);
                view.set_ptr_down(right_first_child)?;
                view.remove_slot(0)?;
            }
            self.replace_separator(pm, parent, child_idx, &right_first_key)
        }
    }

    /// Merges `right_node` into `left_node`; `sep_idx` is the parent slot
    /// separating the two. The parent loses that slot, which may propagate
    /// the underflow.
    fn merge_nodes(
        &mut self,
        pm: &mut PageManager,
        parent: u64,
        sep_idx: usize,
        left_node: u64,
        right_node: u64,
        leaf: bool,
    ) -> Result<()> {
        let left_page = pm.fetch(left_node)?;
        let right_page = pm.fetch(right_node)?;

        if !leaf {
            // The separator comes down between the two children arrays.
            let separator = self.key_at(pm, parent, sep_idx)?;
            let right_ptr_down = {
                let data = right_page.data();
                NodeView::new(&data, self.key_size).ptr_down()?
            };
            let (inline, extended) = self.encode_key(pm, &separator)?;
            let left_count = self.key_count(&left_page)?;
            let mut data = left_page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).insert_slot(
                left_count,
                SlotFields {
                    record_ptr: right_ptr_down,
                    flags: if extended { SLOT_EXTENDED_KEY } else { 0 },
                    inline_record_size: 0,
                    key_size: separator.len() as u16,
                },
                &inline,
            )?;
        }

        {
            let image = {
                let data = right_page.data();
                let view = NodeView::new(&data, self.key_size);
                (0..view.key_count()?)
                    .map(|i| view.slot_bytes(i))
                    .collect::<Result<Vec<_>>>()?
                    .concat()
            };
            let mut data = left_page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).append_raw(&image)?;
        }

        // Unlink the right node from its level.
        let right_right = {
            let data = right_page.data();
            NodeView::new(&data, self.key_size).right_sibling()?
        };
        {
            let mut data = left_page.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).set_right_sibling(right_right)?;
        }
        if right_right != 0 {
            let next = pm.fetch(right_right)?;
            let mut data = next.data_mut();
            NodeViewMut::new(&mut data[..], self.key_size).set_left_sibling(left_node)?;
        }

        drop(right_page);
        pm.free(right_node)?;

        // Remove the separator from the parent.
        let parent_page = pm.fetch(parent)?;
        self.free_key_storage(pm, &parent_page, sep_idx)?;
        let mut data = parent_page.data_mut();
        NodeViewMut::new(&mut data[..], self.key_size).remove_slot(sep_idx)
    }

    // -- enumeration --------------------------------------------------------

    /// Visits nodes in leaf order along the sibling chains. With
    /// `include_internal`, every internal level is walked leftmost→right
    /// before descending.
    pub fn enumerate(
        &self,
        pm: &mut PageManager,
        visitor: &mut dyn BtreeVisitor,
        include_internal: bool,
    ) -> Result<()> {
        let mut level_start = self.root;
        loop {
            let page = pm.fetch(level_start)?;
            if self.is_leaf(&page)? {
                break;
            }
            if include_internal {
                let mut current = level_start;
                while current != 0 {
                    let page = pm.fetch(current)?;
                    let count = self.key_count(&page)?;
                    visitor.visit_node(current, false, count)?;
                    let data = page.data();
                    current = NodeView::new(&data, self.key_size).right_sibling()?;
                }
            }
            level_start = self.child_at(&page, 0)?;
        }

        let mut current = level_start;
        while current != 0 {
            let page = pm.fetch(current)?;
            let count = self.key_count(&page)?;
            visitor.visit_node(current, true, count)?;
            for i in 0..count {
                let key = self.key_at(pm, current, i)?;
                let dups = self.dup_count_at(pm, current, i)?;
                visitor.visit_key(&key, dups)?;
            }
            let data = page.data();
            current = NodeView::new(&data, self.key_size).right_sibling()?;
        }
        Ok(())
    }

    /// Total number of records (duplicates counted individually).
    pub fn key_count_total(&self, pm: &mut PageManager, skip_duplicates: bool) -> Result<u64> {
        struct Counter {
            total: u64,
            skip_duplicates: bool,
        }
        impl BtreeVisitor for Counter {
            fn visit_key(&mut self, _key: &[u8], dup_count: u32) -> Result<()> {
                self.total += if self.skip_duplicates { 1 } else { dup_count as u64 };
                Ok(())
            }
        }
        let mut counter = Counter {
            total: 0,
            skip_duplicates,
        };
        self.enumerate(pm, &mut counter, false)?;
        Ok(counter.total)
    }

    /// Pages reachable from this tree's root: nodes, extended-key blobs,
    /// record blobs and duplicate tables (with their spilled records).
    pub fn reachable_pages(&self, pm: &mut PageManager) -> Result<u64> {
        let mut total = 0u64;

        // Nodes, level by level.
        let mut level_start = self.root;
        loop {
            let mut current = level_start;
            let mut leaf = false;
            while current != 0 {
                let page = pm.fetch(current)?;
                total += 1;
                leaf = self.is_leaf(&page)?;
                let data = page.data();
                current = NodeView::new(&data, self.key_size).right_sibling()?;
            }
            if leaf {
                break;
            }
            let page = pm.fetch(level_start)?;
            level_start = self.child_at(&page, 0)?;
        }

        // Slot payloads, every level.
        let mut level_start = self.root;
        loop {
            let mut current = level_start;
            let mut leaf = false;
            while current != 0 {
                let page = pm.fetch(current)?;
                leaf = self.is_leaf(&page)?;
                let count = self.key_count(&page)?;
                for i in 0..count {
                    let (fields, ext_offset) = {
                        let data = page.data();
                        let view = NodeView::new(&data, self.key_size);
                        let fields = view.fields(i)?;
                        let ext = if fields.flags & SLOT_EXTENDED_KEY != 0 {
                            view.extended_key_offset(i)?
                        } else {
                            0
                        };
                        (fields, ext)
                    };
                    if ext_offset != 0 {
                        total += blob_page_count(pm, ext_offset)?;
                    }
                    if leaf {
                        if fields.flags & SLOT_DUPLICATES != 0 {
                            total += blob_page_count(pm, fields.record_ptr)?;
                            let n = dup_count(pm, fields.record_ptr)?;
                            for d in 0..n {
                                if let Some(blob) = dup_entry_blob(pm, fields.record_ptr, d)? {
                                    total += blob_page_count(pm, blob)?;
                                }
                            }
                        } else if fields.flags & SLOT_RECORD_INLINE == 0 {
                            total += blob_page_count(pm, fields.record_ptr)?;
                        }
                    }
                }
                let data = page.data();
                current = NodeView::new(&data, self.key_size).right_sibling()?;
            }
            if leaf {
                break;
            }
            let page = pm.fetch(level_start)?;
            level_start = self.child_at(&page, 0)?;
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::storage::IGNORE_FREELIST;

    const PAGE_SIZE: usize = 256;
    const KEY_SIZE: u16 = 16;

    fn manager() -> PageManager {
        let mut pm = PageManager::new(Box::new(MemoryDevice::new()), PAGE_SIZE, 128).unwrap();
        pm.alloc(PageType::Header, IGNORE_FREELIST).unwrap();
        pm
    }

    fn tree(pm: &mut PageManager, dup_enabled: bool) -> BtreeIndex {
        BtreeIndex::create(pm, KEY_SIZE, KeyType::Binary, dup_enabled).unwrap()
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:05}", i).into_bytes()
    }

    fn record(i: u32) -> Vec<u8> {
        format!("rec{:05}", i).into_bytes()
    }

    fn kind(err: &eyre::Report) -> Option<ErrorKind> {
        ErrorKind::of(err)
    }

    #[test]
    fn create_rejects_hopeless_key_sizes() {
        let mut pm = manager();
        let err = BtreeIndex::create(&mut pm, 200, KeyType::Binary, false).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::InvKeySize));
    }

    #[test]
    fn empty_tree_find_fails() {
        let mut pm = manager();
        let tree = tree(&mut pm, false);
        let err = tree.find(&mut pm, b"absent").unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 0);
    }

    #[test]
    fn zero_length_keys_are_rejected() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        let err = tree.insert(&mut pm, b"", b"x", 0, None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::InvKeySize));
        let err = tree.erase(&mut pm, b"", EraseMode::All).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::InvKeySize));
    }

    #[test]
    fn insert_and_find_across_splits() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        let initial_root = tree.root();

        for i in 0..60 {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }
        assert_ne!(tree.root(), initial_root, "60 keys never fit one node");

        for i in 0..60 {
            let (leaf, slot) = tree.find(&mut pm, &key(i)).unwrap();
            assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), record(i));
        }
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 60);
    }

    #[test]
    fn reverse_insertion_keeps_order() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in (0..40).rev() {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }

        struct Collect(Vec<Vec<u8>>);
        impl BtreeVisitor for Collect {
            fn visit_key(&mut self, key: &[u8], _dup_count: u32) -> Result<()> {
                self.0.push(key.to_vec());
                Ok(())
            }
        }
        let mut collect = Collect(Vec::new());
        tree.enumerate(&mut pm, &mut collect, false).unwrap();

        assert_eq!(collect.0.len(), 40);
        for pair in collect.0.windows(2) {
            assert!(pair[0] < pair[1], "enumeration out of order");
        }
    }

    #[test]
    fn plain_insert_fails_on_existing_key() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        tree.insert(&mut pm, b"alpha", b"one", 0, None).unwrap();

        let err = tree.insert(&mut pm, b"alpha", b"two", 0, None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::DuplicateKey));
    }

    #[test]
    fn overwrite_replaces_record() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        tree.insert(&mut pm, b"alpha", b"one", 0, None).unwrap();
        tree.insert(&mut pm, b"alpha", b"two", OVERWRITE, None).unwrap();

        let (leaf, slot) = tree.find(&mut pm, b"alpha").unwrap();
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), b"two");
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 1);
    }

    #[test]
    fn large_records_round_trip_through_blobs() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        let big: Vec<u8> = (0..2000u32).map(|i| (i % 240) as u8).collect();

        tree.insert(&mut pm, b"big", &big, 0, None).unwrap();
        let (leaf, slot) = tree.find(&mut pm, b"big").unwrap();
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), big);

        // Overwrite with a small record releases the chain.
        let before = pm.free_page_count().unwrap();
        tree.insert(&mut pm, b"big", b"tiny", OVERWRITE, None).unwrap();
        assert!(pm.free_page_count().unwrap() > before);
        let (leaf, slot) = tree.find(&mut pm, b"big").unwrap();
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), b"tiny");
    }

    #[test]
    fn extended_keys_compare_past_the_prefix() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);

        // All keys share the whole inline prefix area; only the spilled
        // tail differs, forcing full-key fetches during search.
        let make = |i: u32| {
            let mut k = vec![b'p'; KEY_SIZE as usize];
            k.extend_from_slice(format!("tail{:04}", i).as_bytes());
            k
        };
        for i in 0..12 {
            tree.insert(&mut pm, &make(i), &record(i), 0, None).unwrap();
        }
        for i in 0..12 {
            let (leaf, slot) = tree.find(&mut pm, &make(i)).unwrap();
            assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), record(i));
            assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), make(i));
        }

        let err = tree.find(&mut pm, &make(99)).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));

        tree.erase(&mut pm, &make(5), EraseMode::All).unwrap();
        let err = tree.find(&mut pm, &make(5)).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 11);
    }

    #[test]
    fn erase_everything_ascending_collapses_to_leaf_root() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in 0..50 {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }

        for i in 0..50 {
            tree.erase(&mut pm, &key(i), EraseMode::All).unwrap();
            let err = tree.find(&mut pm, &key(i)).unwrap_err();
            assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
        }

        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 0);
        let page = pm.fetch(tree.root()).unwrap();
        let data = page.data();
        assert!(NodeView::new(&data, KEY_SIZE).is_leaf().unwrap());
    }

    #[test]
    fn erase_everything_descending() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in 0..50 {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }
        for i in (0..50).rev() {
            tree.erase(&mut pm, &key(i), EraseMode::All).unwrap();
        }
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 0);
    }

    #[test]
    fn interleaved_erase_keeps_survivors_findable() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in 0..60 {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }
        for i in (0..60).step_by(2) {
            tree.erase(&mut pm, &key(i), EraseMode::All).unwrap();
        }
        for i in 0..60 {
            let result = tree.find(&mut pm, &key(i));
            if i % 2 == 0 {
                assert_eq!(kind(&result.unwrap_err()), Some(ErrorKind::KeyNotFound));
            } else {
                let (leaf, slot) = result.unwrap();
                assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), record(i));
            }
        }
    }

    #[test]
    fn no_pages_leak_through_fill_and_drain() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in 0..40 {
            tree.insert(&mut pm, &key(i), &vec![i as u8; 500], 0, None).unwrap();
        }
        for i in 0..40 {
            tree.erase(&mut pm, &key(i), EraseMode::All).unwrap();
        }

        let total = pm.total_pages();
        let free = pm.free_page_count().unwrap();
        let reachable = tree.reachable_pages(&mut pm).unwrap();
        // Header page + freelist + the tree account for the whole file.
        assert_eq!(total, 1 + free + reachable);
        assert_eq!(reachable, 1, "only the empty root remains");
    }

    #[test]
    fn duplicates_append_and_erase() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, true);

        tree.insert(&mut pm, b"dup", b"one", 0, None).unwrap();
        tree.insert(&mut pm, b"dup", b"two", DUPLICATE, None).unwrap();
        tree.insert(&mut pm, b"dup", b"three", DUPLICATE, None).unwrap();

        let (leaf, slot) = tree.find(&mut pm, b"dup").unwrap();
        assert_eq!(tree.dup_count_at(&mut pm, leaf, slot).unwrap(), 3);
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), b"one");
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 1).unwrap(), b"two");
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 2).unwrap(), b"three");
        assert_eq!(tree.key_count_total(&mut pm, false).unwrap(), 3);
        assert_eq!(tree.key_count_total(&mut pm, true).unwrap(), 1);

        tree.erase(&mut pm, b"dup", EraseMode::Duplicate(1)).unwrap();
        let (leaf, slot) = tree.find(&mut pm, b"dup").unwrap();
        assert_eq!(tree.dup_count_at(&mut pm, leaf, slot).unwrap(), 2);
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 1).unwrap(), b"three");

        // Erasing the remaining duplicates removes the key itself.
        tree.erase(&mut pm, b"dup", EraseMode::Duplicate(0)).unwrap();
        tree.erase(&mut pm, b"dup", EraseMode::Duplicate(0)).unwrap();
        let err = tree.find(&mut pm, b"dup").unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn duplicate_flag_requires_database_support() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        tree.insert(&mut pm, b"k", b"v", 0, None).unwrap();
        let err = tree.insert(&mut pm, b"k", b"w", DUPLICATE, None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::InvParameter));
    }

    #[test]
    fn approximate_lookups() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in [10u32, 20, 30, 40] {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }

        let (leaf, slot) = tree.lookup_ge(&mut pm, &key(15)).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), key(20));

        let (leaf, slot) = tree.lookup_le(&mut pm, &key(15)).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), key(10));

        let (leaf, slot) = tree.lookup_ge(&mut pm, &key(20)).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), key(20));

        assert!(tree.lookup_ge(&mut pm, &key(45)).unwrap().is_none());
        assert!(tree.lookup_le(&mut pm, &key(5)).unwrap().is_none());

        let (leaf, slot) = tree.first(&mut pm).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), key(10));
        let (leaf, slot) = tree.last(&mut pm).unwrap().unwrap();
        assert_eq!(tree.key_at(&mut pm, leaf, slot).unwrap(), key(40));
    }

    #[test]
    fn u64_keys_compare_numerically() {
        let mut pm = manager();
        let mut tree = BtreeIndex::create(&mut pm, 8, KeyType::U64, false).unwrap();

        for value in [300u64, 2, 70000, 1, 256] {
            tree.insert(&mut pm, &value.to_le_bytes(), &value.to_le_bytes(), 0, None)
                .unwrap();
        }

        struct Collect(Vec<u64>);
        impl BtreeVisitor for Collect {
            fn visit_key(&mut self, key: &[u8], _dup_count: u32) -> Result<()> {
                self.0.push(u64::from_le_bytes(key.try_into().unwrap()));
                Ok(())
            }
        }
        let mut collect = Collect(Vec::new());
        tree.enumerate(&mut pm, &mut collect, false).unwrap();
        assert_eq!(collect.0, vec![1, 2, 256, 300, 70000]);

        let err = tree.insert(&mut pm, b"short", b"x", 0, None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::InvKeySize));
    }

    #[test]
    fn enumerate_includes_internal_levels_first() {
        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        for i in 0..60 {
            tree.insert(&mut pm, &key(i), &record(i), 0, None).unwrap();
        }

        struct Nodes {
            internal_seen: usize,
            leaves_seen: usize,
            leaf_before_internal: bool,
        }
        impl BtreeVisitor for Nodes {
            fn visit_node(&mut self, _offset: u64, is_leaf: bool, _count: usize) -> Result<()> {
                if is_leaf {
                    self.leaves_seen += 1;
                } else {
                    if self.leaves_seen > 0 {
                        self.leaf_before_internal = true;
                    }
                    self.internal_seen += 1;
                }
                Ok(())
            }
        }
        let mut nodes = Nodes {
            internal_seen: 0,
            leaves_seen: 0,
            leaf_before_internal: false,
        };
        tree.enumerate(&mut pm, &mut nodes, true).unwrap();

        assert!(nodes.internal_seen >= 1);
        assert!(nodes.leaves_seen >= 2);
        assert!(!nodes.leaf_before_internal, "levels must be visited top-down");
    }

    #[test]
    fn compressed_records_round_trip() {
        use crate::compress::RleCompressor;

        let mut pm = manager();
        let mut tree = tree(&mut pm, false);
        tree.set_compressor(Some(Arc::new(RleCompressor)));

        let compressible = vec![0xAA; 3000];
        tree.insert(&mut pm, b"zip", &compressible, 0, None).unwrap();

        // The run drops to a handful of pairs, so the chain stays short.
        let pages = pm.total_pages();
        assert!(pages < 10, "compressed record used {} pages", pages);

        let (leaf, slot) = tree.find(&mut pm, b"zip").unwrap();
        assert_eq!(tree.record_at(&mut pm, leaf, slot, 0).unwrap(), compressible);
    }
}
