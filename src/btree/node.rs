//! # B-tree Node Layout
//!
//! A B-tree node occupies exactly one page. After the 12-byte persisted page
//! header comes the node header, followed by a packed array of fixed-width
//! key slots. Fixed-width slots trade some space for O(1) slot addressing
//! and branch-free binary search; keys longer than the inline capacity
//! spill into a blob chain ("extended" keys).
//!
//! ## Node Header Layout (28 bytes, at offset 12)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       2     flags          Bit 0: leaf node
//! 2       2     key_count      Number of occupied slots
//! 4       8     ptr_down       Leftmost child (internal nodes, else 0)
//! 12      8     left_sibling   Previous node on this level (0 = none)
//! 20      8     right_sibling  Next node on this level (0 = none)
//! ```
//!
//! ## Slot Layout (12 + key_size bytes)
//!
//! ```text
//! Offset  Size      Field               Description
//! ------  --------  ------------------  ------------------------------
//! 0       8         record_ptr          Inline record bytes, blob
//!                                       offset, dup-table offset, or
//!                                       child pointer (internal nodes)
//! 8       1         slot_flags          EXTENDED_KEY | DUPLICATES |
//!                                       RECORD_INLINE
//! 9       1         inline_record_size  Valid when RECORD_INLINE
//! 10      2         key_size            Full key length in bytes
//! 12      key_size  inline key bytes
//! ```
//!
//! For an extended key the inline area holds the first `capacity - 8`
//! bytes of the key as a comparison prefix and the trailing 8 bytes hold
//! the little-endian blob offset of the complete key.
//!
//! This module is layout only: it addresses, moves and rewrites slots but
//! never interprets keys or descends the tree. Key semantics live in
//! [`super::tree`]; blob indirection lives in [`super::blob`].

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::{parse_zerocopy, parse_zerocopy_mut, PERSISTED_HEADER_SIZE};

pub const NODE_HEADER_SIZE: usize = 28;
pub const SLOT_FIXED_SIZE: usize = 12;

/// Byte offset of the first slot inside a node page.
pub const SLOTS_OFFSET: usize = PERSISTED_HEADER_SIZE + NODE_HEADER_SIZE;

pub const NODE_FLAG_LEAF: u16 = 1 << 0;

pub const SLOT_EXTENDED_KEY: u8 = 1 << 0;
pub const SLOT_DUPLICATES: u8 = 1 << 1;
pub const SLOT_RECORD_INLINE: u8 = 1 << 2;

/// Number of slots a node can hold.
pub fn node_capacity(page_size: usize, key_size: u16) -> usize {
    (page_size - SLOTS_OFFSET) / slot_width(key_size)
}

/// Slots below this occupancy trigger the shift/merge protocol.
pub fn merge_threshold(page_size: usize, key_size: u16) -> usize {
    node_capacity(page_size, key_size) / 2
}

pub fn slot_width(key_size: u16) -> usize {
    SLOT_FIXED_SIZE + key_size as usize
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct NodeHeader {
    flags: U16,
    key_count: U16,
    ptr_down: U64,
    left_sibling: U64,
    right_sibling: U64,
}

const _: () = assert!(size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// The fields of a slot apart from its inline key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFields {
    pub record_ptr: u64,
    pub flags: u8,
    pub inline_record_size: u8,
    pub key_size: u16,
}

/// Read-only view over a node page.
pub struct NodeView<'a> {
    data: &'a [u8],
    key_size: u16,
}

impl<'a> NodeView<'a> {
    pub fn new(data: &'a [u8], key_size: u16) -> Self {
        Self { data, key_size }
    }

    fn header(&self) -> Result<&NodeHeader> {
        parse_zerocopy::<NodeHeader>(&self.data[PERSISTED_HEADER_SIZE..], "NodeHeader")
    }

    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.header()?.flags.get() & NODE_FLAG_LEAF != 0)
    }

    pub fn key_count(&self) -> Result<usize> {
        Ok(self.header()?.key_count.get() as usize)
    }

    pub fn ptr_down(&self) -> Result<u64> {
        Ok(self.header()?.ptr_down.get())
    }

    pub fn left_sibling(&self) -> Result<u64> {
        Ok(self.header()?.left_sibling.get())
    }

    pub fn right_sibling(&self) -> Result<u64> {
        Ok(self.header()?.right_sibling.get())
    }

    pub fn capacity(&self) -> usize {
        node_capacity(self.data.len(), self.key_size)
    }

    fn slot_start(&self, index: usize) -> usize {
        SLOTS_OFFSET + index * slot_width(self.key_size)
    }

    pub fn slot_bytes(&self, index: usize) -> Result<&'a [u8]> {
        ensure!(
            index < self.key_count()?,
            "slot {} out of bounds (key_count={})",
            index,
            self.key_count()?
        );
        let start = self.slot_start(index);
        Ok(&self.data[start..start + slot_width(self.key_size)])
    }

    pub fn fields(&self, index: usize) -> Result<SlotFields> {
        let slot = self.slot_bytes(index)?;
        Ok(SlotFields {
            record_ptr: u64::from_le_bytes(slot[0..8].try_into().expect("8-byte ptr")),
            flags: slot[8],
            inline_record_size: slot[9],
            key_size: u16::from_le_bytes(slot[10..12].try_into().expect("2-byte size")),
        })
    }

    /// The stored inline bytes of the key: the whole key for ordinary
    /// slots, the comparison prefix for extended ones.
    pub fn inline_key(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_bytes(index)?;
        let fields = self.fields(index)?;
        if fields.flags & SLOT_EXTENDED_KEY != 0 {
            Ok(&slot[SLOT_FIXED_SIZE..SLOT_FIXED_SIZE + self.key_size as usize - 8])
        } else {
            Ok(&slot[SLOT_FIXED_SIZE..SLOT_FIXED_SIZE + fields.key_size as usize])
        }
    }

    /// The blob offset holding the full bytes of an extended key.
    pub fn extended_key_offset(&self, index: usize) -> Result<u64> {
        let slot = self.slot_bytes(index)?;
        let tail = SLOT_FIXED_SIZE + self.key_size as usize - 8;
        Ok(u64::from_le_bytes(
            slot[tail..tail + 8].try_into().expect("8-byte offset"),
        ))
    }

    /// Binary search over the slots. `compare(i)` orders the search key
    /// against slot `i`. Returns `(found, index)` where `index` is the
    /// first slot ordering greater than the key (the insertion point).
    pub fn search<F>(&self, mut compare: F) -> Result<(bool, usize)>
    where
        F: FnMut(usize) -> Result<std::cmp::Ordering>,
    {
        use std::cmp::Ordering;

        let mut lo = 0usize;
        let mut hi = self.key_count()?;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare(mid)? {
                Ordering::Equal => return Ok((true, mid)),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        Ok((false, lo))
    }
}

/// Mutable view over a node page.
pub struct NodeViewMut<'a> {
    data: &'a mut [u8],
    key_size: u16,
}

impl<'a> NodeViewMut<'a> {
    pub fn new(data: &'a mut [u8], key_size: u16) -> Self {
        Self { data, key_size }
    }

    /// Formats the node area of a fresh page.
    pub fn init(data: &'a mut [u8], key_size: u16, leaf: bool) -> Result<Self> {
        let header =
            parse_zerocopy_mut::<NodeHeader>(&mut data[PERSISTED_HEADER_SIZE..], "NodeHeader")?;
        header.flags = U16::new(if leaf { NODE_FLAG_LEAF } else { 0 });
        header.key_count = U16::new(0);
        header.ptr_down = U64::new(0);
        header.left_sibling = U64::new(0);
        header.right_sibling = U64::new(0);
        Ok(Self { data, key_size })
    }

    pub fn view(&self) -> NodeView<'_> {
        NodeView::new(self.data, self.key_size)
    }

    fn header_mut(&mut self) -> Result<&mut NodeHeader> {
        parse_zerocopy_mut::<NodeHeader>(&mut self.data[PERSISTED_HEADER_SIZE..], "NodeHeader")
    }

    pub fn set_leaf(&mut self, leaf: bool) -> Result<()> {
        let header = self.header_mut()?;
        let flags = if leaf {
            header.flags.get() | NODE_FLAG_LEAF
        } else {
            header.flags.get() & !NODE_FLAG_LEAF
        };
        header.flags = U16::new(flags);
        Ok(())
    }

    pub fn set_key_count(&mut self, count: usize) -> Result<()> {
        self.header_mut()?.key_count = U16::new(count as u16);
        Ok(())
    }

    pub fn set_ptr_down(&mut self, offset: u64) -> Result<()> {
        self.header_mut()?.ptr_down = U64::new(offset);
        Ok(())
    }

    pub fn set_left_sibling(&mut self, offset: u64) -> Result<()> {
        self.header_mut()?.left_sibling = U64::new(offset);
        Ok(())
    }

    pub fn set_right_sibling(&mut self, offset: u64) -> Result<()> {
        self.header_mut()?.right_sibling = U64::new(offset);
        Ok(())
    }

    fn slot_start(&self, index: usize) -> usize {
        SLOTS_OFFSET + index * slot_width(self.key_size)
    }

    fn width(&self) -> usize {
        slot_width(self.key_size)
    }

    /// Inserts a slot at `index`, shifting later slots right. `inline` is
    /// the exact byte string stored in the key area (whole key or
    /// prefix+blob-offset for extended keys).
    pub fn insert_slot(&mut self, index: usize, fields: SlotFields, inline: &[u8]) -> Result<()> {
        let count = self.view().key_count()?;
        let capacity = self.view().capacity();
        ensure!(count < capacity, "insert into full node (capacity={})", capacity);
        ensure!(index <= count, "slot index {} out of bounds ({})", index, count);
        ensure!(
            inline.len() <= self.key_size as usize,
            "inline key of {} bytes exceeds slot capacity {}",
            inline.len(),
            self.key_size
        );

        let w = self.width();
        let start = self.slot_start(index);
        let end = self.slot_start(count);
        self.data.copy_within(start..end, start + w);

        self.write_slot_unchecked(index, fields, inline);
        self.set_key_count(count + 1)
    }

    /// Removes the slot at `index`, shifting later slots left.
    pub fn remove_slot(&mut self, index: usize) -> Result<()> {
        let count = self.view().key_count()?;
        ensure!(index < count, "slot index {} out of bounds ({})", index, count);

        let w = self.width();
        let start = self.slot_start(index);
        let end = self.slot_start(count);
        self.data.copy_within(start + w..end, start);
        self.set_key_count(count - 1)
    }

    /// Rewrites the slot at `index` in place.
    pub fn write_slot(&mut self, index: usize, fields: SlotFields, inline: &[u8]) -> Result<()> {
        let count = self.view().key_count()?;
        ensure!(index < count, "slot index {} out of bounds ({})", index, count);
        ensure!(
            inline.len() <= self.key_size as usize,
            "inline key of {} bytes exceeds slot capacity {}",
            inline.len(),
            self.key_size
        );
        self.write_slot_unchecked(index, fields, inline);
        Ok(())
    }

    fn write_slot_unchecked(&mut self, index: usize, fields: SlotFields, inline: &[u8]) {
        let start = self.slot_start(index);
        let w = self.width();
        let slot = &mut self.data[start..start + w];
        slot[0..8].copy_from_slice(&fields.record_ptr.to_le_bytes());
        slot[8] = fields.flags;
        slot[9] = fields.inline_record_size;
        slot[10..12].copy_from_slice(&fields.key_size.to_le_bytes());
        slot[SLOT_FIXED_SIZE..].fill(0);
        slot[SLOT_FIXED_SIZE..SLOT_FIXED_SIZE + inline.len()].copy_from_slice(inline);
    }

    /// Updates only the record fields of a slot, leaving the key bytes.
    pub fn set_record(&mut self, index: usize, record_ptr: u64, flags: u8, inline_record_size: u8) -> Result<()> {
        let count = self.view().key_count()?;
        ensure!(index < count, "slot index {} out of bounds ({})", index, count);
        let start = self.slot_start(index);
        self.data[start..start + 8].copy_from_slice(&record_ptr.to_le_bytes());
        self.data[start + 8] = flags;
        self.data[start + 9] = inline_record_size;
        Ok(())
    }

    /// Appends raw slot images (from another node of the same database) and
    /// bumps the key count.
    pub fn append_raw(&mut self, slots: &[u8]) -> Result<()> {
        let w = self.width();
        ensure!(slots.len() % w == 0, "raw slot image not a multiple of slot width");
        let n = slots.len() / w;
        let count = self.view().key_count()?;
        ensure!(
            count + n <= self.view().capacity(),
            "append of {} slots overflows node ({} of {})",
            n,
            count,
            self.view().capacity()
        );

        let start = self.slot_start(count);
        self.data[start..start + slots.len()].copy_from_slice(slots);
        self.set_key_count(count + n)
    }

    /// Inserts raw slot images at the front, shifting existing slots right.
    pub fn prepend_raw(&mut self, slots: &[u8]) -> Result<()> {
        let w = self.width();
        ensure!(slots.len() % w == 0, "raw slot image not a multiple of slot width");
        let n = slots.len() / w;
        let count = self.view().key_count()?;
        ensure!(
            count + n <= self.view().capacity(),
            "prepend of {} slots overflows node ({} of {})",
            n,
            count,
            self.view().capacity()
        );

        let start = self.slot_start(0);
        let end = self.slot_start(count);
        self.data.copy_within(start..end, start + slots.len());
        self.data[start..start + slots.len()].copy_from_slice(slots);
        self.set_key_count(count + n)
    }

    /// Drops the trailing `n` slots.
    pub fn truncate(&mut self, n: usize) -> Result<()> {
        let count = self.view().key_count()?;
        ensure!(n <= count, "truncate of {} slots exceeds key count {}", n, count);
        self.set_key_count(count - n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 256;
    const KEY_SIZE: u16 = 16;

    fn leaf_page() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        NodeViewMut::init(&mut data, KEY_SIZE, true).unwrap();
        data
    }

    fn fields(record_ptr: u64, key_size: u16) -> SlotFields {
        SlotFields {
            record_ptr,
            flags: SLOT_RECORD_INLINE,
            inline_record_size: 0,
            key_size,
        }
    }

    #[test]
    fn capacity_math() {
        // (256 - 40) / (12 + 16)
        assert_eq!(node_capacity(PAGE_SIZE, KEY_SIZE), 7);
        assert_eq!(merge_threshold(PAGE_SIZE, KEY_SIZE), 3);
    }

    #[test]
    fn init_produces_empty_leaf() {
        let data = leaf_page();
        let view = NodeView::new(&data, KEY_SIZE);
        assert!(view.is_leaf().unwrap());
        assert_eq!(view.key_count().unwrap(), 0);
        assert_eq!(view.ptr_down().unwrap(), 0);
        assert_eq!(view.right_sibling().unwrap(), 0);
    }

    #[test]
    fn insert_keeps_slot_order() {
        let mut data = leaf_page();
        let mut node = NodeViewMut::new(&mut data, KEY_SIZE);

        node.insert_slot(0, fields(1, 3), b"bbb").unwrap();
        node.insert_slot(0, fields(2, 3), b"aaa").unwrap();
        node.insert_slot(2, fields(3, 3), b"ccc").unwrap();

        let view = NodeView::new(&data, KEY_SIZE);
        assert_eq!(view.key_count().unwrap(), 3);
        assert_eq!(view.inline_key(0).unwrap(), b"aaa");
        assert_eq!(view.inline_key(1).unwrap(), b"bbb");
        assert_eq!(view.inline_key(2).unwrap(), b"ccc");
        assert_eq!(view.fields(1).unwrap().record_ptr, 1);
    }

    #[test]
    fn remove_shifts_left() {
        let mut data = leaf_page();
        let mut node = NodeViewMut::new(&mut data, KEY_SIZE);
        node.insert_slot(0, fields(1, 1), b"a").unwrap();
        node.insert_slot(1, fields(2, 1), b"b").unwrap();
        node.insert_slot(2, fields(3, 1), b"c").unwrap();

        node.remove_slot(1).unwrap();

        let view = NodeView::new(&data, KEY_SIZE);
        assert_eq!(view.key_count().unwrap(), 2);
        assert_eq!(view.inline_key(0).unwrap(), b"a");
        assert_eq!(view.inline_key(1).unwrap(), b"c");
    }

    #[test]
    fn insert_rejects_overflow() {
        let mut data = leaf_page();
        let mut node = NodeViewMut::new(&mut data, KEY_SIZE);
        for i in 0..node_capacity(PAGE_SIZE, KEY_SIZE) {
            node.insert_slot(i, fields(i as u64, 1), b"k").unwrap();
        }
        assert!(node.insert_slot(0, fields(99, 1), b"x").is_err());
    }

    #[test]
    fn raw_moves_between_nodes() {
        let mut left = leaf_page();
        let mut right = leaf_page();

        {
            let mut node = NodeViewMut::new(&mut left, KEY_SIZE);
            node.insert_slot(0, fields(1, 1), b"a").unwrap();
            node.insert_slot(1, fields(2, 1), b"b").unwrap();
            node.insert_slot(2, fields(3, 1), b"c").unwrap();
        }

        // Move the two trailing slots to the right node.
        let w = slot_width(KEY_SIZE);
        let image = {
            let start = SLOTS_OFFSET + w;
            left[start..start + 2 * w].to_vec()
        };
        NodeViewMut::new(&mut right, KEY_SIZE).append_raw(&image).unwrap();
        NodeViewMut::new(&mut left, KEY_SIZE).truncate(2).unwrap();

        let lv = NodeView::new(&left, KEY_SIZE);
        let rv = NodeView::new(&right, KEY_SIZE);
        assert_eq!(lv.key_count().unwrap(), 1);
        assert_eq!(rv.key_count().unwrap(), 2);
        assert_eq!(rv.inline_key(0).unwrap(), b"b");
        assert_eq!(rv.inline_key(1).unwrap(), b"c");
        assert_eq!(rv.fields(1).unwrap().record_ptr, 3);
    }

    #[test]
    fn prepend_raw_shifts_existing() {
        let mut data = leaf_page();
        {
            let mut node = NodeViewMut::new(&mut data, KEY_SIZE);
            node.insert_slot(0, fields(2, 1), b"m").unwrap();
        }
        let mut image = vec![0u8; slot_width(KEY_SIZE)];
        image[0..8].copy_from_slice(&7u64.to_le_bytes());
        image[8] = SLOT_RECORD_INLINE;
        image[10..12].copy_from_slice(&1u16.to_le_bytes());
        image[SLOT_FIXED_SIZE] = b'a';

        NodeViewMut::new(&mut data, KEY_SIZE).prepend_raw(&image).unwrap();

        let view = NodeView::new(&data, KEY_SIZE);
        assert_eq!(view.key_count().unwrap(), 2);
        assert_eq!(view.inline_key(0).unwrap(), b"a");
        assert_eq!(view.inline_key(1).unwrap(), b"m");
    }

    #[test]
    fn binary_search_insertion_points() {
        let mut data = leaf_page();
        {
            let mut node = NodeViewMut::new(&mut data, KEY_SIZE);
            for (i, k) in [b"b", b"d", b"f"].iter().enumerate() {
                node.insert_slot(i, fields(i as u64, 1), *k).unwrap();
            }
        }
        let view = NodeView::new(&data, KEY_SIZE);
        let search = |needle: &[u8]| {
            view.search(|i| Ok(needle.cmp(view.inline_key(i).unwrap())))
                .unwrap()
        };

        assert_eq!(search(b"a"), (false, 0));
        assert_eq!(search(b"b"), (true, 0));
        assert_eq!(search(b"c"), (false, 1));
        assert_eq!(search(b"f"), (true, 2));
        assert_eq!(search(b"g"), (false, 3));
    }

    #[test]
    fn extended_key_slot_layout() {
        let mut data = leaf_page();
        let cap = KEY_SIZE as usize;
        // Prefix fills cap-8 bytes, blob offset in the trailing 8.
        let mut inline = vec![b'p'; cap - 8];
        inline.extend_from_slice(&0xABCDu64.to_le_bytes());

        let mut node = NodeViewMut::new(&mut data, KEY_SIZE);
        node.insert_slot(
            0,
            SlotFields {
                record_ptr: 0,
                flags: SLOT_EXTENDED_KEY,
                inline_record_size: 0,
                key_size: 100,
            },
            &inline,
        )
        .unwrap();

        let view = NodeView::new(&data, KEY_SIZE);
        assert_eq!(view.inline_key(0).unwrap(), &vec![b'p'; cap - 8][..]);
        assert_eq!(view.extended_key_offset(0).unwrap(), 0xABCD);
        assert_eq!(view.fields(0).unwrap().key_size, 100);
    }
}
