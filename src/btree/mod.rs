//! # B-tree Index
//!
//! The ordered key→record map at the heart of every database. One B-tree
//! per database; the root page offset lives in the database descriptor.
//!
//! ## Module Organization
//!
//! - `node`: node/slot layout and raw slot movement (layout only)
//! - `blob`: overflow chains for large records and extended keys
//! - `dupes`: duplicate tables
//! - `tree`: the index itself, split/shift/merge/rebalance protocol
//!
//! ## Key Ordering
//!
//! Each database compares keys according to its `key_type`:
//!
//! - [`KeyType::Binary`]: lexicographic byte comparison (memcmp)
//! - [`KeyType::U64`]: keys are exactly 8 little-endian bytes compared
//!   numerically
//!
//! Extended keys are compared by their inline prefix first; only when the
//! prefix comparison is inconclusive (signalled by `None` from
//! [`compare_prefix`]) is the full key fetched from its blob chain.

mod blob;
mod dupes;
mod node;
mod tree;

pub use blob::{
    blob_alloc, blob_free, blob_info, blob_overwrite, blob_page_count, blob_read, BlobInfo,
    BLOB_FLAG_COMPRESSED, BLOB_HEADER_SIZE,
};
pub use dupes::{
    dup_count, dup_entry_blob, dup_erase, dup_free_all, dup_get, dup_insert, dup_set,
    dup_table_create,
};
pub use node::{
    merge_threshold, node_capacity, slot_width, NodeView, NodeViewMut, SlotFields,
    NODE_HEADER_SIZE, SLOTS_OFFSET, SLOT_DUPLICATES, SLOT_EXTENDED_KEY, SLOT_FIXED_SIZE,
    SLOT_RECORD_INLINE,
};
pub use tree::{BtreeIndex, BtreeVisitor, EraseMode};

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    Binary = 0,
    U64 = 1,
}

impl KeyType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            1 => KeyType::U64,
            _ => KeyType::Binary,
        }
    }
}

/// Orders `a` against `b` under the database's compare function. Both
/// slices are complete keys.
pub fn compare_keys(key_type: KeyType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        KeyType::Binary => a.cmp(b),
        KeyType::U64 => {
            debug_assert!(a.len() == 8 && b.len() == 8, "u64 keys are 8 bytes");
            let lhs = u64::from_le_bytes(a.try_into().unwrap_or([0; 8]));
            let rhs = u64::from_le_bytes(b.try_into().unwrap_or([0; 8]));
            lhs.cmp(&rhs)
        }
    }
}

/// Orders a search key against a stored key of which only the first
/// `prefix.len()` bytes are available. Returns `None` when the prefix is
/// not enough to decide and the caller must fetch the full key.
pub fn compare_prefix(
    key_type: KeyType,
    search: &[u8],
    prefix: &[u8],
    stored_len: usize,
) -> Option<Ordering> {
    debug_assert!(prefix.len() <= stored_len);
    if key_type == KeyType::U64 {
        // u64 keys never extend past the inline area.
        return Some(compare_keys(key_type, search, prefix));
    }

    let common = search.len().min(prefix.len());
    match search[..common].cmp(&prefix[..common]) {
        Ordering::Equal => {
            if search.len() <= prefix.len() {
                if search.len() == stored_len {
                    Some(Ordering::Equal)
                } else {
                    // The search key is a proper prefix of the stored key.
                    Some(Ordering::Less)
                }
            } else if prefix.len() == stored_len {
                Some(Ordering::Greater)
            } else {
                None
            }
        }
        unequal => Some(unequal),
    }
}

#[cfg(test)]
mod key_tests {
    use super::*;

    #[test]
    fn binary_compare_is_memcmp() {
        assert_eq!(compare_keys(KeyType::Binary, b"abc", b"abd"), Ordering::Less);
        assert_eq!(compare_keys(KeyType::Binary, b"abc", b"ab"), Ordering::Greater);
        assert_eq!(compare_keys(KeyType::Binary, b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn u64_compare_is_numeric_not_lexicographic() {
        let small = 2u64.to_le_bytes();
        let large = 256u64.to_le_bytes();
        // memcmp would order these the other way around.
        assert_eq!(compare_keys(KeyType::Binary, &small, &large), Ordering::Greater);
        assert_eq!(compare_keys(KeyType::U64, &small, &large), Ordering::Less);
    }

    #[test]
    fn prefix_compare_decides_on_unequal_prefixes() {
        assert_eq!(
            compare_prefix(KeyType::Binary, b"aaaa", b"bb", 100),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_prefix(KeyType::Binary, b"zz", b"bb", 100),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn prefix_compare_signals_fallback_on_shared_prefix() {
        // Both continue past the stored prefix: inconclusive.
        assert_eq!(compare_prefix(KeyType::Binary, b"abcXYZ", b"abc", 100), None);
    }

    #[test]
    fn prefix_compare_handles_short_search_keys() {
        // Search key exhausted inside the prefix: it precedes the longer key.
        assert_eq!(
            compare_prefix(KeyType::Binary, b"ab", b"abc", 100),
            Some(Ordering::Less)
        );
        // Exact match when the stored key ends with the prefix.
        assert_eq!(
            compare_prefix(KeyType::Binary, b"abc", b"abc", 3),
            Some(Ordering::Equal)
        );
    }
}
