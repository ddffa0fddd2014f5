//! # Flag Bitfields
//!
//! All public flag sets of the engine, as plain `u32` bitfields. Flags are
//! grouped by the call site that accepts them; unrelated groups may reuse
//! bit positions.

// ---------------------------------------------------------------------------
// Environment flags (create/open)

/// Keep the whole environment in memory; no backing file, no journal.
pub const ENV_IN_MEMORY: u32 = 1 << 0;
/// Enable explicit transactions. Implies a journal unless `ENV_IN_MEMORY`.
pub const ENV_ENABLE_TRANSACTIONS: u32 = 1 << 1;
/// Maintain a journal for crash recovery even without explicit transactions.
pub const ENV_ENABLE_RECOVERY: u32 = 1 << 2;
/// On open, run journal recovery instead of failing with `NeedRecovery`.
pub const ENV_AUTO_RECOVERY: u32 = 1 << 3;
/// Close remaining databases and cursors automatically on environment
/// close. Handle lifetimes already guarantee this; the flag is accepted
/// for API compatibility.
pub const ENV_AUTO_CLEANUP: u32 = 1 << 4;

// ---------------------------------------------------------------------------
// Close flags

/// Leave the journal files untouched on close and keep the dirty-shutdown
/// mark: the next open must recover. Used to exercise crash recovery.
pub const DONT_CLEAR_LOG: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Transaction flags

/// The transaction was opened implicitly to wrap a single operation and
/// commits when that operation succeeds.
pub const TXN_AUTO_COMMIT: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Database flags (create_db)

/// Allow several records under one key.
pub const DB_ENABLE_DUPLICATES: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Operation flags (insert/find/erase)

/// Replace the record when the key exists.
pub const OVERWRITE: u32 = 1 << 0;
/// Append a duplicate when the key exists (requires `DB_ENABLE_DUPLICATES`).
pub const DUPLICATE: u32 = 1 << 1;
/// Through a cursor: insert the duplicate before the current position.
pub const DUPLICATE_INSERT_BEFORE: u32 = 1 << 2;
/// Through a cursor: insert the duplicate after the current position.
pub const DUPLICATE_INSERT_AFTER: u32 = 1 << 3;
/// The record carries a partial write window (`partial_offset`,
/// `partial_size`); bytes outside the window are preserved or zero-filled.
pub const PARTIAL: u32 = 1 << 4;
/// Approximate find: position on the largest key <= the search key.
pub const FIND_LT_MATCH: u32 = 1 << 5;
/// Approximate find: position on the smallest key >= the search key.
pub const FIND_GT_MATCH: u32 = 1 << 6;
/// Exact find (the default when no approximate flag is given).
pub const FIND_EXACT_MATCH: u32 = 1 << 7;
/// Erase every duplicate of the key, not just one position.
pub const ERASE_ALL_DUPLICATES: u32 = 1 << 8;

// ---------------------------------------------------------------------------
// Cursor move flags

pub const FIRST: u32 = 1 << 0;
pub const LAST: u32 = 1 << 1;
pub const NEXT: u32 = 1 << 2;
pub const PREVIOUS: u32 = 1 << 3;
/// Collapse duplicate runs: yield each key once.
pub const SKIP_DUPLICATES: u32 = 1 << 4;
/// Stay within the duplicates of the current key.
pub const ONLY_DUPLICATES: u32 = 1 << 5;
