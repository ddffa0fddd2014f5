//! # B-tree Erase and Rebalance Scenarios
//!
//! Exercises the shift/merge/root-collapse protocol through the public
//! API, using the classic small-page configuration: 1 KiB pages and
//! 80-byte keys whose first four bytes carry the ordering.

use tempfile::tempdir;

use emberdb::{Cursor, DbOptions, EnvOptions, Environment, ErrorKind};

const PAGE_SIZE: usize = 1024;
const KEY_SIZE: u16 = 80;

fn small_page_env(dir: &tempfile::TempDir) -> (Environment, emberdb::Database) {
    let env = Environment::create(
        &dir.path().join("btree.edb"),
        EnvOptions {
            page_size: PAGE_SIZE,
            ..Default::default()
        },
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbOptions {
                key_size: KEY_SIZE,
                ..Default::default()
            },
        )
        .unwrap();
    (env, db)
}

/// An 80-byte key with `value` in its first four bytes, zeros after.
fn key(value: u32) -> Vec<u8> {
    let mut buffer = vec![0u8; KEY_SIZE as usize];
    buffer[..4].copy_from_slice(&value.to_le_bytes());
    buffer
}

fn fill(db: &emberdb::Database, num_inserts: u32) {
    for i in (0..num_inserts * 10).step_by(10) {
        db.insert(None, &key(i), &key(i), 0).unwrap();
    }
}

fn kind(err: &eyre::Report) -> Option<ErrorKind> {
    ErrorKind::of(err)
}

#[test]
fn collapse_root() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);
    fill(&db, 8);

    let err = db.erase(None, b"").unwrap_err();
    assert_eq!(kind(&err), Some(ErrorKind::InvKeySize));

    for i in (0..80).step_by(10) {
        db.erase(None, &key(i)).unwrap();
        let err = db.find(None, &key(i)).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
    }
    assert_eq!(db.get_key_count(None).unwrap(), 0);
}

#[test]
fn shift_from_right() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);
    fill(&db, 8);

    db.erase(None, &key(0)).unwrap();

    let err = db.find(None, &key(0)).unwrap_err();
    assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
    assert_eq!(db.find(None, &key(10)).unwrap(), key(10));
}

#[test]
fn shift_from_left() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);
    fill(&db, 8);

    for extra in [21u32, 22, 23] {
        db.insert(None, &key(extra), &key(extra), 0).unwrap();
    }
    for victim in [70u32, 60, 50] {
        db.erase(None, &key(victim)).unwrap();
    }

    assert_eq!(db.get_key_count(None).unwrap(), 8);
    assert_eq!(db.find(None, &key(23)).unwrap(), key(23));
}

#[test]
fn merge_with_left() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);
    fill(&db, 8);

    for victim in [70u32, 60, 50] {
        db.erase(None, &key(victim)).unwrap();
    }
    assert_eq!(db.get_key_count(None).unwrap(), 5);

    for survivor in (0..50).step_by(10) {
        assert_eq!(db.find(None, &key(survivor)).unwrap(), key(survivor));
    }
}

/// A multi-level tree drains back to a single empty leaf and every key
/// stays reachable on the way down.
#[test]
fn deep_tree_drain() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);

    let count = 200u32;
    for i in 0..count {
        db.insert(None, &key(i * 3), &key(i * 3), 0).unwrap();
    }
    assert_eq!(db.get_key_count(None).unwrap(), count as u64);

    // Erase from both ends towards the middle to hit left and right
    // shift/merge paths.
    let mut low = 0i64;
    let mut high = (count as i64) - 1;
    while low <= high {
        db.erase(None, &key(low as u32 * 3)).unwrap();
        if low != high {
            db.erase(None, &key(high as u32 * 3)).unwrap();
        }
        low += 1;
        high -= 1;
    }

    assert_eq!(db.get_key_count(None).unwrap(), 0);
    let err = db.find(None, &key(0)).unwrap_err();
    assert_eq!(kind(&err), Some(ErrorKind::KeyNotFound));
}

/// Enumeration order survives heavy mutation (ascending per memcmp).
#[test]
fn cursor_scan_stays_sorted_after_rebalancing() {
    let dir = tempdir().unwrap();
    let (_env, db) = small_page_env(&dir);

    for i in (0..150u32).rev() {
        db.insert(None, &key(i * 2), &key(i * 2), 0).unwrap();
    }
    for i in 0..75u32 {
        db.erase(None, &key(i * 4)).unwrap();
    }

    let mut cursor = Cursor::create(&db, None);
    cursor.move_to(emberdb::flags::FIRST).unwrap();
    let mut previous = cursor.get_key().unwrap();
    let mut seen = 1u64;
    while cursor.move_to(emberdb::flags::NEXT).is_ok() {
        let current = cursor.get_key().unwrap();
        assert!(previous < current, "scan out of order");
        previous = current;
        seen += 1;
    }
    assert_eq!(seen, db.get_key_count(None).unwrap());
}

/// Freeing pages through erase makes them reusable for later inserts
/// instead of growing the file.
#[test]
fn erased_pages_are_recycled() {
    let dir = tempdir().unwrap();
    let (env, db) = small_page_env(&dir);

    for i in 0..100u32 {
        db.insert(None, &key(i * 5), &key(i * 5), 0).unwrap();
    }
    for i in 0..100u32 {
        db.erase(None, &key(i * 5)).unwrap();
    }
    env.flush().unwrap();
    let size_after_drain = std::fs::metadata(dir.path().join("btree.edb"))
        .unwrap()
        .len();

    for i in 0..100u32 {
        db.insert(None, &key(i * 5 + 1), &key(i * 5 + 1), 0).unwrap();
    }
    env.flush().unwrap();
    let size_after_refill = std::fs::metadata(dir.path().join("btree.edb"))
        .unwrap()
        .len();

    assert_eq!(
        size_after_drain, size_after_refill,
        "refill consumed freelist pages, not fresh ones"
    );
}
