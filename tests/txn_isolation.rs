//! # Transaction Visibility and Conflict Scenarios
//!
//! Writes of an active transaction live in the overlay and must stay
//! invisible to every other reader until commit; aborts must leave no
//! trace; concurrent writers to one key must conflict.

use tempfile::tempdir;

use emberdb::flags::{
    DB_ENABLE_DUPLICATES, DUPLICATE, ENV_ENABLE_TRANSACTIONS, ENV_IN_MEMORY, OVERWRITE,
};
use emberdb::{DbOptions, EnvOptions, Environment, ErrorKind};

fn txn_env(dir: &tempfile::TempDir) -> (Environment, emberdb::Database) {
    let env = Environment::create(
        &dir.path().join("txn.edb"),
        EnvOptions {
            flags: ENV_ENABLE_TRANSACTIONS,
            page_size: 1024,
            ..Default::default()
        },
    )
    .unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();
    (env, db)
}

#[test]
fn uncommitted_writes_are_invisible_to_others() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    let writer = env.begin().unwrap();
    db.insert(Some(&writer), b"key", b"value", 0).unwrap();

    // The writer reads its own write.
    assert_eq!(db.find(Some(&writer), b"key").unwrap(), b"value");

    // Another transaction does not.
    let reader = env.begin().unwrap();
    let err = db.find(Some(&reader), b"key").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));

    // Neither does a non-transactional read.
    let err = db.find(None, b"key").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));

    reader.abort().unwrap();
    writer.commit().unwrap();
    assert_eq!(db.find(None, b"key").unwrap(), b"value");
}

#[test]
fn key_counts_respect_visibility() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"base", b"1", 0).unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"pending", b"2", 0).unwrap();
    db.erase(Some(&txn), b"base").unwrap();

    // The writer sees one key (pending); outsiders still see base.
    assert_eq!(db.get_key_count(Some(&txn)).unwrap(), 1);
    assert_eq!(db.get_key_count(None).unwrap(), 1);

    txn.commit().unwrap();
    assert_eq!(db.get_key_count(None).unwrap(), 1);
    assert_eq!(db.find(None, b"pending").unwrap(), b"2");
    let err = db.find(None, b"base").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
}

#[test]
fn aborted_writes_leave_no_trace() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"stable", b"old", 0).unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"volatile", b"x", 0).unwrap();
    db.insert(Some(&txn), b"stable", b"new", OVERWRITE).unwrap();
    txn.abort().unwrap();

    let err = db.find(None, b"volatile").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
    assert_eq!(db.find(None, b"stable").unwrap(), b"old");
    assert_eq!(db.get_key_count(None).unwrap(), 1);
}

#[test]
fn dropping_an_active_txn_aborts_it() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    {
        let txn = env.begin().unwrap();
        db.insert(Some(&txn), b"leaked", b"x", 0).unwrap();
    }

    let err = db.find(None, b"leaked").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));

    // The slot is free for new work.
    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"leaked", b"y", 0).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.find(None, b"leaked").unwrap(), b"y");
}

#[test]
fn concurrent_writers_conflict_on_a_key() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    let first = env.begin().unwrap();
    let second = env.begin().unwrap();

    db.insert(Some(&first), b"contested", b"1", 0).unwrap();
    let err = db
        .insert(Some(&second), b"contested", b"2", 0)
        .unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::TxnConflict));

    // Unrelated keys stay writable.
    db.insert(Some(&second), b"free", b"2", 0).unwrap();

    first.commit().unwrap();
    second.commit().unwrap();
    assert_eq!(db.find(None, b"contested").unwrap(), b"1");
    assert_eq!(db.find(None, b"free").unwrap(), b"2");
}

#[test]
fn duplicate_key_checks_see_the_overlay() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"once", b"1", 0).unwrap();

    // A second bare insert inside the same transaction is a duplicate.
    let err = db.insert(Some(&txn), b"once", b"2", 0).unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::DuplicateKey));

    // Overwrite is allowed and wins.
    db.insert(Some(&txn), b"once", b"3", OVERWRITE).unwrap();
    txn.commit().unwrap();
    assert_eq!(db.find(None, b"once").unwrap(), b"3");
}

#[test]
fn erase_then_reinsert_inside_one_txn() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    db.insert(None, b"cycle", b"v1", 0).unwrap();

    let txn = env.begin().unwrap();
    db.erase(Some(&txn), b"cycle").unwrap();

    // Erased for the writer (reported as missing through the public API)
    // but still visible outside.
    let err = db.find(Some(&txn), b"cycle").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
    assert_eq!(db.find(None, b"cycle").unwrap(), b"v1");

    // A bare insert succeeds after the visible erase.
    db.insert(Some(&txn), b"cycle", b"v2", 0).unwrap();
    assert_eq!(db.find(Some(&txn), b"cycle").unwrap(), b"v2");

    txn.commit().unwrap();
    assert_eq!(db.find(None, b"cycle").unwrap(), b"v2");
}

#[test]
fn erasing_a_missing_key_fails_inside_a_txn() {
    let dir = tempdir().unwrap();
    let (env, db) = txn_env(&dir);

    let txn = env.begin().unwrap();
    let err = db.erase(Some(&txn), b"nothing").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));

    // The failed erase appended nothing: commit is a no-op.
    txn.commit().unwrap();
}

#[test]
fn committed_duplicates_land_in_order() {
    let dir = tempdir().unwrap();
    let env = Environment::create(
        &dir.path().join("dups.edb"),
        EnvOptions {
            flags: ENV_ENABLE_TRANSACTIONS,
            page_size: 1024,
            ..Default::default()
        },
    )
    .unwrap();
    let db = env
        .create_db(
            1,
            DbOptions {
                flags: DB_ENABLE_DUPLICATES,
                ..Default::default()
            },
        )
        .unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"multi", b"a", 0).unwrap();
    db.insert(Some(&txn), b"multi", b"b", DUPLICATE).unwrap();
    db.insert(Some(&txn), b"multi", b"c", DUPLICATE).unwrap();
    assert_eq!(db.get_duplicate_count(Some(&txn), b"multi").unwrap(), 3);
    txn.commit().unwrap();

    assert_eq!(db.get_duplicate_count(None, b"multi").unwrap(), 3);
    assert_eq!(db.find(None, b"multi").unwrap(), b"a");
    assert_eq!(db.get_key_count(None).unwrap(), 3);
}

#[test]
fn in_memory_environments_support_transactions() {
    let dir = tempdir().unwrap();
    let env = Environment::create(
        &dir.path().join("unused"),
        EnvOptions {
            flags: ENV_IN_MEMORY | ENV_ENABLE_TRANSACTIONS,
            page_size: 1024,
            ..Default::default()
        },
    )
    .unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let txn = env.begin().unwrap();
    db.insert(Some(&txn), b"mem", b"1", 0).unwrap();

    let err = db.find(None, b"mem").unwrap_err();
    assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));

    txn.commit().unwrap();
    assert_eq!(db.find(None, b"mem").unwrap(), b"1");

    // No journal files for in-memory environments.
    assert!(!dir.path().join("unused.jrn0").exists());
}
