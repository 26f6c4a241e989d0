//! Transaction visibility, conflicts, and the txn-coupled cursor mode.

use burrowdb::{
    BurrowError, CursorMoveFlags, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment,
    InsertFlags, Sides,
};

fn txn_env() -> Environment {
    let mut env = Environment::create(
        None,
        EnvFlags::IN_MEMORY_DB | EnvFlags::ENABLE_TRANSACTIONS,
        &EnvConfig::default(),
    )
    .unwrap();
    env.create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    env
}

#[test]
fn uncommitted_insert_is_visible_only_inside_the_txn() {
    let mut env = txn_env();
    let txn = env.begin().unwrap();
    env.insert(1, Some(txn), b"x", b"1", InsertFlags::default())
        .unwrap();

    // A cursor bound to the transaction sees the pending insert.
    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    assert_eq!(env.cursor_find(cursor, b"x").unwrap(), b"1");

    // Readers outside the transaction do not.
    assert!(matches!(
        env.find(1, None, b"x"),
        Err(BurrowError::KeyNotFound)
    ));

    env.abort(txn).unwrap();
    assert!(matches!(
        env.find(1, None, b"x"),
        Err(BurrowError::KeyNotFound)
    ));
}

#[test]
fn commit_makes_ops_durable_in_order() {
    let mut env = txn_env();
    let txn = env.begin().unwrap();
    env.insert(1, Some(txn), b"a", b"1", InsertFlags::default())
        .unwrap();
    env.insert(1, Some(txn), b"b", b"2", InsertFlags::default())
        .unwrap();
    env.insert(1, Some(txn), b"a", b"1b", InsertFlags::OVERWRITE)
        .unwrap();
    env.commit(txn).unwrap();

    assert_eq!(env.find(1, None, b"a").unwrap(), b"1b");
    assert_eq!(env.find(1, None, b"b").unwrap(), b"2");
}

#[test]
fn erase_in_txn_shadows_committed_key() {
    let mut env = txn_env();
    env.insert(1, None, b"gone", b"soon", InsertFlags::default())
        .unwrap();

    let txn = env.begin().unwrap();
    env.erase(1, Some(txn), b"gone").unwrap();

    // Inside the txn the key is invisible; a bound cursor reports the
    // erase distinctly.
    assert!(matches!(
        env.find(1, Some(txn), b"gone"),
        Err(BurrowError::KeyNotFound)
    ));
    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    assert!(matches!(
        env.cursor_find(cursor, b"gone"),
        Err(BurrowError::KeyErasedInTxn)
    ));

    // Outside it is still there until commit.
    assert_eq!(env.find(1, None, b"gone").unwrap(), b"soon");

    env.commit(txn).unwrap();
    assert!(matches!(
        env.find(1, None, b"gone"),
        Err(BurrowError::KeyNotFound)
    ));
}

#[test]
fn conflicting_writes_between_txns_are_rejected() {
    let mut env = txn_env();
    let t1 = env.begin().unwrap();
    let t2 = env.begin().unwrap();

    env.insert(1, Some(t1), b"contended", b"1", InsertFlags::default())
        .unwrap();
    let err = env
        .insert(1, Some(t2), b"contended", b"2", InsertFlags::default())
        .unwrap_err();
    assert!(matches!(err, BurrowError::TxnConflict));

    env.abort(t1).unwrap();
    env.abort(t2).unwrap();
}

#[test]
fn double_insert_inside_one_txn_conflicts_without_flags() {
    let mut env = txn_env();
    let txn = env.begin().unwrap();
    env.insert(1, Some(txn), b"k", b"1", InsertFlags::default())
        .unwrap();
    let err = env
        .insert(1, Some(txn), b"k", b"2", InsertFlags::default())
        .unwrap_err();
    assert!(matches!(err, BurrowError::TxnConflict));

    // With OVERWRITE the second write is fine.
    env.insert(1, Some(txn), b"k", b"2", InsertFlags::OVERWRITE)
        .unwrap();
    env.commit(txn).unwrap();
    assert_eq!(env.find(1, None, b"k").unwrap(), b"2");
}

#[test]
fn plain_insert_of_committed_key_is_duplicate_key() {
    let mut env = txn_env();
    env.insert(1, None, b"k", b"committed", InsertFlags::default())
        .unwrap();
    let txn = env.begin().unwrap();
    let err = env
        .insert(1, Some(txn), b"k", b"again", InsertFlags::default())
        .unwrap_err();
    assert!(matches!(err, BurrowError::DuplicateKey));
    env.abort(txn).unwrap();
}

#[test]
fn cursor_merges_committed_and_pending_keys_in_order() {
    let mut env = txn_env();
    env.insert(1, None, b"b", b"btree", InsertFlags::default())
        .unwrap();
    env.insert(1, None, b"d", b"btree", InsertFlags::default())
        .unwrap();

    let txn = env.begin().unwrap();
    env.insert(1, Some(txn), b"a", b"txn", InsertFlags::default())
        .unwrap();
    env.insert(1, Some(txn), b"c", b"txn", InsertFlags::default())
        .unwrap();
    env.insert(1, Some(txn), b"e", b"txn", InsertFlags::default())
        .unwrap();

    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    let mut seen = Vec::new();
    let mut step = CursorMoveFlags::FIRST;
    loop {
        match env.cursor_move(cursor, step) {
            Ok((key, record)) => seen.push((key, record)),
            Err(BurrowError::KeyNotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        step = CursorMoveFlags::NEXT;
    }
    let keys: Vec<&[u8]> = seen.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_ref(), b"b", b"c", b"d", b"e"]);
    assert_eq!(seen[0].1, b"txn");
    assert_eq!(seen[1].1, b"btree");
    env.abort(txn).unwrap();

    // After the abort only the committed keys remain.
    let cursor = env.cursor_create(1, None).unwrap();
    let (first, _) = env.cursor_move(cursor, CursorMoveFlags::FIRST).unwrap();
    assert_eq!(first, b"b");
}

#[test]
fn merged_walk_skips_keys_erased_in_txn() {
    let mut env = txn_env();
    for key in [b"a", b"b", b"c"] {
        env.insert(1, None, key, b"v", InsertFlags::default()).unwrap();
    }
    let txn = env.begin().unwrap();
    env.erase(1, Some(txn), b"b").unwrap();

    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    let mut keys = Vec::new();
    let mut step = CursorMoveFlags::FIRST;
    loop {
        match env.cursor_move(cursor, step) {
            Ok((key, _)) => keys.push(key),
            Err(BurrowError::KeyNotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        step = CursorMoveFlags::NEXT;
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    env.abort(txn).unwrap();
}

#[test]
fn txn_cursors_close_when_the_txn_ends() {
    let mut env = txn_env();
    let txn = env.begin().unwrap();
    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    assert!(env.cursor_is_nil(cursor, Sides::Both).unwrap());

    env.abort(txn).unwrap();
    // The cursor died with its transaction.
    assert!(env.cursor_is_nil(cursor, Sides::Both).is_err());
}

#[test]
fn cursor_state_transitions() {
    let mut env = txn_env();
    env.insert(1, None, b"k", b"v", InsertFlags::default()).unwrap();

    let cursor = env.cursor_create(1, None).unwrap();
    assert!(env.cursor_is_nil(cursor, Sides::Both).unwrap());

    env.cursor_find(cursor, b"k").unwrap();
    assert!(!env.cursor_is_nil(cursor, Sides::Btree).unwrap());

    env.cursor_erase(cursor).unwrap();
    assert!(env.cursor_is_nil(cursor, Sides::Both).unwrap());
    assert!(matches!(
        env.find(1, None, b"k"),
        Err(BurrowError::KeyNotFound)
    ));
}

#[test]
fn check_btree_key_erased_probe() {
    let mut env = txn_env();
    env.insert(1, None, b"probe", b"v", InsertFlags::default())
        .unwrap();

    let txn = env.begin().unwrap();
    let cursor = env.cursor_create(1, Some(txn)).unwrap();
    env.cursor_find(cursor, b"probe").unwrap();
    env.cursor_check_if_btree_key_is_erased_or_overwritten(cursor)
        .unwrap();

    // Erase through a second bound cursor, then probe again.
    let second = env.cursor_clone(cursor).unwrap();
    env.cursor_erase(second).unwrap();
    assert!(matches!(
        env.cursor_check_if_btree_key_is_erased_or_overwritten(cursor),
        Err(BurrowError::KeyErasedInTxn)
    ));
    env.abort(txn).unwrap();
}
