//! End-to-end engine tests: persistence, ordering, caching pressure.

use burrowdb::{
    BurrowError, CursorMoveFlags, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment,
    InsertFlags, PageSize,
};

fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn insert_find_erase_round_trip() {
    let mut env = Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    env.create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();

    env.insert(1, None, b"key", b"record", InsertFlags::default())
        .unwrap();
    assert_eq!(env.find(1, None, b"key").unwrap(), b"record");

    env.erase(1, None, b"key").unwrap();
    assert!(matches!(
        env.find(1, None, b"key"),
        Err(BurrowError::KeyNotFound)
    ));
}

#[test]
fn ten_thousand_keys_survive_reopen_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "bulk.brw");
    let config = EnvConfig {
        page_size: PageSize::new(4096).unwrap(),
        cache_capacity: 64 * 1024,
        max_databases: 4,
    };

    {
        let mut env = Environment::create(Some(&path), EnvFlags::empty(), &config).unwrap();
        env.create_database(1, DbFlags::empty(), &DbConfig::default())
            .unwrap();
        for i in 0..10_000u32 {
            let key = format!("{i:05}");
            env.insert(1, None, key.as_bytes(), key.as_bytes(), InsertFlags::default())
                .unwrap();
        }
        env.close().unwrap();
    }

    let mut env = Environment::open(&path, EnvFlags::empty(), 64 * 1024).unwrap();
    env.open_database(1).unwrap();

    let cursor = env.cursor_create(1, None).unwrap();
    let mut count = 0u32;
    let mut previous: Option<Vec<u8>> = None;
    let mut step = CursorMoveFlags::FIRST;
    loop {
        match env.cursor_move(cursor, step) {
            Ok((key, record)) => {
                assert_eq!(key, record, "records were the key bytes");
                if let Some(prev) = &previous {
                    assert!(prev < &key, "keys must arrive in lexicographic order");
                }
                previous = Some(key);
                count += 1;
            }
            Err(BurrowError::KeyNotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        step = CursorMoveFlags::NEXT;
    }
    assert_eq!(count, 10_000);
    env.close().unwrap();
}

#[test]
fn write_through_environment_persists_without_explicit_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "wt.brw");

    {
        let mut env =
            Environment::create(Some(&path), EnvFlags::WRITE_THROUGH, &EnvConfig::default())
                .unwrap();
        env.create_database(1, DbFlags::empty(), &DbConfig::default())
            .unwrap();
        for i in 0..100u32 {
            let key = format!("k{i:03}");
            let val = format!("v{i:03}");
            env.insert(1, None, key.as_bytes(), val.as_bytes(), InsertFlags::default())
                .unwrap();
        }
        env.close().unwrap();
    }

    let mut env = Environment::open(&path, EnvFlags::empty(), EnvConfig::DEFAULT_CACHE_CAPACITY)
        .unwrap();
    env.open_database(1).unwrap();
    for i in 0..100u32 {
        let key = format!("k{i:03}");
        let val = format!("v{i:03}");
        assert_eq!(env.find(1, None, key.as_bytes()).unwrap(), val.as_bytes());
    }
    env.close().unwrap();
}

#[test]
fn shorter_key_is_greater_in_iteration() {
    let mut env = Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    env.create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    env.insert(1, None, b"ab", b"", InsertFlags::default()).unwrap();
    env.insert(1, None, b"abc", b"", InsertFlags::default()).unwrap();

    let cursor = env.cursor_create(1, None).unwrap();
    let (first, _) = env.cursor_move(cursor, CursorMoveFlags::FIRST).unwrap();
    let (second, _) = env.cursor_move(cursor, CursorMoveFlags::NEXT).unwrap();
    assert_eq!(first, b"abc");
    assert_eq!(second, b"ab");
}

#[test]
fn multiple_databases_are_isolated() {
    let mut env = Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    env.create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    env.create_database(2, DbFlags::empty(), &DbConfig::default())
        .unwrap();

    env.insert(1, None, b"k", b"one", InsertFlags::default()).unwrap();
    env.insert(2, None, b"k", b"two", InsertFlags::default()).unwrap();

    assert_eq!(env.find(1, None, b"k").unwrap(), b"one");
    assert_eq!(env.find(2, None, b"k").unwrap(), b"two");

    env.erase(1, None, b"k").unwrap();
    assert!(env.find(1, None, b"k").is_err());
    assert_eq!(env.find(2, None, b"k").unwrap(), b"two");

    assert_eq!(env.database_names(), vec![1, 2]);
}

#[test]
fn erase_database_reclaims_space_for_later_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "reclaim.brw");
    let mut env =
        Environment::create(Some(&path), EnvFlags::empty(), &EnvConfig::default()).unwrap();
    env.create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    for i in 0..500u32 {
        let key = format!("{i:05}");
        env.insert(1, None, key.as_bytes(), b"payload", InsertFlags::default())
            .unwrap();
    }
    env.close_database(1).unwrap();
    env.erase_database(1).unwrap();
    assert!(env.database_names().is_empty());

    env.create_database(2, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    env.insert(2, None, b"fresh", b"data", InsertFlags::default())
        .unwrap();
    assert_eq!(env.find(2, None, b"fresh").unwrap(), b"data");
    env.close().unwrap();
}

#[test]
fn use_hash_is_rejected() {
    let err = Environment::create(None, EnvFlags::USE_HASH, &EnvConfig::default()).unwrap_err();
    assert!(matches!(err, BurrowError::Unsupported));
}

#[test]
fn opening_garbage_is_not_an_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "garbage.bin");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();
    let err = Environment::open(&path, EnvFlags::empty(), 64 * 1024).unwrap_err();
    assert!(matches!(err, BurrowError::NotAnEnvironment { .. }));
}

#[test]
fn mmap_mode_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "mapped.brw");
    {
        let mut env =
            Environment::create(Some(&path), EnvFlags::USE_MMAP, &EnvConfig::default()).unwrap();
        env.create_database(1, DbFlags::empty(), &DbConfig::default())
            .unwrap();
        for i in 0..200u32 {
            let key = format!("m{i:04}");
            env.insert(1, None, key.as_bytes(), key.as_bytes(), InsertFlags::default())
                .unwrap();
        }
        env.close().unwrap();
    }
    let mut env = Environment::open(&path, EnvFlags::USE_MMAP, EnvConfig::DEFAULT_CACHE_CAPACITY)
        .unwrap();
    env.open_database(1).unwrap();
    for i in 0..200u32 {
        let key = format!("m{i:04}");
        assert_eq!(env.find(1, None, key.as_bytes()).unwrap(), key.as_bytes());
    }
    env.close().unwrap();
}
