//! Export/import round trips.

use burrowdb::{
    BurrowError, CursorMoveFlags, DbConfig, DbFlags, EnvConfig, EnvFlags, Environment,
    InsertFlags,
};

fn collect(env: &mut Environment, db: u16) -> Vec<(Vec<u8>, Vec<u8>)> {
    let cursor = env.cursor_create(db, None).unwrap();
    let mut out = Vec::new();
    let mut step = CursorMoveFlags::FIRST;
    loop {
        match env.cursor_move(cursor, step) {
            Ok(pair) => out.push(pair),
            Err(BurrowError::KeyNotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        step = CursorMoveFlags::NEXT;
    }
    env.cursor_close(cursor).unwrap();
    out
}

#[test]
fn export_import_preserves_keys_and_records() {
    let mut source =
        Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    source
        .create_database(1, DbFlags::empty(), &DbConfig::default())
        .unwrap();
    for i in 0..500u32 {
        let key = format!("{i:05}");
        let val = format!("record-{i}");
        source
            .insert(1, None, key.as_bytes(), val.as_bytes(), InsertFlags::default())
            .unwrap();
    }

    let mut stream = Vec::new();
    source.export(&mut stream).unwrap();

    let mut target =
        Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    target.import(&mut stream.as_slice()).unwrap();

    assert_eq!(collect(&mut source, 1), collect(&mut target, 1));
}

#[test]
fn export_import_carries_duplicates() {
    let mut source =
        Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    source
        .create_database(3, DbFlags::ENABLE_DUPLICATES, &DbConfig::default())
        .unwrap();
    source.insert(3, None, b"k", b"v1", InsertFlags::default()).unwrap();
    source.insert(3, None, b"k", b"v2", InsertFlags::DUPLICATE).unwrap();
    source.insert(3, None, b"z", b"solo", InsertFlags::default()).unwrap();

    let mut stream = Vec::new();
    source.export(&mut stream).unwrap();

    let mut target =
        Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    target.import(&mut stream.as_slice()).unwrap();

    assert_eq!(collect(&mut source, 3), collect(&mut target, 3));
}

#[test]
fn export_import_spans_multiple_databases() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = Environment::create(
        Some(&dir.path().join("src.brw")),
        EnvFlags::empty(),
        &EnvConfig::default(),
    )
    .unwrap();
    for db in [1u16, 2, 5] {
        source
            .create_database(db, DbFlags::empty(), &DbConfig::default())
            .unwrap();
        for i in 0..20u32 {
            let key = format!("db{db}-{i:03}");
            source
                .insert(db, None, key.as_bytes(), key.as_bytes(), InsertFlags::default())
                .unwrap();
        }
    }

    let mut stream = Vec::new();
    source.export(&mut stream).unwrap();

    let mut target = Environment::create(
        Some(&dir.path().join("dst.brw")),
        EnvFlags::empty(),
        &EnvConfig::default(),
    )
    .unwrap();
    target.import(&mut stream.as_slice()).unwrap();

    assert_eq!(target.database_names(), vec![1, 2, 5]);
    for db in [1u16, 2, 5] {
        assert_eq!(collect(&mut source, db), collect(&mut target, db));
    }
    source.close().unwrap();
    target.close().unwrap();
}

#[test]
fn import_rejects_garbage() {
    let mut env =
        Environment::create(None, EnvFlags::IN_MEMORY_DB, &EnvConfig::default()).unwrap();
    let garbage = vec![9u8, 0, 0, 0, 0];
    assert!(env.import(&mut garbage.as_slice()).is_err());
}
