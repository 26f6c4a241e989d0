//! Export/import codec: a length-prefixed sequence of tagged records.
//!
//! The stream starts with one environment record, followed by one
//! database record per database, each followed by its items in cursor
//! order (one item per duplicate). Importing replays the stream into an
//! empty environment.

use std::io::{Read, Write};

use burrow_error::{BurrowError, Result};
use burrow_types::codec;
use burrow_types::flags::{CursorMoveFlags, DbFlags, InsertFlags};
use burrow_types::DbConfig;

use crate::env::Environment;

/// Record tag: environment parameters.
const TAG_ENVIRONMENT: u8 = 1;
/// Record tag: database descriptor.
const TAG_DATABASE: u8 = 2;
/// Record tag: one key/record item.
const TAG_ITEM: u8 = 3;

fn write_record(w: &mut impl Write, tag: u8, payload: &[u8]) -> Result<()> {
    let mut head = [0u8; 5];
    head[0] = tag;
    codec::put_u32(&mut head, 1, payload.len() as u32);
    w.write_all(&head)?;
    w.write_all(payload)?;
    Ok(())
}

fn read_record(r: &mut impl Read) -> Result<Option<(u8, Vec<u8>)>> {
    let mut head = [0u8; 5];
    match r.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = codec::get_u32(&head, 1) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some((head[0], payload)))
}

impl Environment {
    /// Write every database of this environment to `w`.
    pub fn export(&mut self, w: &mut impl Write) -> Result<()> {
        let mut payload = vec![0u8; 14];
        codec::put_u32(&mut payload, 0, self.flags.bits());
        codec::put_u32(&mut payload, 4, self.header.page_size.get());
        codec::put_u16(&mut payload, 8, self.header.max_databases);
        write_record(w, TAG_ENVIRONMENT, &payload)?;

        for name in self.database_names() {
            let slot = self.header.slot_of(name).expect("name from directory");
            let entry = self.header.directory[slot];

            let mut payload = vec![0u8; 8];
            codec::put_u16(&mut payload, 0, entry.name);
            codec::put_u32(&mut payload, 2, entry.flags);
            codec::put_u16(&mut payload, 6, entry.key_size);
            write_record(w, TAG_DATABASE, &payload)?;

            let opened_here = !self.is_database_open(name);
            if opened_here {
                self.open_database(name)?;
            }
            let result = self.export_items(name, w);
            if opened_here {
                self.close_database(name)?;
            }
            result?;
        }
        Ok(())
    }

    fn export_items(&mut self, name: u16, w: &mut impl Write) -> Result<()> {
        let cursor = self.cursor_create(name, None)?;
        let mut step = CursorMoveFlags::FIRST;
        loop {
            match self.cursor_move(cursor, step) {
                Ok((key, record)) => {
                    let mut payload = vec![0u8; 8 + key.len() + record.len()];
                    codec::put_u32(&mut payload, 0, key.len() as u32);
                    codec::put_u32(&mut payload, 4, record.len() as u32);
                    payload[8..8 + key.len()].copy_from_slice(&key);
                    payload[8 + key.len()..].copy_from_slice(&record);
                    write_record(w, TAG_ITEM, &payload)?;
                }
                Err(BurrowError::KeyNotFound) => break,
                Err(e) => {
                    self.cursor_close(cursor)?;
                    return Err(e);
                }
            }
            step = CursorMoveFlags::NEXT;
        }
        self.cursor_close(cursor)
    }

    /// Replay an exported stream into this (empty) environment.
    pub fn import(&mut self, r: &mut impl Read) -> Result<()> {
        let mut current_db: Option<(u16, bool)> = None;
        while let Some((tag, payload)) = read_record(r)? {
            match tag {
                TAG_ENVIRONMENT => {
                    if payload.len() < 14 {
                        return Err(BurrowError::inv_parameter("environment record truncated"));
                    }
                    // Parameters are informational; the target environment
                    // was created by the caller.
                }
                TAG_DATABASE => {
                    if payload.len() < 8 {
                        return Err(BurrowError::inv_parameter("database record truncated"));
                    }
                    let name = codec::get_u16(&payload, 0);
                    let flags = DbFlags::from_bits_truncate(codec::get_u32(&payload, 2));
                    let key_size = codec::get_u16(&payload, 6);
                    self.create_database(name, flags, &DbConfig { key_size })?;
                    current_db = Some((name, flags.contains(DbFlags::ENABLE_DUPLICATES)));
                }
                TAG_ITEM => {
                    let (name, dups) = current_db.ok_or_else(|| {
                        BurrowError::inv_parameter("item record before any database record")
                    })?;
                    if payload.len() < 8 {
                        return Err(BurrowError::inv_parameter("item record truncated"));
                    }
                    let key_len = codec::get_u32(&payload, 0) as usize;
                    let rec_len = codec::get_u32(&payload, 4) as usize;
                    if payload.len() != 8 + key_len + rec_len {
                        return Err(BurrowError::inv_parameter("item record length mismatch"));
                    }
                    let key = &payload[8..8 + key_len];
                    let record = &payload[8 + key_len..];
                    let flags = if dups {
                        InsertFlags::DUPLICATE
                    } else {
                        InsertFlags::default()
                    };
                    self.insert(name, None, key, record, flags)?;
                }
                other => {
                    return Err(BurrowError::inv_parameter(format!(
                        "unknown record tag {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn is_database_open(&self, name: u16) -> bool {
        self.dbs.contains_key(&name)
    }
}
