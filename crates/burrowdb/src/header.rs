//! The environment header page (page 0).
//!
//! Holds the file magic, format version, page size, the freelist chain
//! root and the database directory. Written and read straight through
//! the device; the header never enters the page cache, so page address 0
//! keeps meaning "unplaced" everywhere else.

use burrow_error::{BurrowError, Result};
use burrow_types::{codec, DatabaseName, PageAddress, PageSize};

/// File magic, stable across format versions.
pub const MAGIC: [u8; 4] = *b"BRW1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const PAGE_SIZE_OFFSET: usize = 8;
const MAX_DBS_OFFSET: usize = 12;
const FREELIST_OFFSET: usize = 16;
const DIRECTORY_OFFSET: usize = 24;
const DIR_ENTRY_SIZE: usize = 16;

/// One database directory slot. `name == 0` marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    pub name: DatabaseName,
    pub key_size: u16,
    pub flags: u32,
    pub root: PageAddress,
}

/// Decoded environment header.
#[derive(Debug, Clone)]
pub struct Header {
    pub page_size: PageSize,
    pub max_databases: u16,
    pub freelist_root: PageAddress,
    pub directory: Vec<DirEntry>,
}

impl Header {
    /// A fresh header with an empty directory.
    #[must_use]
    pub fn new(page_size: PageSize, max_databases: u16) -> Self {
        Self {
            page_size,
            max_databases,
            freelist_root: 0,
            directory: vec![DirEntry::default(); max_databases as usize],
        }
    }

    /// Bytes needed by a header with `max_databases` slots.
    #[must_use]
    pub fn byte_size(max_databases: u16) -> usize {
        DIRECTORY_OFFSET + max_databases as usize * DIR_ENTRY_SIZE
    }

    /// Serialize into a page-size buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size.as_usize()];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC);
        codec::put_u32(&mut buf, VERSION_OFFSET, FORMAT_VERSION);
        codec::put_u32(&mut buf, PAGE_SIZE_OFFSET, self.page_size.get());
        codec::put_u16(&mut buf, MAX_DBS_OFFSET, self.max_databases);
        codec::put_u64(&mut buf, FREELIST_OFFSET, self.freelist_root);
        for (i, entry) in self.directory.iter().enumerate() {
            let off = DIRECTORY_OFFSET + i * DIR_ENTRY_SIZE;
            codec::put_u16(&mut buf, off, entry.name);
            codec::put_u16(&mut buf, off + 2, entry.key_size);
            codec::put_u32(&mut buf, off + 4, entry.flags);
            codec::put_u64(&mut buf, off + 8, entry.root);
        }
        buf
    }

    /// Validate the fixed header fields and return the page size.
    ///
    /// Works on a prefix of page 0 (the smallest legal page is enough),
    /// so an opener can learn the page size before reading the full
    /// header with its directory.
    pub fn probe_page_size(buf: &[u8], path: &std::path::Path) -> Result<PageSize> {
        if buf.len() < DIRECTORY_OFFSET || buf[..4] != MAGIC {
            return Err(BurrowError::NotAnEnvironment {
                path: path.to_path_buf(),
            });
        }
        let version = codec::get_u32(buf, VERSION_OFFSET);
        if version > FORMAT_VERSION {
            return Err(BurrowError::VersionMismatch {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        let raw = codec::get_u32(buf, PAGE_SIZE_OFFSET);
        PageSize::new(raw)
            .ok_or_else(|| BurrowError::internal(format!("header has invalid page size {raw}")))
    }

    /// Parse a header read from page 0.
    pub fn decode(buf: &[u8], path: &std::path::Path) -> Result<Self> {
        if buf.len() < DIRECTORY_OFFSET || buf[..4] != MAGIC {
            return Err(BurrowError::NotAnEnvironment {
                path: path.to_path_buf(),
            });
        }
        let version = codec::get_u32(buf, VERSION_OFFSET);
        if version > FORMAT_VERSION {
            return Err(BurrowError::VersionMismatch {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        let page_size_raw = codec::get_u32(buf, PAGE_SIZE_OFFSET);
        let page_size = PageSize::new(page_size_raw).ok_or_else(|| {
            BurrowError::internal(format!("header has invalid page size {page_size_raw}"))
        })?;
        let max_databases = codec::get_u16(buf, MAX_DBS_OFFSET);
        if Self::byte_size(max_databases) > buf.len() {
            return Err(BurrowError::internal("directory exceeds the header page"));
        }

        let mut directory = Vec::with_capacity(max_databases as usize);
        for i in 0..max_databases as usize {
            let off = DIRECTORY_OFFSET + i * DIR_ENTRY_SIZE;
            directory.push(DirEntry {
                name: codec::get_u16(buf, off),
                key_size: codec::get_u16(buf, off + 2),
                flags: codec::get_u32(buf, off + 4),
                root: codec::get_u64(buf, off + 8),
            });
        }

        Ok(Self {
            page_size,
            max_databases,
            freelist_root: codec::get_u64(buf, FREELIST_OFFSET),
            directory,
        })
    }

    /// The directory slot of `name`, if present.
    #[must_use]
    pub fn slot_of(&self, name: DatabaseName) -> Option<usize> {
        self.directory.iter().position(|e| e.name == name)
    }

    /// The first free directory slot.
    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        self.directory.iter().position(|e| e.name == 0)
    }

    /// Names of all databases in the directory.
    #[must_use]
    pub fn database_names(&self) -> Vec<DatabaseName> {
        self.directory
            .iter()
            .filter(|e| e.name != 0)
            .map(|e| e.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn encode_decode_round_trip() {
        let mut header = Header::new(PageSize::DEFAULT, 8);
        header.freelist_root = 12288;
        header.directory[0] = DirEntry {
            name: 1,
            key_size: 32,
            flags: 1,
            root: 4096,
        };
        header.directory[3] = DirEntry {
            name: 7,
            key_size: 64,
            flags: 0,
            root: 8192,
        };

        let buf = header.encode();
        assert_eq!(buf.len(), 4096);
        let decoded = Header::decode(&buf, Path::new("x")).unwrap();
        assert_eq!(decoded.page_size, PageSize::DEFAULT);
        assert_eq!(decoded.max_databases, 8);
        assert_eq!(decoded.freelist_root, 12288);
        assert_eq!(decoded.directory, header.directory);
        assert_eq!(decoded.database_names(), vec![1, 7]);
    }

    #[test]
    fn bad_magic_is_not_an_environment() {
        let buf = vec![0u8; 4096];
        let err = Header::decode(&buf, Path::new("junk.db")).unwrap_err();
        assert!(matches!(err, BurrowError::NotAnEnvironment { .. }));
    }

    #[test]
    fn newer_version_is_rejected() {
        let header = Header::new(PageSize::DEFAULT, 4);
        let mut buf = header.encode();
        codec::put_u32(&mut buf, VERSION_OFFSET, FORMAT_VERSION + 1);
        let err = Header::decode(&buf, Path::new("x")).unwrap_err();
        assert!(matches!(err, BurrowError::VersionMismatch { .. }));
    }

    #[test]
    fn slot_management() {
        let mut header = Header::new(PageSize::DEFAULT, 2);
        assert_eq!(header.free_slot(), Some(0));
        header.directory[0].name = 5;
        assert_eq!(header.slot_of(5), Some(0));
        assert_eq!(header.free_slot(), Some(1));
        header.directory[1].name = 6;
        assert_eq!(header.free_slot(), None);
    }
}
