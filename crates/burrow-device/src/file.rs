//! File-backed device using POSIX positional I/O.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use burrow_error::{BurrowError, Result};
use tracing::{debug, warn};

use crate::{Device, MappedPage};

/// A device over a real file, using `pread`/`pwrite` style positional I/O.
///
/// Page mappings are created per page, matching the pager's buffer
/// granularity: evicting a mapped page drops exactly its own mapping.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
}

impl FileDevice {
    /// Create a new environment file, truncating an existing one.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created environment file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing environment file for read/write access.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), "opened environment file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The path this device was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                warn!(offset, got = total, want = buf.len(), "short read");
                return Err(BurrowError::ShortRead {
                    offset,
                    expected: buf.len(),
                    actual: total,
                });
            }
            total += n;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    #[allow(unsafe_code)]
    fn map_page(&mut self, offset: u64, len: usize) -> Result<Option<MappedPage>> {
        if offset + len as u64 > self.len()? {
            return Err(BurrowError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mapping past end of file",
            )));
        }
        // SAFETY: the mapping is private to this process and the pager is
        // the only writer of the underlying region while the map is alive.
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(len)
                .map_mut(&self.file)?
        };
        Ok(Some(MappedPage::new(map)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_device() -> (tempfile::TempDir, FileDevice) {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::create(&dir.path().join("test.brw")).unwrap();
        (dir, dev)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_dir, mut dev) = temp_device();
        let data = vec![0xABu8; 4096];
        dev.write_at(8192, &data).unwrap();

        let mut buf = vec![0u8; 4096];
        dev.read_at(8192, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(dev.len().unwrap(), 8192 + 4096);
    }

    #[test]
    fn read_past_end_is_short_read() {
        let (_dir, mut dev) = temp_device();
        dev.write_at(0, &[1, 2, 3]).unwrap();

        let mut buf = vec![0u8; 4096];
        let err = dev.read_at(0, &mut buf).unwrap_err();
        assert!(matches!(err, BurrowError::ShortRead { actual: 3, .. }));
    }

    #[test]
    fn truncate_extends_with_zeroes() {
        let (_dir, mut dev) = temp_device();
        dev.truncate(4096).unwrap();
        assert_eq!(dev.len().unwrap(), 4096);

        let mut buf = vec![0xFFu8; 4096];
        dev.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn map_page_sees_written_data() {
        let (_dir, mut dev) = temp_device();
        let data: Vec<u8> = (0..4096u16).map(|i| (i % 251) as u8).collect();
        dev.write_at(4096, &data).unwrap();

        let map = dev.map_page(4096, 4096).unwrap().unwrap();
        assert_eq!(map.as_slice(), data.as_slice());
    }

    #[test]
    fn map_past_end_fails() {
        let (_dir, mut dev) = temp_device();
        dev.truncate(4096).unwrap();
        assert!(dev.map_page(4096, 4096).is_err());
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.brw");
        {
            let mut dev = FileDevice::create(&path).unwrap();
            dev.write_at(0, b"persistent").unwrap();
            dev.sync().unwrap();
        }
        let mut dev = FileDevice::open(&path).unwrap();
        let mut buf = [0u8; 10];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent");
    }
}
