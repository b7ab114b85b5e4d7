//! Positional access to a raw file.

use std::path::Path;

use dbmbind_core::{Status, StatusCode};
use parking_lot::Mutex;
use tracing::info;

use crate::engine::{EngineResult, OpenOptions, read_only_error};
use crate::lock::LockedFile;

/// Class name reported by [`PositionalFile`].
pub const FILE_CLASS: &str = "PositionalFile";

/// A raw file supporting reads and writes at explicit offsets.
#[derive(Debug)]
pub struct PositionalFile {
    file: Mutex<LockedFile>,
    path: String,
    writable: bool,
    sync_hard: bool,
}

impl PositionalFile {
    /// Open the file at `path`.
    ///
    /// # Errors
    ///
    /// The same open failures as a database file: missing file, contended
    /// lock with `no_wait`, or I/O errors.
    pub fn open(path: &str, writable: bool, options: &OpenOptions) -> EngineResult<Self> {
        if path.is_empty() {
            return Err(Status::with_message(
                StatusCode::InvalidArgumentError,
                "empty file path",
            ));
        }
        let file = LockedFile::open(Path::new(path), writable, options)?;
        info!(path, writable, "opened positional file");
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_owned(),
            writable,
            sync_hard: options.sync_hard,
        })
    }

    /// Class name of the file implementation.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        FILE_CLASS
    }

    /// Read `size` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// `INFEASIBLE_ERROR` when the range extends past the end of the file.
    pub fn read(&self, offset: u64, size: usize) -> EngineResult<Vec<u8>> {
        let mut file = self.file.lock();
        let end = offset.saturating_add(size as u64);
        if end > file.len()? {
            return Err(Status::with_message(
                StatusCode::InfeasibleError,
                "excessive size",
            ));
        }
        let mut buf = vec![0u8; size];
        file.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read the whole content.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn read_all(&self) -> EngineResult<Vec<u8>> {
        self.file.lock().read_all()
    }

    /// Write `data` at `offset`, extending the file as needed.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only file.
    pub fn write(&self, offset: u64, data: &[u8]) -> EngineResult<()> {
        self.ensure_writable()?;
        self.file.lock().write_at(offset, data)
    }

    /// Append `data` and return the offset it was written at.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only file.
    pub fn append(&self, data: &[u8]) -> EngineResult<u64> {
        self.ensure_writable()?;
        self.file.lock().append(data)
    }

    /// Resize the file.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only file.
    pub fn truncate(&self, size: u64) -> EngineResult<()> {
        self.ensure_writable()?;
        self.file.lock().set_len(size)
    }

    /// Flush written data; `hard` forces it to the device. The range is
    /// advisory; the whole file is synchronized.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn synchronize(&self, hard: bool, _offset: u64, _size: u64) -> EngineResult<()> {
        self.file.lock().sync(hard)
    }

    /// Current size in bytes.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn size(&self) -> EngineResult<u64> {
        self.file.lock().len()
    }

    /// Path the file was opened with.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush and release the file.
    ///
    /// # Errors
    ///
    /// I/O failures while flushing.
    pub fn close(self) -> EngineResult<()> {
        let mut file = self.file.into_inner();
        let result = if self.writable {
            file.sync(self.sync_hard)
        } else {
            Ok(())
        };
        info!(path = %file.path().display(), "closed positional file");
        result
    }

    fn ensure_writable(&self) -> EngineResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(read_only_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(dir: &tempfile::TempDir) -> PositionalFile {
        let path = dir.path().join("file.txt");
        PositionalFile::open(path.to_str().unwrap(), true, &OpenOptions::default()).unwrap()
    }

    #[test]
    fn test_write_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_temp(&dir);
        file.write(5, b"12345").unwrap();
        file.write(0, b"ABCDE").unwrap();
        assert_eq!(file.size().unwrap(), 10);
        assert_eq!(file.read(3, 4).unwrap(), b"DE12");
        assert_eq!(file.append(b"FGH").unwrap(), 10);
        assert_eq!(file.append(b"IJ").unwrap(), 13);
        assert_eq!(file.read_all().unwrap(), b"ABCDE12345FGHIJ");
    }

    #[test]
    fn test_read_past_end_is_infeasible() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_temp(&dir);
        file.write(0, b"abc").unwrap();
        assert_eq!(file.read(2, 2).unwrap_err(), StatusCode::InfeasibleError);
        assert_eq!(file.read(3, 0).unwrap(), b"");
    }

    #[test]
    fn test_truncate_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_temp(&dir);
        file.write(0, b"abcdef").unwrap();
        file.truncate(2).unwrap();
        assert_eq!(file.size().unwrap(), 2);
        file.synchronize(true, 0, 0).unwrap();
        file.close().unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        open_temp(&dir).close().unwrap();
        let path = dir.path().join("file.txt");
        let file =
            PositionalFile::open(path.to_str().unwrap(), false, &OpenOptions::default()).unwrap();
        assert_eq!(file.write(0, b"x").unwrap_err(), StatusCode::PermissionError);
    }
}
