//! Locked file handles shared by the database and positional file engines.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dbmbind_core::{Status, StatusCode};
use fs2::FileExt;
use tracing::debug;

use crate::engine::{EngineResult, OpenOptions};

/// An open file holding an advisory lock for as long as it lives.
///
/// Writable opens take an exclusive lock and read-only opens a shared one,
/// unless `no_lock` was requested. The lock is released on drop.
#[derive(Debug)]
pub(crate) struct LockedFile {
    file: fs::File,
    path: PathBuf,
    locked: bool,
}

impl LockedFile {
    pub(crate) fn open(path: &Path, writable: bool, options: &OpenOptions) -> EngineResult<Self> {
        let exists = path.exists();
        if !exists && (options.no_create || !writable) {
            return Err(Status::with_message(
                StatusCode::NotFoundError,
                format!("no such file: {}", path.display()),
            ));
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable && !options.no_create)
            .truncate(false)
            .open(path)
            .map_err(|e| io_status(&e, "open failed"))?;

        let locked = !options.no_lock;
        if locked {
            acquire(&file, writable, options.no_wait)?;
        }

        let locked_file = Self {
            file,
            path: path.to_path_buf(),
            locked,
        };
        if writable && options.truncate {
            locked_file.file.set_len(0).map_err(|e| io_status(&e, "truncate failed"))?;
        }
        debug!(path = %path.display(), writable, locked, "opened file");
        Ok(locked_file)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> EngineResult<u64> {
        self.file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|e| io_status(&e, "stat failed"))
    }

    pub(crate) fn modified_secs(&self) -> Option<f64> {
        let modified = self.file.metadata().ok()?.modified().ok()?;
        let since = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
        Some(since.as_secs_f64())
    }

    pub(crate) fn read_all(&mut self) -> EngineResult<Vec<u8>> {
        let mut data = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut data))
            .map_err(|e| io_status(&e, "read failed"))?;
        Ok(data)
    }

    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> EngineResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| io_status(&e, "read failed"))
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> EngineResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| io_status(&e, "write failed"))
    }

    /// Write at the current end and return the offset the data starts at.
    pub(crate) fn append(&mut self, data: &[u8]) -> EngineResult<u64> {
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_status(&e, "seek failed"))?;
        self.file
            .write_all(data)
            .map_err(|e| io_status(&e, "write failed"))?;
        Ok(offset)
    }

    pub(crate) fn set_len(&mut self, len: u64) -> EngineResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| io_status(&e, "truncate failed"))
    }

    /// Replace the whole content through the locked descriptor.
    pub(crate) fn rewrite(&mut self, data: &[u8], hard: bool) -> EngineResult<()> {
        self.set_len(0)?;
        self.write_at(0, data)?;
        self.sync(hard)
    }

    pub(crate) fn sync(&mut self, hard: bool) -> EngineResult<()> {
        self.file.flush().map_err(|e| io_status(&e, "flush failed"))?;
        if hard {
            self.file
                .sync_all()
                .map_err(|e| io_status(&e, "sync failed"))?;
        }
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

fn acquire(file: &fs::File, exclusive: bool, no_wait: bool) -> EngineResult<()> {
    let result = match (exclusive, no_wait) {
        (true, true) => file.try_lock_exclusive(),
        (true, false) => file.lock_exclusive(),
        (false, true) => FileExt::try_lock_shared(file),
        (false, false) => FileExt::lock_shared(file),
    };
    result.map_err(|e| {
        if no_wait {
            Status::with_message(StatusCode::InfeasibleError, format!("lock failed: {e}"))
        } else {
            io_status(&e, "lock failed")
        }
    })
}

/// Write a fresh file at `path` with `data`.
pub(crate) fn write_new_file(path: &Path, data: &[u8], hard: bool) -> EngineResult<()> {
    let mut file = fs::File::create(path).map_err(|e| io_status(&e, "create failed"))?;
    file.write_all(data)
        .map_err(|e| io_status(&e, "write failed"))?;
    if hard {
        file.sync_all().map_err(|e| io_status(&e, "sync failed"))?;
    }
    Ok(())
}

pub(crate) fn io_status(err: &io::Error, what: &str) -> Status {
    let code = match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFoundError,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionError,
        io::ErrorKind::UnexpectedEof => StatusCode::InfeasibleError,
        _ => StatusCode::SystemError,
    };
    Status::with_message(code, format!("{what}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_read_only_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LockedFile::open(&dir.path().join("absent"), false, &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err, StatusCode::NotFoundError);
    }

    #[test]
    fn test_no_create_refuses_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = OpenOptions {
            no_create: true,
            ..OpenOptions::default()
        };
        let err = LockedFile::open(&dir.path().join("absent"), true, &options).unwrap_err();
        assert_eq!(err, StatusCode::NotFoundError);
    }

    #[test]
    fn test_second_exclusive_open_fails_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let options = OpenOptions {
            no_wait: true,
            ..OpenOptions::default()
        };
        let _first = LockedFile::open(&path, true, &options).unwrap();
        let err = LockedFile::open(&path, true, &options).unwrap_err();
        assert_eq!(err, StatusCode::InfeasibleError);
    }

    #[test]
    fn test_no_lock_allows_sharing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared");
        let options = OpenOptions {
            no_wait: true,
            no_lock: true,
            ..OpenOptions::default()
        };
        let _first = LockedFile::open(&path, true, &options).unwrap();
        assert!(LockedFile::open(&path, true, &options).is_ok());
    }

    #[test]
    fn test_append_returns_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut file =
            LockedFile::open(&dir.path().join("data"), true, &OpenOptions::default()).unwrap();
        assert_eq!(file.append(b"abc").unwrap(), 0);
        assert_eq!(file.append(b"de").unwrap(), 3);
        assert_eq!(file.read_all().unwrap(), b"abcde");
        file.rewrite(b"xy", false).unwrap();
        assert_eq!(file.len().unwrap(), 2);
    }
}
