//! The file handle.
//!
//! Unlike a database, an unopened file is not a contract violation: its
//! operations return `PRECONDITION_ERROR` statuses. Only a destructed file
//! raises.

use std::sync::Arc;

use dbmbind_core::{Status, StatusCode};
use dbmbind_engine::search::search_lines;
use dbmbind_engine::{EngineResult, PositionalFile};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::bridge::Dispatch;
use crate::encoding::{Encoding, RString};
use crate::error::{BindingError, BindingResult};
use crate::marshal;
use crate::params::{OpenParams, Params};
use crate::runtime::Runtime;
use crate::value::{HostValue, bytes_of};

pub(crate) struct OpenFile {
    pub(crate) file: PositionalFile,
    concurrent: bool,
    encoding: Encoding,
}

pub(crate) enum FileState {
    Closed,
    Open(OpenFile),
    Destructed,
}

/// The binding between a file handle and its open file.
pub(crate) struct FileSlot {
    state: RwLock<FileState>,
}

impl FileSlot {
    /// The open file, if any.
    pub(crate) fn open_file<'a>(
        guard: &'a RwLockReadGuard<'_, FileState>,
    ) -> Option<&'a OpenFile> {
        match &**guard {
            FileState::Open(open) => Some(open),
            FileState::Closed | FileState::Destructed => None,
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read_recursive()
    }
}

fn not_opened() -> Status {
    Status::with_message(StatusCode::PreconditionError, "not opened file")
}

/// A handle to a raw file accessed by offset.
pub struct File {
    runtime: Arc<Runtime>,
    slot: Arc<FileSlot>,
}

impl File {
    /// Create an unopened handle.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            slot: Arc::new(FileSlot {
                state: RwLock::new(FileState::Closed),
            }),
        }
    }

    /// Open a file. Accepts the same binding parameters as a database open.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`] and
    /// [`BindingError::UnknownEncoding`] for an unsupported encoding.
    pub fn open(&self, path: &str, writable: bool, params: &Params) -> BindingResult<Status> {
        match &*self.slot.read() {
            FileState::Destructed => return Err(BindingError::Destructed("File")),
            FileState::Open(_) => {
                return Ok(Status::with_message(
                    StatusCode::PreconditionError,
                    "opened file",
                ));
            },
            FileState::Closed => {},
        }
        let split = OpenParams::split(params);
        let encoding = self.runtime.encoding(&split.encoding)?;
        let bridge = self.runtime.bridge();
        let file = match bridge.run(split.concurrent, || {
            PositionalFile::open(path, writable, &split.options)
        }) {
            Ok(file) => file,
            Err(status) => return Ok(status),
        };
        let raced = bridge.run_released(|| {
            let mut state = self.slot.state.write();
            if !matches!(*state, FileState::Closed) {
                return Some(file);
            }
            *state = FileState::Open(OpenFile {
                file,
                concurrent: split.concurrent,
                encoding,
            });
            None
        });
        if let Some(file) = raced {
            if let Err(status) = bridge.run_released(|| file.close()) {
                warn!(path, %status, "failed to close file after a racing open");
            }
            return Ok(Status::with_message(
                StatusCode::PreconditionError,
                "opened file",
            ));
        }
        info!(path, writable, concurrent = split.concurrent, "opened file handle");
        Ok(Status::success())
    }

    /// Close the file. Always runs with the host lock released.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn close(&self) -> BindingResult<Status> {
        let bridge = self.runtime.bridge();
        let taken = bridge.run_released(|| {
            let mut state = self.slot.state.write();
            match std::mem::replace(&mut *state, FileState::Closed) {
                FileState::Open(open) => Ok(Some(open)),
                FileState::Closed => Ok(None),
                FileState::Destructed => {
                    *state = FileState::Destructed;
                    Err(BindingError::Destructed("File"))
                },
            }
        })?;
        let Some(open) = taken else {
            return Ok(not_opened());
        };
        Ok(marshal::status_of(bridge.run_released(|| open.file.close())))
    }

    /// Close the file if open and make every later call fail with
    /// [`BindingError::Destructed`].
    pub fn destruct(&self) {
        let previous = self
            .runtime
            .bridge()
            .run_released(|| std::mem::replace(&mut *self.slot.state.write(), FileState::Destructed));
        if let FileState::Open(open) = previous
            && let Err(status) = self.runtime.bridge().run_released(|| open.file.close())
        {
            warn!(%status, "file close failed on destruct");
        }
    }

    /// Run `f` on the open file in the given dispatch mode.
    fn call<R>(
        &self,
        mode: Option<Dispatch>,
        f: impl FnOnce(&PositionalFile) -> EngineResult<R>,
    ) -> BindingResult<(EngineResult<R>, Encoding)> {
        let guard = self.slot.read();
        let open = match &*guard {
            FileState::Destructed => return Err(BindingError::Destructed("File")),
            FileState::Closed => return Ok((Err(not_opened()), Encoding::Binary)),
            FileState::Open(open) => open,
        };
        let mode = mode.unwrap_or(Dispatch::for_concurrent(open.concurrent));
        let result = self.runtime.bridge().dispatch(mode, || f(&open.file));
        Ok((result, open.encoding))
    }

    /// Read `size` bytes at `off`; negative arguments count as zero.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn read(
        &self,
        off: i64,
        size: i64,
        status: Option<&mut Status>,
    ) -> BindingResult<Option<RString>> {
        let off = u64::try_from(off).unwrap_or(0);
        let size = usize::try_from(size).unwrap_or(0);
        let (result, encoding) = self.call(None, |file| file.read(off, size))?;
        Ok(marshal::settle(result, status).map(|data| marshal::string(data, encoding)))
    }

    /// Write `data` at `off`.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn write(&self, off: i64, data: impl Into<HostValue>) -> BindingResult<Status> {
        let off = u64::try_from(off).unwrap_or(0);
        let data = bytes_of(data);
        let (result, _) = self.call(None, |file| file.write(off, &data))?;
        Ok(marshal::status_of(result))
    }

    /// Append `data` and return the offset it was written at.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn append(
        &self,
        data: impl Into<HostValue>,
        status: Option<&mut Status>,
    ) -> BindingResult<Option<i64>> {
        let data = bytes_of(data);
        let (result, _) = self.call(None, |file| file.append(&data))?;
        Ok(marshal::settle(result, status).map(|off| i64::try_from(off).unwrap_or(i64::MAX)))
    }

    /// Resize the file. Always runs with the host lock released.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn truncate(&self, size: i64) -> BindingResult<Status> {
        let size = u64::try_from(size).unwrap_or(0);
        let (result, _) = self.call(Some(Dispatch::Released), |file| file.truncate(size))?;
        Ok(marshal::status_of(result))
    }

    /// Flush written data; a hard flush runs with the host lock released.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn synchronize(&self, hard: bool, off: i64, size: i64) -> BindingResult<Status> {
        let off = u64::try_from(off).unwrap_or(0);
        let size = u64::try_from(size).unwrap_or(0);
        let mode = hard.then_some(Dispatch::Released);
        let (result, _) = self.call(mode, |file| file.synchronize(hard, off, size))?;
        Ok(marshal::status_of(result))
    }

    /// Current size in bytes, `None` when unavailable.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn get_size(&self) -> BindingResult<Option<i64>> {
        let (result, _) = self.call(None, PositionalFile::size)?;
        Ok(result
            .ok()
            .map(|size| i64::try_from(size).unwrap_or(i64::MAX)))
    }

    /// Path the file was opened with, `None` when not open.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn get_path(&self) -> BindingResult<Option<String>> {
        let (result, _) = self.call(None, |file| Ok(file.path().to_owned()))?;
        Ok(result.ok())
    }

    /// Lines matching `pattern` under `mode`; a `capacity` of zero or less
    /// is unlimited.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`], and a raised
    /// [`BindingError::Status`] when the search fails, including on an
    /// unopened file.
    pub fn search(
        &self,
        mode: &str,
        pattern: impl Into<HostValue>,
        capacity: i64,
    ) -> BindingResult<Vec<RString>> {
        let pattern = bytes_of(pattern);
        let capacity = usize::try_from(capacity).unwrap_or(0);
        let (result, encoding) = self.call(None, |file| {
            search_lines(&file.read_all()?, mode, &pattern, capacity)
        })?;
        Ok(marshal::list(result?, encoding))
    }

    /// `Class:"path":size`, or `unknown:"":-1` for an unopened file.
    ///
    /// # Errors
    ///
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn describe(&self) -> BindingResult<String> {
        let (result, _) = self.call(None, |file| {
            let size = file.size().map_or(-1, |s| i64::try_from(s).unwrap_or(i64::MAX));
            Ok(format!("{}:{:?}:{size}", file.class_name(), file.path()))
        })?;
        Ok(result.unwrap_or_else(|_| "unknown:\"\":-1".to_owned()))
    }

    /// Run `f` on the open file without dispatching. Used when another
    /// handle's operation takes this file as an argument.
    pub(crate) fn with_positional<R>(
        &self,
        f: impl FnOnce(&PositionalFile) -> R,
    ) -> BindingResult<R> {
        let guard = self.slot.read();
        match &*guard {
            FileState::Open(open) => Ok(f(&open.file)),
            FileState::Closed => Err(BindingError::FileNotOpened),
            FileState::Destructed => Err(BindingError::Destructed("File")),
        }
    }

    pub(crate) fn slot(&self) -> &Arc<FileSlot> {
        &self.slot
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.destruct();
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.slot.read() {
            FileState::Closed => "closed",
            FileState::Open(_) => "open",
            FileState::Destructed => "destructed",
        };
        f.debug_struct("File").field("state", &state).finish_non_exhaustive()
    }
}
