//! The database handle.
//!
//! A [`Database`] owns a slot that is either empty or bound to an open
//! engine. Iterators and async executors created from it keep a shared
//! reference to the slot plus the generation they were created under, so a
//! close (or a close followed by a reopen) turns their later calls into
//! [`BindingError::NotOpened`] instead of touching a dead engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dbmbind_core::{Status, StatusCode};
use dbmbind_engine::records::{
    export_keys_as_lines, export_to_flat_records, import_from_flat_records,
};
use dbmbind_engine::search::search_engine;
use dbmbind_engine::{Engine, open_database, restore_database};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::encoding::{Encoding, RString};
use crate::error::{BindingError, BindingResult};
use crate::file::File;
use crate::iterator::DbIterator;
use crate::marshal::{self, RecordMap};
use crate::params::{OpenParams, Params};
use crate::runtime::Runtime;
use crate::value::{HostValue, bytes_of, keys_of, optional_bytes_of, optional_records_of, records_of};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// An engine bound to a database handle.
pub(crate) struct OpenDb {
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) concurrent: bool,
    pub(crate) encoding: Encoding,
    pub(crate) generation: u64,
}

/// The binding between a handle and its engine.
#[derive(Default)]
pub(crate) struct DbSlot {
    state: RwLock<Option<OpenDb>>,
}

impl DbSlot {
    /// Shared access to the slot. Recursive so a thread already reading the
    /// slot (through a second handle on the same database) never waits on
    /// a queued writer.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Option<OpenDb>> {
        self.state.read_recursive()
    }

    /// The open engine, if it is still the one created under `generation`.
    pub(crate) fn current<'a>(
        guard: &'a RwLockReadGuard<'_, Option<OpenDb>>,
        generation: u64,
    ) -> Option<&'a OpenDb> {
        guard.as_ref().filter(|open| open.generation == generation)
    }
}

/// A handle to a key-value database.
pub struct Database {
    runtime: Arc<Runtime>,
    slot: Arc<DbSlot>,
}

impl Database {
    /// Create an unopened handle.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            slot: Arc::new(DbSlot::default()),
        }
    }

    /// Open a database.
    ///
    /// The binding consumes `concurrent`, `truncate`, `no_create`,
    /// `no_wait`, `no_lock`, `sync_hard` and `encoding`; every other
    /// parameter (including `num_shards` and `dbm`) is passed to the engine.
    /// A non-negative `num_shards` opens a sharded database.
    ///
    /// # Errors
    ///
    /// [`BindingError::AlreadyOpened`] when the handle is open and
    /// [`BindingError::UnknownEncoding`] for an unsupported encoding. Engine
    /// failures are returned as a status.
    pub fn open(&self, path: &str, writable: bool, params: &Params) -> BindingResult<Status> {
        if self.slot.read().is_some() {
            return Err(BindingError::AlreadyOpened);
        }
        let split = OpenParams::split(params);
        let encoding = self.runtime.encoding(&split.encoding)?;
        let bridge = self.runtime.bridge();
        let engine = match bridge.run(split.concurrent, || {
            open_database(path, writable, &split.options, &split.engine)
        }) {
            Ok(engine) => engine,
            Err(status) => {
                debug!(path, %status, "database open failed");
                return Ok(status);
            },
        };

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let raced = bridge.run_released(|| {
            let mut state = self.slot.state.write();
            if state.is_some() {
                return Some(engine);
            }
            *state = Some(OpenDb {
                engine,
                concurrent: split.concurrent,
                encoding,
                generation,
            });
            None
        });
        if let Some(engine) = raced {
            if let Err(status) = bridge.run_released(|| engine.close()) {
                warn!(path, %status, "failed to close engine after a racing open");
            }
            return Err(BindingError::AlreadyOpened);
        }
        info!(
            path,
            writable,
            concurrent = split.concurrent,
            encoding = %encoding,
            "opened database"
        );
        Ok(Status::success())
    }

    /// Close the database and unbind the handle.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is not open. Flush
    /// failures are returned as a status.
    pub fn close(&self) -> BindingResult<Status> {
        let bridge = self.runtime.bridge();
        let open = bridge
            .run_released(|| self.slot.state.write().take())
            .ok_or(BindingError::NotOpened)?;
        let status = marshal::status_of(bridge.run_released(|| open.engine.close()));
        info!(generation = open.generation, %status, "closed database");
        Ok(status)
    }

    /// Close the database if it is open, logging rather than returning any
    /// failure.
    pub fn destruct(&self) {
        match self.close() {
            Ok(status) if !status.is_ok() => warn!(%status, "database close failed on destruct"),
            Ok(_) | Err(_) => {},
        }
    }

    /// Whether the handle is bound to an open engine.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.slot.read().is_some()
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub(crate) fn slot(&self) -> &Arc<DbSlot> {
        &self.slot
    }

    /// Run `f` against the open engine in the handle's dispatch mode.
    fn call<R>(&self, f: impl FnOnce(&dyn Engine) -> R) -> BindingResult<R> {
        self.fetch(f).map(|(result, _)| result)
    }

    /// Like [`Self::call`], also returning the handle's encoding.
    fn fetch<R>(&self, f: impl FnOnce(&dyn Engine) -> R) -> BindingResult<(R, Encoding)> {
        let guard = self.slot.read();
        let open = guard.as_ref().ok_or(BindingError::NotOpened)?;
        let result = self
            .runtime
            .bridge()
            .run(open.concurrent, || f(open.engine.as_ref()));
        Ok((result, open.encoding))
    }

    /// Run `f` with the host lock released regardless of handle mode.
    fn call_released<R>(&self, f: impl FnOnce(&dyn Engine) -> R) -> BindingResult<R> {
        let guard = self.slot.read();
        let open = guard.as_ref().ok_or(BindingError::NotOpened)?;
        Ok(self.runtime.bridge().run_released(|| f(open.engine.as_ref())))
    }

    // ------------------------------------------------------------------
    // Single-record operations
    // ------------------------------------------------------------------

    /// Fetch the value of a key.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed; a missing key
    /// is `None` with `NOT_FOUND_ERROR` reported through `status`.
    pub fn get(
        &self,
        key: impl Into<HostValue>,
        status: Option<&mut Status>,
    ) -> BindingResult<Option<RString>> {
        let key = bytes_of(key);
        let (result, encoding) = self.fetch(|engine| engine.get(&key))?;
        Ok(marshal::settle(result, status).map(|value| marshal::string(value, encoding)))
    }

    /// Store a value.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn set(
        &self,
        key: impl Into<HostValue>,
        value: impl Into<HostValue>,
        overwrite: bool,
    ) -> BindingResult<Status> {
        let (key, value) = (bytes_of(key), bytes_of(value));
        self.call(|engine| marshal::status_of(engine.set(&key, &value, overwrite)))
    }

    /// Store a value and return the previous one.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn set_and_get(
        &self,
        key: impl Into<HostValue>,
        value: impl Into<HostValue>,
        overwrite: bool,
    ) -> BindingResult<(Status, Option<RString>)> {
        let (key, value) = (bytes_of(key), bytes_of(value));
        let (result, encoding) = self.fetch(|engine| engine.set_and_get(&key, &value, overwrite))?;
        Ok(match result {
            Ok((status, old)) => (status, old.map(|v| marshal::string(v, encoding))),
            Err(status) => (status, None),
        })
    }

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn remove(&self, key: impl Into<HostValue>) -> BindingResult<Status> {
        let key = bytes_of(key);
        self.call(|engine| marshal::status_of(engine.remove(&key)))
    }

    /// Remove a record and return its value.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn remove_and_get(
        &self,
        key: impl Into<HostValue>,
    ) -> BindingResult<(Status, Option<RString>)> {
        let key = bytes_of(key);
        let (result, encoding) = self.fetch(|engine| engine.remove_and_get(&key))?;
        Ok(match result {
            Ok(value) => (Status::success(), Some(marshal::string(value, encoding))),
            Err(status) => (status, None),
        })
    }

    /// Append to a value, joining with `delim`.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn append(
        &self,
        key: impl Into<HostValue>,
        value: impl Into<HostValue>,
        delim: impl Into<HostValue>,
    ) -> BindingResult<Status> {
        let (key, value, delim) = (bytes_of(key), bytes_of(value), bytes_of(delim));
        self.call(|engine| marshal::status_of(engine.append(&key, &value, &delim)))
    }

    /// Replace a value only if the current state matches `expected`; `nil`
    /// on either side means "absent".
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn compare_exchange(
        &self,
        key: impl Into<HostValue>,
        expected: impl Into<HostValue>,
        desired: impl Into<HostValue>,
    ) -> BindingResult<Status> {
        let key = bytes_of(key);
        let expected = optional_bytes_of(expected);
        let desired = optional_bytes_of(desired);
        self.call(|engine| {
            marshal::status_of(engine.compare_exchange(
                &key,
                expected.as_deref(),
                desired.as_deref(),
            ))
        })
    }

    /// Add to a numeric record and return the new value.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn increment(
        &self,
        key: impl Into<HostValue>,
        inc: impl Into<HostValue>,
        init: impl Into<HostValue>,
        status: Option<&mut Status>,
    ) -> BindingResult<Option<i64>> {
        let key = bytes_of(key);
        let (inc, init) = (inc.into().to_i64(), init.into().to_i64());
        let result = self.call(|engine| engine.increment(&key, inc, init))?;
        Ok(marshal::settle(result, status))
    }

    /// Rename a record.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn rekey(
        &self,
        old_key: impl Into<HostValue>,
        new_key: impl Into<HostValue>,
        overwrite: bool,
        copying: bool,
    ) -> BindingResult<Status> {
        let (old_key, new_key) = (bytes_of(old_key), bytes_of(new_key));
        self.call(|engine| {
            marshal::status_of(engine.rekey(&old_key, &new_key, overwrite, copying))
        })
    }

    /// Remove and return the first record.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn pop_first(
        &self,
        status: Option<&mut Status>,
    ) -> BindingResult<Option<(RString, RString)>> {
        let (result, encoding) = self.fetch(|engine| engine.pop_first())?;
        Ok(marshal::settle(result, status).map(|(key, value)| {
            (marshal::string(key, encoding), marshal::string(value, encoding))
        }))
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Fetch several keys; missing keys are left out of the result.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn get_multi<K, I>(&self, keys: I) -> BindingResult<RecordMap>
    where
        I: IntoIterator<Item = K>,
        K: Into<HostValue>,
    {
        let keys = keys_of(keys);
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let ((_, records), encoding) = self.fetch(|engine| engine.get_multi(&refs))?;
        Ok(marshal::map(records, encoding))
    }

    /// Store several records.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn set_multi<K, V, I>(&self, records: I, overwrite: bool) -> BindingResult<Status>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<HostValue>,
        V: Into<HostValue>,
    {
        let records = records_of(records);
        let refs = pair_refs(&records);
        self.call(|engine| engine.set_multi(&refs, overwrite))
    }

    /// Remove several records.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn remove_multi<K, I>(&self, keys: I) -> BindingResult<Status>
    where
        I: IntoIterator<Item = K>,
        K: Into<HostValue>,
    {
        let keys = keys_of(keys);
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        self.call(|engine| engine.remove_multi(&refs))
    }

    /// Append to several records.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn append_multi<K, V, I>(
        &self,
        records: I,
        delim: impl Into<HostValue>,
    ) -> BindingResult<Status>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<HostValue>,
        V: Into<HostValue>,
    {
        let records = records_of(records);
        let refs = pair_refs(&records);
        let delim = bytes_of(delim);
        self.call(|engine| engine.append_multi(&refs, &delim))
    }

    /// Check every expected pair and then apply every desired pair as one
    /// atomic step. `nil` values mean "absent" and "remove".
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn compare_exchange_multi<K1, V1, I1, K2, V2, I2>(
        &self,
        expected: I1,
        desired: I2,
    ) -> BindingResult<Status>
    where
        I1: IntoIterator<Item = (K1, V1)>,
        K1: Into<HostValue>,
        V1: Into<HostValue>,
        I2: IntoIterator<Item = (K2, V2)>,
        K2: Into<HostValue>,
        V2: Into<HostValue>,
    {
        let expected = optional_records_of(expected);
        let desired = optional_records_of(desired);
        let expected_refs = optional_pair_refs(&expected);
        let desired_refs = optional_pair_refs(&desired);
        self.call(|engine| {
            marshal::status_of(engine.compare_exchange_multi(&expected_refs, &desired_refs))
        })
    }

    // ------------------------------------------------------------------
    // Whole-database operations
    // ------------------------------------------------------------------

    /// Number of records, `None` on failure.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn count(&self) -> BindingResult<Option<i64>> {
        self.call(|engine| engine.count().ok())
    }

    /// Size of the data on storage, `None` on failure.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn file_size(&self) -> BindingResult<Option<i64>> {
        self.call(|engine| engine.file_size().ok())
    }

    /// Path of the data file, `None` on failure.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn file_path(&self) -> BindingResult<Option<String>> {
        self.call(|engine| engine.file_path().ok())
    }

    /// Seconds since the epoch of the last update, `None` on failure.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn timestamp(&self) -> BindingResult<Option<f64>> {
        self.call(|engine| engine.timestamp().ok())
    }

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn clear(&self) -> BindingResult<Status> {
        self.call(|engine| marshal::status_of(engine.clear()))
    }

    /// Rebuild the database to reclaim space.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn rebuild(&self, params: &Params) -> BindingResult<Status> {
        self.call(|engine| marshal::status_of(engine.rebuild(params)))
    }

    /// Whether a rebuild would reclaim space.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn should_be_rebuilt(&self) -> BindingResult<bool> {
        self.call(|engine| engine.should_be_rebuilt())
    }

    /// Flush updates; `hard` forces them to the device and always runs with
    /// the host lock released.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn synchronize(&self, hard: bool, params: &Params) -> BindingResult<Status> {
        let sync = |engine: &dyn Engine| marshal::status_of(engine.synchronize(hard, params));
        if hard {
            self.call_released(sync)
        } else {
            self.call(sync)
        }
    }

    /// Copy the data files to `dest`.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn copy_file_data(&self, dest: &str, sync_hard: bool) -> BindingResult<Status> {
        self.call_released(|engine| marshal::status_of(engine.copy_file_data(dest, sync_hard)))
    }

    /// Copy every record into another database.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when either handle is closed.
    pub fn export(&self, dest: &Database) -> BindingResult<Status> {
        let dest_guard = dest.slot.read();
        let dest_open = dest_guard.as_ref().ok_or(BindingError::NotOpened)?;
        self.call(|engine| marshal::status_of(engine.export(dest_open.engine.as_ref())))
    }

    /// Append every record to `file` as flat records.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed, and
    /// [`BindingError::FileNotOpened`] when `file` is not open.
    pub fn export_to_flat_records(&self, file: &File) -> BindingResult<Status> {
        file.with_positional(|dest| {
            self.call(|engine| marshal::status_of(export_to_flat_records(engine, dest)))
        })?
    }

    /// Store every flat record read from `file`.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed, and
    /// [`BindingError::FileNotOpened`] when `file` is not open.
    pub fn import_from_flat_records(&self, file: &File) -> BindingResult<Status> {
        file.with_positional(|src| {
            self.call(|engine| marshal::status_of(import_from_flat_records(engine, src)))
        })?
    }

    /// Append every key to `file`, one per line.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed, and
    /// [`BindingError::FileNotOpened`] when `file` is not open.
    pub fn export_keys_as_lines(&self, file: &File) -> BindingResult<Status> {
        file.with_positional(|dest| {
            self.call(|engine| marshal::status_of(export_keys_as_lines(engine, dest)))
        })?
    }

    /// Engine properties, including `class` and `path`.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn inspect_details(&self) -> BindingResult<BTreeMap<String, String>> {
        self.call(|engine| engine.inspect().into_iter().collect())
    }

    /// Whether the database accepts updates.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn is_writable(&self) -> BindingResult<bool> {
        self.call(|engine| engine.is_writable())
    }

    /// Whether the database is free of detected damage.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn is_healthy(&self) -> BindingResult<bool> {
        self.call(|engine| engine.is_healthy())
    }

    /// Whether records are kept in key order.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn is_ordered(&self) -> BindingResult<bool> {
        self.call(|engine| engine.is_ordered())
    }

    /// Keys matching `pattern` under `mode`; a `capacity` of zero or less
    /// is unlimited.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed, and a raised
    /// [`BindingError::Status`] when the search fails.
    pub fn search(
        &self,
        mode: &str,
        pattern: impl Into<HostValue>,
        capacity: i64,
    ) -> BindingResult<Vec<RString>> {
        let pattern = bytes_of(pattern);
        let capacity = usize::try_from(capacity).unwrap_or(0);
        let (result, encoding) =
            self.fetch(|engine| search_engine(engine, mode, &pattern, capacity))?;
        Ok(marshal::list(result?, encoding))
    }

    /// Create an iterator over the records.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn make_iterator(&self) -> BindingResult<DbIterator> {
        let guard = self.slot.read();
        let open = guard.as_ref().ok_or(BindingError::NotOpened)?;
        Ok(DbIterator::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.slot),
            open.generation,
            open.concurrent,
            open.encoding,
        ))
    }

    /// Call `visit` with every record in order until it returns `false`.
    ///
    /// Records are fetched one at a time; `visit` runs with no engine call
    /// in progress and may update the database.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed, before or
    /// during the walk.
    pub fn each(&self, mut visit: impl FnMut(RString, RString) -> bool) -> BindingResult<()> {
        let iter = self.make_iterator()?;
        iter.first()?;
        while let Some((key, value)) = iter.step(None)? {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    /// `Class:"path":count`.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the handle is closed.
    pub fn describe(&self) -> BindingResult<String> {
        self.call(|engine| {
            let mut class_name = "unknown".to_owned();
            let mut path = "-".to_owned();
            for (name, value) in engine.inspect() {
                match name.as_str() {
                    "class" => class_name = value,
                    "path" => path = value,
                    _ => {},
                }
            }
            let count = engine.count().unwrap_or(-1);
            format!("{class_name}:{path:?}:{count}")
        })
    }

    /// Salvage the intact records of a damaged database into a new one.
    /// Always runs with the host lock released.
    #[must_use]
    pub fn restore_database(
        runtime: &Runtime,
        old_path: &str,
        new_path: &str,
        class_name: &str,
        end_offset: i64,
    ) -> Status {
        marshal::status_of(
            runtime
                .bridge()
                .run_released(|| restore_database(old_path, new_path, class_name, end_offset)),
        )
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.is_open() {
            self.destruct();
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn pair_refs(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
    records
        .iter()
        .map(|(key, value)| (key.as_slice(), value.as_slice()))
        .collect()
}

fn optional_pair_refs(records: &[(Vec<u8>, Option<Vec<u8>>)]) -> Vec<(&[u8], Option<&[u8]>)> {
    records
        .iter()
        .map(|(key, value)| (key.as_slice(), value.as_deref()))
        .collect()
}

/// A status reported when an operation reaches a handle that was closed
/// after the operation was issued.
pub(crate) fn closed_status() -> Status {
    Status::with_message(StatusCode::PreconditionError, "not opened database")
}
