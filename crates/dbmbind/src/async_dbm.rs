//! Asynchronous executor over a database.
//!
//! Each operation copies its arguments into owned buffers, is queued on a
//! dedicated blocking pool, and returns a [`Future`] at once. Workers hold
//! only weak references to the database slot; an operation that starts
//! after the database was closed completes with `PRECONDITION_ERROR`.

use std::sync::{Arc, Weak};

use dbmbind_core::{Status, StatusCode};
use dbmbind_engine::records::{export_to_flat_records, import_from_flat_records};
use dbmbind_engine::search::search_engine;
use dbmbind_engine::Engine;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::database::{Database, DbSlot, closed_status};
use crate::encoding::Encoding;
use crate::error::{BindingError, BindingResult};
use crate::file::{File, FileSlot};
use crate::future::{Completion, Future, Promise};
use crate::marshal::{self, Payload, Shape};
use crate::params::Params;
use crate::runtime::Runtime;
use crate::value::{
    HostValue, bytes_of, keys_of, optional_bytes_of, optional_records_of, records_of,
};

/// Count of queued or running operations.
#[derive(Debug, Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn begin(self: &Arc<Self>) -> InflightGuard {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        InflightGuard(Arc::clone(self))
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

struct WorkerPool {
    executor: tokio::runtime::Runtime,
    inflight: Arc<Inflight>,
}

/// Runs database operations on a pool of worker threads.
pub struct AsyncDbm {
    runtime: Arc<Runtime>,
    slot: Weak<DbSlot>,
    generation: u64,
    concurrent: bool,
    encoding: Encoding,
    num_workers: usize,
    pool: Mutex<Option<WorkerPool>>,
}

impl AsyncDbm {
    /// Create an executor running at most `num_workers` operations at a
    /// time. Zero is treated as one.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when `db` is closed and
    /// [`BindingError::Runtime`] when the worker pool cannot be started.
    pub fn new(db: &Database, num_workers: usize) -> BindingResult<Self> {
        let (generation, concurrent, encoding) = {
            let guard = db.slot().read();
            let open = guard.as_ref().ok_or(BindingError::NotOpened)?;
            (open.generation, open.concurrent, open.encoding)
        };
        let num_workers = num_workers.max(1);
        let executor = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(num_workers)
            .thread_name("dbmbind-async")
            .build()
            .map_err(|e| BindingError::Runtime(format!("failed to start worker pool: {e}")))?;
        info!(num_workers, "async executor started");
        Ok(Self {
            runtime: Arc::clone(db.runtime()),
            slot: Arc::downgrade(db.slot()),
            generation,
            concurrent,
            encoding,
            num_workers,
            pool: Mutex::new(Some(WorkerPool {
                executor,
                inflight: Arc::new(Inflight::default()),
            })),
        })
    }

    /// Create an executor with the configured default worker count.
    ///
    /// # Errors
    ///
    /// As [`Self::new`].
    pub fn with_default_workers(db: &Database) -> BindingResult<Self> {
        Self::new(db, db.runtime().config().default_async_workers)
    }

    /// Queue `op` against the database and return its future.
    fn submit<F>(&self, shape: Shape, op: F) -> BindingResult<Future>
    where
        F: FnOnce(&dyn Engine) -> Payload + Send + 'static,
    {
        let pool = self.pool.lock();
        let pool = pool.as_ref().ok_or(BindingError::Destructed("AsyncDBM"))?;
        let slot = self.slot.upgrade().ok_or(BindingError::NotOpened)?;
        if DbSlot::current(&slot.read(), self.generation).is_none() {
            return Err(BindingError::NotOpened);
        }
        drop(slot);

        let completion = Arc::new(Completion::new());
        let promise = Promise::new(
            Arc::clone(&completion),
            Payload::failure(
                shape,
                Status::with_message(StatusCode::CanceledError, "operation dropped"),
            ),
        );
        let guard = pool.inflight.begin();
        let slot = Weak::clone(&self.slot);
        let generation = self.generation;
        pool.executor.spawn_blocking(move || {
            let _inflight = guard;
            let payload = match slot.upgrade() {
                Some(slot) => {
                    let state = slot.read();
                    match DbSlot::current(&state, generation) {
                        Some(open) => op(open.engine.as_ref()),
                        None => Payload::failure(shape, closed_status()),
                    }
                },
                None => Payload::failure(shape, closed_status()),
            };
            promise.fulfill(payload);
        });
        Ok(Future::new(
            Arc::clone(&self.runtime),
            completion,
            self.concurrent,
            self.encoding,
        ))
    }

    /// Fetch the value of a key.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] when the database is closed and
    /// [`BindingError::Destructed`] after [`Self::destruct`]; the same holds
    /// for every other operation.
    pub fn get(&self, key: impl Into<HostValue>) -> BindingResult<Future> {
        let key = bytes_of(key);
        self.submit(Shape::String, move |engine| match engine.get(&key) {
            Ok(value) => Payload::String(Status::success(), Some(value)),
            Err(status) => Payload::String(status, None),
        })
    }

    /// Fetch several keys. The status is `NOT_FOUND_ERROR` when any key is
    /// missing; the map holds the keys that were found.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn get_multi<K, I>(&self, keys: I) -> BindingResult<Future>
    where
        I: IntoIterator<Item = K>,
        K: Into<HostValue>,
    {
        let keys = keys_of(keys);
        self.submit(Shape::StringMap, move |engine| {
            let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
            let (status, records) = engine.get_multi(&refs);
            Payload::StringMap(status, records)
        })
    }

    /// Store a value.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn set(
        &self,
        key: impl Into<HostValue>,
        value: impl Into<HostValue>,
        overwrite: bool,
    ) -> BindingResult<Future> {
        let (key, value) = (bytes_of(key), bytes_of(value));
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.set(&key, &value, overwrite))
        })
    }

    /// Store several records.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn set_multi<K, V, I>(&self, records: I, overwrite: bool) -> BindingResult<Future>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<HostValue>,
        V: Into<HostValue>,
    {
        let records = records_of(records);
        self.submit(Shape::Status, move |engine| {
            let refs: Vec<(&[u8], &[u8])> = records
                .iter()
                .map(|(key, value)| (key.as_slice(), value.as_slice()))
                .collect();
            Payload::Status(engine.set_multi(&refs, overwrite))
        })
    }

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn remove(&self, key: impl Into<HostValue>) -> BindingResult<Future> {
        let key = bytes_of(key);
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.remove(&key))
        })
    }

    /// Remove several records.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn remove_multi<K, I>(&self, keys: I) -> BindingResult<Future>
    where
        I: IntoIterator<Item = K>,
        K: Into<HostValue>,
    {
        let keys = keys_of(keys);
        self.submit(Shape::Status, move |engine| {
            let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
            Payload::Status(engine.remove_multi(&refs))
        })
    }

    /// Append to a value, joining with `delim`.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn append(
        &self,
        key: impl Into<HostValue>,
        value: impl Into<HostValue>,
        delim: impl Into<HostValue>,
    ) -> BindingResult<Future> {
        let (key, value, delim) = (bytes_of(key), bytes_of(value), bytes_of(delim));
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.append(&key, &value, &delim))
        })
    }

    /// Append to several records.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn append_multi<K, V, I>(
        &self,
        records: I,
        delim: impl Into<HostValue>,
    ) -> BindingResult<Future>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<HostValue>,
        V: Into<HostValue>,
    {
        let records = records_of(records);
        let delim = bytes_of(delim);
        self.submit(Shape::Status, move |engine| {
            let refs: Vec<(&[u8], &[u8])> = records
                .iter()
                .map(|(key, value)| (key.as_slice(), value.as_slice()))
                .collect();
            Payload::Status(engine.append_multi(&refs, &delim))
        })
    }

    /// Conditionally replace a value; `nil` means "absent".
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn compare_exchange(
        &self,
        key: impl Into<HostValue>,
        expected: impl Into<HostValue>,
        desired: impl Into<HostValue>,
    ) -> BindingResult<Future> {
        let key = bytes_of(key);
        let expected = optional_bytes_of(expected);
        let desired = optional_bytes_of(desired);
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.compare_exchange(
                &key,
                expected.as_deref(),
                desired.as_deref(),
            ))
        })
    }

    /// Add to a numeric record.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn increment(
        &self,
        key: impl Into<HostValue>,
        inc: impl Into<HostValue>,
        init: impl Into<HostValue>,
    ) -> BindingResult<Future> {
        let key = bytes_of(key);
        let (inc, init) = (inc.into().to_i64(), init.into().to_i64());
        self.submit(Shape::Integer, move |engine| {
            match engine.increment(&key, inc, init) {
                Ok(value) => Payload::Integer(Status::success(), value),
                Err(status) => Payload::Integer(status, 0),
            }
        })
    }

    /// Check and apply several records atomically.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn compare_exchange_multi<K1, V1, I1, K2, V2, I2>(
        &self,
        expected: I1,
        desired: I2,
    ) -> BindingResult<Future>
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
        self.submit(Shape::Status, move |engine| {
            let expected: Vec<(&[u8], Option<&[u8]>)> = expected
                .iter()
                .map(|(key, value)| (key.as_slice(), value.as_deref()))
                .collect();
            let desired: Vec<(&[u8], Option<&[u8]>)> = desired
                .iter()
                .map(|(key, value)| (key.as_slice(), value.as_deref()))
                .collect();
            Payload::from_unit(engine.compare_exchange_multi(&expected, &desired))
        })
    }

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn clear(&self) -> BindingResult<Future> {
        self.submit(Shape::Status, |engine| Payload::from_unit(engine.clear()))
    }

    /// Rebuild the database.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn rebuild(&self, params: &Params) -> BindingResult<Future> {
        let params = params.clone();
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.rebuild(&params))
        })
    }

    /// Flush updates.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn synchronize(&self, hard: bool, params: &Params) -> BindingResult<Future> {
        let params = params.clone();
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.synchronize(hard, &params))
        })
    }

    /// Copy the data files to `dest`.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn copy_file_data(&self, dest: &str, sync_hard: bool) -> BindingResult<Future> {
        let dest = dest.to_owned();
        self.submit(Shape::Status, move |engine| {
            Payload::from_unit(engine.copy_file_data(&dest, sync_hard))
        })
    }

    /// Copy every record into another database.
    ///
    /// # Errors
    ///
    /// As [`Self::get`], and [`BindingError::NotOpened`] when `dest` is
    /// closed.
    pub fn export(&self, dest: &Database) -> BindingResult<Future> {
        let dest_generation = dest
            .slot()
            .read()
            .as_ref()
            .map(|open| open.generation)
            .ok_or(BindingError::NotOpened)?;
        let dest_slot = Arc::downgrade(dest.slot());
        self.submit(Shape::Status, move |engine| {
            let Some(dest_slot) = dest_slot.upgrade() else {
                return Payload::Status(closed_status());
            };
            let state = dest_slot.read();
            match DbSlot::current(&state, dest_generation) {
                Some(dest) => Payload::from_unit(engine.export(dest.engine.as_ref())),
                None => Payload::Status(closed_status()),
            }
        })
    }

    /// Append every record to `file` as flat records.
    ///
    /// # Errors
    ///
    /// As [`Self::get`], and [`BindingError::FileNotOpened`] when `file` is
    /// not open.
    pub fn export_to_flat_records(&self, file: &File) -> BindingResult<Future> {
        let file_slot = Self::file_slot(file)?;
        self.submit(Shape::Status, move |engine| {
            with_file(&file_slot, |dest| export_to_flat_records(engine, dest))
        })
    }

    /// Store every flat record read from `file`.
    ///
    /// # Errors
    ///
    /// As [`Self::export_to_flat_records`].
    pub fn import_from_flat_records(&self, file: &File) -> BindingResult<Future> {
        let file_slot = Self::file_slot(file)?;
        self.submit(Shape::Status, move |engine| {
            with_file(&file_slot, |src| import_from_flat_records(engine, src))
        })
    }

    /// Keys matching `pattern` under `mode`; a `capacity` of zero or less
    /// is unlimited.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn search(
        &self,
        mode: &str,
        pattern: impl Into<HostValue>,
        capacity: i64,
    ) -> BindingResult<Future> {
        let mode = mode.to_owned();
        let pattern = bytes_of(pattern);
        let capacity = usize::try_from(capacity).unwrap_or(0);
        self.submit(Shape::StringList, move |engine| {
            match search_engine(engine, &mode, &pattern, capacity) {
                Ok(keys) => Payload::StringList(Status::success(), keys),
                Err(status) => Payload::StringList(status, Vec::new()),
            }
        })
    }

    fn file_slot(file: &File) -> BindingResult<Weak<FileSlot>> {
        file.with_positional(|_| ())?;
        Ok(Arc::downgrade(file.slot()))
    }

    /// `AsyncDbm:<workers>`, or `AsyncDbm:destructed`.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.pool.lock().is_some() {
            format!("AsyncDbm:{}", self.num_workers)
        } else {
            "AsyncDbm:destructed".to_owned()
        }
    }

    /// Wait for queued operations to finish and stop the workers. Futures
    /// already returned stay valid; later submissions fail with
    /// [`BindingError::Destructed`].
    pub fn destruct(&self) {
        let Some(pool) = self.pool.lock().take() else {
            return;
        };
        self.runtime
            .bridge()
            .run_released(|| pool.inflight.wait_idle());
        pool.executor.shutdown_background();
        debug!("async executor stopped");
    }
}

impl Drop for AsyncDbm {
    fn drop(&mut self) {
        self.destruct();
    }
}

impl std::fmt::Debug for AsyncDbm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDbm")
            .field("num_workers", &self.num_workers)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Run `f` on the file behind `slot`, or report it closed.
fn with_file(
    slot: &Weak<FileSlot>,
    f: impl FnOnce(&dbmbind_engine::PositionalFile) -> dbmbind_engine::EngineResult<()>,
) -> Payload {
    let not_opened = || Status::with_message(StatusCode::PreconditionError, "not opened file");
    let Some(slot) = slot.upgrade() else {
        return Payload::Status(not_opened());
    };
    let state = slot.read();
    match FileSlot::open_file(&state) {
        Some(open) => Payload::Status(marshal::status_of(f(&open.file))),
        None => Payload::Status(not_opened()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureValue;

    fn open_memory() -> Database {
        let db = Database::new(Runtime::with_defaults());
        db.open("", true, &Params::new()).unwrap();
        db
    }

    #[test]
    fn test_set_then_get() {
        let db = open_memory();
        let executor = AsyncDbm::new(&db, 2).unwrap();
        assert!(executor.set("k", "v", true).unwrap().get().unwrap().status().is_ok());
        match executor.get("k").unwrap().get().unwrap() {
            FutureValue::String(status, Some(value)) => {
                assert!(status.is_ok());
                assert_eq!(value, "v");
            },
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_get_multi_reports_missing_keys() {
        let db = open_memory();
        db.set("a", "1", true).unwrap();
        let executor = AsyncDbm::new(&db, 1).unwrap();
        match executor.get_multi(["a", "b"]).unwrap().get().unwrap() {
            FutureValue::StringMap(status, records) => {
                assert_eq!(status, StatusCode::NotFoundError);
                assert_eq!(records.len(), 1);
                assert_eq!(records[b"a".as_slice()], "1");
            },
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_submit_after_close_is_contract_error() {
        let db = open_memory();
        let executor = AsyncDbm::new(&db, 1).unwrap();
        db.close().unwrap();
        assert!(matches!(executor.get("k"), Err(BindingError::NotOpened)));
    }

    #[test]
    fn test_destruct_waits_and_keeps_futures() {
        let db = open_memory();
        let executor = AsyncDbm::new(&db, 4).unwrap();
        let futures: Vec<Future> = (0..20)
            .map(|_| executor.increment("counter", 1, 0).unwrap())
            .collect();
        executor.destruct();
        assert!(matches!(executor.clear(), Err(BindingError::Destructed(_))));
        for future in &futures {
            assert!(future.wait(Some(std::time::Duration::ZERO)).unwrap());
        }
        assert_eq!(db.increment("counter", i64::MIN, 0, None).unwrap(), Some(20));
    }

    #[test]
    fn test_zero_workers_is_one() {
        let db = open_memory();
        let executor = AsyncDbm::new(&db, 0).unwrap();
        assert_eq!(executor.describe(), "AsyncDbm:1");
    }
}
