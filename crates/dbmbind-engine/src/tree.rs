//! Ordered in-memory engine with optional file persistence.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dbmbind_core::{Status, StatusCode};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use crate::engine::{
    Engine, EngineResult, OpenOptions, Params, Record, RecordAction, Seek, closed_error,
    read_only_error,
};
use crate::lock::{LockedFile, write_new_file};
use crate::records::{read_pairs, write_pair};

/// Magic prefix of a tree data file.
pub const TREE_MAGIC: &[u8; 8] = b"DBMBTREE";

/// Class name reported by [`TreeEngine`].
pub const TREE_CLASS: &str = "StdTreeDBM";

pub(crate) type RecordMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered engine keeping every record in a `BTreeMap`.
///
/// With an empty path the database lives purely in memory. Otherwise the
/// data file is loaded on open and rewritten on synchronize and close.
#[derive(Debug)]
pub struct TreeEngine {
    records: RwLock<RecordMap>,
    file: Mutex<Option<LockedFile>>,
    path: String,
    writable: bool,
    sync_hard: bool,
    open: AtomicBool,
    healthy: AtomicBool,
    modified_micros: AtomicU64,
    garbage: AtomicU64,
}

impl TreeEngine {
    /// A writable in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_records(String::new(), None, true, false, RecordMap::new())
    }

    /// Open a database at `path`; an empty path gives an in-memory database.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` for a missing file that may not be created,
    /// `INFEASIBLE_ERROR` for a contended lock with `no_wait`, and
    /// `BROKEN_DATA_ERROR` for a damaged data file.
    pub fn open(path: &str, writable: bool, options: &OpenOptions) -> EngineResult<Self> {
        if path.is_empty() {
            return Ok(Self::with_records(
                String::new(),
                None,
                writable,
                options.sync_hard,
                RecordMap::new(),
            ));
        }
        let mut file = LockedFile::open(Path::new(path), writable, options)?;
        let records = decode_data_file(&file.read_all()?)?;
        let modified = file.modified_secs();
        info!(path, writable, records = records.len(), "opened tree database");
        let engine = Self::with_records(
            path.to_owned(),
            Some(file),
            writable,
            options.sync_hard,
            records,
        );
        if let Some(secs) = modified {
            engine.modified_micros.store(secs_to_micros(secs), Ordering::Relaxed);
        }
        Ok(engine)
    }

    fn with_records(
        path: String,
        file: Option<LockedFile>,
        writable: bool,
        sync_hard: bool,
        records: RecordMap,
    ) -> Self {
        Self {
            records: RwLock::new(records),
            file: Mutex::new(file),
            path,
            writable,
            sync_hard,
            open: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            modified_micros: AtomicU64::new(now_micros()),
            garbage: AtomicU64::new(0),
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(closed_error())
        }
    }

    fn ensure_writable(&self) -> EngineResult<()> {
        self.ensure_open()?;
        if self.writable {
            Ok(())
        } else {
            Err(read_only_error())
        }
    }

    pub(crate) fn touch(&self) {
        self.modified_micros.store(now_micros(), Ordering::Relaxed);
    }

    fn add_garbage(&self) {
        self.garbage.fetch_add(1, Ordering::Relaxed);
    }

    /// Exclusive access to the record map for multi-shard transactions.
    pub(crate) fn lock_records(&self) -> EngineResult<RwLockWriteGuard<'_, RecordMap>> {
        self.ensure_writable()?;
        Ok(self.records.write())
    }

    pub(crate) fn snapshot(&self) -> EngineResult<RecordMap> {
        self.ensure_open()?;
        Ok(self.records.read().clone())
    }

    fn persist(&self, hard: bool) -> EngineResult<()> {
        if !self.writable {
            return Ok(());
        }
        let mut file = self.file.lock();
        let Some(file) = file.as_mut() else {
            return Ok(());
        };
        let data = encode_data_file(&self.records.read());
        file.rewrite(&data, hard || self.sync_hard)?;
        self.garbage.store(0, Ordering::Relaxed);
        debug!(path = %self.path, bytes = data.len(), "persisted tree database");
        Ok(())
    }
}

impl Engine for TreeEngine {
    fn class_name(&self) -> &'static str {
        TREE_CLASS
    }

    fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        self.ensure_open()?;
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Status::new(StatusCode::NotFoundError))
    }

    fn process(
        &self,
        key: &[u8],
        proc: &mut dyn FnMut(Option<&[u8]>) -> RecordAction,
    ) -> EngineResult<()> {
        self.ensure_writable()?;
        let mut records = self.records.write();
        let action = proc(records.get(key).map(Vec::as_slice));
        match action {
            RecordAction::Noop => return Ok(()),
            RecordAction::Set(value) => {
                if records.insert(key.to_vec(), value).is_some() {
                    self.add_garbage();
                }
            },
            RecordAction::Remove => {
                records.remove(key);
                self.add_garbage();
            },
        }
        self.touch();
        Ok(())
    }

    fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], Option<&[u8]>)],
        desired: &[(&[u8], Option<&[u8]>)],
    ) -> EngineResult<()> {
        let mut guards = [self.lock_records()?];
        exchange_in(&mut guards, |_| 0, expected, desired)?;
        self.touch();
        Ok(())
    }

    fn pop_first(&self) -> EngineResult<Record> {
        self.ensure_writable()?;
        let record = self
            .records
            .write()
            .pop_first()
            .ok_or_else(|| Status::new(StatusCode::NotFoundError))?;
        self.add_garbage();
        self.touch();
        Ok(record)
    }

    fn seek(&self, target: Seek<'_>) -> EngineResult<Option<Record>> {
        self.ensure_open()?;
        Ok(seek_in(&self.records.read(), target))
    }

    fn for_each(&self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> EngineResult<()> {
        for (key, value) in &self.snapshot()? {
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> EngineResult<i64> {
        self.ensure_open()?;
        Ok(i64::try_from(self.records.read().len()).unwrap_or(i64::MAX))
    }

    fn file_size(&self) -> EngineResult<i64> {
        self.ensure_open()?;
        if let Some(file) = self.file.lock().as_ref() {
            return Ok(i64::try_from(file.len()?).unwrap_or(i64::MAX));
        }
        let size = self
            .records
            .read()
            .iter()
            .fold(0usize, |acc, (k, v)| acc.saturating_add(k.len()).saturating_add(v.len()));
        Ok(i64::try_from(size).unwrap_or(i64::MAX))
    }

    fn file_path(&self) -> EngineResult<String> {
        self.ensure_open()?;
        Ok(self.path.clone())
    }

    fn timestamp(&self) -> EngineResult<f64> {
        self.ensure_open()?;
        #[allow(clippy::cast_precision_loss)]
        let micros = self.modified_micros.load(Ordering::Relaxed) as f64;
        Ok(micros / 1_000_000.0)
    }

    fn clear(&self) -> EngineResult<()> {
        self.ensure_writable()?;
        self.records.write().clear();
        self.touch();
        Ok(())
    }

    fn rebuild(&self, _params: &Params) -> EngineResult<()> {
        self.ensure_open()?;
        self.persist(false)
    }

    fn should_be_rebuilt(&self) -> bool {
        let garbage = self.garbage.load(Ordering::Relaxed);
        let live = self.records.read().len() as u64;
        self.file.lock().is_some() && garbage > live
    }

    fn synchronize(&self, hard: bool, _params: &Params) -> EngineResult<()> {
        self.ensure_open()?;
        self.persist(hard)
    }

    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> EngineResult<()> {
        self.ensure_open()?;
        let data = encode_data_file(&self.records.read());
        write_new_file(Path::new(dest), &data, sync_hard)
    }

    fn inspect(&self) -> Vec<(String, String)> {
        let count = self.records.read().len();
        vec![
            ("class".to_owned(), TREE_CLASS.to_owned()),
            ("path".to_owned(), self.path.clone()),
            ("num_records".to_owned(), count.to_string()),
            ("writable".to_owned(), self.writable.to_string()),
            ("healthy".to_owned(), self.is_healthy().to_string()),
        ]
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn is_ordered(&self) -> bool {
        true
    }

    fn close(&self) -> EngineResult<()> {
        self.ensure_open()?;
        let result = self.persist(false);
        if result.is_err() {
            self.healthy.store(false, Ordering::Relaxed);
        }
        self.open.store(false, Ordering::Release);
        self.file.lock().take();
        info!(path = %self.path, "closed tree database");
        result
    }
}

/// Look up a navigation target in one record map.
pub(crate) fn seek_in(records: &RecordMap, target: Seek<'_>) -> Option<Record> {
    let found = match target {
        Seek::First => records.iter().next(),
        Seek::Last => records.iter().next_back(),
        Seek::AtOrAfter(key) => records
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next(),
        Seek::After(key) => records
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next(),
        Seek::AtOrBefore(key) => records
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back(),
        Seek::Before(key) => records
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back(),
    };
    found.map(|(k, v)| (k.clone(), v.clone()))
}

/// Check all expectations across locked maps, then apply all updates.
pub(crate) fn exchange_in(
    maps: &mut [RwLockWriteGuard<'_, RecordMap>],
    route: impl Fn(&[u8]) -> usize,
    expected: &[(&[u8], Option<&[u8]>)],
    desired: &[(&[u8], Option<&[u8]>)],
) -> EngineResult<()> {
    for (key, want) in expected {
        let current = maps
            .get(route(key))
            .and_then(|map| map.get(*key))
            .map(Vec::as_slice);
        if current != *want {
            return Err(Status::new(StatusCode::InfeasibleError));
        }
    }
    for (key, value) in desired {
        let Some(map) = maps.get_mut(route(key)) else {
            continue;
        };
        match value {
            Some(value) => {
                map.insert(key.to_vec(), value.to_vec());
            },
            None => {
                map.remove(*key);
            },
        }
    }
    Ok(())
}

pub(crate) fn encode_data_file(records: &RecordMap) -> Vec<u8> {
    let mut data = TREE_MAGIC.to_vec();
    for (key, value) in records {
        write_pair(&mut data, key, value);
    }
    data
}

fn decode_data_file(data: &[u8]) -> EngineResult<RecordMap> {
    if data.is_empty() {
        return Ok(RecordMap::new());
    }
    let body = data
        .strip_prefix(TREE_MAGIC.as_slice())
        .ok_or_else(|| Status::with_message(StatusCode::BrokenDataError, "invalid magic data"))?;
    Ok(read_pairs(body)?.into_iter().collect())
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn secs_to_micros(secs: f64) -> u64 {
    (secs * 1_000_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(keys: &[&str]) -> TreeEngine {
        let engine = TreeEngine::in_memory();
        for key in keys {
            engine.set(key.as_bytes(), key.as_bytes(), true).unwrap();
        }
        engine
    }

    #[test]
    fn test_set_get_remove() {
        let engine = TreeEngine::in_memory();
        engine.set(b"one", b"first", true).unwrap();
        assert_eq!(engine.get(b"one").unwrap(), b"first");
        let err = engine.set(b"one", b"again", false).unwrap_err();
        assert_eq!(err, StatusCode::DuplicationError);
        assert_eq!(engine.get(b"one").unwrap(), b"first");
        engine.remove(b"one").unwrap();
        assert_eq!(engine.get(b"one").unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(engine.remove(b"one").unwrap_err(), StatusCode::NotFoundError);
    }

    #[test]
    fn test_append_and_increment() {
        let engine = TreeEngine::in_memory();
        engine.append(b"k", b"a", b",").unwrap();
        engine.append(b"k", b"b", b",").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"a,b");

        assert_eq!(engine.increment(b"n", 5, 100).unwrap(), 105);
        assert_eq!(engine.increment(b"n", -10, 0).unwrap(), 95);
        assert_eq!(engine.increment(b"n", i64::MIN, 0).unwrap(), 95);
        assert_eq!(engine.increment(b"absent", i64::MIN, 7).unwrap(), 7);
        assert_eq!(engine.get(b"absent").unwrap_err(), StatusCode::NotFoundError);
    }

    #[test]
    fn test_compare_exchange() {
        let engine = TreeEngine::in_memory();
        engine.compare_exchange(b"k", None, Some(b"v")).unwrap();
        let err = engine.compare_exchange(b"k", None, Some(b"v")).unwrap_err();
        assert_eq!(err, StatusCode::InfeasibleError);
        engine.compare_exchange(b"k", Some(b"v"), None).unwrap();
        assert_eq!(engine.count().unwrap(), 0);
    }

    #[test]
    fn test_compare_exchange_multi_is_all_or_nothing() {
        let engine = filled(&["a", "b"]);
        let err = engine
            .compare_exchange_multi(
                &[(b"a", Some(b"a")), (b"b", Some(b"wrong"))],
                &[(b"a", Some(b"A")), (b"c", Some(b"C"))],
            )
            .unwrap_err();
        assert_eq!(err, StatusCode::InfeasibleError);
        assert_eq!(engine.get(b"a").unwrap(), b"a");
        assert_eq!(engine.get(b"c").unwrap_err(), StatusCode::NotFoundError);

        engine
            .compare_exchange_multi(
                &[(b"a", Some(b"a")), (b"c", None)],
                &[(b"a", None), (b"c", Some(b"C"))],
            )
            .unwrap();
        assert_eq!(engine.get(b"a").unwrap_err(), StatusCode::NotFoundError);
        assert_eq!(engine.get(b"c").unwrap(), b"C");
    }

    #[test]
    fn test_seek_targets() {
        let engine = filled(&["a", "m", "z"]);
        let key = |target| engine.seek(target).unwrap().map(|(k, _)| k);
        assert_eq!(key(Seek::First), Some(b"a".to_vec()));
        assert_eq!(key(Seek::Last), Some(b"z".to_vec()));
        assert_eq!(key(Seek::AtOrBefore(b"m")), Some(b"m".to_vec()));
        assert_eq!(key(Seek::Before(b"m")), Some(b"a".to_vec()));
        assert_eq!(key(Seek::AtOrAfter(b"n")), Some(b"z".to_vec()));
        assert_eq!(key(Seek::After(b"z")), None);
        assert_eq!(key(Seek::Before(b"a")), None);
    }

    #[test]
    fn test_batches() {
        let engine = filled(&["a", "b"]);
        let (status, found) = engine.get_multi(&[b"a", b"missing", b"b"]);
        assert_eq!(status, StatusCode::NotFoundError);
        assert_eq!(found.len(), 2);

        let status = engine.remove_multi(&[b"a", b"missing", b"b"]);
        assert_eq!(status, StatusCode::NotFoundError);
        assert_eq!(engine.count().unwrap(), 0);
    }

    #[test]
    fn test_rekey_and_pop_first() {
        let engine = filled(&["a", "b"]);
        engine.rekey(b"a", b"c", true, false).unwrap();
        assert_eq!(engine.get(b"a").unwrap_err(), StatusCode::NotFoundError);
        let err = engine.rekey(b"b", b"c", false, false).unwrap_err();
        assert_eq!(err, StatusCode::DuplicationError);
        engine.rekey(b"b", b"d", true, true).unwrap();
        assert_eq!(engine.get(b"b").unwrap(), b"b");

        assert_eq!(engine.pop_first().unwrap(), (b"b".to_vec(), b"b".to_vec()));
        assert_eq!(engine.count().unwrap(), 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("casket.tree");
        let path = path.to_str().unwrap();
        let options = OpenOptions::default();

        let engine = TreeEngine::open(path, true, &options).unwrap();
        engine.set(b"k", b"v", true).unwrap();
        engine.close().unwrap();
        assert_eq!(engine.get(b"k").unwrap_err(), StatusCode::PreconditionError);

        let engine = TreeEngine::open(path, false, &options).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v");
        assert_eq!(engine.set(b"x", b"y", true).unwrap_err(), StatusCode::PermissionError);
        engine.close().unwrap();

        let truncating = OpenOptions {
            truncate: true,
            ..options
        };
        let engine = TreeEngine::open(path, true, &truncating).unwrap();
        assert_eq!(engine.count().unwrap(), 0);
        engine.close().unwrap();
    }

    #[test]
    fn test_damaged_file_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tree");
        std::fs::write(&path, b"garbage").unwrap();
        let err = TreeEngine::open(path.to_str().unwrap(), true, &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err, StatusCode::BrokenDataError);
    }
}
