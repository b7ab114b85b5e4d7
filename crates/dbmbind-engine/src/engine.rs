//! The engine contract consumed by the binding layer.

use std::collections::BTreeMap;

use dbmbind_core::{Status, StatusCode};

/// Result of an engine call.
pub type EngineResult<T> = Result<T, Status>;

/// Engine tuning parameters, already stripped of binding-private keys.
pub type Params = BTreeMap<String, String>;

/// A record as returned by navigation calls.
pub type Record = (Vec<u8>, Vec<u8>);

/// What a [`Engine::process`] callback wants done with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// Leave the record as it is.
    Noop,
    /// Store the given value.
    Set(Vec<u8>),
    /// Remove the record.
    Remove,
}

/// Navigation target for [`Engine::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek<'a> {
    /// The least key.
    First,
    /// The greatest key.
    Last,
    /// The least key greater than or equal to the given key.
    AtOrAfter(&'a [u8]),
    /// The least key strictly greater than the given key.
    After(&'a [u8]),
    /// The greatest key less than or equal to the given key.
    AtOrBefore(&'a [u8]),
    /// The greatest key strictly less than the given key.
    Before(&'a [u8]),
}

impl Seek<'_> {
    /// Whether the target lies on the descending side.
    #[must_use]
    pub fn is_backward(&self) -> bool {
        matches!(self, Seek::Last | Seek::AtOrBefore(_) | Seek::Before(_))
    }
}

/// Options applied when a database or file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct OpenOptions {
    /// Wipe existing content on open.
    pub truncate: bool,
    /// Fail instead of creating a missing file.
    pub no_create: bool,
    /// Fail instead of blocking on a contended file lock.
    pub no_wait: bool,
    /// Skip file locking.
    pub no_lock: bool,
    /// Use fsync-strength durability on synchronize and close.
    pub sync_hard: bool,
}

/// A key-value storage engine.
///
/// All methods take `&self`; implementations provide their own internal
/// synchronization. Ordering guarantees between concurrent callers are
/// whatever the implementation's locks give and nothing more.
pub trait Engine: Send + Sync {
    /// Class name reported by `inspect`.
    fn class_name(&self) -> &'static str;

    /// Fetch the value of a key.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` when the key is absent.
    fn get(&self, key: &[u8]) -> EngineResult<Vec<u8>>;

    /// Run a read-modify-write callback on one record under the record's lock.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only database.
    fn process(
        &self,
        key: &[u8],
        proc: &mut dyn FnMut(Option<&[u8]>) -> RecordAction,
    ) -> EngineResult<()>;

    /// Atomically check every `expected` pair and then apply every `desired`
    /// pair. `None` on the expected side means "absent"; on the desired side
    /// it means "remove".
    ///
    /// # Errors
    ///
    /// `INFEASIBLE_ERROR` when any expectation does not hold; nothing is
    /// modified in that case.
    fn compare_exchange_multi(
        &self,
        expected: &[(&[u8], Option<&[u8]>)],
        desired: &[(&[u8], Option<&[u8]>)],
    ) -> EngineResult<()>;

    /// Remove and return the first record.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` when the database is empty.
    fn pop_first(&self) -> EngineResult<Record>;

    /// Locate a record by key order.
    ///
    /// # Errors
    ///
    /// Engine-level failures only; a missing target is `Ok(None)`.
    fn seek(&self, target: Seek<'_>) -> EngineResult<Option<Record>>;

    /// Visit a consistent snapshot of every record in key order until the
    /// visitor returns `false`.
    ///
    /// # Errors
    ///
    /// Engine-level failures.
    fn for_each(&self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> EngineResult<()>;

    /// Number of records.
    ///
    /// # Errors
    ///
    /// Engine-level failures.
    fn count(&self) -> EngineResult<i64>;

    /// Size of the backing storage in bytes.
    ///
    /// # Errors
    ///
    /// Engine-level failures.
    fn file_size(&self) -> EngineResult<i64>;

    /// Path of the backing storage; empty for in-memory databases.
    ///
    /// # Errors
    ///
    /// Engine-level failures.
    fn file_path(&self) -> EngineResult<String>;

    /// Seconds since the epoch of the last modification.
    ///
    /// # Errors
    ///
    /// Engine-level failures.
    fn timestamp(&self) -> EngineResult<f64>;

    /// Remove every record.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only database.
    fn clear(&self) -> EngineResult<()>;

    /// Compact the backing storage.
    ///
    /// # Errors
    ///
    /// I/O failures while rewriting.
    fn rebuild(&self, params: &Params) -> EngineResult<()>;

    /// Whether a rebuild would be worthwhile.
    fn should_be_rebuilt(&self) -> bool;

    /// Flush in-memory state to the backing storage.
    ///
    /// # Errors
    ///
    /// I/O failures while writing.
    fn synchronize(&self, hard: bool, params: &Params) -> EngineResult<()>;

    /// Write a copy of the database content to `dest`.
    ///
    /// # Errors
    ///
    /// I/O failures while writing.
    fn copy_file_data(&self, dest: &str, sync_hard: bool) -> EngineResult<()>;

    /// Descriptive properties as name/value pairs.
    fn inspect(&self) -> Vec<(String, String)>;

    /// Whether the database accepts updates.
    fn is_writable(&self) -> bool;

    /// Whether the database is free of detected damage.
    fn is_healthy(&self) -> bool;

    /// Whether navigation follows key order.
    fn is_ordered(&self) -> bool;

    /// Flush and release the backing storage.
    ///
    /// # Errors
    ///
    /// I/O failures while flushing.
    fn close(&self) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Single-record operations built on `process`
    // ------------------------------------------------------------------

    /// Store a value.
    ///
    /// # Errors
    ///
    /// `DUPLICATION_ERROR` when the key exists and `overwrite` is false.
    fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> EngineResult<()> {
        let mut status = Status::success();
        self.process(key, &mut |current| {
            if current.is_some() && !overwrite {
                status = Status::new(StatusCode::DuplicationError);
                RecordAction::Noop
            } else {
                RecordAction::Set(value.to_vec())
            }
        })?;
        status.into_result()
    }

    /// Store a value and return the previous one.
    ///
    /// # Errors
    ///
    /// `DUPLICATION_ERROR` when the key exists and `overwrite` is false; the
    /// existing value is still returned.
    fn set_and_get(
        &self,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
    ) -> EngineResult<(Status, Option<Vec<u8>>)> {
        let mut status = Status::success();
        let mut old = None;
        self.process(key, &mut |current| {
            old = current.map(<[u8]>::to_vec);
            if current.is_some() && !overwrite {
                status = Status::new(StatusCode::DuplicationError);
                RecordAction::Noop
            } else {
                RecordAction::Set(value.to_vec())
            }
        })?;
        Ok((status, old))
    }

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` when the key is absent.
    fn remove(&self, key: &[u8]) -> EngineResult<()> {
        self.remove_and_get(key).map(|_| ())
    }

    /// Remove a record and return its value.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` when the key is absent.
    fn remove_and_get(&self, key: &[u8]) -> EngineResult<Vec<u8>> {
        let mut old = None;
        self.process(key, &mut |current| match current {
            Some(value) => {
                old = Some(value.to_vec());
                RecordAction::Remove
            },
            None => RecordAction::Noop,
        })?;
        old.ok_or_else(|| Status::new(StatusCode::NotFoundError))
    }

    /// Append to an existing value, joining with `delim`; store the value as
    /// is when the key is absent.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only database.
    fn append(&self, key: &[u8], value: &[u8], delim: &[u8]) -> EngineResult<()> {
        self.process(key, &mut |current| match current {
            Some(existing) => {
                let mut joined = Vec::with_capacity(
                    existing
                        .len()
                        .saturating_add(delim.len())
                        .saturating_add(value.len()),
                );
                joined.extend_from_slice(existing);
                joined.extend_from_slice(delim);
                joined.extend_from_slice(value);
                RecordAction::Set(joined)
            },
            None => RecordAction::Set(value.to_vec()),
        })
    }

    /// Conditionally replace a value.
    ///
    /// # Errors
    ///
    /// `INFEASIBLE_ERROR` when the current state does not match `expected`.
    fn compare_exchange(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        desired: Option<&[u8]>,
    ) -> EngineResult<()> {
        let mut status = Status::success();
        self.process(key, &mut |current| {
            if current != expected {
                status = Status::new(StatusCode::InfeasibleError);
                return RecordAction::Noop;
            }
            match desired {
                Some(value) => RecordAction::Set(value.to_vec()),
                None if current.is_some() => RecordAction::Remove,
                None => RecordAction::Noop,
            }
        })?;
        status.into_result()
    }

    /// Add `inc` to a numeric value stored as an 8-byte big-endian integer,
    /// starting from `init` when the key is absent. An increment of
    /// `i64::MIN` reads the current value without writing.
    ///
    /// # Errors
    ///
    /// `PERMISSION_ERROR` on a read-only database.
    fn increment(&self, key: &[u8], inc: i64, init: i64) -> EngineResult<i64> {
        let mut result = init;
        self.process(key, &mut |current| {
            let base = current.map_or(init, decode_int);
            if inc == i64::MIN {
                result = base;
                return RecordAction::Noop;
            }
            result = base.wrapping_add(inc);
            RecordAction::Set(encode_int(result))
        })?;
        Ok(result)
    }

    /// Rename a record.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND_ERROR` when `old_key` is absent; `DUPLICATION_ERROR` when
    /// `new_key` exists and `overwrite` is false.
    fn rekey(
        &self,
        old_key: &[u8],
        new_key: &[u8],
        overwrite: bool,
        copying: bool,
    ) -> EngineResult<()> {
        let value = self.get(old_key)?;
        if old_key == new_key {
            return Ok(());
        }
        self.set(new_key, &value, overwrite)?;
        if !copying {
            self.remove(old_key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Fetch several keys. Missing keys are skipped and reported as
    /// `NOT_FOUND_ERROR` in the returned status.
    fn get_multi(&self, keys: &[&[u8]]) -> (Status, BTreeMap<Vec<u8>, Vec<u8>>) {
        let mut status = Status::success();
        let mut records = BTreeMap::new();
        for key in keys {
            match self.get(key) {
                Ok(value) => {
                    records.insert(key.to_vec(), value);
                },
                Err(err) if err == StatusCode::NotFoundError => status |= err,
                Err(err) => {
                    status |= err;
                    break;
                },
            }
        }
        (status, records)
    }

    /// Store several records, continuing past duplicate keys.
    fn set_multi(&self, records: &[(&[u8], &[u8])], overwrite: bool) -> Status {
        batch(records, StatusCode::DuplicationError, |(key, value)| {
            self.set(key, value, overwrite)
        })
    }

    /// Remove several records, continuing past missing keys.
    fn remove_multi(&self, keys: &[&[u8]]) -> Status {
        batch(keys, StatusCode::NotFoundError, |key| self.remove(key))
    }

    /// Append to several records.
    fn append_multi(&self, records: &[(&[u8], &[u8])], delim: &[u8]) -> Status {
        batch(records, StatusCode::Success, |(key, value)| {
            self.append(key, value, delim)
        })
    }

    /// Copy every record into another engine.
    ///
    /// # Errors
    ///
    /// The first failure reported by `dest`.
    fn export(&self, dest: &dyn Engine) -> EngineResult<()> {
        let mut status = Status::success();
        self.for_each(&mut |key, value| {
            if let Err(err) = dest.set(key, value, true) {
                status = err;
                return false;
            }
            true
        })?;
        status.into_result()
    }
}

/// Run `op` over each item, joining failures into one status. Failures with
/// the `tolerated` code are recorded and skipped; any other failure stops the
/// batch.
fn batch<T: Copy>(
    items: &[T],
    tolerated: StatusCode,
    mut op: impl FnMut(T) -> EngineResult<()>,
) -> Status {
    let mut status = Status::success();
    for item in items {
        if let Err(err) = op(*item) {
            let stop = err != tolerated;
            status |= err;
            if stop {
                break;
            }
        }
    }
    status
}

/// Encode an integer the way `increment` stores it.
#[must_use]
pub fn encode_int(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decode a big-endian integer of up to eight bytes; longer input keeps its
/// last eight bytes.
#[must_use]
pub fn decode_int(data: &[u8]) -> i64 {
    let tail = data.get(data.len().saturating_sub(8)..).unwrap_or(data);
    let mut buf = [0u8; 8];
    let start = 8usize.saturating_sub(tail.len());
    if let Some(dest) = buf.get_mut(start..) {
        dest.copy_from_slice(tail);
    }
    i64::from_be_bytes(buf)
}

pub(crate) fn read_only_error() -> Status {
    Status::with_message(StatusCode::PermissionError, "not writable database")
}

pub(crate) fn closed_error() -> Status {
    Status::with_message(StatusCode::PreconditionError, "not opened database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_codec() {
        assert_eq!(decode_int(&encode_int(-5)), -5);
        assert_eq!(decode_int(&encode_int(i64::MAX)), i64::MAX);
        assert_eq!(decode_int(&[0x01, 0x00]), 256);
        assert_eq!(decode_int(b""), 0);
    }

    #[test]
    fn test_seek_direction() {
        assert!(Seek::Last.is_backward());
        assert!(Seek::Before(b"a").is_backward());
        assert!(!Seek::After(b"a").is_backward());
        assert!(!Seek::First.is_backward());
    }

    #[test]
    fn test_batch_tolerates_expected_failures() {
        let items = [1, 2, 3];
        let mut seen = Vec::new();
        let status = batch(&items, StatusCode::NotFoundError, |n| {
            seen.push(n);
            if n == 2 {
                Err(Status::new(StatusCode::NotFoundError))
            } else {
                Ok(())
            }
        });
        assert_eq!(status, StatusCode::NotFoundError);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_batch_stops_on_hard_failure() {
        let items = [1, 2, 3];
        let mut seen = Vec::new();
        let status = batch(&items, StatusCode::NotFoundError, |n| {
            seen.push(n);
            if n == 2 {
                Err(Status::new(StatusCode::SystemError))
            } else {
                Ok(())
            }
        });
        assert_eq!(status, StatusCode::SystemError);
        assert_eq!(seen, vec![1, 2]);
    }
}
