//! Cursor over the records of a database.
//!
//! The cursor remembers a key rather than a position inside the engine.
//! Reads relocate to the least live key at or after the remembered one, so
//! records removed behind the iterator's back are skipped instead of
//! invalidating it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dbmbind_core::{Status, StatusCode};
use dbmbind_engine::{Engine, EngineResult, RecordAction, Seek};
use parking_lot::Mutex;

use crate::database::DbSlot;
use crate::encoding::{Encoding, RString};
use crate::error::{BindingError, BindingResult};
use crate::marshal;
use crate::runtime::Runtime;
use crate::value::{HostValue, bytes_of};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Unpositioned,
    At(Vec<u8>),
    Exhausted,
}

/// An iterator bound to the database generation it was created under.
pub struct DbIterator {
    runtime: Arc<Runtime>,
    slot: Arc<DbSlot>,
    generation: u64,
    concurrent: bool,
    encoding: Encoding,
    cursor: Mutex<Cursor>,
    destructed: AtomicBool,
}

impl DbIterator {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        slot: Arc<DbSlot>,
        generation: u64,
        concurrent: bool,
        encoding: Encoding,
    ) -> Self {
        Self {
            runtime,
            slot,
            generation,
            concurrent,
            encoding,
            cursor: Mutex::new(Cursor::Unpositioned),
            destructed: AtomicBool::new(false),
        }
    }

    /// Run `f` with the engine and the cursor, in the handle's dispatch
    /// mode. The cursor lock is taken inside the dispatch so it always
    /// nests within the host lock.
    fn with_cursor<R>(&self, f: impl FnOnce(&dyn Engine, &mut Cursor) -> R) -> BindingResult<R> {
        if self.destructed.load(Ordering::Acquire) {
            return Err(BindingError::Destructed("Iterator"));
        }
        let guard = self.slot.read();
        let open = DbSlot::current(&guard, self.generation).ok_or(BindingError::NotOpened)?;
        Ok(self.runtime.bridge().run(self.concurrent, || {
            let mut cursor = self.cursor.lock();
            f(open.engine.as_ref(), &mut cursor)
        }))
    }

    fn position(&self, target: Seek<'_>) -> BindingResult<Status> {
        self.with_cursor(|engine, cursor| match engine.seek(target) {
            Ok(found) => {
                *cursor = found.map_or(Cursor::Exhausted, |(key, _)| Cursor::At(key));
                Status::success()
            },
            Err(status) => status,
        })
    }

    /// Move to the first record.
    ///
    /// # Errors
    ///
    /// [`BindingError::NotOpened`] once the database is closed, and
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn first(&self) -> BindingResult<Status> {
        self.position(Seek::First)
    }

    /// Move to the last record.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn last(&self) -> BindingResult<Status> {
        self.position(Seek::Last)
    }

    /// Move to the first record whose key is at or after `key`.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn jump(&self, key: impl Into<HostValue>) -> BindingResult<Status> {
        let key = bytes_of(key);
        self.position(Seek::AtOrAfter(&key))
    }

    /// Move to the last record whose key is before `key`, or at it when
    /// `inclusive`.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn jump_lower(&self, key: impl Into<HostValue>, inclusive: bool) -> BindingResult<Status> {
        let key = bytes_of(key);
        self.position(if inclusive {
            Seek::AtOrBefore(&key)
        } else {
            Seek::Before(&key)
        })
    }

    /// Move to the first record whose key is after `key`, or at it when
    /// `inclusive`.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn jump_upper(&self, key: impl Into<HostValue>, inclusive: bool) -> BindingResult<Status> {
        let key = bytes_of(key);
        self.position(if inclusive {
            Seek::AtOrAfter(&key)
        } else {
            Seek::After(&key)
        })
    }

    fn shift(&self, backward: bool) -> BindingResult<Status> {
        self.with_cursor(|engine, cursor| {
            let Cursor::At(key) = &*cursor else {
                return Status::new(StatusCode::NotFoundError);
            };
            let target = if backward {
                Seek::Before(key)
            } else {
                Seek::After(key)
            };
            match engine.seek(target) {
                Ok(found) => {
                    *cursor = found.map_or(Cursor::Exhausted, |(key, _)| Cursor::At(key));
                    Status::success()
                },
                Err(status) => status,
            }
        })
    }

    /// Move to the next record.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn next(&self) -> BindingResult<Status> {
        self.shift(false)
    }

    /// Move to the previous record.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn previous(&self) -> BindingResult<Status> {
        self.shift(true)
    }

    /// The current record.
    ///
    /// # Errors
    ///
    /// As [`Self::first`]; a missing record is `None` with the status
    /// reported through `status`.
    pub fn get(&self, status: Option<&mut Status>) -> BindingResult<Option<(RString, RString)>> {
        let result = self.with_cursor(|engine, cursor| locate(engine, cursor))?;
        Ok(marshal::settle(result, status).map(|(key, value)| self.pair(key, value)))
    }

    /// The key of the current record.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn get_key(&self, status: Option<&mut Status>) -> BindingResult<Option<RString>> {
        Ok(self.get(status)?.map(|(key, _)| key))
    }

    /// The value of the current record.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn get_value(&self, status: Option<&mut Status>) -> BindingResult<Option<RString>> {
        Ok(self.get(status)?.map(|(_, value)| value))
    }

    /// Replace the value of the current record.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn set(&self, value: impl Into<HostValue>) -> BindingResult<Status> {
        let value = bytes_of(value);
        self.with_cursor(|engine, cursor| {
            update_current(engine, cursor, |_| RecordAction::Set(value.clone()))
        })
    }

    /// Remove the current record and move to the one after it, or become
    /// exhausted when it was the last.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn remove(&self) -> BindingResult<Status> {
        self.with_cursor(|engine, cursor| {
            let status = update_current(engine, cursor, |_| RecordAction::Remove);
            if status.is_ok() {
                advance(engine, cursor)
            } else {
                status
            }
        })
    }

    /// Read the current record and move to the next one in a single call.
    ///
    /// # Errors
    ///
    /// As [`Self::get`].
    pub fn step(&self, status: Option<&mut Status>) -> BindingResult<Option<(RString, RString)>> {
        let result = self.with_cursor(|engine, cursor| -> EngineResult<(Vec<u8>, Vec<u8>)> {
            let (key, value) = locate(engine, cursor)?;
            *cursor = engine
                .seek(Seek::After(&key))?
                .map_or(Cursor::Exhausted, |(next, _)| Cursor::At(next));
            Ok((key, value))
        })?;
        Ok(marshal::settle(result, status).map(|(key, value)| self.pair(key, value)))
    }

    /// The current key quoted, or `(unlocated)`.
    ///
    /// # Errors
    ///
    /// As [`Self::first`].
    pub fn describe(&self) -> BindingResult<String> {
        let key = self.get_key(None)?;
        Ok(key.map_or_else(
            || "(unlocated)".to_owned(),
            |key| format!("{:?}", key.to_string_lossy()),
        ))
    }

    /// Release the cursor; later calls fail with
    /// [`BindingError::Destructed`].
    pub fn destruct(&self) {
        self.destructed.store(true, Ordering::Release);
        *self.cursor.lock() = Cursor::Unpositioned;
    }

    fn pair(&self, key: Vec<u8>, value: Vec<u8>) -> (RString, RString) {
        (
            marshal::string(key, self.encoding),
            marshal::string(value, self.encoding),
        )
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("generation", &self.generation)
            .field("cursor", &*self.cursor.lock())
            .finish_non_exhaustive()
    }
}

/// Resolve the cursor to the least live record at or after it.
fn locate(engine: &dyn Engine, cursor: &mut Cursor) -> EngineResult<(Vec<u8>, Vec<u8>)> {
    let Cursor::At(key) = &*cursor else {
        return Err(Status::new(StatusCode::NotFoundError));
    };
    match engine.seek(Seek::AtOrAfter(key))? {
        Some((key, value)) => {
            *cursor = Cursor::At(key.clone());
            Ok((key, value))
        },
        None => {
            *cursor = Cursor::Exhausted;
            Err(Status::new(StatusCode::NotFoundError))
        },
    }
}

/// Move a positioned cursor to the record after its key.
fn advance(engine: &dyn Engine, cursor: &mut Cursor) -> Status {
    let Cursor::At(key) = &*cursor else {
        return Status::success();
    };
    match engine.seek(Seek::After(key)) {
        Ok(found) => {
            *cursor = found.map_or(Cursor::Exhausted, |(next, _)| Cursor::At(next));
            Status::success()
        },
        Err(status) => status,
    }
}

fn update_current(
    engine: &dyn Engine,
    cursor: &mut Cursor,
    mut action: impl FnMut(&[u8]) -> RecordAction,
) -> Status {
    let key = match locate(engine, cursor) {
        Ok((key, _)) => key,
        Err(status) => return status,
    };
    let mut found = false;
    let result = engine.process(&key, &mut |current| match current {
        Some(value) => {
            found = true;
            action(value)
        },
        None => RecordAction::Noop,
    });
    match result {
        Ok(()) if found => Status::success(),
        Ok(()) => Status::new(StatusCode::NotFoundError),
        Err(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::params::Params;

    fn populated(keys: &[&str]) -> Database {
        let db = Database::new(Runtime::with_defaults());
        db.open("", true, &Params::new()).unwrap();
        for key in keys {
            db.set(*key, key.to_uppercase(), true).unwrap();
        }
        db
    }

    #[test]
    fn test_walk_forward_and_backward() {
        let db = populated(&["a", "b", "c"]);
        let iter = db.make_iterator().unwrap();
        assert!(iter.first().unwrap().is_ok());
        assert_eq!(iter.get_key(None).unwrap().unwrap(), "a");
        assert!(iter.next().unwrap().is_ok());
        assert_eq!(iter.get_value(None).unwrap().unwrap(), "B");
        assert!(iter.last().unwrap().is_ok());
        assert!(iter.previous().unwrap().is_ok());
        assert_eq!(iter.get_key(None).unwrap().unwrap(), "b");
    }

    #[test]
    fn test_moving_off_the_end_exhausts() {
        let db = populated(&["a"]);
        let iter = db.make_iterator().unwrap();
        iter.first().unwrap();
        assert!(iter.next().unwrap().is_ok());
        let mut status = Status::success();
        assert!(iter.get(Some(&mut status)).unwrap().is_none());
        assert_eq!(status, StatusCode::NotFoundError);
        assert_eq!(iter.next().unwrap(), StatusCode::NotFoundError);
    }

    #[test]
    fn test_unpositioned_iterator() {
        let db = populated(&["a"]);
        let iter = db.make_iterator().unwrap();
        assert_eq!(iter.next().unwrap(), StatusCode::NotFoundError);
        assert!(iter.get(None).unwrap().is_none());
        assert_eq!(iter.describe().unwrap(), "(unlocated)");
    }

    #[test]
    fn test_set_and_remove_current() {
        let db = populated(&["a", "b"]);
        let iter = db.make_iterator().unwrap();
        iter.first().unwrap();
        assert!(iter.set("x").unwrap().is_ok());
        assert_eq!(db.get("a", None).unwrap().unwrap(), "x");
        assert!(iter.remove().unwrap().is_ok());
        assert_eq!(iter.get_key(None).unwrap().unwrap(), "b");
        assert_eq!(iter.describe().unwrap(), "\"b\"");
    }

    #[test]
    fn test_remove_then_next_ignores_intervening_reads() {
        let plain = populated(&["a", "b", "c"]);
        let iter = plain.make_iterator().unwrap();
        iter.first().unwrap();
        assert!(iter.remove().unwrap().is_ok());
        assert!(iter.next().unwrap().is_ok());
        let without_read = iter.get_key(None).unwrap();

        let peeked = populated(&["a", "b", "c"]);
        let iter = peeked.make_iterator().unwrap();
        iter.first().unwrap();
        assert!(iter.remove().unwrap().is_ok());
        assert_eq!(iter.get_key(None).unwrap().unwrap(), "b");
        assert!(iter.next().unwrap().is_ok());
        let with_read = iter.get_key(None).unwrap();

        assert_eq!(without_read, with_read);
        assert_eq!(with_read.unwrap(), "c");
    }

    #[test]
    fn test_remove_last_record_exhausts() {
        let db = populated(&["a", "b"]);
        let iter = db.make_iterator().unwrap();
        iter.last().unwrap();
        assert!(iter.remove().unwrap().is_ok());
        assert_eq!(iter.next().unwrap(), StatusCode::NotFoundError);
        assert!(iter.get_key(None).unwrap().is_none());
    }

    #[test]
    fn test_destructed_iterator() {
        let db = populated(&["a"]);
        let iter = db.make_iterator().unwrap();
        iter.destruct();
        assert!(matches!(
            iter.first(),
            Err(BindingError::Destructed("Iterator"))
        ));
    }
}
