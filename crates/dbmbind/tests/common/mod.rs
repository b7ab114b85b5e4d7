//! Shared fixtures for the binding integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dbmbind::{Database, File, Params, Runtime, params};
use tempfile::TempDir;

/// A runtime plus a scratch directory for database files.
pub struct Fixture {
    pub runtime: Arc<Runtime>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            runtime: Runtime::with_defaults(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_str().unwrap().to_owned()
    }

    /// A database opened writable at `name` with the given parameters.
    pub fn open_db(&self, name: &str, pairs: &[(&str, &str)]) -> Database {
        let db = Database::new(Arc::clone(&self.runtime));
        let status = db
            .open(&self.path(name), true, &params(pairs.iter().copied()))
            .unwrap();
        assert!(status.is_ok(), "open failed: {status}");
        db
    }

    /// An in-memory database.
    pub fn memory_db(&self) -> Database {
        let db = Database::new(Arc::clone(&self.runtime));
        assert!(db.open("", true, &Params::new()).unwrap().is_ok());
        db
    }

    /// A file opened writable at `name`.
    pub fn open_file(&self, name: &str) -> File {
        let file = File::new(Arc::clone(&self.runtime));
        assert!(file.open(&self.path(name), true, &Params::new()).unwrap().is_ok());
        file
    }
}
