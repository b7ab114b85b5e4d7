//! Integration tests for file handles.

mod common;

use std::sync::Arc;

use common::Fixture;
use dbmbind::{BindingError, File, Params, Status, StatusCode};

#[test]
fn test_write_read_append() {
    let fx = Fixture::new();
    let file = fx.open_file("data.txt");
    assert!(file.write(0, "hello").unwrap().is_ok());
    assert_eq!(file.append(" world", None).unwrap(), Some(5));
    assert_eq!(file.get_size().unwrap(), Some(11));
    assert_eq!(file.read(6, 5, None).unwrap().unwrap(), "world");

    let mut status = Status::success();
    assert!(file.read(8, 10, Some(&mut status)).unwrap().is_none());
    assert_eq!(status, StatusCode::InfeasibleError);
}

#[test]
fn test_truncate_and_synchronize() {
    let fx = Fixture::new();
    let file = fx.open_file("data.txt");
    file.append("0123456789", None).unwrap();
    assert!(file.truncate(4).unwrap().is_ok());
    assert_eq!(file.get_size().unwrap(), Some(4));
    assert!(file.synchronize(true, 0, 0).unwrap().is_ok());
    assert!(file.synchronize(false, 0, 0).unwrap().is_ok());
}

#[test]
fn test_search_lines() {
    let fx = Fixture::new();
    let file = fx.open_file("lines.txt");
    file.append("alpha\nbeta\nalphabet\n", None).unwrap();
    let found = file.search("begin", "alpha", 0).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(file.search("contain", "et", 1).unwrap().len(), 1);
}

#[test]
fn test_unopened_file_reports_precondition() {
    let fx = Fixture::new();
    let file = File::new(Arc::clone(&fx.runtime));
    assert_eq!(file.write(0, "x").unwrap(), StatusCode::PreconditionError);
    assert_eq!(file.close().unwrap(), StatusCode::PreconditionError);
    assert_eq!(file.get_path().unwrap(), None);
    assert_eq!(file.describe().unwrap(), "unknown:\"\":-1");
    assert!(file.search("contain", "x", 0).is_err());
}

#[test]
fn test_open_twice_and_destruct() {
    let fx = Fixture::new();
    let file = fx.open_file("data.txt");
    assert_eq!(
        file.open(&fx.path("data.txt"), true, &Params::new()).unwrap(),
        StatusCode::PreconditionError
    );
    assert_eq!(file.get_path().unwrap(), Some(fx.path("data.txt")));

    file.destruct();
    assert!(matches!(
        file.get_size(),
        Err(BindingError::Destructed("File"))
    ));
}

#[test]
fn test_export_keys_as_lines() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    db.set_multi([("k1", "v"), ("k2", "v")], true).unwrap();
    let file = fx.open_file("keys.txt");
    assert!(db.export_keys_as_lines(&file).unwrap().is_ok());
    assert_eq!(file.read(0, 6, None).unwrap().unwrap(), "k1\nk2\n");
}
