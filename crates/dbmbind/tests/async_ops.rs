//! Integration tests for the async executor and futures.

mod common;

use std::time::Duration;

use common::Fixture;
use dbmbind::{AsyncDbm, BindingError, FutureValue, HostValue, Params, StatusCode};

#[test]
fn test_operations_complete_through_futures() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    let executor = AsyncDbm::new(&db, 4).unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| executor.set(format!("k{i}"), i, true).unwrap())
        .collect();
    for future in futures {
        assert!(future.get().unwrap().status().is_ok());
    }
    assert_eq!(db.count().unwrap(), Some(10));

    match executor.search("begin", "k", 0).unwrap().get().unwrap() {
        FutureValue::StringList(status, keys) => {
            assert!(status.is_ok());
            assert_eq!(keys.len(), 10);
        },
        other => panic!("unexpected value: {other:?}"),
    }
}

#[test]
fn test_future_is_single_use() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    let executor = AsyncDbm::new(&db, 1).unwrap();
    let future = executor.increment("n", 3, 0).unwrap();
    assert!(future.wait(Some(Duration::from_secs(10))).unwrap());
    match future.get().unwrap() {
        FutureValue::Integer(status, value) => {
            assert!(status.is_ok());
            assert_eq!(value, 3);
        },
        other => panic!("unexpected value: {other:?}"),
    }
    assert!(matches!(future.get(), Err(BindingError::FutureConsumed)));
    assert_eq!(future.describe(), "Future:consumed");
}

#[test]
fn test_compare_exchange_and_missing_get() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    let executor = AsyncDbm::new(&db, 2).unwrap();
    let status = executor
        .compare_exchange("k", HostValue::Nil, "v")
        .unwrap()
        .get()
        .unwrap()
        .into_status();
    assert!(status.is_ok());

    match executor.get("absent").unwrap().get().unwrap() {
        FutureValue::String(status, value) => {
            assert_eq!(status, StatusCode::NotFoundError);
            assert!(value.is_none());
        },
        other => panic!("unexpected value: {other:?}"),
    }
}

#[test]
fn test_compare_exchange_multi_through_executor() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    db.set("a", "1", true).unwrap();
    let executor = AsyncDbm::new(&db, 2).unwrap();

    let status = executor
        .compare_exchange_multi([("a", "2")], [("a", "x")])
        .unwrap()
        .get()
        .unwrap()
        .into_status();
    assert_eq!(status, StatusCode::InfeasibleError);
    assert_eq!(db.get("a", None).unwrap().unwrap(), "1");

    let status = executor
        .compare_exchange_multi([("a", HostValue::from("1"))], [("a", HostValue::Nil)])
        .unwrap()
        .get()
        .unwrap()
        .into_status();
    assert!(status.is_ok());
    assert!(db.get("a", None).unwrap().is_none());
}

#[test]
fn test_database_closed_before_submit() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    let executor = AsyncDbm::new(&db, 1).unwrap();
    db.close().unwrap();
    assert!(matches!(executor.clear(), Err(BindingError::NotOpened)));

    // Reopening the handle does not revive the executor's binding.
    assert!(db.open("", true, &Params::new()).unwrap().is_ok());
    assert!(matches!(executor.clear(), Err(BindingError::NotOpened)));
}

#[test]
fn test_executor_requires_open_database() {
    let fx = Fixture::new();
    let db = fx.memory_db();
    db.close().unwrap();
    assert!(matches!(
        AsyncDbm::new(&db, 1),
        Err(BindingError::NotOpened)
    ));
}

#[test]
fn test_flat_record_round_trip_through_executor() {
    let fx = Fixture::new();
    let src = fx.memory_db();
    src.set_multi([("a", "1"), ("b", "2")], true).unwrap();
    let file = fx.open_file("flat.dat");
    let executor = AsyncDbm::new(&src, 1).unwrap();
    assert!(
        executor
            .export_to_flat_records(&file)
            .unwrap()
            .get()
            .unwrap()
            .status()
            .is_ok()
    );

    let dest = fx.memory_db();
    let importer = AsyncDbm::new(&dest, 1).unwrap();
    assert!(
        importer
            .import_from_flat_records(&file)
            .unwrap()
            .get()
            .unwrap()
            .status()
            .is_ok()
    );
    assert_eq!(dest.get("b", None).unwrap().unwrap(), "2");
}

#[test]
fn test_export_to_closed_destination() {
    let fx = Fixture::new();
    let src = fx.memory_db();
    let dest = fx.memory_db();
    let executor = AsyncDbm::new(&src, 1).unwrap();
    dest.close().unwrap();
    assert!(matches!(executor.export(&dest), Err(BindingError::NotOpened)));
}
