//! Host threads sharing handles through the concurrency bridge.

mod common;

use std::sync::Arc;
use std::thread;

use common::Fixture;
use dbmbind::{Database, Runtime};

const THREADS: usize = 4;
const PER_THREAD: usize = 50;
/// Records written by [`hammer`], not counting the shared counter.
const WRITTEN: usize = THREADS.saturating_mul(PER_THREAD);

fn written() -> i64 {
    i64::try_from(WRITTEN).unwrap()
}

fn hammer(runtime: &Arc<Runtime>, db: &Arc<Database>) {
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = Arc::clone(db);
            let runtime = Arc::clone(runtime);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let _host = runtime.enter_host();
                    assert!(db.set(format!("{t}-{i}"), "v", true).unwrap().is_ok());
                    db.increment("total", 1, 0, None).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_concurrent_handle_releases_host_lock() {
    let fx = Fixture::new();
    let db = Arc::new(fx.open_db("shared.tree", &[("concurrent", "true")]));
    hammer(&fx.runtime, &db);
    assert_eq!(
        db.count().unwrap(),
        Some(written().saturating_add(1))
    );
    assert_eq!(
        db.increment("total", i64::MIN, 0, None).unwrap(),
        Some(written())
    );
    assert!(fx.runtime.bridge().stats().released_calls > 0);
}

#[test]
fn test_default_handle_serializes_on_host_lock() {
    let fx = Fixture::new();
    let db = Arc::new(fx.memory_db());
    hammer(&fx.runtime, &db);
    assert_eq!(
        db.count().unwrap(),
        Some(written().saturating_add(1))
    );
}
