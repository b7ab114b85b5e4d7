//! Host lock and the concurrency bridge.
//!
//! The host runtime serializes its threads behind one reentrant lock. Every
//! engine call goes through [`Bridge`], which either runs the call while
//! holding that lock or releases it for the duration so other host threads
//! can make progress. Closures run in released mode never receive host
//! objects; arguments are copied into native buffers before dispatch.
//!
//! Lock order is always handle slot lock first, then the host lock. Worker
//! threads never take the host lock.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// A reentrant lock owned by at most one host thread at a time.
#[derive(Debug, Default)]
pub struct HostLock {
    owner: Mutex<Owner>,
    released: Condvar,
}

impl HostLock {
    /// Create an unowned lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for the current thread, blocking while another
    /// thread owns it. Reentrant.
    pub fn acquire(&self) -> HostGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if owner.thread == Some(me) {
            owner.depth = owner.depth.saturating_add(1);
        } else {
            while owner.thread.is_some() {
                self.released.wait(&mut owner);
            }
            owner.thread = Some(me);
            owner.depth = 1;
        }
        HostGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Whether the current thread owns the lock.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.lock().thread == Some(thread::current().id())
    }

    fn release_one(&self) {
        let mut owner = self.owner.lock();
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
    }

    /// Fully release the lock if the current thread owns it, remembering the
    /// depth so it can be restored.
    fn suspend(&self) -> Suspension<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        let depth = if owner.thread == Some(me) {
            let depth = owner.depth;
            owner.thread = None;
            owner.depth = 0;
            drop(owner);
            self.released.notify_one();
            depth
        } else {
            0
        };
        Suspension { lock: self, depth }
    }
}

/// Ownership of the [`HostLock`] by the current thread.
#[derive(Debug)]
#[must_use = "the host lock is released when the guard is dropped"]
pub struct HostGuard<'a> {
    lock: &'a HostLock,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_one();
    }
}

/// Restores a suspended host lock on drop, unwinding included.
struct Suspension<'a> {
    lock: &'a HostLock,
    depth: usize,
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        if self.depth == 0 {
            return;
        }
        let me = thread::current().id();
        let mut owner = self.lock.owner.lock();
        while owner.thread.is_some() {
            self.lock.released.wait(&mut owner);
        }
        owner.thread = Some(me);
        owner.depth = self.depth;
    }
}

/// How a native call is dispatched with respect to the host lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Run while holding the host lock.
    Held,
    /// Release the host lock for the duration of the call.
    Released,
}

impl Dispatch {
    /// The mode implied by a handle's `concurrent` flag.
    #[must_use]
    pub fn for_concurrent(concurrent: bool) -> Self {
        if concurrent { Self::Released } else { Self::Held }
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Calls run while holding the host lock.
    pub held_calls: u64,
    /// Calls run with the host lock released.
    pub released_calls: u64,
}

/// Runs native work in held or released mode.
#[derive(Debug, Default)]
pub struct Bridge {
    host: HostLock,
    held_calls: AtomicU64,
    released_calls: AtomicU64,
}

impl Bridge {
    /// Create a bridge with its own host lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The host lock guarded by this bridge.
    #[must_use]
    pub fn host_lock(&self) -> &HostLock {
        &self.host
    }

    /// Run `f` in the mode implied by `concurrent`.
    pub fn run<R>(&self, concurrent: bool, f: impl FnOnce() -> R) -> R {
        self.dispatch(Dispatch::for_concurrent(concurrent), f)
    }

    /// Run `f` with the host lock released regardless of handle mode.
    pub fn run_released<R>(&self, f: impl FnOnce() -> R) -> R {
        self.dispatch(Dispatch::Released, f)
    }

    /// Run `f` in the given mode.
    pub fn dispatch<R>(&self, mode: Dispatch, f: impl FnOnce() -> R) -> R {
        match mode {
            Dispatch::Held => {
                self.held_calls.fetch_add(1, Ordering::Relaxed);
                let _host = self.host.acquire();
                trace!("native call with host lock held");
                f()
            },
            Dispatch::Released => {
                self.released_calls.fetch_add(1, Ordering::Relaxed);
                let _suspended = self.host.suspend();
                trace!("native call with host lock released");
                f()
            },
        }
    }

    /// Snapshot of the dispatch counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            held_calls: self.held_calls.load(Ordering::Relaxed),
            released_calls: self.released_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_host_lock_is_reentrant() {
        let lock = HostLock::new();
        let outer = lock.acquire();
        let inner = lock.acquire();
        assert!(lock.is_held_by_current_thread());
        drop(inner);
        assert!(lock.is_held_by_current_thread());
        drop(outer);
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_held_dispatch_runs_under_lock() {
        let bridge = Bridge::new();
        let held = bridge.run(false, || bridge.host_lock().is_held_by_current_thread());
        assert!(held);
        let held = bridge.run(true, || bridge.host_lock().is_held_by_current_thread());
        assert!(!held);
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                held_calls: 1,
                released_calls: 1,
            }
        );
    }

    #[test]
    fn test_released_dispatch_lets_other_threads_in() {
        let bridge = Arc::new(Bridge::new());
        let _host = bridge.host_lock().acquire();
        let (tx, rx) = mpsc::channel();

        bridge.run_released(|| {
            assert!(!bridge.host_lock().is_held_by_current_thread());
            let other = Arc::clone(&bridge);
            let handle = thread::spawn(move || {
                let _guard = other.host_lock().acquire();
                tx.send(()).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            handle.join().unwrap();
        });

        assert!(bridge.host_lock().is_held_by_current_thread());
    }

    #[test]
    fn test_released_dispatch_restores_depth() {
        let bridge = Bridge::new();
        let _outer = bridge.host_lock().acquire();
        let inner = bridge.host_lock().acquire();
        bridge.run_released(|| ());
        drop(inner);
        assert!(bridge.host_lock().is_held_by_current_thread());
    }

    #[test]
    fn test_held_dispatch_blocks_while_another_thread_owns_lock() {
        let bridge = Arc::new(Bridge::new());
        let guard = bridge.host_lock().acquire();
        let other = Arc::clone(&bridge);
        let handle = thread::spawn(move || other.run(false, || 42));
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(guard);
        assert_eq!(handle.join().unwrap(), 42);
    }
}
