//! Results of operations submitted to an [`AsyncDbm`](crate::AsyncDbm).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dbmbind_core::{Status, StatusCode};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::encoding::{Encoding, RString};
use crate::error::{BindingError, BindingResult};
use crate::marshal::{Payload, RecordMap};
use crate::runtime::Runtime;

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Filled(T),
    Taken,
}

impl<T> Slot<T> {
    fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// A one-shot slot filled by a worker and drained by a waiter. Once drained
/// it stays complete, so late waiters return at once.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn fill(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_empty() {
            *slot = Slot::Filled(value);
        }
        drop(slot);
        self.ready.notify_all();
    }

    /// Block until complete or until `timeout` elapses; `None` waits
    /// forever.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut slot = self.slot.lock();
        while slot.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return !slot.is_empty();
                    }
                },
                // A timeout too large to represent waits forever too.
                None => self.ready.wait(&mut slot),
            }
        }
        true
    }

    /// Block until complete and drain the value; `None` once drained.
    pub(crate) fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        while slot.is_empty() {
            self.ready.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Filled(value) => Some(value),
            Slot::Empty | Slot::Taken => None,
        }
    }
}

/// Fills its completion exactly once, with a cancellation status if the
/// worker never produced a payload.
pub(crate) struct Promise {
    completion: Arc<Completion<Payload>>,
    fallback: Option<Payload>,
}

impl Promise {
    pub(crate) fn new(completion: Arc<Completion<Payload>>, fallback: Payload) -> Self {
        Self {
            completion,
            fallback: Some(fallback),
        }
    }

    pub(crate) fn fulfill(mut self, payload: Payload) {
        self.fallback = None;
        self.completion.fill(payload);
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(fallback) = self.fallback.take() {
            warn!("async operation ended without a result");
            self.completion.fill(fallback);
        }
    }
}

/// The value of a completed future.
#[derive(Debug, Clone)]
pub enum FutureValue {
    /// A status alone.
    Status(Status),
    /// A status and a string, present on success.
    String(Status, Option<RString>),
    /// A status and a list of strings.
    StringList(Status, Vec<RString>),
    /// A status and a map of records.
    StringMap(Status, RecordMap),
    /// A status and an integer.
    Integer(Status, i64),
}

impl FutureValue {
    /// The status of the operation.
    #[must_use]
    pub fn status(&self) -> &Status {
        match self {
            Self::Status(status)
            | Self::String(status, _)
            | Self::StringList(status, _)
            | Self::StringMap(status, _)
            | Self::Integer(status, _) => status,
        }
    }

    /// Consume into the status.
    #[must_use]
    pub fn into_status(self) -> Status {
        match self {
            Self::Status(status)
            | Self::String(status, _)
            | Self::StringList(status, _)
            | Self::StringMap(status, _)
            | Self::Integer(status, _) => status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FutureState {
    Pending,
    Consumed,
    Destructed,
}

impl FutureState {
    fn ensure_pending(self) -> BindingResult<()> {
        match self {
            Self::Pending => Ok(()),
            Self::Consumed => Err(BindingError::FutureConsumed),
            Self::Destructed => Err(BindingError::Destructed("Future")),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: FutureState,
    concurrent: bool,
}

/// The pending result of an async operation.
#[derive(Debug)]
pub struct Future {
    runtime: Arc<Runtime>,
    completion: Arc<Completion<Payload>>,
    encoding: Encoding,
    inner: Mutex<Inner>,
}

impl Future {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        completion: Arc<Completion<Payload>>,
        concurrent: bool,
        encoding: Encoding,
    ) -> Self {
        Self {
            runtime,
            completion,
            encoding,
            inner: Mutex::new(Inner {
                state: FutureState::Pending,
                concurrent,
            }),
        }
    }

    /// Check the state and return the concurrency flag.
    fn check(&self) -> BindingResult<bool> {
        let inner = self.inner.lock();
        inner.state.ensure_pending()?;
        Ok(inner.concurrent)
    }

    /// Wait for completion; `None` waits indefinitely. Returns whether the
    /// operation has completed. Waiting on a concurrent future releases the
    /// host lock.
    ///
    /// # Errors
    ///
    /// [`BindingError::FutureConsumed`] after [`Self::get`] and
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn wait(&self, timeout: Option<Duration>) -> BindingResult<bool> {
        let concurrent = self.check()?;
        let done = self
            .runtime
            .bridge()
            .run(concurrent, || self.completion.wait(timeout));
        if done {
            self.inner.lock().concurrent = false;
        }
        Ok(done)
    }

    /// [`Self::wait`] with a timeout in seconds; negative waits
    /// indefinitely.
    ///
    /// # Errors
    ///
    /// As [`Self::wait`].
    pub fn wait_secs(&self, secs: f64) -> BindingResult<bool> {
        let timeout = if secs < 0.0 {
            None
        } else {
            Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        };
        self.wait(timeout)
    }

    /// Wait for and take the result. A future can be consumed once.
    ///
    /// # Errors
    ///
    /// [`BindingError::FutureConsumed`] on a second call and
    /// [`BindingError::Destructed`] after [`Self::destruct`].
    pub fn get(&self) -> BindingResult<FutureValue> {
        // Claim the result before blocking so a racing caller fails fast.
        let concurrent = {
            let mut inner = self.inner.lock();
            inner.state.ensure_pending()?;
            inner.state = FutureState::Consumed;
            inner.concurrent
        };
        let payload = self
            .runtime
            .bridge()
            .run(concurrent, || self.completion.take());
        Ok(payload.map_or_else(
            || FutureValue::Status(Status::new(StatusCode::UnknownError)),
            |payload| payload.into_value(self.encoding),
        ))
    }

    /// Whether waiting releases the host lock.
    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        self.inner.lock().concurrent
    }

    /// Drop the pending result; later calls fail with
    /// [`BindingError::Destructed`].
    pub fn destruct(&self) {
        self.inner.lock().state = FutureState::Destructed;
    }

    /// `Future:<state>`.
    #[must_use]
    pub fn describe(&self) -> String {
        let state = match self.inner.lock().state {
            FutureState::Pending if self.completion.wait(Some(Duration::ZERO)) => "ready",
            FutureState::Pending => "pending",
            FutureState::Consumed => "consumed",
            FutureState::Destructed => "destructed",
        };
        format!("Future:{state}")
    }
}
