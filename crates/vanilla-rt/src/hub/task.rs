// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation.
//!
//! A task is a boxed `'static` future. It is only ever resumed by the hub
//! pushing its id onto the ready queue, so the waker handed to `poll` is a
//! no-op: suspension happens exclusively at hub operations.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Type-erased future for the hub. All tasks produce `()`; the typed
/// output is reported through [`TaskOutput`] before the task is dropped.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Unique per hub, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What a finished task hands back to the hub.
///
/// An `Err` terminates only that task: it is logged and otherwise dropped.
/// Shutdown faults (`Closed`/`Stop`) are routine and logged at debug level.
pub trait TaskOutput {
    fn report(self, id: TaskId);
}

impl TaskOutput for () {
    fn report(self, _id: TaskId) {}
}

impl<E: fmt::Display + 'static> TaskOutput for Result<(), E> {
    fn report(self, id: TaskId) {
        let Err(err) = self else { return };
        let graceful = (&err as &dyn std::any::Any)
            .downcast_ref::<crate::Error>()
            .is_some_and(|e| e.is_closed());
        if graceful {
            tracing::debug!(task = %id, error = %err, "task ended by shutdown");
        } else {
            tracing::warn!(task = %id, error = %err, "task exited with error");
        }
    }
}

/// Box a user future so its output gets reported on completion.
pub(crate) fn boxed<F>(id: TaskId, fut: F) -> BoxFuture
where
    F: Future + 'static,
    F::Output: TaskOutput,
{
    Box::pin(async move { fut.await.report(id) })
}

/// Outcome of polling a task once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Pending,
    Complete,
    Panicked,
}

/// Poll a task once, isolating panics.
pub(crate) fn poll_task(id: TaskId, fut: &mut BoxFuture) -> Step {
    let mut cx = Context::from_waker(Waker::noop());
    match panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(Poll::Ready(())) => Step::Complete,
        Ok(Poll::Pending) => Step::Pending,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(task = %id, panic = %msg, "task panicked");
            Step::Panicked
        }
    }
}
