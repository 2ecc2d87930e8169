// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parking slots for suspended tasks.
//!
//! Every suspension point (channel receive, event wait, sleep, select)
//! creates one `Park` and files clones of it into the hub's waiting
//! structures. Whoever resolves it first wins: the outcome is stored, the
//! owning task is queued to run, and every later offer is handed back to
//! the caller untouched. The losers' registrations are removed by the
//! parked task's own guard once it resumes.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::hub::{Shared, TaskId};

enum State<T> {
    Waiting,
    Resolved(Result<T>),
    Taken,
}

pub(crate) struct Park<T> {
    task: TaskId,
    state: RefCell<State<T>>,
}

impl<T> Park<T> {
    pub fn new(task: TaskId) -> Rc<Self> {
        Rc::new(Self {
            task,
            state: RefCell::new(State::Waiting),
        })
    }

    /// Resolve the park and queue its task. Returns the outcome back if
    /// someone else got there first.
    pub fn offer(&self, hub: &Shared, outcome: Result<T>) -> Option<Result<T>> {
        {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, State::Waiting) {
                return Some(outcome);
            }
            *state = State::Resolved(outcome);
        }
        hub.wake(self.task);
        None
    }

    /// Suspend until resolved.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { park: self }
    }
}

/// Future returned by [`Park::wait`].
pub(crate) struct Wait<'a, T> {
    park: &'a Park<T>,
}

impl<T> Future for Wait<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.park.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Waiting => {
                *state = State::Waiting;
                Poll::Pending
            }
            State::Resolved(outcome) => Poll::Ready(outcome),
            State::Taken => Poll::Ready(Err(Error::Closed)),
        }
    }
}

/// Type-erased resolution with a fault, used by timers and shutdown.
pub(crate) trait Expire {
    fn expire(&self, hub: &Shared, err: Error);
}

impl<T> Expire for Park<T> {
    fn expire(&self, hub: &Shared, err: Error) {
        // Losing to a delivery is the normal case; nothing to hand back.
        let _ = self.offer(hub, Err(err));
    }
}
