// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! Unbounded queue with rendezvous handoff: a send that finds a parked
//! receiver resumes it directly, otherwise the item is buffered. Items are
//! `Result`s, so faults travel in-band and re-raise at the receiver.
//!
//! An optional pipeline of stages runs once per sent value, before handoff
//! or buffering. A stage returning `Error::Filter` drops the value; any
//! other error replaces it and is delivered as a fault.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Preserved, Result};
use crate::hub::{Hub, Shared, Timed};
use crate::park::Park;

/// A pipeline stage.
pub type Stage<T> = Box<dyn FnMut(T) -> Result<T>>;

/// One parked receiver. `slot` tells `select` which channel fired.
pub(crate) struct Waiter<T> {
    pub park: Rc<Park<(usize, T)>>,
    pub slot: usize,
}

pub(crate) struct ChannelState<T> {
    closed: Cell<bool>,
    pipeline: RefCell<Vec<Stage<T>>>,
    items: RefCell<VecDeque<Result<T>>>,
    waiters: RefCell<VecDeque<Waiter<T>>>,
}

impl<T> ChannelState<T> {
    pub fn new() -> Self {
        Self {
            closed: Cell::new(false),
            pipeline: RefCell::new(Vec::new()),
            items: RefCell::new(VecDeque::new()),
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    pub fn send(&self, hub: &Shared, item: Result<T>) -> Result<()> {
        if self.closed.get() {
            return Err(Error::Closed);
        }
        let item = match item {
            Ok(value) => match self.run_pipeline(value) {
                Some(item) => item,
                None => return Ok(()),
            },
            fault => fault,
        };
        self.deliver(hub, item, false);
        Ok(())
    }

    pub fn close(&self, hub: &Shared) -> Result<()> {
        self.send(hub, Err(Error::Closed))?;
        self.closed.set(true);
        Ok(())
    }

    /// `None` if a stage filtered the value out.
    ///
    /// The stages are taken out of the cell while they run, so a stage may
    /// send on its own channel (that send skips the pipeline) or append
    /// stages, which take effect from the next send.
    fn run_pipeline(&self, value: T) -> Option<Result<T>> {
        let mut stages = std::mem::take(&mut *self.pipeline.borrow_mut());
        let out = Self::run_stages(&mut stages, value);

        let mut pipeline = self.pipeline.borrow_mut();
        let added = std::mem::replace(&mut *pipeline, stages);
        pipeline.extend(added);
        out
    }

    fn run_stages(stages: &mut [Stage<T>], mut value: T) -> Option<Result<T>> {
        for stage in stages.iter_mut() {
            match stage(value) {
                Ok(next) => value = next,
                Err(Error::Filter) => return None,
                Err(fault) => return Some(Err(fault)),
            }
        }
        Some(Ok(value))
    }

    /// Hand `item` to the oldest live waiter, or buffer it. Waiters whose
    /// park was already resolved (timed out, or won by another channel in a
    /// select) are skipped and dropped.
    fn deliver(&self, hub: &Shared, mut item: Result<T>, front: bool) {
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            let Some(waiter) = next else { break };

            let offered = item.map(|v| (waiter.slot, v));
            match waiter.park.offer(hub, offered) {
                None => return,
                Some(rejected) => item = rejected.map(|(_, v)| v),
            }
        }

        let mut items = self.items.borrow_mut();
        if front {
            items.push_front(item);
        } else {
            items.push_back(item);
        }
    }

    /// Return an item to the head of the queue, bypassing the pipeline and
    /// the closed flag.
    pub fn push_front(&self, hub: &Shared, item: Result<T>) {
        self.deliver(hub, item, true);
    }

    /// Buffered item, or `Closed` if the channel is closed and drained.
    fn take(&self) -> Option<Result<T>> {
        let next = self.items.borrow_mut().pop_front();
        match next {
            Some(item) => Some(item),
            None if self.closed.get() => Some(Err(Error::Closed)),
            None => None,
        }
    }

    fn park(&self, waiter: Waiter<T>) {
        self.waiters.borrow_mut().push_back(waiter);
    }

    pub(crate) fn forget(&self, park: &Rc<Park<(usize, T)>>) {
        self.waiters.borrow_mut().retain(|w| !Rc::ptr_eq(&w.park, park));
    }

    #[cfg(test)]
    pub(crate) fn waiters_len(&self) -> usize {
        self.waiters.borrow().len()
    }
}

/// Re-raise preserved faults with a trace of where they were thrown.
fn surface<T>(item: Result<T>) -> Result<T> {
    if let Err(Error::Preserved(p)) = &item {
        tracing::debug!(thrown_at = %p.thrown_at(), error = %p.get_ref(), "re-raising preserved fault");
    }
    item
}

/// Handle to a channel. Clones share the same queue; any clone can send or
/// receive.
pub struct Channel<T> {
    hub: Hub,
    state: Rc<ChannelState<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.state.closed.get())
            .field("items", &self.state.items.borrow().len())
            .field("waiters", &self.state.waiters.borrow().len())
            .field("stages", &self.state.pipeline.borrow().len())
            .finish()
    }
}

impl<T: 'static> Channel<T> {
    pub(crate) fn new(hub: Hub) -> Self {
        Self::from_state(hub, Rc::new(ChannelState::new()))
    }

    pub(crate) fn from_state(hub: Hub, state: Rc<ChannelState<T>>) -> Self {
        Self { hub, state }
    }

    pub(crate) fn state(&self) -> &Rc<ChannelState<T>> {
        &self.state
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Append a stage to the pipeline.
    pub fn pipe<F>(&self, stage: F) -> &Self
    where
        F: FnMut(T) -> Result<T> + 'static,
    {
        self.state.pipeline.borrow_mut().push(Box::new(stage));
        self
    }

    /// Send a value. Never suspends; fails only if the channel is closed.
    pub fn send(&self, value: T) -> Result<()> {
        self.state.send(self.hub.shared(), Ok(value))
    }

    /// Send a fault; the receiver gets it as `Err` from `recv`.
    pub fn send_fault(&self, err: Error) -> Result<()> {
        self.state.send(self.hub.shared(), Err(err))
    }

    /// Forward an error to the receiver with its original identity.
    #[track_caller]
    pub fn throw<E>(&self, err: E) -> Result<()>
    where
        E: std::error::Error + 'static,
    {
        self.send_fault(Error::Preserved(Preserved::new(err)))
    }

    /// Send `Closed` to the next receiver, then refuse further sends.
    pub fn close(&self) -> Result<()> {
        self.state.close(self.hub.shared())
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.state.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.borrow().is_empty()
    }

    pub(crate) fn push_front(&self, value: T) {
        self.state.push_front(self.hub.shared(), Ok(value));
    }

    /// Take a buffered item without suspending.
    pub fn try_recv(&self) -> Option<Result<T>> {
        self.state.take().map(surface)
    }

    pub(crate) fn take(&self) -> Option<Result<T>> {
        self.state.take()
    }

    pub(crate) fn park(&self, waiter: Waiter<T>) {
        self.state.park(waiter);
    }

    /// Wait for the next item.
    pub async fn recv(&self) -> Result<T> {
        self.recv_inner(None).await
    }

    /// Wait at most `timeout` for the next item. A zero timeout fails with
    /// `Timeout` at once when nothing is buffered.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        self.recv_inner(Some(timeout)).await
    }

    async fn recv_inner(&self, timeout: Option<Duration>) -> Result<T> {
        if let Some(item) = self.state.take() {
            return surface(item);
        }
        if timeout == Some(Duration::ZERO) {
            return Err(Error::Timeout(Duration::ZERO));
        }
        if self.hub.is_stopped() {
            return Err(Error::Closed);
        }

        let park = Park::new(self.hub.require_task()?);
        let mut guard = RecvGuard {
            chan: self,
            park: &park,
            timer: None,
        };
        self.state.park(Waiter {
            park: park.clone(),
            slot: 0,
        });
        guard.timer = timeout.map(|after| self.hub.add_timer(after, Timed::Expire(park.clone(), after)));

        surface(park.wait().await.map(|(_, v)| v))
    }

    /// Values until the channel closes.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            chan: self.clone(),
            done: false,
        }
    }
}

/// Cleans up whichever registration lost the race once `recv` resumes, or
/// both if the receive is abandoned.
struct RecvGuard<'a, T: 'static> {
    chan: &'a Channel<T>,
    park: &'a Rc<Park<(usize, T)>>,
    timer: Option<crate::hub::scheduler::TimerHandle>,
}

impl<T: 'static> Drop for RecvGuard<'_, T> {
    fn drop(&mut self) {
        self.chan.state.forget(self.park);
        if let Some(handle) = self.timer.take() {
            self.chan.hub.remove_timer(handle);
        }
    }
}

/// Finite, non-restartable sequence of received values.
///
/// Ends with `Ok(None)` on `Closed` or `Stop`; other faults are returned
/// as `Err` and iteration may continue.
pub struct Iter<T> {
    chan: Channel<T>,
    done: bool,
}

impl<T: 'static> Iter<T> {
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.done {
            return Ok(None);
        }
        match self.chan.recv().await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_closed() => {
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drain everything up to the close.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(value) = self.next().await? {
            out.push(value);
        }
        Ok(out)
    }
}
