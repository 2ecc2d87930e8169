// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The hub: ready queue, timer heap, descriptor table and the dispatch loop.
//!
//! One driver runs every task. Tasks suspend only inside hub operations;
//! the driver never blocks except in the reactor wait (or a plain sleep
//! when timers are pending and nothing is registered).
//!
//! Components:
//! - `task`: task ids, boxing, panic isolation
//! - `scheduler`: timer heap with lazy removal
//! - `reactor`: epoll wrapper

pub mod reactor;
pub mod scheduler;
mod task;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::channel::{Channel, ChannelState};
use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventState};
use crate::park::{Expire, Park};

use self::reactor::{Mask, Reactor, Readiness};
use self::scheduler::{Scheduler, TimerHandle};
use self::task::{BoxFuture, Step};

pub use self::task::{TaskId, TaskOutput};

/// What a timer does when it comes due.
pub(crate) enum Timed {
    /// Start a task created by `spawn_later`.
    Spawn(TaskId),
    /// Resume a sleeper.
    Wake(Rc<Park<()>>),
    /// Fail a bounded wait with `Timeout`.
    Expire(Rc<dyn Expire>, Duration),
}

/// State behind every `Hub` handle.
pub(crate) struct Shared {
    config: HubConfig,
    ready: RefCell<VecDeque<TaskId>>,
    tasks: RefCell<HashMap<TaskId, BoxFuture>>,
    next_task: Cell<u64>,
    current: Cell<Option<TaskId>>,
    timers: RefCell<Scheduler<Timed>>,
    registered: RefCell<HashMap<RawFd, Rc<ChannelState<Readiness>>>>,
    stopped: Rc<EventState>,
    reactor: Reactor,
}

impl Shared {
    /// Queue a task to run in the current or next ready pass.
    pub(crate) fn wake(&self, id: TaskId) {
        self.ready.borrow_mut().push_back(id);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    #[cfg(test)]
    pub(crate) fn timers_len(&self) -> usize {
        self.timers.borrow().len()
    }
}

/// Handle to a runtime instance. Cheap to clone; every primitive carries one.
#[derive(Clone)]
pub struct Hub {
    shared: Rc<Shared>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("ready", &self.shared.ready.borrow().len())
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("timers", &self.shared.timers.borrow().len())
            .field("registered", &self.shared.registered.borrow().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Hub {
    pub fn new() -> Result<Self> {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Result<Self> {
        let reactor = Reactor::new()?;
        Ok(Self {
            shared: Rc::new(Shared {
                config: config.sanitized(),
                ready: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(HashMap::new()),
                next_task: Cell::new(0),
                current: Cell::new(None),
                timers: RefCell::new(Scheduler::new()),
                registered: RefCell::new(HashMap::new()),
                stopped: Rc::new(EventState::new(false)),
                reactor,
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// The task currently being polled, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.current.get()
    }

    pub(crate) fn require_task(&self) -> Result<TaskId> {
        self.current_task().ok_or(Error::NoTask)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Fires once the hub has deadlocked or finished shutting down.
    pub fn stopped(&self) -> Event {
        Event::from_state(self.clone(), self.shared.stopped.clone())
    }

    pub fn channel<T: 'static>(&self) -> Channel<T> {
        Channel::new(self.clone())
    }

    pub fn event(&self, fired: bool) -> Event {
        Event::new(self.clone(), fired)
    }

    /// Queue a task to run on the next ready pass.
    pub fn spawn<F>(&self, fut: F) -> Result<TaskId>
    where
        F: Future + 'static,
        F::Output: TaskOutput,
    {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        let id = self.insert_task(fut);
        self.shared.wake(id);
        Ok(id)
    }

    /// Start a task once `delay` has passed.
    pub fn spawn_later<F>(&self, delay: Duration, fut: F) -> Result<TaskId>
    where
        F: Future + 'static,
        F::Output: TaskOutput,
    {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        let id = self.insert_task(fut);
        self.add_timer(delay, Timed::Spawn(id));
        tracing::debug!(task = %id, ?delay, "spawn scheduled");
        Ok(id)
    }

    fn insert_task<F>(&self, fut: F) -> TaskId
    where
        F: Future + 'static,
        F::Output: TaskOutput,
    {
        let id = TaskId(self.shared.next_task.get());
        self.shared.next_task.set(id.0 + 1);
        self.shared.tasks.borrow_mut().insert(id, task::boxed(id, fut));
        id
    }

    /// Suspend the calling task for `duration`. Fails with `Stop` if the hub
    /// shuts down first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        let park = Park::new(self.require_task()?);
        let handle = self.add_timer(duration, Timed::Wake(park.clone()));
        let _guard = TimerGuard { hub: self, handle };
        park.wait().await
    }

    pub(crate) fn add_timer(&self, delay: Duration, action: Timed) -> TimerHandle {
        self.shared.timers.borrow_mut().add(delay, action)
    }

    pub(crate) fn remove_timer(&self, handle: TimerHandle) {
        self.shared.timers.borrow_mut().remove(handle);
    }

    /// Watch `fd` for `mask`; every readiness notification arrives on the
    /// returned channel. Registering an already registered descriptor
    /// replaces (and closes) its previous channel.
    pub fn register(&self, fd: RawFd, mask: Mask) -> Result<Channel<Readiness>> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        self.shared.reactor.add(fd, mask)?;

        let state = Rc::new(ChannelState::new());
        let previous = self.shared.registered.borrow_mut().insert(fd, state.clone());
        if let Some(previous) = previous {
            let _ = previous.close(&self.shared);
        }
        tracing::debug!(fd, mask = mask.bits(), "registered");
        Ok(Channel::from_state(self.clone(), state))
    }

    /// Push a readiness notification as if the reactor had reported it.
    #[cfg(test)]
    pub(crate) fn deliver_readiness(&self, readiness: Readiness) {
        let target = self.shared.registered.borrow().get(&readiness.fd).cloned();
        if let Some(state) = target {
            let _ = state.send(&self.shared, Ok(readiness));
        }
    }

    /// Stop watching `fd` and close its channel. Unknown descriptors are ignored.
    pub fn unregister(&self, fd: RawFd) {
        let removed = self.shared.registered.borrow_mut().remove(&fd);
        let Some(state) = removed else { return };

        if let Err(err) = self.shared.reactor.delete(fd) {
            tracing::debug!(fd, error = %err, "epoll delete failed");
        }
        let _ = state.close(&self.shared);
        tracing::debug!(fd, "unregistered");
    }

    /// Request a graceful shutdown and wait for it to complete.
    ///
    /// After a short grace delay every registered channel receives `Stop`
    /// and every timer-parked task is resumed with `Stop`. Returns once
    /// nothing is registered and the hub has stopped.
    pub async fn stop(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        tracing::info!("hub stop requested");

        match self.sleep(self.shared.config.stop_grace()).await {
            Err(e) if !e.is_stop() => return Err(e),
            _ => {}
        }

        let registered: Vec<_> = self.shared.registered.borrow().values().cloned().collect();
        for state in registered {
            let _ = state.send(&self.shared, Err(Error::Stop));
        }

        let pending = self.shared.timers.borrow_mut().drain();
        for timed in pending {
            match timed {
                Timed::Spawn(id) => {
                    let unstarted = self.shared.tasks.borrow_mut().remove(&id);
                    drop(unstarted);
                }
                Timed::Wake(park) => {
                    let _ = park.offer(&self.shared, Err(Error::Stop));
                }
                Timed::Expire(park, _) => park.expire(&self.shared, Error::Stop),
            }
        }

        match self.stopped().wait().await {
            Err(e) if !e.is_closed() => Err(e),
            _ => Ok(()),
        }
    }

    /// Drive the hub until it deadlocks or is stopped. Fails with `Closed`
    /// if it has already stopped.
    pub fn run(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Closed);
        }
        self.drive(&|| false)
    }

    /// Run `fut` as a task and drive the hub until it finishes. Other tasks
    /// stay suspended in the hub and resume on the next `run`/`block_on`.
    /// Fails with `Closed` if the hub stops before `fut` completes.
    pub fn block_on<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        self.spawn(async move {
            let value = fut.await;
            *out.borrow_mut() = Some(value);
        })?;

        self.drive(&|| slot.borrow().is_some())?;
        let value = slot.borrow_mut().take();
        value.ok_or(Error::Closed)
    }

    /// The dispatch loop.
    fn drive(&self, finished: &dyn Fn() -> bool) -> Result<()> {
        let shared = &self.shared;
        loop {
            if shared.is_stopped() {
                return Ok(());
            }

            // 1. Ready tasks to exhaustion.
            self.run_ready();
            if finished() {
                return Ok(());
            }

            // 2. Timers: overdue ones preempt I/O, and with nothing
            //    registered a plain sleep is all there is to do.
            let due = shared.timers.borrow_mut().is_due();
            if due {
                self.fire_next();
                continue;
            }
            let timeout = shared.timers.borrow_mut().timeout();
            if let Some(remaining) = timeout {
                if shared.registered.borrow().is_empty() {
                    std::thread::sleep(remaining);
                    continue;
                }
            }

            // 3. Nothing registered, nothing pending: nothing can ever wake.
            if shared.registered.borrow().is_empty() {
                tracing::debug!("no registrations and no timers, stopping hub");
                self.finish();
                return Ok(());
            }

            // 4. Wait on the reactor, bounded by the next timer.
            let events = loop {
                match shared.reactor.wait(timeout, shared.config.max_events) {
                    Ok(events) => break events,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::error!(error = %err, "reactor wait failed");
                        return Err(err.into());
                    }
                }
            };

            // 5. Deliver. A wait that timed out loops back to step 2, which
            //    fires the timer once it is actually due.
            if events.is_empty() {
                continue;
            }
            tracing::trace!(count = events.len(), "readiness events");
            for readiness in events {
                let target = shared.registered.borrow().get(&readiness.fd).cloned();
                if let Some(state) = target {
                    let _ = state.send(shared, Ok(readiness));
                }
            }
        }
    }

    fn run_ready(&self) {
        let shared = &self.shared;
        loop {
            let next = shared.ready.borrow_mut().pop_front();
            let Some(id) = next else { break };

            // Taken out of the table while polling so the task can spawn.
            let taken = shared.tasks.borrow_mut().remove(&id);
            let Some(mut fut) = taken else { continue };

            shared.current.set(Some(id));
            let step = task::poll_task(id, &mut fut);
            shared.current.set(None);

            match step {
                Step::Pending => {
                    shared.tasks.borrow_mut().insert(id, fut);
                }
                Step::Complete | Step::Panicked => {
                    tracing::trace!(task = %id, ?step, "task finished");
                    drop(fut);
                }
            }
        }
    }

    fn fire_next(&self) {
        let next = self.shared.timers.borrow_mut().pop();
        let Some(timed) = next else { return };
        match timed {
            Timed::Spawn(id) => self.shared.wake(id),
            Timed::Wake(park) => {
                let _ = park.offer(&self.shared, Ok(()));
            }
            Timed::Expire(park, after) => park.expire(&self.shared, Error::Timeout(after)),
        }
    }

    /// Fire `stopped`, let its waiters observe it, then drop whatever is
    /// still parked so the handles they hold are released.
    fn finish(&self) {
        self.shared.stopped.set(&self.shared);
        self.run_ready();

        let leftover: Vec<_> = self.shared.tasks.borrow_mut().drain().collect();
        if !leftover.is_empty() {
            tracing::debug!(count = leftover.len(), "dropping parked tasks");
        }
        drop(leftover);
        self.shared.ready.borrow_mut().clear();
        let timers = self.shared.timers.borrow_mut().drain();
        drop(timers);
    }
}

/// Removes a sleeper's timer if the sleep is abandoned.
struct TimerGuard<'a> {
    hub: &'a Hub,
    handle: TimerHandle,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.hub.remove_timer(self.handle);
    }
}
