// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot event flags.
//!
//! `set` releases the current waiters FIFO. `clear` starts a new
//! generation with a fresh waiter list; tasks parked in the old generation
//! are never released by a later `set`.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::hub::{Hub, Shared};
use crate::park::Park;

pub(crate) struct EventState {
    fired: Cell<bool>,
    waiters: RefCell<Vec<Rc<Park<()>>>>,
}

impl EventState {
    pub fn new(fired: bool) -> Self {
        Self {
            fired: Cell::new(fired),
            waiters: RefCell::new(Vec::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.fired.get()
    }

    pub fn set(&self, hub: &Shared) {
        self.fired.set(true);
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for park in waiters {
            let _ = park.offer(hub, Ok(()));
        }
    }

    pub fn clear(&self) {
        self.fired.set(false);
        *self.waiters.borrow_mut() = Vec::new();
    }

    fn forget(&self, park: &Rc<Park<()>>) {
        self.waiters.borrow_mut().retain(|p| !Rc::ptr_eq(p, park));
    }
}

/// A flag tasks can wait on.
#[derive(Clone)]
pub struct Event {
    hub: Hub,
    state: Rc<EventState>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("fired", &self.state.fired.get())
            .field("waiters", &self.state.waiters.borrow().len())
            .finish()
    }
}

impl Event {
    pub(crate) fn new(hub: Hub, fired: bool) -> Self {
        Self::from_state(hub, Rc::new(EventState::new(fired)))
    }

    pub(crate) fn from_state(hub: Hub, state: Rc<EventState>) -> Self {
        Self { hub, state }
    }

    pub fn is_set(&self) -> bool {
        self.state.is_set()
    }

    /// Mark fired and release everyone currently waiting, oldest first.
    pub fn set(&self) {
        self.state.set(self.hub.shared());
    }

    /// Reset the flag. Returns `self` for chaining.
    pub fn clear(&self) -> &Self {
        self.state.clear();
        self
    }

    /// Resolve immediately if fired, else suspend until the next `set`.
    pub async fn wait(&self) -> Result<()> {
        if self.state.is_set() {
            return Ok(());
        }
        if self.hub.is_stopped() {
            return Err(Error::Closed);
        }

        let park = Park::new(self.hub.require_task()?);
        self.state.waiters.borrow_mut().push(park.clone());
        let _guard = WaitGuard {
            state: &self.state,
            park: &park,
        };
        park.wait().await
    }
}

struct WaitGuard<'a> {
    state: &'a EventState,
    park: &'a Rc<Park<()>>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.state.forget(self.park);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_releases_waiters_in_order() {
        let hub = Hub::new().unwrap();
        let ev = hub.event(false);
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let ev = ev.clone();
            let log = log.clone();
            hub.spawn(async move {
                ev.wait().await?;
                log.borrow_mut().push(i);
                Ok::<_, Error>(())
            })
            .unwrap();
        }

        let setter = ev.clone();
        let h = hub.clone();
        hub.spawn(async move {
            h.sleep(std::time::Duration::from_millis(1)).await?;
            setter.set();
            Ok::<_, Error>(())
        })
        .unwrap();

        hub.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(ev.is_set());
    }

    #[test]
    fn wait_on_fired_event_returns_immediately() {
        let hub = Hub::new().unwrap();
        let ev = hub.event(true);
        let out = hub.block_on(async move { ev.wait().await }).unwrap();
        assert!(out.is_ok());
    }

    #[test]
    fn clear_starts_a_new_generation() {
        let hub = Hub::new().unwrap();
        let ev = hub.event(false);
        let early = Rc::new(Cell::new(false));
        let late = Rc::new(Cell::new(false));

        // Parks in generation one.
        let (e, flag) = (ev.clone(), early.clone());
        hub.spawn(async move {
            e.wait().await?;
            flag.set(true);
            Ok::<_, Error>(())
        })
        .unwrap();

        // Clears before the first set: generation-one waiter is abandoned.
        let (e, flag, h) = (ev.clone(), late.clone(), hub.clone());
        hub.spawn(async move {
            e.clear();
            let waiter = e.clone();
            let f = flag.clone();
            h.spawn(async move {
                waiter.wait().await?;
                f.set(true);
                Ok::<_, Error>(())
            })?;
            h.sleep(std::time::Duration::from_millis(1)).await?;
            e.set();
            Ok::<_, Error>(())
        })
        .unwrap();

        hub.run().unwrap();
        assert!(!early.get());
        assert!(late.get());
    }

    #[test]
    fn wait_after_set_then_clear_parks() {
        let hub = Hub::new().unwrap();
        let ev = hub.event(false);
        ev.set();
        ev.clear();
        assert!(!ev.is_set());

        let resumed = Rc::new(Cell::new(false));
        let (e, r) = (ev.clone(), resumed.clone());
        hub.spawn(async move {
            e.wait().await?;
            r.set(true);
            Ok::<_, Error>(())
        })
        .unwrap();

        hub.run().unwrap();
        assert!(!resumed.get());
    }
}
