// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select: wait on several channels at once.
//!
//! Buffered items are checked first, in listed order. Otherwise one park
//! is filed on every channel; the first delivery resolves it, and the
//! remaining registrations are removed when the caller resumes.

use std::rc::Rc;

use crate::channel::{Channel, Waiter};
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::park::Park;

impl Hub {
    /// Receive from whichever channel delivers first. Returns the index of
    /// the winning channel with its item. A fault from any channel is
    /// returned as `Err`.
    pub async fn select<T: 'static>(&self, channels: &[&Channel<T>]) -> Result<(usize, T)> {
        for (index, chan) in channels.iter().enumerate() {
            if let Some(item) = chan.take() {
                return item.map(|v| (index, v));
            }
        }
        if channels.is_empty() || self.is_stopped() {
            return Err(Error::Closed);
        }

        let park = Park::new(self.require_task()?);
        let _guard = SelectGuard {
            channels,
            park: &park,
        };
        for (slot, chan) in channels.iter().enumerate() {
            chan.park(Waiter {
                park: park.clone(),
                slot,
            });
        }
        park.wait().await
    }
}

struct SelectGuard<'a, T: 'static> {
    channels: &'a [&'a Channel<T>],
    park: &'a Rc<Park<(usize, T)>>,
}

impl<T: 'static> Drop for SelectGuard<'_, T> {
    fn drop(&mut self) {
        for chan in self.channels {
            chan.state().forget(self.park);
        }
    }
}
