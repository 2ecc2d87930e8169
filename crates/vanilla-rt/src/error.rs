// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Errors double as channel payloads: a fault sent on a channel is re-raised
//! at the receiver's `recv` exactly as if it had been produced there.

use std::fmt;
use std::io;
use std::panic::Location;
use std::time::Duration;

use thiserror::Error;

/// Error produced by hub operations, or delivered in-band through a channel.
#[derive(Debug, Error)]
pub enum Error {
    /// A bounded wait expired.
    #[error("timeout: {0:?}")]
    Timeout(Duration),

    /// The channel or descriptor ended normally.
    #[error("closed")]
    Closed,

    /// Shutdown was requested. A flavour of `Closed`; see [`Error::is_closed`].
    #[error("stop")]
    Stop,

    /// A pipeline stage discarded the item. Never reaches a receiver.
    #[error("filtered")]
    Filter,

    /// Any other error generated while producing a channel item.
    #[error("{0}")]
    Fault(Box<dyn std::error::Error + 'static>),

    /// An error captured in one task and forwarded intact to another.
    #[error(transparent)]
    Preserved(Preserved),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// A suspending operation was awaited outside of a hub task.
    #[error("awaited outside of a hub task")]
    NoTask,
}

impl Error {
    /// Wrap an arbitrary error as a channel fault.
    pub fn fault<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Error::Fault(Box::new(err))
    }

    /// True for `Closed` and its `Stop` subtype.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::Stop)
    }

    /// True only for a shutdown request.
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stop)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Reach the original error inside a `Fault` or `Preserved`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::Fault(inner) => inner.downcast_ref::<E>(),
            Error::Preserved(p) => p.error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// An error forwarded through a channel with its original identity.
///
/// The receiver gets back the very error object the sender threw, plus the
/// location it was thrown from, so it can downcast and match on it.
pub struct Preserved {
    error: Box<dyn std::error::Error + 'static>,
    thrown_at: &'static Location<'static>,
}

impl Preserved {
    #[track_caller]
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self {
            error: Box::new(err),
            thrown_at: Location::caller(),
        }
    }

    pub fn thrown_at(&self) -> &'static Location<'static> {
        self.thrown_at
    }

    pub fn get_ref(&self) -> &(dyn std::error::Error + 'static) {
        self.error.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn std::error::Error + 'static> {
        self.error
    }
}

impl fmt::Debug for Preserved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preserved")
            .field("error", &self.error)
            .field("thrown_at", &format_args!("{}", self.thrown_at))
            .finish()
    }
}

impl fmt::Display for Preserved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (thrown at {})", self.error, self.thrown_at)
    }
}

impl std::error::Error for Preserved {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
