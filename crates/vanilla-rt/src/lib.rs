// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Vanilla runtime library.
//!
//! A single-threaded cooperative runtime: one hub drives every task,
//! multiplexes descriptor readiness through epoll and runs timers off a
//! lazy-deletion heap. Tasks suspend only inside hub operations.
//!
//! Components:
//! - hub: ready queue, timers, registration, dispatch loop, shutdown
//! - channels: unbounded handoff queues with in-band faults and pipelines
//! - events: resettable one-shot flags
//! - select: first-ready receive across channels
//! - io: non-blocking descriptors with byte reassembly

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod io;
mod park;
pub mod select;

pub use channel::{Channel, Iter, Stage};
pub use config::HubConfig;
pub use error::{Error, Preserved, Result};
pub use event::Event;
pub use hub::reactor::{Mask, Readiness};
pub use hub::{Hub, TaskId, TaskOutput};
pub use io::Fd;
