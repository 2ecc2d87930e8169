// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll readiness polling.
//!
//! Level-triggered. The reactor only knows descriptors and masks; the hub
//! owns the descriptor → channel table and routes each event itself.

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness condition bits, in epoll's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mask(u32);

impl Mask {
    pub const READABLE: Mask = Mask(libc::EPOLLIN as u32);
    pub const WRITABLE: Mask = Mask(libc::EPOLLOUT as u32);
    pub const ERROR: Mask = Mask(libc::EPOLLERR as u32);
    pub const HANGUP: Mask = Mask(libc::EPOLLHUP as u32);
    /// Peer shut its writing half (stream sockets).
    pub const READ_HANGUP: Mask = Mask(libc::EPOLLRDHUP as u32);

    pub const fn empty() -> Self {
        Mask(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Mask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set.
    pub const fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set.
    pub const fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Mask {
    type Output = Mask;

    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

/// One readiness notification, delivered on a descriptor's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub events: Mask,
}

/// epoll instance. Owned by the hub; never shared across threads.
pub(crate) struct Reactor {
    epoll_fd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    /// Start watching `fd`, or replace its mask if already watched.
    pub fn add(&self, fd: RawFd, mask: Mask) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the FD was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block up to `timeout` (forever if `None`) and collect up to
    /// `max_events` notifications. `EINTR` surfaces as
    /// `ErrorKind::Interrupted`; the caller decides whether to retry.
    pub fn wait(&self, timeout: Option<Duration>, max_events: usize) -> io::Result<Vec<Readiness>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                max_events as i32,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(events[..n as usize]
            .iter()
            .map(|ev| Readiness {
                fd: ev.u64 as RawFd,
                events: Mask(ev.events),
            })
            .collect())
    }
}

/// Round up so a wait never returns before the timer it is bounded by.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
