// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking descriptors on top of the hub.
//!
//! An `Fd` owns one descriptor. A pump task drains it on every readiness
//! notification and queues the chunks in order on an internal channel;
//! `recv_*` reassemble from there and push any over-read back to the front.
//!
//! A stream that ends (peer closed, read error, hangup, hub stop) delivers
//! `Stop` to the next reader and then reports `Closed`.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::hub::reactor::{Mask, Readiness};
use crate::hub::Hub;

struct FdInner {
    hub: Hub,
    fd: RawFd,
    pending: Channel<Vec<u8>>,
    closed: Cell<bool>,
}

/// Handle to a descriptor driven by the hub. Clones share the descriptor.
#[derive(Clone)]
pub struct Fd {
    inner: Rc<FdInner>,
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fd")
            .field("fd", &self.inner.fd)
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

impl Fd {
    /// Take ownership of `fd`: switch it to non-blocking mode, register it
    /// for readable, error and hangup readiness, and start its pump task.
    pub fn new(hub: &Hub, fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        let events = hub.register(fd, Mask::READABLE | Mask::ERROR | Mask::HANGUP)?;

        let this = Fd {
            inner: Rc::new(FdInner {
                hub: hub.clone(),
                fd,
                pending: hub.channel(),
                closed: Cell::new(false),
            }),
        };
        if let Err(err) = hub.spawn(pump(this.clone(), events)) {
            this.close();
            return Err(err);
        }
        Ok(this)
    }

    pub fn fileno(&self) -> RawFd {
        self.inner.fd
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// The next chunk as read from the descriptor.
    pub async fn recv_chunk(&self) -> Result<Vec<u8>> {
        self.inner.pending.recv().await
    }

    /// Exactly `n` bytes, assembled from as many chunks as it takes.
    pub async fn recv_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(n);
        while buf.len() < n {
            match self.inner.pending.recv().await {
                Ok(mut chunk) => {
                    let need = n - buf.len();
                    if chunk.len() > need {
                        self.unread(chunk.split_off(need));
                    }
                    buf.extend_from_slice(&chunk);
                }
                Err(err) => {
                    self.unread(buf);
                    return Err(err);
                }
            }
        }
        Ok(buf)
    }

    /// Everything up to the next `sep`. The separator is consumed; the
    /// bytes after it stay queued. An empty `sep` matches at once.
    pub async fn recv_partition(&self, sep: &[u8]) -> Result<Vec<u8>> {
        if sep.is_empty() {
            return Ok(Vec::new());
        }
        let mut buf: Vec<u8> = Vec::new();
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&buf[scanned..], sep) {
                let at = scanned + pos;
                let rest = buf.split_off(at + sep.len());
                buf.truncate(at);
                self.unread(rest);
                return Ok(buf);
            }
            // A separator may straddle the chunk boundary.
            scanned = buf.len().saturating_sub(sep.len() - 1);

            match self.inner.pending.recv().await {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(err) => {
                    self.unread(buf);
                    return Err(err);
                }
            }
        }
    }

    fn unread(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.inner.pending.push_front(bytes);
        }
    }

    /// Write all of `data`. Suspends for the configured backoff whenever
    /// the descriptor is full.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let backoff = self.inner.hub.config().write_backoff();
        let mut written = 0;
        while written < data.len() {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let rest = &data[written..];
            let n = unsafe {
                libc::write(self.inner.fd, rest.as_ptr() as *const libc::c_void, rest.len())
            };
            if n >= 0 {
                written += n as usize;
                continue;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.inner.hub.sleep(backoff).await?,
                io::ErrorKind::Interrupted => {}
                _ if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::EBADF)) => {
                    return Err(Error::Closed);
                }
                _ => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Unregister and close the descriptor. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        let fd = self.inner.fd;
        self.inner.hub.unregister(fd);
        if unsafe { libc::close(fd) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EBADF) {
                tracing::debug!(fd, error = %err, "close failed");
            }
        }
        let _ = self.inner.pending.close();
        tracing::debug!(fd, "fd closed");
    }

    /// Read until the descriptor would block. Returns true at end of stream.
    fn drain(&self, chunk: usize) -> bool {
        // The number may already belong to another descriptor.
        if self.is_closed() {
            return true;
        }
        let fd = self.inner.fd;
        loop {
            let mut buf = vec![0u8; chunk];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, chunk) };
            if n > 0 {
                buf.truncate(n as usize);
                if self.inner.pending.send(buf).is_err() {
                    return true;
                }
                continue;
            }
            if n == 0 {
                tracing::trace!(fd, "end of stream");
                return true;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return false,
                io::ErrorKind::Interrupted => {}
                _ => {
                    tracing::debug!(fd, error = %err, "read failed, ending stream");
                    return true;
                }
            }
        }
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.fd
    }
}

/// Moves readable data from the descriptor into `pending` until the
/// stream ends, then closes it.
async fn pump(fd: Fd, events: Channel<Readiness>) {
    let chunk = fd.inner.hub.config().read_chunk;
    let reason = loop {
        let readiness = match events.recv().await {
            Ok(readiness) => readiness,
            Err(err) => break err,
        };
        // Closed while this wakeup was queued.
        if fd.is_closed() {
            break Error::Closed;
        }
        if readiness.events.intersects(Mask::READABLE | Mask::HANGUP) && fd.drain(chunk) {
            break Error::Stop;
        }
        if readiness.events.intersects(Mask::ERROR | Mask::HANGUP) {
            break Error::Stop;
        }
    };
    tracing::debug!(fd = fd.inner.fd, reason = %reason, "fd stream ended");
    let _ = fd.inner.pending.send_fault(reason);
    fd.close();
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Hub {
    /// A non-blocking pipe, as `(writer, reader)`.
    pub fn pipe(&self) -> Result<(Fd, Fd)> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let [read_fd, write_fd] = fds;

        let reader = match Fd::new(self, read_fd) {
            Ok(reader) => reader,
            Err(err) => {
                unsafe {
                    libc::close(read_fd);
                    libc::close(write_fd);
                }
                return Err(err);
            }
        };
        match Fd::new(self, write_fd) {
            Ok(writer) => Ok((writer, reader)),
            Err(err) => {
                reader.close();
                unsafe { libc::close(write_fd) };
                Err(err)
            }
        }
    }
}
