//! One-shot readiness multiplexing that knows about application buffers.
//!
//! A stream that already holds unread bytes is reported readable without
//! asking the OS, which would correctly say nothing more is on the wire.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use tracing::{trace, warn};

use crate::error::{Result, SocketError};
use crate::timeout::TimeoutBudget;
use crate::transport::poll_timeout;

/// Anything that can take part in [`select`].
pub trait Pollable {
    /// `None` once the underlying descriptor is closed; such objects are
    /// skipped.
    fn descriptor(&self) -> Option<BorrowedFd<'_>>;

    /// True when unread bytes are already buffered in user space.
    fn is_dirty(&self) -> bool {
        false
    }
}

impl<P: Pollable + ?Sized> Pollable for &P {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        (**self).descriptor()
    }

    fn is_dirty(&self) -> bool {
        (**self).is_dirty()
    }
}

/// Positions, within the sets passed to [`select`], of the ready objects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub readable: Vec<usize>,
    pub writable: Vec<usize>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

const READ_READY: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);
const WRITE_READY: PollFlags = PollFlags::POLLOUT.union(PollFlags::POLLERR);

fn is_ready(side: Side, revents: PollFlags) -> bool {
    match side {
        Side::Read => revents.intersects(READ_READY),
        Side::Write => revents.intersects(WRITE_READY),
    }
}

/// Waits until some object in `read` is readable or some object in `write` is
/// writable, for at most `timeout` (`None` waits indefinitely). Reports
/// `Timeout` when nothing became ready.
pub fn select(
    read: &[&dyn Pollable],
    write: &[&dyn Pollable],
    timeout: Option<Duration>,
) -> Result<Readiness> {
    let mut ready = Readiness::default();
    let mut fds = Vec::with_capacity(read.len() + write.len());
    let mut slots = Vec::with_capacity(read.len() + write.len());

    for (i, &obj) in read.iter().enumerate() {
        if obj.is_dirty() {
            ready.readable.push(i);
        } else if let Some(fd) = obj.descriptor() {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
            slots.push((Side::Read, i, fd.as_raw_fd()));
        }
    }
    for (i, &obj) in write.iter().enumerate() {
        if let Some(fd) = obj.descriptor() {
            fds.push(PollFd::new(fd, PollFlags::POLLOUT));
            slots.push((Side::Write, i, fd.as_raw_fd()));
        }
    }

    if fds.is_empty() && ready.is_empty() && timeout.is_none() {
        // nothing could ever wake us up
        return Err(SocketError::Timeout);
    }

    // dirty objects are already ready, only sample the others
    let limit = if ready.is_empty() {
        timeout
    } else {
        Some(Duration::ZERO)
    };
    let budget = TimeoutBudget::new(None, limit);
    loop {
        match poll(&mut fds, poll_timeout(budget.remaining_millis())) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    for (pfd, (side, i, raw)) in fds.iter().zip(slots) {
        let revents = pfd.revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLNVAL) {
            warn!("select: invalid descriptor {}", raw);
            continue;
        }
        if !is_ready(side, revents) {
            continue;
        }
        match side {
            Side::Read => ready.readable.push(i),
            Side::Write => ready.writable.push(i),
        }
    }
    ready.readable.sort_unstable();

    trace!(
        "select: {} readable, {} writable",
        ready.readable.len(),
        ready.writable.len()
    );
    if ready.is_empty() {
        Err(SocketError::Timeout)
    } else {
        Ok(ready)
    }
}
