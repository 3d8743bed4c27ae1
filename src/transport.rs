//! Non-blocking descriptor primitives.
//!
//! Every descriptor is put in non-blocking mode at creation. Calls that would
//! block wait in `poll(2)` for at most what the caller's [`TimeoutBudget`]
//! allows, so a wait is never longer than the budget and `EINTR` only costs the
//! wall-clock time that actually passed.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    self, AddressFamily, Backlog, MsgFlags, SockFlag, SockProtocol, SockType, SockaddrLike,
    SockaddrStorage, sockopt,
};
use tracing::{debug, trace};

use crate::error::{Result, SocketError, would_block};
use crate::timeout::TimeoutBudget;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* )) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(Errno::last())
        } else {
            Ok(res)
        }
    }};
}

/// Exclusively owned OS descriptor. Destroying it twice is a no-op.
#[derive(Debug, Default)]
pub struct Handle {
    fd: Option<OwnedFd>,
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }
}

impl Handle {
    /// A handle that has never held a descriptor.
    pub fn invalid() -> Self {
        Self { fd: None }
    }

    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    /// Borrows the descriptor, or reports `Closed` once destroyed.
    pub fn fd(&self) -> Result<BorrowedFd<'_>> {
        self.fd
            .as_ref()
            .map(AsFd::as_fd)
            .ok_or(SocketError::Closed)
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn destroy(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!("close fd {}", fd.as_raw_fd());
            drop(fd);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    /// Completion of a pending connect: writable or an error condition.
    Connect,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
            Interest::Connect => PollFlags::POLLOUT | PollFlags::POLLPRI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SocketOption {
    KeepAlive(bool),
    ReuseAddr(bool),
    NoDelay(bool),
    /// `None` disables lingering on close.
    Linger(Option<Duration>),
}

pub(crate) fn poll_timeout(millis: Option<u64>) -> PollTimeout {
    match millis {
        None => PollTimeout::NONE,
        Some(ms) => i32::try_from(ms)
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX),
    }
}

/// Waits until `fd` is ready for `interest` or the budget runs out.
pub fn wait(fd: BorrowedFd<'_>, interest: Interest, budget: &TimeoutBudget) -> Result<()> {
    loop {
        let timeout = poll_timeout(budget.remaining_millis());
        let mut fds = [PollFd::new(fd, interest.flags())];
        match poll(&mut fds, timeout) {
            Ok(0) => {
                trace!("wait({:?}) on fd {} timed out", interest, fd.as_raw_fd());
                return Err(SocketError::Timeout);
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

/// socket() in non-blocking mode with SO_REUSEADDR set.
pub fn create(
    family: AddressFamily,
    ty: SockType,
    protocol: Option<SockProtocol>,
) -> Result<Handle> {
    let fd = socket::socket(family, ty, SockFlag::empty(), protocol)
        .map_err(SocketError::create_failed)?;
    set_nonblocking(fd.as_raw_fd()).map_err(SocketError::create_failed)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(SocketError::create_failed)?;
    debug!("socket({:?}, {:?}) = fd {}", family, ty, fd.as_raw_fd());
    Ok(Handle::from(fd))
}

pub fn connect(handle: &Handle, addr: &SocketAddr, budget: &TimeoutBudget) -> Result<()> {
    let fd = handle.fd()?;
    let remote = SockaddrStorage::from(*addr);
    loop {
        match socket::connect(fd.as_raw_fd(), &remote) {
            Ok(()) | Err(Errno::EISCONN) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) => break,
            Err(e) if would_block(e) => break,
            Err(e) => return Err(e.into()),
        }
    }
    trace!("connect({}) in progress", addr);
    loop {
        wait(fd, Interest::Connect, budget)?;
        match socket::getsockopt(&fd, sockopt::SocketError)? {
            0 => match socket::getpeername::<SockaddrStorage>(fd.as_raw_fd()) {
                Ok(_) => return Ok(()),
                // woke up before the handshake finished
                Err(Errno::ENOTCONN) => continue,
                Err(e) => return Err(e.into()),
            },
            err => return Err(Errno::from_raw(err).into()),
        }
    }
}

pub fn bind(handle: &Handle, addr: &SocketAddr) -> Result<()> {
    let fd = handle.fd()?;
    let local = SockaddrStorage::from(*addr);
    debug!("bind({}) fd {}", addr, fd.as_raw_fd());
    socket::bind(fd.as_raw_fd(), &local)?;
    Ok(())
}

pub fn listen(handle: &Handle, backlog: i32) -> Result<()> {
    let fd = handle.fd()?;
    let backlog = Backlog::new(backlog)?;
    socket::listen(&fd, backlog)?;
    Ok(())
}

pub fn accept(handle: &Handle, budget: &TimeoutBudget) -> Result<Handle> {
    let fd = handle.fd()?;
    loop {
        match socket::accept(fd.as_raw_fd()) {
            Ok(raw) => {
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                set_nonblocking(raw)?;
                debug!("accept fd {} = fd {}", fd.as_raw_fd(), raw);
                return Ok(Handle::from(owned));
            }
            // the pending connection was reset before we got to it
            Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
            Err(e) if would_block(e) => wait(fd, Interest::Readable, budget)?,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One send attempt. `Retry` means the socket became writable after a wait.
pub fn send(handle: &Handle, data: &[u8], budget: &TimeoutBudget) -> Result<usize> {
    let fd = handle.fd()?;
    if data.is_empty() {
        return Ok(0);
    }
    loop {
        match socket::send(fd.as_raw_fd(), data, SEND_FLAGS) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) if would_block(e) => {
                wait(fd, Interest::Writable, budget)?;
                return Err(SocketError::Retry);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// One receive attempt. A zero-length read is the peer's EOF and reported as
/// `Closed`.
pub fn recv(handle: &Handle, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
    let fd = handle.fd()?;
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        match socket::recv(fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(0) => return Err(SocketError::Closed),
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(e) if would_block(e) => {
                wait(fd, Interest::Readable, budget)?;
                return Err(SocketError::Retry);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn shutdown(handle: &Handle, how: Shutdown) -> Result<()> {
    let fd = handle.fd()?;
    let how = match how {
        Shutdown::Read => socket::Shutdown::Read,
        Shutdown::Write => socket::Shutdown::Write,
        Shutdown::Both => socket::Shutdown::Both,
    };
    socket::shutdown(fd.as_raw_fd(), how)?;
    Ok(())
}

pub fn set_option(handle: &Handle, option: SocketOption) -> Result<()> {
    let fd = handle.fd()?;
    match option {
        SocketOption::KeepAlive(v) => socket::setsockopt(&fd, sockopt::KeepAlive, &v)?,
        SocketOption::ReuseAddr(v) => socket::setsockopt(&fd, sockopt::ReuseAddr, &v)?,
        SocketOption::NoDelay(v) => socket::setsockopt(&fd, sockopt::TcpNoDelay, &v)?,
        SocketOption::Linger(linger) => {
            let linger = libc::linger {
                l_onoff: linger.is_some() as libc::c_int,
                l_linger: linger.map_or(0, |d| d.as_secs() as libc::c_int),
            };
            socket::setsockopt(&fd, sockopt::Linger, &linger)?
        }
    }
    Ok(())
}

pub fn local_addr(handle: &Handle) -> Result<SocketAddr> {
    let fd = handle.fd()?;
    let addr = socket::getsockname::<SockaddrStorage>(fd.as_raw_fd())?;
    to_socket_addr(&addr)
}

pub fn peer_addr(handle: &Handle) -> Result<SocketAddr> {
    let fd = handle.fd()?;
    let addr = socket::getpeername::<SockaddrStorage>(fd.as_raw_fd())?;
    to_socket_addr(&addr)
}

pub fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn to_socket_addr(addr: &SockaddrStorage) -> Result<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::V4((*v4).into()));
    }
    if let Some(v6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::V6((*v6).into()));
    }
    Err(SocketError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unsupported address family {:?}", addr.family()),
    )))
}
