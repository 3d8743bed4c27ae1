//! TCP sockets as an explicit state machine.
//!
//! A [`TcpMaster`] is a fresh socket. `connect` turns it into a
//! [`TcpClient`], `listen` turns it into a [`TcpServer`]; accepting yields a
//! new client owning a new descriptor. A failed connect hands the master back
//! inside [`ConnectError`].

use std::net::{Shutdown, SocketAddr};
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::sys::socket::{AddressFamily, SockProtocol, SockType};
use thiserror::Error;
use tracing::debug;

use crate::config::SocketConfig;
use crate::error::{Result, SocketError, Transfer};
use crate::io::{BufferedStream, ReceivePattern, SocketChannel, StreamStats};
use crate::select::Pollable;
use crate::timeout::TimeoutBudget;
use crate::transport::{self, Handle, SocketOption};

const DEFAULT_BACKLOG: i32 = 32;

#[derive(Debug)]
pub struct TcpMaster {
    handle: Handle,
    budget: TimeoutBudget,
    backlog: i32,
}

impl TcpMaster {
    pub fn new(family: AddressFamily) -> Result<Self> {
        let handle = transport::create(family, SockType::Stream, Some(SockProtocol::Tcp))?;
        Ok(Self {
            handle,
            budget: TimeoutBudget::default(),
            backlog: DEFAULT_BACKLOG,
        })
    }

    pub fn new_v4() -> Result<Self> {
        Self::new(AddressFamily::Inet)
    }

    pub fn new_v6() -> Result<Self> {
        Self::new(AddressFamily::Inet6)
    }

    /// Creates a socket for `family` with the options and timeouts of `config`.
    pub fn with_config(family: AddressFamily, config: &SocketConfig) -> Result<Self> {
        let mut master = Self::new(family)?;
        for option in config.options() {
            master.set_option(option)?;
        }
        master.settimeout(config.timeouts.block, config.timeouts.total);
        master.backlog = config.backlog;
        Ok(master)
    }

    pub fn settimeout(&mut self, block: Option<f64>, total: Option<f64>) {
        self.budget.set_limits_secs(block, total);
    }

    pub fn set_option(&mut self, option: SocketOption) -> Result<()> {
        transport::set_option(&self.handle, option)
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        transport::bind(&self.handle, &addr)
    }

    pub fn getsockname(&self) -> Result<SocketAddr> {
        transport::local_addr(&self.handle)
    }

    /// Connects to `addr`. On failure the master comes back in the error, so a
    /// connect that timed out while in progress can be resumed with another
    /// call, or the socket closed explicitly.
    pub fn connect(mut self, addr: SocketAddr) -> std::result::Result<TcpClient, ConnectError> {
        self.budget.start();
        if let Err(error) = transport::connect(&self.handle, &addr, &self.budget) {
            debug!("connect to {} failed: {}", addr, error);
            return Err(ConnectError {
                master: self,
                error,
            });
        }
        debug!("connected to {}", addr);
        let mut client = TcpClient::from_handle(self.handle);
        *client.stream.budget_mut() = self.budget;
        Ok(client)
    }

    pub fn listen(self) -> Result<TcpServer> {
        transport::listen(&self.handle, self.backlog)?;
        debug!("listening, backlog {}", self.backlog);
        Ok(TcpServer {
            handle: self.handle,
            budget: self.budget,
        })
    }

    pub fn close(&mut self) {
        self.handle.destroy();
    }
}

/// A failed [`TcpMaster::connect`], still owning the socket.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ConnectError {
    pub master: TcpMaster,
    #[source]
    pub error: SocketError,
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }

    pub fn into_parts(self) -> (TcpMaster, SocketError) {
        (self.master, self.error)
    }
}

impl Pollable for TcpMaster {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.handle.fd().ok()
    }
}

#[derive(Debug)]
pub struct TcpServer {
    handle: Handle,
    budget: TimeoutBudget,
}

impl TcpServer {
    /// Waits for a connection within the server's timeouts. The accepted
    /// client starts with unbounded timeouts of its own.
    pub fn accept(&mut self) -> Result<TcpClient> {
        self.budget.start();
        let handle = transport::accept(&self.handle, &self.budget)?;
        Ok(TcpClient::from_handle(handle))
    }

    pub fn settimeout(&mut self, block: Option<f64>, total: Option<f64>) {
        self.budget.set_limits_secs(block, total);
    }

    pub fn set_option(&mut self, option: SocketOption) -> Result<()> {
        transport::set_option(&self.handle, option)
    }

    pub fn getsockname(&self) -> Result<SocketAddr> {
        transport::local_addr(&self.handle)
    }

    pub fn close(&mut self) {
        self.handle.destroy();
    }
}

impl Pollable for TcpServer {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.handle.fd().ok()
    }
}

/// Connected stream with a read-ahead buffer.
pub struct TcpClient {
    stream: BufferedStream<SocketChannel>,
}

impl TcpClient {
    fn from_handle(handle: Handle) -> Self {
        Self {
            stream: BufferedStream::new(SocketChannel::new(handle)),
        }
    }

    fn handle(&self) -> &Handle {
        self.stream.channel().handle()
    }

    pub fn send(&mut self, data: &[u8], start: i64, end: i64) -> Transfer<usize> {
        self.stream.send(data, start, end)
    }

    pub fn send_all(&mut self, data: &[u8]) -> Transfer<usize> {
        self.stream.send_all(data)
    }

    pub fn receive(&mut self, pattern: ReceivePattern, prefix: &[u8]) -> Transfer<Vec<u8>> {
        self.stream.receive(pattern, prefix)
    }

    pub fn receive_exact(&mut self, n: usize) -> Transfer<Vec<u8>> {
        self.stream.receive_exact(n)
    }

    pub fn receive_line(&mut self) -> Transfer<Vec<u8>> {
        self.stream.receive_line()
    }

    pub fn receive_until_closed(&mut self) -> Transfer<Vec<u8>> {
        self.stream.receive_until_closed()
    }

    pub fn settimeout(&mut self, block: Option<f64>, total: Option<f64>) {
        self.stream.set_timeout(block, total);
    }

    pub fn timeouts(&self) -> (Option<Duration>, Option<Duration>) {
        self.stream.budget().limits()
    }

    pub fn getstats(&self) -> StreamStats {
        self.stream.stats()
    }

    pub fn setstats(&mut self, bytes_received: u64, bytes_sent: u64, age: Duration) {
        self.stream.set_stats(bytes_received, bytes_sent, age);
    }

    pub fn dirty(&self) -> bool {
        self.stream.is_dirty()
    }

    pub fn set_option(&mut self, option: SocketOption) -> Result<()> {
        transport::set_option(self.handle(), option)
    }

    pub fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        transport::shutdown(self.handle(), how)
    }

    pub fn getpeername(&self) -> Result<SocketAddr> {
        transport::peer_addr(self.handle())
    }

    pub fn getsockname(&self) -> Result<SocketAddr> {
        transport::local_addr(self.handle())
    }

    pub fn stream(&self) -> &BufferedStream<SocketChannel> {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut BufferedStream<SocketChannel> {
        &mut self.stream
    }

    pub fn close(&mut self) {
        self.stream.channel_mut().handle_mut().destroy();
    }
}

impl Pollable for TcpClient {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.handle().fd().ok()
    }

    fn is_dirty(&self) -> bool {
        self.stream.is_dirty()
    }
}
