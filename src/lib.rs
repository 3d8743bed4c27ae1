//! sockbuf
//!
//! Synchronous, timeout-bounded, buffered byte-stream I/O over non-blocking
//! sockets, plus a readiness multiplexer that accounts for bytes already
//! pulled into user-space buffers.

#[cfg(not(unix))]
compile_error!("sockbuf only supports unix platforms");

pub mod config;
pub mod error;
pub mod io;
pub mod select;
pub mod tcp;
pub mod timeout;
pub mod transport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::SocketConfig;
pub use error::{Incomplete, Result, SocketError, Transfer};
pub use io::{BufferedStream, IoChannel, ReceivePattern, SocketChannel, StreamStats};
pub use nix::sys::socket::AddressFamily;
pub use select::{Pollable, Readiness, select};
pub use tcp::{ConnectError, TcpClient, TcpMaster, TcpServer};
pub use timeout::TimeoutBudget;
pub use transport::{Handle, SocketOption};
