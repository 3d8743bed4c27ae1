use std::os::fd::BorrowedFd;

use crate::error::{Result, SocketError};
use crate::timeout::TimeoutBudget;
use crate::transport::{self, Handle};

/// Byte transport underneath a [`BufferedStream`](super::BufferedStream).
///
/// Implemented by the raw socket channel and by any wrapping layer (for example
/// an encrypting transport) that itself sits on top of another `IoChannel`.
/// Errors must already be classified: layer-specific failures are reported as
/// [`SocketError::Io`] carrying the layer's message.
pub trait IoChannel {
    fn send(&mut self, data: &[u8], budget: &TimeoutBudget) -> Result<usize>;
    fn recv(&mut self, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize>;

    /// Descriptor used for readiness multiplexing, if there is one.
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl<C: IoChannel + ?Sized> IoChannel for &mut C {
    fn send(&mut self, data: &[u8], budget: &TimeoutBudget) -> Result<usize> {
        (**self).send(data, budget)
    }

    fn recv(&mut self, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
        (**self).recv(buf, budget)
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        (**self).descriptor()
    }
}

impl<C: IoChannel + ?Sized> IoChannel for Box<C> {
    fn send(&mut self, data: &[u8], budget: &TimeoutBudget) -> Result<usize> {
        (**self).send(data, budget)
    }

    fn recv(&mut self, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
        (**self).recv(buf, budget)
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        (**self).descriptor()
    }
}

/// Channel over a raw socket handle. Retries after readiness waits are handled
/// here, so callers only ever see a byte count, `Timeout`, `Closed` or a
/// classified OS error.
#[derive(Debug, Default)]
pub struct SocketChannel {
    handle: Handle,
}

impl SocketChannel {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }

    pub fn into_handle(self) -> Handle {
        self.handle
    }
}

impl IoChannel for SocketChannel {
    fn send(&mut self, data: &[u8], budget: &TimeoutBudget) -> Result<usize> {
        loop {
            match transport::send(&self.handle, data, budget) {
                Err(SocketError::Retry) => continue,
                other => return other,
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
        loop {
            match transport::recv(&self.handle, buf, budget) {
                Err(SocketError::Retry) => continue,
                other => return other,
            }
        }
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.handle.fd().ok()
    }
}
