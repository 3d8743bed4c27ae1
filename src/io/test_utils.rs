use std::collections::VecDeque;

use crate::error::{Result, SocketError};
use crate::io::IoChannel;
use crate::timeout::TimeoutBudget;

#[derive(Debug)]
pub enum Step {
    Data(Vec<u8>),
    Retry,
    Timeout,
    Closed,
}

/// In-memory channel replaying a script of receive outcomes. Once the script
/// is exhausted every receive reports `Closed`.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    steps: VecDeque<Step>,
    written: Vec<u8>,
    send_limit: Option<usize>,
    send_capacity: Option<usize>,
    pub recv_calls: usize,
    pub send_calls: usize,
    pub largest_recv_request: usize,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, data: &[u8]) -> Self {
        self.steps.push_back(Step::Data(data.to_vec()));
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn with_chunks<'a>(mut self, chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        for chunk in chunks {
            self.steps.push_back(Step::Data(chunk.to_vec()));
        }
        self
    }

    /// Caps the number of bytes accepted by a single send call.
    pub fn with_send_limit(mut self, limit: usize) -> Self {
        self.send_limit = Some(limit);
        self
    }

    /// Total bytes accepted before sends start timing out.
    pub fn with_send_capacity(mut self, capacity: usize) -> Self {
        self.send_capacity = Some(capacity);
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl IoChannel for ScriptedChannel {
    fn send(&mut self, data: &[u8], _budget: &TimeoutBudget) -> Result<usize> {
        self.send_calls += 1;
        let mut n = data.len();
        if let Some(limit) = self.send_limit {
            n = n.min(limit);
        }
        if let Some(capacity) = self.send_capacity {
            let room = capacity.saturating_sub(self.written.len());
            if room == 0 {
                return Err(SocketError::Timeout);
            }
            n = n.min(room);
        }
        self.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn recv(&mut self, buf: &mut [u8], _budget: &TimeoutBudget) -> Result<usize> {
        self.recv_calls += 1;
        self.largest_recv_request = self.largest_recv_request.max(buf.len());
        match self.steps.pop_front() {
            None | Some(Step::Closed) => Err(SocketError::Closed),
            Some(Step::Retry) => Err(SocketError::Retry),
            Some(Step::Timeout) => Err(SocketError::Timeout),
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

/// Wrapping layer that forwards to another channel in bounded pieces.
#[derive(Debug)]
pub struct ChunkedChannel<C> {
    inner: C,
    max: usize,
}

impl<C: IoChannel> ChunkedChannel<C> {
    pub fn new(inner: C, max: usize) -> Self {
        Self { inner, max }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: IoChannel> IoChannel for ChunkedChannel<C> {
    fn send(&mut self, data: &[u8], budget: &TimeoutBudget) -> Result<usize> {
        let n = data.len().min(self.max);
        self.inner.send(&data[..n], budget)
    }

    fn recv(&mut self, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
        let n = buf.len().min(self.max);
        self.inner.recv(&mut buf[..n], budget)
    }

    fn descriptor(&self) -> Option<std::os::fd::BorrowedFd<'_>> {
        self.inner.descriptor()
    }
}
