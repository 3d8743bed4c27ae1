use std::ops::Range;
use std::os::fd::BorrowedFd;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use crate::error::{Incomplete, Result, SocketError, Transfer};
use crate::io::IoChannel;
use crate::select::Pollable;
use crate::timeout::TimeoutBudget;

/// Read-ahead buffer size; one refill never asks the channel for more.
pub const BUFFER_SIZE: usize = 8192;
/// Largest slice handed to the channel by a single send call.
pub const STEP_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePattern {
    /// Exactly this many bytes.
    Exact(usize),
    /// One LF-terminated line, a CR right before the LF is dropped.
    Line,
    /// Everything until the peer closes.
    All,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid receive pattern '{0}'")]
pub struct InvalidPattern(pub String);

impl FromStr for ReceivePattern {
    type Err = InvalidPattern;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "*l" | "l" | "line" => Ok(ReceivePattern::Line),
            "*a" | "a" | "all" => Ok(ReceivePattern::All),
            n => n
                .parse::<usize>()
                .map(ReceivePattern::Exact)
                .map_err(|_| InvalidPattern(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub created: Instant,
}

impl StreamStats {
    fn new() -> Self {
        Self {
            bytes_received: 0,
            bytes_sent: 0,
            created: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Fixed-capacity read-ahead buffer over an [`IoChannel`].
///
/// Unread bytes live in `data[first..last]`. Whenever the buffer drains both
/// cursors go back to zero, so lines and exact reads never creep towards the end
/// of the array.
pub struct BufferedStream<C> {
    channel: C,
    budget: TimeoutBudget,
    data: Box<[u8]>,
    first: usize,
    last: usize,
    stats: StreamStats,
}

impl<C: IoChannel> BufferedStream<C> {
    pub fn new(channel: C) -> Self {
        Self::with_capacity(channel, BUFFER_SIZE)
    }

    pub fn with_capacity(channel: C, capacity: usize) -> Self {
        Self {
            channel,
            budget: TimeoutBudget::default(),
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            first: 0,
            last: 0,
            stats: StreamStats::new(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn budget(&self) -> &TimeoutBudget {
        &self.budget
    }

    pub fn budget_mut(&mut self) -> &mut TimeoutBudget {
        &mut self.budget
    }

    /// Sets the block and total limits in fractional seconds; `None` or a
    /// negative value leaves that limit unbounded.
    pub fn set_timeout(&mut self, block: Option<f64>, total: Option<f64>) {
        self.budget.set_limits_secs(block, total);
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// True while already-received bytes wait to be consumed.
    pub fn is_dirty(&self) -> bool {
        self.last > self.first
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.data[self.first..self.last]
    }

    pub fn cursors(&self) -> (usize, usize) {
        (self.first, self.last)
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Overrides the counters; `age` moves the creation time into the past.
    pub fn set_stats(&mut self, bytes_received: u64, bytes_sent: u64, age: Duration) {
        let now = Instant::now();
        self.stats = StreamStats {
            bytes_received,
            bytes_sent,
            created: now.checked_sub(age).unwrap_or(now),
        };
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Receives according to `pattern`, prepending `prefix` to the result. On
    /// failure the bytes gathered so far, prefix included, are returned with
    /// the error.
    pub fn receive(&mut self, pattern: ReceivePattern, prefix: &[u8]) -> Transfer<Vec<u8>> {
        self.budget.start();
        let mut out = prefix.to_vec();
        let result = match pattern {
            ReceivePattern::Exact(n) => self.read_exact_into(n, &mut out),
            ReceivePattern::Line => self.read_line_into(&mut out),
            ReceivePattern::All => self.read_all_into(&mut out),
        };
        match result {
            Ok(()) => Ok(out),
            Err(e) => Err(Incomplete::new(out, e)),
        }
    }

    pub fn receive_exact(&mut self, n: usize) -> Transfer<Vec<u8>> {
        self.receive(ReceivePattern::Exact(n), &[])
    }

    pub fn receive_line(&mut self) -> Transfer<Vec<u8>> {
        self.receive(ReceivePattern::Line, &[])
    }

    pub fn receive_until_closed(&mut self) -> Transfer<Vec<u8>> {
        self.receive(ReceivePattern::All, &[])
    }

    /// Sends `data[start..=end]` using 1-based inclusive indices, negative ones
    /// counting from the end. Returns how many bytes went out; on failure that
    /// count travels with the error.
    pub fn send(&mut self, data: &[u8], start: i64, end: i64) -> Transfer<usize> {
        self.budget.start();
        let Some(range) = send_range(data.len(), start, end) else {
            return Ok(0);
        };
        let pending = &data[range];
        let mut sent = 0;
        let mut failure = None;
        while sent < pending.len() {
            let step = (pending.len() - sent).min(STEP_SIZE);
            match self.channel.send(&pending[sent..sent + step], &self.budget) {
                Ok(0) => {
                    failure = Some(SocketError::Closed);
                    break;
                }
                Ok(n) => sent += n,
                Err(SocketError::Retry) => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.stats.bytes_sent += sent as u64;
        match failure {
            None => Ok(sent),
            Some(e) => Err(Incomplete::new(sent, e)),
        }
    }

    pub fn send_all(&mut self, data: &[u8]) -> Transfer<usize> {
        self.send(data, 1, -1)
    }

    /// Unread bytes, refilling from the channel first if the buffer is empty.
    fn peek(&mut self) -> Result<&[u8]> {
        if !self.is_dirty() {
            self.first = 0;
            self.last = 0;
            let n = loop {
                match self.channel.recv(&mut self.data, &self.budget) {
                    Err(SocketError::Retry) => continue,
                    other => break other?,
                }
            };
            trace!("buffer refilled with {} bytes", n);
            self.last = n;
            self.stats.bytes_received += n as u64;
        }
        Ok(&self.data[self.first..self.last])
    }

    fn skip(&mut self, count: usize) {
        self.first += count;
        if self.first >= self.last {
            self.first = 0;
            self.last = 0;
        }
    }

    fn read_exact_into(&mut self, wanted: usize, out: &mut Vec<u8>) -> Result<()> {
        let mut total = 0;
        while total < wanted {
            let chunk = self.peek()?;
            let count = chunk.len().min(wanted - total);
            out.extend_from_slice(&chunk[..count]);
            self.skip(count);
            total += count;
        }
        Ok(())
    }

    fn read_line_into(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let line_start = out.len();
        loop {
            let chunk = self.peek()?;
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    out.extend_from_slice(&chunk[..pos]);
                    if out.len() > line_start && out.last() == Some(&b'\r') {
                        out.pop();
                    }
                    self.skip(pos + 1);
                    return Ok(());
                }
                None => {
                    let count = chunk.len();
                    out.extend_from_slice(chunk);
                    self.skip(count);
                }
            }
        }
    }

    fn read_all_into(&mut self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            match self.peek() {
                Ok(chunk) => {
                    let count = chunk.len();
                    out.extend_from_slice(chunk);
                    self.skip(count);
                }
                Err(SocketError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<C: IoChannel> Pollable for BufferedStream<C> {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.channel.descriptor()
    }

    fn is_dirty(&self) -> bool {
        BufferedStream::is_dirty(self)
    }
}

/// Resolves 1-based inclusive indices into a byte range, `None` when empty.
pub fn send_range(len: usize, start: i64, end: i64) -> Option<Range<usize>> {
    let len = len as i64;
    let start = if start < 0 { len + start + 1 } else { start }.max(1);
    let end = if end < 0 { len + end + 1 } else { end }.min(len);
    if start > end {
        None
    } else {
        Some((start - 1) as usize..end as usize)
    }
}
