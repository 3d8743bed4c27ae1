use std::time::{Duration, Instant};

/// Deadline pair governing one externally visible operation.
///
/// `block` caps every low-level wait, `total` caps the whole operation measured
/// from the last [`TimeoutBudget::start`]. `None` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    start_time: Instant,
    block_limit: Option<Duration>,
    total_limit: Option<Duration>,
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl TimeoutBudget {
    pub fn new(block: Option<Duration>, total: Option<Duration>) -> Self {
        Self {
            start_time: Instant::now(),
            block_limit: block,
            total_limit: total,
        }
    }

    /// Marks the beginning of an operation.
    pub fn start(&mut self) {
        self.start_time = Instant::now();
    }

    pub fn set_limits(&mut self, block: Option<Duration>, total: Option<Duration>) {
        self.block_limit = block;
        self.total_limit = total;
    }

    /// Same as [`set_limits`](Self::set_limits) with fractional seconds;
    /// negative, non-finite or out-of-range values mean unbounded.
    pub fn set_limits_secs(&mut self, block: Option<f64>, total: Option<f64>) {
        self.set_limits(secs_to_limit(block), secs_to_limit(total));
    }

    pub fn limits(&self) -> (Option<Duration>, Option<Duration>) {
        (self.block_limit, self.total_limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time available to the next low-level call, `None` if unbounded.
    pub fn remaining_for_call(&self) -> Option<Duration> {
        self.remaining_after(self.elapsed())
    }

    /// Time left for the whole operation regardless of the block limit.
    pub fn total_remaining(&self) -> Option<Duration> {
        self.total_limit
            .map(|total| total.saturating_sub(self.elapsed()))
    }

    pub fn remaining_after(&self, elapsed: Duration) -> Option<Duration> {
        let total_left = self.total_limit.map(|t| t.saturating_sub(elapsed));
        match (self.block_limit, total_left) {
            (Some(block), Some(left)) => Some(block.min(left)),
            (Some(block), None) => Some(block),
            (None, left) => left,
        }
    }

    /// Remaining time in whole milliseconds, rounded up so a sub-millisecond
    /// remainder still yields a short wait rather than a busy poll.
    pub fn remaining_millis(&self) -> Option<u64> {
        self.remaining_for_call().map(|d| {
            let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            if Duration::from_millis(ms) < d {
                ms.saturating_add(1)
            } else {
                ms
            }
        })
    }
}

/// Seconds that are negative, NaN or too large for a `Duration` mean unbounded.
pub(crate) fn secs_to_limit(secs: Option<f64>) -> Option<Duration> {
    secs.and_then(|s| Duration::try_from_secs_f64(s).ok())
}
