//! Retry policy for control-plane requests.
//!
//! Only failures on the allow-lists below are retried. Everything else,
//! including domain-level failures, surfaces on the first attempt.

use std::time::Duration;

use async_trait::async_trait;

pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 2;

/// HTTP status codes worth another attempt.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 409, 500, 502, 503, 504];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub retry_count: u32,
    /// First wait, and the growth factor applied after every retry.
    pub interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            retry_count: 1,
            interval_secs: 0,
        }
    }

    /// The sequence of waits between attempts: `w0 = interval`,
    /// `w(n+1) = w(n) * interval + interval`.
    pub fn delays(&self) -> Delays {
        Delays {
            next_secs: self.interval_secs,
            factor: self.interval_secs,
            remaining: self.retry_count.saturating_sub(1),
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUS_CODES.contains(&status)
    }
}

pub struct Delays {
    next_secs: u64,
    factor: u64,
    remaining: u32,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next_secs;
        self.next_secs = current
            .saturating_mul(self.factor)
            .saturating_add(self.factor);
        Some(Duration::from_secs(current))
    }
}

/// Injected wait between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
