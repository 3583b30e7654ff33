//! Retry pacing shared by the stream decoder and the transaction runner.
use std::{
    thread,
    time::{Duration, Instant},
};

use log::debug;
use rand::Rng;

use crate::error::{Error, Result};

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The instant `timeout` from now, clamped to a century ahead.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Exponential backoff with jitter.
///
/// The delay before retry `n` (starting at 1) is `initial * 2^(n-1)`, capped at
/// `max`, plus up to half of that again at random.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let base = self
            .initial
            .saturating_mul(1u32 << exponent)
            .min(self.max);
        let spread = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=spread);
        base.saturating_add(Duration::from_millis(jitter))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_secs(32),
        }
    }
}

/// Counts retries of one logical operation and enforces its deadline.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    backoff: Backoff,
    deadline: Option<Instant>,
    retries: u32,
}

impl RetryBudget {
    pub fn new(backoff: Backoff, deadline: Option<Instant>) -> Self {
        Self {
            backoff,
            deadline,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Sleeps before the next try, honouring the server's retry hint when `err`
    /// carries one. Gives up with [`Error::DeadlineExceeded`] when the wait would
    /// end past the deadline.
    pub fn pause(&mut self, err: Error) -> Result<()> {
        self.retries += 1;
        let delay = err
            .retry_delay()
            .unwrap_or_else(|| self.backoff.delay(self.retries));

        if let Some(deadline) = self.deadline {
            let wake = Instant::now().checked_add(delay);
            if wake.is_none_or(|wake| wake >= deadline) {
                return Err(Error::DeadlineExceeded {
                    attempts: self.retries,
                    last: Some(Box::new(err)),
                });
            }
        }

        debug!("retry {} in {delay:?} after: {err}", self.retries);
        thread::sleep(delay);
        Ok(())
    }
}
