//! Retry pacing for the eventually consistent cloud API.
//!
//! Two shapes of waiting happen against the cloud: short retries of
//! failed transport calls, and long polls for a volume to reach a
//! lifecycle state. Both live here so the tuning is in one place.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::{sleep, Instant};

/// How many times a transport failure is retried before giving up.
pub(crate) const RETRY_LIMIT: u32 = 3;

/// First retry interval; doubles on every subsequent attempt.
pub(crate) const BASE_INTERVAL: Duration = Duration::from_millis(500);

/// Longest pause between two polls of a long state wait.
const POLL_CAP: Duration = Duration::from_secs(8);

/// Jittered exponential backoff. Each delay is sampled between two thirds
/// of the current interval and the full interval, which keeps a burst of
/// retrying clients from falling into lockstep against a rate-limited
/// API.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    interval: Duration,
    attempt: u32,
    limit: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(BASE_INTERVAL, RETRY_LIMIT)
    }
}

impl Backoff {
    pub(crate) fn new(interval: Duration, limit: u32) -> Backoff {
        Backoff {
            interval,
            attempt: 0,
            limit,
        }
    }

    /// The next delay to sleep for, or None once the retry budget is
    /// spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.limit {
            return None;
        }
        let upper = self.interval * (1u32 << self.attempt);
        self.attempt += 1;

        let upper_ns = upper.as_nanos() as u64;
        let lower_ns = upper_ns * 2 / 3;
        let delay = rand::thread_rng().gen_range(lower_ns ..= upper_ns);
        Some(Duration::from_nanos(delay))
    }
}

/// Poll `probe` until it yields a value or `deadline` passes. The poll
/// interval starts at `interval` and doubles up to a cap so long waits do
/// not hammer the cloud API. Returns Ok(None) on timeout; errors from the
/// probe are surfaced immediately.
pub(crate) async fn wait_until<T, E, F, Fut>(
    deadline: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut pause = interval;

    loop {
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        if started.elapsed() + pause > deadline {
            return Ok(None);
        }
        sleep(pause).await;
        pause = std::cmp::min(pause * 2, POLL_CAP);
    }
}
