//! Bounded polling for eventually-consistent node and cluster state

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::HarnessError;

/// Retries a probe on a fixed interval until it succeeds or `timeout` elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Wait until `probe` returns `Ok`, handing back its value.
    ///
    /// Probe errors are expected while the state converges; the last one is
    /// carried in the timeout error.
    pub async fn until_ok<T, E, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let start = Instant::now();
        let mut last_error: Option<String>;

        loop {
            match probe().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("still waiting for {}: {}", what, e);
                    last_error = Some(e.to_string());
                }
            }

            if !self.pause(start).await {
                return Err(HarnessError::Timeout {
                    what: what.to_string(),
                    timeout: self.timeout,
                    last_error,
                });
            }
        }
    }

    /// Wait until `probe` returns `true`.
    pub async fn until<F, Fut>(&self, what: &str, mut probe: F) -> Result<(), HarnessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();

        loop {
            if probe().await {
                return Ok(());
            }
            debug!("still waiting for {}", what);

            if !self.pause(start).await {
                return Err(HarnessError::Timeout {
                    what: what.to_string(),
                    timeout: self.timeout,
                    last_error: None,
                });
            }
        }
    }

    // sleeps until the next attempt; false once the deadline has passed
    async fn pause(&self, start: Instant) -> bool {
        let elapsed = start.elapsed();
        if elapsed >= self.timeout {
            return false;
        }
        sleep(self.interval.min(self.timeout - elapsed)).await;
        true
    }
}
