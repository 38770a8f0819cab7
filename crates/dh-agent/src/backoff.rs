//! Exponential backoff and the shared retry policy
//!
//! Every network call the agent makes (registration, downloads, tunnel
//! reports) runs under [`RetryPolicy`]. The policy retries until the
//! operation succeeds or the caller's predicate classifies the error as
//! terminal.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use dh_core::config::BackoffConfig;

/// Exponential backoff that wraps around once it exceeds its cap
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Delay the sequence starts from and wraps back to
    initial: Duration,
    /// Largest delay handed out
    cap: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.cap)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            current: initial,
            initial,
            cap,
        }
    }

    /// Get the next delay and advance the backoff
    ///
    /// Doubles after every call; when the doubled value would exceed the
    /// cap, the sequence restarts at the initial delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        self.current = match self.current.checked_mul(2) {
            Some(next) if next <= self.cap => next,
            _ => self.initial,
        };

        delay
    }
}

/// Retry loop shared by every component that talks to the network
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Run `op` until it succeeds or fails with a terminal error
    ///
    /// Terminal errors are returned immediately without sleeping. Every
    /// other error is logged and retried after the next backoff delay.
    pub async fn run<T, E, F, Fut, P>(&self, what: &str, mut op: F, is_terminal: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = ExponentialBackoff::from_config(&self.config);
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_terminal(&e) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("{} failed: {}. Retry in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run `op` until it succeeds; no error is terminal
    pub async fn run_forever<T, E, F, Fut>(&self, what: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut backoff = ExponentialBackoff::from_config(&self.config);
        loop {
            match op().await {
                Ok(value) => return value,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("{} failed: {}. Retry in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
