//! Bounded polling for platform state that converges asynchronously.
//!
//! App routes take a while to come up after a restart, and security group
//! changes only reach a container once it is restarted and its rules are
//! rewritten. Each wait is bounded by a [`PollCategory`] timeout taken from
//! the suite configuration.

use crate::config::Config;
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

/// Initial retry delay; doubled after every failed attempt.
const INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Categories of eventual consistency, each with its own bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCategory {
    /// App root answering with the expected greeting after start/restart.
    AppReadiness,

    /// Egress probe reflecting the currently bound security groups.
    EgressConvergence,

    /// Staging plus first start of a freshly pushed app.
    CfPush,
}

/// Resolved timeouts per category.
#[derive(Debug, Clone, Copy)]
pub struct PollTimeouts {
    pub default: Duration,
    pub push: Duration,
}

impl PollTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default: config.default_timeout,
            push: config.push_timeout,
        }
    }

    pub fn timeout(&self, category: PollCategory) -> Duration {
        match category {
            PollCategory::AppReadiness | PollCategory::EgressConvergence => self.default,
            PollCategory::CfPush => self.push,
        }
    }
}

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<T: Debug> {
    #[error(
        "Condition not met within {timeout:?} (category: {category:?}); \
         last observed: {last:?}, last error: {last_error:?}"
    )]
    TimedOut {
        category: PollCategory,
        timeout: Duration,
        /// Last value the probe produced, `None` if every attempt errored.
        last: Option<T>,
        /// Last probe error, if the final attempt errored.
        last_error: Option<String>,
    },
}

/// Poll `probe` until `accept` returns true for its value, or time runs out.
///
/// Probe errors count as failed attempts. Uses exponential backoff starting
/// at 500ms, capped at the remaining time.
pub async fn eventually<T, E, F, Fut, P>(
    category: PollCategory,
    timeout: Duration,
    mut probe: F,
    mut accept: P,
) -> Result<T, PollError<T>>
where
    T: Debug,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let mut delay = INITIAL_DELAY;
    let start = Instant::now();
    let mut last = None;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let last_error = match probe().await {
            Ok(value) if accept(&value) => {
                tracing::debug!(?category, attempts, "Condition met");
                return Ok(value);
            }
            Ok(value) => {
                last = Some(value);
                None
            }
            Err(e) => Some(e.to_string()),
        };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            tracing::warn!(?category, attempts, ?timeout, "Condition not met");
            return Err(PollError::TimedOut {
                category,
                timeout,
                last,
                last_error,
            });
        }

        sleep(delay).await;

        // Exponential backoff with 2x multiplier
        delay *= 2;

        // Cap delay at remaining time
        let remaining = timeout.saturating_sub(start.elapsed());
        if delay > remaining {
            delay = remaining;
        }
    }
}

/// Poll until `probe` returns exactly `expected`.
pub async fn eventually_equals<T, E, F, Fut>(
    category: PollCategory,
    timeout: Duration,
    probe: F,
    expected: T,
) -> Result<T, PollError<T>>
where
    T: Debug + PartialEq,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    eventually(category, timeout, probe, |value| *value == expected).await
}
