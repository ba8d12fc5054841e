//! Exponential backoff driven by a [`RetryPolicy`]

use crate::config::RetryPolicy;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Max retry attempts reached ({0})")]
pub struct RetriesExhausted(pub u32);

/// Backoff state for one sequence of retries
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: u32,
    current_delay: Duration,
    attempt: u32,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self)
    }
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            multiplier: policy.multiplier,
            max_retries: policy.max_retries.max(0) as u32,
            current_delay: policy.initial_delay.min(policy.max_delay),
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        self.attempt += 1;

        let delay = self.current_delay;
        self.current_delay =
            Duration::try_from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier)
                .unwrap_or(self.max_delay)
                .min(self.max_delay);
        Some(delay)
    }

    /// Wait before the next retry
    pub async fn wait(&mut self) -> Result<(), RetriesExhausted> {
        let delay = self
            .next_delay()
            .ok_or(RetriesExhausted(self.max_retries))?;

        debug!(
            "Waiting {}ms before retry attempt {}/{}",
            delay.as_millis(),
            self.attempt,
            self.max_retries
        );
        sleep(delay).await;
        Ok(())
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
        self.attempt = 0;
    }

    /// Retries consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}
