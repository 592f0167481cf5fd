//! Bounded retry with capped, jittered backoff.
//!
//! Retries run on the calling thread: between attempts the thread sleeps for
//! the current backoff. The last error is returned as-is.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff in milliseconds (one time unit).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff never exceeds `initial_backoff_ms * max_backoff_factor`.
    #[serde(default = "default_max_backoff_factor")]
    pub max_backoff_factor: u32,
    /// Growth factor applied after each attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Random spread as a fraction of the backoff (0 disables jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_factor() -> u32 {
    5
}

fn default_multiplier() -> f64 {
    1.6
}

fn default_jitter() -> f64 {
    0.4
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_factor: default_max_backoff_factor(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial backoff.
    #[must_use]
    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Sets the cap factor.
    #[must_use]
    pub fn with_max_backoff_factor(mut self, factor: u32) -> Self {
        self.max_backoff_factor = factor;
        self
    }

    /// Sets the jitter ratio.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Creates a backoff sequence for one retried operation.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self)
    }
}

/// Stateful backoff sequence.
///
/// The first delay is the initial backoff; each later one is the previous
/// delay times the multiplier, capped. Jitter is applied on top and carried
/// into the next step.
#[derive(Debug, Clone)]
pub struct Backoff {
    first: bool,
    current_ms: f64,
    initial_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    /// Creates a backoff from a retry config.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        let initial_ms = config.initial_backoff_ms as f64;
        Self {
            first: true,
            current_ms: 0.0,
            initial_ms,
            max_ms: initial_ms * f64::from(config.max_backoff_factor),
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Returns the next delay.
    pub fn next_delay(&mut self) -> Duration {
        if self.first {
            self.first = false;
            self.current_ms = self.initial_ms.min(self.max_ms);
        } else {
            self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms);
        }
        if self.jitter > 0.0 && self.current_ms > 0.0 {
            let spread = self.jitter * self.current_ms;
            self.current_ms += rand::thread_rng().gen_range(-spread..=spread);
        }
        Duration::try_from_secs_f64(self.current_ms.max(0.0) / 1000.0).unwrap_or(Duration::MAX)
    }
}

/// Runs `operation` until it succeeds or the attempt budget is spent.
///
/// `operation` receives the 1-based attempt number. Any `Err` is retried.
/// The error of the final attempt is returned unchanged.
pub fn retry_blocking<T, E, F>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.backoff();
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                tracing::debug!(
                    label = %label,
                    attempts = attempt,
                    error = %e,
                    "Giving up after final attempt"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::info!(
                    label = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying in {:.1} seconds.",
                    delay.as_secs_f64()
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
