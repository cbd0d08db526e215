//! Error backoff handling for the refresh loop

use std::time::Duration;

/// Configuration for how to manage backoff when a refresh fails
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u64,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 1 second with a multiplier of 2,
    /// capped at 60 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// The first failure backs off by `initial_error_delay`; each subsequent
    /// consecutive failure multiplies the delay by `multiplier`, capped at
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u64) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }
}

/// A stateful handler tracking backoff delay and consecutive failures
///
/// The consecutive-failure count drives the transition into the locked state
/// once the keeper's failure limit is reached.
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
    consecutive_failures: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
            consecutive_failures: 0,
        }
    }

    /// Reports a success, resetting the delay and failure count
    pub fn success(&mut self) {
        self.last_delay = None;
        self.consecutive_failures = 0;
    }

    /// Reports a failure and returns the delay before the next attempt
    pub fn error(&mut self) -> Duration {
        let new_delay = self
            .last_delay
            .map(|d| {
                Duration::from_millis(d.as_millis() as u64 * self.config.multiplier)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        self.consecutive_failures += 1;
        new_delay
    }

    /// The number of failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
