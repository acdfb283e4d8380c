use std::time::Duration;

use crate::retry::RetryBackoff;

const DEFAULT_EXECUTION_RATE: usize = 10;

/// Bus-wide configuration, supplied by the mail server's startup sequence.
#[derive(Clone, Copy, Debug)]
pub struct BusConfig {
    /// Retry policy applied to failing group deliveries and asynchronous
    /// local listeners.
    pub retry: RetryBackoff,
    /// Ceiling on simultaneously unacknowledged deliveries per consumer.
    pub execution_rate: usize,
    /// Retry policy for declaring a group's queue at registration time.
    /// Exhausting it is fatal for that registration.
    pub startup: RetryBackoff,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            retry: RetryBackoff::default(),
            execution_rate: DEFAULT_EXECUTION_RATE,
            startup: RetryBackoff::new(3, Duration::from_millis(100), 0.5),
        }
    }
}

impl BusConfig {
    pub fn with_retry(mut self, retry: RetryBackoff) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_execution_rate(mut self, rate: usize) -> Self {
        self.execution_rate = rate.max(1);
        self
    }

    pub fn with_startup(mut self, startup: RetryBackoff) -> Self {
        self.startup = startup;
        self
    }
}
