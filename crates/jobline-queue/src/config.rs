//! Runtime configuration for a job queue

use std::env;
use std::time::Duration;

use crate::job::DEFAULT_MAX_RETRIES;

/// Poll loop and event settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on the sleep between poll cycles
    pub poll_interval: Duration,
    /// Retry budget used by [`crate::JobQueue::submit`]
    pub default_max_retries: u32,
    /// Buffered completion events per subscriber before it lags
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            default_max_retries: DEFAULT_MAX_RETRIES,
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Load from environment, falling back to defaults for unset or unparsable values
    ///
    /// Reads:
    /// - JOBLINE_POLL_INTERVAL_MS
    /// - JOBLINE_MAX_RETRIES
    /// - JOBLINE_EVENT_CAPACITY
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env::var("JOBLINE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            default_max_retries: env::var("JOBLINE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_retries),
            event_capacity: env::var("JOBLINE_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|capacity: &usize| *capacity > 0)
                .unwrap_or(defaults.event_capacity),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
