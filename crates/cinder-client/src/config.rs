//! Client configuration.
//!
//! Everything has a default; [`ClientConfig::validate`] rejects values the
//! engine cannot run with. Loading configuration from files is left to the
//! embedding application, but [`parse_duration`] accepts the usual
//! human-readable forms so string settings are easy to wire through.

use std::time::Duration;

use crate::error::ClientError;
use crate::policy::RetryPolicy;
use crate::routing::Endpoint;

/// Settings for a [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where requests go when their slot has no known owner, and where
    /// the subscriber connection is opened.
    pub default_endpoint: Endpoint,
    /// Upper bound for opening a transport.
    pub connect_timeout: Duration,
    /// Per-attempt reply deadline. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Requests a single connection may hold in its queue before new
    /// submissions wait for room.
    pub max_in_flight: usize,
    /// Initial capacity of each connection's read buffer.
    pub read_buffer_capacity: usize,
    /// Messages buffered per subscription before a slow consumer starts
    /// missing them.
    pub subscription_capacity: usize,
    /// How long `shutdown` waits for queued requests to complete.
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(default_endpoint: Endpoint) -> Self {
        Self {
            default_endpoint,
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            max_in_flight: 4096,
            read_buffer_capacity: 16 * 1024,
            subscription_capacity: 256,
            drain_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ClientError> {
        let invalid = |msg: &str| Err(ClientError::InvalidConfig(msg.into()));

        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be greater than zero");
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("request_timeout must be greater than zero");
        }
        if self.max_in_flight == 0 {
            return invalid("max_in_flight must be at least 1");
        }
        // tokio semaphores cap their permit count
        if self.max_in_flight > tokio::sync::Semaphore::MAX_PERMITS {
            return invalid("max_in_flight is too large");
        }
        if self.read_buffer_capacity == 0 {
            return invalid("read_buffer_capacity must be at least 1");
        }
        if self.subscription_capacity == 0 {
            return invalid("subscription_capacity must be at least 1");
        }
        if self.retry.backoff_base > self.retry.backoff_max {
            return invalid("retry backoff_base exceeds backoff_max");
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Endpoint::new("127.0.0.1", 6379))
    }
}

/// Parses a human-readable duration like "250ms", "5s", "2m" or "1h".
///
/// A bare number is taken as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let lower = input.to_ascii_lowercase();
    let (num_str, unit_ms) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (lower.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;

    num.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}
