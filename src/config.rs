//! # Global runtime configuration.
//!
//! [`Config`] defines the tracker's behavior: probe/list/open deadlines,
//! the error-retry cadence and its backoff policy, and the event bus
//! capacity.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use wavecap::Config;
//!
//! let mut cfg = Config::default();
//! cfg.probe_deadline = Duration::from_secs(5);
//! cfg.retry_interval = Duration::from_secs(10);
//!
//! assert_eq!(cfg.probe_deadline, Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::tracker::RetryPolicy;

/// Global configuration for the tracker and event bus.
///
/// Controls coordinator deadlines, the error-retry scan cadence and backoff,
/// event bus capacity, and whether lifecycle events are mirrored to the log.
#[derive(Clone, Debug)]
pub struct Config {
    /// Deadline for a probe race to resolve a driver.
    pub probe_deadline: Duration,
    /// Deadline for an interface-list aggregation.
    pub list_deadline: Duration,
    /// Deadline for the `OPEN`/`OPEN_RESP` handshake on a single source.
    pub open_deadline: Duration,
    /// How often the tracker scans errored sources for retry.
    pub retry_interval: Duration,
    /// Backoff applied to repeated re-open failures of the same source.
    pub retry_backoff: RetryPolicy,
    /// Capacity of the event bus dispatch queue.
    pub bus_capacity: usize,
    /// Mirror bus events to the log via [`LogListener`](crate::events::LogListener).
    pub log_events: bool,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `probe_deadline = 5s`
    /// - `list_deadline = 5s`
    /// - `open_deadline = 10s`
    /// - `retry_interval = 10s`
    /// - `retry_backoff = RetryPolicy::default()` (10s doubling, 5 min cap)
    /// - `bus_capacity = 1024`
    /// - `log_events = false`
    fn default() -> Self {
        Self {
            probe_deadline: Duration::from_secs(5),
            list_deadline: Duration::from_secs(5),
            open_deadline: Duration::from_secs(10),
            retry_interval: Duration::from_secs(10),
            retry_backoff: RetryPolicy::default(),
            bus_capacity: 1024,
            log_events: false,
        }
    }
}
