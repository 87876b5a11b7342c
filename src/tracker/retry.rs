//! # Retry policy for errored sources.
//!
//! [`RetryPolicy`] controls how re-open delays grow while a source stays in
//! error. The first failure schedules a retry after [`RetryPolicy::first`];
//! each further failure multiplies the previous delay by
//! [`RetryPolicy::factor`], capped at [`RetryPolicy::cap`]. A successful
//! open resets the progression.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use wavecap::tracker::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! let first = policy.next(None);
//! assert_eq!(first, Duration::from_secs(10));
//! assert_eq!(policy.next(Some(first)), Duration::from_secs(20));
//! // Growth never exceeds the cap.
//! assert_eq!(policy.next(Some(Duration::from_secs(400))), policy.cap);
//! ```

use std::time::Duration;

/// Exponential re-open backoff, capped.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Maximum delay between attempts.
    pub cap: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for RetryPolicy {
    /// 10 seconds doubling up to a 5 minute cap.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(10),
            cap: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Computes the next delay from the previous one.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let unclamped = match prev {
            None => self.first,
            Some(d) => {
                let grown = d.as_secs_f64() * self.factor;
                if grown.is_finite() {
                    d.mul_f64(self.factor)
                } else {
                    self.cap
                }
            }
        };
        unclamped.min(self.cap)
    }
}
