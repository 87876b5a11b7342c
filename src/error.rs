//! # Error types used by the capture runtime.
//!
//! Everything that can go wrong while probing, opening, or supervising a
//! capture source is expressed as a [`CaptureError`]. Coordinators never
//! panic; they resolve with one of these variants, and the tracker records
//! the variant on the affected source before scheduling a retry.
//!
//! The helper methods follow a common shape:
//! - `as_label()` returns a short stable snake_case tag for logs and the
//!   status surface;
//! - `is_retryable()` tells the tracker whether an errored source should be
//!   re-opened on the retry timer.

use thiserror::Error;

/// Errors produced while probing, opening, or running capture sources.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The source definition string could not be parsed.
    #[error("invalid source definition '{definition}': {reason}")]
    InvalidDefinition {
        /// The offending definition string.
        definition: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No registered driver accepted the definition.
    #[error("no driver accepted source '{definition}'")]
    NoDriver {
        /// The definition that went unclaimed.
        definition: String,
    },

    /// Probing did not resolve before the deadline.
    #[error("probe for '{definition}' timed out")]
    ProbeTimeout {
        /// The definition being probed.
        definition: String,
    },

    /// The probe was cancelled before it resolved.
    #[error("probe for '{definition}' was cancelled")]
    ProbeCancelled {
        /// The definition being probed.
        definition: String,
    },

    /// A capture child process could not be started.
    #[error("failed to spawn capture child for driver '{driver}': {reason}")]
    SpawnFailed {
        /// Driver whose child failed to launch.
        driver: String,
        /// Spawn failure detail.
        reason: String,
    },

    /// A transport delivered bytes that do not form a valid frame.
    #[error("capture protocol violation: {reason}")]
    ProtocolViolation {
        /// What the codec rejected.
        reason: String,
    },

    /// The transport to a capture child or remote closed unexpectedly.
    #[error("capture transport closed: {reason}")]
    TransportClosed {
        /// Close detail, if any.
        reason: String,
    },

    /// The driver answered the open handshake with a refusal.
    #[error("source rejected by driver: {message}")]
    SourceRejected {
        /// The driver's refusal message.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {reason}")]
    Internal {
        /// Invariant detail.
        reason: String,
    },
}

impl CaptureError {
    /// Returns a short stable label (snake_case) for logs and status output.
    pub fn as_label(&self) -> &'static str {
        match self {
            CaptureError::InvalidDefinition { .. } => "invalid_definition",
            CaptureError::NoDriver { .. } => "no_driver",
            CaptureError::ProbeTimeout { .. } => "probe_timeout",
            CaptureError::ProbeCancelled { .. } => "probe_cancelled",
            CaptureError::SpawnFailed { .. } => "spawn_failed",
            CaptureError::ProtocolViolation { .. } => "protocol_violation",
            CaptureError::TransportClosed { .. } => "transport_closed",
            CaptureError::SourceRejected { .. } => "source_rejected",
            CaptureError::Internal { .. } => "internal",
        }
    }

    /// Whether a source that failed with this error should be retried.
    ///
    /// Transport, spawn, and rejection failures are transient from the
    /// tracker's point of view (the interface may appear later, the driver
    /// binary may be reinstalled). Definition and protocol errors are not:
    /// retrying the same bytes cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::SpawnFailed { .. }
                | CaptureError::TransportClosed { .. }
                | CaptureError::SourceRejected { .. }
                | CaptureError::ProbeTimeout { .. }
        )
    }

    /// Shorthand for a protocol violation.
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        CaptureError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a transport close.
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        CaptureError::TransportClosed {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::TransportClosed {
            reason: e.to_string(),
        }
    }
}
