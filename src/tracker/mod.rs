//! # Source tracker: supervision, retry, iteration.
//!
//! - [`SourceTracker`] — owns the active source set and the coordinators.
//! - [`RetryPolicy`] — exponential re-open backoff for errored sources.
//! - [`SourceWorker`] — visitor for [`SourceTracker::iterate`].

mod retry;
#[allow(clippy::module_inception)]
mod tracker;
mod worker;

pub use retry::RetryPolicy;
pub use tracker::{
    SourceRef, SourceTracker, SOURCE_CLOSED, SOURCE_ERROR, SOURCE_MESSAGE, SOURCE_OPENED,
};
pub use worker::SourceWorker;
