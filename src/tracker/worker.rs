//! # Source iteration workers.
//!
//! [`SourceWorker`] is the visitor applied by
//! [`SourceTracker::iterate`](super::SourceTracker::iterate): the tracker
//! holds its lock for the whole pass, so a worker sees a consistent view of
//! the active set without racing concurrent opens and removals.

use crate::source::SourceStatus;

/// Visitor over the active source set.
pub trait SourceWorker {
    /// Called once per active source.
    fn handle_source(&mut self, source: &SourceStatus);

    /// Called after the last source, still under the tracker lock.
    fn finalize(&mut self) {}
}
