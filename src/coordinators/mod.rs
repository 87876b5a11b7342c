//! # Coordinators: bounded multi-driver negotiations.
//!
//! - [`ProbeCoordinator`] — race all applicable drivers for a definition;
//!   first accept wins.
//! - [`ListCoordinator`] — aggregate interface lists from every driver.
//!
//! Both resolve within a fixed deadline, are externally cancellable, and
//! guarantee that no child process they spawned outlives them.

mod list;
mod probe;

use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

pub use list::ListCoordinator;
pub use probe::{AttemptOutcome, ProbeAttempt, ProbeCoordinator};

/// Transaction counter shared by all coordinators; every outbound request
/// carries a process-unique id.
static NEXT_TRANSACTION: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_transaction() -> u32 {
    NEXT_TRANSACTION.fetch_add(1, AtomicOrdering::Relaxed)
}
