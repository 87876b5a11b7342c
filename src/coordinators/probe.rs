//! # Probe coordinator: which driver owns a definition?
//!
//! Given a source definition with no driver hint, the coordinator races
//! every registered driver and resolves the single winner within a bounded
//! deadline.
//!
//! ## Algorithm
//! ```text
//! run(drivers, deadline)
//!   ├─► native probes, registration order ── first accept wins immediately
//!   ├─► one IPC attempt per remaining driver:
//!   │       spawn child ─► PROBE{transaction} ─► await PROBE_RESP
//!   └─► race:
//!         first affirmative reply ─► winner; cancel losers, kill children
//!         every reply negative    ─► no_driver
//!         deadline elapses        ─► probe_timeout
//!         cancel()                ─► probe_cancelled
//! ```
//!
//! ## Rules
//! - Completion is delivered exactly once; replies arriving after
//!   resolution are discarded.
//! - `cancel()` is idempotent and safe concurrently with in-flight replies.
//! - When `run` returns, no child spawned by this coordinator is alive:
//!   every attempt task owns its child guard and the coordinator drains its
//!   `JoinSet` before resolving.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::drivers::DriverBuilder;
use crate::error::CaptureError;
use crate::proto::{frame_types, Frame, ProbeReply, ProbeRequest};
use crate::source::SourceDefinition;

use super::next_transaction;

/// Outcome of one probe attempt against one driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Awaiting a reply.
    Pending,
    /// The driver claimed the definition.
    Accepted,
    /// The driver declined.
    Rejected,
    /// Another attempt won, or the coordinator was cancelled.
    Cancelled,
    /// The deadline elapsed first.
    TimedOut,
}

/// Record of one attempt, kept for introspection.
#[derive(Clone, Debug)]
pub struct ProbeAttempt {
    /// Transaction id carried in the `PROBE` frame.
    pub transaction: u32,
    /// Driver under probe.
    pub driver: String,
    /// Current outcome.
    pub outcome: AttemptOutcome,
}

/// Races all applicable drivers for one definition; first accept wins.
pub struct ProbeCoordinator {
    definition: SourceDefinition,
    cancel: CancellationToken,
    attempts: Mutex<Vec<ProbeAttempt>>,
}

impl ProbeCoordinator {
    /// Coordinator for one definition.
    pub fn new(definition: SourceDefinition) -> Arc<Self> {
        Arc::new(Self {
            definition,
            cancel: CancellationToken::new(),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// The definition under probe.
    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    /// Snapshot of the attempt set.
    pub fn attempts(&self) -> Vec<ProbeAttempt> {
        self.attempts.lock().expect("attempt set poisoned").clone()
    }

    /// Cancels the probe. Idempotent; a concurrent in-flight reply either
    /// resolves first or is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves the winning driver.
    ///
    /// Called exactly once per coordinator; the returned future is the
    /// completion. Terminates every child this coordinator spawned before
    /// returning.
    pub async fn run(
        &self,
        drivers: Vec<Arc<DriverBuilder>>,
        deadline: Duration,
    ) -> Result<Arc<DriverBuilder>, CaptureError> {
        // Native probes first, in registration order; no children needed
        // when one of them claims the definition.
        let mut ipc_drivers = Vec::new();
        for driver in drivers {
            match driver.probe_native(&self.definition) {
                Some(true) => {
                    self.cancel.cancel();
                    return Ok(driver);
                }
                Some(false) => {}
                None => ipc_drivers.push(driver),
            }
        }
        if ipc_drivers.is_empty() {
            return Err(CaptureError::NoDriver {
                definition: self.definition.raw().to_string(),
            });
        }

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(usize, u32, bool)>();
        let mut attempts = JoinSet::new();
        for (index, driver) in ipc_drivers.iter().enumerate() {
            let transaction = next_transaction();
            self.attempts
                .lock()
                .expect("attempt set poisoned")
                .push(ProbeAttempt {
                    transaction,
                    driver: driver.name().to_string(),
                    outcome: AttemptOutcome::Pending,
                });

            let driver = Arc::clone(driver);
            let definition = self.definition.clone();
            let reply_tx = reply_tx.clone();
            let cancel = self.cancel.clone();
            attempts.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    verdict = ask_driver(&driver, &definition, transaction) => {
                        // Connect or protocol failures count as declines.
                        let _ = reply_tx.send((index, transaction, verdict.unwrap_or(false)));
                    }
                }
            });
        }
        drop(reply_tx);

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);
        let mut outstanding = ipc_drivers.len();

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break Err(CaptureError::ProbeCancelled {
                        definition: self.definition.raw().to_string(),
                    });
                }
                _ = &mut timer => {
                    break Err(CaptureError::ProbeTimeout {
                        definition: self.definition.raw().to_string(),
                    });
                }
                reply = reply_rx.recv() => match reply {
                    Some((index, transaction, true)) => {
                        self.mark(transaction, AttemptOutcome::Accepted);
                        break Ok(Arc::clone(&ipc_drivers[index]));
                    }
                    Some((_, transaction, false)) => {
                        self.mark(transaction, AttemptOutcome::Rejected);
                        outstanding -= 1;
                        if outstanding == 0 {
                            break Err(CaptureError::NoDriver {
                                definition: self.definition.raw().to_string(),
                            });
                        }
                    }
                    None => {
                        break Err(CaptureError::NoDriver {
                            definition: self.definition.raw().to_string(),
                        });
                    }
                },
            }
        };

        // Terminal: stop the losers and wait for their children to die.
        self.cancel.cancel();
        while attempts.join_next().await.is_some() {}
        let terminal = match &result {
            Err(CaptureError::ProbeTimeout { .. }) => AttemptOutcome::TimedOut,
            _ => AttemptOutcome::Cancelled,
        };
        self.mark_pending(terminal);

        result
    }

    fn mark(&self, transaction: u32, outcome: AttemptOutcome) {
        let mut attempts = self.attempts.lock().expect("attempt set poisoned");
        if let Some(attempt) = attempts.iter_mut().find(|a| a.transaction == transaction) {
            if attempt.outcome == AttemptOutcome::Pending {
                attempt.outcome = outcome;
            }
        }
    }

    fn mark_pending(&self, outcome: AttemptOutcome) {
        let mut attempts = self.attempts.lock().expect("attempt set poisoned");
        for attempt in attempts.iter_mut() {
            if attempt.outcome == AttemptOutcome::Pending {
                attempt.outcome = outcome;
            }
        }
    }
}

/// One IPC attempt: spawn the driver child, send `PROBE`, await the
/// matching `PROBE_RESP`. The child dies with this future: the link (and
/// its kill-on-drop guard) lives inside it.
async fn ask_driver(
    driver: &DriverBuilder,
    definition: &SourceDefinition,
    transaction: u32,
) -> Result<bool, CaptureError> {
    let mut link = driver.connect(definition).await?;
    link.transport
        .send(Frame::compose(&ProbeRequest {
            transaction,
            definition: definition.raw().to_string(),
        })?)
        .await?;

    loop {
        let frame = link.transport.recv().await?;
        if frame.frame_type == frame_types::PROBE_RESP {
            let reply: ProbeReply = frame.payload()?;
            if reply.transaction == transaction {
                return Ok(reply.accepted);
            }
        }
        // Anything else (HELLO, MESSAGE, a stale reply) is not ours.
    }
}
