//! # List coordinator: aggregate interface enumeration.
//!
//! The same shape as the probe coordinator, but results aggregate instead
//! of racing: every driver is asked, native enumerators in-process and the
//! rest over child IPC, and the union of successful replies is returned
//! when the last driver answers or the deadline passes. A driver that times
//! out, fails to spawn, or answers garbage contributes no entries and never
//! fails the overall list.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::drivers::DriverBuilder;
use crate::error::CaptureError;
use crate::proto::{frame_types, Frame, InterfaceEntry, ListReply, ListRequest};
use crate::source::SourceDefinition;

use super::next_transaction;

/// Aggregates interface lists from all drivers under a bounded deadline.
pub struct ListCoordinator {
    cancel: CancellationToken,
}

impl ListCoordinator {
    /// New coordinator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
        })
    }

    /// Cancels the aggregation; already-collected entries are still
    /// returned by `run`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Collects the union of interface lists.
    ///
    /// Terminates every child this coordinator spawned before returning.
    pub async fn run(
        &self,
        drivers: Vec<Arc<DriverBuilder>>,
        deadline: Duration,
    ) -> Vec<InterfaceEntry> {
        let mut entries = Vec::new();

        let mut attempts = JoinSet::new();
        for driver in drivers {
            if let Some(mut native) = driver.list_native() {
                for entry in &mut native {
                    entry.driver = driver.name().to_string();
                }
                entries.extend(native);
                continue;
            }

            let cancel = self.cancel.clone();
            attempts.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Vec::new(),
                    listed = ask_driver(&driver) => match listed {
                        Ok(mut listed) => {
                            for entry in &mut listed {
                                if entry.driver.is_empty() {
                                    entry.driver = driver.name().to_string();
                                }
                            }
                            listed
                        }
                        Err(err) => {
                            tracing::debug!(
                                driver = driver.name(),
                                error = err.as_label(),
                                "interface list attempt failed"
                            );
                            Vec::new()
                        }
                    },
                }
            });
        }

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = &mut timer => break,
                joined = attempts.join_next() => match joined {
                    Some(Ok(listed)) => entries.extend(listed),
                    Some(Err(_)) => {}
                    None => break,
                },
            }
        }

        // Terminal: stop stragglers and wait for their children to die.
        self.cancel.cancel();
        while attempts.join_next().await.is_some() {}

        entries
    }
}

async fn ask_driver(driver: &DriverBuilder) -> Result<Vec<InterfaceEntry>, CaptureError> {
    // The list dialogue needs no real interface; the child enumerates
    // whatever hardware it can see.
    let definition: SourceDefinition = "list"
        .parse()
        .map_err(|_| CaptureError::Internal {
            reason: "list placeholder definition failed to parse".into(),
        })?;
    let transaction = next_transaction();

    let mut link = driver.connect(&definition).await?;
    link.transport
        .send(Frame::compose(&ListRequest { transaction })?)
        .await?;

    loop {
        let frame = link.transport.recv().await?;
        if frame.frame_type == frame_types::LIST_RESP {
            let reply: ListReply = frame.payload()?;
            if reply.transaction == transaction {
                return Ok(reply.interfaces);
            }
        }
    }
}
