//! # SourceTracker: supervision of active capture sources.
//!
//! The tracker owns every active source, its transport, and its error
//! state. Callers submit `open`/`close`/`list` requests; the tracker either
//! dispatches directly (known driver) or runs a probe race, instantiates
//! the source, and supervises it until removal.
//!
//! ## Architecture
//! ```text
//! open_source(definition)
//!     │
//!     ├─► driver hint / type= option ──► registry lookup
//!     ├─► otherwise ──► ProbeCoordinator::run()  (first accept wins)
//!     │
//!     └─► instantiate: allocate runtime id, insert entry
//!           │            (the entry stays even if the open then fails)
//!           ├─► connect ─► OPEN ─► OPEN_RESP
//!           ├─► ok  ─► Running, spawn frame pump, publish SOURCE_OPENED
//!           └─► err ─► Error, schedule retry,   publish SOURCE_ERROR
//!
//! frame pump (one task per running source)
//!     ├─► DATA / unknown ─► PacketSink
//!     ├─► MESSAGE ─► bus (SOURCE_MESSAGE)
//!     └─► ERROR / transport failure ─► feedback channel ─► Error state
//!
//! control loop
//!     ├─► pump feedback ─► fail_source()
//!     └─► retry ticker  ─► re-open errored sources past their due time
//! ```
//!
//! ## Rules
//! - Runtime ids increase monotonically and are never reused.
//! - UUIDs are unique among non-closed sources.
//! - A source in error keeps its entry, a finite retry-due time, and its
//!   definition; the retry backs off exponentially up to the policy cap.
//! - Transports talk back to the tracker through the feedback channel,
//!   never through direct references.
//! - Every state transition publishes `SOURCE_OPENED` / `SOURCE_ERROR` /
//!   `SOURCE_CLOSED` with the runtime id, UUID, and a message.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::coordinators::{next_transaction, ListCoordinator, ProbeCoordinator};
use crate::drivers::{DriverBuilder, DriverRegistry};
use crate::error::CaptureError;
use crate::events::{EventBus, LogListener};
use crate::proto::{
    frame_types, ChannelSet, ErrorReport, Frame, Hello, InterfaceEntry, OpenReply, OpenRequest,
    TextMessage,
};
use crate::source::{
    ChildGuard, FrameReader, FrameWriter, PacketSink, SourceDefinition, SourceEvent, SourceId,
    SourceLink, SourceState, SourceStatus,
};

use super::worker::SourceWorker;

/// Bus channel: a source reached `running`.
pub const SOURCE_OPENED: &str = "SOURCE_OPENED";
/// Bus channel: a source entered `error`.
pub const SOURCE_ERROR: &str = "SOURCE_ERROR";
/// Bus channel: a source was removed.
pub const SOURCE_CLOSED: &str = "SOURCE_CLOSED";
/// Bus channel: a driver emitted a human-readable message.
pub const SOURCE_MESSAGE: &str = "SOURCE_MESSAGE";

/// Addresses one source by runtime id or UUID.
#[derive(Clone, Copy, Debug)]
pub enum SourceRef {
    /// By runtime id.
    Id(SourceId),
    /// By UUID.
    Uuid(Uuid),
}

impl From<SourceId> for SourceRef {
    fn from(id: SourceId) -> Self {
        SourceRef::Id(id)
    }
}

impl From<Uuid> for SourceRef {
    fn from(uuid: Uuid) -> Self {
        SourceRef::Uuid(uuid)
    }
}

/// Pump-to-tracker feedback.
enum Feedback {
    /// A running source's transport failed or its driver reported an error.
    Errored { id: SourceId, error: CaptureError },
}

struct Entry {
    status: SourceStatus,
    definition: SourceDefinition,
    driver: Arc<DriverBuilder>,
    /// Send half of the transport while running; used for runtime commands.
    writer: Option<Arc<Mutex<FrameWriter>>>,
    /// Cancels the frame pump (and thereby the child) on removal.
    pump_cancel: Option<CancellationToken>,
    /// Previous retry delay, for backoff growth.
    prev_delay: Option<Duration>,
    /// When the next re-open attempt is due.
    retry_due: Option<Instant>,
}

impl Entry {
    fn snapshot(&self, now: Instant) -> SourceStatus {
        let mut status = self.status.clone();
        status.retry_in = match (self.status.state, self.retry_due) {
            (SourceState::Error, Some(due)) => Some(due.saturating_duration_since(now).as_secs()),
            _ => None,
        };
        status
    }
}

/// Owns and supervises the active source set.
pub struct SourceTracker {
    cfg: Config,
    bus: Arc<EventBus>,
    registry: Arc<DriverRegistry>,
    sink: Arc<dyn PacketSink>,
    state: Mutex<BTreeMap<SourceId, Entry>>,
    next_id: AtomicU64,
    feedback: mpsc::UnboundedSender<Feedback>,
    /// Outstanding probe coordinators, cancelled on shutdown.
    probes: StdMutex<Vec<Arc<ProbeCoordinator>>>,
    cancel: CancellationToken,
}

impl SourceTracker {
    /// Creates the tracker and spawns its control loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        cfg: Config,
        bus: Arc<EventBus>,
        registry: Arc<DriverRegistry>,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        if cfg.log_events {
            LogListener::attach(&bus);
        }

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            cfg,
            bus,
            registry,
            sink,
            state: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            feedback: feedback_tx,
            probes: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&tracker).control_loop(feedback_rx));
        tracker
    }

    /// Opens a source from a definition string.
    ///
    /// An explicit `driver` hint (or a `type=` option in the definition)
    /// skips probing; otherwise every registered driver is raced. On a
    /// successful probe the source is instantiated and keeps its entry in
    /// the active set **even if the open handshake then fails** — the
    /// entry moves to `error` and the retry timer keeps working on it.
    pub async fn open_source(
        &self,
        definition: &str,
        driver: Option<&str>,
    ) -> Result<SourceId, CaptureError> {
        let definition: SourceDefinition = definition.parse()?;

        let hint = driver
            .map(str::to_string)
            .or_else(|| definition.driver_hint().map(str::to_string));
        let driver = match hint {
            Some(name) => self.registry.get(&name).ok_or_else(|| CaptureError::NoDriver {
                definition: definition.raw().to_string(),
            })?,
            None => self.probe_driver(&definition).await?,
        };

        let id = self.new_entry(&driver, &definition).await;
        match self.connect_and_open(id).await {
            Ok(()) => Ok(id),
            Err(err) => {
                self.fail_source(id, &err).await;
                Err(err)
            }
        }
    }

    /// Accepts a remote capture connection.
    ///
    /// The remote must announce itself with a `HELLO` frame naming a
    /// registered driver and a definition; the tracker then drives the
    /// standard open handshake over the same stream.
    pub async fn on_tcp_connection(
        &self,
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
    ) -> Result<SourceId, CaptureError> {
        let (read, write) = tokio::io::split(stream);
        let mut link = SourceLink::remote(read, write);

        let hello: Hello = timeout(self.cfg.open_deadline, link.transport.recv())
            .await
            .map_err(|_| CaptureError::protocol("remote sent no HELLO before the deadline"))??
            .payload()?;

        let driver = self.registry.get(&hello.driver).ok_or_else(|| {
            CaptureError::protocol(format!("remote announced unknown driver '{}'", hello.driver))
        })?;
        let definition: SourceDefinition = hello
            .definition
            .as_deref()
            .ok_or_else(|| CaptureError::protocol("remote HELLO carried no definition"))?
            .parse()?;

        let id = self.new_entry(&driver, &definition).await;
        let reply = match self.handshake(&mut link, &definition).await {
            Ok(reply) => reply,
            Err(err) => {
                self.fail_source(id, &err).await;
                return Err(err);
            }
        };
        match self.adopt(id, link, reply).await {
            Ok(()) => Ok(id),
            Err(err) => {
                self.fail_source(id, &err).await;
                Err(err)
            }
        }
    }

    /// Closes and removes a source. Returns whether anything matched.
    pub async fn remove_source(&self, source: impl Into<SourceRef>) -> bool {
        let source = source.into();
        let removed = {
            let mut state = self.state.lock().await;
            resolve_id(&state, source).and_then(|id| state.remove(&id))
        };
        let Some(mut entry) = removed else {
            return false;
        };
        if let Some(cancel) = entry.pump_cancel.take() {
            cancel.cancel();
        }
        entry.status.state = SourceState::Closed;
        self.publish(
            SOURCE_CLOSED,
            entry.status.id,
            entry.status.uuid,
            format!("source '{}' closed", entry.status.interface),
        );
        true
    }

    /// Control-surface alias of [`remove_source`](Self::remove_source).
    pub async fn close_source(&self, source: impl Into<SourceRef>) -> bool {
        self.remove_source(source).await
    }

    /// Snapshot of every active source.
    pub async fn list_sources(&self) -> Vec<SourceStatus> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state.values().map(|entry| entry.snapshot(now)).collect()
    }

    /// Applies `worker` to every source under the tracker lock, then calls
    /// its `finalize`, still under the lock.
    pub async fn iterate<W: SourceWorker>(&self, worker: &mut W) {
        let state = self.state.lock().await;
        let now = Instant::now();
        for entry in state.values() {
            worker.handle_source(&entry.snapshot(now));
        }
        worker.finalize();
    }

    /// Aggregates interface lists from every driver, marking interfaces
    /// already claimed by a running source.
    pub async fn list_interfaces(&self) -> Vec<InterfaceEntry> {
        let coordinator = ListCoordinator::new();
        let mut entries = coordinator
            .run(self.registry.drivers(), self.cfg.list_deadline)
            .await;

        let state = self.state.lock().await;
        for entry in &mut entries {
            let open = state.values().find(|s| {
                s.status.interface == entry.interface && s.status.state == SourceState::Running
            });
            if let Some(open) = open {
                entry.in_use_uuid = Some(open.status.uuid);
            }
        }
        entries
    }

    /// Re-tunes a running, channel-capable source.
    pub async fn set_channel(
        &self,
        source: impl Into<SourceRef>,
        channel: &str,
    ) -> Result<(), CaptureError> {
        let writer = {
            let state = self.state.lock().await;
            let id = resolve_id(&state, source.into()).ok_or_else(|| CaptureError::Internal {
                reason: "no such source".into(),
            })?;
            let entry = &state[&id];
            if entry.status.state != SourceState::Running {
                return Err(CaptureError::closed("source is not running"));
            }
            if !entry.status.channel_capable {
                return Err(CaptureError::SourceRejected {
                    message: "source is not channel-capable".into(),
                });
            }
            entry
                .writer
                .clone()
                .ok_or_else(|| CaptureError::closed("source transport is gone"))?
        };

        let result = writer
            .lock()
            .await
            .send(Frame::compose(&ChannelSet {
                channel: channel.to_string(),
            })?)
            .await;
        result
    }

    /// Cancels outstanding probes, closes every source, and stops the
    /// control loop. The event bus is shared and stays up; its owner shuts
    /// it down.
    pub async fn shutdown(&self) {
        {
            let mut probes = self.probes.lock().expect("probe set poisoned");
            for probe in probes.drain(..) {
                probe.cancel();
            }
        }
        self.cancel.cancel();
        let ids: Vec<SourceId> = self.state.lock().await.keys().copied().collect();
        for id in ids {
            self.remove_source(id).await;
        }
    }

    // ---------------------------
    // Internals
    // ---------------------------

    async fn probe_driver(
        &self,
        definition: &SourceDefinition,
    ) -> Result<Arc<DriverBuilder>, CaptureError> {
        let coordinator = ProbeCoordinator::new(definition.clone());
        self.probes
            .lock()
            .expect("probe set poisoned")
            .push(Arc::clone(&coordinator));

        let resolved = coordinator
            .run(self.registry.drivers(), self.cfg.probe_deadline)
            .await;

        self.probes
            .lock()
            .expect("probe set poisoned")
            .retain(|c| !Arc::ptr_eq(c, &coordinator));
        resolved
    }

    /// Allocates a runtime id and inserts the entry in `opening` state.
    async fn new_entry(&self, driver: &Arc<DriverBuilder>, definition: &SourceDefinition) -> SourceId {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let status = SourceStatus {
            id,
            uuid: Uuid::new_v4(),
            driver: driver.name().to_string(),
            definition: definition.raw().to_string(),
            interface: definition.interface().to_string(),
            channel_capable: false,
            description: driver.description().to_string(),
            pid: None,
            state: SourceState::Opening,
            last_error: None,
            retry_in: None,
        };
        self.state.lock().await.insert(
            id,
            Entry {
                status,
                definition: definition.clone(),
                driver: Arc::clone(driver),
                writer: None,
                pump_cancel: None,
                prev_delay: None,
                retry_due: None,
            },
        );
        id
    }

    /// Connects the driver's engine and drives the open handshake for an
    /// existing entry (initial open and every retry).
    async fn connect_and_open(&self, id: SourceId) -> Result<(), CaptureError> {
        let (driver, definition) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.get_mut(&id) else {
                return Err(CaptureError::closed("source removed during open"));
            };
            entry.status.state = SourceState::Opening;
            (Arc::clone(&entry.driver), entry.definition.clone())
        };

        let mut link = driver.connect(&definition).await?;
        let reply = self.handshake(&mut link, &definition).await?;
        self.adopt(id, link, reply).await
    }

    /// `OPEN` / `OPEN_RESP` exchange, bounded by the open deadline.
    async fn handshake(
        &self,
        link: &mut SourceLink,
        definition: &SourceDefinition,
    ) -> Result<OpenReply, CaptureError> {
        let transaction = next_transaction();
        link.transport
            .send(Frame::compose(&OpenRequest {
                transaction,
                definition: definition.raw().to_string(),
            })?)
            .await?;

        let reply: OpenReply = timeout(self.cfg.open_deadline, async {
            loop {
                let frame = link.transport.recv().await?;
                match frame.frame_type.as_str() {
                    frame_types::OPEN_RESP => {
                        let reply: OpenReply = frame.payload()?;
                        if reply.transaction == transaction {
                            return Ok(reply);
                        }
                    }
                    frame_types::ERROR => {
                        let report: ErrorReport = frame.payload()?;
                        return Err(CaptureError::SourceRejected {
                            message: report.message,
                        });
                    }
                    // HELLO banners and MESSAGE chatter may precede the
                    // reply.
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| CaptureError::closed("open handshake timed out"))??;

        if !reply.success {
            return Err(CaptureError::SourceRejected {
                message: reply
                    .message
                    .clone()
                    .unwrap_or_else(|| "driver refused the source".to_string()),
            });
        }
        Ok(reply)
    }

    /// Moves an entry to `running` around a freshly-opened link and spawns
    /// its frame pump.
    async fn adopt(
        &self,
        id: SourceId,
        link: SourceLink,
        reply: OpenReply,
    ) -> Result<(), CaptureError> {
        let SourceLink {
            pid,
            transport,
            guard,
        } = link;
        let (reader, writer) = transport.into_parts();

        let mut state = self.state.lock().await;
        if let Some(uuid) = reply.uuid {
            let taken = state.iter().any(|(other, e)| {
                *other != id && e.status.uuid == uuid && e.status.state != SourceState::Closed
            });
            if taken {
                return Err(CaptureError::SourceRejected {
                    message: format!("uuid {uuid} already claimed by another source"),
                });
            }
        }
        let Some(entry) = state.get_mut(&id) else {
            // Removed while opening; dropping the guard kills the child.
            return Err(CaptureError::closed("source removed during open"));
        };

        if let Some(uuid) = reply.uuid {
            entry.status.uuid = uuid;
        }
        entry.status.state = SourceState::Running;
        entry.status.pid = pid;
        entry.status.channel_capable = reply.channel_capable;
        if let Some(description) = &reply.message {
            entry.status.description = description.clone();
        }
        entry.status.last_error = None;
        entry.prev_delay = None;
        entry.retry_due = None;

        let pump_cancel = self.cancel.child_token();
        entry.pump_cancel = Some(pump_cancel.clone());
        entry.writer = Some(Arc::new(Mutex::new(writer)));
        let uuid = entry.status.uuid;
        let interface = entry.status.interface.clone();
        drop(state);

        tokio::spawn(pump(
            reader,
            guard,
            id,
            uuid,
            Arc::clone(&self.bus),
            Arc::clone(&self.sink),
            self.feedback.clone(),
            pump_cancel,
        ));

        self.publish(
            SOURCE_OPENED,
            id,
            uuid,
            format!("source '{interface}' running"),
        );
        Ok(())
    }

    /// Records an error on a source, stops its pump, and schedules the
    /// re-open.
    async fn fail_source(&self, id: SourceId, error: &CaptureError) {
        let uuid = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.get_mut(&id) else {
                return;
            };
            if entry.status.state == SourceState::Closed {
                return;
            }
            if let Some(cancel) = entry.pump_cancel.take() {
                cancel.cancel();
            }
            entry.writer = None;
            entry.status.state = SourceState::Error;
            entry.status.pid = None;
            entry.status.last_error = Some(error.to_string());

            // Errors that cannot be fixed by retrying the same bytes go
            // straight to the slowest cadence.
            let delay = if error.is_retryable() {
                self.cfg.retry_backoff.next(entry.prev_delay)
            } else {
                self.cfg.retry_backoff.cap
            };
            entry.prev_delay = Some(delay);
            entry.retry_due = Some(Instant::now() + delay);
            entry.status.uuid
        };
        self.publish(SOURCE_ERROR, id, uuid, error.to_string());
    }

    async fn control_loop(self: Arc<Self>, mut feedback: mpsc::UnboundedReceiver<Feedback>) {
        let mut ticker = interval(self.cfg.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = feedback.recv() => match message {
                    Some(Feedback::Errored { id, error }) => {
                        self.fail_source(id, &error).await;
                    }
                    None => break,
                },
                _ = ticker.tick() => self.retry_due_sources().await,
            }
        }
    }

    /// Re-opens every errored source whose retry-due time has elapsed.
    async fn retry_due_sources(&self) {
        let now = Instant::now();
        let due: Vec<SourceId> = {
            let state = self.state.lock().await;
            state
                .iter()
                .filter(|(_, e)| {
                    e.status.state == SourceState::Error
                        && e.retry_due.map(|at| at <= now).unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for id in due {
            tracing::debug!(source = id, "retrying errored source");
            if let Err(err) = self.connect_and_open(id).await {
                self.fail_source(id, &err).await;
            }
        }
    }

    fn publish(&self, channel: &str, id: SourceId, uuid: Uuid, message: String) {
        self.bus.publish(self.bus.make_event(channel).with_payload(SourceEvent {
            source_id: id,
            uuid,
            message,
        }));
    }
}

fn resolve_id(state: &BTreeMap<SourceId, Entry>, source: SourceRef) -> Option<SourceId> {
    match source {
        SourceRef::Id(id) => state.contains_key(&id).then_some(id),
        SourceRef::Uuid(uuid) => state
            .iter()
            .find(|(_, e)| e.status.uuid == uuid)
            .map(|(id, _)| *id),
    }
}

/// Per-source frame pump. Owns the receive half and the child guard: when
/// the pump ends, the child dies with it.
#[allow(clippy::too_many_arguments)]
async fn pump(
    mut reader: FrameReader,
    mut guard: Option<ChildGuard>,
    id: SourceId,
    uuid: Uuid,
    bus: Arc<EventBus>,
    sink: Arc<dyn PacketSink>,
    feedback: mpsc::UnboundedSender<Feedback>,
    cancel: CancellationToken,
) {
    let error = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(guard) = guard.as_mut() {
                    guard.terminate();
                }
                return;
            }
            frame = reader.recv() => match frame {
                Ok(frame) => match frame.frame_type.as_str() {
                    frame_types::ERROR => {
                        let message = frame
                            .payload::<ErrorReport>()
                            .map(|report| report.message)
                            .unwrap_or_else(|_| "driver reported an error".to_string());
                        break CaptureError::SourceRejected { message };
                    }
                    frame_types::MESSAGE => {
                        if let Ok(text) = frame.payload::<TextMessage>() {
                            bus.publish(bus.make_event(SOURCE_MESSAGE).with_payload(SourceEvent {
                                source_id: id,
                                uuid,
                                message: text.message,
                            }));
                        }
                    }
                    _ => sink.on_frame(id, frame).await,
                },
                Err(err) => break err,
            },
        }
    };

    if let Some(guard) = guard.as_mut() {
        guard.terminate();
    }
    let _ = feedback.send(Feedback::Errored { id, error });
}
