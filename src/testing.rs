//! # Test support: scripted in-memory capture engines.
//!
//! [`ScriptedConnector`] stands in for the child-spawn primitive. Each
//! `connect` hands back an in-memory transport whose far end is driven by a
//! [`Script`]: how (and whether) to answer probes, opens, and list
//! requests, with configurable delays. Used by the coordinator and tracker
//! tests; exported so driver authors can exercise their own integrations
//! without real capture binaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CaptureError;
use crate::proto::{
    frame_types, Frame, InterfaceEntry, ListReply, ListRequest, OpenReply, OpenRequest,
    ProbeReply, ProbeRequest,
};
use crate::source::{Connect, SourceDefinition, SourceLink, Transport};

/// How a scripted engine answers one request kind.
#[derive(Clone, Debug)]
pub enum Reply<T> {
    /// Answer with `T` after the delay.
    After(Duration, T),
    /// Never answer.
    Silent,
}

impl<T> Reply<T> {
    /// Immediate answer.
    pub fn now(value: T) -> Self {
        Reply::After(Duration::ZERO, value)
    }
}

/// Scripted open outcome.
#[derive(Clone, Debug)]
pub struct OpenScript {
    /// Whether the open succeeds.
    pub success: bool,
    /// UUID reported back, if any.
    pub uuid: Option<Uuid>,
    /// Channel capability reported back.
    pub channel_capable: bool,
    /// Description or refusal message.
    pub message: Option<String>,
}

impl Default for OpenScript {
    fn default() -> Self {
        Self {
            success: true,
            uuid: None,
            channel_capable: true,
            message: None,
        }
    }
}

/// Behavior of one scripted engine connection.
#[derive(Clone, Debug)]
pub struct Script {
    /// Fail the connect itself (spawn failure) instead of producing an
    /// engine.
    pub connect_error: bool,
    /// Probe behavior.
    pub probe: Reply<bool>,
    /// Open behavior.
    pub open: Reply<OpenScript>,
    /// List behavior.
    pub list: Reply<Vec<InterfaceEntry>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect_error: false,
            probe: Reply::now(true),
            open: Reply::now(OpenScript::default()),
            list: Reply::now(Vec::new()),
        }
    }
}

impl Script {
    /// Script whose probe answers `accepted` after `delay`.
    pub fn probe_after(delay: Duration, accepted: bool) -> Self {
        Self {
            probe: Reply::After(delay, accepted),
            ..Self::default()
        }
    }

    /// Script that never answers anything.
    pub fn silent() -> Self {
        Self {
            probe: Reply::Silent,
            open: Reply::Silent,
            list: Reply::Silent,
            ..Self::default()
        }
    }

    /// Script whose connect fails outright.
    pub fn unspawnable() -> Self {
        Self {
            connect_error: true,
            ..Self::default()
        }
    }
}

/// In-memory [`Connect`] implementation driven by scripts.
///
/// Connections consume scripts from the front of the sequence; once the
/// sequence is exhausted the fallback script repeats.
pub struct ScriptedConnector {
    driver: String,
    sequence: Mutex<VecDeque<Script>>,
    fallback: Script,
    connects: AtomicUsize,
    live: Mutex<Vec<CancellationToken>>,
    active: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Connector that replays `script` on every connection.
    pub fn new(driver: &str, script: Script) -> Arc<Self> {
        Self::with_sequence(driver, Vec::new(), script)
    }

    /// Connector that consumes `sequence`, then repeats `fallback`.
    pub fn with_sequence(driver: &str, sequence: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            driver: driver.to_string(),
            sequence: Mutex::new(sequence.into()),
            fallback,
            connects: AtomicUsize::new(0),
            live: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of connections made so far.
    pub fn connects(&self) -> usize {
        self.connects.load(AtomicOrdering::SeqCst)
    }

    /// Tears down every live engine, closing its transport from the far
    /// side.
    pub fn drop_links(&self) {
        let live = self.live.lock().expect("live list poisoned");
        for token in live.iter() {
            token.cancel();
        }
    }

    /// Number of engines still running; an engine exits when its near-side
    /// link is dropped (the in-memory analogue of a terminated child).
    pub fn live_engines(&self) -> usize {
        self.active.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl Connect for ScriptedConnector {
    async fn connect(&self, _definition: &SourceDefinition) -> Result<SourceLink, CaptureError> {
        self.connects.fetch_add(1, AtomicOrdering::SeqCst);

        let script = self
            .sequence
            .lock()
            .expect("script sequence poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if script.connect_error {
            return Err(CaptureError::SpawnFailed {
                driver: self.driver.clone(),
                reason: "scripted spawn failure".into(),
            });
        }

        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_rd, near_wr) = tokio::io::split(near);
        let (far_rd, far_wr) = tokio::io::split(far);

        let token = CancellationToken::new();
        self.live
            .lock()
            .expect("live list poisoned")
            .push(token.clone());

        let engine = Transport::new(far_rd, far_wr);
        let active = Arc::clone(&self.active);
        active.fetch_add(1, AtomicOrdering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = run_engine(engine, script) => {}
            }
            active.fetch_sub(1, AtomicOrdering::SeqCst);
        });

        Ok(SourceLink::remote(near_rd, near_wr))
    }
}

async fn run_engine(mut transport: Transport, script: Script) {
    loop {
        let frame = match transport.recv().await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match frame.frame_type.as_str() {
            frame_types::PROBE => {
                let Ok(req) = frame.payload::<ProbeRequest>() else {
                    return;
                };
                if let Reply::After(delay, accepted) = &script.probe {
                    tokio::time::sleep(*delay).await;
                    let reply = ProbeReply {
                        transaction: req.transaction,
                        accepted: *accepted,
                        message: None,
                    };
                    if send(&mut transport, &reply).await.is_err() {
                        return;
                    }
                }
            }
            frame_types::OPEN => {
                let Ok(req) = frame.payload::<OpenRequest>() else {
                    return;
                };
                if let Reply::After(delay, open) = &script.open {
                    tokio::time::sleep(*delay).await;
                    let reply = OpenReply {
                        transaction: req.transaction,
                        success: open.success,
                        uuid: open.uuid,
                        channel_capable: open.channel_capable,
                        message: open.message.clone(),
                    };
                    if send(&mut transport, &reply).await.is_err() {
                        return;
                    }
                }
            }
            frame_types::LIST => {
                let Ok(req) = frame.payload::<ListRequest>() else {
                    return;
                };
                if let Reply::After(delay, interfaces) = &script.list {
                    tokio::time::sleep(*delay).await;
                    let reply = ListReply {
                        transaction: req.transaction,
                        interfaces: interfaces.clone(),
                    };
                    if send(&mut transport, &reply).await.is_err() {
                        return;
                    }
                }
            }
            _ => {}
        }
    }
}

async fn send<P>(transport: &mut Transport, payload: &P) -> Result<(), CaptureError>
where
    P: crate::proto::FramePayload + serde::Serialize,
{
    transport.send(Frame::compose(payload)?).await
}
