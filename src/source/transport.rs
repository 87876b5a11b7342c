//! # Transports: framed byte streams to capture engines.
//!
//! A [`Transport`] is the tracker's view of one capture engine: a duplex
//! byte stream carrying [`Frame`]s, whether the far side is a local child
//! process (IPC over stdio) or a remote capture over TCP.
//!
//! [`Connect`] is the seam to the child-spawn primitive: a driver's
//! connector produces a [`SourceLink`] holding the transport, the child pid
//! when there is one, and a [`ChildGuard`] that terminates the child when
//! its owner (a probe attempt or an active source) is dropped.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CaptureError;
use crate::proto::{Frame, FrameCodec};

use super::definition::SourceDefinition;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Receive half of a transport.
pub struct FrameReader {
    inner: FramedRead<BoxRead, FrameCodec>,
}

impl FrameReader {
    /// Receives the next complete frame.
    ///
    /// End of stream is [`CaptureError::TransportClosed`]; malformed bytes
    /// are [`CaptureError::ProtocolViolation`].
    pub async fn recv(&mut self) -> Result<Frame, CaptureError> {
        match self.inner.next().await {
            Some(result) => result,
            None => Err(CaptureError::closed("end of stream")),
        }
    }
}

/// Send half of a transport.
pub struct FrameWriter {
    inner: FramedWrite<BoxWrite, FrameCodec>,
}

impl FrameWriter {
    /// Sends one frame, flushing it onto the wire.
    pub async fn send(&mut self, frame: Frame) -> Result<(), CaptureError> {
        self.inner.send(frame).await
    }
}

/// Framed duplex stream speaking the capture protocol.
pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Transport {
    /// Wraps a read/write pair in the frame codec.
    pub fn new(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: FrameReader {
                inner: FramedRead::new(Box::new(read) as BoxRead, FrameCodec::new()),
            },
            writer: FrameWriter {
                inner: FramedWrite::new(Box::new(write) as BoxWrite, FrameCodec::new()),
            },
        }
    }

    /// Sends one frame, flushing it onto the wire.
    pub async fn send(&mut self, frame: Frame) -> Result<(), CaptureError> {
        self.writer.send(frame).await
    }

    /// Receives the next complete frame.
    ///
    /// End of stream is [`CaptureError::TransportClosed`]; malformed bytes
    /// are [`CaptureError::ProtocolViolation`].
    pub async fn recv(&mut self) -> Result<Frame, CaptureError> {
        self.reader.recv().await
    }

    /// Splits into independently-owned halves; the frame pump keeps the
    /// reader while the tracker retains the writer for runtime commands.
    pub fn into_parts(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Scoped owner of a capture child process.
///
/// Dropping the guard terminates the child (`kill_on_drop`); the pump task
/// or probe attempt that owns it therefore cannot leak a process.
#[derive(Debug)]
pub struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    /// Wraps a spawned child.
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// OS pid, when the child is still attached.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Requests termination without waiting for exit.
    pub fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// A connected capture engine: transport plus child ownership.
pub struct SourceLink {
    /// Child pid, `None` for remote transports.
    pub pid: Option<u32>,
    /// Framed stream to the engine.
    pub transport: Transport,
    /// Kill-on-drop handle for local children.
    pub guard: Option<ChildGuard>,
}

impl SourceLink {
    /// A link over an existing stream pair with no child attached
    /// (remote TCP captures, in-memory tests).
    pub fn remote(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            pid: None,
            transport: Transport::new(read, write),
            guard: None,
        }
    }
}

impl std::fmt::Debug for SourceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceLink")
            .field("pid", &self.pid)
            .field("has_child", &self.guard.is_some())
            .finish()
    }
}

/// Child-spawn primitive at its interface: produce a connected engine for a
/// definition. Drivers carry one; tests substitute scripted in-memory
/// implementations.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Connects a new capture engine for `definition`.
    async fn connect(&self, definition: &SourceDefinition) -> Result<SourceLink, CaptureError>;
}

/// Spawns the driver's capture binary and speaks to it over piped stdio.
///
/// By convention a driver named `pcap` is served by a `wavecap_cap_pcap`
/// binary on `$PATH`; [`IpcConnector::with_binary`] overrides the lookup.
pub struct IpcConnector {
    driver: String,
    binary: String,
}

impl IpcConnector {
    /// Connector for `driver` using the conventional binary name.
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            binary: format!("wavecap_cap_{driver}"),
        }
    }

    /// Overrides the capture binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl Connect for IpcConnector {
    async fn connect(&self, definition: &SourceDefinition) -> Result<SourceLink, CaptureError> {
        let mut child = Command::new(&self.binary)
            .arg("--source")
            .arg(definition.raw())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::SpawnFailed {
                driver: self.driver.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CaptureError::Internal {
            reason: "spawned child without piped stdout".into(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| CaptureError::Internal {
            reason: "spawned child without piped stdin".into(),
        })?;
        let pid = child.id();

        Ok(SourceLink {
            pid,
            transport: Transport::new(stdout, stdin),
            guard: Some(ChildGuard::new(child)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{frame_types, Frame, ProbeRequest};

    #[tokio::test]
    async fn frames_cross_an_in_memory_link() {
        let (near_rd, far_wr) = tokio::io::duplex(4096);
        let (far_rd, near_wr) = tokio::io::duplex(4096);
        let mut near = Transport::new(near_rd, near_wr);
        let mut far = Transport::new(far_rd, far_wr);

        let frame = Frame::compose(&ProbeRequest {
            transaction: 4,
            definition: "wlan0".into(),
        })
        .unwrap();
        near.send(frame.clone()).await.unwrap();
        assert_eq!(far.recv().await.unwrap(), frame);

        far.send(Frame::new(frame_types::DATA)).await.unwrap();
        assert_eq!(
            near.recv().await.unwrap().frame_type,
            frame_types::DATA.to_string()
        );
    }

    #[tokio::test]
    async fn dropped_peer_surfaces_as_transport_closed() {
        let (near_rd, far_wr) = tokio::io::duplex(64);
        let (_far_rd, near_wr) = tokio::io::duplex(64);
        let mut near = Transport::new(near_rd, near_wr);
        drop(far_wr);
        let err = near.recv().await.unwrap_err();
        assert_eq!(err.as_label(), "transport_closed");
    }

    #[tokio::test]
    async fn spawn_failure_is_tagged_with_the_driver() {
        let connector =
            IpcConnector::new("ghost").with_binary("/nonexistent/wavecap_cap_ghost");
        let def: SourceDefinition = "wlan0".parse().unwrap();
        let err = connector.connect(&def).await.unwrap_err();
        assert_eq!(err.as_label(), "spawn_failed");
        assert!(err.to_string().contains("ghost"));
    }
}
