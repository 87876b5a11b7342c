//! # Driver descriptors.
//!
//! A [`DriverBuilder`] is the immutable metadata the tracker holds for one
//! capture driver: its name, whether it can probe or enumerate interfaces
//! natively (in-process, without spawning a child), and the [`Connect`]
//! factory that produces live capture engines for it.
//!
//! Dispatch is through function handles rather than inheritance: a driver
//! that can answer probes in-process installs a closure with
//! [`with_native_probe`](DriverBuilder::with_native_probe); everything else
//! is asked over child IPC by the coordinators.

use std::sync::Arc;

use crate::error::CaptureError;
use crate::proto::InterfaceEntry;
use crate::source::{Connect, IpcConnector, SourceDefinition, SourceLink};

/// In-process probe: does this driver claim the definition?
pub type NativeProbeFn = Arc<dyn Fn(&SourceDefinition) -> bool + Send + Sync>;

/// In-process interface enumeration.
pub type NativeListFn = Arc<dyn Fn() -> Vec<InterfaceEntry> + Send + Sync>;

/// Immutable descriptor for one capture driver.
#[derive(Clone)]
pub struct DriverBuilder {
    name: String,
    description: String,
    probe_native: Option<NativeProbeFn>,
    list_native: Option<NativeListFn>,
    connector: Arc<dyn Connect>,
}

impl DriverBuilder {
    /// Descriptor with an explicit connector.
    pub fn new(name: &str, connector: Arc<dyn Connect>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            probe_native: None,
            list_native: None,
            connector,
        }
    }

    /// Descriptor using the conventional IPC capture binary for `name`.
    pub fn ipc(name: &str) -> Self {
        Self::new(name, Arc::new(IpcConnector::new(name)))
    }

    /// Sets the human description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Installs an in-process probe function.
    #[must_use]
    pub fn with_native_probe(
        mut self,
        probe: impl Fn(&SourceDefinition) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.probe_native = Some(Arc::new(probe));
        self
    }

    /// Installs an in-process interface enumerator.
    #[must_use]
    pub fn with_native_list(
        mut self,
        list: impl Fn() -> Vec<InterfaceEntry> + Send + Sync + 'static,
    ) -> Self {
        self.list_native = Some(Arc::new(list));
        self
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// True when the driver probes without child IPC.
    pub fn can_probe_native(&self) -> bool {
        self.probe_native.is_some()
    }

    /// True when the driver enumerates interfaces without child IPC.
    pub fn can_list_native(&self) -> bool {
        self.list_native.is_some()
    }

    /// Runs the native probe, if the driver has one.
    pub fn probe_native(&self, definition: &SourceDefinition) -> Option<bool> {
        self.probe_native.as_ref().map(|f| f(definition))
    }

    /// Runs the native enumerator, if the driver has one.
    pub fn list_native(&self) -> Option<Vec<InterfaceEntry>> {
        self.list_native.as_ref().map(|f| f())
    }

    /// Connects a new capture engine for `definition`.
    pub async fn connect(
        &self,
        definition: &SourceDefinition,
    ) -> Result<SourceLink, CaptureError> {
        self.connector.connect(definition).await
    }
}

impl std::fmt::Debug for DriverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverBuilder")
            .field("name", &self.name)
            .field("probe_native", &self.probe_native.is_some())
            .field("list_native", &self.list_native.is_some())
            .finish()
    }
}
