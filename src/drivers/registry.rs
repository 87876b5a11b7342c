//! # Driver registry.
//!
//! Holds the registered [`DriverBuilder`]s in registration order. The
//! ordering matters: native probes run in registration order, so earlier
//! drivers get first claim on ambiguous definitions.
//!
//! Registration is idempotent on name: re-registering a driver replaces the
//! previous descriptor in place (keeping its position) and logs a warning.

use std::sync::{Arc, Mutex};

use super::builder::DriverBuilder;

/// Append-dominant store of driver descriptors.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<Vec<Arc<DriverBuilder>>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver. Last writer wins on a name collision.
    pub fn register(&self, builder: DriverBuilder) {
        let mut drivers = self.drivers.lock().expect("driver registry poisoned");
        let builder = Arc::new(builder);
        match drivers.iter().position(|d| d.name() == builder.name()) {
            Some(at) => {
                tracing::warn!(
                    driver = builder.name(),
                    "driver re-registered, replacing previous descriptor"
                );
                drivers[at] = builder;
            }
            None => drivers.push(builder),
        }
    }

    /// Snapshot of all drivers in registration order.
    pub fn drivers(&self) -> Vec<Arc<DriverBuilder>> {
        self.drivers
            .lock()
            .expect("driver registry poisoned")
            .clone()
    }

    /// Driver by name.
    pub fn get(&self, name: &str) -> Option<Arc<DriverBuilder>> {
        self.drivers
            .lock()
            .expect("driver registry poisoned")
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.drivers.lock().expect("driver registry poisoned").len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
