//! # Capture drivers.
//!
//! - [`DriverBuilder`] — immutable descriptor: name, native probe/list
//!   handles, connect factory.
//! - [`DriverRegistry`] — ordered, name-keyed store of descriptors.

mod builder;
mod registry;

pub use builder::{DriverBuilder, NativeListFn, NativeProbeFn};
pub use registry::DriverRegistry;
