//! plc-link: device link abstractions for PLC-class controllers
//!
//! This crate provides the [`DeviceLink`] trait used to open a connection to one
//! controller and read/write byte-wide registers on it, with feature-gated backends.
//! The default build enables the `mock` backend so that binaries and tests run on
//! any host without a device on the network.

mod types;
pub use types::{LinkInfo, Register};

mod error;
pub use error::{LinkError, Result};

mod traits;
pub use traits::DeviceLink;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{LinkCall, LinkOp, SimulatedLink};

#[cfg(feature = "modbus")]
mod modbus;

#[cfg(feature = "modbus")]
pub use modbus::{ModbusTcpLink, DEFAULT_MODBUS_PORT};
