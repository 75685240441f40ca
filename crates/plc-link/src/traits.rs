use crate::{LinkInfo, Register, Result};
use std::time::Duration;

/// A minimal blocking link to one controller.
///
/// Implementations own at most one open connection. Every call may fail; a failure
/// is reported through [`crate::LinkError`] and never leaves the link half-open.
pub trait DeviceLink: Send {
    /// Open a connection to `address`, giving up after `timeout`.
    fn connect(&mut self, address: &str, timeout: Duration) -> Result<()>;

    /// Close the connection. Closing an already closed link is a no-op.
    fn disconnect(&mut self) -> Result<()>;

    /// Write one byte to a register.
    fn write(&mut self, register: Register, value: u8) -> Result<()>;

    /// Read one byte from a register.
    fn read(&mut self, register: Register) -> Result<u8>;

    fn is_connected(&self) -> bool;

    /// Backend name and current endpoint, for logs.
    fn describe(&self) -> LinkInfo;
}

impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    fn connect(&mut self, address: &str, timeout: Duration) -> Result<()> {
        (**self).connect(address, timeout)
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }

    fn write(&mut self, register: Register, value: u8) -> Result<()> {
        (**self).write(register, value)
    }

    fn read(&mut self, register: Register) -> Result<u8> {
        (**self).read(register)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn describe(&self) -> LinkInfo {
        (**self).describe()
    }
}
