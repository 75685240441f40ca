use crate::{DeviceLink, LinkError, LinkInfo, Register, Result};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio_modbus::client::sync::{self, Context, Reader, Writer};
use tokio_modbus::slave::Slave;
use tracing::debug;

pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Modbus/TCP link to a LOGO!-style controller.
///
/// V-memory is exposed as holding registers, one 16-bit word per two bytes:
/// byte `n` lives in register `n / 2`, even offsets in the high byte.
pub struct ModbusTcpLink {
    unit: u8,
    ctx: Option<Context>,
    address: Option<String>,
}

impl ModbusTcpLink {
    pub fn new() -> Self {
        Self::with_unit(1)
    }

    pub fn with_unit(unit: u8) -> Self {
        Self {
            unit,
            ctx: None,
            address: None,
        }
    }

    fn ctx(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or(LinkError::NotConnected)
    }

    fn read_word(&mut self, register: Register) -> Result<u16> {
        let addr = word_address(register);
        let words = self
            .ctx()?
            .read_holding_registers(addr, 1)
            .map_err(map_io)?;
        words
            .first()
            .copied()
            .ok_or_else(|| LinkError::Protocol(format!("empty response reading {register}")))
    }
}

impl Default for ModbusTcpLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLink for ModbusTcpLink {
    fn connect(&mut self, address: &str, timeout: Duration) -> Result<()> {
        self.ctx = None;
        self.address = None;
        let socket = resolve(address)?;
        debug!(%socket, unit = self.unit, "opening modbus/tcp link");
        let ctx = sync::tcp::connect_slave_with_timeout(socket, Slave(self.unit), Some(timeout))
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout,
                _ => LinkError::Unreachable(format!("{address}: {e}")),
            })?;
        self.ctx = Some(ctx);
        self.address = Some(address.to_string());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        // Dropping the context closes the socket.
        self.ctx = None;
        self.address = None;
        Ok(())
    }

    fn write(&mut self, register: Register, value: u8) -> Result<()> {
        let word = self.read_word(register)?;
        let merged = merge_byte(word, register, value);
        let addr = word_address(register);
        self.ctx()?
            .write_single_register(addr, merged)
            .map_err(map_io)
    }

    fn read(&mut self, register: Register) -> Result<u8> {
        let word = self.read_word(register)?;
        Ok(extract_byte(word, register))
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn describe(&self) -> LinkInfo {
        LinkInfo {
            driver: "modbus-tcp".to_string(),
            address: self.address.clone(),
        }
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    let with_port = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_MODBUS_PORT}")
    };
    with_port
        .to_socket_addrs()
        .map_err(|e| LinkError::Unreachable(format!("{address}: {e}")))?
        .next()
        .ok_or_else(|| LinkError::Unreachable(format!("{address}: no address resolved")))
}

fn map_io(e: io::Error) -> LinkError {
    match e.kind() {
        io::ErrorKind::TimedOut => LinkError::Timeout,
        _ => LinkError::Io(e.to_string()),
    }
}

fn word_address(register: Register) -> u16 {
    register.offset() / 2
}

fn extract_byte(word: u16, register: Register) -> u8 {
    let [hi, lo] = word.to_be_bytes();
    if register.offset() % 2 == 0 {
        hi
    } else {
        lo
    }
}

fn merge_byte(word: u16, register: Register, value: u8) -> u16 {
    let [hi, lo] = word.to_be_bytes();
    if register.offset() % 2 == 0 {
        u16::from_be_bytes([value, lo])
    } else {
        u16::from_be_bytes([hi, value])
    }
}
