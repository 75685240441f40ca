use crate::{DeviceLink, LinkError, LinkInfo, Register, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One operation observed by a [`SimulatedLink`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkOp {
    Connect(String),
    Disconnect,
    Read(Register),
    Write(Register, u8),
}

#[derive(Clone, Debug)]
pub struct LinkCall {
    pub at: Instant,
    pub op: LinkOp,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    address: Option<String>,
    memory: HashMap<Register, u8>,
    scripted: HashMap<Register, VecDeque<u8>>,
    mirror: Option<(Register, Register)>,
    fail_connect: bool,
    fail_reads: bool,
    fail_writes: bool,
    calls: Vec<LinkCall>,
}

/// An in-process simulated controller.
///
/// Clones share the same state, so a test can keep one handle for scripting and
/// inspection while the code under test owns another.
#[derive(Clone, Default)]
pub struct SimulatedLink {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every write to `from` into `to`, like a controller whose status
    /// register follows the last command.
    pub fn with_mirror(self, from: Register, to: Register) -> Self {
        self.lock().mirror = Some((from, to));
        self
    }

    pub fn set_register(&self, register: Register, value: u8) {
        self.lock().memory.insert(register, value);
    }

    pub fn register(&self, register: Register) -> u8 {
        self.lock().memory.get(&register).copied().unwrap_or(0)
    }

    /// Queue values returned by successive reads of `register`. Once the queue
    /// drains, reads return the register memory, which holds the last value served.
    pub fn script_reads(&self, register: Register, values: &[u8]) {
        self.lock()
            .scripted
            .entry(register)
            .or_default()
            .extend(values.iter().copied());
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.lock().calls.clone()
    }

    pub fn reads(&self) -> Vec<LinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.op, LinkOp::Read(_)))
            .collect()
    }

    /// Every `(register, value)` written so far, in order.
    pub fn writes(&self) -> Vec<(Register, u8)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c.op {
                LinkOp::Write(reg, value) => Some((reg, value)),
                _ => None,
            })
            .collect()
    }

    pub fn write_calls(&self) -> Vec<LinkCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.op, LinkOp::Write(..)))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceLink for SimulatedLink {
    fn connect(&mut self, address: &str, _timeout: Duration) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(LinkCall {
            at: Instant::now(),
            op: LinkOp::Connect(address.to_string()),
        });
        if st.fail_connect {
            st.connected = false;
            return Err(LinkError::Unreachable(address.to_string()));
        }
        st.connected = true;
        st.address = Some(address.to_string());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut st = self.lock();
        st.calls.push(LinkCall {
            at: Instant::now(),
            op: LinkOp::Disconnect,
        });
        st.connected = false;
        st.address = None;
        Ok(())
    }

    fn write(&mut self, register: Register, value: u8) -> Result<()> {
        let mut st = self.lock();
        if !st.connected {
            return Err(LinkError::NotConnected);
        }
        st.calls.push(LinkCall {
            at: Instant::now(),
            op: LinkOp::Write(register, value),
        });
        if st.fail_writes {
            return Err(LinkError::Io("simulated write failure".into()));
        }
        st.memory.insert(register, value);
        if let Some((from, to)) = st.mirror {
            if from == register {
                st.memory.insert(to, value);
            }
        }
        Ok(())
    }

    fn read(&mut self, register: Register) -> Result<u8> {
        let mut st = self.lock();
        if !st.connected {
            return Err(LinkError::NotConnected);
        }
        st.calls.push(LinkCall {
            at: Instant::now(),
            op: LinkOp::Read(register),
        });
        if st.fail_reads {
            return Err(LinkError::Io("simulated read failure".into()));
        }
        let next = st.scripted.get_mut(&register).and_then(|q| q.pop_front());
        if let Some(value) = next {
            st.memory.insert(register, value);
            return Ok(value);
        }
        Ok(st.memory.get(&register).copied().unwrap_or(0))
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn describe(&self) -> LinkInfo {
        LinkInfo {
            driver: "mock".to_string(),
            address: self.lock().address.clone(),
        }
    }
}
