use crate::LinkError;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

/// Byte offset in the controller's V-memory (`V0`, `VB12`, ...).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Register(u16);

impl Register {
    /// Register written to issue commands on the stock deployment.
    pub const COMMAND: Register = Register(0);
    /// Register polled for status on the stock deployment.
    pub const STATUS: Register = Register(1);

    pub const fn v(offset: u16) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

impl FromStr for Register {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let upper = t.to_ascii_uppercase();
        let digits = upper
            .strip_prefix("VB")
            .or_else(|| upper.strip_prefix('V'))
            .unwrap_or(&upper);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LinkError::InvalidRegister(t.to_string()));
        }
        digits
            .parse::<u16>()
            .map(Register)
            .map_err(|_| LinkError::InvalidRegister(t.to_string()))
    }
}

impl TryFrom<String> for Register {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Register> for String {
    fn from(value: Register) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkInfo {
    pub driver: String,
    pub address: Option<String>,
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(addr) => write!(f, "{}://{}", self.driver, addr),
            None => write!(f, "{} (closed)", self.driver),
        }
    }
}
