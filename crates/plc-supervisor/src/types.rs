use core::fmt;
use plc_link::Register;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Commands a device accepts, by name.
pub type CommandMap = BTreeMap<String, BitPattern>;

/// Status bit index (0 = least significant) to display label. Sparse.
pub type StatusLabels = BTreeMap<u8, String>;

/// Command names treated as momentary when a profile does not list its own.
pub const DEFAULT_MOMENTARY: [&str; 3] = ["open", "close", "estop"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    pub profiles: BTreeMap<String, DeviceProfile>,
    #[serde(default)]
    pub groups: Vec<DeviceGroup>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl SupervisorSettings {
    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

/// Devices of one type, named `{type_name}{n}` with `n` counting from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub type_name: String,
    pub profile: String,
    pub addresses: Vec<String>,
}

/// A single device with an explicit id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub address: String,
    pub profile: String,
}

/// Everything the supervisor needs to know about one kind of controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub commands: CommandMap,
    #[serde(default)]
    pub status_bits: StatusLabels,
    #[serde(default = "default_status_register")]
    pub status_register: Register,
    #[serde(default = "default_command_register")]
    pub command_register: Register,
    #[serde(default)]
    pub momentary: Option<Vec<String>>,
    #[serde(default = "default_idle_command")]
    pub idle_command: String,
    #[serde(default = "default_revert_delay_ms")]
    pub revert_delay_ms: u64,
}

impl DeviceProfile {
    pub fn new(commands: CommandMap, status_bits: StatusLabels, status_register: Register) -> Self {
        Self {
            commands,
            status_bits,
            status_register,
            command_register: default_command_register(),
            momentary: None,
            idle_command: default_idle_command(),
            revert_delay_ms: default_revert_delay_ms(),
        }
    }

    /// Whether writing `command` must be followed by a revert to idle.
    pub fn is_momentary(&self, command: &str) -> bool {
        match &self.momentary {
            Some(list) => list.iter().any(|c| c == command),
            None => DEFAULT_MOMENTARY.contains(&command),
        }
    }

    /// Pattern written to return the device to idle; 0 if the profile lacks one.
    pub fn idle_pattern(&self) -> u8 {
        self.commands
            .get(&self.idle_command)
            .map(|p| p.value())
            .unwrap_or(0)
    }

    pub fn revert_delay(&self) -> Duration {
        Duration::from_millis(self.revert_delay_ms)
    }
}

/// Command bit pattern. Accepts an integer or `"0b..."` / `"0x..."` text.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPattern", into = "u8")]
pub struct BitPattern(u8);

impl BitPattern {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<BitPattern> for u8 {
    fn from(value: BitPattern) -> Self {
        value.0
    }
}

impl fmt::Display for BitPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0b{:08b}", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPattern {
    Int(u64),
    Text(String),
}

impl TryFrom<RawPattern> for BitPattern {
    type Error = String;

    fn try_from(raw: RawPattern) -> Result<Self, Self::Error> {
        let value = match raw {
            RawPattern::Int(v) => v,
            RawPattern::Text(s) => parse_pattern_text(&s)?,
        };
        u8::try_from(value)
            .map(BitPattern)
            .map_err(|_| format!("bit pattern {value} does not fit in one byte"))
    }
}

fn parse_pattern_text(s: &str) -> Result<u64, String> {
    let t = s.trim().replace('_', "");
    let parsed = if let Some(bin) = t.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else if let Some(hex) = t.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        t.parse::<u64>()
    };
    parsed.map_err(|e| format!("invalid bit pattern {s:?}: {e}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        SupervisorSettings::default().timing()
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_status_register() -> Register {
    Register::STATUS
}

fn default_command_register() -> Register {
    Register::COMMAND
}

fn default_idle_command() -> String {
    "none".to_string()
}

fn default_revert_delay_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_patterns_from_yaml() {
        let map: BTreeMap<String, BitPattern> = serde_yaml::from_str(
            "open: 3\nclose: \"0b0000101\"\nestop: \"0x10\"\nnone: 0\n",
        )
        .unwrap();
        assert_eq!(map["open"].value(), 3);
        assert_eq!(map["close"].value(), 5);
        assert_eq!(map["estop"].value(), 16);
        assert_eq!(map["none"].value(), 0);
    }

    #[test]
    fn oversized_pattern_rejected() {
        let res: Result<BitPattern, _> = serde_yaml::from_str("256");
        assert!(res.is_err());
        let res: Result<BitPattern, _> = serde_yaml::from_str("\"0b2\"");
        assert!(res.is_err());
    }

    #[test]
    fn momentary_defaults_and_overrides() {
        let mut commands = CommandMap::new();
        commands.insert("open".into(), BitPattern::new(3));
        commands.insert("none".into(), BitPattern::new(0));
        let mut profile = DeviceProfile::new(commands, StatusLabels::new(), Register::STATUS);
        assert!(profile.is_momentary("open"));
        assert!(profile.is_momentary("estop"));
        assert!(!profile.is_momentary("none"));

        profile.momentary = Some(vec![]);
        assert!(!profile.is_momentary("open"));
    }

    #[test]
    fn idle_pattern_falls_back_to_zero() {
        let mut commands = CommandMap::new();
        commands.insert("off".into(), BitPattern::new(0b0100_0000));
        let mut profile = DeviceProfile::new(commands, StatusLabels::new(), Register::STATUS);
        assert_eq!(profile.idle_pattern(), 0);
        profile.idle_command = "off".into();
        assert_eq!(profile.idle_pattern(), 0b0100_0000);
    }
}
