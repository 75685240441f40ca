use plc_link::LinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{device}: connection failed: {source}")]
    Link {
        device: String,
        #[source]
        source: LinkError,
    },
    #[error("{device}: link reported success but is not connected")]
    NotReported { device: String },
    #[error("{device}: could not start status polling: {source}")]
    Spawn {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("{0}: not connected")]
    NotConnected(String),
    #[error("{device}: unknown command {command:?}")]
    UnknownCommand { device: String, command: String },
    #[error("{device}: write failed: {source}")]
    Link {
        device: String,
        #[source]
        source: LinkError,
    },
    #[error("{device}: command written but revert could not be scheduled: {source}")]
    RevertNotScheduled {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("group {0:?} has no addresses")]
    EmptyGroup(String),
    #[error("{owner}: unknown profile {profile:?}")]
    UnknownProfile { owner: String, profile: String },
    #[error("duplicate device id {0:?}")]
    DuplicateId(String),
    #[error("profile {profile:?}: status bit {bit} is outside 0..=7")]
    StatusBitOutOfRange { profile: String, bit: u8 },
    #[error("profile {profile:?}: idle command {command:?} is not defined")]
    MissingIdleCommand { profile: String, command: String },
    #[error("profile {profile:?}: momentary command {command:?} is not defined")]
    UnknownMomentary { profile: String, command: String },
    #[error("profile {profile:?}: command and status registers are both {register}")]
    RegisterClash { profile: String, register: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device {0:?} already registered")]
    DuplicateId(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
