use thiserror::Error;

pub type Result<T, E = LinkError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("timeout")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid register: {0}")]
    InvalidRegister(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
}
