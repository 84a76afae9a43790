//! Error types for the PS/2 transport

use rmiflash_core::error::{Error as CoreError, TransportError};
use thiserror::Error;

/// PS/2 transport errors
#[derive(Debug, Error)]
pub enum Ps2Error {
    /// Failed to open device
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Byte transfer failed
    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] std::io::Error),

    /// No byte within the timeout
    #[error("Read timed out: {0}")]
    Timeout(&'static str),

    /// A byte was never acknowledged
    #[error("Cannot write byte 0x{0:02x} after retries")]
    RetriesExhausted(u8),

    /// The device answered something unexpected
    #[error("Unexpected response {got:02x?}, expected {expected:02x?}")]
    UnexpectedResponse { expected: Vec<u8>, got: Vec<u8> },

    /// sysfs lookup or driver switch failed
    #[error("sysfs: {0}")]
    Sysfs(String),

    /// The serio_raw node did not appear after the driver switch
    #[error("No serio_raw node for {0}")]
    ReplugTimeout(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Device not specified
    #[error("No device specified. Use serio=serioN or dev=/dev/serio_rawN")]
    NoDevice,
}

impl From<Ps2Error> for CoreError {
    fn from(e: Ps2Error) -> Self {
        log::debug!("ps2: {}", e);
        let kind = match e {
            Ps2Error::Timeout(_) => TransportError::Timeout,
            Ps2Error::RetriesExhausted(_) => TransportError::RetriesExhausted,
            Ps2Error::UnexpectedResponse { .. } => TransportError::MalformedFrame,
            Ps2Error::ReplugTimeout(_) | Ps2Error::NoDevice => TransportError::Disconnected,
            _ => TransportError::Io,
        };
        CoreError::Transport(kind)
    }
}

/// Result type for PS/2 operations
pub type Result<T> = std::result::Result<T, Ps2Error>;
