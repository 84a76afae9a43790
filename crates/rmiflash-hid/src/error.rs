//! Error types for the hidraw transport

use rmiflash_core::error::{Error as CoreError, TransportError};
use thiserror::Error;

/// hidraw transport errors
#[derive(Debug, Error)]
pub enum HidError {
    /// Failed to open device
    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to send the mode feature report
    #[error("Failed to set HID mode {mode}: {source}")]
    SetModeFailed {
        mode: u8,
        #[source]
        source: std::io::Error,
    },

    /// Report read or write failed
    #[error("Report transfer failed: {0}")]
    TransferFailed(#[source] std::io::Error),

    /// Report was rejected before it reached the device
    #[error("Report invalid: {0}")]
    Framing(TransportError),

    /// No report within the timeout
    #[error("Timed out after {0} ms")]
    Timeout(u32),

    /// sysfs lookup or driver rebind failed
    #[error("sysfs: {0}")]
    Sysfs(String),

    /// The hidraw node did not come back after a rebind
    #[error("Device {0} did not reappear after rebind")]
    ReplugTimeout(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Device not specified
    #[error("No device specified. Use dev=/dev/hidrawN")]
    NoDevice,
}

impl From<TransportError> for HidError {
    fn from(e: TransportError) -> Self {
        Self::Framing(e)
    }
}

impl From<HidError> for CoreError {
    fn from(e: HidError) -> Self {
        log::debug!("hid: {}", e);
        let kind = match e {
            HidError::Framing(inner) => inner,
            HidError::Timeout(_) => TransportError::Timeout,
            HidError::ReplugTimeout(_) | HidError::NoDevice => TransportError::Disconnected,
            _ => TransportError::Io,
        };
        CoreError::Transport(kind)
    }
}

/// Result type for hidraw operations
pub type Result<T> = std::result::Result<T, HidError>;
