//! Error types for rmiflash-core
//!
//! The error type is `no_std` compatible and `Copy`, so it can be stored,
//! compared in tests and passed through transport layers without allocation.
//! Each failure domain has its own enum and the top-level [`Error`] wraps
//! them, which lets callers tell which step of a flash attempt failed from
//! the variant alone.

use core::fmt;

/// Failures on the physical channel below the register interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the allowed time
    Timeout,
    /// Fewer bytes were read than requested
    ShortRead,
    /// Fewer bytes were written than requested
    ShortWrite,
    /// A frame did not match the expected layout
    MalformedFrame,
    /// A response report was too small to carry a payload count
    ResponseTooSmall,
    /// A data report declared a zero payload count
    InputCountZero,
    /// A data report declared more payload than the frame holds
    Underflow,
    /// The request does not fit in a single transfer
    RequestTooLarge,
    /// A byte was never acknowledged after the allowed retries
    RetriesExhausted,
    /// The device node went away (unplug or re-enumeration)
    Disconnected,
    /// Operating system I/O error
    Io,
}

/// Failures while decoding or validating a firmware image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Image is smaller than the fixed header
    TooSmall,
    /// Image length is not a multiple of 16 bits
    NotAligned,
    /// Stored checksum does not match the computed one
    ChecksumInvalid {
        /// Checksum stored at offset 0
        stored: u32,
        /// Checksum computed over bytes 4..
        computed: u32,
    },
    /// A field or sub-image lies outside the buffer
    OutOfBounds {
        /// Offset of the access
        offset: u32,
        /// Length of the access
        len: u32,
    },
    /// The top-level container descriptor has the wrong id
    InvalidContainerId(u16),
    /// The container table declares more entries than allowed
    TooManyContainers(u32),
    /// A container declares an impossible length
    InvalidLength {
        /// Declared length
        length: u32,
        /// Size of the whole image
        size: u32,
    },
    /// The header carries a bootloader version no layout is known for
    UnsupportedBootloaderVersion(u8),
    /// A required sub-image is absent
    MissingImage(&'static str),
    /// Image was built for a different product
    ProductIdMismatch,
    /// A sub-image does not match the device flash geometry
    ImageSizeMismatch {
        /// Sub-image name
        image: &'static str,
        /// Actual size in bytes
        size: u32,
        /// Size derived from the device block counts
        expected: u32,
    },
    /// Device and image disagree about signed updates
    SecurityMismatch {
        /// Device requires signed images
        device_secure: bool,
    },
}

/// Status codes reported by the partition bootloader in the F34 status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Operation is only supported in bootloader mode
    OnlyInBootloader,
    /// Partition id is not supported by the bootloader
    PartitionNotSupported,
    /// Partition is supported but the command is not
    CommandNotSupported,
    /// Invalid block offset
    InvalidOffset,
    /// Invalid transfer
    InvalidTransfer,
    /// Partition has not been erased
    NotErased,
    /// Flash programming key incorrect
    SignatureInvalid,
    /// Bad partition table
    BadPartitionTable,
    /// Transfer checksum failed
    ChecksumFailed,
    /// Flash hardware failure
    HardwareFailure,
    /// Code outside the documented set
    Unknown(u8),
}

impl DeviceStatus {
    /// Decode the low five bits of the status byte; `None` means success
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x1f {
            0x00 => None,
            0x01 => Some(Self::OnlyInBootloader),
            0x02 => Some(Self::PartitionNotSupported),
            0x03 => Some(Self::CommandNotSupported),
            0x04 => Some(Self::InvalidOffset),
            0x05 => Some(Self::InvalidTransfer),
            0x06 => Some(Self::NotErased),
            0x07 => Some(Self::SignatureInvalid),
            0x08 => Some(Self::BadPartitionTable),
            0x09 => Some(Self::ChecksumFailed),
            0x1f => Some(Self::HardwareFailure),
            other => Some(Self::Unknown(other)),
        }
    }
}

/// Bootloader protocol failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// F34 reports a function version no protocol exists for
    UnsupportedFunctionVersion(u8),
    /// The status register never returned to idle
    IdleTimeout {
        /// Decoded command field
        command: u8,
        /// Decoded status field
        status: u8,
        /// Decoded program-enabled flag
        enabled: bool,
    },
    /// Status reads idle but flash programming is not enabled
    IdleNotEnabled,
    /// A flash operation was attempted in runtime mode
    NotInBootloader,
    /// The bootloader reported an error status
    Device(DeviceStatus),
    /// Block size and config length describe an impossible flash config
    InvalidGeometry {
        /// Block size in bytes
        block_size: u16,
        /// Flash config length in blocks
        config_length: u16,
    },
    /// The flash config partition table could not be decoded
    InvalidFlashConfig,
}

/// Signature verification failures, always raised before erase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationError {
    /// A signature did not verify against the device key
    SignatureMismatch,
    /// The device requires verification but no verifier was supplied
    NoVerifier,
    /// The device public key could not be read back
    PubkeyUnavailable,
}

/// Core error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Channel failure
    Transport(TransportError),
    /// Firmware image failure
    Parse(ParseError),
    /// Bootloader protocol failure
    Protocol(ProtocolError),
    /// Signature verification failure
    Verification(VerificationError),
    /// The PDT scan did not report the requested function
    FunctionNotFound(u8),
    /// The PDT scan found no functions at all
    NoFunctionsFound,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<VerificationError> for Error {
    fn from(e: VerificationError) -> Self {
        Self::Verification(e)
    }
}

impl From<DeviceStatus> for Error {
    fn from(status: DeviceStatus) -> Self {
        Self::Protocol(ProtocolError::Device(status))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::ShortRead => write!(f, "short read"),
            Self::ShortWrite => write!(f, "short write"),
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::ResponseTooSmall => write!(f, "response too small"),
            Self::InputCountZero => write!(f, "input count zero"),
            Self::Underflow => write!(f, "payload count overruns report"),
            Self::RequestTooLarge => write!(f, "request too large"),
            Self::RetriesExhausted => write!(f, "cannot write byte after retries"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "not enough data to parse header"),
            Self::NotAligned => write!(f, "data not aligned to 16 bits"),
            Self::ChecksumInvalid { stored, computed } => write!(
                f,
                "checksum invalid: stored 0x{:08x}, computed 0x{:08x}",
                stored, computed
            ),
            Self::OutOfBounds { offset, len } => write!(
                f,
                "access of 0x{:x} bytes at 0x{:x} is out of bounds",
                len, offset
            ),
            Self::InvalidContainerId(id) => {
                write!(f, "top-level container id invalid: 0x{:x}", id)
            }
            Self::TooManyContainers(n) => write!(f, "too many containers in file: {}", n),
            Self::InvalidLength { length, size } => {
                write!(f, "length invalid: 0x{:x}, size 0x{:x}", length, size)
            }
            Self::UnsupportedBootloaderVersion(v) => {
                write!(f, "bootloader version 0x{:02x} not supported", v)
            }
            Self::MissingImage(id) => write!(f, "no '{}' image in firmware", id),
            Self::ProductIdMismatch => write!(f, "firmware is for a different product"),
            Self::ImageSizeMismatch {
                image,
                size,
                expected,
            } => write!(
                f,
                "{} image invalid size 0x{:04x}, expected 0x{:04x}",
                image, size, expected
            ),
            Self::SecurityMismatch { device_secure } => {
                if *device_secure {
                    write!(f, "device secure but firmware not secure")
                } else {
                    write!(f, "device not secure but firmware secure")
                }
            }
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnlyInBootloader => write!(f, "operation only supported in bootloader mode"),
            Self::PartitionNotSupported => {
                write!(f, "partition ID is not supported by the bootloader")
            }
            Self::CommandNotSupported => {
                write!(f, "partition supported, but command not supported")
            }
            Self::InvalidOffset => write!(f, "invalid block offset"),
            Self::InvalidTransfer => write!(f, "invalid transfer"),
            Self::NotErased => write!(f, "partition has not been erased"),
            Self::SignatureInvalid => write!(f, "flash programming key incorrect"),
            Self::BadPartitionTable => write!(f, "bad partition table"),
            Self::ChecksumFailed => write!(f, "transfer checksum failed"),
            Self::HardwareFailure => write!(f, "flash hardware failure"),
            Self::Unknown(code) => write!(f, "unknown flash status 0x{:02x}", code),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFunctionVersion(v) => {
                write!(f, "f34 function version 0x{:02x} unsupported", v)
            }
            Self::IdleTimeout {
                command,
                status,
                enabled,
            } => write!(
                f,
                "timed out waiting for idle [cmd:0x{:x}, sta:0x{:x}, ena:{}]",
                command, status, *enabled as u8
            ),
            Self::IdleNotEnabled => write!(f, "idle but enabled unset"),
            Self::NotInBootloader => write!(f, "not in bootloader mode, detach first"),
            Self::Device(status) => write!(f, "{}", status),
            Self::InvalidGeometry {
                block_size,
                config_length,
            } => write!(
                f,
                "block size 0x{:x} or config length 0x{:x} invalid",
                block_size, config_length
            ),
            Self::InvalidFlashConfig => write!(f, "flash config partition table invalid"),
        }
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignatureMismatch => write!(f, "signature verification failed"),
            Self::NoVerifier => write!(f, "device requires signed firmware but no verifier"),
            Self::PubkeyUnavailable => write!(f, "failed to read device public key"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Parse(e) => write!(f, "firmware invalid: {}", e),
            Self::Protocol(e) => write!(f, "bootloader error: {}", e),
            Self::Verification(e) => write!(f, "verification failed: {}", e),
            Self::FunctionNotFound(id) => write!(f, "failed to get RMI function 0x{:02x}", id),
            Self::NoFunctionsFound => write!(f, "no RMI functions found in PDT"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
