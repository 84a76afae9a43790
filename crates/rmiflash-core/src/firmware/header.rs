//! On-disk layouts of the firmware image header and container descriptors

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{ParseError, Result};

/// Offset of the payload area, also the minimum image size
pub const FW_OFFSET: usize = 0x100;
/// Length of the product id string
pub const PRODUCT_ID_LENGTH: usize = 10;
/// Upper bound on entries in the top-level container table
pub const MAX_CONTAINERS: u32 = 1024;
/// Offset of the general information product id within its content
pub const GENERAL_INFO_PRODUCT_ID_OFFSET: usize = 0x18;

/// Fixed header at the start of every image
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ImageHeader {
    /// Checksum over bytes 4..
    pub checksum: U32,
    /// Reserved
    pub reserved_04: [u8; 2],
    /// IO flags: 1 means build and package id are present, bit 4 signed
    pub io: u8,
    /// Bootloader version selecting the layout
    pub bootloader_version: u8,
    /// Legacy: size of the ui image including its signature
    pub image_size: U32,
    /// Legacy: size of the config image. Hierarchical: top-level descriptor address
    pub config_size: U32,
    /// Product id, NUL padded
    pub product_id: [u8; PRODUCT_ID_LENGTH],
    /// Package id
    pub package_id: U32,
    /// Product info
    pub product_info: U16,
    /// Reserved
    pub reserved_20: [u8; 0x30],
    /// Firmware build id
    pub build_id: U32,
    /// Legacy: size of the trailing ui signature
    pub signature_size: U32,
}

/// Descriptor of one hierarchical container
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ContainerDescriptor {
    /// Checksum of the content
    pub content_checksum: U32,
    /// Container id, see [`ContainerId`]
    pub container_id: U16,
    /// Minor version
    pub minor_version: u8,
    /// Major version
    pub major_version: u8,
    /// Size of a signature stored directly after the content
    pub signature_size: U32,
    /// Option flags
    pub container_option_flags: U32,
    /// Options length
    pub content_options_length: U32,
    /// Options address
    pub content_options_address: U32,
    /// Content length in bytes
    pub content_length: U32,
    /// Content address from the start of the image
    pub content_address: U32,
}

/// Size of an encoded descriptor
pub const DESCRIPTOR_SIZE: usize = core::mem::size_of::<ContainerDescriptor>();

impl ImageHeader {
    /// Decode the header at the start of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, _) = Self::read_from_prefix(data).map_err(|_| ParseError::TooSmall)?;
        Ok(header)
    }
}

impl ContainerDescriptor {
    /// Decode the descriptor at `offset`
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self> {
        let tail = data.get(offset..).ok_or(ParseError::OutOfBounds {
            offset: offset as u32,
            len: DESCRIPTOR_SIZE as u32,
        })?;
        let (desc, _) = Self::read_from_prefix(tail).map_err(|_| ParseError::OutOfBounds {
            offset: offset as u32,
            len: DESCRIPTOR_SIZE as u32,
        })?;
        Ok(desc)
    }
}

/// Known container ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ContainerId {
    TopLevel,
    Ui,
    UiConfig,
    Bl,
    BlImage,
    BlConfig,
    BlLockdownInfo,
    PermanentConfig,
    GuestCode,
    BlProtocolDescriptor,
    UiProtocolDescriptor,
    RmiSelfDiscovery,
    RmiPageContent,
    GeneralInformation,
    DeviceConfig,
    FlashConfig,
    GuestSerialization,
    GlobalParameters,
    CoreCode,
    CoreConfig,
    DisplayConfig,
    ExternalTouchAfeConfig,
    Utility,
    UtilityParameter,
    FixedLocationData,
}

impl ContainerId {
    /// Map a raw id, `None` for ids without a known meaning
    pub fn from_raw(id: u16) -> Option<Self> {
        Some(match id {
            0 => Self::TopLevel,
            1 => Self::Ui,
            2 => Self::UiConfig,
            3 => Self::Bl,
            4 => Self::BlImage,
            5 => Self::BlConfig,
            6 => Self::BlLockdownInfo,
            7 => Self::PermanentConfig,
            8 => Self::GuestCode,
            9 => Self::BlProtocolDescriptor,
            10 => Self::UiProtocolDescriptor,
            11 => Self::RmiSelfDiscovery,
            12 => Self::RmiPageContent,
            13 => Self::GeneralInformation,
            14 => Self::DeviceConfig,
            15 => Self::FlashConfig,
            16 => Self::GuestSerialization,
            17 => Self::GlobalParameters,
            18 => Self::CoreCode,
            19 => Self::CoreConfig,
            20 => Self::DisplayConfig,
            21 => Self::ExternalTouchAfeConfig,
            22 => Self::Utility,
            23 => Self::UtilityParameter,
            27 => Self::FixedLocationData,
            _ => return None,
        })
    }

    /// Raw id value
    pub const fn raw(self) -> u16 {
        match self {
            Self::TopLevel => 0,
            Self::Ui => 1,
            Self::UiConfig => 2,
            Self::Bl => 3,
            Self::BlImage => 4,
            Self::BlConfig => 5,
            Self::BlLockdownInfo => 6,
            Self::PermanentConfig => 7,
            Self::GuestCode => 8,
            Self::BlProtocolDescriptor => 9,
            Self::UiProtocolDescriptor => 10,
            Self::RmiSelfDiscovery => 11,
            Self::RmiPageContent => 12,
            Self::GeneralInformation => 13,
            Self::DeviceConfig => 14,
            Self::FlashConfig => 15,
            Self::GuestSerialization => 16,
            Self::GlobalParameters => 17,
            Self::CoreCode => 18,
            Self::CoreConfig => 19,
            Self::DisplayConfig => 20,
            Self::ExternalTouchAfeConfig => 21,
            Self::Utility => 22,
            Self::UtilityParameter => 23,
            Self::FixedLocationData => 27,
        }
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::TopLevel => "top-level",
            Self::Ui => "ui",
            Self::UiConfig => "ui-config",
            Self::Bl => "bl",
            Self::BlImage => "bl-image",
            Self::BlConfig => "bl-config",
            Self::BlLockdownInfo => "bl-lockdown-info",
            Self::PermanentConfig => "permanent-config",
            Self::GuestCode => "guest-code",
            Self::BlProtocolDescriptor => "bl-protocol-descriptor",
            Self::UiProtocolDescriptor => "ui-protocol-descriptor",
            Self::RmiSelfDiscovery => "rmi-self-discovery",
            Self::RmiPageContent => "rmi-page-content",
            Self::GeneralInformation => "general-information",
            Self::DeviceConfig => "device-config",
            Self::FlashConfig => "flash-config",
            Self::GuestSerialization => "guest-serialization",
            Self::GlobalParameters => "global-parameters",
            Self::CoreCode => "core-code",
            Self::CoreConfig => "core-config",
            Self::DisplayConfig => "display-config",
            Self::ExternalTouchAfeConfig => "external-touch-afe-config",
            Self::Utility => "utility",
            Self::UtilityParameter => "utility-parameter",
            Self::FixedLocationData => "fixed-location-data",
        }
    }
}
