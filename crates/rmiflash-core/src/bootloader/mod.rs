//! F34 bootloader protocols
//!
//! F34 comes in two families. Function versions 0 and 1 move fixed-size
//! blocks through a data window and report progress in a command/status
//! register ([`LegacyProtocol`]). Function version 2 addresses named flash
//! partitions and can move many blocks per command ([`PartitionProtocol`]).
//! [`BootloaderVariant`] picks the family from the PDT and forwards every
//! call to it.

pub mod legacy;
pub mod partition;
pub mod status;

use alloc::vec::Vec;
use core::fmt;

pub use legacy::LegacyProtocol;
pub use partition::PartitionProtocol;
pub use status::{FlashStatus, StatusLayout};

use crate::device::RmiDevice;
use crate::error::{ProtocolError, Result};
use crate::firmware::FirmwareContainer;
use crate::params::FlashParameters;
use crate::transport::{Delay, RegisterTransport};
use crate::update::{PlannedStep, Step, UpdateSession};

/// Protocol family selected from the F34 function version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderVariant {
    /// F34 version 0, block protocol with packed status
    Legacy,
    /// F34 version 1, block protocol with split status
    LegacySplit,
    /// F34 version 2, partition protocol
    PartitionV7,
}

impl BootloaderVariant {
    /// Map the F34 function version to a protocol
    pub fn from_function_version(version: u8) -> Result<Self> {
        match version {
            0x0 => Ok(Self::Legacy),
            0x1 => Ok(Self::LegacySplit),
            0x2 => Ok(Self::PartitionV7),
            v => Err(ProtocolError::UnsupportedFunctionVersion(v).into()),
        }
    }

    /// True for the partition addressed protocol
    pub const fn is_partitioned(self) -> bool {
        matches!(self, Self::PartitionV7)
    }

    /// Layout of the command/status register
    pub const fn status_layout(self) -> StatusLayout {
        match self {
            Self::LegacySplit => StatusLayout::Split,
            _ => StatusLayout::Packed,
        }
    }

    /// Offset of the block data window (and the bootloader id) from F34 data base
    pub const fn block_data_offset(self) -> u16 {
        match self {
            Self::Legacy => 2,
            Self::LegacySplit | Self::PartitionV7 => 1,
        }
    }

    /// Read flash parameters into `dev`
    pub fn setup<T: RegisterTransport, D: Delay>(self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.setup(dev),
            Self::PartitionV7 => PartitionProtocol.setup(dev),
        }
    }

    /// Whether the device is running its bootloader
    pub fn query_status<T: RegisterTransport, D: Delay>(
        self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<bool> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.query_status(dev),
            Self::PartitionV7 => PartitionProtocol.query_status(dev),
        }
    }

    /// Switch the device from runtime to bootloader mode
    pub fn detach<T: RegisterTransport, D: Delay>(self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.detach(dev),
            Self::PartitionV7 => PartitionProtocol.detach(dev),
        }
    }

    /// Steps needed to write `fw` to a device with `params`
    pub fn plan(
        self,
        params: &FlashParameters,
        fw: &FirmwareContainer,
    ) -> Result<Vec<PlannedStep>> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.plan(params, fw),
            Self::PartitionV7 => PartitionProtocol.plan(params, fw),
        }
    }

    /// Checks done once in bootloader mode before the first step
    pub fn begin<T: RegisterTransport, D: Delay>(self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.begin(dev),
            Self::PartitionV7 => PartitionProtocol.begin(dev),
        }
    }

    /// Execute one planned step
    pub fn run_step<T: RegisterTransport, D: Delay>(
        self,
        dev: &mut RmiDevice<T, D>,
        step: Step,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        match self {
            Self::Legacy | Self::LegacySplit => LegacyProtocol.run_step(dev, step, fw, session),
            Self::PartitionV7 => PartitionProtocol.run_step(dev, step, fw, session),
        }
    }
}

impl fmt::Display for BootloaderVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "v5"),
            Self::LegacySplit => write!(f, "v6"),
            Self::PartitionV7 => write!(f, "v7"),
        }
    }
}

/// Operations every F34 protocol family provides
pub trait BootloaderProtocol {
    /// Read the flash geometry and store it in the device parameters
    fn setup<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()>;

    /// Whether the device is running its bootloader
    fn query_status<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>)
        -> Result<bool>;

    /// Unlock flash programming, the device drops into its bootloader
    fn detach<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()>;

    /// Ordered steps for writing `fw`, with progress weights
    fn plan(&self, params: &FlashParameters, fw: &FirmwareContainer) -> Result<Vec<PlannedStep>>;

    /// Checks run in bootloader mode before the plan starts
    fn begin<T: RegisterTransport, D: Delay>(&self, _dev: &mut RmiDevice<T, D>) -> Result<()> {
        Ok(())
    }

    /// Execute `step`
    fn run_step<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        step: Step,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()>;
}

/// Flash partitions of the partition bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartitionId {
    /// Terminates the partition table
    None = 0x00,
    /// Bootloader
    Bootloader = 0x01,
    /// Device configuration
    DeviceConfig = 0x02,
    /// Partition table
    FlashConfig = 0x03,
    /// Manufacturing block
    ManufacturingBlock = 0x04,
    /// Guest serialization
    GuestSerialization = 0x05,
    /// Global parameters
    GlobalParameters = 0x06,
    /// Application code
    CoreCode = 0x07,
    /// Application configuration
    CoreConfig = 0x08,
    /// Guest code
    GuestCode = 0x09,
    /// Display configuration
    DisplayConfig = 0x0a,
    /// External touch AFE configuration
    ExternalTouchAfeConfig = 0x0b,
    /// Utility parameters
    UtilityParameter = 0x0c,
    /// Public key used for signed updates
    Pubkey = 0x0d,
    /// Fixed location data
    FixedLocationData = 0x0e,
}

impl PartitionId {
    /// Decode a partition id from the partition table
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x00 => Self::None,
            0x01 => Self::Bootloader,
            0x02 => Self::DeviceConfig,
            0x03 => Self::FlashConfig,
            0x04 => Self::ManufacturingBlock,
            0x05 => Self::GuestSerialization,
            0x06 => Self::GlobalParameters,
            0x07 => Self::CoreCode,
            0x08 => Self::CoreConfig,
            0x09 => Self::GuestCode,
            0x0a => Self::DisplayConfig,
            0x0b => Self::ExternalTouchAfeConfig,
            0x0c => Self::UtilityParameter,
            0x0d => Self::Pubkey,
            0x0e => Self::FixedLocationData,
            _ => return None,
        })
    }

    /// Raw id written to the partition id register
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Short name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bootloader => "bootloader",
            Self::DeviceConfig => "device-config",
            Self::FlashConfig => "flash-config",
            Self::ManufacturingBlock => "manufacturing-block",
            Self::GuestSerialization => "guest-serialization",
            Self::GlobalParameters => "global-parameters",
            Self::CoreCode => "core-code",
            Self::CoreConfig => "core-config",
            Self::GuestCode => "guest-code",
            Self::DisplayConfig => "display-config",
            Self::ExternalTouchAfeConfig => "external-touch-afe-config",
            Self::UtilityParameter => "utility-parameter",
            Self::Pubkey => "pubkey",
            Self::FixedLocationData => "fixed-location-data",
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_variant_from_version() {
        assert_eq!(
            BootloaderVariant::from_function_version(0).unwrap(),
            BootloaderVariant::Legacy
        );
        assert_eq!(
            BootloaderVariant::from_function_version(2).unwrap(),
            BootloaderVariant::PartitionV7
        );
        assert_eq!(
            BootloaderVariant::from_function_version(3),
            Err(Error::Protocol(ProtocolError::UnsupportedFunctionVersion(3)))
        );
    }

    #[test]
    fn test_variant_layouts() {
        assert_eq!(BootloaderVariant::Legacy.status_layout(), StatusLayout::Packed);
        assert_eq!(BootloaderVariant::LegacySplit.status_layout(), StatusLayout::Split);
        assert_eq!(BootloaderVariant::Legacy.block_data_offset(), 2);
        assert_eq!(BootloaderVariant::LegacySplit.block_data_offset(), 1);
        assert!(!BootloaderVariant::LegacySplit.is_partitioned());
        assert!(BootloaderVariant::PartitionV7.is_partitioned());
    }

    #[test]
    fn test_partition_id_roundtrip() {
        for raw in 0..=0x0e {
            let id = PartitionId::from_raw(raw).unwrap();
            assert_eq!(u16::from(id.raw()), raw);
        }
        assert_eq!(PartitionId::from_raw(0x0f), None);
        assert_eq!(PartitionId::CoreCode.name(), "core-code");
    }
}
