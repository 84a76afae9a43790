//! Flash geometry reported by the bootloader
//!
//! [`FlashParameters`] is filled in by the protocol specific setup step and
//! read by everything that sizes a transfer or checks an image against the
//! device.

use alloc::vec::Vec;

use crate::bootloader::PartitionId;
use crate::error::{ParseError, Result};
use crate::firmware::{FirmwareContainer, IMAGE_CONFIG, IMAGE_UI};

/// One entry of the partition table read from the flash config partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Partition id
    pub id: PartitionId,
    /// Length in blocks
    pub length: u16,
    /// Start address in blocks
    pub address: u16,
    /// Property bits
    pub properties: u16,
}

/// Flash layout of one device session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashParameters {
    /// Bootloader id bytes, byte 1 is the bootloader major version
    pub bootloader_id: [u8; 2],
    /// Bytes per flash block
    pub block_size: u16,
    /// Blocks of firmware code
    pub block_count_fw: u16,
    /// Blocks of configuration
    pub block_count_cfg: u16,
    /// Address of the F34 command/status register
    pub status_addr: u16,
    /// Size of the legacy ui signature the device expects, zero if unsigned
    pub sig_size: u16,
    /// Build id of the running firmware
    pub build_id: u32,
    /// Flash config partition length in blocks
    pub config_length: u16,
    /// Blocks transferred per write command
    pub payload_length: u16,
    /// Bitmap of supported partitions
    pub supported_partitions: u16,
    /// The device carries a public key partition
    pub has_pubkey: bool,
    /// The partition table lists a bootloader partition
    pub has_sbl: bool,
    /// Partition table, empty for block based bootloaders
    pub partitions: Vec<Partition>,
}

impl FlashParameters {
    /// Bootloader major version
    pub fn bootloader_major(&self) -> u8 {
        self.bootloader_id[1]
    }

    /// The device only accepts signed images
    pub fn has_security(&self) -> bool {
        self.sig_size != 0 || self.has_pubkey
    }

    /// Bytes moved by one partition write command
    pub fn transfer_size(&self) -> usize {
        usize::from(self.payload_length.max(1)) * usize::from(self.block_size)
    }

    /// Partition table entry for `id`
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// Check that `fw` fits this device
    ///
    /// Sizes must be exact: `ui` fills the firmware blocks and `config` the
    /// config blocks. Partitioned bootloaders take both counts from their
    /// partition table. A signature is a separate image and not part of `ui`.
    /// The product id must match unless `force` is set.
    pub fn check_firmware(
        &self,
        fw: &FirmwareContainer,
        device_product_id: &str,
        force: bool,
    ) -> Result<()> {
        let fw_product_id = fw.product_id_str();
        if !fw_product_id.is_empty() && !device_product_id.starts_with(fw_product_id) {
            if !force {
                return Err(ParseError::ProductIdMismatch.into());
            }
            log::warn!(
                "firmware is for {}, device is {}, continuing anyway",
                fw_product_id,
                device_product_id
            );
        }

        let block_size = u32::from(self.block_size);
        let ui = fw.require(IMAGE_UI)?;
        let expected = u32::from(self.block_count_fw) * block_size;
        if ui.len() as u32 != expected {
            return Err(ParseError::ImageSizeMismatch {
                image: IMAGE_UI,
                size: ui.len() as u32,
                expected,
            }
            .into());
        }

        let config = fw.require(IMAGE_CONFIG)?;
        let expected = u32::from(self.block_count_cfg) * block_size;
        if config.len() as u32 != expected {
            return Err(ParseError::ImageSizeMismatch {
                image: IMAGE_CONFIG,
                size: config.len() as u32,
                expected,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::firmware::header::ContainerId;
    use crate::firmware::{build_legacy, ContainerBuilder};

    fn legacy_params() -> FlashParameters {
        FlashParameters {
            block_size: 16,
            block_count_fw: 4,
            block_count_cfg: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_sizes_match() {
        let blob = build_legacy("TM3000", &[0u8; 64], &[0u8; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        legacy_params()
            .check_firmware(&fw, "TM3000-001", false)
            .unwrap();
    }

    #[test]
    fn test_ui_size_mismatch() {
        let blob = build_legacy("TM3000", &[0u8; 48], &[0u8; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        assert_eq!(
            legacy_params().check_firmware(&fw, "TM3000", false),
            Err(Error::Parse(ParseError::ImageSizeMismatch {
                image: IMAGE_UI,
                size: 48,
                expected: 64,
            }))
        );
    }

    #[test]
    fn test_config_size_mismatch() {
        let blob = build_legacy("TM3000", &[0u8; 64], &[0u8; 16]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        assert!(matches!(
            legacy_params().check_firmware(&fw, "TM3000", false),
            Err(Error::Parse(ParseError::ImageSizeMismatch { image: "config", .. }))
        ));
    }

    #[test]
    fn test_product_id_mismatch_unless_forced() {
        let blob = build_legacy("TM3000", &[0u8; 64], &[0u8; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        let params = legacy_params();
        assert_eq!(
            params.check_firmware(&fw, "TM9999", false),
            Err(Error::Parse(ParseError::ProductIdMismatch))
        );
        params
            .check_firmware(&fw, "TM9999", true)
            .unwrap();
    }

    #[test]
    fn test_partition_table_sizes_enforced() {
        let params = FlashParameters {
            block_size: 16,
            block_count_fw: 4,
            block_count_cfg: 2,
            ..Default::default()
        };
        let blob = ContainerBuilder::new("TM3000")
            .container(ContainerId::CoreCode, &[0u8; 96])
            .container(ContainerId::CoreConfig, &[0u8; 32])
            .build()
            .unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        assert_eq!(
            params.check_firmware(&fw, "TM3000", false),
            Err(Error::Parse(ParseError::ImageSizeMismatch {
                image: IMAGE_UI,
                size: 96,
                expected: 64,
            }))
        );
    }
}
