//! Firmware container codec
//!
//! Two layouts exist. Bootloader versions 2 to 6 use a flat image: a fixed
//! header followed by the `ui` and `config` images back to back. Version 16
//! uses a hierarchical layout where a top-level descriptor lists the
//! descriptors of every sub-image. Both are decoded into a
//! [`FirmwareContainer`], a flat map of named sub-images.

mod builder;
pub mod checksum;
pub mod header;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::error::{ParseError, Result};
pub use builder::{build_container_v10, build_legacy, build_legacy_signed, ContainerBuilder};
use header::{
    ContainerDescriptor, ContainerId, ImageHeader, DESCRIPTOR_SIZE, FW_OFFSET,
    GENERAL_INFO_PRODUCT_ID_OFFSET, MAX_CONTAINERS, PRODUCT_ID_LENGTH,
};

/// Main firmware image
pub const IMAGE_UI: &str = "ui";
/// Configuration image
pub const IMAGE_CONFIG: &str = "config";
/// Legacy ui signature
pub const IMAGE_SIG: &str = "sig";
/// Flash configuration partition table
pub const IMAGE_FLASH_CONFIG: &str = "flash-config";
/// Secondary bootloader
pub const IMAGE_SBL: &str = "sbl";
/// Fixed location data
pub const IMAGE_FIXED_LOCATION_DATA: &str = "fixed-location-data";
/// External touch AFE configuration
pub const IMAGE_AFE_CONFIG: &str = "afe-config";
/// Display configuration
pub const IMAGE_DISPLAY_CONFIG: &str = "display-config";

/// Suffix of the detached signature of a sub-image
pub const SIGNATURE_SUFFIX: &str = "-signature";

/// Name of the detached signature image for `id`
pub fn signature_name(id: &str) -> String {
    format!("{}{}", id, SIGNATURE_SUFFIX)
}

/// Container layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Flat image, bootloader versions 2 to 6
    Legacy,
    /// Hierarchical image, bootloader version 16
    Hierarchical,
}

/// A parsed firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareContainer {
    /// Layout the image was decoded from
    pub kind: ContainerKind,
    /// Stored checksum
    pub checksum: u32,
    /// IO flags byte
    pub io: u8,
    /// Bootloader version from the header or the `Bl` container
    pub bootloader_version: u8,
    /// Firmware build id
    pub build_id: u32,
    /// Package id
    pub package_id: u32,
    /// Product info
    pub product_info: u16,
    /// Raw product id, NUL padded
    pub product_id: [u8; PRODUCT_ID_LENGTH],
    /// Legacy ui signature size
    pub sig_size: u32,
    images: BTreeMap<String, Vec<u8>>,
}

impl FirmwareContainer {
    /// Parse an image
    ///
    /// With `force` set a checksum mismatch is logged instead of rejected.
    /// Every offset read from the image is bounds checked before use.
    pub fn parse(data: &[u8], force: bool) -> Result<Self> {
        if data.len() < FW_OFFSET {
            return Err(ParseError::TooSmall.into());
        }
        if data.len() % 2 != 0 {
            return Err(ParseError::NotAligned.into());
        }

        let header = ImageHeader::parse(data)?;
        let stored = header.checksum.get();
        let computed = checksum::checksum(&data[4..]);
        if stored != computed {
            if !force {
                return Err(ParseError::ChecksumInvalid { stored, computed }.into());
            }
            log::warn!(
                "ignoring checksum mismatch, stored 0x{:08x} computed 0x{:08x}",
                stored,
                computed
            );
        }

        let mut fw = Self {
            kind: ContainerKind::Legacy,
            checksum: stored,
            io: header.io,
            bootloader_version: header.bootloader_version,
            build_id: 0,
            package_id: 0,
            product_info: header.product_info.get(),
            product_id: header.product_id,
            sig_size: 0,
            images: BTreeMap::new(),
        };
        if fw.io == 1 {
            fw.build_id = header.build_id.get();
            fw.package_id = header.package_id.get();
        }

        match header.bootloader_version {
            2..=6 => {
                if fw.io & 0x10 != 0 {
                    fw.sig_size = header.signature_size.get();
                }
                fw.parse_legacy(data, &header)?;
            }
            16 => {
                fw.kind = ContainerKind::Hierarchical;
                fw.parse_hierarchical(data, header.config_size.get())?;
            }
            other => return Err(ParseError::UnsupportedBootloaderVersion(other).into()),
        }

        Ok(fw)
    }

    fn parse_legacy(&mut self, data: &[u8], header: &ImageHeader) -> Result<()> {
        let img_sz = header.image_size.get();
        let cfg_sz = header.config_size.get();

        if img_sz > 0 {
            let payload = img_sz.checked_sub(self.sig_size).ok_or(ParseError::InvalidLength {
                length: self.sig_size,
                size: img_sz,
            })?;
            if self.sig_size > 0 {
                let offset = (FW_OFFSET as u32)
                    .checked_add(payload)
                    .ok_or(ParseError::OutOfBounds {
                        offset: payload,
                        len: self.sig_size,
                    })?;
                let sig = slice(data, offset, self.sig_size)?;
                self.insert(IMAGE_SIG, sig);
            }
            let ui = slice(data, FW_OFFSET as u32, payload)?;
            self.insert(IMAGE_UI, ui);
        }
        if cfg_sz > 0 {
            let offset = (FW_OFFSET as u32).checked_add(img_sz).ok_or(ParseError::OutOfBounds {
                offset: img_sz,
                len: cfg_sz,
            })?;
            let config = slice(data, offset, cfg_sz)?;
            self.insert(IMAGE_CONFIG, config);
        }
        Ok(())
    }

    fn parse_hierarchical(&mut self, data: &[u8], cntr_addr: u32) -> Result<()> {
        let sz = data.len() as u32;
        log::debug!("v10 top-level descriptor at 0x{:x}", cntr_addr);

        let top = ContainerDescriptor::parse_at(data, cntr_addr as usize)?;
        let top_id = top.container_id.get();
        if top_id != ContainerId::TopLevel.raw() {
            return Err(ParseError::InvalidContainerId(top_id).into());
        }
        let mut offset = top.content_address.get();
        if offset > sz.saturating_sub((4 + DESCRIPTOR_SIZE) as u32) {
            return Err(ParseError::OutOfBounds { offset, len: 4 }.into());
        }
        let count = top.content_length.get() / 4;
        if count > MAX_CONTAINERS {
            return Err(ParseError::TooManyContainers(count).into());
        }
        log::debug!("offset=0x{:x} (count={})", offset, count);

        let mut general_product_id = [0u8; PRODUCT_ID_LENGTH];
        for _ in 0..count {
            let addr = read_u32(data, offset)?;
            let desc = ContainerDescriptor::parse_at(data, addr as usize)?;
            let raw_id = desc.container_id.get();
            let content_addr = desc.content_address.get();
            let length = desc.content_length.get();
            log::debug!(
                "container 0x{:02x} @ 0x{:x} (len 0x{:x})",
                raw_id,
                content_addr,
                length
            );
            if length == 0 || length > sz {
                return Err(ParseError::InvalidLength { length, size: sz }.into());
            }
            if content_addr > sz - length {
                return Err(ParseError::OutOfBounds {
                    offset: content_addr,
                    len: length,
                }
                .into());
            }

            let image_name = match ContainerId::from_raw(raw_id) {
                Some(ContainerId::Bl) => {
                    self.bootloader_version = data[content_addr as usize];
                    None
                }
                Some(ContainerId::Ui) | Some(ContainerId::CoreCode) => Some(IMAGE_UI),
                Some(ContainerId::FlashConfig) => Some(IMAGE_FLASH_CONFIG),
                Some(ContainerId::UiConfig) | Some(ContainerId::CoreConfig) => Some(IMAGE_CONFIG),
                Some(ContainerId::BlImage) => Some(IMAGE_SBL),
                Some(ContainerId::FixedLocationData) => Some(IMAGE_FIXED_LOCATION_DATA),
                Some(ContainerId::ExternalTouchAfeConfig) => Some(IMAGE_AFE_CONFIG),
                Some(ContainerId::DisplayConfig) => Some(IMAGE_DISPLAY_CONFIG),
                Some(ContainerId::GeneralInformation) => {
                    if (length as usize) < GENERAL_INFO_PRODUCT_ID_OFFSET + PRODUCT_ID_LENGTH {
                        return Err(ParseError::InvalidLength { length, size: sz }.into());
                    }
                    self.io = 1;
                    self.package_id = read_u32(data, content_addr)?;
                    self.build_id = read_u32(data, content_addr + 4)?;
                    let start = content_addr as usize + GENERAL_INFO_PRODUCT_ID_OFFSET;
                    general_product_id.copy_from_slice(&data[start..start + PRODUCT_ID_LENGTH]);
                    None
                }
                Some(other) => {
                    log::debug!("unsupported container {} [0x{:02x}]", other.name(), raw_id);
                    None
                }
                None => {
                    log::debug!("unknown container 0x{:02x}", raw_id);
                    None
                }
            };

            if let Some(name) = image_name {
                self.insert(name, slice(data, content_addr, length)?);
                let sig_len = desc.signature_size.get();
                if sig_len > 0 {
                    let sig = slice(data, content_addr + length, sig_len)?;
                    self.images.insert(signature_name(name), sig.to_vec());
                }
            }
            offset += 4;
        }

        if general_product_id[0] != 0 {
            self.product_id = general_product_id;
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, data: &[u8]) {
        self.images.insert(name.to_string(), data.to_vec());
    }

    /// Look up a sub-image by name
    pub fn image(&self, name: &str) -> Option<&[u8]> {
        self.images.get(name).map(Vec::as_slice)
    }

    /// Look up a sub-image that must be present
    pub fn require(&self, name: &'static str) -> Result<&[u8]> {
        self.image(name).ok_or_else(|| ParseError::MissingImage(name).into())
    }

    /// Iterate over all sub-images in name order
    pub fn images(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.images.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of sub-images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Product id with trailing NUL padding removed
    pub fn product_id_str(&self) -> &str {
        product_id_to_str(&self.product_id)
    }
}

impl fmt::Display for FirmwareContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kind:              {:?}", self.kind)?;
        writeln!(f, "ProductId:         {}", self.product_id_str())?;
        writeln!(f, "BootloaderVersion: 0x{:x}", self.bootloader_version)?;
        writeln!(f, "IO:                0x{:x}", self.io)?;
        writeln!(f, "Checksum:          0x{:08x}", self.checksum)?;
        writeln!(f, "BuildId:           0x{:x}", self.build_id)?;
        writeln!(f, "PackageId:         0x{:x}", self.package_id)?;
        writeln!(f, "ProductInfo:       0x{:x}", self.product_info)?;
        write!(f, "SigSize:           0x{:x}", self.sig_size)
    }
}

/// Decode a NUL padded product id
pub fn product_id_to_str(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..end]).unwrap_or("")
}

fn slice(data: &[u8], offset: u32, len: u32) -> Result<&[u8]> {
    let err = ParseError::OutOfBounds { offset, len };
    let start = offset as usize;
    let end = start.checked_add(len as usize).ok_or(err)?;
    data.get(start..end).ok_or_else(|| err.into())
}

fn read_u32(data: &[u8], offset: u32) -> Result<u32> {
    let bytes = slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use alloc::vec;

    fn finalize(buf: &mut [u8]) {
        let sum = checksum::checksum(&buf[4..]);
        buf[0..4].copy_from_slice(&sum.to_le_bytes());
    }

    fn legacy_image(ui: &[u8], config: &[u8], sig: &[u8]) -> Vec<u8> {
        let img_sz = ui.len() + sig.len();
        let mut buf = vec![0u8; FW_OFFSET + img_sz + config.len()];
        buf[0x06] = if sig.is_empty() { 0 } else { 0x10 };
        buf[0x07] = 2;
        buf[0x08..0x0c].copy_from_slice(&(img_sz as u32).to_le_bytes());
        buf[0x0c..0x10].copy_from_slice(&(config.len() as u32).to_le_bytes());
        buf[0x10..0x16].copy_from_slice(b"TM3000");
        buf[0x54..0x58].copy_from_slice(&(sig.len() as u32).to_le_bytes());
        buf[FW_OFFSET..FW_OFFSET + ui.len()].copy_from_slice(ui);
        buf[FW_OFFSET + ui.len()..FW_OFFSET + img_sz].copy_from_slice(sig);
        buf[FW_OFFSET + img_sz..].copy_from_slice(config);
        finalize(&mut buf);
        buf
    }

    #[test]
    fn test_parse_legacy() {
        let buf = legacy_image(&[0x11; 64], &[0x22; 32], &[]);
        let fw = FirmwareContainer::parse(&buf, false).unwrap();
        assert_eq!(fw.kind, ContainerKind::Legacy);
        assert_eq!(fw.product_id_str(), "TM3000");
        assert_eq!(fw.image(IMAGE_UI), Some(&[0x11; 64][..]));
        assert_eq!(fw.image(IMAGE_CONFIG), Some(&[0x22; 32][..]));
        assert_eq!(fw.image(IMAGE_SIG), None);
        assert_eq!(fw.checksum, checksum::checksum(&buf[4..]));
    }

    #[test]
    fn test_parse_legacy_signed() {
        let buf = legacy_image(&[0x11; 32], &[0x22; 16], &[0x33; 8]);
        let fw = FirmwareContainer::parse(&buf, false).unwrap();
        assert_eq!(fw.sig_size, 8);
        assert_eq!(fw.image(IMAGE_UI), Some(&[0x11; 32][..]));
        assert_eq!(fw.image(IMAGE_SIG), Some(&[0x33; 8][..]));
        assert_eq!(fw.image(IMAGE_CONFIG), Some(&[0x22; 16][..]));
    }

    #[test]
    fn test_checksum_enforced() {
        let good = legacy_image(&[0x11; 64], &[0x22; 32], &[]);
        for offset in [4usize, 0x10, 0x57, FW_OFFSET, good.len() - 1] {
            let mut bad = good.clone();
            bad[offset] ^= 0x5a;
            assert!(matches!(
                FirmwareContainer::parse(&bad, false),
                Err(Error::Parse(ParseError::ChecksumInvalid { .. }))
            ));
        }
        let mut bad = good.clone();
        bad[FW_OFFSET] ^= 0x5a;
        let fw = FirmwareContainer::parse(&bad, true).unwrap();
        assert_eq!(fw.image(IMAGE_UI).map(|ui| ui[0]), Some(0x11 ^ 0x5a));
    }

    #[test]
    fn test_declared_size_beyond_buffer() {
        let mut buf = legacy_image(&[0x11; 64], &[0x22; 32], &[]);
        buf[0x08..0x0c].copy_from_slice(&0xffff_fff0u32.to_le_bytes());
        finalize(&mut buf);
        assert!(matches!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_signature_offset_overflow() {
        let mut buf = legacy_image(&[0x11; 64], &[0x22; 32], &[0x33; 2]);
        buf[0x08..0x0c].copy_from_slice(&u32::MAX.to_le_bytes());
        buf[0x54..0x58].copy_from_slice(&1u32.to_le_bytes());
        finalize(&mut buf);
        assert_eq!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::OutOfBounds {
                offset: 0xffff_fffe,
                len: 1
            }))
        );
    }

    #[test]
    fn test_too_small_and_unaligned() {
        assert_eq!(
            FirmwareContainer::parse(&[0u8; 0xfe], false),
            Err(Error::Parse(ParseError::TooSmall))
        );
        assert_eq!(
            FirmwareContainer::parse(&[0u8; 0x101], false),
            Err(Error::Parse(ParseError::NotAligned))
        );
    }

    #[test]
    fn test_unsupported_bootloader_version() {
        let mut buf = legacy_image(&[0x11; 4], &[0x22; 4], &[]);
        buf[0x07] = 7;
        finalize(&mut buf);
        assert_eq!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::UnsupportedBootloaderVersion(7)))
        );
    }

    #[test]
    fn test_parse_generated_v10() {
        let buf = build_container_v10("Example", &0xfeedu32.to_le_bytes()).unwrap();
        let fw = FirmwareContainer::parse(&buf, false).unwrap();
        assert_eq!(fw.kind, ContainerKind::Hierarchical);
        assert_eq!(fw.image_count(), 1);
        assert_eq!(fw.image(IMAGE_FLASH_CONFIG).map(<[u8]>::len), Some(4));
        assert_eq!(&fw.product_id, b"Example\0\0\0");
        assert_eq!(fw.build_id, 0x1234);
        assert_eq!(fw.package_id, 0x4321);
        assert_eq!(fw.product_info, 0x3456);
    }

    #[test]
    fn test_parse_generated_legacy() {
        let buf = build_legacy("Example", &[0xad, 0xde, 0, 0], &[0xef, 0xbe, 0, 0]).unwrap();
        let fw = FirmwareContainer::parse(&buf, false).unwrap();
        assert_eq!(fw.image(IMAGE_UI), Some(&[0xad, 0xde, 0, 0][..]));
        assert_eq!(fw.image(IMAGE_CONFIG), Some(&[0xef, 0xbe, 0, 0][..]));
        assert_eq!(fw.product_info, 0x1234);
    }

    /// Image with a general information block, a signed core code container
    /// and one container type that is skipped
    fn hierarchical_image() -> Vec<u8> {
        let mut buf = vec![0u8; 0x300];
        buf[0x06] = 0x01;
        buf[0x07] = 16;
        buf[0x0c..0x10].copy_from_slice(&0x100u32.to_le_bytes());
        buf[0x10..0x16].copy_from_slice(b"HEADER");

        let put_desc = |buf: &mut [u8], at: usize, id: u16, len: u32, addr: u32, sig: u32| {
            let d = ContainerDescriptor {
                container_id: id.into(),
                signature_size: sig.into(),
                content_length: len.into(),
                content_address: addr.into(),
                ..Default::default()
            };
            buf[at..at + DESCRIPTOR_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&d));
        };

        put_desc(&mut buf, 0x100, 0, 12, 0x120, 0);
        buf[0x120..0x124].copy_from_slice(&0x140u32.to_le_bytes());
        buf[0x124..0x128].copy_from_slice(&0x160u32.to_le_bytes());
        buf[0x128..0x12c].copy_from_slice(&0x180u32.to_le_bytes());

        put_desc(&mut buf, 0x140, ContainerId::GeneralInformation.raw(), 0x22, 0x200, 0);
        buf[0x200..0x204].copy_from_slice(&0xaabbu32.to_le_bytes());
        buf[0x204..0x208].copy_from_slice(&0x5678u32.to_le_bytes());
        buf[0x218..0x220].copy_from_slice(b"S3908-10");

        put_desc(&mut buf, 0x160, ContainerId::CoreCode.raw(), 0x10, 0x240, 0x08);
        buf[0x240..0x250].fill(0x77);
        buf[0x250..0x258].fill(0x99);

        put_desc(&mut buf, 0x180, ContainerId::Utility.raw(), 0x04, 0x280, 0);
        finalize(&mut buf);
        buf
    }

    #[test]
    fn test_parse_hierarchical_extras() {
        let fw = FirmwareContainer::parse(&hierarchical_image(), false).unwrap();
        assert_eq!(fw.product_id_str(), "S3908-10");
        assert_eq!(fw.package_id, 0xaabb);
        assert_eq!(fw.build_id, 0x5678);
        assert_eq!(fw.image(IMAGE_UI), Some(&[0x77; 0x10][..]));
        assert_eq!(fw.image("ui-signature"), Some(&[0x99; 8][..]));
        assert_eq!(fw.image_count(), 2);
    }

    #[test]
    fn test_hierarchical_bad_top_level_id() {
        let mut buf = hierarchical_image();
        buf[0x104] = 5;
        finalize(&mut buf);
        assert_eq!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::InvalidContainerId(5)))
        );
    }

    #[test]
    fn test_hierarchical_too_many_containers() {
        let mut buf = hierarchical_image();
        buf[0x100 + 0x18..0x100 + 0x1c].copy_from_slice(&(1025u32 * 4).to_le_bytes());
        finalize(&mut buf);
        assert_eq!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::TooManyContainers(1025)))
        );
    }

    #[test]
    fn test_hierarchical_content_out_of_range() {
        let mut buf = hierarchical_image();
        // core code content address pushed past the end
        buf[0x160 + 0x1c..0x160 + 0x20].copy_from_slice(&0x2f8u32.to_le_bytes());
        finalize(&mut buf);
        assert!(matches!(
            FirmwareContainer::parse(&buf, false),
            Err(Error::Parse(ParseError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_require_missing_image() {
        let fw = FirmwareContainer::parse(&hierarchical_image(), false).unwrap();
        assert_eq!(
            fw.require(IMAGE_CONFIG),
            Err(Error::Parse(ParseError::MissingImage(IMAGE_CONFIG)))
        );
    }
}
