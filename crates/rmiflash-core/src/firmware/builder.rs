//! Image generators
//!
//! These produce images in both layouts with a valid checksum, for tests,
//! for the emulated device and for exercising the parser from the command
//! line.

use alloc::vec;
use alloc::vec::Vec;
use zerocopy::IntoBytes;

use super::checksum::checksum;
use super::header::{
    ContainerDescriptor, ContainerId, DESCRIPTOR_SIZE, FW_OFFSET, PRODUCT_ID_LENGTH,
};
use crate::error::{ParseError, Result};

const IO_OFFSET: usize = 0x06;
const BOOTLOADER_VERSION_OFFSET: usize = 0x07;
const IMAGE_SIZE_OFFSET: usize = 0x08;
const CONFIG_SIZE_OFFSET: usize = 0x0c;
const PRODUCT_ID_OFFSET: usize = 0x10;
const PACKAGE_ID_OFFSET: usize = 0x1a;
const PRODUCT_INFO_OFFSET: usize = 0x1e;
const BUILD_ID_OFFSET: usize = 0x50;
const SIGNATURE_SIZE_OFFSET: usize = 0x54;

const IO_HAS_SIGNATURE: u8 = 0x10;

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_product_id(buf: &mut [u8], product_id: &str) -> Result<()> {
    let raw = product_id.as_bytes();
    if raw.len() > PRODUCT_ID_LENGTH {
        return Err(ParseError::InvalidLength {
            length: raw.len() as u32,
            size: PRODUCT_ID_LENGTH as u32,
        }
        .into());
    }
    buf[PRODUCT_ID_OFFSET..PRODUCT_ID_OFFSET + raw.len()].copy_from_slice(raw);
    Ok(())
}

fn pad_and_seal(mut buf: Vec<u8>) -> Vec<u8> {
    if buf.len() % 2 != 0 {
        buf.push(0);
    }
    let sum = checksum(&buf[4..]);
    put_u32(&mut buf, 0, sum);
    buf
}

/// Build a flat image (bootloader version 2) holding `ui` then `config`
pub fn build_legacy(product_id: &str, ui: &[u8], config: &[u8]) -> Result<Vec<u8>> {
    build_legacy_signed(product_id, ui, &[], config)
}

/// Build a flat image with `signature` appended to `ui`
///
/// An empty signature produces an unsigned image.
pub fn build_legacy_signed(
    product_id: &str,
    ui: &[u8],
    signature: &[u8],
    config: &[u8],
) -> Result<Vec<u8>> {
    let image_size = ui.len() + signature.len();
    let mut buf = vec![0u8; FW_OFFSET + image_size + config.len()];
    buf[IO_OFFSET] = if signature.is_empty() { 0x0 } else { IO_HAS_SIGNATURE };
    buf[BOOTLOADER_VERSION_OFFSET] = 2;
    put_product_id(&mut buf, product_id)?;
    put_u16(&mut buf, PRODUCT_INFO_OFFSET, 0x1234);
    put_u32(&mut buf, IMAGE_SIZE_OFFSET, image_size as u32);
    put_u32(&mut buf, CONFIG_SIZE_OFFSET, config.len() as u32);
    put_u32(&mut buf, SIGNATURE_SIZE_OFFSET, signature.len() as u32);
    let sig_at = FW_OFFSET + ui.len();
    let cfg_at = FW_OFFSET + image_size;
    buf[FW_OFFSET..sig_at].copy_from_slice(ui);
    buf[sig_at..cfg_at].copy_from_slice(signature);
    buf[cfg_at..].copy_from_slice(config);
    Ok(pad_and_seal(buf))
}

struct Entry {
    id: ContainerId,
    content: Vec<u8>,
    signature: Vec<u8>,
}

/// Builder for hierarchical (bootloader version 16) images
///
/// Layout: header, top-level descriptor at 0x100, the offset table, one
/// descriptor per container and finally the contents, each directly
/// followed by its signature.
pub struct ContainerBuilder<'a> {
    product_id: &'a str,
    build_id: u32,
    package_id: u32,
    product_info: u16,
    entries: Vec<Entry>,
}

impl<'a> ContainerBuilder<'a> {
    /// Start an image for `product_id`
    pub fn new(product_id: &'a str) -> Self {
        Self {
            product_id,
            build_id: 0,
            package_id: 0,
            product_info: 0,
            entries: Vec::new(),
        }
    }

    /// Set the header build id
    pub fn with_build_id(mut self, build_id: u32) -> Self {
        self.build_id = build_id;
        self
    }

    /// Set the header package id
    pub fn with_package_id(mut self, package_id: u32) -> Self {
        self.package_id = package_id;
        self
    }

    /// Set the header product info
    pub fn with_product_info(mut self, product_info: u16) -> Self {
        self.product_info = product_info;
        self
    }

    /// Append an unsigned container
    pub fn container(self, id: ContainerId, content: &[u8]) -> Self {
        self.signed_container(id, content, &[])
    }

    /// Append a container followed by its signature
    pub fn signed_container(mut self, id: ContainerId, content: &[u8], signature: &[u8]) -> Self {
        self.entries.push(Entry {
            id,
            content: content.to_vec(),
            signature: signature.to_vec(),
        });
        self
    }

    /// Lay out the image and seal the checksum
    pub fn build(&self) -> Result<Vec<u8>> {
        let count = self.entries.len();
        let table = FW_OFFSET + DESCRIPTOR_SIZE;
        let first_desc = table + 4 * count;
        let mut content_at = first_desc + DESCRIPTOR_SIZE * count;
        let content_len: usize = self
            .entries
            .iter()
            .map(|e| e.content.len() + e.signature.len())
            .sum();

        let mut buf = vec![0u8; content_at + content_len];
        buf[IO_OFFSET] = 0x1;
        buf[BOOTLOADER_VERSION_OFFSET] = 16;
        put_product_id(&mut buf, self.product_id)?;
        put_u32(&mut buf, BUILD_ID_OFFSET, self.build_id);
        put_u32(&mut buf, PACKAGE_ID_OFFSET, self.package_id);
        put_u16(&mut buf, PRODUCT_INFO_OFFSET, self.product_info);
        put_u32(&mut buf, IMAGE_SIZE_OFFSET, content_len as u32);
        // shares the config size slot
        put_u32(&mut buf, CONFIG_SIZE_OFFSET, FW_OFFSET as u32);

        let top = ContainerDescriptor {
            container_id: ContainerId::TopLevel.raw().into(),
            content_length: ((4 * count) as u32).into(),
            content_address: (table as u32).into(),
            ..Default::default()
        };
        buf[FW_OFFSET..table].copy_from_slice(top.as_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let desc_at = first_desc + i * DESCRIPTOR_SIZE;
            let desc = ContainerDescriptor {
                container_id: entry.id.raw().into(),
                signature_size: (entry.signature.len() as u32).into(),
                content_length: (entry.content.len() as u32).into(),
                content_address: (content_at as u32).into(),
                ..Default::default()
            };
            put_u32(&mut buf, table + 4 * i, desc_at as u32);
            buf[desc_at..desc_at + DESCRIPTOR_SIZE].copy_from_slice(desc.as_bytes());

            let sig_at = content_at + entry.content.len();
            buf[content_at..sig_at].copy_from_slice(&entry.content);
            content_at = sig_at + entry.signature.len();
            buf[sig_at..content_at].copy_from_slice(&entry.signature);
        }
        Ok(pad_and_seal(buf))
    }
}

/// Build a hierarchical image with one flash-config container
///
/// Layout: header, top-level descriptor at 0x100, a one-entry offset table
/// at 0x120, the flash-config descriptor at 0x124 and its content at 0x144.
pub fn build_container_v10(product_id: &str, flash_config: &[u8]) -> Result<Vec<u8>> {
    ContainerBuilder::new(product_id)
        .with_build_id(0x1234)
        .with_package_id(0x4321)
        .with_product_info(0x3456)
        .container(ContainerId::FlashConfig, flash_config)
        .build()
}
