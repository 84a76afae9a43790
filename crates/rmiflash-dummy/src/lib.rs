//! rmiflash-dummy - In-memory RMI device for testing
//!
//! This crate provides a register level emulation of an RMI touch
//! controller with F01 device control and an F34 flash function. It speaks
//! the block bootloader (F34 versions 0 and 1) and the partition
//! bootloader (F34 version 2), so complete firmware updates can run without
//! hardware.
//!
//! Commands complete instantly and raise attention. Failed commands leave
//! their error in the status register and raise nothing, so the caller
//! finds out on its next status read.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use rmiflash_core::bootloader::legacy::{
    CMD_ENABLE_FLASH_PROG, CMD_ERASE_ALL, CMD_WRITE_CONFIG_BLOCK, CMD_WRITE_FW_BLOCK,
    CMD_WRITE_SIGNATURE,
};
use rmiflash_core::bootloader::partition::{
    FlashCommand, KEY_SIZE_2K, REG_BLOCK_OFFSET, REG_COMMAND, REG_PARTITION_ID, REG_PAYLOAD,
    REG_TRANSFER_LENGTH,
};
use rmiflash_core::bootloader::{BootloaderVariant, PartitionId};
use rmiflash_core::error::{Result, TransportError};
use rmiflash_core::firmware::header::PRODUCT_ID_LENGTH;
use rmiflash_core::transport::{
    DeviceMode, RegisterTransport, TransportKind, WriteFlags, PAGE_SELECT_REGISTER,
};

/// F34 data registers: the block window or the partition registers
pub const F34_DATA: u16 = 0x00;
/// F34 query registers
pub const F34_QUERY: u16 = 0x90;
/// F01 query registers
pub const F01_QUERY: u16 = 0xb0;
/// F01 data register holding the bootloader mode flag
pub const F01_DATA: u16 = 0xc8;
/// F01 control registers, sleep mode then interrupt enable
pub const F01_CONTROL: u16 = 0xca;
/// F01 command register
pub const F01_COMMAND: u16 = 0xcd;

const PDT_F01: u16 = 0xe9;
const PDT_F34: u16 = 0xe3;

const REGISTER_SPACE: usize = 0x10000;

// The block window has to end below F34_QUERY
const MAX_WINDOW_BLOCK_SIZE: u16 = 0x80;

const F01_DATA_BOOTLOADER_MODE: u8 = 0x40;
const F01_CMD_RESET: u8 = 0x01;
const F34_INTERRUPT: u8 = 0x02;
const MANUFACTURER_SYNAPTICS: u8 = 0x01;

const QUERY_PUBKEY_OFFSET: u16 = 0x0e;
const PUBKEY_BLOCK_SIZE: usize = 3;

// Block bootloader status codes
const BLOCK_STATUS_BAD_ID: u8 = 0x01;
const BLOCK_STATUS_NOT_ENABLED: u8 = 0x02;
const BLOCK_STATUS_OUT_OF_RANGE: u8 = 0x03;
const BLOCK_STATUS_BAD_COMMAND: u8 = 0x04;

// Partition bootloader status codes, as decoded by the core
const STATUS_ONLY_IN_BOOTLOADER: u8 = 0x01;
const STATUS_PARTITION_NOT_SUPPORTED: u8 = 0x02;
const STATUS_COMMAND_NOT_SUPPORTED: u8 = 0x03;
const STATUS_INVALID_OFFSET: u8 = 0x04;
const STATUS_INVALID_TRANSFER: u8 = 0x05;
const STATUS_KEY_INVALID: u8 = 0x07;
const STATUS_BOOTLOADER_MODE: u8 = 0x80;

const TABLE_HEADER_SIZE: usize = 2;
const TABLE_ENTRY_SIZE: usize = 8;

// Partition id, block offset, transfer length and command, back to back
const REQUEST_SIZE: usize = 6;
const REQUEST_COMMAND: usize = 5;

/// Configuration of the emulated device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// F34 protocol family
    pub variant: BootloaderVariant,
    /// Channel type reported to the core
    pub kind: TransportKind,
    /// Product id, at most 10 bytes are used
    pub product_id: String,
    /// Firmware version (major, minor)
    pub version: (u8, u8),
    /// Build id reported by the partition bootloader
    pub build_id: u32,
    /// Bootloader id, byte 1 is the bootloader major version
    pub bootloader_id: [u8; 2],
    /// Bytes per flash block
    pub block_size: u16,
    /// Firmware blocks
    pub fw_blocks: u16,
    /// Configuration blocks
    pub cfg_blocks: u16,
    /// Blocks per partition write command
    pub payload_length: u16,
    /// Block bootloader signature size in bits, zero when unsigned
    pub sig_size: u16,
    /// Public key, empty when the device has none
    pub pubkey: Vec<u8>,
    /// More partitions for the partition bootloader: id and length in blocks
    pub extra_partitions: Vec<(PartitionId, u16)>,
    /// Power up in bootloader mode, like after an interrupted update
    pub start_in_bootloader: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            variant: BootloaderVariant::Legacy,
            kind: TransportKind::Hid,
            product_id: String::from("TM3000-001"),
            version: (1, 2),
            build_id: 0x2a,
            bootloader_id: [0x00, 0x05],
            block_size: 16,
            fw_blocks: 4,
            cfg_blocks: 2,
            payload_length: 2,
            sig_size: 0,
            pubkey: Vec::new(),
            extra_partitions: Vec::new(),
            start_in_bootloader: false,
        }
    }
}

impl DummyConfig {
    /// A partition bootloader of the given major version
    pub fn partitioned(bootloader_major: u8) -> Self {
        Self {
            variant: BootloaderVariant::PartitionV7,
            bootloader_id: [0x00, bootloader_major],
            ..Default::default()
        }
    }
}

fn parse_bool(key: &str, value: &str) -> core::result::Result<bool, String> {
    match value {
        "1" | "yes" | "on" => Ok(true),
        "0" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid {} value: {}", key, value)),
    }
}

/// Parse transport options from a list of key-value pairs
///
/// `variant=v0|v1|v7` picks the F34 protocol, `bl=<major>` the bootloader
/// version, `pid=<product id>` the product and `ps2=1` reports a PS/2
/// channel. `bootloader=1` powers up in bootloader mode.
pub fn parse_options(options: &[(&str, &str)]) -> core::result::Result<DummyConfig, String> {
    let mut config = DummyConfig::default();

    for (key, value) in options {
        match *key {
            "variant" => match *value {
                "v0" | "legacy" => config.variant = BootloaderVariant::Legacy,
                "v1" => config.variant = BootloaderVariant::LegacySplit,
                "v7" | "partition" => {
                    config = DummyConfig {
                        product_id: config.product_id,
                        ..DummyConfig::partitioned(7)
                    };
                }
                _ => return Err(format!("Invalid variant: {}", value)),
            },
            "bl" => {
                config.bootloader_id[1] = value
                    .parse()
                    .map_err(|_| format!("Invalid bootloader version: {}", value))?;
            }
            "pid" => {
                if value.is_empty() || value.len() > PRODUCT_ID_LENGTH {
                    return Err(format!("Invalid product id: {}", value));
                }
                config.product_id = value.to_string();
            }
            "ps2" => {
                config.kind = if parse_bool(key, value)? {
                    TransportKind::Ps2
                } else {
                    TransportKind::Hid
                };
            }
            "bootloader" => {
                config.start_in_bootloader = parse_bool(key, value)?;
            }
            _ => {
                log::warn!("dummy: Unknown option: {}={}", key, value);
            }
        }
    }

    Ok(config)
}

/// Create an emulated device and return a boxed RegisterTransport
///
/// Convenience function for the CLI transport dispatch, see
/// [`parse_options`] for the accepted options.
#[cfg(feature = "std")]
pub fn open_dummy(
    options: &[(&str, &str)],
) -> core::result::Result<Box<dyn RegisterTransport>, Box<dyn std::error::Error>> {
    let config = parse_options(options)?;
    log::info!(
        "dummy: emulating {} with {:?} bootloader {}",
        config.product_id,
        config.variant,
        config.bootloader_id[1]
    );
    Ok(Box::new(DummyRmi::new(config)))
}

/// Contents of one flash area
#[derive(Debug, Clone)]
struct Region {
    id: PartitionId,
    data: Vec<u8>,
    signature: Vec<u8>,
}

impl Region {
    fn erase(&mut self) {
        self.data.fill(0xff);
        self.signature.clear();
    }
}

#[derive(Debug, Default)]
struct BlockState {
    enabled: bool,
    unlocked: bool,
    block_number: u16,
    status: u8,
}

#[derive(Debug, Clone, Copy)]
struct WriteCursor {
    id: PartitionId,
    signature: bool,
    pos: usize,
}

#[derive(Debug, Default)]
struct PartitionState {
    request: [u8; REQUEST_SIZE],
    error: u8,
    read_buf: Vec<u8>,
    read_pos: usize,
    cursor: Option<WriteCursor>,
}

impl PartitionState {
    fn partition_id(&self) -> u8 {
        self.request[0]
    }

    fn block_offset(&self) -> u16 {
        u16::from_le_bytes([self.request[1], self.request[2]])
    }

    fn set_block_offset(&mut self, offset: u16) {
        self.request[1..3].copy_from_slice(&offset.to_le_bytes());
    }

    fn transfer_length(&self) -> u16 {
        u16::from_le_bytes([self.request[3], self.request[4]])
    }
}

fn flash_command(raw: u8) -> Option<FlashCommand> {
    Some(match raw {
        0x00 => FlashCommand::Idle,
        0x01 => FlashCommand::EnterBootloader,
        0x02 => FlashCommand::Read,
        0x03 => FlashCommand::Write,
        0x04 => FlashCommand::Erase,
        0x05 => FlashCommand::EraseApplication,
        0x06 => FlashCommand::SensorId,
        0x07 => FlashCommand::Signature,
        _ => return None,
    })
}

fn encode_partition_table(layout: &[(PartitionId, u16, u16)]) -> Vec<u8> {
    let mut table = vec![0u8; TABLE_HEADER_SIZE];
    for &(id, length, address) in layout {
        table.extend_from_slice(&u16::from(id.raw()).to_le_bytes());
        table.extend_from_slice(&length.to_le_bytes());
        table.extend_from_slice(&address.to_le_bytes());
        table.extend_from_slice(&0u16.to_le_bytes());
    }
    // terminating PartitionId::None entry
    table.extend_from_slice(&[0; TABLE_ENTRY_SIZE]);
    table
}

/// Emulated RMI device
///
/// Registers live in a flat 64 KiB space. The F34 status and command
/// registers, the partition payload register and the public key packet
/// register are emulated, everything else reads back what was written.
pub struct DummyRmi {
    config: DummyConfig,
    regs: Vec<u8>,
    regions: Vec<Region>,
    page: u8,
    bootloader: bool,
    attention: bool,
    resets: u32,
    packet_offset: usize,
    block: BlockState,
    partition: PartitionState,
}

impl DummyRmi {
    /// Create an emulated device with erased flash
    pub fn new(config: DummyConfig) -> Self {
        let mut config = config;
        if !config.variant.is_partitioned() && config.block_size > MAX_WINDOW_BLOCK_SIZE {
            log::warn!(
                "dummy: block size {} does not fit the register map, using {}",
                config.block_size,
                MAX_WINDOW_BLOCK_SIZE
            );
            config.block_size = MAX_WINDOW_BLOCK_SIZE;
        }
        let bootloader = config.start_in_bootloader;

        let mut dev = Self {
            config,
            regs: vec![0; REGISTER_SPACE],
            regions: Vec::new(),
            page: 0,
            bootloader,
            attention: false,
            resets: 0,
            packet_offset: 0,
            block: BlockState {
                enabled: bootloader,
                ..Default::default()
            },
            partition: PartitionState::default(),
        };
        let config_length = dev.build_regions();
        dev.install_registers(config_length);
        dev
    }

    /// Preload partition `id` with `data`, as if flashed earlier
    pub fn with_partition(mut self, id: PartitionId, data: &[u8]) -> Self {
        if let Some(region) = self.region_mut(id) {
            let len = core::cmp::min(data.len(), region.data.len());
            region.data[..len].copy_from_slice(&data[..len]);
        }
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Contents of partition `id`
    ///
    /// The block bootloader keeps firmware in [`PartitionId::CoreCode`] and
    /// configuration in [`PartitionId::CoreConfig`].
    pub fn partition(&self, id: PartitionId) -> Option<&[u8]> {
        self.region(id).map(|r| r.data.as_slice())
    }

    /// Signature written for partition `id`
    pub fn signature(&self, id: PartitionId) -> Option<&[u8]> {
        self.region(id).map(|r| r.signature.as_slice())
    }

    /// Whether the device runs its bootloader
    pub fn in_bootloader(&self) -> bool {
        self.bootloader
    }

    /// Number of F01 resets seen
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Raw register value, bypassing the emulated registers
    pub fn register(&self, addr: u16) -> u8 {
        self.regs[usize::from(addr)]
    }

    fn region(&self, id: PartitionId) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    fn region_mut(&mut self, id: PartitionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.id == id)
    }

    fn block_size(&self) -> usize {
        usize::from(self.config.block_size.max(1))
    }

    /// Lay out the flash areas, returns the flash config length in blocks
    fn build_regions(&mut self) -> u16 {
        let block_size = self.block_size();
        let cfg = &self.config;
        if !cfg.variant.is_partitioned() {
            self.regions = vec![
                Region {
                    id: PartitionId::CoreCode,
                    data: vec![0xff; usize::from(cfg.fw_blocks) * block_size],
                    signature: Vec::new(),
                },
                Region {
                    id: PartitionId::CoreConfig,
                    data: vec![0xff; usize::from(cfg.cfg_blocks) * block_size],
                    signature: Vec::new(),
                },
            ];
            return 0;
        }

        let mut layout = vec![
            (PartitionId::FlashConfig, 0),
            (PartitionId::CoreCode, cfg.fw_blocks),
            (PartitionId::CoreConfig, cfg.cfg_blocks),
        ];
        if !cfg.pubkey.is_empty() {
            layout.push((PartitionId::Pubkey, KEY_SIZE_2K.div_ceil(block_size) as u16));
        }
        layout.extend_from_slice(&cfg.extra_partitions);
        let table_len = TABLE_HEADER_SIZE + TABLE_ENTRY_SIZE * (layout.len() + 1);
        let config_length = table_len.div_ceil(block_size) as u16;
        layout[0].1 = config_length;

        let mut address = 0u16;
        let mut entries = Vec::with_capacity(layout.len());
        for &(id, length) in &layout {
            entries.push((id, length, address));
            address = address.wrapping_add(length);
        }
        let table = encode_partition_table(&entries);

        let mut key: Vec<u8> = cfg.pubkey.iter().rev().copied().collect();
        self.regions = layout
            .iter()
            .map(|&(id, length)| {
                let mut data = vec![0xff; usize::from(length) * block_size];
                let init: &[u8] = match id {
                    PartitionId::FlashConfig => &table,
                    PartitionId::Pubkey => {
                        key.truncate(data.len());
                        &key
                    }
                    _ => &[],
                };
                data[..init.len()].copy_from_slice(init);
                Region {
                    id,
                    data,
                    signature: Vec::new(),
                }
            })
            .collect();
        config_length
    }

    fn poke(&mut self, addr: u16, data: &[u8]) {
        let start = usize::from(addr);
        self.regs[start..start + data.len()].copy_from_slice(data);
    }

    fn install_registers(&mut self, config_length: u16) {
        let version: u8 = match self.config.variant {
            BootloaderVariant::Legacy => 0,
            BootloaderVariant::LegacySplit => 1,
            BootloaderVariant::PartitionV7 => 2,
        };
        self.poke(
            PDT_F01,
            &[
                F01_QUERY as u8,
                F01_COMMAND as u8,
                F01_CONTROL as u8,
                F01_DATA as u8,
                0x01,
                0x01,
            ],
        );
        self.poke(
            PDT_F34,
            &[F34_QUERY as u8, 0x00, 0x00, F34_DATA as u8, 0x01 | version << 5, 0x34],
        );

        // basic queries without optional blocks, so query 43 reads as zero
        let mut basic = [0u8; 11];
        basic[0] = MANUFACTURER_SYNAPTICS;
        basic[2] = self.config.version.0;
        basic[3] = self.config.version.1;
        self.poke(F01_QUERY, &basic);
        let product_id = self.config.product_id.clone();
        let raw = product_id.as_bytes();
        let len = raw.len().min(PRODUCT_ID_LENGTH);
        self.poke(F01_QUERY + 11, &raw[..len]);

        let cfg = &self.config;
        let blid = cfg.bootloader_id;
        if cfg.variant.is_partitioned() {
            let supported = self
                .regions
                .iter()
                .fold(0u16, |acc, r| acc | 1u16.checked_shl(u32::from(r.id.raw())).unwrap_or(0));
            // query 0 selects the block right after it
            let mut query = [0u8; 22];
            query[1..3].copy_from_slice(&blid);
            query[3..7].copy_from_slice(&cfg.build_id.to_le_bytes());
            query[8..10].copy_from_slice(&cfg.block_size.to_le_bytes());
            query[14..16].copy_from_slice(&config_length.to_le_bytes());
            query[16..18].copy_from_slice(&cfg.payload_length.to_le_bytes());
            query[18..20].copy_from_slice(&supported.to_le_bytes());
            self.poke(F34_QUERY, &query);
        } else {
            let mut query = [0u8; 0x0c];
            query[0..2].copy_from_slice(&blid);
            query[3..5].copy_from_slice(&cfg.block_size.to_le_bytes());
            query[5..7].copy_from_slice(&cfg.fw_blocks.to_le_bytes());
            query[7..9].copy_from_slice(&cfg.cfg_blocks.to_le_bytes());
            query[9] = u8::from(cfg.sig_size != 0);
            query[0x0a..0x0c].copy_from_slice(&cfg.sig_size.to_le_bytes());
            self.poke(F34_QUERY, &query);
        }
    }

    fn status_addr(&self) -> u16 {
        F34_DATA + self.config.variant.block_data_offset() + self.config.block_size
    }

    fn read_register(&self, addr: u16) -> u8 {
        if addr == F01_DATA {
            return if self.bootloader {
                F01_DATA_BOOTLOADER_MODE
            } else {
                0
            };
        }
        if self.config.variant.is_partitioned() {
            if addr == F34_DATA {
                let mode = if self.bootloader {
                    STATUS_BOOTLOADER_MODE
                } else {
                    0
                };
                return mode | self.partition.error;
            }
            return self.regs[usize::from(addr)];
        }

        // the command field is always zero, commands finish on the spot
        let enabled = if self.block.enabled { 0x80 } else { 0 };
        let status_addr = self.status_addr();
        match self.config.variant {
            BootloaderVariant::LegacySplit if addr == status_addr => 0,
            BootloaderVariant::LegacySplit if addr == status_addr + 1 => {
                (self.block.status & 0x3f) | enabled
            }
            BootloaderVariant::Legacy if addr == status_addr => {
                ((self.block.status & 0x07) << 4) | enabled
            }
            _ => self.regs[usize::from(addr)],
        }
    }

    fn reset(&mut self) {
        log::debug!("dummy: reset");
        self.resets += 1;
        self.bootloader = false;
        self.attention = false;
        self.block = BlockState::default();
        self.partition = PartitionState::default();
    }

    fn block_write(&mut self, addr: u16, data: &[u8]) {
        let window = F34_DATA + self.config.variant.block_data_offset();
        let block_size = usize::from(self.config.block_size);

        if addr == F34_DATA && data.len() == 2 {
            self.block.block_number = u16::from_le_bytes([data[0], data[1]]);
        } else if addr == window && data.len() == block_size + 1 {
            self.block_command(data[block_size], &data[..block_size]);
        } else if addr == window && data.len() == 2 {
            self.block.unlocked = data == self.config.bootloader_id;
            log::debug!("dummy: bootloader id accepted: {}", self.block.unlocked);
        } else if addr == self.status_addr() && !data.is_empty() {
            self.block_command(data[0], &[]);
        } else {
            log::debug!("dummy: ignoring {} byte F34 write at 0x{:02x}", data.len(), addr);
        }
    }

    fn block_command(&mut self, cmd: u8, payload: &[u8]) {
        let result = match cmd {
            CMD_ENABLE_FLASH_PROG if self.block.unlocked => {
                self.bootloader = true;
                self.block.enabled = true;
                Ok(())
            }
            CMD_ENABLE_FLASH_PROG => Err(BLOCK_STATUS_BAD_ID),
            _ if !self.block.enabled => Err(BLOCK_STATUS_NOT_ENABLED),
            CMD_ERASE_ALL if self.block.unlocked => {
                for region in &mut self.regions {
                    region.erase();
                }
                Ok(())
            }
            CMD_ERASE_ALL => Err(BLOCK_STATUS_BAD_ID),
            CMD_WRITE_FW_BLOCK => self.program_block(PartitionId::CoreCode, false, payload),
            CMD_WRITE_CONFIG_BLOCK => self.program_block(PartitionId::CoreConfig, false, payload),
            CMD_WRITE_SIGNATURE => self.program_block(PartitionId::CoreCode, true, payload),
            _ => Err(BLOCK_STATUS_BAD_COMMAND),
        };
        match result {
            Ok(()) => {
                self.block.status = 0;
                self.attention = true;
            }
            Err(code) => {
                log::debug!("dummy: block command 0x{:02x} failed: {}", cmd, code);
                self.block.status = code;
            }
        }
    }

    fn program_block(
        &mut self,
        id: PartitionId,
        signature: bool,
        payload: &[u8],
    ) -> core::result::Result<(), u8> {
        let offset = usize::from(self.block.block_number) * self.block_size();
        let end = offset + payload.len();
        let region = self.region_mut(id).ok_or(BLOCK_STATUS_OUT_OF_RANGE)?;
        let target = if signature {
            if region.signature.len() < end {
                region.signature.resize(end, 0xff);
            }
            &mut region.signature
        } else {
            &mut region.data
        };
        target
            .get_mut(offset..end)
            .ok_or(BLOCK_STATUS_OUT_OF_RANGE)?
            .copy_from_slice(payload);
        self.block.block_number += 1;
        Ok(())
    }

    fn partition_write(&mut self, addr: u16, data: &[u8]) {
        let start = match addr - F34_DATA {
            REG_PAYLOAD => return self.write_payload(data),
            REG_PARTITION_ID => 0,
            REG_BLOCK_OFFSET => 1,
            REG_TRANSFER_LENGTH => 3,
            REG_COMMAND => REQUEST_COMMAND,
            _ => {
                log::debug!("dummy: ignoring F34 write at 0x{:02x}", addr);
                return;
            }
        };
        let n = data.len().min(REQUEST_SIZE - start);
        self.partition.request[start..start + n].copy_from_slice(&data[..n]);
        if start + data.len() > REQUEST_COMMAND {
            let cmd = self.partition.request[REQUEST_COMMAND];
            self.partition_command(cmd, &data[n..]);
        }
    }

    fn partition_command(&mut self, cmd: u8, payload: &[u8]) {
        self.partition.cursor = None;
        match self.run_partition_command(cmd, payload) {
            Ok(()) => {
                self.partition.error = 0;
                self.attention = true;
            }
            Err(code) => {
                log::debug!("dummy: flash command 0x{:02x} failed: {}", cmd, code);
                self.partition.error = code;
            }
        }
    }

    /// Partition addressed by the request registers
    fn requested_partition(&self) -> core::result::Result<PartitionId, u8> {
        PartitionId::from_raw(u16::from(self.partition.partition_id()))
            .filter(|id| self.region(*id).is_some())
            .ok_or(STATUS_PARTITION_NOT_SUPPORTED)
    }

    fn run_partition_command(&mut self, cmd: u8, payload: &[u8]) -> core::result::Result<(), u8> {
        let command = flash_command(cmd).ok_or(STATUS_COMMAND_NOT_SUPPORTED)?;
        let block_size = self.block_size();
        let start = usize::from(self.partition.block_offset()) * block_size;
        let len = usize::from(self.partition.transfer_length()) * block_size;

        match command {
            FlashCommand::Idle => Ok(()),
            FlashCommand::EnterBootloader => {
                if payload.get(..2) != Some(&self.config.bootloader_id[..]) {
                    return Err(STATUS_KEY_INVALID);
                }
                self.bootloader = true;
                Ok(())
            }
            FlashCommand::Read => {
                let id = self.requested_partition()?;
                let data = self.region(id).map(|r| r.data.as_slice()).unwrap_or(&[]);
                let chunk = data.get(start..).ok_or(STATUS_INVALID_OFFSET)?;
                let mut buf = chunk[..len.min(chunk.len())].to_vec();
                buf.resize(len, 0);
                self.partition.read_buf = buf;
                self.partition.read_pos = 0;
                Ok(())
            }
            FlashCommand::SensorId => Err(STATUS_COMMAND_NOT_SUPPORTED),
            _ if !self.bootloader => Err(STATUS_ONLY_IN_BOOTLOADER),
            FlashCommand::Write | FlashCommand::Signature => {
                let id = self.requested_partition()?;
                let signature = command == FlashCommand::Signature;
                let size = self.region(id).map_or(0, |r| r.data.len());
                if !signature && start + len > size {
                    return Err(STATUS_INVALID_TRANSFER);
                }
                self.partition.cursor = Some(WriteCursor {
                    id,
                    signature,
                    pos: start,
                });
                let next = self
                    .partition
                    .block_offset()
                    .wrapping_add(self.partition.transfer_length());
                self.partition.set_block_offset(next);
                Ok(())
            }
            FlashCommand::Erase => {
                let id = self.requested_partition()?;
                if let Some(region) = self.region_mut(id) {
                    region.erase();
                }
                Ok(())
            }
            FlashCommand::EraseApplication => {
                for region in &mut self.regions {
                    if matches!(region.id, PartitionId::CoreCode | PartitionId::CoreConfig) {
                        region.erase();
                    }
                }
                Ok(())
            }
        }
    }

    fn write_payload(&mut self, data: &[u8]) {
        let Some(mut cursor) = self.partition.cursor else {
            log::debug!("dummy: payload without a write command");
            return;
        };
        let end = cursor.pos + data.len();
        let stored = self.region_mut(cursor.id).and_then(|region| {
            let target = if cursor.signature {
                if region.signature.len() < end {
                    region.signature.resize(end, 0xff);
                }
                &mut region.signature
            } else {
                &mut region.data
            };
            let slot = target.get_mut(cursor.pos..end)?;
            slot.copy_from_slice(data);
            Some(())
        });
        if stored.is_some() {
            cursor.pos = end;
            self.partition.cursor = Some(cursor);
        } else {
            self.partition.error = STATUS_INVALID_TRANSFER;
            self.partition.cursor = None;
            self.attention = false;
        }
    }

    fn read_payload(&mut self, len: usize) -> Vec<u8> {
        let buf = &self.partition.read_buf;
        let out: Vec<u8> = (0..len)
            .map(|i| buf.get(self.partition.read_pos + i).copied().unwrap_or(0))
            .collect();
        self.partition.read_pos += len;
        out
    }

    /// Public key as the packet register streams it: last byte first, in
    /// zero padded three byte blocks
    fn pubkey_stream(&self) -> Vec<u8> {
        let mut stream: Vec<u8> = self.config.pubkey.iter().rev().copied().collect();
        stream.resize(
            stream.len().div_ceil(PUBKEY_BLOCK_SIZE) * PUBKEY_BLOCK_SIZE,
            0,
        );
        stream
    }
}

impl RegisterTransport for DummyRmi {
    fn kind(&self) -> TransportKind {
        self.config.kind
    }

    fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        if usize::from(addr) + len > REGISTER_SPACE {
            return Err(TransportError::ShortRead.into());
        }
        self.packet_offset = 0;
        if self.config.variant.is_partitioned() && addr == F34_DATA + REG_PAYLOAD {
            return Ok(self.read_payload(len));
        }
        Ok((0..len)
            .map(|i| self.read_register(addr + i as u16))
            .collect())
    }

    fn write_with_flags(&mut self, addr: u16, data: &[u8], _flags: WriteFlags) -> Result<()> {
        if usize::from(addr) + data.len() > REGISTER_SPACE {
            return Err(TransportError::ShortWrite.into());
        }
        log::trace!("dummy: write 0x{:04x} {:02x?}", addr, data);

        let partitioned = self.config.variant.is_partitioned();
        let partition_regs = F34_DATA + REG_PARTITION_ID..=F34_DATA + REG_PAYLOAD;
        if addr & 0xff == PAGE_SELECT_REGISTER && !data.is_empty() {
            self.page = data[0];
        } else if addr == F01_COMMAND {
            if data.first().is_some_and(|c| c & F01_CMD_RESET != 0) {
                self.reset();
            }
        } else if partitioned && partition_regs.contains(&addr) {
            self.partition_write(addr, data);
        } else if !partitioned && addr <= self.status_addr() {
            self.block_write(addr, data);
        } else {
            self.poke(addr, data);
        }
        Ok(())
    }

    fn set_page(&mut self, page: u8) -> Result<()> {
        self.page = page;
        Ok(())
    }

    fn wait_for_attention(&mut self, source_mask: u8, _timeout_ms: u32) -> Result<bool> {
        if source_mask & F34_INTERRUPT == 0 {
            return Ok(false);
        }
        Ok(core::mem::take(&mut self.attention))
    }

    fn read_packet_register(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        if self.config.variant.is_partitioned() || addr != F34_QUERY + QUERY_PUBKEY_OFFSET {
            return self.read(addr, len);
        }
        let stream = self.pubkey_stream();
        let out = (0..len)
            .map(|i| stream.get(self.packet_offset + i).copied().unwrap_or(0))
            .collect();
        self.packet_offset += len;
        Ok(out)
    }

    fn rebind(&mut self, mode: DeviceMode) -> Result<bool> {
        log::debug!("dummy: rebind in {:?} mode, page {}", mode, self.page);
        Ok(true)
    }
}
