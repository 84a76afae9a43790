//! Partition protocol of F34 version 2
//!
//! Flash is split into named partitions listed in a partition table that
//! lives in the flash config partition itself. Every operation selects a
//! partition, a block offset and a transfer length, then issues a command.
//! The registers sit back to back after the status byte at F34 data base:
//!
//! | offset | register             |
//! |--------|----------------------|
//! | +1     | partition id         |
//! | +2     | block offset (LE16)  |
//! | +3     | transfer length (LE16, in blocks) |
//! | +4     | command              |
//! | +5     | payload              |
//!
//! A burst write starting at +1 fills them in order, which is how the
//! unlock style requests carrying the bootloader id are sent.

use alloc::vec::Vec;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::status::decode_partition_status;
use super::{BootloaderProtocol, PartitionId};
use crate::device::{RmiDevice, ENABLE_WAIT_MS, IDLE_WAIT_MS};
use crate::error::{ProtocolError, Result, TransportError};
use crate::firmware::{
    signature_name, FirmwareContainer, IMAGE_AFE_CONFIG, IMAGE_CONFIG, IMAGE_DISPLAY_CONFIG,
    IMAGE_FIXED_LOCATION_DATA, IMAGE_FLASH_CONFIG, IMAGE_SBL, IMAGE_UI, SIGNATURE_SUFFIX,
};
use crate::params::{FlashParameters, Partition};
use crate::transport::{Delay, RegisterTransport};
use crate::update::{PlannedStep, Step, UpdateSession};

/// Register offsets from F34 data base
pub const REG_PARTITION_ID: u16 = 1;
/// Block offset register
pub const REG_BLOCK_OFFSET: u16 = 2;
/// Transfer length register
pub const REG_TRANSFER_LENGTH: u16 = 3;
/// Command register
pub const REG_COMMAND: u16 = 4;
/// Payload register
pub const REG_PAYLOAD: u16 = 5;

/// Commands of the partition protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashCommand {
    /// No operation
    Idle = 0x00,
    /// Enter bootloader mode
    EnterBootloader = 0x01,
    /// Read a partition
    Read = 0x02,
    /// Write a partition
    Write = 0x03,
    /// Erase a partition
    Erase = 0x04,
    /// Erase the application partitions (bootloader 8 and later)
    EraseApplication = 0x05,
    /// Read the sensor id
    SensorId = 0x06,
    /// Write a partition signature
    Signature = 0x07,
}

const ERASE_WAIT_MS: u32 = 10 * 1000;
const ERASE_SETTLE_MS: u32 = 1000;
const COMMAND_SETTLE_MS: u32 = 100;

/// Size of the public key partition read back for verification
pub const KEY_SIZE_2K: usize = 0x100;

const SECURE_CHECK_MAX_BOOTLOADER: u8 = 10;

/// Partition, offset, length and command, written as one burst at +1
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CommandRequest {
    partition_id: u8,
    block_offset: U16,
    transfer_length: U16,
    command: u8,
}

impl CommandRequest {
    fn new(id: PartitionId, transfer_length: u16, command: FlashCommand) -> Self {
        Self {
            partition_id: id.raw(),
            block_offset: U16::new(0),
            transfer_length: U16::new(transfer_length),
            command: command as u8,
        }
    }
}

/// [`CommandRequest`] followed by the bootloader id in the payload register
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct UnlockRequest {
    request: CommandRequest,
    bootloader_id: [u8; 2],
}

/// Transfer length and command, written at +3 for each chunk
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TransferRequest {
    transfer_length: U16,
    command: u8,
}

/// F34 query block located by the low bits of query 0
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PartitionQuery {
    bootloader_id: [u8; 2],
    build_id: U32,
    _reserved0: u8,
    block_size: U16,
    _reserved1: [u8; 4],
    config_length: U16,
    payload_length: U16,
    supported_partitions: U16,
    _reserved2: [u8; 2],
}

/// One partition table entry
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PartitionEntry {
    id: U16,
    length: U16,
    address: U16,
    properties: U16,
}

const TABLE_HEADER_SIZE: usize = 2;
const TABLE_LONG_ENTRY_PADDING: usize = 2;

/// Decode the partition table read from the flash config partition
///
/// Entries are 8 bytes, or 10 when the low nibble of the first header byte
/// is 1. The table ends at the first [`PartitionId::None`] entry or at the
/// end of `buf`. Unknown ids are skipped.
pub fn parse_partition_table(buf: &[u8]) -> Result<Vec<Partition>> {
    let header = buf
        .get(..TABLE_HEADER_SIZE)
        .ok_or(ProtocolError::InvalidFlashConfig)?;
    let mut stride = core::mem::size_of::<PartitionEntry>();
    if header[0] & 0x0f == 1 {
        stride += TABLE_LONG_ENTRY_PADDING;
    }

    let mut partitions = Vec::new();
    let mut offset = TABLE_HEADER_SIZE;
    while offset < buf.len() {
        let (entry, _) = PartitionEntry::read_from_prefix(&buf[offset..])
            .map_err(|_| ProtocolError::InvalidFlashConfig)?;
        let raw = entry.id.get();
        match PartitionId::from_raw(raw) {
            Some(PartitionId::None) => break,
            Some(id) => {
                log::debug!(
                    "found partition {} (0x{:02x}) len:{} addr:0x{:x}",
                    id,
                    raw,
                    entry.length.get(),
                    entry.address.get()
                );
                partitions.push(Partition {
                    id,
                    length: entry.length.get(),
                    address: entry.address.get(),
                    properties: entry.properties.get(),
                });
            }
            None => log::debug!("skipping unknown partition 0x{:02x}", raw),
        }
        offset += stride;
    }
    Ok(partitions)
}

/// F34 version 2
#[derive(Debug, Default, Clone, Copy)]
pub struct PartitionProtocol;

impl PartitionProtocol {
    fn send_command<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        req: CommandRequest,
    ) -> Result<()> {
        let f34 = dev.f34()?;
        dev.write(f34.data_base + REG_PARTITION_ID, req.as_bytes())
    }

    fn send_unlock<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        id: PartitionId,
        command: FlashCommand,
    ) -> Result<()> {
        let f34 = dev.f34()?;
        let req = UnlockRequest {
            request: CommandRequest::new(id, 0, command),
            bootloader_id: dev.params().bootloader_id,
        };
        dev.write(f34.data_base + REG_PARTITION_ID, req.as_bytes())
    }

    /// Read `blocks` blocks of partition `id` from offset zero
    fn read_partition<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        id: PartitionId,
        blocks: u16,
    ) -> Result<Vec<u8>> {
        let f34 = dev.f34()?;
        self.send_command(dev, CommandRequest::new(id, blocks, FlashCommand::Read))?;
        dev.poll_wait()?;
        let len = usize::from(blocks) * usize::from(dev.params().block_size);
        dev.read(f34.data_base + REG_PAYLOAD, len)
    }

    fn read_flash_config<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<Vec<Partition>> {
        let config_length = dev.params().config_length;
        let buf = self.read_partition(dev, PartitionId::FlashConfig, config_length)?;
        log::trace!("flash config: {:02x?}", buf);
        parse_partition_table(&buf)
    }

    fn get_pubkey<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<Vec<u8>> {
        let blocks = KEY_SIZE_2K / usize::from(dev.params().block_size);
        let mut key = self.read_partition(dev, PartitionId::Pubkey, blocks as u16)?;
        key.reverse();
        Ok(key)
    }

    fn erase_partition<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        id: PartitionId,
    ) -> Result<()> {
        log::info!("erasing partition {}", id);
        dev.delay_ms(ERASE_SETTLE_MS);
        self.send_unlock(dev, id, FlashCommand::Erase)?;
        dev.delay_ms(COMMAND_SETTLE_MS);
        dev.wait_for_idle(ERASE_WAIT_MS, false)?;
        dev.poll_wait()
    }

    /// Erase code, and on bootloader 7 the configuration as well
    fn erase_all<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        let bl = dev.params().bootloader_major();
        let command = if bl >= 8 {
            FlashCommand::EraseApplication
        } else {
            FlashCommand::Erase
        };
        if bl >= 8 {
            // BL8 misses the attention of an erase sent right after a status read
            dev.delay_ms(ERASE_SETTLE_MS);
        }
        self.send_unlock(dev, PartitionId::CoreCode, command)?;
        dev.delay_ms(COMMAND_SETTLE_MS);
        if bl >= 8 {
            dev.wait_for_idle(ERASE_WAIT_MS, false)?;
        }
        dev.poll_wait()?;

        if bl == 7 {
            dev.delay_ms(COMMAND_SETTLE_MS);
            self.send_command(
                dev,
                CommandRequest::new(PartitionId::CoreConfig, 0, FlashCommand::Erase),
            )?;
            dev.delay_ms(COMMAND_SETTLE_MS);
            dev.wait_for_idle(ERASE_WAIT_MS, true)?;
            dev.poll_wait()?;
        }
        Ok(())
    }

    /// Send `data` in transfers of `payload_length` blocks with `command`
    fn write_chunks<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        command: FlashCommand,
        data: &[u8],
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let f34 = dev.f34()?;
        let block_size = usize::from(dev.params().block_size);
        let transfer = dev.params().transfer_size();
        let total = data.len().div_ceil(transfer);

        for (i, chunk) in data.chunks(transfer).enumerate() {
            let req = TransferRequest {
                transfer_length: U16::new(chunk.len().div_ceil(block_size) as u16),
                command: command as u8,
            };
            dev.write(f34.data_base + REG_TRANSFER_LENGTH, req.as_bytes())?;
            for block in chunk.chunks(block_size) {
                dev.write(f34.data_base + REG_PAYLOAD, block)?;
            }
            dev.wait_for_idle(IDLE_WAIT_MS, false)?;
            session.progress.blocks(i + 1, total);
        }
        Ok(())
    }

    /// Write image `name` into partition `id`, followed by its signature
    fn write_partition<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        fw: &FirmwareContainer,
        name: &'static str,
        id: PartitionId,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let data = fw.require(name)?;
        let f34 = dev.f34()?;
        log::info!("writing partition {} ({} bytes)", id, data.len());
        dev.write(f34.data_base + REG_PARTITION_ID, &[id.raw()])?;
        dev.write(f34.data_base + REG_BLOCK_OFFSET, &0u16.to_le_bytes())?;
        self.write_chunks(dev, FlashCommand::Write, data, session)?;

        if let Some(signature) = fw.image(&signature_name(name)) {
            log::info!("writing partition signature {}", id);
            dev.write(f34.data_base + REG_BLOCK_OFFSET, &0u16.to_le_bytes())?;
            self.write_chunks(dev, FlashCommand::Signature, signature, session)?;
        }
        Ok(())
    }

    /// Replace the bootloader partition, then re-read what the new one reports
    fn write_bootloader<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let old = dev.bootloader_version();
        self.erase_partition(dev, PartitionId::Bootloader)?;
        self.write_partition(dev, fw, IMAGE_SBL, PartitionId::Bootloader, session)?;
        dev.poll_wait()?;
        dev.setup()?;
        log::info!("bootloader {} -> {}", old, dev.bootloader_version());
        Ok(())
    }

    fn secure_check<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let params = dev.params();
        if params.bootloader_major() >= SECURE_CHECK_MAX_BOOTLOADER || !params.has_pubkey {
            log::debug!("no device key to verify against");
            return Ok(());
        }
        let Some(verifier) = session.verifier()? else {
            return Ok(());
        };
        let pubkey = self.get_pubkey(dev)?;

        for (name, payload) in fw.images() {
            if name.ends_with(SIGNATURE_SUFFIX) {
                continue;
            }
            let Some(signature) = fw.image(&signature_name(name)) else {
                continue;
            };
            session.verify(verifier, name, payload, signature, &pubkey)?;
            log::info!("{} signature verified", name);
        }
        Ok(())
    }
}

impl BootloaderProtocol for PartitionProtocol {
    fn setup<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        let f34 = dev.f34()?;
        let q0 = dev.read(f34.query_base, 1)?;
        let offset = u16::from(q0[0] & 0x07) + 1;
        let raw = dev.read(
            f34.query_base + offset,
            core::mem::size_of::<PartitionQuery>(),
        )?;
        let (query, _) =
            PartitionQuery::read_from_prefix(&raw).map_err(|_| TransportError::ShortRead)?;

        let block_size = query.block_size.get();
        let config_length = query.config_length.get();
        if block_size == 0 || u32::from(block_size) * u32::from(config_length) > 0xffff {
            return Err(ProtocolError::InvalidGeometry {
                block_size,
                config_length,
            }
            .into());
        }

        let params = dev.params_mut();
        params.bootloader_id = query.bootloader_id;
        params.build_id = query.build_id.get();
        params.block_size = block_size;
        params.config_length = config_length;
        params.payload_length = query.payload_length.get();
        params.supported_partitions = query.supported_partitions.get();
        params.status_addr = f34.data_base;

        let partitions = self.read_flash_config(dev)?;
        let params = dev.params_mut();
        for p in &partitions {
            match p.id {
                PartitionId::CoreCode => params.block_count_fw = p.length,
                PartitionId::CoreConfig => params.block_count_cfg = p.length,
                PartitionId::Pubkey => params.has_pubkey = true,
                PartitionId::Bootloader => params.has_sbl = true,
                _ => {}
            }
        }
        params.partitions = partitions;

        log::debug!(
            "F34 bl:{}.{} block:{} config:{} payload:{} fw:{} cfg:{} pubkey:{}",
            params.bootloader_id[1],
            params.bootloader_id[0],
            block_size,
            config_length,
            params.payload_length,
            params.block_count_fw,
            params.block_count_cfg,
            params.has_pubkey
        );
        Ok(())
    }

    fn query_status<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<bool> {
        let f34 = dev.f34()?;
        let status = dev.read(f34.data_base, 1)?;
        decode_partition_status(status[0])
    }

    fn detach<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        dev.disable_irqs()?;
        self.send_unlock(dev, PartitionId::Bootloader, FlashCommand::EnterBootloader)?;
        dev.wait_for_idle(ENABLE_WAIT_MS, false)?;
        dev.poll_wait()?;
        dev.delay_ms(ENABLE_WAIT_MS);
        Ok(())
    }

    fn plan(&self, params: &FlashParameters, fw: &FirmwareContainer) -> Result<Vec<PlannedStep>> {
        let bl = params.bootloader_major();
        fw.require(IMAGE_UI)?;
        fw.require(IMAGE_CONFIG)?;
        if bl >= 8 {
            fw.require(IMAGE_FLASH_CONFIG)?;
        }

        // weights per bootloader generation:
        // verify, fld, flash-config, erase, code, config, afe, display
        let w: [u8; 8] = match bl {
            9.. => [0, 1, 8, 9, 81, 1, 0, 0],
            8 => [0, 0, 0, 16, 81, 1, 0, 0],
            _ => [2, 2, 0, 3, 89, 2, 2, 2],
        };

        let mut plan = Vec::new();
        plan.push(PlannedStep::new(Step::DisableSleep, 0));
        plan.push(PlannedStep::new(Step::VerifySignature, w[0]));
        if fw.image(IMAGE_FIXED_LOCATION_DATA).is_some() {
            plan.push(PlannedStep::new(Step::WriteFixedLocationData, w[1]));
        }
        if bl > 8 {
            plan.push(PlannedStep::new(Step::EraseFlashConfig, 0));
            plan.push(PlannedStep::new(Step::WriteFlashConfig, w[2]));
        }
        if params.has_sbl && fw.image(IMAGE_SBL).is_some() {
            plan.push(PlannedStep::new(Step::WriteBootloader, 4));
        }
        plan.push(PlannedStep::new(Step::EraseAll, w[3]));
        if bl == 8 {
            plan.push(PlannedStep::new(Step::WriteFlashConfig, w[2]));
        }
        plan.push(PlannedStep::new(Step::WriteUi, w[4]));
        plan.push(PlannedStep::new(Step::WriteConfig, w[5]));
        if fw.image(IMAGE_AFE_CONFIG).is_some() {
            plan.push(PlannedStep::new(Step::WriteAfeConfig, w[6]));
        }
        if fw.image(IMAGE_DISPLAY_CONFIG).is_some() {
            plan.push(PlannedStep::new(Step::WriteDisplayConfig, w[7]));
        }
        Ok(plan)
    }

    fn run_step<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        step: Step,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        match step {
            Step::DisableSleep => dev.disable_sleep(),
            Step::VerifySignature => self.secure_check(dev, fw, session),
            Step::WriteFixedLocationData => self.write_partition(
                dev,
                fw,
                IMAGE_FIXED_LOCATION_DATA,
                PartitionId::FixedLocationData,
                session,
            ),
            Step::EraseFlashConfig => self.erase_partition(dev, PartitionId::FlashConfig),
            Step::WriteFlashConfig => {
                self.write_partition(dev, fw, IMAGE_FLASH_CONFIG, PartitionId::FlashConfig, session)
            }
            Step::WriteBootloader => self.write_bootloader(dev, fw, session),
            Step::EraseAll => self.erase_all(dev),
            Step::WriteUi => {
                self.write_partition(dev, fw, IMAGE_UI, PartitionId::CoreCode, session)
            }
            Step::WriteConfig => {
                self.write_partition(dev, fw, IMAGE_CONFIG, PartitionId::CoreConfig, session)
            }
            Step::WriteAfeConfig => self.write_partition(
                dev,
                fw,
                IMAGE_AFE_CONFIG,
                PartitionId::ExternalTouchAfeConfig,
                session,
            ),
            Step::WriteDisplayConfig => self.write_partition(
                dev,
                fw,
                IMAGE_DISPLAY_CONFIG,
                PartitionId::DisplayConfig,
                session,
            ),
            Step::WriteSignature => {
                log::debug!("signatures follow their partition");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ParseError, VerificationError};
    use crate::firmware::header::ContainerId;
    use crate::firmware::ContainerBuilder;
    use crate::transport::mock::{CountingDelay, MockRegisters, WriteRecord};
    use crate::transport::TransportKind;
    use crate::update::{plan_steps, write_firmware, FlashOptions, NoProgress, SignatureVerifier};
    use alloc::vec;

    const F34_QUERY: u16 = 0x80;
    const DATA: u16 = 0xa0;

    fn partition_device(bl: u8, table: &[(PartitionId, u16)]) -> MockRegisters {
        let mut regs = MockRegisters::new(TransportKind::Hid);
        regs.pdt_entry(0xe9, [0x40, 0x30, 0x20, 0x10, 0x01, 0x01]);
        // F34 function version 2, data at 0xa0
        regs.pdt_entry(0xe3, [0x80, 0x00, 0x00, 0xa0, 0x41, 0x34]);
        regs.poke(0x40, &[0x01, 0x00, 0x01, 0x02]);
        regs.poke(0x40 + 11, b"TM3000-001");

        // query 0 points one register further
        let mut query = [0u8; 21];
        query[0] = 0x00;
        query[1] = bl;
        query[2..6].copy_from_slice(&0x2au32.to_le_bytes());
        query[7..9].copy_from_slice(&16u16.to_le_bytes());
        query[13..15].copy_from_slice(&2u16.to_le_bytes());
        query[15..17].copy_from_slice(&2u16.to_le_bytes());
        regs.poke(F34_QUERY + 1, &query);

        // bootloader mode, no error
        regs.poke(DATA, &[0x80]);
        let mut tbl = vec![0u8, 0u8];
        for (id, len) in table {
            tbl.extend_from_slice(&u16::from(id.raw()).to_le_bytes());
            tbl.extend_from_slice(&len.to_le_bytes());
            tbl.extend_from_slice(&[0, 0, 0, 0]);
        }
        regs.poke(DATA + REG_PAYLOAD, &tbl);
        regs
    }

    const TABLE: [(PartitionId, u16); 3] = [
        (PartitionId::CoreCode, 4),
        (PartitionId::CoreConfig, 2),
        (PartitionId::FlashConfig, 2),
    ];

    /// (partition, command) pairs in the order they were issued
    fn commands(writes: &[WriteRecord]) -> Vec<(u8, u8)> {
        let mut partition = 0;
        let mut out = Vec::new();
        for w in writes {
            if w.addr == DATA + REG_PARTITION_ID {
                partition = w.data[0];
                if w.data.len() >= 6 {
                    out.push((partition, w.data[5]));
                }
            } else if w.addr == DATA + REG_TRANSFER_LENGTH && w.data.len() == 3 {
                out.push((partition, w.data[2]));
            }
        }
        out.retain(|&(_, cmd)| cmd != FlashCommand::Read as u8);
        out
    }

    fn cmd(id: PartitionId, command: FlashCommand) -> (u8, u8) {
        (id.raw(), command as u8)
    }

    fn image(flash_config: bool) -> Vec<u8> {
        let mut b = ContainerBuilder::new("TM3000")
            .container(ContainerId::CoreCode, &[0xaa; 64])
            .container(ContainerId::CoreConfig, &[0xbb; 32]);
        if flash_config {
            b = b.container(ContainerId::FlashConfig, &[0xcc; 16]);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_setup_reads_partition_table() {
        let dev = RmiDevice::open(partition_device(7, &TABLE), CountingDelay::default()).unwrap();
        let params = dev.params();
        assert_eq!(params.bootloader_id, [0x00, 0x07]);
        assert_eq!(params.block_size, 16);
        assert_eq!(params.config_length, 2);
        assert_eq!(params.payload_length, 2);
        assert_eq!(params.block_count_fw, 4);
        assert_eq!(params.block_count_cfg, 2);
        assert_eq!(params.build_id, 0x2a);
        assert_eq!(params.status_addr, DATA);
        assert_eq!(params.partitions.len(), 3);
        assert!(!params.has_pubkey);
        assert!(!params.has_sbl);
        assert!(dev.in_bootloader());
        assert_eq!(dev.firmware_version(), "1.2.42");
    }

    #[test]
    fn test_table_long_entries_and_unknown_ids() {
        let mut buf = vec![0x01, 0x00];
        buf.extend_from_slice(&[0x07, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff]);
        buf.extend_from_slice(&[0x42, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&[0x0d, 0x00, 0x02, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00]);
        let parts = parse_partition_table(&buf).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, PartitionId::CoreCode);
        assert_eq!(parts[0].length, 0x10);
        assert_eq!(parts[1].id, PartitionId::Pubkey);
        assert_eq!(parts[1].address, 0x20);
        assert_eq!(parts[1].properties, 1);
    }

    #[test]
    fn test_table_truncated_entry() {
        let buf = [0x00, 0x00, 0x07, 0x00, 0x10];
        assert_eq!(
            parse_partition_table(&buf),
            Err(ProtocolError::InvalidFlashConfig.into())
        );
        assert!(parse_partition_table(&[0x00]).is_err());
        assert!(parse_partition_table(&[0x00, 0x00]).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_geometry() {
        let mut regs = partition_device(7, &TABLE);
        regs.poke(F34_QUERY + 1 + 7, &0x1000u16.to_le_bytes());
        regs.poke(F34_QUERY + 1 + 13, &0x0020u16.to_le_bytes());
        assert_eq!(
            RmiDevice::open(regs, CountingDelay::default()).err(),
            Some(Error::Protocol(ProtocolError::InvalidGeometry {
                block_size: 0x1000,
                config_length: 0x20,
            }))
        );
    }

    #[test]
    fn test_write_bl7() {
        let regs = partition_device(7, &TABLE);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        let blob = image(false);
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();

        let writes = &dev.transport_mut().writes;
        assert_eq!(
            commands(writes),
            [
                cmd(PartitionId::CoreCode, FlashCommand::Erase),
                cmd(PartitionId::CoreConfig, FlashCommand::Erase),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreConfig, FlashCommand::Write),
            ]
        );
        // code erase carries the bootloader id
        assert!(writes.iter().any(|w| w.addr == DATA + REG_PARTITION_ID
            && w.data == [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x07]));
        let payload = writes
            .iter()
            .filter(|w| w.addr == DATA + REG_PAYLOAD)
            .count();
        assert_eq!(payload, 6);
    }

    #[test]
    fn test_write_bl8_flash_config_after_erase() {
        let regs = partition_device(8, &TABLE);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();

        let blob = image(false);
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress),
            Err(ParseError::MissingImage(IMAGE_FLASH_CONFIG).into())
        );

        let blob = image(true);
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();
        assert_eq!(
            commands(&dev.transport_mut().writes),
            [
                cmd(PartitionId::CoreCode, FlashCommand::EraseApplication),
                cmd(PartitionId::FlashConfig, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreConfig, FlashCommand::Write),
            ]
        );
    }

    #[test]
    fn test_write_bl9_flash_config_first() {
        let regs = partition_device(9, &TABLE);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        let blob = image(true);
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();
        assert_eq!(
            commands(&dev.transport_mut().writes),
            [
                cmd(PartitionId::FlashConfig, FlashCommand::Erase),
                cmd(PartitionId::FlashConfig, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::EraseApplication),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreConfig, FlashCommand::Write),
            ]
        );
    }

    #[test]
    fn test_plan_weights() {
        let blob = ContainerBuilder::new("TM3000")
            .container(ContainerId::CoreCode, &[0xaa; 64])
            .container(ContainerId::CoreConfig, &[0xbb; 32])
            .container(ContainerId::FixedLocationData, &[0x01; 16])
            .container(ContainerId::DisplayConfig, &[0x02; 16])
            .build()
            .unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        let params = FlashParameters {
            bootloader_id: [0, 7],
            block_size: 16,
            ..Default::default()
        };
        let plan = PartitionProtocol.plan(&params, &fw).unwrap();
        assert_eq!(
            plan_steps(&plan),
            [
                Step::DisableSleep,
                Step::VerifySignature,
                Step::WriteFixedLocationData,
                Step::EraseAll,
                Step::WriteUi,
                Step::WriteConfig,
                Step::WriteDisplayConfig,
            ]
        );
        let total: u32 = plan.iter().map(|p| u32::from(p.weight)).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_signature_follows_partition() {
        let regs = partition_device(7, &TABLE);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        let blob = ContainerBuilder::new("TM3000")
            .signed_container(ContainerId::CoreCode, &[0xaa; 64], &[0x55; 16])
            .container(ContainerId::CoreConfig, &[0xbb; 32])
            .build()
            .unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();
        assert_eq!(
            commands(&dev.transport_mut().writes)[2..],
            [
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Signature),
                cmd(PartitionId::CoreConfig, FlashCommand::Write),
            ]
        );
    }

    #[test]
    fn test_bootloader_partition_rewritten() {
        let table = [
            (PartitionId::Bootloader, 2),
            (PartitionId::CoreCode, 4),
            (PartitionId::CoreConfig, 2),
        ];
        let regs = partition_device(7, &table);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        assert!(dev.params().has_sbl);
        let blob = ContainerBuilder::new("TM3000")
            .container(ContainerId::BlImage, &[0x77; 32])
            .container(ContainerId::CoreCode, &[0xaa; 64])
            .container(ContainerId::CoreConfig, &[0xbb; 32])
            .build()
            .unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();
        assert_eq!(
            commands(&dev.transport_mut().writes)[..3],
            [
                cmd(PartitionId::Bootloader, FlashCommand::Erase),
                cmd(PartitionId::Bootloader, FlashCommand::Write),
                cmd(PartitionId::CoreCode, FlashCommand::Erase),
            ]
        );
    }

    struct AcceptKey(Vec<u8>);

    impl SignatureVerifier for AcceptKey {
        fn verify(&self, _payload: &[u8], _signature: &[u8], pubkey: &[u8]) -> bool {
            pubkey == self.0.as_slice()
        }
    }

    fn signed_image() -> Vec<u8> {
        ContainerBuilder::new("TM3000")
            .signed_container(ContainerId::CoreCode, &[0xaa; 64], &[0x55; 16])
            .container(ContainerId::CoreConfig, &[0xbb; 32])
            .build()
            .unwrap()
    }

    #[test]
    fn test_secure_check_before_erase() {
        let table = [
            (PartitionId::CoreCode, 4),
            (PartitionId::CoreConfig, 2),
            (PartitionId::Pubkey, 16),
        ];
        let regs = partition_device(7, &table);
        // the key comes back byte reversed from the payload register
        let start = usize::from(DATA + REG_PAYLOAD);
        let mut key = regs.regs[start..start + KEY_SIZE_2K].to_vec();
        key.reverse();

        let blob = signed_image();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();

        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        assert!(dev.params().has_pubkey);
        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress),
            Err(VerificationError::NoVerifier.into())
        );
        let wrong = AcceptKey(vec![0; KEY_SIZE_2K]);
        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), Some(&wrong), &mut NoProgress),
            Err(VerificationError::SignatureMismatch.into())
        );
        assert!(commands(&dev.transport_mut().writes).is_empty());

        let right = AcceptKey(key);
        write_firmware(&mut dev, &fw, &FlashOptions::default(), Some(&right), &mut NoProgress)
            .unwrap();
        assert!(!commands(&dev.transport_mut().writes).is_empty());
    }

    #[test]
    fn test_runtime_detach() {
        let mut regs = partition_device(7, &TABLE);
        regs.poke(DATA, &[0x00]);
        regs.attention = true;
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        assert!(!dev.in_bootloader());
        let blob = image(false);
        let fw = FirmwareContainer::parse(&blob, false).unwrap();

        // the mock never switches modes
        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress),
            Err(ProtocolError::NotInBootloader.into())
        );
        assert!(dev.transport_mut().writes.iter().any(|w| w.addr
            == DATA + REG_PARTITION_ID
            && w.data == [0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x07]));
    }

    #[test]
    fn test_device_error_in_status() {
        let mut regs = partition_device(7, &TABLE);
        regs.poke(DATA, &[0x02]);
        assert_eq!(
            RmiDevice::open(regs, CountingDelay::default()).err(),
            Some(crate::error::DeviceStatus::PartitionNotSupported.into())
        );
    }

    #[test]
    fn test_reopen_with_stale_error() {
        // bootloader still running, last command failed with not erased
        let mut regs = partition_device(7, &TABLE);
        regs.poke(DATA, &[0x86]);
        let dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        assert!(dev.in_bootloader());
        assert_eq!(dev.params().block_count_fw, 4);
    }
}
