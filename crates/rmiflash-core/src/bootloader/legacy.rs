//! Block protocol of F34 versions 0 and 1
//!
//! Firmware and configuration are written one block at a time through a
//! data window at the start of the F34 data registers. The command byte
//! lands right after the window, in the command/status register, and the
//! device clears it once the block is programmed.

use alloc::vec::Vec;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::BootloaderProtocol;
use crate::device::{RmiDevice, ENABLE_WAIT_MS, IDLE_WAIT_MS};
use crate::error::{ParseError, ProtocolError, Result, TransportError, VerificationError};
use crate::firmware::{FirmwareContainer, IMAGE_CONFIG, IMAGE_SIG, IMAGE_UI};
use crate::params::FlashParameters;
use crate::transport::{Delay, RegisterTransport};
use crate::update::{PlannedStep, Step, UpdateSession};

/// Program one firmware block
pub const CMD_WRITE_FW_BLOCK: u8 = 0x02;
/// Erase firmware and configuration
pub const CMD_ERASE_ALL: u8 = 0x03;
/// Program one configuration block
pub const CMD_WRITE_CONFIG_BLOCK: u8 = 0x06;
/// Program one signature block
pub const CMD_WRITE_SIGNATURE: u8 = 0x0b;
/// Unlock flash programming
pub const CMD_ENABLE_FLASH_PROG: u8 = 0x0f;

const ERASE_WAIT_MS: u32 = 5 * 1000;
const SIGNATURE_SETTLE_MS: u32 = 1000;

const QUERY_PROPERTIES_OFFSET: u16 = 0x02;
const QUERY_PROPERTIES_2_OFFSET: u16 = 0x09;
const QUERY_SIG_SIZE_OFFSET: u16 = 0x0a;
const QUERY_PUBKEY_OFFSET: u16 = 0x0e;
const PROPERTIES_2_HAS_SIGNATURE: u8 = 0x01;

const F01_DATA_BOOTLOADER_MODE: u8 = 0x40;

const PUBKEY_BLOCK_SIZE: usize = 3;
const PUBKEY_RETRIES: usize = 3;

/// Flash properties at F34 query base + 2
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlockQuery {
    properties: u8,
    block_size: U16,
    fw_blocks: U16,
    cfg_blocks: U16,
}

/// F34 versions 0 and 1
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyProtocol;

impl LegacyProtocol {
    fn erase_all<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        let status_addr = dev.params().status_addr;
        dev.write(status_addr, &[CMD_ERASE_ALL])?;
        dev.delay_ms(ERASE_WAIT_MS);
        dev.enter_rmi_mode(false)?;
        dev.wait_for_idle(ERASE_WAIT_MS, true)
    }

    fn write_address_zero<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<()> {
        let f34 = dev.f34()?;
        dev.write(f34.data_base, &0u16.to_le_bytes())
    }

    fn write_blocks<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        cmd: u8,
        data: &[u8],
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let f34 = dev.f34()?;
        let addr = f34.data_base + dev.variant().block_data_offset();
        let block_size = usize::from(dev.params().block_size);
        let total = data.len().div_ceil(block_size);

        let mut req = Vec::with_capacity(block_size + 1);
        for (i, block) in data.chunks(block_size).enumerate() {
            req.clear();
            req.extend_from_slice(block);
            req.push(cmd);
            dev.write(addr, &req)?;
            dev.wait_for_idle(IDLE_WAIT_MS, false)?;
            session.progress.blocks(i + 1, total);
        }
        Ok(())
    }

    /// Read the RSA modulus through the packet register
    ///
    /// The key streams out in three-byte blocks, least significant block
    /// first. Reads occasionally come back short, so the whole key is read
    /// again when its length is off.
    fn read_pubkey<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<Vec<u8>> {
        let f34 = dev.f34()?;
        let len = usize::from(dev.params().sig_size / 8);
        let remain = len % PUBKEY_BLOCK_SIZE;
        let count = len.div_ceil(PUBKEY_BLOCK_SIZE);

        for attempt in 0..=PUBKEY_RETRIES {
            // any other register read resets the packet register offset
            dev.query_status()?;
            dev.enter_rmi_mode(false)?;

            let mut key = Vec::with_capacity(len);
            for block in 0..count {
                let mut res = dev.read_packet_register(
                    f34.query_base + QUERY_PUBKEY_OFFSET,
                    PUBKEY_BLOCK_SIZE,
                )?;
                if remain > 0 && block + 1 == count {
                    res.truncate(remain);
                }
                res.reverse();
                res.extend_from_slice(&key);
                key = res;
            }
            if key.len() == len {
                return Ok(key);
            }
            log::debug!(
                "public key length {} != {}, attempt {}",
                key.len(),
                len,
                attempt + 1
            );
        }
        Err(VerificationError::PubkeyUnavailable.into())
    }

    fn secure_check<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
        fw: &FirmwareContainer,
        session: &mut UpdateSession<'_>,
    ) -> Result<()> {
        let payload = fw.require(IMAGE_UI)?;
        let signature = fw.require(IMAGE_SIG)?;
        let Some(verifier) = session.verifier()? else {
            return Ok(());
        };
        let pubkey = self.read_pubkey(dev)?;
        session.verify(verifier, IMAGE_UI, payload, signature, &pubkey)
    }
}

impl BootloaderProtocol for LegacyProtocol {
    fn setup<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        let f34 = dev.f34()?;
        let blid = dev.read(f34.query_base, 2)?;

        let props2 = dev.read(f34.query_base + QUERY_PROPERTIES_2_OFFSET, 1)?;
        let sig_size = if props2[0] & PROPERTIES_2_HAS_SIGNATURE != 0 {
            let raw = dev.read(f34.query_base + QUERY_SIG_SIZE_OFFSET, 2)?;
            u16::from_le_bytes([raw[0], raw[1]])
        } else {
            0
        };

        let raw = dev.read(
            f34.query_base + QUERY_PROPERTIES_OFFSET,
            core::mem::size_of::<BlockQuery>(),
        )?;
        let (query, _) = BlockQuery::read_from_prefix(&raw).map_err(|_| TransportError::ShortRead)?;
        let block_size = query.block_size.get();
        if block_size == 0 {
            return Err(ProtocolError::InvalidGeometry {
                block_size,
                config_length: 0,
            }
            .into());
        }

        let status_addr = f34.data_base + dev.variant().block_data_offset() + block_size;
        let params = dev.params_mut();
        params.bootloader_id = [blid[0], blid[1]];
        params.sig_size = sig_size;
        params.block_size = block_size;
        params.block_count_fw = query.fw_blocks.get();
        params.block_count_cfg = query.cfg_blocks.get();
        params.status_addr = status_addr;

        log::debug!(
            "F34 bl:{}.{} props:0x{:02x} block:{} fw:{} cfg:{} sig:{} status:0x{:02x}",
            blid[1],
            blid[0],
            query.properties,
            block_size,
            params.block_count_fw,
            params.block_count_cfg,
            sig_size,
            status_addr
        );
        Ok(())
    }

    fn query_status<T: RegisterTransport, D: Delay>(
        &self,
        dev: &mut RmiDevice<T, D>,
    ) -> Result<bool> {
        let f01 = dev.f01()?;
        let data = dev.read(f01.data_base, 1)?;
        Ok(data[0] & F01_DATA_BOOTLOADER_MODE != 0)
    }

    fn detach<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        dev.disable_irqs()?;
        dev.write_bus_select(0)?;
        dev.write_bootloader_id()?;
        let status_addr = dev.params().status_addr;
        dev.write(status_addr, &[CMD_ENABLE_FLASH_PROG])?;
        dev.delay_ms(ENABLE_WAIT_MS);
        Ok(())
    }

    fn plan(&self, params: &FlashParameters, fw: &FirmwareContainer) -> Result<Vec<PlannedStep>> {
        fw.require(IMAGE_UI)?;
        fw.require(IMAGE_CONFIG)?;
        if fw.sig_size == 0 && params.sig_size != 0 {
            return Err(ParseError::SecurityMismatch { device_secure: true }.into());
        }
        if fw.sig_size != 0 && params.sig_size == 0 {
            return Err(ParseError::SecurityMismatch {
                device_secure: false,
            }
            .into());
        }

        let signed = fw.image(IMAGE_SIG).is_some();
        let mut plan = Vec::new();
        plan.push(PlannedStep::new(Step::DisableSleep, 0));
        if signed {
            plan.push(PlannedStep::new(Step::VerifySignature, 1));
        }
        plan.push(PlannedStep::new(Step::EraseAll, 5));
        plan.push(PlannedStep::new(Step::WriteUi, 80));
        if signed && params.sig_size != 0 {
            plan.push(PlannedStep::new(Step::WriteSignature, 4));
        }
        plan.push(PlannedStep::new(Step::WriteConfig, 10));
        Ok(plan)
    }

    fn begin<T: RegisterTransport, D: Delay>(&self, dev: &mut RmiDevice<T, D>) -> Result<()> {
        dev.enter_rmi_mode(false)?;
        dev.wait_for_idle(0, true).inspect_err(|e| log::error!("not idle: {}", e))
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
            Step::EraseAll => {
                dev.write_bootloader_id()?;
                self.erase_all(dev)
            }
            Step::WriteUi => {
                self.write_address_zero(dev)?;
                self.write_blocks(dev, CMD_WRITE_FW_BLOCK, fw.require(IMAGE_UI)?, session)
            }
            Step::WriteSignature => {
                self.write_address_zero(dev)?;
                self.write_blocks(dev, CMD_WRITE_SIGNATURE, fw.require(IMAGE_SIG)?, session)?;
                dev.delay_ms(SIGNATURE_SETTLE_MS);
                Ok(())
            }
            Step::WriteConfig => {
                dev.enter_rmi_mode(false)?;
                self.write_address_zero(dev)?;
                self.write_blocks(dev, CMD_WRITE_CONFIG_BLOCK, fw.require(IMAGE_CONFIG)?, session)
            }
            other => {
                log::debug!("{} not used by the block protocol", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{legacy_device, F01_DATA, F34_QUERY};
    use crate::error::Error;
    use crate::firmware::build_legacy;
    use crate::transport::mock::{CountingDelay, MockRegisters, WriteRecord};
    use crate::transport::TransportKind;
    use crate::update::{plan_steps, write_firmware, FlashOptions, NoProgress, SignatureVerifier};
    use alloc::vec;

    fn block_commands(writes: &[WriteRecord], window: u16, block_size: usize) -> Vec<u8> {
        writes
            .iter()
            .filter(|w| w.addr == window && w.data.len() == block_size + 1)
            .map(|w| w.data[block_size])
            .collect()
    }

    fn bootloader_device() -> MockRegisters {
        let mut regs = legacy_device(TransportKind::Hid);
        regs.poke(F01_DATA, &[F01_DATA_BOOTLOADER_MODE]);
        regs
    }

    #[test]
    fn test_setup_reads_geometry() {
        let mut regs = legacy_device(TransportKind::Hid);
        regs.poke(F34_QUERY + 9, &[PROPERTIES_2_HAS_SIGNATURE, 0x00, 0x08]);
        let dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        let params = dev.params();
        assert_eq!(params.bootloader_id, [0x00, 0x05]);
        assert_eq!(params.block_size, 16);
        assert_eq!(params.block_count_fw, 4);
        assert_eq!(params.block_count_cfg, 2);
        assert_eq!(params.sig_size, 0x800);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let mut regs = legacy_device(TransportKind::Hid);
        regs.poke(F34_QUERY + 3, &[0x00, 0x00]);
        assert!(matches!(
            RmiDevice::open(regs, CountingDelay::default()),
            Err(Error::Protocol(ProtocolError::InvalidGeometry { block_size: 0, .. }))
        ));
    }

    #[test]
    fn test_write_firmware_block_order() {
        let mut dev = RmiDevice::open(bootloader_device(), CountingDelay::default()).unwrap();
        assert!(dev.in_bootloader());
        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();

        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();

        let writes = &dev.transport_mut().writes;
        assert_eq!(
            block_commands(writes, 2, 16),
            [
                CMD_WRITE_FW_BLOCK,
                CMD_WRITE_FW_BLOCK,
                CMD_WRITE_FW_BLOCK,
                CMD_WRITE_FW_BLOCK,
                CMD_WRITE_CONFIG_BLOCK,
                CMD_WRITE_CONFIG_BLOCK,
            ]
        );
        // erase lands in the status register before any block
        let erase = writes
            .iter()
            .position(|w| w.addr == 18 && w.data == [CMD_ERASE_ALL])
            .unwrap();
        let first_block = writes.iter().position(|w| w.data.len() == 17).unwrap();
        assert!(erase < first_block);
        // unlocked with the bootloader id before the erase
        assert!(writes[..erase]
            .iter()
            .any(|w| w.addr == 2 && w.data == [0x00, 0x05]));

        // every block waits for an idle status before the next one goes out
        let blocks: Vec<usize> = writes
            .iter()
            .enumerate()
            .filter(|(_, w)| w.addr == 2 && w.data.len() == 17)
            .map(|(i, _)| i)
            .collect();
        let reads = &dev.transport_mut().reads;
        for (n, &block) in blocks.iter().enumerate() {
            let next = blocks.get(n + 1).copied().unwrap_or(usize::MAX);
            assert!(
                reads
                    .iter()
                    .any(|r| r.addr == 18 && r.after_writes > block && r.after_writes <= next),
                "no status read after block {}",
                n
            );
        }
    }

    #[test]
    fn test_runtime_device_detach() {
        let mut dev = RmiDevice::open(
            legacy_device(TransportKind::Hid),
            CountingDelay::default(),
        )
        .unwrap();
        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();

        // the mock never switches modes
        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress),
            Err(ProtocolError::NotInBootloader.into())
        );
        let writes = &dev.transport_mut().writes;
        assert!(writes
            .iter()
            .any(|w| w.addr == 18 && w.data == [CMD_ENABLE_FLASH_PROG]));
        assert!(!writes.iter().any(|w| w.data == [CMD_ERASE_ALL]));
    }

    #[test]
    fn test_unsigned_image_on_secure_device() {
        let mut regs = bootloader_device();
        regs.poke(F34_QUERY + 9, &[PROPERTIES_2_HAS_SIGNATURE, 0x00, 0x08]);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();

        assert_eq!(
            write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress),
            Err(ParseError::SecurityMismatch { device_secure: true }.into())
        );
        assert!(!dev.transport_mut().writes.iter().any(|w| w.data == [CMD_ERASE_ALL]));
    }

    #[test]
    fn test_split_status_variant() {
        let mut regs = MockRegisters::new(TransportKind::Hid);
        regs.pdt_entry(0xe9, [0x40, 0x30, 0x20, 0x10, 0x01, 0x01]);
        // F34 function version 1
        regs.pdt_entry(0xe3, [0x80, 0x00, 0x00, 0x00, 0x21, 0x34]);
        regs.poke(0x40 + 11, b"TM3000");
        regs.poke(F34_QUERY, &[0x00, 0x06]);
        regs.poke(F34_QUERY + 2, &[0x00, 0x10, 0x00, 0x04, 0x00, 0x02, 0x00]);
        regs.poke(F01_DATA, &[F01_DATA_BOOTLOADER_MODE]);
        regs.poke(1 + 16, &[0x00, 0x80]);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();
        assert_eq!(dev.params().status_addr, 17);

        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        write_firmware(&mut dev, &fw, &FlashOptions::default(), None, &mut NoProgress).unwrap();
        assert_eq!(block_commands(&dev.transport_mut().writes, 1, 16).len(), 6);
    }

    #[test]
    fn test_plan_secure_device() {
        let params = FlashParameters {
            sig_size: 0x800,
            block_size: 16,
            ..Default::default()
        };
        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        assert!(LegacyProtocol.plan(&params, &fw).is_err());

        // unsigned image on an unsigned device
        let params = FlashParameters::default();
        assert_eq!(
            plan_steps(&LegacyProtocol.plan(&params, &fw).unwrap()),
            [Step::DisableSleep, Step::EraseAll, Step::WriteUi, Step::WriteConfig]
        );
    }

    struct AcceptKey(Vec<u8>);

    impl SignatureVerifier for AcceptKey {
        fn verify(&self, _payload: &[u8], _signature: &[u8], pubkey: &[u8]) -> bool {
            pubkey == self.0.as_slice()
        }
    }

    #[test]
    fn test_pubkey_assembly() {
        let mut regs = bootloader_device();
        // 56 bit key: two full blocks and one byte
        regs.poke(F34_QUERY + 9, &[PROPERTIES_2_HAS_SIGNATURE, 56, 0x00]);
        regs.poke(F34_QUERY + QUERY_PUBKEY_OFFSET, &[0x01, 0x02, 0x03]);
        let mut dev = RmiDevice::open(regs, CountingDelay::default()).unwrap();

        // the mock packet register repeats the same three bytes
        let key = LegacyProtocol.read_pubkey(&mut dev).unwrap();
        assert_eq!(key, vec![0x01, 0x03, 0x02, 0x01, 0x03, 0x02, 0x01]);

        let options = FlashOptions::default();
        let verifier = AcceptKey(key);
        let mut progress = NoProgress;
        let mut session = UpdateSession {
            options: &options,
            verifier: Some(&verifier),
            progress: &mut progress,
        };
        let blob = build_legacy("TM3000", &[0xaa; 64], &[0xbb; 32]).unwrap();
        let fw = FirmwareContainer::parse(&blob, false).unwrap();
        // no sig image in this container
        assert_eq!(
            LegacyProtocol.secure_check(&mut dev, &fw, &mut session),
            Err(ParseError::MissingImage(IMAGE_SIG).into())
        );
    }
}
