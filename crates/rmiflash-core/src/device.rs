//! RMI device session
//!
//! [`RmiDevice`] owns a transport and the state discovered from it: the
//! function table, the F01 identity and the flash parameters of the F34
//! bootloader. It also provides the register level helpers shared by all
//! bootloader protocols (reset, interrupt masking, idle polling).

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::bootloader::{BootloaderVariant, FlashStatus};
use crate::error::{DeviceStatus, Error, Result, TransportError};
use crate::firmware::header::PRODUCT_ID_LENGTH;
use crate::firmware::product_id_to_str;
use crate::params::FlashParameters;
use crate::pdt::{self, FunctionTable, RmiFunction, FUNCTION_DEVICE_CONTROL, FUNCTION_FLASH};
use crate::transport::{Delay, DeviceMode, RegisterTransport, TransportKind, WriteFlags};

/// Settle time after a reset
pub const RESET_DELAY_MS: u32 = 100;
/// Attention timeout for one block write
pub const IDLE_WAIT_MS: u32 = 500;
/// Settle time after enabling flash programming
pub const ENABLE_WAIT_MS: u32 = 300;

const POLL_TRIES: u32 = 20;
const POLL_INTERVAL_MS: u32 = 20;

const F01_BASIC_QUERY_LEN: usize = 11;
const F01_PRODUCT_ID_OFFSET: u16 = 11;
const F01_QRY1_HAS_LTS: u8 = 1 << 2;
const F01_QRY1_HAS_SENSOR_ID: u8 = 1 << 3;
const F01_QRY1_HAS_PROPS_2: u8 = 1 << 7;
const F01_LTS_RESERVED_SIZE: u16 = 19;
const F01_QRY42_DS4_QUERIES: u8 = 1 << 0;
const F01_QRY43_01_PACKAGE_ID: u8 = 1 << 0;
const F01_QRY43_01_BUILD_ID: u8 = 1 << 1;

const F01_CMD_DEVICE_RESET: u8 = 0x01;
const F01_CTRL0_NOSLEEP: u8 = 1 << 2;
const F01_CTRL0_SLEEP_MODE_MASK: u8 = 0x03;
const F01_CTRL0_SLEEP_MODE_NORMAL: u8 = 0x00;

const F34_STATUS_MASK: u8 = 0x1f;

/// Product identity read from F01
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Product id, with the sub id appended on PS/2 (`TM3000-004`)
    pub product_id: String,
    /// Firmware major version
    pub version_major: u8,
    /// Firmware minor version
    pub version_minor: u8,
    /// Build id from the F01 product info registers
    pub build_id: u32,
}

/// One opened RMI device
pub struct RmiDevice<T, D> {
    transport: T,
    delay: D,
    functions: FunctionTable,
    identity: DeviceIdentity,
    variant: BootloaderVariant,
    params: FlashParameters,
    in_bootloader: bool,
}

impl<T: RegisterTransport, D: Delay> RmiDevice<T, D> {
    /// Scan the device behind `transport` and read its identity and flash layout
    pub fn open(transport: T, delay: D) -> Result<Self> {
        let mut dev = Self {
            transport,
            delay,
            functions: FunctionTable::default(),
            identity: DeviceIdentity::default(),
            variant: BootloaderVariant::Legacy,
            params: FlashParameters::default(),
            in_bootloader: false,
        };
        dev.setup()?;
        Ok(dev)
    }

    /// Re-read everything the session knows about the device
    ///
    /// Needed after every mode switch, since the bootloader and the
    /// application firmware publish different PDTs.
    pub fn setup(&mut self) -> Result<()> {
        let max_page = self.transport.kind().max_page();
        self.functions = pdt::scan(&mut self.transport, max_page)?;

        let f01 = self.f01()?;
        self.transport.set_page(0)?;
        self.transport.enter_rmi_mode(false)?;
        self.identity = self.read_identity(&f01)?;

        let f34 = self.f34()?;
        self.variant = BootloaderVariant::from_function_version(f34.version)?;
        self.params = FlashParameters {
            build_id: self.identity.build_id,
            ..Default::default()
        };
        let variant = self.variant;
        variant.setup(self)?;
        self.in_bootloader = variant.query_status(self)?;

        log::debug!(
            "{} product:{} fw:{} bl:{} bootloader-mode:{}",
            self.variant,
            self.identity.product_id,
            self.firmware_version(),
            self.bootloader_version(),
            self.in_bootloader
        );
        Ok(())
    }

    fn read_identity(&mut self, f01: &RmiFunction) -> Result<DeviceIdentity> {
        let basic = self.read(f01.query_base, F01_BASIC_QUERY_LEN)?;
        let has_lts = basic[1] & F01_QRY1_HAS_LTS != 0;
        let has_sensor_id = basic[1] & F01_QRY1_HAS_SENSOR_ID != 0;
        let has_query42 = basic[1] & F01_QRY1_HAS_PROPS_2 != 0;

        let mut addr = f01.query_base + F01_PRODUCT_ID_OFFSET;
        let raw_id = self.read(addr, PRODUCT_ID_LENGTH)?;
        let product_id = match self.transport.query_product_sub_id()? {
            Some(sub_id) if sub_id != 0 => {
                let prefix = product_id_to_str(&raw_id[..6]);
                format!("{}-{:03}", prefix, sub_id)
            }
            _ => product_id_to_str(&raw_id).to_string(),
        };

        let mut prod_info_addr = addr + 6;
        addr += 10;
        if has_lts {
            addr += 1;
        }
        if has_sensor_id {
            addr += 1;
        }
        if has_lts {
            addr += F01_LTS_RESERVED_SIZE;
        }

        let mut has_ds4_queries = false;
        if has_query42 {
            let q42 = self.read(addr, 1)?;
            addr += 1;
            has_ds4_queries = q42[0] & F01_QRY42_DS4_QUERIES != 0;
        }
        if has_ds4_queries {
            // DS4 query length, nothing after query 43 is used
            self.read(addr, 1)?;
            addr += 1;
        }
        let q43 = self.read(addr, 1)?;
        let has_package_id_query = q43[0] & F01_QRY43_01_PACKAGE_ID != 0;
        let has_build_id_query = q43[0] & F01_QRY43_01_BUILD_ID != 0;
        if has_package_id_query {
            prod_info_addr += 1;
        }

        let mut build_id = 0;
        if has_build_id_query {
            let raw = self.read(prod_info_addr, 3)?;
            build_id = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]);
        }
        if let Some(id) = self.transport.query_build_id()? {
            build_id = id;
        }

        Ok(DeviceIdentity {
            product_id,
            version_major: basic[2],
            version_minor: basic[3],
            build_id,
        })
    }

    /// Read `len` registers, failing unless every byte arrives
    pub fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        let buf = self.transport.read(addr, len)?;
        if buf.len() != len {
            return Err(TransportError::ShortRead.into());
        }
        Ok(buf)
    }

    /// Read a packet register
    pub fn read_packet_register(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        self.transport.read_packet_register(addr, len)
    }

    /// Write registers starting at `addr`
    pub fn write(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        self.transport.write(addr, data)
    }

    /// Sleep through the session's delay provider
    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Re-enter RMI register mode on transports that leave it on their own
    pub fn enter_rmi_mode(&mut self, force: bool) -> Result<()> {
        self.transport.enter_rmi_mode(force)
    }

    /// Reset the device through F01
    pub fn reset(&mut self) -> Result<()> {
        let f01 = self.f01()?;
        self.transport.write_with_flags(
            f01.command_base,
            &[F01_CMD_DEVICE_RESET],
            WriteFlags::ALLOW_FAILURE,
        )?;
        self.delay.delay_ms(RESET_DELAY_MS);
        Ok(())
    }

    /// Mask interrupts of everything except F01 and F34
    pub fn disable_irqs(&mut self) -> Result<()> {
        let f01 = self.f01()?;
        let f34 = self.f34()?;
        let mask = f34.interrupt_mask | f01.interrupt_mask;
        self.write(f01.control_base + 1, &[mask])
    }

    /// Keep the controller awake while flashing
    ///
    /// Only HID devices honour the sleep mode bits, PS/2 is left alone.
    pub fn disable_sleep(&mut self) -> Result<()> {
        if self.transport.kind() != TransportKind::Hid {
            return Ok(());
        }
        let f01 = self.f01()?;
        let mut ctrl = self.read(f01.control_base, 1)?;
        ctrl[0] |= F01_CTRL0_NOSLEEP;
        ctrl[0] &= !F01_CTRL0_SLEEP_MODE_MASK;
        ctrl[0] |= F01_CTRL0_SLEEP_MODE_NORMAL;
        self.write(f01.control_base, &ctrl)
    }

    /// Write the bootloader id into the block data window to unlock flashing
    pub fn write_bootloader_id(&mut self) -> Result<()> {
        let f34 = self.f34()?;
        let addr = f34.data_base + self.variant.block_data_offset();
        let blid = self.params.bootloader_id;
        self.write(addr, &blid)
    }

    /// Select the bus on transports that share one
    pub fn write_bus_select(&mut self, bus: u8) -> Result<()> {
        self.transport.write_bus_select(bus)
    }

    /// Wait until the block bootloader has finished its last command
    ///
    /// With a non-zero `timeout_ms` an attention notification ends the
    /// wait, unless `refresh` asks for the status register to be read
    /// regardless.
    pub fn wait_for_idle(&mut self, timeout_ms: u32, refresh: bool) -> Result<()> {
        let f34 = self.f34()?;
        if timeout_ms > 0
            && self.transport.wait_for_attention(f34.interrupt_mask, timeout_ms)?
            && !refresh
        {
            return Ok(());
        }
        let layout = self.variant.status_layout();
        let raw = self.read(self.params.status_addr, layout.read_len())?;
        let status = FlashStatus::decode(layout, &raw).ok_or(TransportError::ShortRead)?;
        status.check_idle(self.transport.kind() == TransportKind::Ps2)
    }

    /// Read the partition bootloader status once
    pub fn poll(&mut self) -> Result<()> {
        let f34 = self.f34()?;
        let res = self.read(f34.data_base, 1)?;
        match DeviceStatus::from_code(res[0] & F34_STATUS_MASK) {
            Some(status) => Err(status.into()),
            None => Ok(()),
        }
    }

    /// Poll until the partition bootloader reports no error
    pub fn poll_wait(&mut self) -> Result<()> {
        let mut last = Error::Transport(TransportError::Timeout);
        for _ in 0..POLL_TRIES {
            self.delay.delay_ms(POLL_INTERVAL_MS);
            match self.poll() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("F34 poll: {}", e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Refresh the bootloader mode flag from the device
    pub fn query_status(&mut self) -> Result<bool> {
        let variant = self.variant;
        self.in_bootloader = variant.query_status(self)?;
        Ok(self.in_bootloader)
    }

    /// Reconnect the transport after a mode switch and rescan if still reachable
    ///
    /// Returns `false` when the transport lost access to the register map.
    pub fn rebind(&mut self, mode: DeviceMode) -> Result<bool> {
        if !self.transport.rebind(mode)? {
            return Ok(false);
        }
        self.setup()?;
        Ok(true)
    }

    /// Leave the bootloader and start the application firmware
    pub fn attach(&mut self) -> Result<()> {
        if !self.in_bootloader {
            log::debug!("already in runtime mode, skipping");
            return Ok(());
        }

        if self.transport.kind() == TransportKind::Ps2 {
            // the bootloader drops back to PS/2 mode on its own
            self.delay.delay_ms(2000);
            self.transport.enter_rmi_mode(true)?;
            self.reset()?;
            self.delay.delay_ms(5000);
        } else {
            self.reset()?;
        }
        self.in_bootloader = false;

        if self.rebind(DeviceMode::Runtime)? {
            log::info!("device now runs firmware {}", self.firmware_version());
        }
        Ok(())
    }

    /// Function `number` from the PDT
    pub fn function(&self, number: u8) -> Result<RmiFunction> {
        self.functions.get(number).copied()
    }

    /// Device control function
    pub fn f01(&self) -> Result<RmiFunction> {
        self.function(FUNCTION_DEVICE_CONTROL)
    }

    /// Flash function
    pub fn f34(&self) -> Result<RmiFunction> {
        self.function(FUNCTION_FLASH)
    }

    /// Functions found by the last scan
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// F01 identity
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Bootloader protocol in use
    pub fn variant(&self) -> BootloaderVariant {
        self.variant
    }

    /// Flash parameters
    pub fn params(&self) -> &FlashParameters {
        &self.params
    }

    /// Flash parameters, for the protocol setup step
    pub fn params_mut(&mut self) -> &mut FlashParameters {
        &mut self.params
    }

    /// Whether the device runs its bootloader
    pub fn in_bootloader(&self) -> bool {
        self.in_bootloader
    }

    /// Channel type of the underlying transport
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Firmware version as `major.minor.build`
    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.identity.version_major, self.identity.version_minor, self.params.build_id
        )
    }

    /// Bootloader version as `major.0.0`
    pub fn bootloader_version(&self) -> String {
        format!("{}.0.0", self.params.bootloader_major())
    }
}
