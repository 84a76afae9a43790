//! Register transport traits
//!
//! RMI devices expose a flat 16-bit register space split into 256-byte
//! pages. Every physical channel (HID reports, PS/2 back-door commands, the
//! in-memory emulator) implements [`RegisterTransport`] so the PDT scan and
//! bootloader protocols stay independent of the wire format.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::Result;

/// Page select register, present on every page
pub const PAGE_SELECT_REGISTER: u16 = 0xff;
/// Bus select register used by PS/2 devices
pub const BUS_SELECT_REGISTER: u16 = 0xfe;

/// Physical channel behind a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB or I2C HID with RMI reports
    Hid,
    /// PS/2 auxiliary port in serio_raw mode
    Ps2,
}

impl TransportKind {
    /// Highest page the PDT scan visits on this channel
    pub const fn max_page(self) -> u8 {
        match self {
            Self::Hid => 0xff,
            Self::Ps2 => 0x01,
        }
    }
}

impl core::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Hid => write!(f, "hid"),
            Self::Ps2 => write!(f, "ps2"),
        }
    }
}

/// Firmware the device is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Application firmware
    Runtime,
    /// Bootloader, flash programming enabled
    Bootloader,
}

bitflags! {
    /// Per-write behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u8 {
        /// The device may not acknowledge this write (reset)
        const ALLOW_FAILURE = 1 << 0;
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags::empty()
    }
}

/// Blocking register access to one RMI device
///
/// Reads and writes either transfer every requested byte or fail. There is
/// no partial success, and retries only happen inside the implementation.
pub trait RegisterTransport {
    /// Channel type, used for the few protocol steps that differ per bus
    fn kind(&self) -> TransportKind;

    /// Read `len` bytes starting at `addr`
    fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at `addr`
    fn write_with_flags(&mut self, addr: u16, data: &[u8], flags: WriteFlags) -> Result<()>;

    /// Write `data` starting at `addr`, failing if the device does not accept it
    fn write(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        self.write_with_flags(addr, data, WriteFlags::empty())
    }

    /// Select the register page used by following accesses
    fn set_page(&mut self, page: u8) -> Result<()>;

    /// Wait for an attention notification for any of `source_mask`
    ///
    /// Returns `Ok(false)` on timeout or when the channel cannot deliver
    /// attention at all, in which case callers read the status register.
    fn wait_for_attention(&mut self, source_mask: u8, timeout_ms: u32) -> Result<bool>;

    /// Read a packet register, which streams successive bytes from one address
    fn read_packet_register(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        self.read(addr, len)
    }

    /// Put the channel into RMI register access mode
    ///
    /// `force` re-sends the mode switch even if the transport believes it is
    /// already active.
    fn enter_rmi_mode(&mut self, _force: bool) -> Result<()> {
        Ok(())
    }

    /// Write the bus select register, needed only where the bus is shared
    fn write_bus_select(&mut self, _bus: u8) -> Result<()> {
        Ok(())
    }

    /// Product sub-id appended to the product id on some channels
    fn query_product_sub_id(&mut self) -> Result<Option<u8>> {
        Ok(None)
    }

    /// Firmware build id reported outside the register map
    fn query_build_id(&mut self) -> Result<Option<u32>> {
        Ok(None)
    }

    /// Reconnect after the device switched to `mode`
    ///
    /// Mode switches re-enumerate the device on some buses, so the old
    /// handle must not be reused. Returns `false` when the register
    /// interface is no longer reachable through this transport (the
    /// kernel driver took the device back).
    fn rebind(&mut self, _mode: DeviceMode) -> Result<bool> {
        Ok(true)
    }
}

impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        (**self).read(addr, len)
    }

    fn write_with_flags(&mut self, addr: u16, data: &[u8], flags: WriteFlags) -> Result<()> {
        (**self).write_with_flags(addr, data, flags)
    }

    fn set_page(&mut self, page: u8) -> Result<()> {
        (**self).set_page(page)
    }

    fn wait_for_attention(&mut self, source_mask: u8, timeout_ms: u32) -> Result<bool> {
        (**self).wait_for_attention(source_mask, timeout_ms)
    }

    fn read_packet_register(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        (**self).read_packet_register(addr, len)
    }

    fn enter_rmi_mode(&mut self, force: bool) -> Result<()> {
        (**self).enter_rmi_mode(force)
    }

    fn write_bus_select(&mut self, bus: u8) -> Result<()> {
        (**self).write_bus_select(bus)
    }

    fn query_product_sub_id(&mut self) -> Result<Option<u8>> {
        (**self).query_product_sub_id()
    }

    fn query_build_id(&mut self) -> Result<Option<u32>> {
        (**self).query_build_id()
    }

    fn rebind(&mut self, mode: DeviceMode) -> Result<bool> {
        (**self).rebind(mode)
    }
}

/// Blocking sleep used for settle and backoff delays
pub trait Delay {
    /// Sleep for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32);
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Delay that returns immediately, for tests and emulated devices
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Delay backed by `std::thread::sleep`
#[cfg(feature = "std")]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

#[cfg(feature = "std")]
impl Delay for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Register-space mock shared by the core unit tests

    use super::*;
    use crate::error::{Error, TransportError};
    use alloc::vec;

    /// One recorded register write
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct WriteRecord {
        pub addr: u16,
        pub data: Vec<u8>,
    }

    /// One recorded register read
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadRecord {
        pub addr: u16,
        /// Number of writes issued before this read
        pub after_writes: usize,
    }

    /// Flat 64 KiB register space that records writes
    pub struct MockRegisters {
        pub kind: TransportKind,
        pub regs: Vec<u8>,
        pub writes: Vec<WriteRecord>,
        pub reads: Vec<ReadRecord>,
        pub attention: bool,
        pub pages: Vec<u8>,
    }

    impl MockRegisters {
        pub fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                regs: vec![0; 0x10000],
                writes: Vec::new(),
                reads: Vec::new(),
                attention: false,
                pages: Vec::new(),
            }
        }

        pub fn poke(&mut self, addr: u16, data: &[u8]) {
            let start = addr as usize;
            self.regs[start..start + data.len()].copy_from_slice(data);
        }

        /// Install a PDT entry at `addr`
        pub fn pdt_entry(&mut self, addr: u16, entry: [u8; 6]) {
            self.poke(addr, &entry);
        }
    }

    impl RegisterTransport for MockRegisters {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn read(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
            let start = addr as usize;
            if start + len > self.regs.len() {
                return Err(Error::Transport(TransportError::ShortRead));
            }
            self.reads.push(ReadRecord {
                addr,
                after_writes: self.writes.len(),
            });
            Ok(self.regs[start..start + len].to_vec())
        }

        fn write_with_flags(&mut self, addr: u16, data: &[u8], _flags: WriteFlags) -> Result<()> {
            self.writes.push(WriteRecord {
                addr,
                data: data.to_vec(),
            });
            Ok(())
        }

        fn set_page(&mut self, page: u8) -> Result<()> {
            self.pages.push(page);
            Ok(())
        }

        fn wait_for_attention(&mut self, _source_mask: u8, _timeout_ms: u32) -> Result<bool> {
            Ok(self.attention)
        }
    }

    /// Delay that sums the requested time
    #[derive(Default)]
    pub struct CountingDelay {
        pub total_ms: u64,
    }

    impl Delay for CountingDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.total_ms += u64::from(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_default_write_has_no_flags() {
        let mut regs = MockRegisters::new(TransportKind::Hid);
        regs.write(0x10, &[1, 2]).unwrap();
        assert_eq!(regs.writes.len(), 1);
        assert_eq!(regs.writes[0].addr, 0x10);
        assert_eq!(regs.writes[0].data, [1, 2]);
    }

    #[test]
    fn test_boxed_transport_forwards() {
        let mut regs = MockRegisters::new(TransportKind::Ps2);
        regs.poke(0x20, &[0xaa, 0xbb]);
        let mut boxed: Box<dyn RegisterTransport> = Box::new(regs);
        assert_eq!(boxed.kind(), TransportKind::Ps2);
        assert_eq!(boxed.read_packet_register(0x20, 2).unwrap(), [0xaa, 0xbb]);
        assert_eq!(boxed.query_build_id().unwrap(), None);
    }

    #[test]
    fn test_max_page_per_kind() {
        assert_eq!(TransportKind::Hid.max_page(), 0xff);
        assert_eq!(TransportKind::Ps2.max_page(), 0x01);
    }
}
