//! Page description table scan
//!
//! Every 256-register page carries a table of six-byte function descriptors
//! growing downwards from 0xe9. The scan walks pages from 0 until a page
//! holds no descriptors, accumulating interrupt source counts so each
//! function knows its bit in the interrupt enable register.

use alloc::vec::Vec;

use crate::error::{Error, Result, TransportError};
use crate::transport::RegisterTransport;

/// Registers per page
pub const PAGE_SIZE: u16 = 0x100;
/// Offset of the first (highest) descriptor in a page
pub const PAGE_SCAN_START: u16 = 0x00e9;
/// Offset of the last (lowest) descriptor in a page
pub const PAGE_SCAN_END: u16 = 0x0005;
/// Size of one descriptor
pub const PDT_ENTRY_SIZE: u16 = 6;

/// Device control function
pub const FUNCTION_DEVICE_CONTROL: u8 = 0x01;
/// Flash programming function
pub const FUNCTION_FLASH: u8 = 0x34;

/// One function discovered in the PDT, with absolute register addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmiFunction {
    /// Function number, e.g. 0x01 or 0x34
    pub number: u8,
    /// Function version from bits 5..6 of the interrupt info byte
    pub version: u8,
    /// Query register base
    pub query_base: u16,
    /// Command register base
    pub command_base: u16,
    /// Control register base
    pub control_base: u16,
    /// Data register base
    pub data_base: u16,
    /// Number of interrupt sources owned by the function
    pub interrupt_source_count: u8,
    /// Index of the interrupt enable register holding this function's bits
    pub interrupt_reg_num: u8,
    /// Bits of this function within its interrupt enable register
    pub interrupt_mask: u8,
}

impl RmiFunction {
    /// Decode a PDT entry located in the page starting at `page_base`
    ///
    /// `interrupt_count` is the running total of sources of all functions
    /// found so far.
    pub fn parse(entry: &[u8; 6], page_base: u16, interrupt_count: u32) -> Self {
        let interrupt_source_count = entry[4] & 0x07;
        let offset = interrupt_count % 8;
        let mut mask: u32 = 0;
        for bit in offset..offset + u32::from(interrupt_source_count) {
            mask |= 1 << bit;
        }
        Self {
            number: entry[5],
            version: (entry[4] & 0x60) >> 5,
            query_base: page_base + u16::from(entry[0]),
            command_base: page_base + u16::from(entry[1]),
            control_base: page_base + u16::from(entry[2]),
            data_base: page_base + u16::from(entry[3]),
            interrupt_source_count,
            interrupt_reg_num: ((interrupt_count + 8) / 8 - 1) as u8,
            interrupt_mask: mask as u8,
        }
    }
}

/// All functions of one device session, in scan order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionTable {
    functions: Vec<RmiFunction>,
}

impl FunctionTable {
    /// Build a table from already decoded functions
    pub fn from_functions(functions: Vec<RmiFunction>) -> Self {
        Self { functions }
    }

    /// Look up a function by number
    pub fn get(&self, number: u8) -> Result<&RmiFunction> {
        self.functions
            .iter()
            .find(|f| f.number == number)
            .ok_or(Error::FunctionNotFound(number))
    }

    /// All functions in scan order
    pub fn functions(&self) -> &[RmiFunction] {
        &self.functions
    }

    /// Number of functions found
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// True when the scan found nothing
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Scan the PDT of every page below `max_page`
///
/// The scan stops at the first page without descriptors. A device that
/// reports no functions at all is an error, since nothing else can be
/// addressed without F01 and F34.
pub fn scan<T: RegisterTransport + ?Sized>(
    transport: &mut T,
    max_page: u8,
) -> Result<FunctionTable> {
    let mut functions = Vec::new();
    let mut interrupt_count: u32 = 0;

    for page in 0..max_page {
        let page_base = PAGE_SIZE * u16::from(page);
        let mut found = false;

        transport.set_page(page)?;

        let mut offset = PAGE_SCAN_START;
        while offset >= PAGE_SCAN_END {
            let addr = page_base + offset;
            let res = transport.read(addr, PDT_ENTRY_SIZE as usize)?;
            let entry: [u8; 6] = res
                .as_slice()
                .try_into()
                .map_err(|_| Error::Transport(TransportError::ShortRead))?;
            let func = RmiFunction::parse(&entry, page_base, interrupt_count);
            if func.number == 0 {
                break;
            }
            interrupt_count += u32::from(func.interrupt_source_count);
            functions.push(func);
            found = true;
            match offset.checked_sub(PDT_ENTRY_SIZE) {
                Some(next) => offset = next,
                None => break,
            }
        }

        if !found {
            break;
        }
    }

    for (i, f) in functions.iter().enumerate() {
        log::debug!(
            "PDT-{:02} fn:0x{:02x} vr:{} sc:{} ms:0x{:x} db:0x{:02x} cb:0x{:02x} cm:0x{:02x} qb:0x{:02x}",
            i,
            f.number,
            f.version,
            f.interrupt_source_count,
            f.interrupt_mask,
            f.data_base,
            f.control_base,
            f.command_base,
            f.query_base
        );
    }

    if functions.is_empty() {
        return Err(Error::NoFunctionsFound);
    }
    Ok(FunctionTable { functions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockRegisters;
    use crate::transport::TransportKind;

    fn two_function_device() -> MockRegisters {
        let mut regs = MockRegisters::new(TransportKind::Hid);
        // F01: 1 source, version 0
        regs.pdt_entry(0x00e9, [0x10, 0x11, 0x12, 0x13, 0x01, 0x01]);
        // F34: 1 source, version 2
        regs.pdt_entry(0x00e3, [0x20, 0x21, 0x22, 0x23, 0x41, 0x34]);
        // F11 on page 1: 2 sources
        regs.pdt_entry(0x01e9, [0x30, 0x31, 0x32, 0x33, 0x02, 0x11]);
        regs
    }

    #[test]
    fn test_scan_decodes_entries() {
        let mut regs = two_function_device();
        let table = scan(&mut regs, 0xff).unwrap();
        assert_eq!(table.len(), 3);

        let f01 = table.get(0x01).unwrap();
        assert_eq!(f01.query_base, 0x10);
        assert_eq!(f01.command_base, 0x11);
        assert_eq!(f01.control_base, 0x12);
        assert_eq!(f01.data_base, 0x13);
        assert_eq!(f01.interrupt_mask, 0x01);
        assert_eq!(f01.interrupt_reg_num, 0);

        let f34 = table.get(0x34).unwrap();
        assert_eq!(f34.version, 2);
        assert_eq!(f34.interrupt_mask, 0x02);

        let f11 = table.get(0x11).unwrap();
        assert_eq!(f11.query_base, 0x130);
        assert_eq!(f11.interrupt_mask, 0x0c);
    }

    #[test]
    fn test_scan_stops_at_empty_page() {
        let mut regs = two_function_device();
        scan(&mut regs, 0xff).unwrap();
        // pages 0 and 1 have entries, page 2 is empty
        assert_eq!(regs.pages, [0, 1, 2]);
    }

    #[test]
    fn test_ps2_scans_only_first_page() {
        let mut regs = two_function_device();
        let table = scan(&mut regs, TransportKind::Ps2.max_page()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0x11), Err(Error::FunctionNotFound(0x11)));
    }

    #[test]
    fn test_scan_is_idempotent() {
        let mut regs = two_function_device();
        let first = scan(&mut regs, 0xff).unwrap();
        let second = scan(&mut regs, 0xff).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scan_empty_device() {
        let mut regs = MockRegisters::new(TransportKind::Hid);
        assert_eq!(scan(&mut regs, 0xff), Err(Error::NoFunctionsFound));
    }

    #[test]
    fn test_interrupt_mask_wraps_register() {
        // seven sources already counted, two more spill past bit 7
        let f = RmiFunction::parse(&[0, 0, 0, 0, 0x02, 0x54], 0, 7);
        assert_eq!(f.interrupt_reg_num, 0);
        assert_eq!(f.interrupt_mask, 0x80);
        let g = RmiFunction::parse(&[0, 0, 0, 0, 0x01, 0x54], 0, 9);
        assert_eq!(g.interrupt_reg_num, 1);
        assert_eq!(g.interrupt_mask, 0x02);
    }
}
