//! RMI over HID report framing
//!
//! Register accesses are tunnelled through vendor reports on the RMI
//! collection: an output report to write, an output report to request a
//! read and input reports carrying the read data back. Input reports of
//! other ids (attention, touch data) may interleave with read data and are
//! skipped.

use rmiflash_core::error::TransportError;

/// Output report carrying a register write
pub const WRITE_REPORT_ID: u8 = 0x09;
/// Output report requesting a register read
pub const READ_ADDR_REPORT_ID: u8 = 0x0a;
/// Input report carrying read data
pub const READ_DATA_REPORT_ID: u8 = 0x0b;
/// Input report signalling attention
pub const ATTN_REPORT_ID: u8 = 0x0c;
/// Feature report selecting the reporting mode
pub const SET_MODE_REPORT_ID: u8 = 0x0f;

/// Output reports are zero padded to this length
pub const OUTPUT_REPORT_LEN: usize = 21;
/// Largest payload of one write report
pub const MAX_WRITE_LEN: usize = 0xff;
/// Largest read one request can ask for
pub const MAX_READ_LEN: usize = 0xffff;

const READ_INPUT_COUNT: usize = 1;
const READ_INPUT_DATA: usize = 2;
const ATTN_INTERRUPT_SOURCES: usize = 1;

/// Reporting mode of the HID collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidMode {
    /// Plain mouse reports, the kernel driver's default
    Mouse = 0,
    /// RMI attention reports
    AttnReports = 1,
    /// RMI attention reports without packed touch data
    NoPackedAttnReports = 2,
}

/// Feature report payload switching to `mode`
pub fn set_mode_report(mode: HidMode) -> [u8; 2] {
    [SET_MODE_REPORT_ID, mode as u8]
}

fn pad(mut buf: Vec<u8>) -> Vec<u8> {
    if buf.len() < OUTPUT_REPORT_LEN {
        buf.resize(OUTPUT_REPORT_LEN, 0);
    }
    buf
}

/// Build the write report for `data` at `addr`
pub fn write_report(addr: u16, data: &[u8]) -> Result<Vec<u8>, TransportError> {
    if data.len() > MAX_WRITE_LEN {
        return Err(TransportError::RequestTooLarge);
    }
    let mut buf = Vec::with_capacity(OUTPUT_REPORT_LEN.max(4 + data.len()));
    buf.push(WRITE_REPORT_ID);
    buf.push(data.len() as u8);
    buf.extend_from_slice(&addr.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(pad(buf))
}

/// Build the read request for `len` bytes at `addr`
pub fn read_request(addr: u16, len: usize) -> Result<Vec<u8>, TransportError> {
    if len > MAX_READ_LEN {
        return Err(TransportError::RequestTooLarge);
    }
    let mut buf = Vec::with_capacity(OUTPUT_REPORT_LEN);
    // legacy one byte count, unused
    buf.push(READ_ADDR_REPORT_ID);
    buf.push(0);
    buf.extend_from_slice(&addr.to_le_bytes());
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    Ok(pad(buf))
}

/// Collects read data from a stream of input reports
#[derive(Debug)]
pub struct ReadAssembler {
    want: usize,
    buf: Vec<u8>,
}

impl ReadAssembler {
    /// Expect `want` bytes of register data
    pub fn new(want: usize) -> Self {
        Self {
            want,
            buf: Vec::with_capacity(want),
        }
    }

    /// All requested bytes arrived
    pub fn is_complete(&self) -> bool {
        self.buf.len() >= self.want
    }

    /// Feed one input report
    ///
    /// Reports with another id are ignored. A data report must carry a
    /// non-zero count that fits inside the report.
    pub fn push(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let Some(&id) = report.first() else {
            return Err(TransportError::ResponseTooSmall);
        };
        if id != READ_DATA_REPORT_ID {
            log::debug!("hid: ignoring report with id 0x{:02x}", id);
            return Ok(());
        }
        if report.len() < READ_INPUT_DATA {
            return Err(TransportError::ResponseTooSmall);
        }
        let count = usize::from(report[READ_INPUT_COUNT]);
        if count == 0 {
            return Err(TransportError::InputCountZero);
        }
        if READ_INPUT_DATA + count > report.len() {
            return Err(TransportError::Underflow);
        }
        self.buf
            .extend_from_slice(&report[READ_INPUT_DATA..READ_INPUT_DATA + count]);
        Ok(())
    }

    /// The collected data, trimmed to the requested length
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.truncate(self.want);
        self.buf
    }
}

/// Whether `report` is an attention report for any source in `source_mask`
pub fn is_attention(report: &[u8], source_mask: u8) -> bool {
    if report.len() < ATTN_INTERRUPT_SOURCES + 1 {
        log::debug!("hid: ignoring small read of {}", report.len());
        return false;
    }
    if report[0] != ATTN_REPORT_ID {
        log::debug!("hid: ignoring report id 0x{:02x} while waiting", report[0]);
        return false;
    }
    let sources = report[ATTN_INTERRUPT_SOURCES];
    if sources & source_mask == 0 {
        log::debug!("hid: source mask did not match: 0x{:02x}", sources);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_report_layout() {
        let buf = write_report(0x0123, &[0xaa, 0xbb]).unwrap();
        assert_eq!(buf.len(), OUTPUT_REPORT_LEN);
        assert_eq!(&buf[..6], &[0x09, 0x02, 0x23, 0x01, 0xaa, 0xbb]);
        assert!(buf[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_long_write_is_not_truncated() {
        let data = [0x5a; 32];
        let buf = write_report(0x10, &data).unwrap();
        assert_eq!(buf.len(), 4 + 32);
        assert_eq!(buf[1], 32);
    }

    #[test]
    fn test_write_too_large() {
        assert_eq!(
            write_report(0, &[0; 0x100]),
            Err(TransportError::RequestTooLarge)
        );
    }

    #[test]
    fn test_read_request_layout() {
        let buf = read_request(0x00e9, 0x0102).unwrap();
        assert_eq!(buf.len(), OUTPUT_REPORT_LEN);
        assert_eq!(&buf[..6], &[0x0a, 0x00, 0xe9, 0x00, 0x02, 0x01]);
        assert_eq!(
            read_request(0, 0x10000),
            Err(TransportError::RequestTooLarge)
        );
    }

    #[test]
    fn test_assembler_skips_foreign_reports() {
        let mut asm = ReadAssembler::new(4);
        asm.push(&[ATTN_REPORT_ID, 0x01, 0xff]).unwrap();
        asm.push(&[READ_DATA_REPORT_ID, 2, 1, 2, 0, 0]).unwrap();
        assert!(!asm.is_complete());
        asm.push(&[READ_DATA_REPORT_ID, 3, 3, 4, 5]).unwrap();
        assert!(asm.is_complete());
        assert_eq!(asm.finish(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_assembler_errors() {
        let mut asm = ReadAssembler::new(4);
        assert_eq!(asm.push(&[]), Err(TransportError::ResponseTooSmall));
        assert_eq!(
            asm.push(&[READ_DATA_REPORT_ID]),
            Err(TransportError::ResponseTooSmall)
        );
        assert_eq!(
            asm.push(&[READ_DATA_REPORT_ID, 0, 9]),
            Err(TransportError::InputCountZero)
        );
        assert_eq!(
            asm.push(&[READ_DATA_REPORT_ID, 4, 1, 2]),
            Err(TransportError::Underflow)
        );
    }

    #[test]
    fn test_attention_mask() {
        assert!(is_attention(&[ATTN_REPORT_ID, 0x08], 0x0c));
        assert!(!is_attention(&[ATTN_REPORT_ID, 0x01], 0x0c));
        assert!(!is_attention(&[READ_DATA_REPORT_ID, 0xff], 0xff));
        assert!(!is_attention(&[ATTN_REPORT_ID], 0xff));
    }

    #[test]
    fn test_set_mode_report() {
        assert_eq!(set_mode_report(HidMode::AttnReports), [0x0f, 0x01]);
        assert_eq!(set_mode_report(HidMode::Mouse), [0x0f, 0x00]);
    }
}
