//! hidraw device implementation
//!
//! This module provides the `HidTransport` struct that implements the
//! `RegisterTransport` trait on top of a Linux `/dev/hidrawN` node.

use crate::error::{HidError, Result};
use crate::protocol::{self, HidMode, ReadAssembler};

use rmiflash_core::error::Result as CoreResult;
use rmiflash_core::transport::{
    DeviceMode, RegisterTransport, TransportKind, WriteFlags, PAGE_SELECT_REGISTER,
};

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default report timeout in milliseconds
const DEFAULT_TIMEOUT_MS: u32 = 2000;

/// How long to wait for the node to come back after a rebind
const REPLUG_TIMEOUT_MS: u64 = 10_000;
const REPLUG_POLL_MS: u64 = 100;

/// Synaptics USB/I2C vendor id
pub const SYNAPTICS_VENDOR_ID: u32 = 0x06cb;

const SYSFS_HIDRAW: &str = "/sys/class/hidraw";
const SYSFS_BUS: &str = "/sys/bus";

/// Largest input report we expect from any RMI collection
const MAX_INPUT_REPORT: usize = 4096;

/// hidraw ioctl constants
mod ioctl {
    use nix::ioctl_readwrite_buf;

    const HIDRAW_IOC_MAGIC: u8 = b'H';
    const HIDIOCSFEATURE_NR: u8 = 0x06;

    // HIDIOCSFEATURE(len) = _IOC(_IOC_WRITE | _IOC_READ, 'H', 0x06, len)
    ioctl_readwrite_buf!(hid_set_feature, HIDRAW_IOC_MAGIC, HIDIOCSFEATURE_NR, u8);
}

/// Configuration for opening a hidraw device
#[derive(Debug, Clone)]
pub struct HidConfig {
    /// Device path (e.g., "/dev/hidraw0")
    pub device: String,
    /// Timeout for one report in milliseconds (default: 2000)
    pub timeout_ms: u32,
    /// Log every report at trace level
    pub dump_reports: bool,
}

impl Default for HidConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            dump_reports: false,
        }
    }
}

impl HidConfig {
    /// Create a new configuration with the given device path
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Set the report timeout in milliseconds
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Log every report
    pub fn with_dump_reports(mut self, dump: bool) -> Self {
        self.dump_reports = dump;
        self
    }
}

/// A hidraw node found by [`list_devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    /// Device node, `/dev/hidrawN`
    pub path: String,
    /// `HID_NAME` from the uevent
    pub name: String,
    /// `HID_PHYS` from the uevent
    pub phys: String,
}

/// RMI register access over hidraw
pub struct HidTransport {
    file: File,
    config: HidConfig,
}

impl HidTransport {
    /// Open a hidraw device and switch it to attention reports
    pub fn open(config: &HidConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(HidError::NoDevice);
        }

        log::debug!("hid: Opening device {}", config.device);
        let file = open_node(&config.device)?;
        let mut transport = Self {
            file,
            config: config.clone(),
        };
        transport.set_mode(HidMode::AttnReports)?;

        log::info!(
            "hid: Opened {} (timeout={} ms)",
            config.device,
            config.timeout_ms
        );
        Ok(transport)
    }

    /// Open a device with default settings
    pub fn open_device(device: &str) -> Result<Self> {
        Self::open(&HidConfig::new(device))
    }

    /// Path of the node currently in use
    pub fn device(&self) -> &str {
        &self.config.device
    }

    /// Send the mode feature report
    pub fn set_mode(&mut self, mode: HidMode) -> Result<()> {
        let mut report = protocol::set_mode_report(mode);
        self.dump("set mode", &report);
        unsafe {
            ioctl::hid_set_feature(self.file.as_raw_fd(), &mut report).map_err(|e| {
                HidError::SetModeFailed {
                    mode: mode as u8,
                    source: std::io::Error::from_raw_os_error(e as i32),
                }
            })?;
        }
        Ok(())
    }

    fn dump(&self, what: &str, buf: &[u8]) {
        if self.config.dump_reports {
            log::trace!("hid: {} {:02x?}", what, buf);
        }
    }

    fn send_report(&mut self, report: &[u8]) -> Result<()> {
        self.dump("write", report);
        let n = self.file.write(report).map_err(HidError::TransferFailed)?;
        if n != report.len() {
            return Err(rmiflash_core::error::TransportError::ShortWrite.into());
        }
        Ok(())
    }

    /// Read one input report, `None` on timeout
    fn recv_report(&mut self, timeout_ms: u32) -> Result<Option<Vec<u8>>> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret < 0 {
            return Err(HidError::TransferFailed(std::io::Error::last_os_error()));
        }
        if ret == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; MAX_INPUT_REPORT];
        let n = self.file.read(&mut buf).map_err(HidError::TransferFailed)?;
        buf.truncate(n);
        self.dump("read", &buf);
        Ok(Some(buf))
    }

    fn read_registers(&mut self, addr: u16, len: usize) -> Result<Vec<u8>> {
        let request = protocol::read_request(addr, len)?;
        self.send_report(&request)?;

        let mut asm = ReadAssembler::new(len);
        while !asm.is_complete() {
            let timeout = self.config.timeout_ms;
            let report = self.recv_report(timeout)?.ok_or(HidError::Timeout(timeout))?;
            asm.push(&report)?;
        }
        Ok(asm.finish())
    }

    fn write_registers(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        let report = protocol::write_report(addr, data)?;
        self.send_report(&report)
    }

    fn wait_attention(&mut self, source_mask: u8, timeout_ms: u32) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            let Some(report) = self.recv_report(left.as_millis() as u32)? else {
                return Ok(false);
            };
            if protocol::is_attention(&report, source_mask) {
                return Ok(true);
            }
        }
    }

    /// Unbind and rebind the kernel driver, then reopen the new node
    fn rebind_driver(&mut self) -> Result<()> {
        let hid_dir = hid_device_dir(&self.config.device)?;
        let phys = uevent_value(&hid_dir, "HID_PHYS")?
            .ok_or_else(|| HidError::Sysfs(format!("no HID_PHYS in {}", hid_dir.display())))?;
        log::debug!("hid: HID_PHYS {}", phys);

        let i2c = ancestor_in_subsystem(&hid_dir, "i2c").ok_or_else(|| {
            HidError::Sysfs(format!("no I2C parent device for {}", hid_dir.display()))
        })?;
        let driver = link_name(&i2c.join("driver"))?;
        let drivers = Path::new(SYSFS_BUS).join("i2c").join("drivers").join(driver);

        writeln_sysfs(&drivers.join("unbind"), &phys)?;
        writeln_sysfs(&drivers.join("bind"), &phys)?;

        let node = wait_for_node(&phys)?;
        log::debug!("hid: {} is back as {}", phys, node);
        self.file = open_node(&node)?;
        self.config.device = node;
        self.set_mode(HidMode::AttnReports)
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        // the node may already be gone after a rebind
        if let Err(e) = self.set_mode(HidMode::Mouse) {
            log::debug!("hid: ignoring: {}", e);
        }
    }
}

impl RegisterTransport for HidTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    fn read(&mut self, addr: u16, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.read_registers(addr, len)?)
    }

    fn write_with_flags(&mut self, addr: u16, data: &[u8], flags: WriteFlags) -> CoreResult<()> {
        match self.write_registers(addr, data) {
            Err(e) if flags.contains(WriteFlags::ALLOW_FAILURE) => {
                log::debug!("hid: write to 0x{:04x} failed, ignoring: {}", addr, e);
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn set_page(&mut self, page: u8) -> CoreResult<()> {
        self.write_registers(PAGE_SELECT_REGISTER, &[page])
            .map_err(|e| {
                log::error!("hid: failed to set page 0x{:x}: {}", page, e);
                e
            })?;
        Ok(())
    }

    fn wait_for_attention(&mut self, source_mask: u8, timeout_ms: u32) -> CoreResult<bool> {
        Ok(self.wait_attention(source_mask, timeout_ms)?)
    }

    fn enter_rmi_mode(&mut self, force: bool) -> CoreResult<()> {
        if force {
            self.set_mode(HidMode::AttnReports)?;
        }
        Ok(())
    }

    fn rebind(&mut self, mode: DeviceMode) -> CoreResult<bool> {
        log::info!("hid: rebinding driver for {:?} mode", mode);
        self.rebind_driver()?;
        Ok(true)
    }
}

fn open_node(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| HidError::OpenFailed {
            path: path.to_string(),
            source: e,
        })
}

fn node_name(device: &str) -> Result<&str> {
    Path::new(device)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HidError::InvalidParameter(format!("not a device node: {}", device)))
}

/// Sysfs directory of the HID device behind a hidraw node
fn hid_device_dir(device: &str) -> Result<PathBuf> {
    let link = Path::new(SYSFS_HIDRAW).join(node_name(device)?).join("device");
    fs::canonicalize(&link).map_err(|e| HidError::Sysfs(format!("{}: {}", link.display(), e)))
}

/// Look up `key` in the uevent file of `dir`
fn uevent_value(dir: &Path, key: &str) -> Result<Option<String>> {
    let path = dir.join("uevent");
    let text = fs::read_to_string(&path)
        .map_err(|e| HidError::Sysfs(format!("{}: {}", path.display(), e)))?;
    Ok(parse_uevent(&text, key).map(str::to_string))
}

/// Value of `key` in uevent text (`KEY=value` per line)
pub fn parse_uevent<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key).then_some(v.trim())
    })
}

/// Vendor id from a `HID_ID=bus:vendor:product` value
pub fn parse_hid_vendor(hid_id: &str) -> Option<u32> {
    let vendor = hid_id.split(':').nth(1)?;
    u32::from_str_radix(vendor, 16).ok()
}

fn link_name(link: &Path) -> Result<String> {
    let target =
        fs::read_link(link).map_err(|e| HidError::Sysfs(format!("{}: {}", link.display(), e)))?;
    target
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| HidError::Sysfs(format!("{}: bad link", link.display())))
}

fn ancestor_in_subsystem(dir: &Path, subsystem: &str) -> Option<PathBuf> {
    dir.ancestors()
        .skip(1)
        .find(|p| link_name(&p.join("subsystem")).ok().as_deref() == Some(subsystem))
        .map(Path::to_path_buf)
}

fn writeln_sysfs(path: &Path, value: &str) -> Result<()> {
    log::debug!("hid: writing {} to {}", value, path.display());
    fs::write(path, format!("{}\n", value))
        .map_err(|e| HidError::Sysfs(format!("{}: {}", path.display(), e)))
}

/// Find the hidraw node whose HID device has `phys`
fn find_node(phys: &str) -> Option<String> {
    let entries = fs::read_dir(SYSFS_HIDRAW).ok()?;
    entries.flatten().find_map(|entry| {
        let dir = fs::canonicalize(entry.path().join("device")).ok()?;
        let found = uevent_value(&dir, "HID_PHYS").ok()??;
        (found == phys).then(|| format!("/dev/{}", entry.file_name().to_string_lossy()))
    })
}

fn wait_for_node(phys: &str) -> Result<String> {
    let deadline = Instant::now() + Duration::from_millis(REPLUG_TIMEOUT_MS);
    while Instant::now() < deadline {
        if let Some(node) = find_node(phys) {
            // udev may not have created the node yet
            if Path::new(&node).exists() {
                return Ok(node);
            }
        }
        std::thread::sleep(Duration::from_millis(REPLUG_POLL_MS));
    }
    Err(HidError::ReplugTimeout(phys.to_string()))
}

/// List Synaptics hidraw nodes
pub fn list_devices() -> Vec<HidDeviceInfo> {
    let Ok(entries) = fs::read_dir(SYSFS_HIDRAW) else {
        log::debug!("hid: cannot read {}", SYSFS_HIDRAW);
        return Vec::new();
    };
    let mut devices: Vec<HidDeviceInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let dir = fs::canonicalize(entry.path().join("device")).ok()?;
            let text = fs::read_to_string(dir.join("uevent")).ok()?;
            let vendor = parse_uevent(&text, "HID_ID").and_then(parse_hid_vendor)?;
            if vendor != SYNAPTICS_VENDOR_ID {
                return None;
            }
            Some(HidDeviceInfo {
                path: format!("/dev/{}", entry.file_name().to_string_lossy()),
                name: parse_uevent(&text, "HID_NAME").unwrap_or("").to_string(),
                phys: parse_uevent(&text, "HID_PHYS").unwrap_or("").to_string(),
            })
        })
        .collect();
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Parse transport options from a list of key-value pairs
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<HidConfig, String> {
    let mut config = HidConfig::default();

    for (key, value) in options {
        match *key {
            "dev" => {
                config.device = value.to_string();
            }
            "timeout" => {
                config.timeout_ms = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
            }
            "dump" => {
                config.dump_reports = match *value {
                    "1" | "yes" | "on" => true,
                    "0" | "no" | "off" => false,
                    _ => return Err(format!("Invalid dump value: {}", value)),
                };
            }
            _ => {
                log::warn!("hid: Unknown option: {}={}", key, value);
            }
        }
    }

    if config.device.is_empty() {
        return Err("No device specified. Use dev=/dev/hidrawN".to_string());
    }

    Ok(config)
}
