//! serio_raw device implementation
//!
//! This module provides the `Ps2Transport` struct that implements the
//! `RegisterTransport` trait on top of a Linux `/dev/serio_rawN` node.

use crate::error::{Ps2Error, Result};
use crate::protocol::{ByteChannel, Ps2Port};

use rmiflash_core::error::Result as CoreResult;
use rmiflash_core::transport::{
    DeviceMode, RegisterTransport, StdDelay, TransportKind, WriteFlags, BUS_SELECT_REGISTER,
    PAGE_SELECT_REGISTER,
};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SYSFS_SERIO: &str = "/sys/bus/serio/devices";

const DRIVER_SERIO_RAW: &str = "serio_raw";
const DRIVER_PSMOUSE: &str = "psmouse";

/// How long to wait for the serio_raw node after a driver switch
const REPLUG_TIMEOUT_MS: u64 = 5000;
const REPLUG_POLL_MS: u64 = 100;

/// Configuration for opening a PS/2 device
#[derive(Debug, Clone)]
pub struct Ps2Config {
    /// serio port name under /sys/bus/serio/devices (e.g., "serio1")
    pub serio: String,
    /// serio_raw node, found through sysfs when empty
    pub device: String,
    /// Switch the port to serio_raw if psmouse owns it (default: true)
    pub switch_driver: bool,
    /// Log every byte at trace level
    pub dump_bytes: bool,
}

impl Default for Ps2Config {
    fn default() -> Self {
        Self {
            serio: String::new(),
            device: String::new(),
            switch_driver: true,
            dump_bytes: false,
        }
    }
}

impl Ps2Config {
    /// Create a new configuration for the serio port `serio`
    pub fn new(serio: impl Into<String>) -> Self {
        Self {
            serio: serio.into(),
            ..Default::default()
        }
    }

    /// Use an explicit serio_raw node
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Allow or forbid switching the port driver
    pub fn with_switch_driver(mut self, switch: bool) -> Self {
        self.switch_driver = switch;
        self
    }

    /// Log every byte
    pub fn with_dump_bytes(mut self, dump: bool) -> Self {
        self.dump_bytes = dump;
        self
    }
}

/// A serio port found by [`list_devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerioInfo {
    /// Port name, `serioN`
    pub name: String,
    /// Bound driver, if any
    pub driver: Option<String>,
    /// PNP ids from `firmware_id`
    pub firmware_id: String,
}

/// Byte channel over a serio_raw file descriptor
pub struct SerioChannel {
    file: File,
    dump: bool,
}

impl SerioChannel {
    fn wait_readable(&self, timeout_ms: u32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }
}

impl ByteChannel for SerioChannel {
    fn send(&mut self, byte: u8) -> io::Result<()> {
        if self.dump {
            log::trace!("ps2: > {:02x}", byte);
        }
        self.file.write_all(&[byte])
    }

    fn recv(&mut self, timeout_ms: u32) -> io::Result<Option<u8>> {
        if !self.wait_readable(timeout_ms)? {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        if self.file.read(&mut buf)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if self.dump {
            log::trace!("ps2: < {:02x}", buf[0]);
        }
        Ok(Some(buf[0]))
    }

    fn flush_input(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        while self.wait_readable(0)? {
            if self.file.read(&mut buf)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// RMI register access over a PS/2 aux port
pub struct Ps2Transport {
    port: Ps2Port<SerioChannel, StdDelay>,
    serio_dir: Option<PathBuf>,
}

impl Ps2Transport {
    /// Open the port, switching it to serio_raw first if needed, then reset
    /// the device
    pub fn open(config: &Ps2Config) -> Result<Self> {
        let serio_dir = (!config.serio.is_empty())
            .then(|| Path::new(SYSFS_SERIO).join(&config.serio));

        let mut device = config.device.clone();
        if let Some(dir) = &serio_dir {
            let driver = link_name(&dir.join("driver"));
            if driver.as_deref() != Some(DRIVER_SERIO_RAW) {
                if !config.switch_driver {
                    return Err(Ps2Error::Sysfs(format!(
                        "{} is bound to {}, not {}",
                        config.serio,
                        driver.as_deref().unwrap_or("nothing"),
                        DRIVER_SERIO_RAW
                    )));
                }
                write_drvctl(dir, DRIVER_SERIO_RAW)?;
            }
            if device.is_empty() {
                device = wait_for_raw_node(dir)?;
            }
        }
        if device.is_empty() {
            return Err(Ps2Error::NoDevice);
        }

        log::debug!("ps2: Opening device {}", device);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .map_err(|e| Ps2Error::OpenFailed {
                path: device.clone(),
                source: e,
            })?;

        let channel = SerioChannel {
            file,
            dump: config.dump_bytes,
        };
        let mut port = Ps2Port::new(channel, StdDelay);
        // reset may take 300-500ms
        port.reset_and_disable()?;

        log::info!("ps2: Opened {}", device);
        Ok(Self { port, serio_dir })
    }

    fn select_page(&mut self, addr: u16) -> Result<()> {
        let page = (addr >> 8) as u8;
        self.port.write_register(PAGE_SELECT_REGISTER as u8, &[page], false)
    }
}

impl RegisterTransport for Ps2Transport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ps2
    }

    fn read(&mut self, addr: u16, len: usize) -> CoreResult<Vec<u8>> {
        self.select_page(addr)?;
        let low = addr as u8;
        let mut buf = Vec::with_capacity(len);
        for i in 0..len {
            buf.push(self.port.read_register(low.wrapping_add(i as u8))?);
        }
        Ok(buf)
    }

    fn write_with_flags(&mut self, addr: u16, data: &[u8], flags: WriteFlags) -> CoreResult<()> {
        self.select_page(addr)?;
        let allow_failure = flags.contains(WriteFlags::ALLOW_FAILURE);
        self.port.write_register(addr as u8, data, allow_failure)?;
        Ok(())
    }

    fn set_page(&mut self, page: u8) -> CoreResult<()> {
        self.port
            .write_register(PAGE_SELECT_REGISTER as u8, &[page], false)?;
        Ok(())
    }

    fn wait_for_attention(&mut self, _source_mask: u8, timeout_ms: u32) -> CoreResult<bool> {
        // no attention line on PS/2, give the device the whole timeout
        self.port.delay_ms(timeout_ms);
        Ok(false)
    }

    fn read_packet_register(&mut self, addr: u16, len: usize) -> CoreResult<Vec<u8>> {
        self.select_page(addr)?;
        Ok(self.port.read_packet_register(addr as u8, len)?)
    }

    fn enter_rmi_mode(&mut self, force: bool) -> CoreResult<()> {
        Ok(self.port.enter_rmi_mode(force)?)
    }

    fn write_bus_select(&mut self, bus: u8) -> CoreResult<()> {
        self.select_page(BUS_SELECT_REGISTER)?;
        self.port
            .write_register(BUS_SELECT_REGISTER as u8, &[bus], false)?;
        Ok(())
    }

    fn query_product_sub_id(&mut self) -> CoreResult<Option<u8>> {
        Ok(Some(self.port.query_product_sub_id()?))
    }

    fn query_build_id(&mut self) -> CoreResult<Option<u32>> {
        Ok(self.port.query_build_id()?)
    }

    fn rebind(&mut self, mode: DeviceMode) -> CoreResult<bool> {
        match mode {
            DeviceMode::Bootloader => {
                // the firmware requires a fresh mode switch before queries
                self.port.enter_rmi_mode(true)?;
                Ok(true)
            }
            DeviceMode::Runtime => {
                match &self.serio_dir {
                    Some(dir) => write_drvctl(dir, DRIVER_PSMOUSE)?,
                    None => log::warn!("ps2: no serio port given, leaving driver as is"),
                }
                Ok(false)
            }
        }
    }
}

fn link_name(link: &Path) -> Option<String> {
    let target = fs::read_link(link).ok()?;
    target.file_name()?.to_str().map(str::to_string)
}

fn write_drvctl(serio_dir: &Path, driver: &str) -> Result<()> {
    let path = serio_dir.join("drvctl");
    log::debug!("ps2: writing {} to {}", driver, path.display());
    fs::write(&path, driver).map_err(|e| Ps2Error::Sysfs(format!("{}: {}", path.display(), e)))
}

/// serio_raw registers a misc device below its serio port
fn find_raw_node(serio_dir: &Path) -> Option<String> {
    let entries = fs::read_dir(serio_dir.join("misc")).ok()?;
    entries.flatten().find_map(|entry| {
        let name = entry.file_name().to_string_lossy().into_owned();
        name.starts_with(DRIVER_SERIO_RAW)
            .then(|| format!("/dev/{}", name))
    })
}

fn wait_for_raw_node(serio_dir: &Path) -> Result<String> {
    let deadline = Instant::now() + Duration::from_millis(REPLUG_TIMEOUT_MS);
    while Instant::now() < deadline {
        if let Some(node) = find_raw_node(serio_dir) {
            if Path::new(&node).exists() {
                return Ok(node);
            }
        }
        std::thread::sleep(Duration::from_millis(REPLUG_POLL_MS));
    }
    Err(Ps2Error::ReplugTimeout(serio_dir.display().to_string()))
}

/// Whether a serio `firmware_id` names a Synaptics PNP device
pub fn is_synaptics_pnp(firmware_id: &str) -> bool {
    firmware_id
        .split_whitespace()
        .any(|id| id.to_ascii_uppercase().starts_with("SYN"))
}

/// List serio ports with a Synaptics PNP id
pub fn list_devices() -> Vec<SerioInfo> {
    let Ok(entries) = fs::read_dir(SYSFS_SERIO) else {
        log::debug!("ps2: cannot read {}", SYSFS_SERIO);
        return Vec::new();
    };
    let mut ports: Vec<SerioInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let dir = entry.path();
            let firmware_id = fs::read_to_string(dir.join("firmware_id")).ok()?;
            let firmware_id = firmware_id.trim();
            if !is_synaptics_pnp(firmware_id) {
                return None;
            }
            Some(SerioInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                driver: link_name(&dir.join("driver")),
                firmware_id: firmware_id.to_string(),
            })
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value {
        "1" | "yes" | "on" => Ok(true),
        "0" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid {} value: {}", key, value)),
    }
}

/// Parse transport options from a list of key-value pairs
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<Ps2Config, String> {
    let mut config = Ps2Config::default();

    for (key, value) in options {
        match *key {
            "serio" => {
                config.serio = value.to_string();
            }
            "dev" => {
                config.device = value.to_string();
            }
            "switch" => {
                config.switch_driver = parse_bool(key, value)?;
            }
            "dump" => {
                config.dump_bytes = parse_bool(key, value)?;
            }
            _ => {
                log::warn!("ps2: Unknown option: {}={}", key, value);
            }
        }
    }

    if config.serio.is_empty() && config.device.is_empty() {
        return Err("No device specified. Use serio=serioN or dev=/dev/serio_rawN".to_string());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let config = parse_options(&[("serio", "serio1"), ("switch", "0"), ("dump", "yes")])
            .unwrap();
        assert_eq!(config.serio, "serio1");
        assert!(config.device.is_empty());
        assert!(!config.switch_driver);
        assert!(config.dump_bytes);
    }

    #[test]
    fn test_parse_options_errors() {
        assert!(parse_options(&[]).is_err());
        assert!(parse_options(&[("dev", "/dev/serio_raw0"), ("switch", "maybe")]).is_err());
        let config = parse_options(&[("dev", "/dev/serio_raw0")]).unwrap();
        assert!(config.switch_driver);
    }

    #[test]
    fn test_synaptics_pnp() {
        assert!(is_synaptics_pnp("PNP: SYN1219 SYN1200 SYN0002 PNP0f13"));
        assert!(is_synaptics_pnp("PNP: syn3286"));
        assert!(!is_synaptics_pnp("PNP: PNP0303"));
    }

    #[test]
    fn test_open_without_device() {
        assert!(matches!(
            Ps2Transport::open(&Ps2Config::default()),
            Err(Ps2Error::NoDevice)
        ));
    }
}
