//! rmiflash-hid - RMI over Linux hidraw
//!
//! This crate provides register access to RMI touch controllers that sit
//! behind a HID collection, through the `/dev/hidrawN` device interface.
//!
//! # Overview
//!
//! Touchpads and touchscreens with an RMI collection accept vendor output
//! reports for register writes and read requests and answer with input
//! reports. On open the collection is switched to attention reports with a
//! feature report, and switched back to mouse mode when the transport is
//! dropped. Entering or leaving the bootloader re-enumerates the device, so
//! a mode switch unbinds and rebinds the I2C HID driver and reopens the new
//! hidraw node.
//!
//! # Example
//!
//! ```no_run
//! use rmiflash_hid::{HidConfig, HidTransport};
//! use rmiflash_core::device::RmiDevice;
//! use rmiflash_core::transport::StdDelay;
//!
//! let config = HidConfig::new("/dev/hidraw0").with_timeout(1000);
//! let transport = HidTransport::open(&config)?;
//! let dev = RmiDevice::open(transport, StdDelay)?;
//! println!("product {}", dev.identity().product_id);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with rmiflash CLI
//!
//! ```bash
//! # Show device information
//! rmiflash info -t hid:dev=/dev/hidraw0
//!
//! # Flash with report logging at trace level
//! rmiflash -vvv flash -t hid:dev=/dev/hidraw0,dump=1 firmware.img
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with hidraw support (`CONFIG_HIDRAW`)
//! - Read/write access to `/dev/hidrawN`
//! - Write access to `/sys/bus/i2c/drivers/*/{bind,unbind}` for mode switches

pub mod device;
pub mod error;
pub mod protocol;

// Re-exports
pub use device::{list_devices, parse_options, HidConfig, HidDeviceInfo, HidTransport};
pub use error::{HidError, Result};
pub use protocol::HidMode;

/// Open a hidraw device and return a boxed RegisterTransport
///
/// This is a convenience function for use in the CLI transport dispatch.
///
/// # Example Options
///
/// - `dev=/dev/hidraw0` - Required: device path
/// - `timeout=2000` - Optional: report timeout in ms (default: 2000)
/// - `dump=1` - Optional: log every report at trace level
pub fn open_hid(
    options: &[(&str, &str)],
) -> std::result::Result<
    Box<dyn rmiflash_core::transport::RegisterTransport>,
    Box<dyn std::error::Error>,
> {
    let config = parse_options(options)?;
    let transport = HidTransport::open(&config)?;
    Ok(Box::new(transport))
}
