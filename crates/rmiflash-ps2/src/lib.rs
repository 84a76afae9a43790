//! rmiflash-ps2 - RMI over the PS/2 auxiliary port
//!
//! This crate provides register access to RMI touchpads connected to the
//! i8042 aux port, through the Linux `serio_raw` driver.
//!
//! # Overview
//!
//! While `psmouse` owns the port the kernel consumes every byte, so the
//! port is first switched to `serio_raw` through its `drvctl` sysfs
//! attribute. Register accesses then use the Synaptics back door: special
//! sample rate and resolution sequences carry the address and data, and a
//! status request returns the register value. Every byte is acknowledged,
//! which makes this channel slow; flashing a PS/2 touchpad takes minutes.
//!
//! After the update the port is handed back to `psmouse`, at which point
//! the register interface is gone.
//!
//! # Example
//!
//! ```no_run
//! use rmiflash_ps2::{Ps2Config, Ps2Transport};
//! use rmiflash_core::device::RmiDevice;
//! use rmiflash_core::transport::StdDelay;
//!
//! let transport = Ps2Transport::open(&Ps2Config::new("serio1"))?;
//! let dev = RmiDevice::open(transport, StdDelay)?;
//! println!("product {}", dev.identity().product_id);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with rmiflash CLI
//!
//! ```bash
//! # Switch serio1 to serio_raw and show device information
//! rmiflash info -t ps2:serio=serio1
//!
//! # Use an already bound serio_raw node
//! rmiflash flash -t ps2:dev=/dev/serio_raw0 firmware.img
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with `CONFIG_SERIO_RAW`
//! - Write access to `/sys/bus/serio/devices/serioN/drvctl`
//! - Read/write access to `/dev/serio_rawN`

pub mod device;
pub mod error;
pub mod protocol;

// Re-exports
pub use device::{list_devices, parse_options, Ps2Config, Ps2Transport, SerioInfo};
pub use error::{Ps2Error, Result};
pub use protocol::{ByteChannel, Ps2Port};

/// Open a PS/2 port and return a boxed RegisterTransport
///
/// This is a convenience function for use in the CLI transport dispatch.
///
/// # Example Options
///
/// - `serio=serio1` - serio port to switch to serio_raw
/// - `dev=/dev/serio_raw0` - serio_raw node, found through sysfs if omitted
/// - `switch=0` - Optional: fail instead of switching the port driver
/// - `dump=1` - Optional: log every byte at trace level
pub fn open_ps2(
    options: &[(&str, &str)],
) -> std::result::Result<
    Box<dyn rmiflash_core::transport::RegisterTransport>,
    Box<dyn std::error::Error>,
> {
    let config = parse_options(options)?;
    let transport = Ps2Transport::open(&config)?;
    Ok(Box::new(transport))
}
