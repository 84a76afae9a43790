//! rmiflash-core - Core library for RMI touch controller firmware updates
//!
//! This crate implements everything above the physical channel: the page
//! description table scan, the F01 device control helpers, the F34
//! bootloader protocols and the firmware container parser. Transports plug
//! in through the [`transport::RegisterTransport`] trait, so the same update
//! logic drives HID, PS/2 and the emulated device used in tests.
//!
//! # Features
//!
//! - `std` - Enable standard library support (`std::error::Error`, sleeping delay)
//!
//! # Example
//!
//! ```ignore
//! use rmiflash_core::{device::RmiDevice, firmware::FirmwareContainer, update};
//!
//! fn flash<T: RegisterTransport, D: Delay>(dev: &mut RmiDevice<T, D>, blob: &[u8]) -> Result<()> {
//!     let fw = FirmwareContainer::parse(blob, false)?;
//!     update::write_firmware(dev, &fw, &FlashOptions::default(), None, &mut NoProgress)
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bootloader;
pub mod device;
pub mod error;
pub mod firmware;
pub mod params;
pub mod pdt;
pub mod transport;
pub mod update;

pub use error::{Error, Result};
