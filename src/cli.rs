//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Transports compiled into this build
pub const TRANSPORT_NAMES: &[&str] = &[
    #[cfg(feature = "dummy")]
    "dummy",
    #[cfg(feature = "hid")]
    "hid",
    #[cfg(feature = "ps2")]
    "ps2",
];

/// Generate dynamic help text for the transport argument
fn transport_help() -> String {
    format!("Transport to use [available: {}]", TRANSPORT_NAMES.join(", "))
}

#[derive(Parser)]
#[command(name = "rmiflash")]
#[command(
    author,
    version,
    about = "Firmware update tool for RMI touch controllers",
    long_about = None
)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Image layout written by `generate`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat image for bootloader versions 2 to 6
    Legacy,
    /// Hierarchical image for partition bootloaders
    Container,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the device
    Probe {
        /// Transport to use
        #[arg(short, long, help = transport_help())]
        transport: String,
    },

    /// Show device identity, flash geometry and partitions
    Info {
        /// Transport to use
        #[arg(short, long, help = transport_help())]
        transport: String,
    },

    /// Decode a firmware image without touching any device
    Parse {
        /// Firmware image
        input: PathBuf,

        /// Accept images with a bad checksum
        #[arg(long)]
        force: bool,
    },

    /// Write a sample firmware image
    Generate {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Image layout
        #[arg(long, value_enum, default_value_t = ImageFormat::Legacy)]
        format: ImageFormat,

        /// Product id stored in the image
        #[arg(long, default_value = "TM3000-001")]
        product_id: String,

        /// Build id stored in the image (hex with 0x prefix or decimal)
        #[arg(long, value_parser = parse_hex_u32)]
        build_id: Option<u32>,

        /// Size of the firmware code in bytes
        #[arg(long, default_value_t = 64)]
        ui_size: usize,

        /// Size of the configuration in bytes
        #[arg(long, default_value_t = 32)]
        config_size: usize,
    },

    /// Write a firmware image to the device
    Flash {
        /// Transport to use
        #[arg(short, long, help = transport_help())]
        transport: String,

        /// Firmware image
        input: PathBuf,

        /// Write even if the product id or checksum does not match
        #[arg(long)]
        force: bool,

        /// Skip the RSA check of signed images
        #[arg(long)]
        allow_unverified: bool,
    },

    /// List transports and the devices they can reach
    ListTransports,
}
