//! rmiflash - Firmware update tool for RMI touch controllers
//!
//! Updates Synaptics RMI4 touchpads and touchscreens over hidraw or the
//! PS/2 aux port.
//!
//! # Architecture
//!
//! A transport string (`hid:dev=/dev/hidraw3`) selects a `RegisterTransport`,
//! which `RmiDevice` scans for its functions and flash layout. The update
//! itself runs in `rmiflash_core::update`, independent of the transport.

mod cli;
mod commands;
mod transports;
mod verify;

use clap::Parser;
use cli::{Cli, Commands};
use rmiflash_core::device::RmiDevice;
use rmiflash_core::transport::{RegisterTransport, StdDelay};
use rmiflash_core::update::FlashOptions;

/// Open `transport` and scan the device behind it
fn open_device(
    transport: &str,
) -> Result<RmiDevice<Box<dyn RegisterTransport>, StdDelay>, Box<dyn std::error::Error>> {
    let transport = transports::open_transport(transport)?;
    let dev = RmiDevice::open(transport, StdDelay)?;
    Ok(dev)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    match cli.command {
        Commands::Probe { transport } => {
            let dev = open_device(&transport)?;
            commands::run_probe(&dev);
            Ok(())
        }
        Commands::Info { transport } => {
            let dev = open_device(&transport)?;
            commands::run_info(&dev);
            Ok(())
        }
        Commands::Parse { input, force } => commands::run_parse(&input, force),
        Commands::Generate {
            output,
            format,
            product_id,
            build_id,
            ui_size,
            config_size,
        } => commands::run_generate(
            &output,
            &commands::GenerateArgs {
                format,
                product_id: &product_id,
                build_id,
                ui_size,
                config_size,
            },
        ),
        Commands::Flash {
            transport,
            input,
            force,
            allow_unverified,
        } => {
            let mut dev = open_device(&transport)?;
            let options = FlashOptions {
                force,
                allow_unverified,
            };
            commands::run_flash(&mut dev, &input, &options)
        }
        Commands::ListTransports => {
            commands::list_transports();
            Ok(())
        }
    }
}
