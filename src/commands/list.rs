//! List commands implementation

use crate::transports;

/// List the compiled-in transports and the devices each one can reach
pub fn list_transports() {
    println!("Supported transports:");
    println!();
    print!("{}", transports::transport_help());

    #[cfg(feature = "hid")]
    {
        let devices = rmiflash_hid::list_devices();
        println!();
        println!("HID devices:");
        if devices.is_empty() {
            println!("  none found");
        }
        for dev in devices {
            println!("  {:<16} {:<32} {}", dev.path, dev.name, dev.phys);
        }
    }

    #[cfg(feature = "ps2")]
    {
        let ports = rmiflash_ps2::list_devices();
        println!();
        println!("PS/2 ports:");
        if ports.is_empty() {
            println!("  none found");
        }
        for port in ports {
            println!(
                "  {:<10} {:<12} {}",
                port.name,
                port.driver.as_deref().unwrap_or("-"),
                port.firmware_id
            );
        }
    }
}
