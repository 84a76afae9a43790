//! Device identification commands

use rmiflash_core::device::RmiDevice;
use rmiflash_core::transport::{Delay, RegisterTransport};

/// Print the product identity
pub fn run_probe<T: RegisterTransport, D: Delay>(dev: &RmiDevice<T, D>) {
    let identity = dev.identity();
    println!("Found RMI device on {}", dev.transport_kind());
    println!("  Product:    {}", identity.product_id);
    println!("  Firmware:   {}", dev.firmware_version());
    println!("  Bootloader: {} ({})", dev.bootloader_version(), dev.variant());
    if dev.in_bootloader() {
        println!("  Device is in bootloader mode");
    }
}

/// Print identity, flash geometry, functions and partitions
pub fn run_info<T: RegisterTransport, D: Delay>(dev: &RmiDevice<T, D>) {
    run_probe(dev);

    let params = dev.params();
    println!();
    println!("Flash geometry:");
    println!("  Block size:     {} bytes", params.block_size);
    println!("  Firmware:       {} blocks", params.block_count_fw);
    println!("  Configuration:  {} blocks", params.block_count_cfg);
    if dev.variant().is_partitioned() {
        println!("  Flash config:   {} blocks", params.config_length);
        println!("  Payload length: {} blocks", params.payload_length);
    }
    if params.sig_size != 0 {
        println!("  Signature:      {} bytes", params.sig_size);
    }
    let security = if params.has_security() {
        "signed images only"
    } else {
        "none"
    };
    println!("  Security:       {}", security);

    println!();
    println!(
        "{:<10} {:>7} {:>7} {:>7} {:>7} {:>5}",
        "Function", "Query", "Command", "Control", "Data", "IRQs"
    );
    println!("{}", "-".repeat(49));
    for f in dev.functions().functions() {
        println!(
            "F{:02X} v{:<5} {:>#7x} {:>#7x} {:>#7x} {:>#7x} {:>5}",
            f.number,
            f.version,
            f.query_base,
            f.command_base,
            f.control_base,
            f.data_base,
            f.interrupt_source_count
        );
    }

    if params.partitions.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<24} {:>8} {:>8} {:>10}",
        "Partition", "Address", "Blocks", "Properties"
    );
    println!("{}", "-".repeat(53));
    for p in &params.partitions {
        println!(
            "{:<24} {:>#8x} {:>8} {:>#10x}",
            p.id.to_string(),
            p.address,
            p.length,
            p.properties
        );
    }
}
