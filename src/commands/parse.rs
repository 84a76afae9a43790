//! Offline image inspection

use rmiflash_core::firmware::FirmwareContainer;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read file contents into a Vec
pub fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    println!("Read {} bytes from {:?}", data.len(), path);
    Ok(data)
}

/// Print the header fields and the images of a firmware file
pub fn run_parse(input: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = read_file(input)?;
    let fw = FirmwareContainer::parse(&data, force)?;

    println!("{}", fw);
    println!();
    println!("{:<28} {:>10}", "Image", "Size");
    println!("{}", "-".repeat(39));
    for (name, image) in fw.images() {
        println!("{:<28} {:>10}", name, image.len());
    }
    Ok(())
}
