//! Sample image generation

use crate::cli::ImageFormat;
use rmiflash_core::firmware::header::ContainerId;
use rmiflash_core::firmware::{build_legacy, ContainerBuilder, FirmwareContainer};
use std::fs;
use std::path::Path;

/// Parameters of a generated image
pub struct GenerateArgs<'a> {
    pub format: ImageFormat,
    pub product_id: &'a str,
    pub build_id: Option<u32>,
    pub ui_size: usize,
    pub config_size: usize,
}

/// Build the image described by `args`
pub fn build_image(args: &GenerateArgs<'_>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if args.ui_size == 0 {
        return Err("Firmware code size must not be zero".into());
    }
    let ui: Vec<u8> = (0..args.ui_size).map(|i| i as u8).collect();
    let config: Vec<u8> = (0..args.config_size).map(|i| 0xff - i as u8).collect();

    let blob = match args.format {
        ImageFormat::Legacy => {
            if args.build_id.is_some() {
                log::warn!("Flat images carry no build id, ignoring --build-id");
            }
            build_legacy(args.product_id, &ui, &config)?
        }
        ImageFormat::Container => {
            let mut builder =
                ContainerBuilder::new(args.product_id).container(ContainerId::CoreCode, &ui);
            if !config.is_empty() {
                builder = builder.container(ContainerId::CoreConfig, &config);
            }
            if let Some(build_id) = args.build_id {
                builder = builder.with_build_id(build_id);
            }
            builder.build()?
        }
    };
    Ok(blob)
}

/// Run the generate command
pub fn run_generate(
    output: &Path,
    args: &GenerateArgs<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    let blob = build_image(args)?;
    let fw = FirmwareContainer::parse(&blob, false)?;
    fs::write(output, &blob)?;
    println!(
        "Wrote {} bytes to {:?} ({} images, product {})",
        blob.len(),
        output,
        fw.image_count(),
        fw.product_id_str()
    );
    Ok(())
}
