//! Firmware update command

use crate::commands::parse::read_file;
use crate::verify::RsaVerifier;
use indicatif::{ProgressBar, ProgressStyle};
use rmiflash_core::device::RmiDevice;
use rmiflash_core::firmware::FirmwareContainer;
use rmiflash_core::transport::{Delay, RegisterTransport};
use rmiflash_core::update::{
    self, FlashOptions, PlannedStep, SignatureVerifier, Step, UpdateProgress,
};
use std::path::Path;

/// Bar units per unit of step weight
const WEIGHT_SCALE: u64 = 100;

/// Create the update progress bar style
fn create_progress_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
        .progress_chars("#>-"))
}

/// Progress reporter using an indicatif progress bar
///
/// The bar spans the whole plan. Every step owns a share proportional to
/// its weight, which block writes fill as they go.
#[derive(Default)]
pub struct IndicatifProgress {
    bar: Option<ProgressBar>,
    weights: Vec<u64>,
    offset: u64,
    current: usize,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_position(&self, pos: u64) {
        if let Some(pb) = &self.bar {
            pb.set_position(pos);
        }
    }

    /// Leave the bar where it stopped
    pub fn abandon(&mut self, message: &str) {
        if let Some(pb) = self.bar.take() {
            pb.abandon_with_message(message.to_string());
        }
    }
}

impl UpdateProgress for IndicatifProgress {
    fn start(&mut self, plan: &[PlannedStep]) {
        self.weights = plan
            .iter()
            .map(|p| u64::from(p.weight) * WEIGHT_SCALE)
            .collect();
        let pb = ProgressBar::new(self.weights.iter().sum());
        pb.set_style(create_progress_bar_style().unwrap_or_else(|_| ProgressStyle::default_bar()));
        self.bar = Some(pb);
    }

    fn step(&mut self, index: usize, step: Step) {
        self.current = index;
        self.offset = self.weights.iter().take(index).sum();
        self.set_position(self.offset);
        if let Some(pb) = &self.bar {
            pb.set_message(step.name());
        }
    }

    fn blocks(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let weight = self.weights.get(self.current).copied().unwrap_or(0);
        self.set_position(self.offset + weight * done as u64 / total as u64);
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message("Update complete");
        }
    }
}

/// Run the flash command
pub fn run_flash<T: RegisterTransport, D: Delay>(
    dev: &mut RmiDevice<T, D>,
    input: &Path,
    options: &FlashOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = read_file(input)?;
    let fw = FirmwareContainer::parse(&data, options.force)?;
    println!(
        "Image for {} with {} images, device is {} running {}",
        fw.product_id_str(),
        fw.image_count(),
        dev.identity().product_id,
        dev.firmware_version()
    );

    let mut progress = IndicatifProgress::new();
    let rsa = RsaVerifier;
    let verifier: Option<&dyn SignatureVerifier> = if options.allow_unverified {
        None
    } else {
        Some(&rsa)
    };
    if let Err(e) = update::write_firmware(dev, &fw, options, verifier, &mut progress) {
        progress.abandon("Update failed");
        return Err(e.into());
    }

    println!("Device now runs firmware {}", dev.firmware_version());
    Ok(())
}
