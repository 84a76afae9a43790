//! Firmware update orchestration
//!
//! [`write_firmware`] runs a complete update: it checks the image against
//! the device, switches to bootloader mode, executes the steps the
//! bootloader protocol plans for the image and finally resets back into
//! the application firmware. Signature checks always run before anything
//! is erased.

use alloc::vec::Vec;
use core::fmt;

use crate::device::RmiDevice;
use crate::error::{ProtocolError, Result, VerificationError};
use crate::firmware::FirmwareContainer;
use crate::transport::{Delay, DeviceMode, RegisterTransport};

/// One stage of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Keep the controller awake
    DisableSleep,
    /// Check image signatures against the device public key
    VerifySignature,
    /// Write the fixed location data partition
    WriteFixedLocationData,
    /// Erase the partition table
    EraseFlashConfig,
    /// Write the partition table
    WriteFlashConfig,
    /// Replace the bootloader through the secondary bootloader
    WriteBootloader,
    /// Erase code and configuration
    EraseAll,
    /// Write the firmware code
    WriteUi,
    /// Write the firmware signature blocks
    WriteSignature,
    /// Write the configuration
    WriteConfig,
    /// Write the external AFE configuration
    WriteAfeConfig,
    /// Write the display configuration
    WriteDisplayConfig,
}

impl Step {
    /// Short description for progress output
    pub const fn name(self) -> &'static str {
        match self {
            Self::DisableSleep => "disable sleep",
            Self::VerifySignature => "verify signature",
            Self::WriteFixedLocationData => "write fixed location data",
            Self::EraseFlashConfig => "erase flash config",
            Self::WriteFlashConfig => "write flash config",
            Self::WriteBootloader => "write bootloader",
            Self::EraseAll => "erase",
            Self::WriteUi => "write firmware",
            Self::WriteSignature => "write signature",
            Self::WriteConfig => "write config",
            Self::WriteAfeConfig => "write afe config",
            Self::WriteDisplayConfig => "write display config",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A step with its share of the overall progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedStep {
    /// The step
    pub step: Step,
    /// Relative weight, steps with weight 0 finish instantly
    pub weight: u8,
}

impl PlannedStep {
    /// Shorthand constructor
    pub const fn new(step: Step, weight: u8) -> Self {
        Self { step, weight }
    }
}

/// Progress sink for [`write_firmware`]
///
/// All methods default to doing nothing.
pub trait UpdateProgress {
    /// The plan is known and about to run
    fn start(&mut self, _plan: &[PlannedStep]) {}

    /// Step `index` of the plan starts
    fn step(&mut self, _index: usize, _step: Step) {}

    /// `done` of `total` blocks of the current step are written
    fn blocks(&mut self, _done: usize, _total: usize) {}

    /// Every step succeeded
    fn finish(&mut self) {}
}

/// Progress sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl UpdateProgress for NoProgress {}

/// Checks a detached image signature
///
/// The bootloader only accepts images signed with its key. The device
/// public key is read before erasing and handed to the verifier together
/// with the payload and the signature from the container.
pub trait SignatureVerifier {
    /// Return whether `signature` over `payload` is valid for `pubkey`
    fn verify(&self, payload: &[u8], signature: &[u8], pubkey: &[u8]) -> bool;
}

/// Behaviour switches for an update
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Write even if the product id does not match
    pub force: bool,
    /// Skip signature checks when no verifier is available
    pub allow_unverified: bool,
}

/// State shared by all steps of one update
pub struct UpdateSession<'a> {
    /// Options of this update
    pub options: &'a FlashOptions,
    /// Signature verifier, if any
    pub verifier: Option<&'a dyn SignatureVerifier>,
    /// Progress sink
    pub progress: &'a mut dyn UpdateProgress,
}

impl UpdateSession<'_> {
    /// The verifier to check signatures with
    ///
    /// `Ok(None)` means verification is skipped on request.
    pub fn verifier(&self) -> Result<Option<&dyn SignatureVerifier>> {
        match self.verifier {
            Some(v) => Ok(Some(v)),
            None if self.options.allow_unverified => {
                log::warn!("no signature verifier, skipping signature check");
                Ok(None)
            }
            None => Err(VerificationError::NoVerifier.into()),
        }
    }

    /// Verify `signature` over `payload`, `name` is only used in logs
    pub fn verify(
        &self,
        verifier: &dyn SignatureVerifier,
        name: &str,
        payload: &[u8],
        signature: &[u8],
        pubkey: &[u8],
    ) -> Result<()> {
        if !verifier.verify(payload, signature, pubkey) {
            log::error!("signature of {} does not match device key", name);
            return Err(VerificationError::SignatureMismatch.into());
        }
        log::debug!("signature of {} ok", name);
        Ok(())
    }
}

/// Write `fw` to `dev`
///
/// The device ends up running the new application firmware. Errors before
/// the erase step leave the flash untouched.
pub fn write_firmware<T: RegisterTransport, D: Delay>(
    dev: &mut RmiDevice<T, D>,
    fw: &FirmwareContainer,
    options: &FlashOptions,
    verifier: Option<&dyn SignatureVerifier>,
    progress: &mut dyn UpdateProgress,
) -> Result<()> {
    let product_id = dev.identity().product_id.clone();
    dev.params().check_firmware(fw, &product_id, options.force)?;

    if !dev.in_bootloader() {
        log::info!("switching {} to bootloader mode", product_id);
        let variant = dev.variant();
        variant.detach(dev)?;
        dev.rebind(DeviceMode::Bootloader)?;
    }
    if !dev.in_bootloader() {
        return Err(ProtocolError::NotInBootloader.into());
    }

    let variant = dev.variant();
    let plan = variant.plan(dev.params(), fw)?;
    variant.begin(dev)?;

    let mut session = UpdateSession {
        options,
        verifier,
        progress,
    };
    session.progress.start(&plan);
    for (index, planned) in plan.iter().enumerate() {
        log::debug!("step {}/{}: {}", index + 1, plan.len(), planned.step);
        session.progress.step(index, planned.step);
        variant.run_step(dev, planned.step, fw, &mut session)?;
    }
    session.progress.finish();

    dev.attach()
}

/// Steps of `plan`, without weights
pub fn plan_steps(plan: &[PlannedStep]) -> Vec<Step> {
    plan.iter().map(|p| p.step).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use alloc::string::ToString;

    struct Recorder {
        steps: Vec<Step>,
        finished: bool,
    }

    impl UpdateProgress for Recorder {
        fn step(&mut self, _index: usize, step: Step) {
            self.steps.push(step);
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    struct Reject;

    impl SignatureVerifier for Reject {
        fn verify(&self, _payload: &[u8], _signature: &[u8], _pubkey: &[u8]) -> bool {
            false
        }
    }

    #[test]
    fn test_verifier_required_unless_allowed() {
        let options = FlashOptions::default();
        let mut progress = NoProgress;
        let session = UpdateSession {
            options: &options,
            verifier: None,
            progress: &mut progress,
        };
        assert_eq!(
            session.verifier().err(),
            Some(Error::Verification(VerificationError::NoVerifier))
        );

        let options = FlashOptions {
            allow_unverified: true,
            ..Default::default()
        };
        let session = UpdateSession {
            options: &options,
            verifier: None,
            progress: &mut progress,
        };
        assert!(session.verifier().unwrap().is_none());
    }

    #[test]
    fn test_rejected_signature() {
        let options = FlashOptions::default();
        let mut progress = NoProgress;
        let session = UpdateSession {
            options: &options,
            verifier: Some(&Reject),
            progress: &mut progress,
        };
        let verifier = session.verifier().unwrap().unwrap();
        assert_eq!(
            session.verify(verifier, "ui", &[1], &[2], &[3]),
            Err(VerificationError::SignatureMismatch.into())
        );
    }

    #[test]
    fn test_progress_defaults() {
        let mut rec = Recorder {
            steps: Vec::new(),
            finished: false,
        };
        rec.start(&[PlannedStep::new(Step::EraseAll, 3)]);
        rec.step(0, Step::EraseAll);
        rec.blocks(1, 2);
        rec.finish();
        assert_eq!(rec.steps, [Step::EraseAll]);
        assert!(rec.finished);
        assert_eq!(Step::WriteUi.to_string(), "write firmware");
    }
}
