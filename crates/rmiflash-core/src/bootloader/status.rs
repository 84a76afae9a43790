//! F34 status register decoding

use crate::error::{DeviceStatus, ProtocolError, Result};

/// Decoded command/status register of the block based bootloaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashStatus {
    /// Command still being executed, zero when idle
    pub command: u8,
    /// Status of the last command
    pub status: u8,
    /// Flash programming is enabled
    pub enabled: bool,
}

/// Register layout of [`FlashStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLayout {
    /// One byte: command in bits 0..3, status in bits 4..6, enabled in bit 7
    Packed,
    /// Two bytes: command in byte 0 bits 0..5, status in byte 1 bits 0..5,
    /// enabled in byte 1 bit 7
    Split,
}

impl StatusLayout {
    /// Bytes to read from the status register
    pub const fn read_len(self) -> usize {
        match self {
            Self::Packed => 1,
            Self::Split => 2,
        }
    }
}

const ENABLED_MASK: u8 = 0x80;
const BOOTLOADER_MODE_BIT: u8 = 0x80;

impl FlashStatus {
    /// Decode `raw`, which must hold at least [`StatusLayout::read_len`] bytes
    pub fn decode(layout: StatusLayout, raw: &[u8]) -> Option<Self> {
        match layout {
            StatusLayout::Packed => {
                let b = *raw.first()?;
                Some(Self {
                    command: b & 0x0f,
                    status: (b >> 4) & 0x07,
                    enabled: b & ENABLED_MASK != 0,
                })
            }
            StatusLayout::Split => {
                let (b0, b1) = (*raw.first()?, *raw.get(1)?);
                Some(Self {
                    command: b0 & 0x3f,
                    status: b1 & 0x3f,
                    enabled: b1 & ENABLED_MASK != 0,
                })
            }
        }
    }

    /// Turn a status read into the idle-poll outcome
    ///
    /// PS/2 devices leave the status bits stale, so there a zero command
    /// alone means idle.
    pub fn check_idle(self, ps2: bool) -> Result<()> {
        if ps2 && self.command == 0 {
            log::debug!("F34 zero as PS/2");
            return Ok(());
        }
        if self.command == 0 && self.status == 0 {
            if !self.enabled {
                return Err(ProtocolError::IdleNotEnabled.into());
            }
            return Ok(());
        }
        Err(ProtocolError::IdleTimeout {
            command: self.command,
            status: self.status,
            enabled: self.enabled,
        }
        .into())
    }
}

/// Decode the partition bootloader status byte at F34 data base
///
/// Returns whether the device runs its bootloader. Only a whole byte equal
/// to a documented error code fails; with bit 7 set any error is a leftover
/// of an earlier command and the session may start over.
pub fn decode_partition_status(byte: u8) -> Result<bool> {
    match byte {
        0x01..=0x09 | 0x1f => match DeviceStatus::from_code(byte) {
            Some(status) => Err(status.into()),
            None => Ok(false),
        },
        _ => Ok(byte & BOOTLOADER_MODE_BIT != 0),
    }
}
