use std::io;

use thiserror::Error;

use crate::{hardware::cdma::ChannelStatus, kernel::irq::Irq};

pub type Result<T> = std::result::Result<T, Error>;

/// Result codes carried in the second word of a PXI reply.
pub mod code {
    pub const OK: u32 = 0;
    pub const SD_CARD_REMOVED: u32 = 1;
    pub const INVALID_ARG: u32 = 2;
    pub const OUT_OF_MEM: u32 = 3;
    pub const OUT_OF_RANGE: u32 = 4;
    pub const NOT_FOUND: u32 = 5;
    pub const FR_DISK_ERR: u32 = 6;
    pub const FR_NO_FILE: u32 = 9;
    pub const FR_NO_PATH: u32 = 10;
    pub const FR_DENIED: u32 = 12;
    pub const FR_INVALID_PARAMETER: u32 = 24;

    const CUSTOM_ERR_OFFSET: u32 = 200;
    pub const ROM_TOO_BIG: u32 = CUSTOM_ERR_OFFSET;
    pub const GBA_RTC_ERR: u32 = CUSTOM_ERR_OFFSET + 1;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("out of VRAM (requested 0x{0:X} bytes)")]
    OutOfVram(usize),

    #[error("physical range 0x{addr:08X}+0x{len:X} is not mapped")]
    OutOfRange { addr: u32, len: usize },

    #[error("not found")]
    NotFound,

    #[error("no such file: {0}")]
    NoFile(String),

    #[error("disk error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid scaler matrix: {0}")]
    InvalidScaler(String),

    #[error("unsupported save type 0x{0:X}")]
    UnsupportedSaveType(u8),

    #[error("ROM too big")]
    RomTooBig,

    #[error("GBA RTC write error")]
    GbaRtc,

    #[error("{0:?} already has a handler")]
    IrqInUse(Irq),

    #[error("event was deleted")]
    EventDeleted,

    #[error("DMA channel {ch} is busy ({status:?})")]
    DmaBusy { ch: u8, status: ChannelStatus },

    #[error("CPU halted: {0}")]
    Halted(String),

    #[error("remote CPU returned result code {0}")]
    Remote(u32),
}

impl Error {
    /// Maps the error to the code sent back over PXI.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArg(_) | Self::InvalidScaler(_) | Self::UnsupportedSaveType(_) => {
                code::INVALID_ARG
            }
            Self::OutOfVram(_) => code::OUT_OF_MEM,
            Self::OutOfRange { .. } => code::OUT_OF_RANGE,
            Self::NotFound | Self::IrqInUse(_) | Self::EventDeleted | Self::Halted(_) => {
                code::NOT_FOUND
            }
            Self::DmaBusy { .. } => code::INVALID_ARG,
            Self::NoFile(_) => code::FR_NO_FILE,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => code::FR_NO_PATH,
                io::ErrorKind::PermissionDenied => code::FR_DENIED,
                io::ErrorKind::InvalidInput => code::FR_INVALID_PARAMETER,
                _ => code::FR_DISK_ERR,
            },
            Self::Config(_) => code::FR_INVALID_PARAMETER,
            Self::RomTooBig => code::ROM_TOO_BIG,
            Self::GbaRtc => code::GBA_RTC_ERR,
            Self::Remote(c) => *c,
        }
    }

    /// Turns a PXI result word back into a `Result`.
    ///
    /// # Errors
    /// Any non-zero code.
    pub fn check(result: u32) -> Result<()> {
        match result {
            code::OK => Ok(()),
            code::ROM_TOO_BIG => Err(Self::RomTooBig),
            code::GBA_RTC_ERR => Err(Self::GbaRtc),
            code::NOT_FOUND => Err(Self::NotFound),
            other => Err(Self::Remote(other)),
        }
    }
}

/// Folds a handler result into the PXI result word.
#[must_use]
pub fn result_code(res: &Result<()>) -> u32 {
    res.as_ref().map_or_else(Error::code, |()| code::OK)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn custom_codes() {
        assert_eq!(Error::RomTooBig.code(), 200);
        assert_eq!(Error::GbaRtc.code(), 201);
        assert_eq!(Error::NoFile("save.sav".into()).code(), code::FR_NO_FILE);
    }

    #[test]
    fn check_round_trip() {
        assert!(Error::check(code::OK).is_ok());
        assert!(matches!(Error::check(code::GBA_RTC_ERR), Err(Error::GbaRtc)));
        assert!(matches!(Error::check(code::FR_DISK_ERR), Err(Error::Remote(6))));
        assert_eq!(result_code(&Err(Error::RomTooBig)), 200);
        assert_eq!(result_code(&Ok(())), 0);
    }
}
