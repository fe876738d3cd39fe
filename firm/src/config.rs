//! User configuration, `config.json` in the work directory.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    fs::FileSystem,
};

pub const CONFIG_PATH: &str = "config.json";

/// Largest config file that is read.
const CONFIG_MAX_SIZE: usize = 0x1000;

/// `save_type` value meaning "detect from the ROM".
pub const SAVE_TYPE_AUTO: u8 = 0xFF;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OafConfig {
    pub backlight: u8,
    pub backlight_steps: u8,
    pub direct_boot: bool,
    /// 0 none, 1 bilinear 1.5x by the GPU, 2 matrix 1.5x by the capture unit.
    pub scaler: u8,
    /// 0 off, otherwise the color profile number.
    pub color_profile: u8,
    pub contrast: f32,
    pub brightness: f32,
    pub saturation: f32,
    pub save_slot: u8,
    pub save_type: u8,
    pub default_save: u8,
    /// Look the save type up in `gba_db.bin` before scanning the ROM.
    pub use_gba_db: bool,
}

impl Default for OafConfig {
    fn default() -> Self {
        Self {
            backlight: 64,
            backlight_steps: 5,
            direct_boot: false,
            scaler: 2,
            color_profile: 0,
            contrast: 1.0,
            brightness: 0.0,
            saturation: 1.0,
            save_slot: 0,
            save_type: SAVE_TYPE_AUTO,
            default_save: 14,
            use_gba_db: true,
        }
    }
}

impl OafConfig {
    /// Reads the config from the card. A missing file gives the defaults.
    ///
    /// # Errors
    /// [`Error::Config`] on malformed JSON, [`Error::InvalidArg`] on out of
    /// range values and I/O errors other than a missing file.
    pub fn load(fs: &dyn FileSystem) -> Result<Self> {
        let mut buf = vec![0; CONFIG_MAX_SIZE];
        let n = match fs.quick_read(CONFIG_PATH, &mut buf) {
            Ok(n) => n,
            Err(Error::NoFile(_)) => {
                info!("no {CONFIG_PATH}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };

        let cfg: Self = serde_json::from_slice(&buf[..n])?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// If a value is outside what the video pipeline supports.
    pub fn validate(&self) -> Result<()> {
        if self.scaler > 2 {
            return Err(Error::InvalidArg("scaler must be 0, 1 or 2"));
        }
        if usize::from(self.color_profile) > crate::color::PROFILES.len() {
            return Err(Error::InvalidArg("unknown color profile"));
        }
        if !(self.contrast.is_finite() && self.brightness.is_finite() && self.saturation.is_finite()) {
            return Err(Error::InvalidArg("color adjustments must be finite"));
        }
        if self.backlight_steps == 0 {
            warn!("backlight_steps is 0, brightness keys do nothing");
        }
        Ok(())
    }

    #[must_use]
    pub const fn color_correction(&self) -> bool {
        self.color_profile > 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::MemFs;

    #[test]
    fn missing_file_gives_defaults() {
        let fs = MemFs::new();
        assert_eq!(OafConfig::load(&fs).unwrap(), OafConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let fs = MemFs::new();
        fs.insert(CONFIG_PATH, br#"{ "scaler": 0, "color_profile": 3 }"#.to_vec());
        let cfg = OafConfig::load(&fs).unwrap();
        assert_eq!(cfg.scaler, 0);
        assert_eq!(cfg.color_profile, 3);
        assert_eq!(cfg.backlight, 64);
        assert_eq!(cfg.save_type, SAVE_TYPE_AUTO);
        assert!(cfg.use_gba_db);
        assert!(cfg.color_correction());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let fs = MemFs::new();
        fs.insert(CONFIG_PATH, b"{ scaler: ".to_vec());
        assert!(matches!(OafConfig::load(&fs), Err(Error::Config(_))));

        fs.insert(CONFIG_PATH, br#"{ "scaler": 7 }"#.to_vec());
        assert!(matches!(OafConfig::load(&fs), Err(Error::InvalidArg(_))));
    }
}
