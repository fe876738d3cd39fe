//! GBA save types and detection from the ROM.

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fs::FileSystem,
};

/// Save types of known dumps, keyed by the ROM's SHA-1.
pub const GBA_DB_PATH: &str = "gba_db.bin";

/// `sha1[20]`, `serial[4]`, `attr` (little-endian u32, save type in the
/// low nibble). Entries are sorted by the first 8 hash bytes read as a
/// little-endian u64.
pub const GBA_DB_ENTRY_SIZE: usize = 28;
const GBA_DB_ATTR_OFFSET: usize = 24;
const GBA_DB_MAX_SIZE: usize = 0x10_0000;

/// Values of the legacy save type register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SaveType {
    Eeprom8k = 0x0,
    Eeprom8k2 = 0x1,
    Eeprom64k = 0x2,
    Eeprom64k2 = 0x3,
    Flash512kAmlRtc = 0x4,
    Flash512kAml = 0x5,
    Flash512kSstRtc = 0x6,
    Flash512kSst = 0x7,
    Flash512kPscRtc = 0x8,
    Flash512kPsc = 0x9,
    Flash1mMrxRtc = 0xA,
    Flash1mMrx = 0xB,
    Flash1mSnoRtc = 0xC,
    Flash1mSno = 0xD,
    Sram256k = 0xE,
    None = 0xF,
}

const ALL: [SaveType; 16] = [
    SaveType::Eeprom8k,
    SaveType::Eeprom8k2,
    SaveType::Eeprom64k,
    SaveType::Eeprom64k2,
    SaveType::Flash512kAmlRtc,
    SaveType::Flash512kAml,
    SaveType::Flash512kSstRtc,
    SaveType::Flash512kSst,
    SaveType::Flash512kPscRtc,
    SaveType::Flash512kPsc,
    SaveType::Flash1mMrxRtc,
    SaveType::Flash1mMrx,
    SaveType::Flash1mSnoRtc,
    SaveType::Flash1mSno,
    SaveType::Sram256k,
    SaveType::None,
];

const SAVE_SIZE_SHIFT: [u8; 16] = [9, 9, 13, 13, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 15, 0];

/// ROMs above this size keep EEPROM in the upper 256 bytes of the ROM area.
pub const EEPROM_HIGH_ROM_SIZE: usize = 0x100_0000;
pub const MAX_ROM_SIZE: usize = 32 * 1024 * 1024;

impl TryFrom<u8> for SaveType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        ALL.get(usize::from(v))
            .copied()
            .ok_or(Error::UnsupportedSaveType(v))
    }
}

impl SaveType {
    /// Size of the save file in bytes.
    #[must_use]
    pub const fn save_size(self) -> usize {
        (1_usize << SAVE_SIZE_SHIFT[self as usize]) & !1
    }

    /// The 1M/64k write timings are used by large EEPROM and all 1M flash.
    #[must_use]
    pub const fn uses_1m_timing(self) -> bool {
        matches!(
            self,
            Self::Eeprom64k | Self::Eeprom64k2 | Self::Flash1mMrxRtc | Self::Flash1mMrx | Self::Flash1mSnoRtc | Self::Flash1mSno
        )
    }

    const fn is_eeprom_base(self) -> bool {
        matches!(self, Self::Eeprom8k | Self::Eeprom64k)
    }

    /// Moves EEPROM types to their `_2` variant for big ROMs.
    #[must_use]
    pub fn adjust_for_rom_size(self, rom_size: usize) -> Self {
        if self.is_eeprom_base() && rom_size > EEPROM_HIGH_ROM_SIZE {
            ALL[self as usize + 1]
        } else {
            self
        }
    }
}

/// Overrides for homebrew, keyed by the first game code character.
const fn game_code_override(c: u8) -> Option<SaveType> {
    match c {
        b'1' => Some(SaveType::Eeprom64k),
        b'2' | b'S' => Some(SaveType::Sram256k),
        b'3' => Some(SaveType::Flash512kPscRtc),
        b'4' => Some(SaveType::Flash1mMrxRtc),
        b'F' => Some(SaveType::Eeprom8k),
        _ => None,
    }
}

/// SDK library version strings linked into commercial ROMs.
const SDK_SIGNATURES: [(&[u8], SaveType); 25] = [
    (b"EEPROM_V111", SaveType::Eeprom8k),
    (b"EEPROM_V120", SaveType::Eeprom8k),
    (b"EEPROM_V121", SaveType::Eeprom64k),
    (b"EEPROM_V122", SaveType::Eeprom8k),
    (b"EEPROM_V124", SaveType::Eeprom64k),
    (b"EEPROM_V125", SaveType::Eeprom8k),
    (b"EEPROM_V126", SaveType::Eeprom8k),
    // Flash is assumed to have an RTC.
    (b"FLASH_V120", SaveType::Flash512kPscRtc),
    (b"FLASH_V121", SaveType::Flash512kPscRtc),
    (b"FLASH_V123", SaveType::Flash512kPscRtc),
    (b"FLASH_V124", SaveType::Flash512kPscRtc),
    (b"FLASH_V125", SaveType::Flash512kPscRtc),
    (b"FLASH_V126", SaveType::Flash512kPscRtc),
    (b"FLASH512_V130", SaveType::Flash512kPscRtc),
    (b"FLASH512_V131", SaveType::Flash512kPscRtc),
    (b"FLASH512_V133", SaveType::Flash512kPscRtc),
    (b"FLASH1M_V102", SaveType::Flash1mMrxRtc),
    (b"FLASH1M_V103", SaveType::Flash1mMrxRtc),
    (b"SRAM_F_V100", SaveType::Sram256k),
    (b"SRAM_F_V102", SaveType::Sram256k),
    (b"SRAM_F_V103", SaveType::Sram256k),
    (b"SRAM_V110", SaveType::Sram256k),
    (b"SRAM_V111", SaveType::Sram256k),
    (b"SRAM_V112", SaveType::Sram256k),
    (b"SRAM_V113", SaveType::Sram256k),
];

const GAME_CODE_OFFSET: usize = 0xAC;
const HEADER_END: usize = 0xE4;

/// Detects the save type of `rom`, falling back to `default_save`
/// (anything above 0xF means no save).
#[must_use]
pub fn detect_save_type(rom: &[u8], default_save: u8) -> SaveType {
    if let Some(ty) = rom.get(GAME_CODE_OFFSET).copied().and_then(game_code_override) {
        debug!("save type {ty:?} from game code override");
        return ty;
    }

    // Signatures start word aligned with "EEPR", "FLAS" or "SRAM".
    let mut off = HEADER_END;
    while off + 4 <= rom.len() {
        let word = &rom[off..off + 4];
        if matches!(word, b"EEPR" | b"FLAS" | b"SRAM") {
            let tail = &rom[off..];
            if let Some(&(sig, ty)) = SDK_SIGNATURES.iter().find(|(sig, _)| tail.starts_with(sig)) {
                let ty = ty.adjust_for_rom_size(rom.len());
                debug!("save type {ty:?} from SDK string {}", String::from_utf8_lossy(sig));
                return ty;
            }
        }
        off += 4;
    }

    SaveType::try_from(default_save).unwrap_or(SaveType::None)
}

fn gba_db_key(hash: &[u8]) -> u64 {
    let mut key = [0; 8];
    key.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(key)
}

/// Looks the ROM up in [`GBA_DB_PATH`]. `Ok(None)` if it is not listed.
///
/// # Errors
/// [`Error::NoFile`] without a database, I/O errors.
pub fn search_gba_db(fs: &dyn FileSystem, rom: &[u8]) -> Result<Option<SaveType>> {
    let mut db = vec![0; GBA_DB_MAX_SIZE];
    let n = fs.quick_read(GBA_DB_PATH, &mut db)?;
    db.truncate(n);

    let key = gba_db_key(&Sha1::digest(rom));
    debug!("gba_db: searching {:016X}", key.swap_bytes());
    let entries: Vec<&[u8]> = db.chunks_exact(GBA_DB_ENTRY_SIZE).collect();
    let Ok(idx) = entries.binary_search_by_key(&key, |e| gba_db_key(e)) else {
        return Ok(None);
    };

    let entry = entries[idx];
    // Low byte of the little-endian attribute word.
    let ty = SaveType::try_from(entry[GBA_DB_ATTR_OFFSET] & 0xF)?;
    info!(
        "gba_db: {} uses {ty:?}",
        String::from_utf8_lossy(&entry[20..24]).trim_end_matches('\0')
    );
    Ok(Some(ty))
}

/// The save type from the database, or detected from the ROM if the title
/// is not listed or the database cannot be read.
#[must_use]
pub fn lookup_save_type(fs: &dyn FileSystem, rom: &[u8], default_save: u8) -> SaveType {
    match search_gba_db(fs, rom) {
        Ok(Some(ty)) => ty,
        Ok(None) => {
            debug!("gba_db: not listed");
            detect_save_type(rom, default_save)
        }
        Err(e) => {
            warn!("gba_db: cannot read {GBA_DB_PATH}: {e}");
            detect_save_type(rom, default_save)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::MemFs;

    fn rom_with(sig: &[u8], at: usize, size: usize) -> Vec<u8> {
        let mut rom = vec![0; size];
        rom[at..at + sig.len()].copy_from_slice(sig);
        rom
    }

    #[test]
    fn save_sizes() {
        assert_eq!(SaveType::Eeprom8k.save_size(), 512);
        assert_eq!(SaveType::Eeprom64k.save_size(), 8 * 1024);
        assert_eq!(SaveType::Flash512kPsc.save_size(), 64 * 1024);
        assert_eq!(SaveType::Flash1mMrx.save_size(), 128 * 1024);
        assert_eq!(SaveType::Sram256k.save_size(), 32 * 1024);
        assert_eq!(SaveType::None.save_size(), 0);
    }

    #[test]
    fn game_code_wins() {
        let mut rom = rom_with(b"FLASH1M_V103", 0x1000, 0x2000);
        rom[GAME_CODE_OFFSET] = b'S';
        assert_eq!(detect_save_type(&rom, 14), SaveType::Sram256k);
    }

    #[test]
    fn sdk_strings() {
        let rom = rom_with(b"FLASH1M_V103", 0x1000, 0x2000);
        assert_eq!(detect_save_type(&rom, 14), SaveType::Flash1mMrxRtc);

        // Not word aligned: ignored.
        let rom = rom_with(b"SRAM_V113", 0x1001, 0x2000);
        assert_eq!(detect_save_type(&rom, 15), SaveType::None);
    }

    #[test]
    fn big_rom_eeprom() {
        let rom = rom_with(b"EEPROM_V124", 0x1000, EEPROM_HIGH_ROM_SIZE + 4);
        assert_eq!(detect_save_type(&rom, 14), SaveType::Eeprom64k2);
    }

    #[test]
    fn fallback_to_default() {
        let rom = vec![0; 0x400];
        assert_eq!(detect_save_type(&rom, 14), SaveType::Sram256k);
        assert_eq!(detect_save_type(&rom, 0x20), SaveType::None);
    }

    fn db_entry(hash: &[u8], serial: &[u8; 4], ty: SaveType) -> Vec<u8> {
        let mut e = hash[..20].to_vec();
        e.extend_from_slice(serial);
        // Upper bits hold the ROM size, they must be masked off.
        e.extend_from_slice(&(23 << 27 | ty as u32).to_le_bytes());
        e
    }

    /// A database with `rom` and two other titles around it.
    fn db_with(rom: &[u8], ty: SaveType) -> Vec<u8> {
        let mut entries = vec![
            db_entry(&[0; 20], b"AAAA", SaveType::Eeprom8k),
            db_entry(&Sha1::digest(rom), b"BPEE", ty),
            db_entry(&[0xFF; 20], b"ZZZZ", SaveType::Sram256k),
        ];
        entries.sort_by_key(|e| gba_db_key(e));
        entries.concat()
    }

    #[test]
    fn gba_db_hit_beats_the_sdk_string() {
        let rom = rom_with(b"SRAM_V113", 0x1000, 0x2000);
        let fs = MemFs::new();
        fs.insert(GBA_DB_PATH, db_with(&rom, SaveType::Flash1mMrxRtc));
        assert_eq!(search_gba_db(&fs, &rom).unwrap(), Some(SaveType::Flash1mMrxRtc));
        assert_eq!(lookup_save_type(&fs, &rom, 15), SaveType::Flash1mMrxRtc);
    }

    #[test]
    fn gba_db_miss_falls_back_to_the_scan() {
        let rom = rom_with(b"SRAM_V113", 0x1000, 0x2000);
        let other = rom_with(b"EEPROM_V124", 0x1000, 0x2000);
        let fs = MemFs::new();
        fs.insert(GBA_DB_PATH, db_with(&other, SaveType::Eeprom64k));
        assert_eq!(search_gba_db(&fs, &rom).unwrap(), None);
        assert_eq!(lookup_save_type(&fs, &rom, 15), SaveType::Sram256k);
    }

    #[test]
    fn missing_gba_db_falls_back_to_the_scan() {
        let rom = rom_with(b"FLASH1M_V103", 0x1000, 0x2000);
        let fs = MemFs::new();
        assert!(matches!(search_gba_db(&fs, &rom), Err(Error::NoFile(_))));
        assert_eq!(lookup_save_type(&fs, &rom, 15), SaveType::Flash1mMrxRtc);

        // An empty database lists nothing.
        fs.insert(GBA_DB_PATH, Vec::new());
        assert_eq!(search_gba_db(&fs, &rom).unwrap(), None);
    }
}
