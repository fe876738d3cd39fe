//! Loading the GBA ROM and deriving the per-game paths from it.

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    fs::FileSystem,
    save_type::MAX_ROM_SIZE,
};

/// Saves are kept next to each other, not next to the ROMs.
pub const SAVE_DIR: &str = "saves";

/// Smallest retail ROM chip, 8 Mbit.
const MIN_ROM_SIZE: usize = 0x10_0000;

/// Highest save slot with its own file.
pub const MAX_SAVE_SLOT: u8 = 9;

/// Reads the ROM at `path` and pads it with `0xFF` up to the next power of
/// two, at least 1 MiB, like the unused area of a real chip.
///
/// # Errors
/// [`Error::RomTooBig`] for ROMs above 32 MiB, I/O errors.
pub fn load_gba_rom(fs: &dyn FileSystem, path: &str) -> Result<Vec<u8>> {
    // One byte more than allowed to notice oversized files.
    let mut rom = vec![0; MAX_ROM_SIZE + 1];
    let n = fs.quick_read(path, &mut rom)?;
    if n > MAX_ROM_SIZE {
        return Err(Error::RomTooBig);
    }

    let padded = n.next_power_of_two().max(MIN_ROM_SIZE);
    rom.truncate(n);
    rom.resize(padded, 0xFF);
    if padded != n {
        info!("ROM: {path}, 0x{n:X} bytes padded to 0x{padded:X}");
    } else {
        info!("ROM: {path}, 0x{n:X} bytes");
    }
    Ok(rom)
}

fn file_stem(rom_path: &str) -> &str {
    let name = rom_path.rsplit('/').next().unwrap_or(rom_path);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// `saves/<rom name>.sav`, or `saves/<rom name>.<slot>.sav` for slots
/// 1 to 9. Higher slots have no save file.
#[must_use]
pub fn save_path(rom_path: &str, save_slot: u8) -> Option<String> {
    let stem = file_stem(rom_path);
    match save_slot {
        0 => Some(format!("{SAVE_DIR}/{stem}.sav")),
        1..=MAX_SAVE_SLOT => Some(format!("{SAVE_DIR}/{stem}.{save_slot}.sav")),
        _ => {
            warn!("ROM: save slot {save_slot} out of range, the save is not kept");
            None
        }
    }
}
