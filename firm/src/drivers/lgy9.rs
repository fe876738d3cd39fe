//! ARM9 half of legacy mode.
//!
//! Prepares the legacy block before the title starts (BIOS vector overlay,
//! save type and write timings, save loading), keeps the save backed up to
//! the card and owns the legacy RTC.
//!
//! The live save sits at [`SAVE_LOC`]. While the title runs it belongs to
//! the legacy core; a backup maps it to the ARM9 only for the hash and the
//! write.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fs::FileSystem,
    hardware::{
        lgy9::{
            LGY_MODE_AGB, LGY_RTC_CNT_BUSY, LGY_RTC_CNT_RD, LGY_RTC_CNT_WR, LGY_RTC_CNT_WR_ERR,
            LGY_SAVE_MAP_7, LGY_SAVE_MAP_9, Lgy9,
        },
        mem::{PhysMem, SAVE_LOC, SAVE_MAX_SIZE},
        shared::{flush_dcache_range, invalidate_dcache_range},
    },
    kernel::spin_until,
    rtc::GbaRtc,
    save_type::SaveType,
};

/// Where the ARM7 stub runs, as the legacy core sees it.
pub const ARM7_STUB_LOC: u32 = 0x0300_7E00;
/// The same memory seen from the ARM9.
pub const ARM7_STUB_LOC9: u32 = 0x080B_FE00;

/// `ldr pc, [pc, #-4]` followed by its target: the reset vector jumps to the
/// stub.
const A7_OVERLAY: [u32; 2] = [0xE51F_F004, ARM7_STUB_LOC];

/// `mov r0, #0xFF`, `swi 0x01` (RegisterRamReset), `mov pc, #0x0800_0000`.
const A7_STUB: [u32; 3] = [0xE3A0_00FF, 0xEF01_0000, 0xE3A0_F302];
/// The comment byte of the `swi`.
const A7_STUB_SWI_OFFSET: u32 = 6;
/// HardReset, runs the BIOS intro before jumping to the ROM.
const SWI_HARD_RESET: u8 = 0x26;

// Flash chip erase, flash sector erase, flash program, EEPROM write.
const SAVE_TIMING_512K_4K: [u32; 4] = [0x27_C886, 0x8_CE35, 0x184, 0x3_1170];
const SAVE_TIMING_1M_64K: [u32; 4] = [0x17_D43E, 0x2_6206, 0x86, 0x2_DD13];

pub const SAVE_PATH_MAX: usize = 511;

type SaveHash = [u8; 32];

#[derive(Debug, Default)]
struct SaveState {
    path: String,
    size: usize,
    hash: SaveHash,
}

pub struct Lgy9Driver {
    hw: Arc<Lgy9>,
    mem: Arc<PhysMem>,
    fs: Arc<dyn FileSystem>,
    save: Mutex<SaveState>,
}

impl Lgy9Driver {
    #[must_use]
    pub fn new(hw: Arc<Lgy9>, mem: Arc<PhysMem>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            hw,
            mem,
            fs,
            save: Mutex::new(SaveState::default()),
        }
    }

    fn save(&self) -> MutexGuard<'_, SaveState> {
        self.save.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switches the legacy block to GBA mode and loads the save from
    /// `save_path`. A missing save file starts out erased (all `0xFF`).
    ///
    /// # Errors
    /// [`Error::InvalidArg`] for an overlong path and I/O errors other than
    /// a missing save file.
    pub fn prepare_gba_mode(&self, direct_boot: bool, save_type: SaveType, save_path: &str) -> Result<()> {
        if save_path.len() > SAVE_PATH_MAX {
            return Err(Error::InvalidArg("save path too long"));
        }
        self.hw.regs().mode = LGY_MODE_AGB;
        self.setup_bios_overlay(direct_boot)?;
        let size = self.setup_save_type(save_type);

        let mut save = self.save();
        save.path = save_path.to_owned();
        save.size = size;
        if size == 0 {
            info!("LGY: {save_type:?}, nothing to load");
            return Ok(());
        }

        let mut buf = vec![0xFF; size];
        match self.fs.quick_read(save_path, &mut buf) {
            Ok(n) => info!("LGY: loaded {n} bytes of {save_type:?} save from {save_path}"),
            Err(Error::NoFile(_)) => info!("LGY: no save at {save_path}, starting erased"),
            Err(e) => return Err(e),
        }
        self.mem.write(SAVE_LOC, &buf)?;

        // Only backed up again once the title changed something.
        save.hash = self.hash_save(size)?;
        flush_dcache_range(SAVE_LOC, size);
        Ok(())
    }

    fn setup_bios_overlay(&self, direct_boot: bool) -> Result<()> {
        {
            let mut regs = self.hw.regs();
            regs.a7_vector = [0; 8];
            regs.a7_vector[..A7_OVERLAY.len()].copy_from_slice(&A7_OVERLAY);
        }

        let stub: Vec<u8> = A7_STUB.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.mem.write(ARM7_STUB_LOC9, &stub)?;
        if !direct_boot {
            self.mem.write(ARM7_STUB_LOC9 + A7_STUB_SWI_OFFSET, &[SWI_HARD_RESET])?;
        }
        flush_dcache_range(ARM7_STUB_LOC9, stub.len());
        Ok(())
    }

    /// Programs type and timings, returns the save size.
    fn setup_save_type(&self, save_type: SaveType) -> usize {
        let mut regs = self.hw.regs();
        regs.gba_save_type = save_type as u16;
        regs.gba_save_timing = if save_type.uses_1m_timing() {
            SAVE_TIMING_1M_64K
        } else {
            SAVE_TIMING_512K_4K
        };
        save_type.save_size().min(SAVE_MAX_SIZE)
    }

    fn hash_save(&self, size: usize) -> Result<SaveHash> {
        self.mem.with_slice(SAVE_LOC, size, |data| Sha256::digest(data).into())
    }

    #[must_use]
    pub fn save_size(&self) -> usize {
        self.save().size
    }

    /// Writes the save to the card if it changed since it was loaded or last
    /// written. Returns whether it was written.
    ///
    /// # Errors
    /// The card write failing. The stored hash is left alone then, so the
    /// next backup tries again.
    pub fn backup_save(&self) -> Result<bool> {
        let mut save = self.save();
        if save.size == 0 {
            return Ok(false);
        }

        self.hw.regs().gba_save_map = LGY_SAVE_MAP_9;
        let res = self.write_if_changed(&mut save);
        self.hw.regs().gba_save_map = LGY_SAVE_MAP_7;
        res
    }

    fn write_if_changed(&self, save: &mut SaveState) -> Result<bool> {
        invalidate_dcache_range(SAVE_LOC, save.size);
        let hash = self.hash_save(save.size)?;
        if hash == save.hash {
            debug!("LGY: save unchanged");
            return Ok(false);
        }

        let data = self.mem.read_vec(SAVE_LOC, save.size)?;
        if let Err(e) = self.fs.quick_write(&save.path, &data) {
            warn!("LGY: save backup to {} failed: {e}", save.path);
            return Err(e);
        }
        save.hash = hash;
        info!("LGY: backed up {} bytes to {}", save.size, save.path);
        Ok(true)
    }

    /// Sets the legacy RTC with a 24h clock and no offsets.
    ///
    /// # Errors
    /// [`Error::GbaRtc`] if the RTC rejected the values.
    pub fn set_rtc(&self, rtc: GbaRtc) -> Result<()> {
        {
            let mut regs = self.hw.regs();
            regs.gba_rtc_bcd_time = rtc.time;
            regs.gba_rtc_bcd_date = rtc.date;
            regs.gba_rtc_toffset = 1 << 15;
            regs.gba_rtc_doffset = 0;
        }
        self.rtc_transfer(LGY_RTC_CNT_WR)
    }

    /// # Errors
    /// [`Error::GbaRtc`] if the RTC reports an error.
    pub fn get_rtc(&self) -> Result<GbaRtc> {
        self.rtc_transfer(LGY_RTC_CNT_RD)?;
        let regs = self.hw.regs();
        Ok(GbaRtc {
            time: regs.gba_rtc_bcd_time,
            date: regs.gba_rtc_bcd_date,
        })
    }

    fn rtc_transfer(&self, cnt: u16) -> Result<()> {
        self.hw.set_rtc_cnt(cnt);
        spin_until(|| self.hw.regs().gba_rtc_cnt & LGY_RTC_CNT_BUSY == 0);
        if self.hw.regs().gba_rtc_cnt & LGY_RTC_CNT_WR_ERR != 0 {
            return Err(Error::GbaRtc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::RngExt;

    use super::*;
    use crate::fs::MemFs;

    const SAVE_PATH: &str = "roms/game.sav";

    fn driver() -> (Arc<Lgy9>, Arc<PhysMem>, Arc<MemFs>, Lgy9Driver) {
        let hw = Arc::new(Lgy9::new());
        let mem = Arc::new(PhysMem::new());
        let fs = Arc::new(MemFs::new());
        let drv = Lgy9Driver::new(
            Arc::clone(&hw),
            Arc::clone(&mem),
            Arc::clone(&fs) as Arc<dyn FileSystem>,
        );
        (hw, mem, fs, drv)
    }

    #[test]
    fn prepare_programs_the_legacy_block() {
        let (hw, mem, _fs, drv) = driver();
        drv.prepare_gba_mode(false, SaveType::Flash1mMrxRtc, SAVE_PATH).unwrap();

        let regs = hw.regs().clone();
        assert_eq!(regs.mode, LGY_MODE_AGB);
        assert_eq!(regs.a7_vector[..2], A7_OVERLAY);
        assert_eq!(regs.gba_save_type, 0xA);
        assert_eq!(regs.gba_save_timing, SAVE_TIMING_1M_64K);
        // Not a direct boot: the stub resets through the BIOS intro.
        assert_eq!(mem.read_vec(ARM7_STUB_LOC9 + 4, 4).unwrap(), vec![0, 0, 0x26, 0xEF]);
        assert_eq!(drv.save_size(), 0x2_0000);
    }

    #[test]
    fn timings_follow_the_save_type() {
        let (hw, _mem, _fs, drv) = driver();
        drv.prepare_gba_mode(true, SaveType::Sram256k, SAVE_PATH).unwrap();
        assert_eq!(hw.regs().gba_save_timing, SAVE_TIMING_512K_4K);
        drv.prepare_gba_mode(true, SaveType::Eeprom64k2, SAVE_PATH).unwrap();
        assert_eq!(hw.regs().gba_save_timing, SAVE_TIMING_1M_64K);
    }

    #[test]
    fn missing_save_starts_erased() {
        let (_hw, mem, fs, drv) = driver();
        drv.prepare_gba_mode(true, SaveType::Sram256k, SAVE_PATH).unwrap();
        let save = mem.read_vec(SAVE_LOC, 0x8000).unwrap();
        assert!(save.iter().all(|&b| b == 0xFF));

        // Nothing changed, nothing written.
        assert!(!drv.backup_save().unwrap());
        assert_eq!(fs.writes(), 0);
    }

    #[test]
    fn backup_twice_writes_once() {
        let (hw, mem, fs, drv) = driver();
        let mut rng = rand::rng();
        let mut save = vec![0_u8; 0x8000];
        rng.fill(&mut save[..]);
        fs.insert(SAVE_PATH, save.clone());
        drv.prepare_gba_mode(true, SaveType::Sram256k, SAVE_PATH).unwrap();
        assert_eq!(mem.read_vec(SAVE_LOC, 0x8000).unwrap(), save);

        // The title writes to its save.
        mem.write(SAVE_LOC + 0x10, &[save[0x10] ^ 0xFF]).unwrap();
        assert!(drv.backup_save().unwrap());
        assert!(!drv.backup_save().unwrap());
        assert_eq!(fs.writes(), 1);
        assert_eq!(fs.get(SAVE_PATH).unwrap()[0x10], save[0x10] ^ 0xFF);
        assert_eq!(hw.regs().gba_save_map, LGY_SAVE_MAP_7);
    }

    #[test]
    fn failed_backup_is_retried() {
        let (hw, mem, fs, drv) = driver();
        drv.prepare_gba_mode(true, SaveType::Eeprom8k, SAVE_PATH).unwrap();
        mem.write(SAVE_LOC, &[0]).unwrap();

        fs.set_fail_writes(true);
        assert!(drv.backup_save().is_err());
        assert!(hw.save_owned_by_legacy());

        fs.set_fail_writes(false);
        assert!(drv.backup_save().unwrap());
        assert_eq!(fs.get(SAVE_PATH).unwrap().len(), 0x200);
    }

    #[test]
    fn no_save_type_never_touches_the_card() {
        let (_hw, _mem, fs, drv) = driver();
        drv.prepare_gba_mode(true, SaveType::None, SAVE_PATH).unwrap();
        assert!(!drv.backup_save().unwrap());
        assert_eq!(fs.writes(), 0);
    }

    #[test]
    fn rtc_set_and_get() {
        let (hw, _mem, _fs, drv) = driver();
        let rtc = GbaRtc {
            time: 0x0045_2317,
            date: 0x0015_0824,
        };
        drv.set_rtc(rtc).unwrap();
        assert_eq!(hw.regs().gba_rtc_toffset, 1 << 15);
        assert_eq!(drv.get_rtc().unwrap(), rtc);

        let bad = GbaRtc {
            time: 0x0000_0099,
            date: rtc.date,
        };
        assert!(matches!(drv.set_rtc(bad), Err(Error::GbaRtc)));
    }

    #[test]
    fn overlong_path_is_rejected() {
        let (_hw, _mem, _fs, drv) = driver();
        let path = "a".repeat(SAVE_PATH_MAX + 1);
        assert!(matches!(
            drv.prepare_gba_mode(true, SaveType::Sram256k, &path),
            Err(Error::InvalidArg(_))
        ));
    }
}
