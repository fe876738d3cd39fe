//! ARM11 side of the firmware.
//!
//! Boot order: PXI up, config and ROM, save type, the ARM9 prepares legacy
//! mode, graphics and the capture pipeline come up, then the legacy core is
//! started. Once PXI is up every later failure halts the ARM11, which tells
//! the ARM9 to write the save back before power off.

use std::sync::{Arc, OnceLock};

use tracing::{error, info, warn};

use crate::{
    config::{OafConfig, SAVE_TYPE_AUTO},
    drivers::{
        dma330::Dma330Driver,
        gx::Gfx,
        ipc::{CommandHandler, IpcRequest, cmd11},
        lgy11::Lgy11Driver,
        pxi::PxiDriver,
    },
    error::{Error, Result, code},
    fs::FileSystem,
    hardware::{
        Soc,
        gpu::PixelFormat,
        mem::{DMA_SCRATCH_ADDR, DMA_SCRATCH_SIZE, IPC_SCRATCH_ADDR, IPC_SCRATCH_SIZE},
        pxi::Cpu,
        shared::SharedRegion,
    },
    panic::{Arm11Panic, HaltState},
    rom::{load_gba_rom, save_path},
    rtc::GbaRtc,
    save_type::{SaveType, detect_save_type, lookup_save_type},
    video::OafVideo,
};

/// What to boot and the command line overrides of the config.
#[derive(Clone, Debug, Default)]
pub struct BootOptions {
    pub rom_path: String,
    pub scaler: Option<u8>,
    pub color_profile: Option<u8>,
}

struct Arm11Handler {
    panic: Arm11Panic,
    peer_halt: OnceLock<&'static str>,
}

impl CommandHandler for Arm11Handler {
    fn handle(&self, req: &IpcRequest) -> Option<u32> {
        match req.cmd {
            cmd11::PRINT_MSG => info!("ARM9: message"),
            cmd11::PANIC | cmd11::EXCEPTION => {
                let what = if req.cmd == cmd11::PANIC { "panic" } else { "exception" };
                error!("ARM9 {what}");
                let _ = self.peer_halt.set(what);
            }
            _ => return None,
        }
        Some(code::OK)
    }

    fn protocol_error(&self, reason: &str) {
        let _ = self.panic.halt(reason);
    }
}

/// The ARM11 with legacy mode running.
pub struct Arm11 {
    handler: Arc<Arm11Handler>,
    cfg: OafConfig,
    save_type: SaveType,
    rom_size: usize,
    lgy: Lgy11Driver,
    gfx: Arc<Gfx>,
    video: OafVideo,
    pxi: Arc<PxiDriver>,
}

impl Arm11 {
    /// Boots into legacy mode. Blocks until the ARM9 side is up.
    ///
    /// # Errors
    /// Everything that keeps the title from starting: a bad config, a
    /// missing or oversized ROM, the ARM9 failing to load the save, driver
    /// init failures. The ARM11 is halted by then unless PXI itself failed.
    pub fn boot(soc: &Soc, fs: Arc<dyn FileSystem>, opts: &BootOptions) -> Result<Self> {
        let handler = Arc::new(Arm11Handler {
            panic: Arm11Panic::new(Arc::clone(&soc.arm11_irq), soc.pxi.port(Cpu::Arm11), Arc::clone(&soc.mem)),
            peer_halt: OnceLock::new(),
        });
        let pxi = Arc::new(PxiDriver::init(
            soc.pxi.port(Cpu::Arm11),
            &soc.arm11_irq,
            Arc::clone(&handler) as Arc<dyn CommandHandler>,
        )?);

        Self::start_gba(soc, fs, opts, Arc::clone(&handler), pxi).map_err(|e| {
            let _ = handler.panic.halt(&e.to_string());
            e
        })
    }

    fn start_gba(
        soc: &Soc,
        fs: Arc<dyn FileSystem>,
        opts: &BootOptions,
        handler: Arc<Arm11Handler>,
        pxi: Arc<PxiDriver>,
    ) -> Result<Self> {
        let mut cfg = OafConfig::load(fs.as_ref())?;
        if let Some(scaler) = opts.scaler {
            cfg.scaler = scaler;
        }
        if let Some(profile) = opts.color_profile {
            cfg.color_profile = profile;
        }
        cfg.validate()?;

        let rom = load_gba_rom(fs.as_ref(), &opts.rom_path)?;
        let save_type = if cfg.save_type != SAVE_TYPE_AUTO {
            SaveType::try_from(cfg.save_type)?
        } else if cfg.use_gba_db {
            lookup_save_type(fs.as_ref(), &rom, cfg.default_save)
        } else {
            detect_save_type(&rom, cfg.default_save)
        };
        let save_path = save_path(&opts.rom_path, cfg.save_slot);
        // Without a save file the title still runs, its saves are lost.
        let save_type = if save_path.is_none() { SaveType::None } else { save_type };
        info!("ARM11: {} with {save_type:?}", opts.rom_path);

        let scratch = SharedRegion::new(Arc::clone(&soc.mem), IPC_SCRATCH_ADDR, IPC_SCRATCH_SIZE);
        let lgy = Lgy11Driver::new(Arc::clone(&pxi), Arc::clone(&soc.lgy11), scratch)?;
        lgy.prepare_gba_mode(cfg.direct_boot, save_type, save_path.as_deref().unwrap_or_default())?;

        let gfx = Arc::new(Gfx::init(
            Arc::clone(&soc.gpu),
            &soc.arm11_irq,
            PixelFormat::Bgr8,
            PixelFormat::Rgb565,
        )?);
        // Only the top screen shows anything.
        gfx.set_force_black(false, true);
        gfx.set_brightness(cfg.backlight, 0);

        let dma_scratch = SharedRegion::new(Arc::clone(&soc.mem), DMA_SCRATCH_ADDR, DMA_SCRATCH_SIZE);
        let dma = Arc::new(Dma330Driver::init(Arc::clone(&soc.cdma), &dma_scratch)?);
        let video = OafVideo::init(soc, Arc::clone(&gfx), dma, fs, &cfg)?;

        lgy.switch_mode();
        info!("ARM11: legacy mode started");

        Ok(Self {
            handler,
            cfg,
            save_type,
            rom_size: rom.len(),
            lgy,
            gfx,
            video,
            pxi,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &OafConfig {
        &self.cfg
    }

    #[must_use]
    pub const fn save_type(&self) -> SaveType {
        self.save_type
    }

    /// Padded ROM size.
    #[must_use]
    pub const fn rom_size(&self) -> usize {
        self.rom_size
    }

    #[must_use]
    pub const fn video(&self) -> &OafVideo {
        &self.video
    }

    #[must_use]
    pub fn halt_state(&self) -> &Arc<HaltState> {
        self.handler.panic.state()
    }

    /// Set once the ARM9 reported a panic or an exception.
    #[must_use]
    pub fn peer_halt(&self) -> Option<&'static str> {
        self.handler.peer_halt.get().copied()
    }

    /// Lid closed: capture stops, the screens go dark and the save is
    /// written back.
    pub fn sleep(&self) {
        self.video.sleep();
        if let Err(e) = self.lgy.backup_save() {
            warn!("ARM11: backup before sleep failed: {e}");
        }
    }

    /// # Errors
    /// If capture cannot be restarted.
    pub fn wake(&self) -> Result<()> {
        self.video.wake(self.cfg.backlight, 0)?;
        self.gfx.set_force_black(false, true);
        Ok(())
    }

    /// Reads the legacy RTC through the ARM9.
    ///
    /// # Errors
    /// PXI or RTC failures.
    pub fn gba_rtc(&self) -> Result<GbaRtc> {
        self.lgy.get_rtc()
    }

    /// Stops the video pipeline, writes the save back and powers the ARM9
    /// off.
    ///
    /// # Errors
    /// The final save backup failing. Everything is shut down regardless.
    pub fn shutdown(self) -> Result<()> {
        self.video.deinit();
        let backup = self.lgy.deinit();
        if let Err(e) = &backup {
            error!("ARM11: final save backup failed: {e}");
        }
        let power = self.lgy.prepare_power();

        match Arc::try_unwrap(self.gfx) {
            Ok(gfx) => gfx.deinit(),
            Err(_) => warn!("ARM11: graphics still in use, left running"),
        }
        info!("ARM11: powered off");
        backup.and(power)
    }

    /// Stops the video pipeline and halts. Unlike [`Self::shutdown`] this
    /// does not wait on the ARM9, which may have halted itself.
    pub fn abort(self, reason: &str) -> Error {
        self.video.deinit();
        let err = self.handler.panic.halt(reason);
        self.pxi.close();
        err
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        arm9::Arm9,
        config::CONFIG_PATH,
        drivers::gx::FRAMEBUF_BOT,
        fs::MemFs,
        hardware::{
            legacy::{LegacyVideo, Pattern, bgr555},
            lgy9::LGY_MODE_AGB,
            mem::SAVE_LOC,
        },
        kernel::spin_until,
        panic::PANIC_RED,
    };

    fn rom(sdk: &[u8]) -> Vec<u8> {
        let mut rom = vec![0; 0x1000];
        rom[0xAC..0xB0].copy_from_slice(b"AXVE");
        rom[0x400..0x400 + sdk.len()].copy_from_slice(sdk);
        rom
    }

    /// Boots both CPUs, the ARM9 on its own thread.
    fn boot(fs: &Arc<MemFs>, opts: &BootOptions) -> (Soc, thread::JoinHandle<Result<()>>, Result<Arm11>) {
        let soc = Soc::new();
        let arm9 = {
            let soc = soc.clone();
            let fs = Arc::clone(fs) as Arc<dyn FileSystem>;
            thread::spawn(move || Arm9::boot(&soc, fs)?.run())
        };
        let arm11 = Arm11::boot(&soc, Arc::clone(fs) as Arc<dyn FileSystem>, opts);
        (soc, arm9, arm11)
    }

    fn opts(rom_path: &str) -> BootOptions {
        BootOptions {
            rom_path: rom_path.into(),
            ..BootOptions::default()
        }
    }

    #[test]
    fn boots_runs_and_keeps_the_save() {
        let fs = Arc::new(MemFs::new());
        fs.insert("roms/game.gba", rom(b"SRAM_V113"));
        fs.insert(CONFIG_PATH, br#"{"scaler": 0}"#.to_vec());

        let (soc, arm9, arm11) = boot(&fs, &opts("roms/game.gba"));
        let arm11 = arm11.unwrap();
        assert_eq!(arm11.save_type(), SaveType::Sram256k);
        assert_eq!(arm11.rom_size(), 0x10_0000);
        assert_eq!(arm11.config().scaler, 0);
        assert_eq!(soc.lgy11.mode() & 0xFF, LGY_MODE_AGB);
        assert!(soc.lgy11.started());
        let rtc = arm11.gba_rtc().unwrap();
        assert!((0x01..=0x12).contains(&rtc.mon()));

        let mut src = LegacyVideo::new(Pattern::Solid(bgr555(0, 31, 0)));
        while arm11.video().stats().frames() < 3 {
            src.step(&soc.lgycap);
            thread::sleep(std::time::Duration::from_millis(2));
        }

        soc.mem.write(SAVE_LOC, b"progress").unwrap();
        arm11.shutdown().unwrap();
        arm9.join().unwrap().unwrap();

        let save = fs.get("saves/game.sav").unwrap();
        assert_eq!(save.len(), 0x8000);
        assert_eq!(&save[..8], b"progress");
    }

    #[test]
    fn command_line_overrides_the_config() {
        let fs = Arc::new(MemFs::new());
        fs.insert("g.gba", rom(b""));
        fs.insert(CONFIG_PATH, br#"{"scaler": 0, "save_type": 15}"#.to_vec());
        let o = BootOptions {
            scaler: Some(1),
            color_profile: Some(8),
            ..opts("g.gba")
        };

        let (_soc, arm9, arm11) = boot(&fs, &o);
        let arm11 = arm11.unwrap();
        assert_eq!(arm11.config().scaler, 1);
        assert!(arm11.video().color_corrected());
        assert_eq!(arm11.save_type(), SaveType::None);
        arm11.shutdown().unwrap();
        arm9.join().unwrap().unwrap();
        assert!(fs.list("saves").is_empty());
    }

    #[test]
    fn gba_db_decides_the_save_type_unless_disabled() {
        use sha1::{Digest, Sha1};

        use crate::{rom::load_gba_rom, save_type::GBA_DB_PATH};

        let fs = Arc::new(MemFs::new());
        fs.insert("g.gba", rom(b"SRAM_V113"));
        // The database hashes the ROM as it sits in memory, padding included.
        let padded = load_gba_rom(fs.as_ref(), "g.gba").unwrap();
        let mut entry = Sha1::digest(&padded).to_vec();
        entry.extend_from_slice(b"AXVE");
        entry.extend_from_slice(&(SaveType::Flash1mMrxRtc as u32).to_le_bytes());
        fs.insert(GBA_DB_PATH, entry);

        for (config, expected) in [
            (r#"{"scaler": 0}"#, SaveType::Flash1mMrxRtc),
            (r#"{"scaler": 0, "use_gba_db": false}"#, SaveType::Sram256k),
        ] {
            fs.insert(CONFIG_PATH, config.as_bytes().to_vec());
            let (_soc, arm9, arm11) = boot(&fs, &opts("g.gba"));
            let arm11 = arm11.unwrap();
            assert_eq!(arm11.save_type(), expected);
            arm11.shutdown().unwrap();
            arm9.join().unwrap().unwrap();
        }
    }

    #[test]
    fn missing_rom_halts_and_powers_the_arm9_off() {
        let fs = Arc::new(MemFs::new());
        let (soc, arm9, arm11) = boot(&fs, &opts("nothing.gba"));
        assert!(matches!(arm11, Err(Error::NoFile(_))));

        // The ARM9 got PREPARE_POWER from the halt and ends normally.
        arm9.join().unwrap().unwrap();
        let px = soc.mem.read_vec(FRAMEBUF_BOT[1], 2).unwrap();
        assert_eq!(px, PANIC_RED.to_le_bytes());
    }

    #[test]
    fn abort_halts_and_closes_the_link() {
        let fs = Arc::new(MemFs::new());
        fs.insert("g.gba", rom(b""));
        let (soc, arm9, arm11) = boot(&fs, &opts("g.gba"));
        let arm11 = arm11.unwrap();
        let halt = Arc::clone(arm11.halt_state());

        let err = arm11.abort("session lost");
        assert!(matches!(err, Error::Halted(ref r) if r == "session lost"));
        assert_eq!(halt.reason(), Some("session lost"));
        arm9.join().unwrap().unwrap();
        let px = soc.mem.read_vec(FRAMEBUF_BOT[1], 2).unwrap();
        assert_eq!(px, PANIC_RED.to_le_bytes());
    }

    #[test]
    fn arm9_panic_is_noticed() {
        let fs = Arc::new(MemFs::new());
        fs.insert("g.gba", rom(b""));
        let (soc, arm9, arm11) = boot(&fs, &opts("g.gba"));
        let arm11 = arm11.unwrap();
        assert_eq!(arm11.peer_halt(), None);

        crate::drivers::pxi::send_panic_cmd(&soc.pxi.port(Cpu::Arm9), cmd11::PANIC);
        spin_until(|| arm11.peer_halt().is_some());
        assert_eq!(arm11.peer_halt(), Some("panic"));

        arm11.shutdown().unwrap();
        arm9.join().unwrap().unwrap();
    }
}
