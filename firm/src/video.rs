//! Video pipeline of legacy mode.
//!
//! ```text
//!  legacy core ─► LgyCap ─► DMA-330 ─► capture texture ─┬──────────────┐
//!                                                       │ core 1 (LUT) │
//!                                                       ▼              ▼
//!                   frame handler: P3D draw ─► PPF transfer ─► swap buffers
//! ```
//!
//! One frame is in flight per stage. The frame handler task wakes on the
//! frame-ready event of the capture driver, or on the conversion-finished
//! event of core 1 when color correction is on.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
    bitmap::BmpV1WithMasks,
    color::{COLOR_LUT_ADDR, lut_bytes, make_color_lut, profile, top_lcd_gamma_table},
    config::OafConfig,
    core1::Core1,
    drivers::{
        dma330::Dma330Driver,
        gx::{
            Fill, GfxEvent, Gfx, Screen,
            cmdlist::{GPU_RENDER_BUF_ADDR, GPU_TEXTURE_ADDR, GbaLists, TEXTURE_WIDTH},
        },
        lgycap::{CaptureConfig, LgyCapDriver},
        scaler::ScalerMatrix,
    },
    error::{Error, Result},
    fs::FileSystem,
    hardware::{
        Soc,
        gpu::{PPF_CROP_EN, PPF_OUT_TILED, PSC_FILL_32_BITS, PixelFormat, ppf_dim, ppf_i_fmt, ppf_o_fmt},
        lgycap::{LEGACY_HEIGHT, LEGACY_WIDTH, LGYCAP_IRQ_DMA_REQ},
        mem::{CAPTURE_PROG_ADDR, CAPTURE_PROG_SIZE, GPU_FRAME_LIST_ADDR, GPU_INIT_LIST_ADDR, GPU_LIST_SIZE, PhysMem},
        shared::{SharedRegion, flush_dcache_range},
    },
    hid::Hid,
    kernel::{Event, Irq, IsrRegistration},
    rtc::RtcTimeDate,
};

pub const SCREENSHOT_DIR: &str = "screenshots";
pub const BORDER_FILE: &str = "border.bgr";

/// Screenshot pixels start here so the PPF output stays aligned.
const SCREENSHOT_PIXEL_OFFSET: u32 = 0x80;

const fn bgr8_transfer() -> u32 {
    ppf_o_fmt(PixelFormat::Bgr8) | ppf_i_fmt(PixelFormat::Bgr8)
}

/// `screenshots/YYYY_MM_DD_hh_mm_ss.bmp` with the BCD fields printed as hex.
#[must_use]
pub fn screenshot_path(td: &RtcTimeDate) -> String {
    format!(
        "{SCREENSHOT_DIR}/{:04X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}.bmp",
        u16::from(td.year) + 0x2000,
        td.mon,
        td.day,
        td.hour,
        td.min,
        td.sec
    )
}

/// Installed command lists, `(address, size)`.
#[derive(Clone, Copy, Debug)]
struct Lists {
    init: (u32, usize),
    frame: (u32, usize),
}

impl Lists {
    fn install(mem: &Arc<PhysMem>, scaler: u8, color_corrected: bool) -> Result<Self> {
        let mut lists = GbaLists::new();
        lists.patch_for_scaler(scaler, color_corrected);
        let init = SharedRegion::new(Arc::clone(mem), GPU_INIT_LIST_ADDR, GPU_LIST_SIZE);
        let frame = SharedRegion::new(Arc::clone(mem), GPU_FRAME_LIST_ADDR, GPU_LIST_SIZE);
        Ok(Self {
            init: (lists.init.install(&init)?, lists.init.size()),
            frame: (lists.frame.install(&frame)?, lists.frame.size()),
        })
    }
}

/// Counters of the frame handler.
#[derive(Debug, Default)]
pub struct VideoStats {
    frames: AtomicU64,
    screenshots: AtomicU64,
}

impl VideoStats {
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn screenshots(&self) -> u64 {
        self.screenshots.load(Ordering::Acquire)
    }
}

/// Everything the frame handler task owns.
struct FrameHandler {
    gfx: Arc<Gfx>,
    lgycap: Arc<LgyCapDriver>,
    mem: Arc<PhysMem>,
    fs: Arc<dyn FileSystem>,
    hid: Hid,
    lists: Lists,
    trigger: Arc<Event>,
    stats: Arc<VideoStats>,
}

impl FrameHandler {
    fn run(mut self) {
        match self.frame_loop() {
            Ok(()) | Err(Error::EventDeleted) => info!("video: frame handler done"),
            Err(e) => error!("video: frame handler failed: {e}"),
        }
    }

    fn frame_loop(&mut self) -> Result<()> {
        let mut list = self.lists.init;
        loop {
            self.trigger.wait()?;
            self.trigger.clear();

            self.gfx.process_command_list(list.0, list.1)?;
            list = self.lists.frame;
            self.gfx.wait_for(GfxEvent::P3d, false)?;

            self.gfx.display_transfer(
                GPU_RENDER_BUF_ADDR,
                ppf_dim(240, 400),
                self.gfx.framebuffer(Screen::Top),
                ppf_dim(240, 400),
                bgr8_transfer(),
            )?;
            self.gfx.wait_for(GfxEvent::Ppf, false)?;
            self.gfx.swap_buffers();
            let n = self.stats.frames.fetch_add(1, Ordering::AcqRel) + 1;
            debug!("video: frame {n} presented");

            self.hid.scan_input();
            if self.hid.screenshot_requested() {
                match self.dump_frame_tex() {
                    Ok(path) => {
                        self.stats.screenshots.fetch_add(1, Ordering::AcqRel);
                        info!("video: screenshot saved to {path}");
                    }
                    Err(Error::EventDeleted) => return Err(Error::EventDeleted),
                    Err(e) => warn!("video: screenshot failed: {e}"),
                }
            }
        }
    }

    /// Captures one native resolution frame and writes it as a bitmap. The
    /// hidden top framebuffer is the scratch buffer.
    fn dump_frame_tex(&self) -> Result<String> {
        // One frame of extra delay.
        self.lgycap.capture_frame_unscaled()?;

        let (w, h) = (LEGACY_WIDTH as u32, LEGACY_HEIGHT as u32);
        let header = BmpV1WithMasks::a1bgr5(w, h, SCREENSHOT_PIXEL_OFFSET);
        let tmp = self.gfx.framebuffer(Screen::Top);
        self.gfx.display_transfer(
            GPU_TEXTURE_ADDR,
            ppf_dim(TEXTURE_WIDTH, h),
            tmp + SCREENSHOT_PIXEL_OFFSET,
            ppf_dim(w, h),
            ppf_o_fmt(PixelFormat::A1Bgr5) | ppf_i_fmt(PixelFormat::A1Bgr5) | PPF_CROP_EN,
        )?;
        self.mem.write(tmp, &header.to_bytes())?;
        self.gfx.wait_for(GfxEvent::Ppf, false)?;

        let path = screenshot_path(&RtcTimeDate::now());
        let file = self.mem.read_vec(tmp, header.header.file_size as usize)?;
        let written = self.fs.quick_write(&path, &file);

        // Padding must be transparent again for sharp edges on the GPU.
        self.gfx.memory_fill(
            Some(Fill {
                addr: GPU_TEXTURE_ADDR,
                len: (TEXTURE_WIDTH * h * 2) as usize,
                value: 0,
                width: PSC_FILL_32_BITS,
            }),
            None,
        )?;
        self.gfx.wait_for(GfxEvent::Psc0, false)?;

        self.lgycap.start()?;
        written.map(|()| path)
    }
}

/// The running legacy video pipeline.
pub struct OafVideo {
    gfx: Arc<Gfx>,
    lgycap: Arc<LgyCapDriver>,
    frame_ready: Arc<Event>,
    conv_finished: Option<Arc<Event>>,
    core1: Option<Core1>,
    handler: Option<JoinHandle<()>>,
    stats: Arc<VideoStats>,
    _ipi: Option<IsrRegistration>,
}

impl OafVideo {
    /// Starts capture, core 1 if a color profile is selected and the frame
    /// handler, loads the LCD gamma table and, without scaling, the border.
    ///
    /// # Errors
    /// Driver init failures: the capture channel busy, interrupts already
    /// taken, memory errors.
    pub fn init(
        soc: &Soc,
        gfx: Arc<Gfx>,
        dma: Arc<Dma330Driver>,
        fs: Arc<dyn FileSystem>,
        cfg: &OafConfig,
    ) -> Result<Self> {
        let scaler = cfg.scaler;
        let color_profile = if cfg.color_correction() {
            Some(profile(cfg.color_profile).ok_or(Error::InvalidArg("unknown color profile"))?)
        } else {
            None
        };

        let mut cap_cfg = CaptureConfig::for_scaler(scaler, ScalerMatrix::load(fs.as_ref()));
        if color_profile.is_some() {
            cap_cfg.irq = LGYCAP_IRQ_DMA_REQ;
        }
        let prog = SharedRegion::new(Arc::clone(&soc.mem), CAPTURE_PROG_ADDR, CAPTURE_PROG_SIZE);
        let lgycap = Arc::new(LgyCapDriver::init(
            Arc::clone(&soc.lgycap),
            dma,
            Arc::clone(&soc.gpu),
            &soc.arm11_irq,
            prog,
            cap_cfg,
        )?);
        let frame_ready = lgycap.frame_ready();

        let lists = Lists::install(&soc.mem, scaler, color_profile.is_some())?;

        let (conv_finished, core1, ipi) = match color_profile {
            Some(p) => {
                let lut = make_color_lut(p, cfg);
                soc.mem.write(COLOR_LUT_ADDR, &lut_bytes(&lut))?;
                flush_dcache_range(COLOR_LUT_ADDR, lut.len() * 4);

                let conv_finished = Event::new();
                let signal = Arc::clone(&conv_finished);
                let ipi = soc.arm11_irq.register(Irq::Ipi15, move |_| signal.signal())?;
                let lines = if scaler < 2 { 160 } else { 240 };
                let core1 = Core1::boot(
                    Arc::clone(&soc.mem),
                    Arc::clone(&soc.arm11_irq),
                    Arc::clone(&frame_ready),
                    lines,
                )?;
                info!("video: color profile {} on core 1", cfg.color_profile);
                (Some(conv_finished), Some(core1), Some(ipi))
            }
            None => (None, None, None),
        };

        gfx.load_gamma_table(Screen::Top, &top_lcd_gamma_table());
        if scaler == 0 {
            load_border(&gfx, &soc.mem, fs.as_ref())?;
        }
        if let Err(e) = fs.make_dir(SCREENSHOT_DIR) {
            warn!("video: cannot create {SCREENSHOT_DIR}: {e}");
        }

        let stats = Arc::new(VideoStats::default());
        let handler = FrameHandler {
            gfx: Arc::clone(&gfx),
            lgycap: Arc::clone(&lgycap),
            mem: Arc::clone(&soc.mem),
            fs,
            hid: Hid::new(Arc::clone(&soc.keypad)),
            lists,
            trigger: conv_finished.clone().unwrap_or_else(|| Arc::clone(&frame_ready)),
            stats: Arc::clone(&stats),
        };
        let handler = thread::Builder::new()
            .name("gba gfx".into())
            .spawn(move || handler.run())?;
        info!("video: scaler {scaler} running");

        Ok(Self {
            gfx,
            lgycap,
            frame_ready,
            conv_finished,
            core1,
            handler: Some(handler),
            stats,
            _ipi: ipi,
        })
    }

    /// Signaled for every captured frame.
    #[must_use]
    pub fn frame_ready(&self) -> &Arc<Event> {
        &self.frame_ready
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<VideoStats> {
        &self.stats
    }

    #[must_use]
    pub const fn color_corrected(&self) -> bool {
        self.core1.is_some()
    }

    /// Stops capturing and blanks the screens.
    pub fn sleep(&self) {
        self.lgycap.stop();
        self.gfx.sleep();
        info!("video: asleep");
    }

    /// # Errors
    /// If capture cannot be restarted.
    pub fn wake(&self, top: u8, bot: u8) -> Result<()> {
        self.gfx.wake(top, bot);
        self.gfx.load_gamma_table(Screen::Top, &top_lcd_gamma_table());
        self.lgycap.start()?;
        info!("video: awake");
        Ok(())
    }

    /// Turns capture off and waits for the frame handler and core 1 to end.
    /// The graphics driver stays up.
    pub fn deinit(mut self) {
        self.frame_ready.delete();
        if let Some(ev) = &self.conv_finished {
            ev.delete();
        }
        if let Some(h) = self.handler.take() {
            let _ = h.join().map_err(|_| error!("video: frame handler panicked"));
        }
        if let Some(core1) = self.core1.take() {
            if let Err(e) = core1.join() {
                error!("video: {e}");
            }
        }

        match Arc::try_unwrap(self.lgycap) {
            Ok(lgycap) => lgycap.deinit(),
            Err(lgycap) => {
                warn!("video: capture driver still shared, only stopping it");
                lgycap.stop();
            }
        }
        info!("video: {} frames shown", self.stats.frames());
    }
}

/// Reads the border into the hidden top framebuffer and transfers it tiled
/// into the render buffer, around the unscaled frame. A missing border is
/// fine.
fn load_border(gfx: &Gfx, mem: &PhysMem, fs: &dyn FileSystem) -> Result<()> {
    let size = gfx.framebuffer_size(Screen::Top);
    let mut buf = vec![0; size];
    match fs.quick_read(BORDER_FILE, &mut buf) {
        Ok(_) => {}
        Err(Error::NoFile(_)) => return Ok(()),
        Err(e) => {
            warn!("video: cannot read {BORDER_FILE}: {e}");
            return Ok(());
        }
    }

    let tmp = gfx.framebuffer(Screen::Top);
    mem.write(tmp, &buf)?;
    gfx.display_transfer(
        tmp,
        ppf_dim(240, 400),
        GPU_RENDER_BUF_ADDR,
        ppf_dim(240, 400),
        bgr8_transfer() | PPF_OUT_TILED,
    )?;
    gfx.wait_for(GfxEvent::Ppf, false)?;
    info!("video: border loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        fs::MemFs,
        hardware::{
            legacy::{LegacyVideo, Pattern, bgr555},
            mem::{DMA_SCRATCH_ADDR, DMA_SCRATCH_SIZE},
        },
        hid::HidKeys,
        kernel::spin_until,
    };

    const RED: [u8; 3] = [0, 0, 0xFF];

    struct Rig {
        soc: Soc,
        gfx: Arc<Gfx>,
        fs: Arc<MemFs>,
        video: OafVideo,
    }

    fn rig(cfg: &OafConfig, fs: MemFs) -> Rig {
        let soc = Soc::new();
        let gfx = Arc::new(
            Gfx::init(Arc::clone(&soc.gpu), &soc.arm11_irq, PixelFormat::Bgr8, PixelFormat::Rgb565).unwrap(),
        );
        let scratch = SharedRegion::new(Arc::clone(&soc.mem), DMA_SCRATCH_ADDR, DMA_SCRATCH_SIZE);
        let dma = Arc::new(Dma330Driver::init(Arc::clone(&soc.cdma), &scratch).unwrap());
        let fs = Arc::new(fs);
        let video = OafVideo::init(&soc, Arc::clone(&gfx), dma, Arc::clone(&fs) as _, cfg).unwrap();
        Rig { soc, gfx, fs, video }
    }

    fn push_until_presented(r: &Rig, src: &mut LegacyVideo, frames: u64) {
        while r.video.stats().frames() < frames {
            src.step(&r.soc.lgycap);
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Landscape pixel of the shown top framebuffer.
    fn shown_px(r: &Rig, lx: u32, ly: u32) -> Vec<u8> {
        let fb = r.gfx.displayed_framebuffer(Screen::Top);
        let idx = lx * 240 + (239 - ly);
        r.soc.mem.read_vec(fb + idx * 3, 3).unwrap()
    }

    fn count_game_pixels(r: &Rig, color: [u8; 3]) -> usize {
        let mut n = 0;
        for ly in 40..200 {
            for lx in 80..320 {
                if shown_px(r, lx, ly) == color {
                    n += 1;
                }
            }
        }
        n
    }

    /// Holds the screenshot combo until one was written, then waits for
    /// two more frames.
    fn take_screenshot(r: &Rig) {
        let taken = r.video.stats().screenshots();
        r.soc.keypad.press(HidKeys::SCREENSHOT);
        spin_until(|| r.video.stats().screenshots() > taken);
        r.soc.keypad.release(HidKeys::SCREENSHOT);
        let shown = r.video.stats().frames();
        spin_until(|| r.video.stats().frames() > shown + 1);
    }

    #[test]
    fn unscaled_solid_frame_reaches_the_screen() {
        let cfg = OafConfig {
            scaler: 0,
            ..OafConfig::default()
        };
        let r = rig(&cfg, MemFs::new());
        let mut src = LegacyVideo::new(Pattern::Solid(bgr555(31, 0, 0)));
        push_until_presented(&r, &mut src, 2);

        assert_eq!(count_game_pixels(&r, RED), 240 * 160);
        assert_eq!(shown_px(&r, 79, 40), vec![0, 0, 0]);
        assert_eq!(shown_px(&r, 320, 100), vec![0, 0, 0]);
        // The top LCD gamma table was installed.
        r.soc.gpu.with_pdc(0, |pdc| assert_eq!(pdc.color_lut[1] & 0xFF_FFFF, 0x01_0101));
        r.video.deinit();
    }

    #[test]
    fn identity_color_profile_goes_through_core1() {
        let cfg = OafConfig {
            scaler: 0,
            color_profile: 8,
            ..OafConfig::default()
        };
        let r = rig(&cfg, MemFs::new());
        assert!(r.video.color_corrected());
        let mut src = LegacyVideo::new(Pattern::Solid(bgr555(31, 0, 0)));
        push_until_presented(&r, &mut src, 2);

        assert_eq!(count_game_pixels(&r, RED), 240 * 160);
        r.video.deinit();
        assert!(!r.soc.arm11_irq.is_registered(Irq::Ipi15));
    }

    #[test]
    fn border_surrounds_the_unscaled_frame() {
        let fs = MemFs::new();
        // BGR8 green border.
        fs.insert(BORDER_FILE, [0, 0xFF, 0].repeat(400 * 240));
        let cfg = OafConfig {
            scaler: 0,
            ..OafConfig::default()
        };
        let r = rig(&cfg, fs);
        let mut src = LegacyVideo::new(Pattern::Solid(bgr555(31, 0, 0)));
        push_until_presented(&r, &mut src, 1);

        assert_eq!(shown_px(&r, 0, 0), vec![0, 0xFF, 0]);
        assert_eq!(shown_px(&r, 79, 100), vec![0, 0xFF, 0]);
        assert_eq!(shown_px(&r, 80, 100), RED.to_vec());
        r.video.deinit();
    }

    #[test]
    fn screenshot_is_a_bitmap_of_the_native_frame() {
        let cfg = OafConfig {
            scaler: 2,
            ..OafConfig::default()
        };
        let r = rig(&cfg, MemFs::new());
        let legacy = LegacyVideo::new(Pattern::Solid(bgr555(31, 0, 0))).spawn(Arc::clone(&r.soc.lgycap));
        spin_until(|| r.video.stats().frames() >= 1);

        take_screenshot(&r);
        drop(legacy.stop());

        let files = r.fs.list(SCREENSHOT_DIR);
        assert_eq!(files.len(), 1);
        let bmp = r.fs.get(&files[0]).unwrap();
        let header = BmpV1WithMasks::a1bgr5(240, 160, 0x80);
        assert_eq!(bmp.len(), header.header.file_size as usize);
        assert_eq!(&bmp[..BmpV1WithMasks::SIZE], &header.to_bytes());
        let pixels = &bmp[0x80..];
        assert!(pixels.chunks_exact(2).all(|p| p == 0xF801_u16.to_le_bytes()));

        // Capture went back to the scaled mode.
        assert!(r.video.lgycap.is_running());
        assert_eq!(r.video.lgycap.config().width, 360);
        r.video.deinit();
    }

    #[test]
    fn screenshots_with_color_correction_keep_core1_going() {
        let cfg = OafConfig {
            scaler: 2,
            color_profile: 8,
            ..OafConfig::default()
        };
        let r = rig(&cfg, MemFs::new());
        let legacy = LegacyVideo::new(Pattern::Solid(bgr555(31, 0, 0))).spawn(Arc::clone(&r.soc.lgycap));
        spin_until(|| r.video.stats().frames() >= 1);

        // Core 1 and the unscaled capture both wait for a ready frame.
        for round in 1..=5 {
            take_screenshot(&r);
            assert_eq!(r.video.stats().screenshots(), round);
            for file in r.fs.list(SCREENSHOT_DIR) {
                let bmp = r.fs.get(&file).unwrap();
                assert!(bmp[0x80..].chunks_exact(2).all(|p| p == 0xF801_u16.to_le_bytes()));
            }
        }
        drop(legacy.stop());

        // Corrected, scaled frames still reach the screen.
        assert!(r.video.lgycap.is_running());
        assert_eq!(shown_px(&r, 200, 120), RED.to_vec());
        r.video.deinit();
    }

    #[test]
    fn sleep_stops_capture_until_wake() {
        let r = rig(&OafConfig::default(), MemFs::new());
        r.video.sleep();
        let mut src = LegacyVideo::new(Pattern::Solid(0));
        src.step(&r.soc.lgycap);
        assert!(!r.video.frame_ready().is_signaled());
        r.soc.gpu.with_pdc(0, |pdc| assert_eq!(pdc.light, 0));

        r.video.wake(64, 0).unwrap();
        push_until_presented(&r, &mut src, 1);
        r.soc.gpu.with_pdc(0, |pdc| assert_eq!(pdc.light, 64));
        r.video.deinit();
    }

    #[test]
    fn screenshot_names_follow_the_clock() {
        let td = RtcTimeDate {
            sec: 0x59,
            min: 0x07,
            hour: 0x23,
            dow: 1,
            day: 0x31,
            mon: 0x12,
            year: 0x24,
        };
        assert_eq!(screenshot_path(&td), "screenshots/2024_12_31_23_07_59.bmp");
    }
}
