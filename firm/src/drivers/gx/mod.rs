//! Graphics driver: framebuffers of both LCDs and the GPU primitives.
//!
//! Every primitive only starts the hardware. Completion is reported through
//! one event per block and the caller waits on the matching event before it
//! touches the destination or swaps buffers:
//!
//! ```text
//! memory_fill          -> GfxEvent::Psc0 / Psc1
//! display_transfer     -> GfxEvent::Ppf
//! texture_copy         -> GfxEvent::Ppf
//! process_command_list -> GfxEvent::P3d
//! ```

pub mod cmdlist;
pub mod vram;

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU32, Ordering},
};

use tracing::{debug, info};
use vram::VramAllocator;

use self::cmdlist::GPU_RENDER_BUF_ADDR;
use crate::{
    error::Result,
    hardware::{
        gpu::{
            Gpu, LCD_COLOR_LUT_SIZE, LCD_FILL_EN, PPF_EN, PPF_TEXCOPY, PSC_FILL_32_BITS, PSC_START,
            PixelFormat, PpfRegs,
        },
        mem::VRAM_BASE,
    },
    kernel::{Event, Irq, IrqController, IsrRegistration},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Screen {
    Top = 0,
    Bottom = 1,
}

impl Screen {
    const fn idx(self) -> usize {
        self as usize
    }

    /// Portrait dimensions as the display controller scans them out.
    #[must_use]
    pub const fn dim(self) -> (u32, u32) {
        match self {
            Self::Top => (240, 400),
            Self::Bottom => (240, 320),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxEvent {
    Psc0 = 0,
    Psc1 = 1,
    Pdc0 = 2,
    Pdc1 = 3,
    Ppf = 4,
    P3d = 5,
}

impl GfxEvent {
    const ALL: [Self; 6] = [Self::Psc0, Self::Psc1, Self::Pdc0, Self::Pdc1, Self::Ppf, Self::P3d];

    const fn irq(self) -> Irq {
        match self {
            Self::Psc0 => Irq::Psc0,
            Self::Psc1 => Irq::Psc1,
            Self::Pdc0 => Irq::Pdc0,
            Self::Pdc1 => Irq::Pdc1,
            Self::Ppf => Irq::Ppf,
            Self::P3d => Irq::P3d,
        }
    }
}

const TOP_FB_SIZE: u32 = 400 * 240 * 3;
const BOT_FB_SIZE: u32 = 320 * 240 * 2;

/// Where [`Gfx::init`] places the bottom framebuffers for a BGR8 top and
/// RGB565 bottom screen. The ARM9 panic screen paints these directly.
pub const FRAMEBUF_BOT: [u32; 2] = [
    VRAM_BASE + 2 * TOP_FB_SIZE,
    VRAM_BASE + 2 * TOP_FB_SIZE + BOT_FB_SIZE,
];
pub const FRAMEBUF_BOT_SIZE: usize = BOT_FB_SIZE as usize;

/// One range of a memory fill. `width` is one of the `PSC_FILL_*` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fill {
    pub addr: u32,
    pub len: usize,
    pub value: u32,
    pub width: u32,
}

/// PDC format word: DMA burst size, output enable on the top screen and the
/// pixel format in the low bits.
const fn pdc_format(screen: Screen, fmt: PixelFormat) -> u32 {
    let out_en = if matches!(screen, Screen::Top) { 1 << 6 } else { 0 };
    3 << 8 | out_en | fmt as u32
}

pub struct Gfx {
    gpu: Arc<Gpu>,
    vram: Mutex<VramAllocator>,
    framebufs: [[u32; 2]; 2],
    formats: [PixelFormat; 2],
    swap: AtomicU32,
    events: [Arc<Event>; 6],
    _isrs: Vec<IsrRegistration>,
}

impl Gfx {
    /// Allocates two framebuffers per screen, points the display controllers
    /// at them, clears them and lights both screens.
    ///
    /// # Errors
    /// If VRAM runs out or a GPU interrupt already has a handler.
    pub fn init(
        gpu: Arc<Gpu>,
        irq: &Arc<IrqController>,
        fmt_top: PixelFormat,
        fmt_bot: PixelFormat,
    ) -> Result<Self> {
        let events = GfxEvent::ALL.map(|_| Event::new());
        let isrs = GfxEvent::ALL
            .iter()
            .map(|&ev| {
                let event = Arc::clone(&events[ev as usize]);
                irq.register(ev.irq(), move |_| event.signal())
            })
            .collect::<Result<Vec<_>>>()?;

        // The render buffer and textures sit above the framebuffers.
        let mut vram = VramAllocator::with_range(VRAM_BASE, GPU_RENDER_BUF_ADDR - VRAM_BASE);
        let formats = [fmt_top, fmt_bot];
        let mut framebufs = [[0; 2]; 2];
        for screen in [Screen::Top, Screen::Bottom] {
            let (w, h) = screen.dim();
            let size = (w * h) as usize * formats[screen.idx()].bytes_per_pixel();
            for fb in &mut framebufs[screen.idx()] {
                *fb = vram.alloc_default(size)?;
            }
        }

        let gfx = Self {
            gpu,
            vram: Mutex::new(vram),
            framebufs,
            formats,
            swap: AtomicU32::new(0),
            events,
            _isrs: isrs,
        };
        gfx.set_force_black(true, true);
        for screen in [Screen::Top, Screen::Bottom] {
            gfx.setup_display_controller(screen);
        }

        // Clear both buffer pairs before anything is shown.
        for i in 0..2 {
            let fill = |screen: Screen| Fill {
                addr: gfx.framebufs[screen.idx()][i],
                len: gfx.framebuffer_size(screen),
                value: 0,
                width: PSC_FILL_32_BITS,
            };
            gfx.memory_fill(Some(fill(Screen::Top)), Some(fill(Screen::Bottom)))?;
            gfx.wait_for(GfxEvent::Psc0, false)?;
            gfx.wait_for(GfxEvent::Psc1, false)?;
        }

        gfx.set_force_black(false, false);
        info!(
            "GFX: framebuffers top {:08X?} bottom {:08X?}",
            gfx.framebufs[0], gfx.framebufs[1]
        );
        Ok(gfx)
    }

    fn setup_display_controller(&self, screen: Screen) {
        let fmt = self.formats[screen.idx()];
        let fbs = self.framebufs[screen.idx()];
        self.gpu.with_pdc(screen.idx(), |pdc| {
            pdc.fb_a = fbs;
            pdc.fmt = pdc_format(screen, fmt);
            pdc.stride = 240 * fmt.bytes_per_pixel() as u32;
            pdc.swap = 0;
            // Linear gamma until the video setup loads its curve.
            pdc.set_color_lut_addr(0);
            for i in 0..LCD_COLOR_LUT_SIZE as u32 {
                pdc.write_color_lut_data(0x1_0101 * i);
            }
        });
    }

    #[must_use]
    pub fn gpu(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    #[must_use]
    pub const fn format(&self, screen: Screen) -> PixelFormat {
        self.formats[screen.idx()]
    }

    #[must_use]
    pub const fn framebuffer_size(&self, screen: Screen) -> usize {
        let (w, h) = screen.dim();
        (w * h) as usize * self.formats[screen.idx()].bytes_per_pixel()
    }

    /// The framebuffer not being scanned out, free for the next frame.
    #[must_use]
    pub fn framebuffer(&self, screen: Screen) -> u32 {
        let idx = (self.swap.load(Ordering::Acquire) ^ 1) & 1;
        self.framebufs[screen.idx()][idx as usize]
    }

    /// The framebuffer being scanned out.
    #[must_use]
    pub fn displayed_framebuffer(&self, screen: Screen) -> u32 {
        let idx = self.swap.load(Ordering::Acquire) & 1;
        self.framebufs[screen.idx()][idx as usize]
    }

    /// Both framebuffers of `screen`.
    #[must_use]
    pub const fn framebuffers(&self, screen: Screen) -> [u32; 2] {
        self.framebufs[screen.idx()]
    }

    /// Shows the buffer returned by [`Self::framebuffer`] on both screens from
    /// the next frame on.
    pub fn swap_buffers(&self) {
        let swap = self.swap.fetch_xor(1, Ordering::AcqRel) ^ 1;
        self.gpu.set_pdc_swap(Screen::Top.idx(), swap);
        self.gpu.set_pdc_swap(Screen::Bottom.idx(), swap);
    }

    /// Blocks until `ev` fired. With `discard` a completion that arrived
    /// before the call is ignored.
    ///
    /// # Errors
    /// [`Error::EventDeleted`](crate::error::Error::EventDeleted) after
    /// [`Self::deinit`].
    pub fn wait_for(&self, ev: GfxEvent, discard: bool) -> Result<()> {
        let event = &self.events[ev as usize];
        if discard {
            event.clear();
        }
        event.wait()?;
        event.clear();
        Ok(())
    }

    pub fn set_force_black(&self, top: bool, bot: bool) {
        for (screen, on) in [(Screen::Top, top), (Screen::Bottom, bot)] {
            self.gpu
                .with_pdc(screen.idx(), |pdc| pdc.fill = if on { LCD_FILL_EN } else { 0 });
        }
    }

    pub fn set_brightness(&self, top: u8, bot: u8) {
        self.gpu.with_pdc(Screen::Top.idx(), |pdc| pdc.light = top);
        self.gpu.with_pdc(Screen::Bottom.idx(), |pdc| pdc.light = bot);
    }

    /// Replaces the gamma table of `screen`.
    pub fn load_gamma_table(&self, screen: Screen, table: &[u32]) {
        self.gpu.with_pdc(screen.idx(), |pdc| {
            pdc.set_color_lut_addr(0);
            for &entry in table.iter().take(LCD_COLOR_LUT_SIZE) {
                pdc.write_color_lut_data(entry);
            }
        });
    }

    /// Blanks both screens and turns the backlights off.
    pub fn sleep(&self) {
        self.set_force_black(true, true);
        self.set_brightness(0, 0);
        debug!("GFX: sleeping");
    }

    pub fn wake(&self, top: u8, bot: u8) {
        self.set_brightness(top, bot);
        self.set_force_black(false, false);
        debug!("GFX: awake");
    }

    /// Fills one or two ranges, each with its own fill unit.
    ///
    /// # Errors
    /// If a range is not mapped.
    pub fn memory_fill(&self, fill0: Option<Fill>, fill1: Option<Fill>) -> Result<()> {
        for (idx, fill) in [(0, fill0), (1, fill1)] {
            if let Some(f) = fill {
                self.gpu.set_psc(idx, f.addr, f.addr + f.len as u32, f.value);
                self.gpu.set_psc_cnt(idx, f.width | PSC_START)?;
            }
        }
        Ok(())
    }

    /// Format converting copy. Dimensions are `height << 16 | width`.
    ///
    /// # Errors
    /// On unmapped ranges and dimensions the PPF rejects.
    pub fn display_transfer(
        &self,
        src: u32,
        in_dim: u32,
        dst: u32,
        out_dim: u32,
        flags: u32,
    ) -> Result<()> {
        self.gpu.set_ppf(PpfRegs {
            in_addr: src,
            out_addr: dst,
            dim_in: in_dim,
            dim_out: out_dim,
            flags,
            ..PpfRegs::default()
        });
        self.gpu.set_ppf_cnt(PPF_EN)
    }

    /// Raw copy of `size` bytes. Line dimensions are `gap << 16 | width` in
    /// 16 byte units, zero for one contiguous run.
    ///
    /// # Errors
    /// On unmapped ranges.
    pub fn texture_copy(
        &self,
        src: u32,
        in_dim: u32,
        dst: u32,
        out_dim: u32,
        size: usize,
    ) -> Result<()> {
        self.gpu.set_ppf(PpfRegs {
            in_addr: src,
            out_addr: dst,
            flags: PPF_TEXCOPY,
            len: size as u32,
            tc_in: in_dim,
            tc_out: out_dim,
            ..PpfRegs::default()
        });
        self.gpu.set_ppf_cnt(PPF_EN)
    }

    /// Hands the command list at `addr` to the 3D pipeline.
    ///
    /// # Errors
    /// If the list or a surface it draws to is not mapped.
    pub fn process_command_list(&self, addr: u32, size: usize) -> Result<()> {
        self.gpu.run_command_list(addr, size)
    }

    /// Blanks the screens, frees the framebuffers and wakes everyone waiting
    /// on a GPU event with an error.
    pub fn deinit(self) {
        self.set_brightness(0, 0);
        self.set_force_black(true, true);
        let mut vram = self.vram.lock().unwrap_or_else(PoisonError::into_inner);
        for fb in self.framebufs.iter().flatten() {
            vram.free(*fb);
        }
        for event in &self.events {
            event.delete();
        }
        info!("GFX: deinitialized");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::Error,
        hardware::{
            Soc,
            gpu::{GpuTraceEvent, PSC_FILL_16_BITS, ppf_dim, ppf_i_fmt, ppf_o_fmt},
        },
    };

    fn gfx() -> (Soc, Gfx) {
        let soc = Soc::new();
        let gfx = Gfx::init(
            Arc::clone(&soc.gpu),
            &soc.arm11_irq,
            PixelFormat::Bgr8,
            PixelFormat::Rgb565,
        )
        .unwrap();
        (soc, gfx)
    }

    #[test]
    fn init_programs_both_display_controllers() {
        let (soc, gfx) = gfx();
        let top = gfx.framebuffers(Screen::Top);
        let bot = gfx.framebuffers(Screen::Bottom);
        assert_eq!(top, [VRAM_BASE, VRAM_BASE + 400 * 240 * 3]);
        assert_eq!(bot[0], VRAM_BASE + 2 * 400 * 240 * 3);
        assert_eq!(bot, FRAMEBUF_BOT);

        soc.gpu.with_pdc(0, |pdc| {
            assert_eq!(pdc.fb_a, top);
            assert_eq!(pdc.fmt & 7, PixelFormat::Bgr8 as u32);
            assert_eq!(pdc.stride, 720);
            assert_eq!(pdc.fill, 0);
            assert_eq!(pdc.color_lut[255], 0xFF_FFFF);
        });
        soc.gpu.with_pdc(1, |pdc| assert_eq!(pdc.stride, 480));
        assert_eq!(gfx.framebuffer(Screen::Top), top[1]);
        assert_eq!(gfx.displayed_framebuffer(Screen::Top), top[0]);
        // A second driver cannot claim the interrupts.
        assert!(matches!(
            Gfx::init(Arc::clone(&soc.gpu), &soc.arm11_irq, PixelFormat::Bgr8, PixelFormat::Rgb565),
            Err(Error::IrqInUse(Irq::Psc0))
        ));
    }

    #[test]
    fn fill_two_ranges() {
        let (soc, gfx) = gfx();
        let a = gfx.framebuffer(Screen::Top);
        let b = gfx.framebuffer(Screen::Bottom);
        gfx.memory_fill(
            Some(Fill {
                addr: a,
                len: 16,
                value: 0xABCD,
                width: PSC_FILL_16_BITS,
            }),
            Some(Fill {
                addr: b,
                len: 8,
                value: 0x1122_3344,
                width: PSC_FILL_32_BITS,
            }),
        )
        .unwrap();
        gfx.wait_for(GfxEvent::Psc0, false).unwrap();
        gfx.wait_for(GfxEvent::Psc1, false).unwrap();
        assert_eq!(soc.mem.read_vec(a, 4).unwrap(), vec![0xCD, 0xAB, 0xCD, 0xAB]);
        assert_eq!(soc.mem.read_u32(b + 4).unwrap(), 0x1122_3344);
    }

    #[test]
    fn swap_only_after_each_transfer() {
        let (soc, gfx) = gfx();
        let src = GPU_RENDER_BUF_ADDR;
        soc.mem.fill(src, 8 * 8 * 3, 0x5A).unwrap();
        soc.gpu.start_trace();

        for _ in 0..10_000 {
            let dst = gfx.framebuffer(Screen::Top);
            gfx.display_transfer(
                src,
                ppf_dim(8, 8),
                dst,
                ppf_dim(8, 8),
                ppf_i_fmt(PixelFormat::Bgr8) | ppf_o_fmt(PixelFormat::Bgr8),
            )
            .unwrap();
            gfx.wait_for(GfxEvent::Ppf, false).unwrap();
            gfx.swap_buffers();
        }

        let trace = soc.gpu.take_trace();
        assert_eq!(trace.len(), 30_000);
        for (i, step) in trace.chunks_exact(3).enumerate() {
            let shown = ((i + 1) & 1) as u8;
            let written = gfx.framebuffers(Screen::Top)[usize::from(shown)];
            assert_eq!(step, [
                GpuTraceEvent::TransferDone { dst: written },
                GpuTraceEvent::Swap {
                    screen: 0,
                    buffer: shown
                },
                GpuTraceEvent::Swap {
                    screen: 1,
                    buffer: shown
                },
            ]);
        }
    }

    #[test]
    fn texture_copy_is_raw() {
        let (soc, gfx) = gfx();
        let src = GPU_RENDER_BUF_ADDR;
        soc.mem.write(src, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let dst = gfx.framebuffer(Screen::Bottom);
        gfx.texture_copy(src, 0, dst, 0, 8).unwrap();
        gfx.wait_for(GfxEvent::Ppf, false).unwrap();
        assert_eq!(soc.mem.read_vec(dst, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn discard_drops_stale_completion() {
        let (_soc, gfx) = gfx();
        gfx.events[GfxEvent::P3d as usize].signal();
        gfx.wait_for(GfxEvent::P3d, false).unwrap();
        assert!(!gfx.events[GfxEvent::P3d as usize].is_signaled());

        gfx.events[GfxEvent::P3d as usize].signal();
        gfx.events[GfxEvent::P3d as usize].delete();
        assert!(matches!(gfx.wait_for(GfxEvent::P3d, true), Err(Error::EventDeleted)));
    }

    #[test]
    fn deinit_blanks_and_wakes_waiters() {
        let (soc, gfx) = gfx();
        gfx.set_brightness(64, 32);
        soc.gpu.with_pdc(1, |pdc| assert_eq!(pdc.light, 32));
        let ppf = Arc::clone(&gfx.events[GfxEvent::Ppf as usize]);
        gfx.deinit();
        assert!(ppf.wait().is_err());
        soc.gpu.with_pdc(0, |pdc| {
            assert_eq!(pdc.fill, LCD_FILL_EN);
            assert_eq!(pdc.light, 0);
        });
        assert!(!soc.arm11_irq.is_registered(Irq::Ppf));
    }
}
