//! GPU blocks of the ARM11 side.
//!
//! | block | job                                   | IRQ        |
//! |-------|---------------------------------------|------------|
//! | PSC0/1| memory fill                           | Psc0/Psc1  |
//! | PPF   | display transfer and texture copy     | Ppf        |
//! | PDC0/1| LCD scan-out of the top/bottom screen | Pdc0/Pdc1  |
//! | P3D   | command list processing and drawing   | P3d        |
//!
//! Every job runs to completion when it is started and then raises its IRQ,
//! so the caller still has to wait for the IRQ before using the result.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use tracing::{debug, warn};

use super::{mem::PhysMem, tiling::tiled_index};
use crate::{
    bitwise::Bits,
    error::{Error, Result},
    kernel::{Irq, IrqController},
};

/// Pixel formats shared by the PPF, the PDC and the P3D color buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8 = 0,
    Bgr8 = 1,
    Rgb565 = 2,
    A1Bgr5 = 3,
    Rgba4 = 4,
}

#[must_use]
pub const fn five2eight(x: u8) -> u8 {
    x << 3 | x >> 2
}

const fn six2eight(x: u8) -> u8 {
    x << 2 | x >> 4
}

const fn four2eight(x: u8) -> u8 {
    x << 4 | x
}

impl PixelFormat {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Rgba8),
            1 => Some(Self::Bgr8),
            2 => Some(Self::Rgb565),
            3 => Some(Self::A1Bgr5),
            4 => Some(Self::Rgba4),
            _ => None,
        }
    }

    /// Texture format ids of the P3D texture units.
    #[must_use]
    pub const fn from_texture_type(ty: u32) -> Option<Self> {
        match ty {
            0 => Some(Self::Rgba8),
            1 => Some(Self::Bgr8),
            2 => Some(Self::A1Bgr5),
            3 => Some(Self::Rgb565),
            4 => Some(Self::Rgba4),
            _ => None,
        }
    }

    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Bgr8 => 3,
            Self::Rgb565 | Self::A1Bgr5 | Self::Rgba4 => 2,
        }
    }

    /// Decodes one pixel to `[r, g, b, a]`.
    #[must_use]
    pub fn decode(self, px: &[u8]) -> [u8; 4] {
        match self {
            Self::Rgba8 => [px[3], px[2], px[1], px[0]],
            Self::Bgr8 => [px[2], px[1], px[0], 0xFF],
            Self::Rgb565 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                [
                    five2eight((v >> 11) as u8),
                    six2eight((v >> 5 & 63) as u8),
                    five2eight((v & 31) as u8),
                    0xFF,
                ]
            }
            Self::A1Bgr5 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                [
                    five2eight((v >> 11) as u8),
                    five2eight((v >> 6 & 31) as u8),
                    five2eight((v >> 1 & 31) as u8),
                    if v & 1 != 0 { 0xFF } else { 0 },
                ]
            }
            Self::Rgba4 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                [
                    four2eight((v >> 12) as u8),
                    four2eight((v >> 8 & 15) as u8),
                    four2eight((v >> 4 & 15) as u8),
                    four2eight((v & 15) as u8),
                ]
            }
        }
    }

    /// Encodes `[r, g, b, a]` into `out`.
    pub fn encode(self, c: [u8; 4], out: &mut [u8]) {
        let [r, g, b, a] = c;
        match self {
            Self::Rgba8 => out[..4].copy_from_slice(&[a, b, g, r]),
            Self::Bgr8 => out[..3].copy_from_slice(&[b, g, r]),
            Self::Rgb565 => {
                let v = u16::from(r >> 3) << 11 | u16::from(g >> 2) << 5 | u16::from(b >> 3);
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::A1Bgr5 => {
                let v = u16::from(r >> 3) << 11
                    | u16::from(g >> 3) << 6
                    | u16::from(b >> 3) << 1
                    | u16::from(a >> 7);
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::Rgba4 => {
                let v = u16::from(r >> 4) << 12
                    | u16::from(g >> 4) << 8
                    | u16::from(b >> 4) << 4
                    | u16::from(a >> 4);
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}

// PSC
pub const PSC_START: u32 = 1 << 0;
pub const PSC_DONE: u32 = 1 << 1;
pub const PSC_FILL_16_BITS: u32 = 0 << 8;
pub const PSC_FILL_24_BITS: u32 = 1 << 8;
pub const PSC_FILL_32_BITS: u32 = 2 << 8;

// PPF
pub const PPF_FLIP_VERTICAL: u32 = 1 << 0;
pub const PPF_OUT_TILED: u32 = 1 << 1;
pub const PPF_CROP_EN: u32 = 1 << 2;
pub const PPF_TEXCOPY: u32 = 1 << 3;
pub const PPF_EN: u32 = 1 << 0;

#[must_use]
pub const fn ppf_dim(width: u32, height: u32) -> u32 {
    height << 16 | width
}

#[must_use]
pub const fn ppf_i_fmt(fmt: PixelFormat) -> u32 {
    (fmt as u32) << 8
}

#[must_use]
pub const fn ppf_o_fmt(fmt: PixelFormat) -> u32 {
    (fmt as u32) << 12
}

/// Hardware completion the GPU model recorded, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuTraceEvent {
    FillDone { psc: u8 },
    TransferDone { dst: u32 },
    ListDone,
    Swap { screen: u8, buffer: u8 },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PscRegs {
    pub start: u32,
    pub end: u32,
    pub value: u32,
    pub cnt: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PpfRegs {
    pub in_addr: u32,
    pub out_addr: u32,
    pub dim_out: u32,
    pub dim_in: u32,
    pub flags: u32,
    pub cnt: u32,
    /// Texture copy size in bytes.
    pub len: u32,
    /// Texture copy input line width and gap, 16 byte units: `gap << 16 | width`.
    pub tc_in: u32,
    pub tc_out: u32,
}

pub const LCD_COLOR_LUT_SIZE: usize = 256;
pub const LCD_FILL_EN: u32 = 1 << 24;

#[derive(Clone, Debug)]
pub struct PdcRegs {
    /// Left eye framebuffer addresses, one per buffer index.
    pub fb_a: [u32; 2],
    pub fmt: u32,
    pub stride: u32,
    /// Buffer index being scanned out.
    pub swap: u32,
    pub vtotal: u32,
    pub color_lut: [u32; LCD_COLOR_LUT_SIZE],
    color_lut_idx: usize,
    /// LCD fill register, `LCD_FILL_EN | color` replaces the scan-out.
    pub fill: u32,
    /// Backlight level.
    pub light: u8,
}

impl Default for PdcRegs {
    fn default() -> Self {
        Self {
            fb_a: [0; 2],
            fmt: 0,
            stride: 0,
            swap: 0,
            vtotal: 414,
            color_lut: [0; LCD_COLOR_LUT_SIZE],
            color_lut_idx: 0,
            fill: LCD_FILL_EN,
            light: 0,
        }
    }
}

impl PdcRegs {
    pub fn set_color_lut_addr(&mut self, idx: u32) {
        self.color_lut_idx = idx as usize % LCD_COLOR_LUT_SIZE;
    }

    /// Auto-incrementing LUT write port.
    pub fn write_color_lut_data(&mut self, value: u32) {
        self.color_lut[self.color_lut_idx] = value & 0x00FF_FFFF;
        self.color_lut_idx = (self.color_lut_idx + 1) % LCD_COLOR_LUT_SIZE;
    }
}

/// P3D register ids understood by the model.
pub mod p3d_reg {
    pub const FINALIZE: u16 = 0x010;
    pub const VIEWPORT_WIDTH: u16 = 0x041;
    pub const VIEWPORT_HEIGHT: u16 = 0x043;
    pub const VIEWPORT_XY: u16 = 0x068;
    pub const TEXUNIT0_CONFIG: u16 = 0x080;
    pub const TEXUNIT0_DIM: u16 = 0x082;
    pub const TEXUNIT0_PARAM: u16 = 0x083;
    pub const TEXUNIT0_ADDR: u16 = 0x085;
    pub const TEXUNIT0_TYPE: u16 = 0x08E;
    pub const FRAMEBUFFER_FLUSH: u16 = 0x111;
    pub const COLORBUFFER_FORMAT: u16 = 0x117;
    pub const COLORBUFFER_LOC: u16 = 0x11D;
    pub const FRAMEBUFFER_DIM: u16 = 0x11E;
    pub const DRAW_ARRAYS: u16 = 0x22E;
    /// Texture rectangle mapped onto the viewport, `height << 16 | width`.
    pub const TEXCOORD_RECT: u16 = 0x2F0;

    pub const TEXUNIT_MAG_LINEAR: u32 = 1 << 1;
    pub const TEXUNIT_CONFIG_CLEAR_CACHE: u32 = 1 << 16;
}

const P3D_REGS: usize = 0x300;

struct P3dState {
    regs: Box<[u32; P3D_REGS]>,
}

impl Default for P3dState {
    fn default() -> Self {
        Self {
            regs: Box::new([0; P3D_REGS]),
        }
    }
}

struct GpuRegs {
    psc: [PscRegs; 2],
    ppf: PpfRegs,
    pdc: [PdcRegs; 2],
    p3d: P3dState,
    trace: Option<VecDeque<GpuTraceEvent>>,
}

pub struct Gpu {
    regs: Mutex<GpuRegs>,
    mem: Arc<PhysMem>,
    irq: Arc<IrqController>,
    powered_on: Instant,
}

/// Top LCD refresh: 59.83 Hz with 414 lines per frame.
const LINE_NANOS: u128 = 40_373;

impl Gpu {
    #[must_use]
    pub fn new(mem: Arc<PhysMem>, irq: Arc<IrqController>) -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(GpuRegs {
                psc: [PscRegs::default(); 2],
                ppf: PpfRegs::default(),
                pdc: [PdcRegs::default(), PdcRegs::default()],
                p3d: P3dState::default(),
                trace: None,
            }),
            mem,
            irq,
            powered_on: Instant::now(),
        })
    }

    fn regs(&self) -> MutexGuard<'_, GpuRegs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(regs: &mut GpuRegs, ev: GpuTraceEvent) {
        if let Some(trace) = regs.trace.as_mut() {
            trace.push_back(ev);
        }
    }

    /// Starts recording hardware completions and buffer swaps.
    pub fn start_trace(&self) {
        self.regs().trace = Some(VecDeque::new());
    }

    /// Everything recorded since the last call.
    #[must_use]
    pub fn take_trace(&self) -> Vec<GpuTraceEvent> {
        self.regs()
            .trace
            .as_mut()
            .map(|t| t.drain(..).collect())
            .unwrap_or_default()
    }

    // ---- PSC ----

    pub fn set_psc(&self, idx: usize, start: u32, end: u32, value: u32) {
        let mut regs = self.regs();
        let psc = &mut regs.psc[idx & 1];
        psc.start = start;
        psc.end = end;
        psc.value = value;
    }

    #[must_use]
    pub fn psc_cnt(&self, idx: usize) -> u32 {
        self.regs().psc[idx & 1].cnt
    }

    /// Writing `PSC_START` runs the fill.
    ///
    /// # Errors
    /// If the fill range is not mapped.
    pub fn set_psc_cnt(&self, idx: usize, cnt: u32) -> Result<()> {
        let idx = idx & 1;
        let psc = {
            let mut regs = self.regs();
            regs.psc[idx].cnt = cnt & !PSC_DONE;
            regs.psc[idx]
        };
        if cnt & PSC_START == 0 {
            return Ok(());
        }

        let len = psc.end.saturating_sub(psc.start) as usize;
        let pattern: Vec<u8> = match cnt >> 8 & 3 {
            0 => psc.value.to_le_bytes()[..2].to_vec(),
            1 => psc.value.to_le_bytes()[..3].to_vec(),
            _ => psc.value.to_le_bytes().to_vec(),
        };
        self.mem.with_slice_mut(psc.start, len, |dst| {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = pattern[i % pattern.len()];
            }
        })?;

        {
            let mut regs = self.regs();
            regs.psc[idx].cnt = (cnt & !PSC_START) | PSC_DONE;
            Self::record(&mut regs, GpuTraceEvent::FillDone { psc: idx as u8 });
        }
        self.irq.raise(if idx == 0 { Irq::Psc0 } else { Irq::Psc1 });
        Ok(())
    }

    // ---- PPF ----

    pub fn set_ppf(&self, ppf: PpfRegs) {
        self.regs().ppf = PpfRegs { cnt: 0, ..ppf };
    }

    #[must_use]
    pub fn ppf(&self) -> PpfRegs {
        self.regs().ppf
    }

    /// Writing `PPF_EN` starts the transfer.
    ///
    /// # Errors
    /// On unmapped ranges or invalid formats/dimensions.
    pub fn set_ppf_cnt(&self, cnt: u32) -> Result<()> {
        let ppf = {
            let mut regs = self.regs();
            regs.ppf.cnt = cnt;
            regs.ppf
        };
        if cnt & PPF_EN == 0 {
            return Ok(());
        }

        if ppf.flags & PPF_TEXCOPY != 0 {
            self.texture_copy(&ppf)?;
        } else {
            self.display_transfer(&ppf)?;
        }

        {
            let mut regs = self.regs();
            regs.ppf.cnt = 0;
            Self::record(&mut regs, GpuTraceEvent::TransferDone { dst: ppf.out_addr });
        }
        self.irq.raise(Irq::Ppf);
        Ok(())
    }

    fn display_transfer(&self, ppf: &PpfRegs) -> Result<()> {
        let in_fmt = PixelFormat::from_bits(ppf.flags.get_bits(8..=10))
            .ok_or(Error::InvalidArg("PPF input format"))?;
        let out_fmt = PixelFormat::from_bits(ppf.flags.get_bits(12..=14))
            .ok_or(Error::InvalidArg("PPF output format"))?;
        let (in_w, in_h) = ((ppf.dim_in & 0xFFFF) as usize, (ppf.dim_in >> 16) as usize);
        let (mut out_w, mut out_h) = ((ppf.dim_out & 0xFFFF) as usize, (ppf.dim_out >> 16) as usize);
        if in_w % 8 != 0 || in_h % 8 != 0 || in_w == 0 || in_h == 0 {
            return Err(Error::InvalidArg("PPF dimensions must be multiples of 8"));
        }
        if ppf.flags & PPF_CROP_EN == 0 {
            out_w = in_w;
            out_h = in_h;
        }
        let (sx, sy) = match ppf.flags.get_bits(24..=25) {
            0 => (1, 1),
            1 => (2, 1),
            _ => (2, 2),
        };
        out_w = out_w.min(in_w) / sx;
        out_h = out_h.min(in_h) / sy;

        let out_tiled = ppf.flags & PPF_OUT_TILED != 0;
        let flip = ppf.flags & PPF_FLIP_VERTICAL != 0;
        let in_bpp = in_fmt.bytes_per_pixel();
        let out_bpp = out_fmt.bytes_per_pixel();

        let src = self.mem.read_vec(ppf.in_addr, in_w * in_h * in_bpp)?;
        let fetch = |x: usize, y: usize| -> [u8; 4] {
            // Without OUT_TILED the input is tiled, with it the input is linear.
            let idx = if out_tiled { y * in_w + x } else { tiled_index(x, y, in_w) };
            in_fmt.decode(&src[idx * in_bpp..idx * in_bpp + in_bpp])
        };

        let mut dst = vec![0; out_w * out_h * out_bpp];
        for y in 0..out_h {
            for x in 0..out_w {
                let mut acc = [0_u32; 4];
                for dy in 0..sy {
                    for dx in 0..sx {
                        let c = fetch(x * sx + dx, y * sy + dy);
                        for (a, v) in acc.iter_mut().zip(c) {
                            *a += u32::from(v);
                        }
                    }
                }
                let n = (sx * sy) as u32;
                let c = acc.map(|a| ((a + n / 2) / n) as u8);

                let oy = if flip { out_h - 1 - y } else { y };
                let idx = if out_tiled { tiled_index(x, oy, out_w) } else { oy * out_w + x };
                out_fmt.encode(c, &mut dst[idx * out_bpp..idx * out_bpp + out_bpp]);
            }
        }

        self.mem.write(ppf.out_addr, &dst)?;
        debug!(
            "PPF: 0x{:08X} {in_w}x{in_h} {in_fmt:?} -> 0x{:08X} {out_w}x{out_h} {out_fmt:?}",
            ppf.in_addr, ppf.out_addr
        );
        Ok(())
    }

    fn texture_copy(&self, ppf: &PpfRegs) -> Result<()> {
        let line = |tc: u32| -> (usize, usize) {
            let width = (tc & 0xFFFF) as usize * 16;
            let gap = (tc >> 16) as usize * 16;
            // A zero width means one contiguous copy.
            if width == 0 { (ppf.len as usize, 0) } else { (width, gap) }
        };
        let (in_w, in_gap) = line(ppf.tc_in);
        let (out_w, out_gap) = line(ppf.tc_out);
        let total = ppf.len as usize;
        if in_w == 0 || out_w == 0 {
            return Ok(());
        }

        let mut data = Vec::with_capacity(total);
        let mut addr = ppf.in_addr;
        while data.len() < total {
            let n = in_w.min(total - data.len());
            data.extend(self.mem.read_vec(addr, n)?);
            addr += (n + in_gap) as u32;
        }

        let mut addr = ppf.out_addr;
        for chunk in data.chunks(out_w) {
            self.mem.write(addr, chunk)?;
            addr += (chunk.len() + out_gap) as u32;
        }
        Ok(())
    }

    // ---- PDC ----

    /// Register access for display setup.
    pub fn with_pdc<R>(&self, screen: usize, f: impl FnOnce(&mut PdcRegs) -> R) -> R {
        f(&mut self.regs().pdc[screen & 1])
    }

    /// Selects the buffer index scanned out from the next frame on.
    pub fn set_pdc_swap(&self, screen: usize, swap: u32) {
        let mut regs = self.regs();
        regs.pdc[screen & 1].swap = swap & 1;
        Self::record(
            &mut regs,
            GpuTraceEvent::Swap {
                screen: (screen & 1) as u8,
                buffer: (swap & 1) as u8,
            },
        );
    }

    /// Address of the framebuffer being scanned out.
    #[must_use]
    pub fn displayed_framebuffer(&self, screen: usize) -> u32 {
        let regs = self.regs();
        let pdc = &regs.pdc[screen & 1];
        pdc.fb_a[pdc.swap as usize & 1]
    }

    /// Line currently scanned out.
    #[must_use]
    pub fn pdc_vpos(&self, screen: usize) -> u32 {
        let vtotal = u128::from(self.regs().pdc[screen & 1].vtotal.max(1)) + 1;
        let line = self.powered_on.elapsed().as_nanos() / LINE_NANOS;
        (line % vtotal) as u32
    }

    pub fn set_pdc_vtotal(&self, screen: usize, vtotal: u32) {
        self.regs().pdc[screen & 1].vtotal = vtotal;
    }

    #[must_use]
    pub fn pdc_vtotal(&self, screen: usize) -> u32 {
        self.regs().pdc[screen & 1].vtotal
    }

    // ---- P3D ----

    #[must_use]
    pub fn p3d_reg(&self, id: u16) -> u32 {
        self.regs().p3d.regs.get(usize::from(id)).copied().unwrap_or(0)
    }

    /// Processes the command list at `addr`, `size` bytes long.
    ///
    /// Lists are `[parameter, header]` pairs where the header holds the
    /// register id (bits 0..=15), a byte write mask (16..=19), the number of
    /// extra parameters (20..=27) and the consecutive-registers flag (31).
    ///
    /// # Errors
    /// If the list or a surface it references is not mapped.
    pub fn run_command_list(&self, addr: u32, size: usize) -> Result<()> {
        let words: Vec<u32> = self
            .mem
            .read_vec(addr, size)?
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut i = 0;
        let mut finished = false;
        while i + 1 < words.len() {
            let first = words[i];
            let header = words[i + 1];
            let id = (header & 0xFFFF) as u16;
            let mask = header.get_bits(16..=19);
            let extra = header.get_bits(20..=27) as usize;
            let consecutive = header.is_bit_on(31);
            i += 2;

            let mut params = Vec::with_capacity(extra + 1);
            params.push(first);
            params.extend(words.iter().skip(i).take(extra));
            i += extra;
            // Commands are padded to 8 bytes.
            if extra % 2 == 1 {
                i += 1;
            }

            for (n, &value) in params.iter().enumerate() {
                let reg = if consecutive { id + n as u16 } else { id };
                finished |= self.write_p3d_reg(reg, value, mask)?;
            }
        }

        if finished {
            Self::record(&mut self.regs(), GpuTraceEvent::ListDone);
            self.irq.raise(Irq::P3d);
        } else {
            warn!("P3D: command list without FINALIZE");
        }
        Ok(())
    }

    /// Returns `true` on the end-of-list register.
    fn write_p3d_reg(&self, id: u16, value: u32, mask: u32) -> Result<bool> {
        {
            let mut regs = self.regs();
            let Some(reg) = regs.p3d.regs.get_mut(usize::from(id)) else {
                return Ok(false);
            };
            let mut bytes = reg.to_le_bytes();
            for (i, (b, v)) in bytes.iter_mut().zip(value.to_le_bytes()).enumerate() {
                if mask >> i & 1 != 0 {
                    *b = v;
                }
            }
            *reg = u32::from_le_bytes(bytes);
        }

        match id {
            p3d_reg::DRAW_ARRAYS => self.draw()?,
            p3d_reg::FINALIZE => return Ok(true),
            _ => {}
        }
        Ok(false)
    }

    /// Draws the textured quad: texture rectangle stretched over the
    /// viewport of the color buffer. The viewport is given in landscape
    /// coordinates of the top screen, the color buffer is stored in its
    /// portrait (rotated) orientation.
    fn draw(&self) -> Result<()> {
        let r = self.regs().p3d.regs.clone();
        let reg = |id: u16| r[usize::from(id)];

        let tex_addr = reg(p3d_reg::TEXUNIT0_ADDR) << 3;
        let tex_w = (reg(p3d_reg::TEXUNIT0_DIM) >> 16) as usize;
        let tex_h = (reg(p3d_reg::TEXUNIT0_DIM) & 0x7FF) as usize;
        let tex_fmt = PixelFormat::from_texture_type(reg(p3d_reg::TEXUNIT0_TYPE))
            .ok_or(Error::InvalidArg("P3D texture type"))?;
        let linear = reg(p3d_reg::TEXUNIT0_PARAM) & p3d_reg::TEXUNIT_MAG_LINEAR != 0;

        let cb_addr = reg(p3d_reg::COLORBUFFER_LOC) << 3;
        let cb_dim = reg(p3d_reg::FRAMEBUFFER_DIM);
        let cb_w = (cb_dim & 0x7FF) as usize;
        let cb_h = (cb_dim >> 12 & 0x3FF) as usize + 1;
        let cb_fmt = PixelFormat::from_bits(reg(p3d_reg::COLORBUFFER_FORMAT))
            .ok_or(Error::InvalidArg("P3D color buffer format"))?;

        let (vx, vy) = (
            (reg(p3d_reg::VIEWPORT_XY) & 0x3FF) as usize,
            (reg(p3d_reg::VIEWPORT_XY) >> 16 & 0x3FF) as usize,
        );
        let (vw, vh) = (
            reg(p3d_reg::VIEWPORT_WIDTH) as usize,
            reg(p3d_reg::VIEWPORT_HEIGHT) as usize,
        );
        let rect = reg(p3d_reg::TEXCOORD_RECT);
        let (src_w, src_h) = ((rect & 0xFFFF) as usize, (rect >> 16) as usize);
        // Landscape width is the portrait height and the other way around.
        let empty = tex_w == 0 || tex_h == 0 || src_w == 0 || src_h == 0 || vw == 0 || vh == 0;
        if empty || vx + vw > cb_h || vy + vh > cb_w {
            return Err(Error::InvalidArg("P3D draw state"));
        }

        let tex_bpp = tex_fmt.bytes_per_pixel();
        let tex = self.mem.read_vec(tex_addr, tex_w * tex_h * tex_bpp)?;
        let texel = |x: usize, y: usize| -> [f32; 4] {
            let idx = tiled_index(x.min(src_w - 1), y.min(src_h - 1), tex_w) * tex_bpp;
            tex_fmt.decode(&tex[idx..idx + tex_bpp]).map(f32::from)
        };

        let cb_bpp = cb_fmt.bytes_per_pixel();
        let cb_len = cb_w * cb_h * cb_bpp;
        let scale_x = src_w as f32 / vw as f32;
        let scale_y = src_h as f32 / vh as f32;

        self.mem.with_slice_mut(cb_addr, cb_len, |cb| {
            for y in 0..vh {
                for x in 0..vw {
                    let u = (x as f32 + 0.5).mul_add(scale_x, -0.5).max(0.0);
                    let v = (y as f32 + 0.5).mul_add(scale_y, -0.5).max(0.0);
                    let c = if linear {
                        let (x0, y0) = (u.floor() as usize, v.floor() as usize);
                        let (fx, fy) = (u.fract(), v.fract());
                        let (a, b) = (texel(x0, y0), texel(x0 + 1, y0));
                        let (c, d) = (texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));
                        let mut out = [0.0; 4];
                        for i in 0..4 {
                            let top = (b[i] - a[i]).mul_add(fx, a[i]);
                            let bottom = (d[i] - c[i]).mul_add(fx, c[i]);
                            out[i] = (bottom - top).mul_add(fy, top);
                        }
                        out
                    } else {
                        texel(u.round() as usize, v.round() as usize)
                    };
                    let c = c.map(|v| v.round().clamp(0.0, 255.0) as u8);

                    let (lx, ly) = (vx + x, vy + y);
                    let idx = tiled_index(cb_w - 1 - ly, lx, cb_w) * cb_bpp;
                    cb_fmt.encode(c, &mut cb[idx..idx + cb_bpp]);
                }
            }
        })?;

        debug!("P3D: drew {src_w}x{src_h} from 0x{tex_addr:08X} into {vw}x{vh}+{vx}+{vy}");
        Ok(())
    }
}
