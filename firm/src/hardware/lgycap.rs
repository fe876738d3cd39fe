//! Legacy capture unit (LgyCap) of the top screen.
//!
//! Takes the frames the legacy core outputs, runs them through the
//! horizontal and vertical scalers, converts to A1BGR5 and hands them to the
//! DMA engine in blocks of 8 lines through a small FIFO:
//!
//! ```text
//!  legacy frame ──► H scaler ──► V scaler ──► A1BGR5 ──► swizzle ──► FIFO ──► DMA-330
//!   240x160 BGR555                                        (8x8 tiles)   │
//!                                                                       └─ DMA request (periph 14)
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, warn};

use super::{cdma::Dma330, tiling::morton_index};
use crate::{
    drivers::dma_program::LGYCAP_TOP_PERIPH,
    kernel::{Irq, IrqController},
};

pub const LEGACY_WIDTH: usize = 240;
pub const LEGACY_HEIGHT: usize = 160;

pub const LGYCAP_EN: u32 = 1 << 0;
pub const LGYCAP_VSCALE_EN: u32 = 1 << 1;
pub const LGYCAP_HSCALE_EN: u32 = 1 << 2;
pub const LGYCAP_OUT_FMT_A1BGR5: u32 = 3 << 8;
pub const LGYCAP_OUT_SWIZZLE: u32 = 1 << 12;
pub const LGYCAP_DMA_EN: u32 = 1 << 15;

pub const LGYCAP_IRQ_DMA_REQ: u32 = 1 << 0;
pub const LGYCAP_IRQ_BUF_ERR: u32 = 1 << 1;
pub const LGYCAP_IRQ_VBLANK: u32 = 1 << 2;
pub const LGYCAP_IRQ_MASK: u32 = LGYCAP_IRQ_VBLANK | LGYCAP_IRQ_BUF_ERR | LGYCAP_IRQ_DMA_REQ;

/// FIFO capacity in 8 line blocks.
const FIFO_BLOCKS: usize = 2;

/// Maximum channel value after scaling, in the scaler's fixed point.
const CHANNEL_MAX: i32 = 255 * 0x4000;

#[must_use]
pub const fn lgycap_size(width: u32, height: u32) -> u32 {
    (height - 1) << 16 | (width - 1)
}

/// Register block of one scaler direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalerRegs {
    /// Pattern length minus 1.
    pub len: u32,
    pub patt: u32,
    /// `matrix[tap][pattern position]`, bits 0..=3 ignored.
    pub matrix: [[u32; 8]; 6],
}

impl ScalerRegs {
    fn coefficients(&self) -> [[i32; 8]; 6] {
        let mut out = [[0; 8]; 6];
        for (dst, src) in out.iter_mut().zip(&self.matrix) {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = i32::from((s as u16 as i16) & !0xF);
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LgyCapRegs {
    pub cnt: u32,
    pub size: u32,
    pub stat: u32,
    pub irq: u32,
    pub alpha: u32,
    pub v: ScalerRegs,
    pub h: ScalerRegs,
}

impl LgyCapRegs {
    fn out_dims(&self) -> (usize, usize) {
        (
            (self.size & 0x1FF) as usize + 1,
            (self.size >> 16 & 0x1FF) as usize + 1,
        )
    }
}

type Rgb = [i32; 3];

/// One scaler pass over a line of `src`, producing `out_len` pixels.
///
/// The input window is 6 pixels wide and post-incremented: after an output
/// whose pattern bit is 1 it moves one pixel forward (three on the very
/// first move, the hardware preloads them). Reads before the start or past
/// the end repeat the edge pixel.
#[must_use]
pub fn scale_line(src: &[Rgb], out_len: usize, patt: u32, len: usize, matrix: &[[i32; 8]; 6]) -> Vec<Rgb> {
    let mut out = Vec::with_capacity(out_len);
    let last = src.len().saturating_sub(1) as isize;
    let mut pos: isize = 0;
    let mut patt_pos = 0_usize;

    for _ in 0..out_len {
        let mut acc = [0_i32; 3];
        for (tap, row) in matrix.iter().enumerate() {
            let idx = pos - (5 - tap as isize);
            let px = src[idx.clamp(0, last.max(0)) as usize];
            let coef = row[patt_pos];
            for (a, c) in acc.iter_mut().zip(px) {
                *a += c * coef;
            }
        }
        out.push(acc.map(|c| c.clamp(0, CHANNEL_MAX) / 0x4000));

        if patt >> patt_pos & 1 != 0 {
            pos = if pos == 0 { 3 } else { pos + 1 };
        }
        patt_pos += 1;
        if patt_pos >= len {
            patt_pos = 0;
        }
    }

    out
}

/// BGR555 as output by the legacy core: red in bits 0..=4.
const fn legacy_to_rgb(px: u16) -> Rgb {
    [
        ((px & 31) << 3) as i32,
        ((px >> 5 & 31) << 3) as i32,
        ((px >> 10 & 31) << 3) as i32,
    ]
}

const fn rgb_to_a1bgr5(c: Rgb) -> u16 {
    ((c[0] as u16 >> 3) << 11) | ((c[1] as u16 >> 3) << 6) | ((c[2] as u16 >> 3) << 1) | 1
}

pub struct LgyCap {
    regs: Mutex<LgyCapRegs>,
    fifo: Mutex<VecDeque<u8>>,
    dma: Arc<Dma330>,
    irq: Arc<IrqController>,
    frames: AtomicU64,
    /// Bumped by every FIFO flush. A frame that spans one is dropped.
    flushes: AtomicU64,
}

impl LgyCap {
    #[must_use]
    pub fn new(dma: Arc<Dma330>, irq: Arc<IrqController>) -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(LgyCapRegs::default()),
            fifo: Mutex::new(VecDeque::new()),
            dma,
            irq,
            frames: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    /// Register access. Never held while calling into the DMA engine.
    pub fn regs(&self) -> MutexGuard<'_, LgyCapRegs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fifo(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.fifo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames captured since power on.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Writing 1 bits acknowledges status bits.
    pub fn ack_stat(&self, bits: u32) {
        self.regs().stat &= !bits;
    }

    /// DMA side of the FIFO. Reads past the queued data return zeros.
    pub fn pop_fifo(&self, buf: &mut [u8]) {
        let mut fifo = self.fifo();
        let n = buf.len().min(fifo.len());
        for (dst, src) in buf.iter_mut().zip(fifo.drain(..n)) {
            *dst = src;
        }
        buf[n..].fill(0);
    }

    /// Runs one legacy frame (`240*160` BGR555 pixels) through the unit.
    pub fn push_frame(&self, frame: &[u16]) {
        let epoch = self.flushes.load(Ordering::Acquire);
        let regs = *self.regs();
        if regs.cnt & LGYCAP_EN == 0 || frame.len() < LEGACY_WIDTH * LEGACY_HEIGHT {
            return;
        }

        let (out_w, out_h) = regs.out_dims();
        let pixels = Self::scale_frame(&regs, frame, out_w, out_h);
        let swizzle = regs.cnt & LGYCAP_OUT_SWIZZLE != 0;

        for block in 0..out_h / 8 {
            let bytes = Self::block_bytes(&pixels, out_w, block, swizzle);
            let overflow = {
                let mut fifo = self.fifo();
                if self.flushes.load(Ordering::Acquire) != epoch {
                    debug!("LgyCap: stopped mid frame, rest of the frame dropped");
                    return;
                }
                if fifo.len() >= FIFO_BLOCKS * bytes.len() {
                    true
                } else {
                    fifo.extend(bytes);
                    false
                }
            };

            if overflow {
                self.signal(LGYCAP_IRQ_BUF_ERR);
                warn!("LgyCap: FIFO overflow, dropping block {block}");
                continue;
            }

            self.regs().stat |= LGYCAP_IRQ_DMA_REQ;
            if regs.cnt & LGYCAP_DMA_EN != 0 {
                self.dma.peripheral_request(LGYCAP_TOP_PERIPH);
            }
            if regs.irq & LGYCAP_IRQ_DMA_REQ != 0 {
                self.irq.raise(Irq::LgyCapTop);
            }
        }

        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("LgyCap: frame {n} captured ({out_w}x{out_h})");
        self.signal(LGYCAP_IRQ_VBLANK);
    }

    fn signal(&self, bit: u32) {
        let enabled = {
            let mut regs = self.regs();
            regs.stat |= bit;
            regs.irq & bit != 0
        };
        if enabled {
            self.irq.raise(Irq::LgyCapTop);
        }
    }

    /// Drops whatever is still queued, used after the DMA channel was killed.
    pub fn flush_fifo(&self) {
        let mut fifo = self.fifo();
        fifo.clear();
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn scale_frame(regs: &LgyCapRegs, frame: &[u16], out_w: usize, out_h: usize) -> Vec<Rgb> {
        let src: Vec<Rgb> = frame[..LEGACY_WIDTH * LEGACY_HEIGHT]
            .iter()
            .map(|&px| legacy_to_rgb(px))
            .collect();

        // Horizontal pass.
        let mut hpass = Vec::with_capacity(out_w * LEGACY_HEIGHT);
        if regs.cnt & LGYCAP_HSCALE_EN != 0 {
            let m = regs.h.coefficients();
            let len = regs.h.len as usize + 1;
            for line in src.chunks_exact(LEGACY_WIDTH) {
                hpass.extend(scale_line(line, out_w, regs.h.patt, len, &m));
            }
        } else {
            for line in src.chunks_exact(LEGACY_WIDTH) {
                hpass.extend((0..out_w).map(|x| line[x.min(LEGACY_WIDTH - 1)]));
            }
        }

        // Vertical pass, column by column.
        let mut out = vec![[0; 3]; out_w * out_h];
        let mut column = Vec::with_capacity(LEGACY_HEIGHT);
        for x in 0..out_w {
            column.clear();
            column.extend((0..LEGACY_HEIGHT).map(|y| hpass[y * out_w + x]));
            let scaled = if regs.cnt & LGYCAP_VSCALE_EN != 0 {
                let m = regs.v.coefficients();
                scale_line(&column, out_h, regs.v.patt, regs.v.len as usize + 1, &m)
            } else {
                (0..out_h).map(|y| column[y.min(LEGACY_HEIGHT - 1)]).collect()
            };
            for (y, px) in scaled.into_iter().enumerate() {
                out[y * out_w + x] = px;
            }
        }

        out
    }

    fn block_bytes(pixels: &[Rgb], width: usize, block: usize, swizzle: bool) -> Vec<u8> {
        let mut bytes = vec![0; width * 8 * 2];
        for y in 0..8 {
            for x in 0..width {
                let px = rgb_to_a1bgr5(pixels[(block * 8 + y) * width + x]);
                let idx = if swizzle {
                    (x / 8) * 64 + morton_index(x % 8, y)
                } else {
                    y * width + x
                };
                bytes[idx * 2..idx * 2 + 2].copy_from_slice(&px.to_le_bytes());
            }
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn identity() -> [[i32; 8]; 6] {
        let mut m = [[0; 8]; 6];
        m[3] = [0x4000; 8];
        m
    }

    #[test]
    fn identity_line_is_unchanged() {
        let src: Vec<Rgb> = (0..240).map(|i| [i % 256, 0, 255 - i % 256]).collect();
        let out = scale_line(&src, 240, 0b0011_1111, 6, &identity());
        assert_eq!(out, src);
    }

    #[test]
    fn pattern_zero_repeats_pixel() {
        let src: Vec<Rgb> = (0..8).map(|i| [i * 10, 0, 0]).collect();
        // Advance, advance, hold: every third output repeats.
        let out = scale_line(&src, 6, 0b011, 3, &identity());
        let reds: Vec<i32> = out.iter().map(|p| p[0]).collect();
        assert_eq!(reds, vec![0, 10, 20, 20, 30, 40]);
    }

    #[test]
    fn clamps_out_of_range_sums() {
        let mut m = identity();
        m[2] = [0x4000; 8];
        let src = vec![[255, 0, 0]; 4];
        let out = scale_line(&src, 4, 0b1, 1, &m);
        assert!(out.iter().all(|p| p[0] == 255));

        m[2] = [-0x8000; 8];
        let out = scale_line(&src, 4, 0b1, 1, &m);
        assert!(out.iter().all(|p| p[0] == 0));
    }

    #[test]
    fn a1bgr5_packing() {
        assert_eq!(rgb_to_a1bgr5(legacy_to_rgb(0x001F)), 0xF801);
        assert_eq!(rgb_to_a1bgr5(legacy_to_rgb(0x03E0)), 0x07C1);
        assert_eq!(rgb_to_a1bgr5(legacy_to_rgb(0x7C00)), 0x003F);
    }

    #[test]
    fn low_coefficient_bits_are_ignored() {
        let mut regs = ScalerRegs::default();
        regs.matrix[3][0] = 0x4000 + 8;
        regs.matrix[2][0] = (-0x4B0_i32 + 8) as u32 & 0xFFFF;
        let m = regs.coefficients();
        assert_eq!(m[3][0], 0x4000);
        assert_eq!(m[2][0], -0x4B0);
    }
}
