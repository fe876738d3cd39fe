//! Driver of the top screen legacy capture unit.
//!
//! The capture program on DMA channel 0 moves one frame from the LgyCap FIFO
//! into the capture texture and ends with `SEV 0`. The event ISR re-arms the
//! program for the next frame, nudges the LCD vertical total so scan-out
//! stays slightly ahead of the legacy video and signals `frame_ready`.
//! Re-arming and [`LgyCapDriver::stop`] are serialized so a frame finishing
//! while the unit is being stopped cannot restart the program behind it.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use super::{
    dma330::Dma330Driver,
    dma_program::CaptureProgram,
    scaler::{ScalerAxis, ScalerMatrix},
};
use crate::{
    error::Result,
    hardware::{
        gpu::Gpu,
        lgycap::{
            LEGACY_HEIGHT, LEGACY_WIDTH, LGYCAP_DMA_EN, LGYCAP_EN, LGYCAP_HSCALE_EN, LGYCAP_IRQ_MASK,
            LGYCAP_OUT_FMT_A1BGR5, LGYCAP_OUT_SWIZZLE, LGYCAP_VSCALE_EN, LgyCap, LgyCapRegs, ScalerRegs,
            lgycap_size,
        },
        shared::SharedRegion,
    },
    kernel::{Event, Irq, IrqController, IsrRegistration},
};

pub const CAPTURE_DMA_CH: u8 = 0;
/// `DMASEV` event the capture program ends with.
pub const CAPTURE_DMA_EVENT: u8 = 0;

/// Top LCD lines per frame.
const LCD_VTOTAL: u32 = 414;
/// Past this line the LCD is too close to the legacy output, slow it down.
const LCD_VPOS_LIMIT: u32 = LCD_VTOTAL - 41;

/// Register setup of one capture mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub cnt: u32,
    pub width: u32,
    pub height: u32,
    pub irq: u32,
    pub matrix: ScalerMatrix,
}

impl CaptureConfig {
    /// 240x160 for `scaler` 0 and 1, the hardware 1.5x scaler for 2.
    #[must_use]
    pub const fn for_scaler(scaler: u8, matrix: ScalerMatrix) -> Self {
        let scaled = scaler >= 2;
        Self {
            cnt: LGYCAP_OUT_SWIZZLE
                | LGYCAP_OUT_FMT_A1BGR5
                | if scaled { LGYCAP_HSCALE_EN | LGYCAP_VSCALE_EN } else { 0 },
            width: if scaled { 360 } else { LEGACY_WIDTH as u32 },
            height: if scaled { 240 } else { LEGACY_HEIGHT as u32 },
            irq: 0,
            matrix,
        }
    }

    /// Native resolution, scalers off.
    #[must_use]
    pub const fn unscaled(&self) -> Self {
        Self {
            cnt: self.cnt & !(LGYCAP_HSCALE_EN | LGYCAP_VSCALE_EN),
            width: LEGACY_WIDTH as u32,
            height: LEGACY_HEIGHT as u32,
            ..*self
        }
    }
}

fn scaler_regs(axis: &ScalerAxis) -> ScalerRegs {
    let mut regs = ScalerRegs {
        len: u32::from(axis.len.max(1)) - 1,
        patt: u32::from(axis.patt),
        matrix: [[0; 8]; 6],
    };
    for (dst, src) in regs.matrix.iter_mut().zip(&axis.matrix) {
        for (d, &s) in dst.iter_mut().zip(src).take(usize::from(axis.len)) {
            // + 8 rounds the truncated low bits up.
            *d = (i32::from(s) + 8) as u32;
        }
    }
    regs
}

pub struct LgyCapDriver {
    hw: Arc<LgyCap>,
    dma: Arc<Dma330Driver>,
    arm: Arc<Mutex<()>>,
    prog: SharedRegion,
    prog_addr: u32,
    cfg: CaptureConfig,
    frame_ready: Arc<Event>,
    _isr: IsrRegistration,
}

impl LgyCapDriver {
    /// Installs the capture program for `cfg` into `prog`, arms it on the
    /// capture channel, programs the unit and starts capturing.
    ///
    /// # Errors
    /// [`Error::DmaBusy`](crate::error::Error::DmaBusy) if a previous capture
    /// program still occupies the channel, memory errors for `prog` and
    /// [`Error::IrqInUse`](crate::error::Error::IrqInUse) if the DMA event
    /// already has a handler.
    pub fn init(
        hw: Arc<LgyCap>,
        dma: Arc<Dma330Driver>,
        gpu: Arc<Gpu>,
        irq: &Arc<IrqController>,
        prog: SharedRegion,
        cfg: CaptureConfig,
    ) -> Result<Self> {
        let prog_addr = CaptureProgram::for_capture(cfg.width, cfg.height).install(&prog)?;
        dma.run(CAPTURE_DMA_CH, prog_addr)?;

        Self::program_regs(&mut hw.regs(), &cfg);

        let frame_ready = Event::new();
        let arm = Arc::new(Mutex::new(()));
        let isr = {
            let hw = Arc::clone(&hw);
            let dma = Arc::clone(&dma);
            let arm = Arc::clone(&arm);
            let frame_ready = Arc::clone(&frame_ready);
            irq.register(Irq::CdmaEvent0, move |_| {
                dma.ack_irq(CAPTURE_DMA_EVENT);
                let _arm = arm.lock().unwrap_or_else(PoisonError::into_inner);
                // Stopped in the meantime, the frame is discarded.
                if hw.regs().cnt & LGYCAP_EN == 0 {
                    return;
                }
                if let Err(e) = dma.run(CAPTURE_DMA_CH, prog_addr) {
                    debug!("LgyCap: capture program not re-armed: {e}");
                }

                let vtotal = if gpu.pdc_vpos(0) > LCD_VPOS_LIMIT {
                    LCD_VTOTAL + 1
                } else {
                    LCD_VTOTAL
                };
                gpu.set_pdc_vtotal(0, vtotal);

                frame_ready.signal();
            })?
        };

        hw.regs().cnt |= LGYCAP_EN;
        info!("LgyCap: capturing {}x{}", cfg.width, cfg.height);

        Ok(Self {
            hw,
            dma,
            arm,
            prog,
            prog_addr,
            cfg,
            frame_ready,
            _isr: isr,
        })
    }

    fn program_regs(regs: &mut LgyCapRegs, cfg: &CaptureConfig) {
        regs.cnt = 0;
        regs.size = lgycap_size(cfg.width, cfg.height);
        regs.stat = 0;
        regs.irq = cfg.irq & LGYCAP_IRQ_MASK;
        regs.alpha = 0xFF;
        regs.v = scaler_regs(&cfg.matrix.v);
        regs.h = scaler_regs(&cfg.matrix.h);
        regs.cnt = cfg.cnt | LGYCAP_DMA_EN;
    }

    /// Signaled once per captured frame. Deleted by [`Self::deinit`].
    #[must_use]
    pub fn frame_ready(&self) -> Arc<Event> {
        Arc::clone(&self.frame_ready)
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.cfg
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.hw.regs().cnt & LGYCAP_EN != 0
    }

    /// Stops capturing. A partially transferred frame is discarded.
    pub fn stop(&self) {
        let _arm = self.arm.lock().unwrap_or_else(PoisonError::into_inner);
        self.hw.regs().cnt &= !LGYCAP_EN;
        self.dma.kill(CAPTURE_DMA_CH);
        self.hw.flush_fifo();
        self.hw.ack_stat(LGYCAP_IRQ_MASK);
        self.frame_ready.clear();
        debug!("LgyCap: stopped");
    }

    /// Re-arms the capture program and resumes capturing.
    ///
    /// # Errors
    /// [`Error::DmaBusy`](crate::error::Error::DmaBusy) if the capture
    /// channel was not stopped first.
    pub fn start(&self) -> Result<()> {
        self.dma.run(CAPTURE_DMA_CH, self.prog_addr)?;
        self.hw.regs().cnt |= LGYCAP_EN;
        debug!("LgyCap: started");
        Ok(())
    }

    /// Captures the next frame at 240x160 without scaling into the capture
    /// texture. The unit is left stopped in its regular configuration; call
    /// [`Self::start`] to resume.
    ///
    /// # Errors
    /// [`Error::EventDeleted`](crate::error::Error::EventDeleted) if the
    /// driver is shut down while waiting, errors of [`Self::start`].
    pub fn capture_frame_unscaled(&self) -> Result<()> {
        let cfg = self.cfg;
        self.stop();

        let unscaled = cfg.unscaled();
        CaptureProgram::for_capture(unscaled.width, unscaled.height).install(&self.prog)?;
        Self::program_regs(&mut self.hw.regs(), &unscaled);
        self.start()?;

        let waited = self.frame_ready.wait();
        self.stop();

        CaptureProgram::for_capture(cfg.width, cfg.height).install(&self.prog)?;
        Self::program_regs(&mut self.hw.regs(), &cfg);
        waited
    }

    /// Turns the unit off and wakes anything waiting for a frame with an
    /// error.
    pub fn deinit(self) {
        self.hw.regs().cnt = 0;
        self.dma.kill(CAPTURE_DMA_CH);
        self.hw.flush_fifo();
        self.frame_ready.delete();
        info!("LgyCap: off");
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        drivers::dma_program::CAPTURE_TEXTURE,
        hardware::{
            Soc,
            cdma::ChannelStatus,
            legacy::{LegacyVideo, Pattern, bgr555},
            mem::AXI_WRAM_BASE,
            tiling::tiled_index,
        },
    };

    const PROG_ADDR: u32 = AXI_WRAM_BASE + 0x1000;

    struct Rig {
        soc: Soc,
        dma: Arc<Dma330Driver>,
    }

    fn rig() -> Rig {
        let soc = Soc::new();
        let scratch = SharedRegion::new(Arc::clone(&soc.mem), AXI_WRAM_BASE, 16);
        let dma = Arc::new(Dma330Driver::init(Arc::clone(&soc.cdma), &scratch).unwrap());
        Rig { soc, dma }
    }

    fn capture(rig: &Rig, scaler: u8) -> LgyCapDriver {
        LgyCapDriver::init(
            Arc::clone(&rig.soc.lgycap),
            Arc::clone(&rig.dma),
            Arc::clone(&rig.soc.gpu),
            &rig.soc.arm11_irq,
            SharedRegion::new(Arc::clone(&rig.soc.mem), PROG_ADDR, 64),
            CaptureConfig::for_scaler(scaler, ScalerMatrix::default()),
        )
        .unwrap()
    }

    fn texel(rig: &Rig, x: usize, y: usize) -> u16 {
        let idx = tiled_index(x, y, 512) as u32;
        let b = rig.soc.mem.read_vec(CAPTURE_TEXTURE + idx * 2, 2).unwrap();
        u16::from_le_bytes([b[0], b[1]])
    }

    #[test]
    fn init_programs_the_unit() {
        let rig = rig();
        let cap = capture(&rig, 2);
        let regs = *rig.soc.lgycap.regs();
        assert_eq!(regs.size, lgycap_size(360, 240));
        assert_eq!(regs.cnt & (LGYCAP_HSCALE_EN | LGYCAP_VSCALE_EN | LGYCAP_EN | LGYCAP_DMA_EN), 0x8007);
        assert_eq!(regs.v.len, 5);
        assert_eq!(regs.v.patt, 0b0001_1011);
        assert_eq!(regs.v.matrix[2][1], 0x24B0 + 8);
        assert_eq!(regs.alpha, 0xFF);
        assert_eq!(rig.dma.status(CAPTURE_DMA_CH), ChannelStatus::WaitingForPeripheral);
        assert!(cap.is_running());

        // A second capture on the same channel is refused.
        let err = LgyCapDriver::init(
            Arc::clone(&rig.soc.lgycap),
            Arc::clone(&rig.dma),
            Arc::clone(&rig.soc.gpu),
            &rig.soc.arm11_irq,
            SharedRegion::new(Arc::clone(&rig.soc.mem), PROG_ADDR + 0x100, 64),
            CaptureConfig::for_scaler(0, ScalerMatrix::default()),
        );
        assert!(err.is_err());
    }

    #[test]
    fn every_frame_signals_and_rearms() {
        let rig = rig();
        let cap = capture(&rig, 0);
        let ready = cap.frame_ready();
        let red = bgr555(31, 0, 0);
        let mut src = LegacyVideo::new(Pattern::Solid(red));

        for _ in 0..3 {
            assert!(!ready.is_signaled());
            src.step(&rig.soc.lgycap);
            assert!(ready.is_signaled());
            ready.clear();
            assert_eq!(rig.dma.status(CAPTURE_DMA_CH), ChannelStatus::WaitingForPeripheral);
        }
        // A1BGR5 red with the alpha bit set.
        assert_eq!(texel(&rig, 0, 0), 0xF801);
        assert_eq!(texel(&rig, 239, 159), 0xF801);
        assert!(matches!(rig.soc.gpu.pdc_vtotal(0), 414 | 415));
    }

    #[test]
    fn white_dot_stays_within_the_taps() {
        use std::collections::BTreeSet;

        let rig = rig();
        let cap = capture(&rig, 2);
        let mut src = LegacyVideo::new(Pattern::Dot {
            x: 100,
            y: 80,
            color: bgr555(31, 31, 31),
        });
        src.step(&rig.soc.lgycap);
        assert!(cap.frame_ready().is_signaled());

        let mut cols = BTreeSet::new();
        let mut rows = BTreeSet::new();
        let mut brightest = 0;
        for y in 0..240 {
            for x in 0..360 {
                let t = texel(&rig, x, y);
                // Negative taps clamp to black instead of wrapping.
                if t != 0x0001 {
                    cols.insert(x);
                    rows.insert(y);
                    brightest = brightest.max(t);
                }
            }
        }

        // 1.5x puts the dot around (150, 120).
        let (&x0, &x1) = (cols.first().unwrap(), cols.last().unwrap());
        let (&y0, &y1) = (rows.first().unwrap(), rows.last().unwrap());
        assert!(x1 - x0 < 6 && y1 - y0 < 6, "cols {cols:?} rows {rows:?}");
        assert!((x0..=x1).contains(&150) && (y0..=y1).contains(&120));
        // The phase 0 tap copies the source, white saturates at 255.
        assert_eq!(brightest, 0xFFFF);
    }

    #[test]
    fn stopped_unit_ignores_frames() {
        let rig = rig();
        let cap = capture(&rig, 0);
        let ready = cap.frame_ready();
        let mut src = LegacyVideo::new(Pattern::Bars);

        cap.stop();
        assert_eq!(rig.dma.status(CAPTURE_DMA_CH), ChannelStatus::Stopped);
        src.step(&rig.soc.lgycap);
        assert!(!ready.is_signaled());

        cap.start().unwrap();
        assert!(cap.start().is_err(), "program already armed");
        src.step(&rig.soc.lgycap);
        assert!(ready.is_signaled());
    }

    #[test]
    fn unscaled_capture_restores_the_scaled_mode() {
        let rig = rig();
        let cap = capture(&rig, 2);
        let ready = cap.frame_ready();

        let source = LegacyVideo::new(Pattern::Solid(bgr555(0, 31, 0))).spawn(Arc::clone(&rig.soc.lgycap));
        cap.capture_frame_unscaled().unwrap();
        let src = source.stop();
        assert!(src.is_some());

        assert!(!cap.is_running());
        assert_eq!(rig.soc.lgycap.regs().size, lgycap_size(360, 240));
        assert_eq!(texel(&rig, 120, 80), 0x07C1);
        assert!(!ready.is_signaled());

        cap.start().unwrap();
        assert!(cap.is_running());
    }

    #[test]
    fn deinit_wakes_waiters() {
        let rig = rig();
        let cap = capture(&rig, 1);
        let ready = cap.frame_ready();
        let waiter = thread::spawn(move || ready.wait());
        thread::sleep(Duration::from_millis(10));
        cap.deinit();
        assert!(waiter.join().unwrap().is_err());
        assert_eq!(rig.soc.lgycap.regs().cnt, 0);
        assert!(!rig.soc.arm11_irq.is_registered(Irq::CdmaEvent0));
    }
}
