//! Host model of the SoC the firmware drives.
//!
//! ```text
//!            ┌──────────── ARM9 ────────────┐      ┌──────────── ARM11 ────────────┐
//!            │ IrqController   Lgy9 (save,  │ PXI  │ IrqController   Gpu (PSC, PPF, │
//!            │                  RTC, mode)  │◄────►│                  PDC, P3D)     │
//!            └──────────────────────────────┘      │ Dma330 ◄── LgyCap ◄── legacy  │
//!                                                  └───────────────────────────────┘
//!                         PhysMem (ARM9 RAM, VRAM, DSP mem, AXI WRAM)
//! ```
//!
//! Blocks are shared as `Arc`s; each keeps its registers behind its own lock
//! and never holds it while raising an interrupt.

pub mod cdma;
pub mod gpu;
pub mod legacy;
pub mod lgy9;
pub mod lgy11;
pub mod lgycap;
pub mod mem;
pub mod pxi;
pub mod shared;
pub mod tiling;

use std::sync::{Arc, OnceLock, Weak};

use cdma::{DmaBus, Dma330};
use gpu::Gpu;
use lgy9::Lgy9;
use lgy11::Lgy11;
use lgycap::LgyCap;
use mem::PhysMem;
use pxi::Pxi;

use crate::{
    drivers::dma_program::LGYCAP_TOP_FIFO,
    error::{Error, Result},
    hid::KeyPad,
    kernel::IrqController,
};

const LGYCAP_FIFO_WINDOW: u32 = 0x1000;

/// Address decoding of the DMA engine: the capture FIFO window, then memory.
struct SocBus {
    mem: Arc<PhysMem>,
    lgycap: OnceLock<Weak<LgyCap>>,
}

impl SocBus {
    fn is_fifo(addr: u32) -> bool {
        (LGYCAP_TOP_FIFO..LGYCAP_TOP_FIFO + LGYCAP_FIFO_WINDOW).contains(&addr)
    }
}

impl DmaBus for SocBus {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        if Self::is_fifo(addr) {
            let cap = self
                .lgycap
                .get()
                .and_then(Weak::upgrade)
                .ok_or(Error::OutOfRange { addr, len: buf.len() })?;
            cap.pop_fifo(buf);
            return Ok(());
        }
        self.mem.read(addr, buf)
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        if Self::is_fifo(addr) {
            return Err(Error::OutOfRange {
                addr,
                len: data.len(),
            });
        }
        self.mem.write(addr, data)
    }
}

/// Every hardware block of the console.
#[derive(Clone)]
pub struct Soc {
    pub mem: Arc<PhysMem>,
    pub arm9_irq: Arc<IrqController>,
    pub arm11_irq: Arc<IrqController>,
    pub pxi: Arc<Pxi>,
    pub cdma: Arc<Dma330>,
    pub lgycap: Arc<LgyCap>,
    pub gpu: Arc<Gpu>,
    pub lgy9: Arc<Lgy9>,
    pub lgy11: Arc<Lgy11>,
    pub keypad: Arc<KeyPad>,
}

impl Default for Soc {
    fn default() -> Self {
        Self::new()
    }
}

impl Soc {
    #[must_use]
    pub fn new() -> Self {
        let mem = Arc::new(PhysMem::new());
        let arm9_irq = IrqController::new("arm9");
        let arm11_irq = IrqController::new("arm11");

        let bus = Arc::new(SocBus {
            mem: Arc::clone(&mem),
            lgycap: OnceLock::new(),
        });
        let cdma = Dma330::new(Arc::clone(&bus) as Arc<dyn DmaBus>, Arc::clone(&arm11_irq));
        let lgycap = LgyCap::new(Arc::clone(&cdma), Arc::clone(&arm11_irq));
        // Freshly created, nothing else can have set it.
        let _ = bus.lgycap.set(Arc::downgrade(&lgycap));

        let lgy9 = Arc::new(Lgy9::new());

        Self {
            pxi: Pxi::new(Arc::clone(&arm9_irq), Arc::clone(&arm11_irq)),
            gpu: Gpu::new(Arc::clone(&mem), Arc::clone(&arm11_irq)),
            lgy11: Arc::new(Lgy11::new(Arc::clone(&lgy9))),
            lgy9,
            keypad: KeyPad::new(),
            mem,
            arm9_irq,
            arm11_irq,
            cdma,
            lgycap,
        }
    }
}
