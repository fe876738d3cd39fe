//! Driver of the DMA-330.
//!
//! Everything goes through the debug instruction port: `DMAGO` starts a
//! program on a channel, `DMAKILL` stops one, `DMASEV` signals an event.
//! Completion is reported by the program itself (`DMASEV` at its end) and
//! arrives as an interrupt, nothing here polls for it.

use std::sync::Arc;

use tracing::{debug, info};

use super::dma_program::flush_peripherals_program;
use crate::{
    error::{Error, Result},
    hardware::{
        cdma::{
            CHANNELS, ChannelStatus, DBGINST0_THR_CH, DBGINST0_THR_MGR, Dma330, IRQ_LINES,
            PERIPHERALS, dbginst0,
        },
        shared::SharedRegion,
    },
    kernel::spin_until,
};

const DMAKILL: u16 = 0x01;
const DMAGO_NS: u16 = 0xA2;
const DMASEV: u16 = 0x34;

pub struct Dma330Driver {
    hw: Arc<Dma330>,
}

impl Dma330Driver {
    /// Stops the manager and every channel, routes the event lines to the
    /// interrupt controller and flushes the stale request state of every
    /// peripheral with a bootstrap program placed in `scratch`.
    ///
    /// # Errors
    /// If `scratch` cannot hold the bootstrap program.
    pub fn init(hw: Arc<Dma330>, scratch: &SharedRegion) -> Result<Self> {
        let drv = Self { hw };

        drv.send_debug_cmd(dbginst0(DMAKILL, 0, DBGINST0_THR_MGR), 0);
        for ch in 0..CHANNELS as u8 {
            drv.send_debug_cmd(dbginst0(DMAKILL, ch, DBGINST0_THR_CH), 0);
        }
        drv.wait_for_status(CHANNELS as u8 - 1, ChannelStatus::Stopped);

        // The first lines are interrupts, the remaining ones events.
        drv.hw.set_inten((1 << IRQ_LINES) - 1);
        drv.hw.set_intclr(u32::MAX);
        // Hung channels are aborted by the watchdog.
        drv.hw.set_watchdog(0);

        // One DMAFLUSHP per program, the way the boot ROM does it.
        let prog = flush_peripherals_program(PERIPHERALS);
        for (i, inst) in prog.chunks_exact(2).take(usize::from(PERIPHERALS)).enumerate() {
            drv.wait_for_status(0, ChannelStatus::Stopped);
            scratch.write(0, &[inst[0], inst[1], 0])?;
            drv.send_debug_cmd(dbginst0(DMAGO_NS, 0, DBGINST0_THR_MGR), scratch.addr());
            debug!("CDMA: flushed peripheral {i}");
        }
        drv.wait_for_status(0, ChannelStatus::Stopped);

        info!("CDMA: initialized");
        Ok(drv)
    }

    fn send_debug_cmd(&self, inst0: u32, inst1: u32) {
        spin_until(|| !self.hw.dbgstatus_busy());
        self.hw.set_dbginst0(inst0);
        self.hw.set_dbginst1(inst1);
        self.hw.set_dbgcmd(0);
    }

    fn wait_for_status(&self, ch: u8, status: ChannelStatus) {
        spin_until(|| self.hw.csr(ch) == status);
    }

    #[must_use]
    pub fn status(&self, ch: u8) -> ChannelStatus {
        self.hw.csr(ch)
    }

    /// Starts the program at `prog` on channel `ch`. The program must have
    /// been flushed to memory already.
    ///
    /// # Errors
    /// [`Error::DmaBusy`] with the channel status if it is not stopped. The
    /// program already running on it is left alone.
    pub fn run(&self, ch: u8, prog: u32) -> Result<()> {
        let status = self.status(ch);
        if status != ChannelStatus::Stopped {
            return Err(Error::DmaBusy { ch, status });
        }
        self.send_debug_cmd(dbginst0(u16::from(ch) << 8 | DMAGO_NS, 0, DBGINST0_THR_MGR), prog);
        Ok(())
    }

    pub fn ack_irq(&self, event: u8) {
        self.hw.set_intclr(1 << event);
    }

    /// Signals `event` from the manager thread.
    pub fn sev(&self, event: u8) {
        self.send_debug_cmd(dbginst0(u16::from(event) << 11 | DMASEV, 0, DBGINST0_THR_MGR), 0);
    }

    /// Aborts whatever runs on `ch`. Data still in flight is lost.
    pub fn kill(&self, ch: u8) {
        if self.status(ch) != ChannelStatus::Stopped {
            self.send_debug_cmd(dbginst0(DMAKILL, ch, DBGINST0_THR_CH), 0);
            self.wait_for_status(ch, ChannelStatus::Stopped);
        }
    }
}
