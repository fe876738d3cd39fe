//! Fatal error path of both CPUs.
//!
//! A halting CPU masks its interrupts, tells the other CPU with a PXI
//! command that does not wait for a reply and paints the bottom screen in a
//! fixed color. On hardware it then spins forever; here the halt is recorded
//! in a [`HaltState`] and the CPU thread winds down with [`Error::Halted`].
//!
//! | who            | PXI command              | color |
//! |----------------|--------------------------|-------|
//! | ARM9 panic     | `cmd11::PANIC`           | green |
//! | ARM9 exception | `cmd11::EXCEPTION`       | red   |
//! | ARM11 halt     | `cmd9::PREPARE_POWER`    | red   |

use std::sync::{Arc, OnceLock};

use tracing::error;

use crate::{
    drivers::{
        gx::{FRAMEBUF_BOT, FRAMEBUF_BOT_SIZE},
        ipc::{IpcCmd, cmd9, cmd11},
        pxi::send_panic_cmd,
    },
    error::Error,
    hardware::{mem::PhysMem, pxi::PxiPort},
    kernel::{Event, IrqController},
};

/// RGB565 (0, 255, 0).
pub const PANIC_GREEN: u16 = 0x07E0;
/// RGB565 (255, 0, 0).
pub const PANIC_RED: u16 = 0xF800;

/// Whether, and why, a CPU stopped.
#[derive(Debug)]
pub struct HaltState {
    reason: OnceLock<String>,
    event: Arc<Event>,
}

impl HaltState {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reason: OnceLock::new(),
            event: Event::new(),
        })
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Signaled once the CPU halted.
    #[must_use]
    pub const fn event(&self) -> &Arc<Event> {
        &self.event
    }

    /// Records the first halt. Returns `false` if the CPU already halted.
    fn enter(&self, reason: &str) -> bool {
        let first = self.reason.set(reason.to_owned()).is_ok();
        if first {
            self.event.signal();
        }
        first
    }

    fn halted(&self) -> Error {
        Error::Halted(self.reason().unwrap_or_default().to_owned())
    }
}

fn paint_bottom_screen(mem: &PhysMem, color: u16) {
    let [lo, hi] = color.to_le_bytes();
    for fb in FRAMEBUF_BOT {
        let res = mem.with_slice_mut(fb, FRAMEBUF_BOT_SIZE, |px| {
            for p in px.chunks_exact_mut(2) {
                p.copy_from_slice(&[lo, hi]);
            }
        });
        if let Err(e) = res {
            error!("panic screen: {e}");
        }
    }
}

/// Everything a CPU needs to halt, captured at boot so halting never
/// depends on driver state.
struct Halt {
    cpu: &'static str,
    irq: Arc<IrqController>,
    port: PxiPort,
    mem: Arc<PhysMem>,
    state: Arc<HaltState>,
}

impl Halt {
    fn run(&self, cmd: IpcCmd, color: u16, reason: &str) -> Error {
        let _cs = self.irq.critical_section();
        if !self.state.enter(reason) {
            return self.state.halted();
        }
        error!("{} halted: {reason}", self.cpu);
        send_panic_cmd(&self.port, cmd);
        paint_bottom_screen(&self.mem, color);
        self.state.halted()
    }
}

pub struct Arm9Panic(Halt);

impl Arm9Panic {
    #[must_use]
    pub fn new(irq: Arc<IrqController>, port: PxiPort, mem: Arc<PhysMem>) -> Self {
        Self(Halt {
            cpu: "ARM9",
            irq,
            port,
            mem,
            state: HaltState::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> &Arc<HaltState> {
        &self.0.state
    }

    /// Stops the ARM9. The returned error is what the CPU thread ends with.
    pub fn halt(&self, reason: &str) -> Error {
        self.0.run(cmd11::PANIC, PANIC_GREEN, reason)
    }

    /// Like [`Self::halt`] for a CPU exception.
    pub fn exception(&self, reason: &str) -> Error {
        self.0.run(cmd11::EXCEPTION, PANIC_RED, reason)
    }
}

pub struct Arm11Panic(Halt);

impl Arm11Panic {
    #[must_use]
    pub fn new(irq: Arc<IrqController>, port: PxiPort, mem: Arc<PhysMem>) -> Self {
        Self(Halt {
            cpu: "ARM11",
            irq,
            port,
            mem,
            state: HaltState::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> &Arc<HaltState> {
        &self.0.state
    }

    /// Stops the ARM11. The ARM9 is told to get ready for power off, which
    /// writes the save back.
    pub fn halt(&self, reason: &str) -> Error {
        self.0.run(cmd9::PREPARE_POWER, PANIC_RED, reason)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hardware::{
        Soc,
        pxi::{Cpu, PXI_CNT_EN_FIFOS, PXI_CNT_RECV_EMPTY},
    };

    fn soc() -> Soc {
        let soc = Soc::new();
        for cpu in [Cpu::Arm9, Cpu::Arm11] {
            soc.pxi.port(cpu).set_cnt(PXI_CNT_EN_FIFOS);
        }
        soc
    }

    fn bottom_pixels(soc: &Soc) -> Vec<u16> {
        FRAMEBUF_BOT
            .iter()
            .flat_map(|&fb| soc.mem.read_vec(fb, FRAMEBUF_BOT_SIZE).unwrap())
            .collect::<Vec<u8>>()
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn arm9_panic_paints_green_and_notifies() {
        let soc = soc();
        let panic = Arm9Panic::new(
            Arc::clone(&soc.arm9_irq),
            soc.pxi.port(Cpu::Arm9),
            Arc::clone(&soc.mem),
        );
        let err = panic.halt("bad command");
        assert!(matches!(err, Error::Halted(ref r) if r == "bad command"));
        assert!(panic.state().event().is_signaled());
        assert!(bottom_pixels(&soc).iter().all(|&p| p == PANIC_GREEN));

        let arm11 = soc.pxi.port(Cpu::Arm11);
        assert_eq!(arm11.cnt() & PXI_CNT_RECV_EMPTY, 0);
        assert_eq!(arm11.recv(), cmd11::PANIC.word());
    }

    #[test]
    fn arm9_exception_paints_red() {
        let soc = soc();
        let panic = Arm9Panic::new(
            Arc::clone(&soc.arm9_irq),
            soc.pxi.port(Cpu::Arm9),
            Arc::clone(&soc.mem),
        );
        let _ = panic.exception("data abort");
        assert!(bottom_pixels(&soc).iter().all(|&p| p == PANIC_RED));
        assert_eq!(soc.pxi.port(Cpu::Arm11).recv(), cmd11::EXCEPTION.word());
    }

    #[test]
    fn first_reason_wins() {
        let soc = soc();
        let panic = Arm11Panic::new(
            Arc::clone(&soc.arm11_irq),
            soc.pxi.port(Cpu::Arm11),
            Arc::clone(&soc.mem),
        );
        let _ = panic.halt("first");
        let err = panic.halt("second");
        assert!(matches!(err, Error::Halted(ref r) if r == "first"));
        assert_eq!(panic.state().reason(), Some("first"));
        assert!(bottom_pixels(&soc).iter().all(|&p| p == PANIC_RED));

        // Only one notification went out.
        let arm9 = soc.pxi.port(Cpu::Arm9);
        assert_eq!(arm9.recv(), cmd9::PREPARE_POWER.word());
        assert_eq!(arm9.cnt() & PXI_CNT_RECV_EMPTY, PXI_CNT_RECV_EMPTY);
    }
}
