//! PXI block: two 16-word FIFOs and a sync register between ARM9 and ARM11.
//!
//! ```text
//!        ARM9 port                           ARM11 port
//!   send ──────► [ FIFO 9→11, 16 words ] ──────► recv
//!   recv ◄────── [ FIFO 11→9, 16 words ] ◄────── send
//!   sync ◄─────────── data byte + IRQ ─────────► sync
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    bitwise::Bits,
    kernel::{Irq, IrqController},
};

pub const PXI_FIFO_DEPTH: usize = 16;

pub const PXI_CNT_SEND_EMPTY: u16 = 1 << 0;
pub const PXI_CNT_SEND_FULL: u16 = 1 << 1;
pub const PXI_CNT_SEND_EMPTY_IRQ: u16 = 1 << 2;
pub const PXI_CNT_FLUSH_SEND: u16 = 1 << 3;
pub const PXI_CNT_RECV_EMPTY: u16 = 1 << 8;
pub const PXI_CNT_RECV_FULL: u16 = 1 << 9;
pub const PXI_CNT_RECV_NOT_EMPTY_IRQ: u16 = 1 << 10;
pub const PXI_CNT_FIFO_ERROR: u16 = 1 << 14;
pub const PXI_CNT_EN_FIFOS: u16 = 1 << 15;

pub const PXI_SYNC_IRQ: u32 = 1 << 30;
pub const PXI_SYNC_IRQ_EN: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cpu {
    Arm9 = 0,
    Arm11 = 1,
}

impl Cpu {
    const fn idx(self) -> usize {
        self as usize
    }

    const fn remote(self) -> Self {
        match self {
            Self::Arm9 => Self::Arm11,
            Self::Arm11 => Self::Arm9,
        }
    }
}

#[derive(Default)]
struct SideRegs {
    /// Words sent by this side and not yet read by the remote.
    send: VecDeque<u32>,
    fifos_enabled: bool,
    send_empty_irq: bool,
    recv_not_empty_irq: bool,
    error: bool,
    sync_out: u8,
    sync_irq_enabled: bool,
    last_recv: u32,
}

#[derive(Default)]
struct PxiRegs {
    sides: [SideRegs; 2],
}

pub struct Pxi {
    regs: Mutex<PxiRegs>,
    irqs: [Arc<IrqController>; 2],
}

impl Pxi {
    #[must_use]
    pub fn new(arm9_irq: Arc<IrqController>, arm11_irq: Arc<IrqController>) -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(PxiRegs::default()),
            irqs: [arm9_irq, arm11_irq],
        })
    }

    /// Register view of one CPU.
    #[must_use]
    pub fn port(self: &Arc<Self>, cpu: Cpu) -> PxiPort {
        PxiPort {
            pxi: Arc::clone(self),
            cpu,
        }
    }

    fn regs(&self) -> MutexGuard<'_, PxiRegs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The PXI registers as one CPU sees them.
#[derive(Clone)]
pub struct PxiPort {
    pxi: Arc<Pxi>,
    cpu: Cpu,
}

impl PxiPort {
    #[must_use]
    pub const fn cpu(&self) -> Cpu {
        self.cpu
    }

    fn remote_irq(&self) -> &IrqController {
        &self.pxi.irqs[self.cpu.remote().idx()]
    }

    #[must_use]
    pub fn cnt(&self) -> u16 {
        let regs = self.pxi.regs();
        let own = &regs.sides[self.cpu.idx()];
        let incoming = &regs.sides[self.cpu.remote().idx()].send;

        let mut cnt = 0_u16;
        cnt.set_bit(0, own.send.is_empty());
        cnt.set_bit(1, own.send.len() >= PXI_FIFO_DEPTH);
        cnt.set_bit(2, own.send_empty_irq);
        cnt.set_bit(8, incoming.is_empty());
        cnt.set_bit(9, incoming.len() >= PXI_FIFO_DEPTH);
        cnt.set_bit(10, own.recv_not_empty_irq);
        cnt.set_bit(14, own.error);
        cnt.set_bit(15, own.fifos_enabled);
        cnt
    }

    /// Writing `PXI_CNT_FIFO_ERROR` acknowledges the error, `PXI_CNT_FLUSH_SEND`
    /// drops everything still queued in the send FIFO.
    pub fn set_cnt(&self, value: u16) {
        let mut regs = self.pxi.regs();
        let own = &mut regs.sides[self.cpu.idx()];

        own.fifos_enabled = value & PXI_CNT_EN_FIFOS != 0;
        own.send_empty_irq = value & PXI_CNT_SEND_EMPTY_IRQ != 0;
        own.recv_not_empty_irq = value & PXI_CNT_RECV_NOT_EMPTY_IRQ != 0;
        if value & PXI_CNT_FIFO_ERROR != 0 {
            own.error = false;
        }
        if value & PXI_CNT_FLUSH_SEND != 0 {
            own.send.clear();
        }
    }

    /// Pushes a word into the send FIFO. Writing a full FIFO sets the error
    /// flag and drops the word.
    pub fn send(&self, word: u32) {
        let notify = {
            let mut regs = self.pxi.regs();
            let [arm9, arm11] = &mut regs.sides;
            let (own, remote) = match self.cpu {
                Cpu::Arm9 => (arm9, arm11),
                Cpu::Arm11 => (arm11, arm9),
            };

            if !own.fifos_enabled {
                return;
            }
            if own.send.len() >= PXI_FIFO_DEPTH {
                own.error = true;
                return;
            }
            let was_empty = own.send.is_empty();
            own.send.push_back(word);
            was_empty && remote.recv_not_empty_irq
        };

        if notify {
            self.remote_irq().raise(Irq::PxiRecvFifoNotEmpty);
        }
    }

    /// Pops a word from the receive FIFO. Reading an empty FIFO sets the
    /// error flag and returns the last word read.
    #[must_use]
    pub fn recv(&self) -> u32 {
        let (word, notify) = {
            let mut regs = self.pxi.regs();
            let [arm9, arm11] = &mut regs.sides;
            let (own, remote) = match self.cpu {
                Cpu::Arm9 => (arm9, arm11),
                Cpu::Arm11 => (arm11, arm9),
            };

            if !own.fifos_enabled {
                return own.last_recv;
            }
            match remote.send.pop_front() {
                Some(word) => {
                    own.last_recv = word;
                    (word, remote.send.is_empty() && remote.send_empty_irq)
                }
                None => {
                    own.error = true;
                    (own.last_recv, false)
                }
            }
        };

        if notify {
            self.remote_irq().raise(Irq::PxiSendFifoEmpty);
        }
        word
    }

    #[must_use]
    pub fn sync(&self) -> u32 {
        let regs = self.pxi.regs();
        let own = &regs.sides[self.cpu.idx()];
        let remote = &regs.sides[self.cpu.remote().idx()];

        let mut sync = u32::from(remote.sync_out);
        sync.set_byte(1, own.sync_out);
        sync.set_bit(31, own.sync_irq_enabled);
        sync
    }

    /// Bits 8..=15 are the byte the remote reads, bit 31 enables the sync IRQ
    /// on this side and bit 30 requests one on the remote.
    pub fn set_sync(&self, value: u32) {
        let notify = {
            let mut regs = self.pxi.regs();
            regs.sides[self.cpu.idx()].sync_out = value.get_byte(1);
            regs.sides[self.cpu.idx()].sync_irq_enabled = value & PXI_SYNC_IRQ_EN != 0;
            value & PXI_SYNC_IRQ != 0 && regs.sides[self.cpu.remote().idx()].sync_irq_enabled
        };

        if notify {
            self.remote_irq().raise(Irq::PxiSync);
        }
    }
}
