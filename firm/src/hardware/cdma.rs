//! CoreLink DMA-330 ("CDMA") of the ARM11 side.
//!
//! The controller runs bytecode programs fetched from physical memory. One
//! manager thread starts channel threads (`DMAGO`), each channel moves bursts
//! through its own MFIFO between a source and a destination address.
//!
//! Software talks to it through the debug instruction interface: the
//! instruction bytes go into `DBGINST0`/`DBGINST1` and writing `DBGCMD`
//! executes them on the manager or a channel thread.
//!
//! Execution is modelled synchronously. A channel runs until it ends, faults
//! or waits for a peripheral request that has not arrived yet; a later
//! [`Dma330::peripheral_request`] resumes it on the requesting context.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    bitwise::Bits,
    error::Result,
    kernel::{Irq, IrqController},
};

pub const CHANNELS: usize = 8;
pub const PERIPHERALS: u8 = 18;
/// Event lines wired to the interrupt controller.
pub const IRQ_LINES: u8 = 9;

pub const DBGINST0_THR_MGR: u32 = 0;
pub const DBGINST0_THR_CH: u32 = 1;

/// `DBGINST0` word for a debug instruction of up to two bytes.
#[must_use]
pub const fn dbginst0(inst: u16, ch: u8, thread: u32) -> u32 {
    (inst as u32) << 16 | (ch as u32) << 8 | thread
}

/// Upper bound on instructions a channel may run without blocking. Hitting
/// it is treated like the watchdog abort of a hung channel.
const WATCHDOG_STEPS: usize = 1 << 24;

/// Channel thread status as reported in `CSRn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChannelStatus {
    #[default]
    Stopped = 0,
    Executing = 1,
    CacheMiss = 2,
    UpdatingPc = 3,
    WaitingForEvent = 4,
    AtBarrier = 5,
    WaitingForPeripheral = 7,
    Killing = 8,
    Completing = 9,
    FaultingCompleting = 14,
    Faulting = 15,
}

impl ChannelStatus {
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }
}

/// Fault type bits of `FTRn`.
pub mod fault {
    pub const UNDEF_INSTR: u32 = 1 << 0;
    pub const OPERAND_INVALID: u32 = 1 << 1;
    pub const EVENT_ERR: u32 = 1 << 5;
    pub const PERIPH_ERR: u32 = 1 << 6;
    pub const INSTR_FETCH_ERR: u32 = 1 << 16;
    pub const DATA_WRITE_ERR: u32 = 1 << 17;
    pub const DATA_READ_ERR: u32 = 1 << 18;
    pub const LOCKUP_ERR: u32 = 1 << 31;
}

/// What the DMA engine sees of the system: memory plus peripheral FIFOs
/// mapped into the address space.
pub trait DmaBus: Send + Sync {
    /// # Errors
    /// If `addr` is not decoded by any slave.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// # Errors
    /// If `addr` is not decoded by any slave.
    fn write(&self, addr: u32, data: &[u8]) -> Result<()>;
}

#[derive(Default, Clone)]
struct Channel {
    status: ChannelStatus,
    pc: u32,
    sar: u32,
    dar: u32,
    ccr: u32,
    lc: [u8; 2],
    /// Peripheral a `DMAWFP` is blocked on.
    waiting_on: Option<u8>,
    /// Event a `DMAWFE` is blocked on.
    waiting_event: Option<u8>,
    ftr: u32,
    mfifo: VecDeque<u8>,
}

#[derive(Default)]
struct Dma330Regs {
    manager_stopped: bool,
    inten: u32,
    int_event_ris: u32,
    /// Events raised by `DMASEV` on lines not routed to an IRQ.
    events: u32,
    fsrc: u32,
    periph_req: u32,
    dbginst0: u32,
    dbginst1: u32,
    watchdog: u32,
    channels: [Channel; CHANNELS],
}

pub struct Dma330 {
    regs: Mutex<Dma330Regs>,
    bus: Arc<dyn DmaBus>,
    irq: Arc<IrqController>,
}

impl fmt::Debug for Dma330 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dma330").finish_non_exhaustive()
    }
}

/// Side effects gathered while the register lock is held and performed
/// after it is released.
#[derive(Default)]
struct Pending {
    irqs: Vec<Irq>,
}

impl Dma330 {
    #[must_use]
    pub fn new(bus: Arc<dyn DmaBus>, irq: Arc<IrqController>) -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(Dma330Regs::default()),
            bus,
            irq,
        })
    }

    fn regs(&self) -> MutexGuard<'_, Dma330Regs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, pending: Pending) {
        for irq in pending.irqs {
            self.irq.raise(irq);
        }
    }

    /// `CSRn` status field.
    #[must_use]
    pub fn csr(&self, ch: u8) -> ChannelStatus {
        self.regs()
            .channels
            .get(usize::from(ch))
            .map_or(ChannelStatus::Stopped, |c| c.status)
    }

    #[must_use]
    pub fn cpc(&self, ch: u8) -> u32 {
        self.regs().channels.get(usize::from(ch)).map_or(0, |c| c.pc)
    }

    #[must_use]
    pub fn ftr(&self, ch: u8) -> u32 {
        self.regs().channels.get(usize::from(ch)).map_or(0, |c| c.ftr)
    }

    /// Channels in a faulting state, one bit per channel.
    #[must_use]
    pub fn fsrc(&self) -> u32 {
        self.regs().fsrc
    }

    #[must_use]
    pub fn manager_stopped(&self) -> bool {
        self.regs().manager_stopped
    }

    /// The debug interface never queues, it is never busy.
    #[must_use]
    pub const fn dbgstatus_busy(&self) -> bool {
        false
    }

    pub fn set_inten(&self, value: u32) {
        self.regs().inten = value;
    }

    #[must_use]
    pub fn inten(&self) -> u32 {
        self.regs().inten
    }

    #[must_use]
    pub fn int_event_ris(&self) -> u32 {
        self.regs().int_event_ris
    }

    pub fn set_intclr(&self, value: u32) {
        self.regs().int_event_ris &= !value;
    }

    pub fn set_watchdog(&self, value: u32) {
        self.regs().watchdog = value;
    }

    pub fn set_dbginst0(&self, value: u32) {
        self.regs().dbginst0 = value;
    }

    pub fn set_dbginst1(&self, value: u32) {
        self.regs().dbginst1 = value;
    }

    /// Writing 0 to `DBGCMD` executes the debug instruction.
    pub fn set_dbgcmd(&self, value: u32) {
        if value != 0 {
            return;
        }

        let mut pending = Pending::default();
        {
            let mut regs = self.regs();
            let inst0 = regs.dbginst0;
            let inst1 = regs.dbginst1;
            let ch = inst0.get_byte(1) & 7;
            let op = [
                inst0.get_byte(2),
                inst0.get_byte(3),
                inst1.get_byte(0),
                inst1.get_byte(1),
                inst1.get_byte(2),
                inst1.get_byte(3),
            ];

            if inst0.is_bit_on(0) {
                Self::debug_channel_inst(&mut regs, ch, op);
            } else {
                self.debug_manager_inst(&mut regs, op, &mut pending);
            }
        }
        self.deliver(pending);
    }

    fn debug_manager_inst(&self, regs: &mut Dma330Regs, op: [u8; 6], pending: &mut Pending) {
        match op[0] {
            // DMAKILL
            0x01 => {
                regs.manager_stopped = true;
                debug!("CDMA: manager killed");
            }
            // DMAGO
            0xA0 | 0xA2 => {
                let ch = usize::from(op[1] & 7);
                let pc = u32::from_le_bytes([op[2], op[3], op[4], op[5]]);
                if regs.channels[ch].status != ChannelStatus::Stopped {
                    warn!("CDMA: DMAGO on busy channel {ch}");
                    return;
                }

                let chan = &mut regs.channels[ch];
                *chan = Channel {
                    status: ChannelStatus::Executing,
                    pc,
                    ..Channel::default()
                };
                regs.manager_stopped = false;
                regs.fsrc.set_bit(ch as u8, false);
                self.execute(regs, ch, pending);
            }
            // DMASEV
            0x34 => {
                let event = op[1] >> 3;
                Self::signal_event(regs, event, pending);
                self.wake_event_waiters(regs, event, pending);
            }
            other => warn!("CDMA: unsupported manager debug instruction 0x{other:02X}"),
        }
    }

    fn debug_channel_inst(regs: &mut Dma330Regs, ch: u8, op: [u8; 6]) {
        match op[0] {
            // DMAKILL
            0x01 => {
                let chan = &mut regs.channels[usize::from(ch)];
                // Killing discards whatever the MFIFO still holds.
                chan.status = ChannelStatus::Stopped;
                chan.waiting_on = None;
                chan.waiting_event = None;
                chan.mfifo.clear();
                regs.fsrc.set_bit(ch, false);
                debug!("CDMA: channel {ch} killed");
            }
            other => warn!("CDMA: unsupported channel debug instruction 0x{other:02X}"),
        }
    }

    /// Request line of `periph` asserted. Resumes a channel waiting on it.
    pub fn peripheral_request(&self, periph: u8) {
        let mut pending = Pending::default();
        {
            let mut regs = self.regs();
            regs.periph_req.set_bit(periph, true);

            for ch in 0..CHANNELS {
                let chan = &regs.channels[ch];
                if chan.status == ChannelStatus::WaitingForPeripheral
                    && chan.waiting_on == Some(periph)
                {
                    self.execute(&mut regs, ch, &mut pending);
                }
            }
        }
        self.deliver(pending);
    }

    fn signal_event(regs: &mut Dma330Regs, event: u8, pending: &mut Pending) {
        if regs.inten.is_bit_on(event) {
            regs.int_event_ris.set_bit(event, true);
            if let Some(irq) = Irq::cdma_event(event) {
                pending.irqs.push(irq);
            }
        } else {
            regs.events.set_bit(event, true);
        }
    }

    fn wake_event_waiters(&self, regs: &mut Dma330Regs, event: u8, pending: &mut Pending) {
        for ch in 0..CHANNELS {
            if regs.channels[ch].waiting_event == Some(event) {
                self.execute(regs, ch, pending);
            }
        }
    }

    fn fault(regs: &mut Dma330Regs, ch: usize, ftr: u32, pending: &mut Pending) {
        let chan = &mut regs.channels[ch];
        chan.status = ChannelStatus::Faulting;
        chan.ftr |= ftr;
        chan.waiting_on = None;
        chan.waiting_event = None;
        regs.fsrc.set_bit(ch as u8, true);
        warn!("CDMA: channel {ch} faulted at 0x{:08X}, FTR 0x{ftr:08X}", chan.pc);
        pending.irqs.push(Irq::CdmaFault);
    }

    fn fetch(&self, pc: u32, len: usize) -> Option<[u8; 6]> {
        let mut buf = [0; 6];
        self.bus.read(pc, &mut buf[..len]).ok()?;
        Some(buf)
    }

    /// Runs channel `ch` until it stops, faults or blocks.
    #[allow(clippy::too_many_lines)]
    fn execute(&self, regs: &mut Dma330Regs, ch: usize, pending: &mut Pending) {
        regs.channels[ch].status = ChannelStatus::Executing;
        regs.channels[ch].waiting_on = None;
        regs.channels[ch].waiting_event = None;

        for _ in 0..WATCHDOG_STEPS {
            let pc = regs.channels[ch].pc;
            let Some(first) = self.fetch(pc, 1) else {
                return Self::fault(regs, ch, fault::INSTR_FETCH_ERR, pending);
            };
            let len = match first[0] {
                0x20 | 0x22 | 0x25 | 0x27 | 0x29 | 0x2B | 0x30..=0x32 | 0x34..=0x36 | 0x38
                | 0x3C => 2,
                0x54 | 0x56 => 3,
                0xBC => 6,
                _ => 1,
            };
            let Some(op) = self.fetch(pc, len) else {
                return Self::fault(regs, ch, fault::INSTR_FETCH_ERR, pending);
            };
            let next_pc = pc + len as u32;

            match op[0] {
                // DMAEND
                0x00 => {
                    let chan = &mut regs.channels[ch];
                    chan.status = ChannelStatus::Stopped;
                    chan.pc = next_pc;
                    return;
                }
                // DMAKILL
                0x01 => {
                    regs.channels[ch].status = ChannelStatus::Stopped;
                    return;
                }
                // DMALD, DMALDB (single loads are treated as burst loads)
                0x04 | 0x05 | 0x07 => {
                    if let Err(f) = self.load(&mut regs.channels[ch]) {
                        return Self::fault(regs, ch, f, pending);
                    }
                }
                // DMAST, DMASTB
                0x08 | 0x09 | 0x0B => {
                    if let Err(f) = self.store(&mut regs.channels[ch]) {
                        return Self::fault(regs, ch, f, pending);
                    }
                }
                // DMARMB, DMAWMB, DMANOP: all transfers complete synchronously.
                0x12 | 0x13 | 0x18 => {}
                // DMALP
                0x20 | 0x22 => {
                    let lc = usize::from(op[0] >> 1 & 1);
                    regs.channels[ch].lc[lc] = op[1];
                }
                // DMALDP<S|B>
                0x25 | 0x27 => {
                    let periph = op[1] >> 3;
                    if periph >= PERIPHERALS {
                        return Self::fault(regs, ch, fault::PERIPH_ERR, pending);
                    }
                    if let Err(f) = self.load(&mut regs.channels[ch]) {
                        return Self::fault(regs, ch, f, pending);
                    }
                }
                // DMASTP<S|B>
                0x29 | 0x2B => {
                    let periph = op[1] >> 3;
                    if periph >= PERIPHERALS {
                        return Self::fault(regs, ch, fault::PERIPH_ERR, pending);
                    }
                    if let Err(f) = self.store(&mut regs.channels[ch]) {
                        return Self::fault(regs, ch, f, pending);
                    }
                }
                // DMAWFP
                0x30..=0x32 => {
                    let periph = op[1] >> 3;
                    if periph >= PERIPHERALS {
                        return Self::fault(regs, ch, fault::PERIPH_ERR, pending);
                    }
                    if regs.periph_req.is_bit_on(periph) {
                        regs.periph_req.set_bit(periph, false);
                    } else {
                        let chan = &mut regs.channels[ch];
                        chan.status = ChannelStatus::WaitingForPeripheral;
                        chan.waiting_on = Some(periph);
                        return;
                    }
                }
                // DMASEV
                0x34 => {
                    let event = op[1] >> 3;
                    if event >= 32 {
                        return Self::fault(regs, ch, fault::EVENT_ERR, pending);
                    }
                    Self::signal_event(regs, event, pending);
                }
                // DMAFLUSHP
                0x35 => {
                    let periph = op[1] >> 3;
                    if periph >= PERIPHERALS {
                        return Self::fault(regs, ch, fault::PERIPH_ERR, pending);
                    }
                    regs.periph_req.set_bit(periph, false);
                }
                // DMAWFE
                0x36 => {
                    let event = op[1] >> 3;
                    if regs.events.is_bit_on(event) {
                        regs.events.set_bit(event, false);
                    } else {
                        let chan = &mut regs.channels[ch];
                        chan.status = ChannelStatus::WaitingForEvent;
                        chan.waiting_event = Some(event);
                        return;
                    }
                }
                // DMALPEND
                0x38 | 0x3C => {
                    let lc = usize::from(op[0] >> 2 & 1);
                    let chan = &mut regs.channels[ch];
                    if chan.lc[lc] != 0 {
                        chan.lc[lc] -= 1;
                        chan.pc = pc - u32::from(op[1]);
                        continue;
                    }
                }
                // DMAADDH
                0x54 | 0x56 => {
                    let imm = u32::from(u16::from_le_bytes([op[1], op[2]]));
                    let chan = &mut regs.channels[ch];
                    if op[0] & 2 == 0 {
                        chan.sar = chan.sar.wrapping_add(imm);
                    } else {
                        chan.dar = chan.dar.wrapping_add(imm);
                    }
                }
                // DMAMOV
                0xBC => {
                    let imm = u32::from_le_bytes([op[2], op[3], op[4], op[5]]);
                    let chan = &mut regs.channels[ch];
                    match op[1] & 7 {
                        0 => chan.sar = imm,
                        1 => chan.ccr = imm,
                        2 => chan.dar = imm,
                        _ => return Self::fault(regs, ch, fault::OPERAND_INVALID, pending),
                    }
                }
                _ => return Self::fault(regs, ch, fault::UNDEF_INSTR, pending),
            }

            regs.channels[ch].pc = next_pc;
        }

        Self::fault(regs, ch, fault::LOCKUP_ERR, pending);
    }

    fn burst_bytes(ccr: u32, dst: bool) -> usize {
        let (size, len) = if dst {
            (ccr.get_bits(15..=17), ccr.get_bits(18..=21))
        } else {
            (ccr.get_bits(1..=3), ccr.get_bits(4..=7))
        };
        (1_usize << size) * (len as usize + 1)
    }

    fn load(&self, chan: &mut Channel) -> std::result::Result<(), u32> {
        let n = Self::burst_bytes(chan.ccr, false);
        let mut buf = vec![0; n];
        self.bus
            .read(chan.sar, &mut buf)
            .map_err(|_| fault::DATA_READ_ERR)?;
        chan.mfifo.extend(buf);
        if chan.ccr.is_bit_on(0) {
            chan.sar = chan.sar.wrapping_add(n as u32);
        }
        Ok(())
    }

    fn store(&self, chan: &mut Channel) -> std::result::Result<(), u32> {
        let n = Self::burst_bytes(chan.ccr, true);
        if chan.mfifo.len() < n {
            return Err(fault::OPERAND_INVALID);
        }
        let data: Vec<u8> = chan.mfifo.drain(..n).collect();
        self.bus
            .write(chan.dar, &data)
            .map_err(|_| fault::DATA_WRITE_ERR)?;
        if chan.ccr.is_bit_on(14) {
            chan.dar = chan.dar.wrapping_add(n as u32);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hardware::mem::{AXI_WRAM_BASE, PhysMem};

    struct MemBus(Arc<PhysMem>);

    impl DmaBus for MemBus {
        fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
            self.0.read(addr, buf)
        }

        fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
            self.0.write(addr, data)
        }
    }

    fn setup() -> (Arc<PhysMem>, Arc<Dma330>, Arc<IrqController>) {
        let mem = Arc::new(PhysMem::new());
        let irq = IrqController::new("arm11");
        let dma = Dma330::new(Arc::new(MemBus(Arc::clone(&mem))), Arc::clone(&irq));
        dma.set_inten((1 << IRQ_LINES) - 1);
        (mem, dma, irq)
    }

    fn go(dma: &Dma330, ch: u8, pc: u32) {
        dma.set_dbginst0(dbginst0(u16::from(ch) << 8 | 0xA2, 0, DBGINST0_THR_MGR));
        dma.set_dbginst1(pc);
        dma.set_dbgcmd(0);
    }

    const PROG: u32 = AXI_WRAM_BASE;
    const SRC: u32 = AXI_WRAM_BASE + 0x1000;
    const DST: u32 = AXI_WRAM_BASE + 0x2000;

    fn mov(rd: u8, imm: u32) -> Vec<u8> {
        let mut v = vec![0xBC, rd];
        v.extend(imm.to_le_bytes());
        v
    }

    #[test]
    fn copy_with_loop_and_event() {
        let (mem, dma, irq) = setup();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let _reg = irq
            .register(Irq::CdmaEvent3, move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        // 4 beats of 4 bytes per burst, incrementing both sides, 4 bursts.
        let mut prog = Vec::new();
        prog.extend(mov(1, 0x000D_4035));
        prog.extend(mov(0, SRC));
        prog.extend(mov(2, DST));
        prog.extend([0x20, 3, 0x04, 0x08, 0x38, 2, 0x13, 0x34, 3 << 3, 0x00]);
        mem.write(PROG, &prog).unwrap();
        let src: Vec<u8> = (0..64).collect();
        mem.write(SRC, &src).unwrap();

        go(&dma, 1, PROG);

        assert_eq!(dma.csr(1), ChannelStatus::Stopped);
        assert_eq!(mem.read_vec(DST, 64).unwrap(), src);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(dma.int_event_ris(), 1 << 3);
        dma.set_intclr(1 << 3);
        assert_eq!(dma.int_event_ris(), 0);
    }

    #[test]
    fn wfp_blocks_until_request() {
        let (mem, dma, _irq) = setup();
        // FLUSHP 14, WFP 14, END
        mem.write(PROG, &[0x35, 14 << 3, 0x32, 14 << 3, 0x00]).unwrap();

        go(&dma, 0, PROG);
        assert_eq!(dma.csr(0), ChannelStatus::WaitingForPeripheral);
        assert_eq!(dma.cpc(0), PROG + 2);

        dma.peripheral_request(13);
        assert_eq!(dma.csr(0), ChannelStatus::WaitingForPeripheral);
        dma.peripheral_request(14);
        assert_eq!(dma.csr(0), ChannelStatus::Stopped);
    }

    #[test]
    fn undefined_instruction_faults() {
        let (mem, dma, irq) = setup();
        let faults = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&faults);
        let _reg = irq
            .register(Irq::CdmaFault, move |_| {
                f.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        mem.write(PROG, &[0x18, 0xFF]).unwrap();

        go(&dma, 2, PROG);

        assert_eq!(dma.csr(2), ChannelStatus::Faulting);
        assert_eq!(dma.ftr(2), fault::UNDEF_INSTR);
        assert_eq!(dma.fsrc(), 1 << 2);
        assert_eq!(faults.load(Ordering::Relaxed), 1);

        // Kill brings it back to stopped.
        dma.set_dbginst0(dbginst0(0x01, 2, DBGINST0_THR_CH));
        dma.set_dbgcmd(0);
        assert_eq!(dma.csr(2), ChannelStatus::Stopped);
        assert_eq!(dma.fsrc(), 0);
    }

    #[test]
    fn store_without_data_faults() {
        let (mem, dma, _irq) = setup();
        let mut prog = mov(1, 0x0000_4000);
        prog.extend(mov(2, DST));
        prog.extend([0x08, 0x00]);
        mem.write(PROG, &prog).unwrap();

        go(&dma, 0, PROG);
        assert_eq!(dma.csr(0), ChannelStatus::Faulting);
    }
}
