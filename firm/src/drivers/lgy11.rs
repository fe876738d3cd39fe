//! ARM11 half of legacy mode.
//!
//! Everything touching the save or the legacy RTC lives on the ARM9, so
//! most calls here are PXI commands. The save path and the RTC reply travel
//! through a scratch area in AXI WRAM both CPUs can reach.

use std::sync::Arc;

use tracing::{info, warn};

use super::{
    ipc::cmd9,
    lgy9::SAVE_PATH_MAX,
    pxi::PxiDriver,
};
use crate::{
    error::{Error, Result},
    hardware::{
        lgy9::LGY_MODE_START,
        lgy11::Lgy11,
        shared::SharedRegion,
    },
    kernel::spin_until,
    rtc::{GbaRtc, RtcTimeDate},
    save_type::SaveType,
};

const PATH_OFFSET: usize = 0;
const RTC_OFFSET: usize = 0x200;
const RTC_SIZE: usize = 8;

pub struct Lgy11Driver {
    pxi: Arc<PxiDriver>,
    hw: Arc<Lgy11>,
    scratch: SharedRegion,
}

impl Lgy11Driver {
    /// `scratch` must be reachable from the ARM9 and hold at least 0x208
    /// bytes.
    ///
    /// # Errors
    /// [`Error::InvalidArg`] for a scratch area that is too small.
    pub fn new(pxi: Arc<PxiDriver>, hw: Arc<Lgy11>, scratch: SharedRegion) -> Result<Self> {
        if scratch.len() < RTC_OFFSET + RTC_SIZE {
            return Err(Error::InvalidArg("IPC scratch area too small"));
        }
        Ok(Self { pxi, hw, scratch })
    }

    /// Has the ARM9 set up GBA mode and load the save, then seeds the legacy
    /// RTC from the console clock. Returns once the legacy block reports a
    /// mode.
    ///
    /// # Errors
    /// [`Error::InvalidArg`] for an overlong path, otherwise whatever the
    /// ARM9 reported. An RTC failure is only logged.
    pub fn prepare_gba_mode(&self, direct_boot: bool, save_type: SaveType, save_path: &str) -> Result<()> {
        if save_path.len() > SAVE_PATH_MAX {
            return Err(Error::InvalidArg("save path too long"));
        }
        let mut path = Vec::with_capacity(save_path.len() + 1);
        path.extend_from_slice(save_path.as_bytes());
        path.push(0);
        self.scratch.write(PATH_OFFSET, &path)?;

        let path_addr = self.scratch.addr() + PATH_OFFSET as u32;
        let buf = [
            path_addr,
            path.len() as u32,
            u32::from(direct_boot),
            save_type as u32,
        ];
        Error::check(self.pxi.send_cmd(cmd9::PREPARE_GBA, &buf)?)?;

        if let Err(e) = self.set_rtc(RtcTimeDate::now().into()) {
            warn!("LGY: could not set the GBA RTC: {e}");
        }

        spin_until(|| self.hw.mode() != 0);
        info!("LGY: legacy mode 0x{:X} ready", self.hw.mode());
        Ok(())
    }

    /// Starts the legacy core. There is no way back.
    pub fn switch_mode(&self) {
        self.hw.set_mode(LGY_MODE_START);
    }

    /// # Errors
    /// [`Error::GbaRtc`] if the RTC rejected the values.
    pub fn set_rtc(&self, rtc: GbaRtc) -> Result<()> {
        Error::check(self.pxi.send_cmd(cmd9::SET_GBA_RTC, &rtc.to_words())?)
    }

    /// # Errors
    /// PXI failures or the ARM9 failing to read the RTC.
    pub fn get_rtc(&self) -> Result<GbaRtc> {
        let addr = self.scratch.addr() + RTC_OFFSET as u32;
        Error::check(self.pxi.send_cmd(cmd9::GET_GBA_RTC, &[addr, RTC_SIZE as u32])?)?;

        let mut out = [0; RTC_SIZE];
        self.scratch.read(RTC_OFFSET, &mut out)?;
        Ok(GbaRtc::from_bytes(out))
    }

    /// Has the ARM9 write the save to the card if it changed.
    ///
    /// # Errors
    /// The ARM9 failing to write the save.
    pub fn backup_save(&self) -> Result<()> {
        Error::check(self.pxi.send_cmd(cmd9::BACKUP_GBA_SAVE, &[])?)
    }

    /// Last backup before shutdown.
    ///
    /// # Errors
    /// See [`Self::backup_save`].
    pub fn deinit(&self) -> Result<()> {
        self.backup_save()
    }

    /// Tells the ARM9 to write the save back and get ready for power off.
    /// The ARM9 stops serving commands afterwards.
    ///
    /// # Errors
    /// The final backup failing.
    pub fn prepare_power(&self) -> Result<()> {
        Error::check(self.pxi.send_cmd(cmd9::PREPARE_POWER, &[])?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, thread};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        drivers::ipc::{CommandHandler, IpcCmd, IpcRequest},
        error::code,
        hardware::{
            Soc,
            lgy9::{LGY_MODE_AGB, Lgy9},
            mem::{IPC_SCRATCH_ADDR, IPC_SCRATCH_SIZE, PhysMem},
            pxi::Cpu,
        },
    };

    /// Stands in for the ARM9: records requests and answers like it would.
    struct FakeArm9 {
        mem: Arc<PhysMem>,
        lgy: Arc<Lgy9>,
        seen: Mutex<Vec<(IpcCmd, Vec<u32>)>>,
        path: Mutex<String>,
        rtc_result: u32,
    }

    impl CommandHandler for FakeArm9 {
        fn handle(&self, req: &IpcRequest) -> Option<u32> {
            self.seen.lock().unwrap().push((req.cmd, req.words.clone()));
            match req.cmd {
                cmd9::PREPARE_GBA => {
                    let b = req.send_buf(0);
                    let raw = self.mem.read_vec(b.addr, b.size as usize).unwrap();
                    *self.path.lock().unwrap() = String::from_utf8(raw).unwrap();
                    self.lgy.regs().mode = LGY_MODE_AGB;
                    Some(code::OK)
                }
                cmd9::SET_GBA_RTC => Some(self.rtc_result),
                cmd9::GET_GBA_RTC => {
                    let b = req.recv_buf(0);
                    let rtc = GbaRtc {
                        time: 0x0030_1512,
                        date: 0x0012_0624,
                    };
                    self.mem.write(b.addr, &rtc.to_bytes()).unwrap();
                    Some(code::OK)
                }
                cmd9::BACKUP_GBA_SAVE => Some(code::OK),
                _ => None,
            }
        }

        fn protocol_error(&self, _reason: &str) {}
    }

    struct Rig {
        soc: Soc,
        arm9: Arc<FakeArm9>,
        _pxi9: PxiDriver,
        lgy: Lgy11Driver,
    }

    fn rig(rtc_result: u32) -> Rig {
        let soc = Soc::new();
        let arm9 = Arc::new(FakeArm9 {
            mem: Arc::clone(&soc.mem),
            lgy: Arc::clone(&soc.lgy9),
            seen: Mutex::new(Vec::new()),
            path: Mutex::new(String::new()),
            rtc_result,
        });
        let pxi9 = {
            let port = soc.pxi.port(Cpu::Arm9);
            let irq = Arc::clone(&soc.arm9_irq);
            let h: Arc<dyn CommandHandler> = Arc::clone(&arm9) as _;
            thread::spawn(move || PxiDriver::init(port, &irq, h).unwrap())
        };
        let pxi11 = PxiDriver::init(soc.pxi.port(Cpu::Arm11), &soc.arm11_irq, Arc::clone(&arm9) as _).unwrap();
        let scratch = SharedRegion::new(Arc::clone(&soc.mem), IPC_SCRATCH_ADDR, IPC_SCRATCH_SIZE);
        let lgy = Lgy11Driver::new(Arc::new(pxi11), Arc::clone(&soc.lgy11), scratch).unwrap();
        Rig {
            _pxi9: pxi9.join().unwrap(),
            soc,
            arm9,
            lgy,
        }
    }

    #[test]
    fn prepare_sends_path_and_flags_then_sets_the_rtc() {
        let r = rig(code::OK);
        r.lgy
            .prepare_gba_mode(false, SaveType::Flash1mMrx, "sdmc:/3ds/game.sav")
            .unwrap();

        assert_eq!(*r.arm9.path.lock().unwrap(), "sdmc:/3ds/game.sav\0");
        let seen = r.arm9.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, cmd9::PREPARE_GBA);
        assert_eq!(seen[0].1, vec![IPC_SCRATCH_ADDR, 19, 0, SaveType::Flash1mMrx as u32]);
        assert_eq!(seen[1].0, cmd9::SET_GBA_RTC);
        assert_eq!(r.soc.lgy11.mode(), LGY_MODE_AGB);
    }

    #[test]
    fn rtc_failure_does_not_fail_prepare() {
        let r = rig(code::GBA_RTC_ERR);
        r.lgy.prepare_gba_mode(true, SaveType::None, "x.sav").unwrap();
        assert!(matches!(r.lgy.set_rtc(GbaRtc::default()), Err(Error::GbaRtc)));
    }

    #[test]
    fn get_rtc_reads_the_reply_buffer() {
        let r = rig(code::OK);
        let rtc = r.lgy.get_rtc().unwrap();
        assert_eq!((rtc.hour(), rtc.min(), rtc.sec()), (0x12, 0x15, 0x30));
        assert_eq!((rtc.year(), rtc.mon(), rtc.day()), (0x24, 0x06, 0x12));
    }

    #[test]
    fn switch_mode_sets_start() {
        let r = rig(code::OK);
        r.lgy.switch_mode();
        assert!(r.soc.lgy11.started());
        r.lgy.deinit().unwrap();
        assert_eq!(r.arm9.seen.lock().unwrap()[0].0, cmd9::BACKUP_GBA_SAVE);
    }

    #[test]
    fn overlong_path_never_reaches_the_arm9() {
        let r = rig(code::OK);
        let path = "a".repeat(SAVE_PATH_MAX + 1);
        assert!(matches!(
            r.lgy.prepare_gba_mode(false, SaveType::None, &path),
            Err(Error::InvalidArg(_))
        ));
        assert!(r.arm9.seen.lock().unwrap().is_empty());
    }
}
