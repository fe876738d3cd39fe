//! ARM9 side of the firmware.
//!
//! The ARM9 owns the legacy block setup, the save and the legacy RTC. After
//! boot it only serves PXI commands from the ARM11 until it is told to get
//! ready for power off, or until it halts.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::{
    drivers::{
        ipc::{CommandHandler, IpcRequest, cmd9},
        lgy9::Lgy9Driver,
        pxi::PxiDriver,
    },
    error::{Error, Result, result_code},
    fs::FileSystem,
    hardware::{Soc, mem::PhysMem, pxi::Cpu},
    kernel::Event,
    panic::{Arm9Panic, HaltState},
    rtc::GbaRtc,
    save_type::SaveType,
};

struct Arm9Handler {
    lgy: Lgy9Driver,
    mem: Arc<PhysMem>,
    panic: Arm9Panic,
    power_off: Arc<Event>,
}

impl Arm9Handler {
    fn prepare_gba(&self, req: &IpcRequest) -> Result<()> {
        let buf = req.send_buf(0);
        let raw = self.mem.read_vec(buf.addr, buf.size as usize)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let path = std::str::from_utf8(&raw[..end]).map_err(|_| Error::InvalidArg("save path is not UTF-8"))?;

        let &[direct_boot, save_type] = req.params() else {
            return Err(Error::InvalidArg("PREPARE_GBA takes two parameters"));
        };
        let save_type = SaveType::try_from(u8::try_from(save_type).unwrap_or(u8::MAX))?;
        self.lgy.prepare_gba_mode(direct_boot != 0, save_type, path)
    }

    fn get_rtc(&self, req: &IpcRequest) -> Result<()> {
        let out = req.recv_buf(0);
        let rtc = self.lgy.get_rtc()?.to_bytes();
        if (out.size as usize) < rtc.len() {
            return Err(Error::InvalidArg("RTC buffer too small"));
        }
        self.mem.write(out.addr, &rtc)
    }
}

impl CommandHandler for Arm9Handler {
    fn handle(&self, req: &IpcRequest) -> Option<u32> {
        let res = match req.cmd {
            cmd9::PREPARE_GBA => self.prepare_gba(req),
            cmd9::SET_GBA_RTC => match *req.params() {
                [time, date] => self.lgy.set_rtc(GbaRtc { time, date }),
                _ => Err(Error::InvalidArg("SET_GBA_RTC takes two parameters")),
            },
            cmd9::GET_GBA_RTC => self.get_rtc(req),
            cmd9::BACKUP_GBA_SAVE => self.lgy.backup_save().map(drop),
            cmd9::PREPARE_POWER => {
                let res = self.lgy.backup_save().map(drop);
                info!("ARM9: ready for power off");
                self.power_off.signal();
                res
            }
            _ => return None,
        };

        if let Err(e) = &res {
            error!("ARM9: {:?} failed: {e}", req.cmd);
        }
        debug!("ARM9: {:?} -> {}", req.cmd, result_code(&res));
        Some(result_code(&res))
    }

    fn protocol_error(&self, reason: &str) {
        let _ = self.panic.halt(reason);
        self.power_off.signal();
    }
}

/// The booted ARM9.
pub struct Arm9 {
    _pxi: PxiDriver,
    handler: Arc<Arm9Handler>,
}

impl Arm9 {
    /// Brings up PXI. Blocks until the ARM11 side is up as well.
    ///
    /// # Errors
    /// If the PXI interrupts are already taken.
    pub fn boot(soc: &Soc, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let handler = Arc::new(Arm9Handler {
            lgy: Lgy9Driver::new(Arc::clone(&soc.lgy9), Arc::clone(&soc.mem), fs),
            mem: Arc::clone(&soc.mem),
            panic: Arm9Panic::new(Arc::clone(&soc.arm9_irq), soc.pxi.port(Cpu::Arm9), Arc::clone(&soc.mem)),
            power_off: Event::new(),
        });
        let pxi = PxiDriver::init(
            soc.pxi.port(Cpu::Arm9),
            &soc.arm9_irq,
            Arc::clone(&handler) as Arc<dyn CommandHandler>,
        )?;
        info!("ARM9: booted");
        Ok(Self { _pxi: pxi, handler })
    }

    #[must_use]
    pub fn halt_state(&self) -> &Arc<HaltState> {
        self.handler.panic.state()
    }

    /// Serves the ARM11 until power off. Dropping the result shuts the PXI
    /// link down.
    ///
    /// # Errors
    /// [`Error::Halted`] if the ARM9 halted instead.
    pub fn run(self) -> Result<()> {
        self.handler.power_off.wait()?;
        if let Some(reason) = self.halt_state().reason() {
            return Err(Error::Halted(reason.to_owned()));
        }
        info!("ARM9: powered off");
        Ok(())
    }
}
