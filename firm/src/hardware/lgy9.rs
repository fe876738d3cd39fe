//! ARM9 side legacy (GBA compatibility) block.
//!
//! Holds the mode register, the ARM7 vector overlay, save type and
//! timings, the save region mapping and the legacy RTC.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

pub const LGY_MODE_TWL: u16 = 1;
pub const LGY_MODE_AGB: u16 = 2;
pub const LGY_MODE_START: u16 = 1 << 15;

pub const LGY_SAVE_MAP_7: u8 = 0;
pub const LGY_SAVE_MAP_9: u8 = 1;

pub const LGY_RTC_CNT_WR: u16 = 1 << 0;
pub const LGY_RTC_CNT_RD: u16 = 1 << 1;
pub const LGY_RTC_CNT_WR_ERR: u16 = 1 << 14;
pub const LGY_RTC_CNT_BUSY: u16 = 1 << 15;

#[derive(Clone, Debug, Default)]
pub struct LgyRegs {
    pub mode: u16,
    pub a7_vector: [u32; 8],
    pub gba_save_type: u16,
    pub gba_save_map: u8,
    pub gba_rtc_cnt: u16,
    pub gba_rtc_bcd_date: u32,
    pub gba_rtc_bcd_time: u32,
    pub gba_rtc_toffset: u32,
    pub gba_rtc_doffset: u32,
    pub gba_save_timing: [u32; 4],
}

/// Legacy RTC state latched by the last successful write.
#[derive(Clone, Copy, Debug, Default)]
struct RtcLatch {
    date: u32,
    time: u32,
}

#[derive(Debug, Default)]
pub struct Lgy9 {
    regs: Mutex<LgyRegs>,
    rtc: Mutex<RtcLatch>,
}

const fn is_bcd(v: u32, max: u32) -> bool {
    v & 0xF <= 9 && v >> 4 <= 9 && v <= max
}

fn valid_bcd_time(time: u32) -> bool {
    let [h, min, s, _] = time.to_le_bytes().map(u32::from);
    is_bcd(h, 0x23) && is_bcd(min, 0x59) && is_bcd(s, 0x59)
}

fn valid_bcd_date(date: u32) -> bool {
    let [y, mon, d, _] = date.to_le_bytes().map(u32::from);
    is_bcd(y, 0x99) && is_bcd(mon, 0x12) && mon != 0 && is_bcd(d, 0x31) && d != 0
}

impl Lgy9 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regs(&self) -> MutexGuard<'_, LgyRegs> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rtc(&self) -> MutexGuard<'_, RtcLatch> {
        self.rtc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an RTC transfer. The transfer finishes before this returns,
    /// BUSY is never observed set afterwards.
    pub fn set_rtc_cnt(&self, cnt: u16) {
        let mut regs = self.regs();
        let mut rtc = self.rtc();
        regs.gba_rtc_cnt = cnt & !(LGY_RTC_CNT_BUSY | LGY_RTC_CNT_WR_ERR);

        if cnt & LGY_RTC_CNT_WR != 0 {
            if valid_bcd_time(regs.gba_rtc_bcd_time) && valid_bcd_date(regs.gba_rtc_bcd_date) {
                rtc.time = regs.gba_rtc_bcd_time;
                rtc.date = regs.gba_rtc_bcd_date;
                debug!(
                    "LGY: RTC set to date 0x{:08X} time 0x{:08X}",
                    rtc.date, rtc.time
                );
            } else {
                regs.gba_rtc_cnt |= LGY_RTC_CNT_WR_ERR;
            }
        }
        if cnt & LGY_RTC_CNT_RD != 0 {
            regs.gba_rtc_bcd_time = rtc.time;
            regs.gba_rtc_bcd_date = rtc.date;
        }
        regs.gba_rtc_cnt &= !(LGY_RTC_CNT_WR | LGY_RTC_CNT_RD);
    }

    /// Whether the running title may touch its save memory right now.
    #[must_use]
    pub fn save_owned_by_legacy(&self) -> bool {
        self.regs().gba_save_map == LGY_SAVE_MAP_7
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rtc_write_then_read() {
        let lgy = Lgy9::new();
        {
            let mut regs = lgy.regs();
            regs.gba_rtc_bcd_time = 0x0030_5912;
            regs.gba_rtc_bcd_date = 0x0031_1224;
        }
        lgy.set_rtc_cnt(LGY_RTC_CNT_WR);
        assert_eq!(lgy.regs().gba_rtc_cnt & LGY_RTC_CNT_WR_ERR, 0);

        lgy.regs().gba_rtc_bcd_time = 0;
        lgy.set_rtc_cnt(LGY_RTC_CNT_RD);
        assert_eq!(lgy.regs().gba_rtc_bcd_time, 0x0030_5912);
    }

    #[test]
    fn rtc_rejects_invalid_bcd() {
        let lgy = Lgy9::new();
        {
            let mut regs = lgy.regs();
            regs.gba_rtc_bcd_time = 0x0000_0025;
            regs.gba_rtc_bcd_date = 0x0001_0100;
        }
        lgy.set_rtc_cnt(LGY_RTC_CNT_WR);
        assert_eq!(lgy.regs().gba_rtc_cnt & LGY_RTC_CNT_WR_ERR, LGY_RTC_CNT_WR_ERR);
    }
}
