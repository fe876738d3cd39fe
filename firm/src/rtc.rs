//! Real-time clock values.
//!
//! Everything is BCD, the way the console RTC and the legacy RTC keep it.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

/// Console RTC reading, all fields BCD, `year` is years since 2000.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtcTimeDate {
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    /// Day of week, 0 is Sunday.
    pub dow: u8,
    pub day: u8,
    pub mon: u8,
    pub year: u8,
}

#[must_use]
pub const fn to_bcd(v: u8) -> u8 {
    (v / 10) << 4 | v % 10
}

#[must_use]
pub const fn from_bcd(v: u8) -> u8 {
    (v >> 4) * 10 + (v & 0xF)
}

impl RtcTimeDate {
    #[must_use]
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            sec: to_bcd(dt.second() as u8),
            min: to_bcd(dt.minute() as u8),
            hour: to_bcd(dt.hour() as u8),
            dow: dt.weekday().num_days_from_sunday() as u8,
            day: to_bcd(dt.day() as u8),
            mon: to_bcd(dt.month() as u8),
            year: to_bcd(dt.year().rem_euclid(100) as u8),
        }
    }

    /// Host local time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }
}

/// The two legacy RTC register words.
///
/// ```text
/// time: hour | min << 8 | sec << 16
/// date: year | mon << 8 | day << 16 | dow << 24
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GbaRtc {
    pub time: u32,
    pub date: u32,
}

impl GbaRtc {
    #[must_use]
    pub const fn hour(self) -> u8 {
        self.time as u8
    }

    #[must_use]
    pub const fn min(self) -> u8 {
        (self.time >> 8) as u8
    }

    #[must_use]
    pub const fn sec(self) -> u8 {
        (self.time >> 16) as u8
    }

    #[must_use]
    pub const fn year(self) -> u8 {
        self.date as u8
    }

    #[must_use]
    pub const fn mon(self) -> u8 {
        (self.date >> 8) as u8
    }

    #[must_use]
    pub const fn day(self) -> u8 {
        (self.date >> 16) as u8
    }

    #[must_use]
    pub fn to_words(self) -> [u32; 2] {
        [self.time, self.date]
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0; 8];
        out[..4].copy_from_slice(&self.time.to_le_bytes());
        out[4..].copy_from_slice(&self.date.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            time: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            date: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        }
    }
}

impl From<RtcTimeDate> for GbaRtc {
    // Day of week is left 0, the legacy RTC does not need it.
    fn from(td: RtcTimeDate) -> Self {
        Self {
            time: u32::from(td.hour) | u32::from(td.min) << 8 | u32::from(td.sec) << 16,
            date: u32::from(td.year) | u32::from(td.mon) << 8 | u32::from(td.day) << 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn bcd() {
        assert_eq!(to_bcd(59), 0x59);
        assert_eq!(from_bcd(0x23), 23);
        for v in 0..100 {
            assert_eq!(from_bcd(to_bcd(v)), v);
        }
    }

    #[test]
    fn gba_words() {
        let dt = NaiveDate::from_ymd_opt(2024, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 30)
            .unwrap();
        let td = RtcTimeDate::from_datetime(&dt);
        assert_eq!(td.dow, 2);

        let rtc = GbaRtc::from(td);
        assert_eq!(rtc.time, 0x0030_5923);
        assert_eq!(rtc.date, 0x0031_1224);
        assert_eq!(GbaRtc::from_bytes(rtc.to_bytes()), rtc);
        assert_eq!((rtc.hour(), rtc.min(), rtc.day()), (0x23, 0x59, 0x31));
    }
}
