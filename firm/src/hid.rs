//! Buttons.
//!
//! [`KeyPad`] is the pad hardware (set by whoever presses buttons),
//! [`Hid`] is the driver side sampling it once per frame.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HidKeys: u32 {
        const A      = 1 << 0;
        const B      = 1 << 1;
        const SELECT = 1 << 2;
        const START  = 1 << 3;
        const RIGHT  = 1 << 4;
        const LEFT   = 1 << 5;
        const UP     = 1 << 6;
        const DOWN   = 1 << 7;
        const R      = 1 << 8;
        const L      = 1 << 9;
        const X      = 1 << 10;
        const Y      = 1 << 11;
    }
}

impl HidKeys {
    /// Combo that dumps the current frame as a screenshot.
    pub const SCREENSHOT: Self = Self::Y.union(Self::SELECT);
}

#[derive(Debug, Default)]
pub struct KeyPad {
    pressed: AtomicU32,
}

impl KeyPad {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn press(&self, keys: HidKeys) {
        self.pressed.fetch_or(keys.bits(), Ordering::Relaxed);
    }

    pub fn release(&self, keys: HidKeys) {
        self.pressed.fetch_and(!keys.bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn state(&self) -> HidKeys {
        HidKeys::from_bits_truncate(self.pressed.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub struct Hid {
    pad: Arc<KeyPad>,
    held: HidKeys,
    down: HidKeys,
    up: HidKeys,
}

impl Hid {
    #[must_use]
    pub const fn new(pad: Arc<KeyPad>) -> Self {
        Self {
            pad,
            held: HidKeys::empty(),
            down: HidKeys::empty(),
            up: HidKeys::empty(),
        }
    }

    /// Samples the pad. `down`/`up` hold the edges since the last scan.
    pub fn scan_input(&mut self) {
        let old = self.held;
        self.held = self.pad.state();
        self.down = self.held.difference(old);
        self.up = old.difference(self.held);
    }

    #[must_use]
    pub const fn held(&self) -> HidKeys {
        self.held
    }

    #[must_use]
    pub const fn down(&self) -> HidKeys {
        self.down
    }

    #[must_use]
    pub const fn up(&self) -> HidKeys {
        self.up
    }

    /// Screenshot combo held with at least one of its keys newly pressed.
    #[must_use]
    pub fn screenshot_requested(&self) -> bool {
        self.held == HidKeys::SCREENSHOT && !self.down.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn edges() {
        let pad = KeyPad::new();
        let mut hid = Hid::new(Arc::clone(&pad));

        pad.press(HidKeys::A);
        hid.scan_input();
        assert_eq!(hid.down(), HidKeys::A);

        hid.scan_input();
        assert_eq!(hid.held(), HidKeys::A);
        assert!(hid.down().is_empty());

        pad.release(HidKeys::A);
        hid.scan_input();
        assert_eq!(hid.up(), HidKeys::A);
    }

    #[test]
    fn screenshot_combo_fires_once() {
        let pad = KeyPad::new();
        let mut hid = Hid::new(Arc::clone(&pad));

        pad.press(HidKeys::Y);
        hid.scan_input();
        assert!(!hid.screenshot_requested());

        pad.press(HidKeys::SELECT);
        hid.scan_input();
        assert!(hid.screenshot_requested());

        hid.scan_input();
        assert!(!hid.screenshot_requested());
    }
}
