//! ARM11 side of the legacy block.
//!
//! The mode register reads back the mode the ARM9 selected. Writing
//! [`LGY_MODE_START`] hands the console over to the legacy core.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::info;

use super::lgy9::{LGY_MODE_START, Lgy9};

#[derive(Debug)]
pub struct Lgy11 {
    arm9: Arc<Lgy9>,
    started: AtomicBool,
}

impl Lgy11 {
    #[must_use]
    pub const fn new(arm9: Arc<Lgy9>) -> Self {
        Self {
            arm9,
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        let start = if self.started() { LGY_MODE_START } else { 0 };
        self.arm9.regs().mode & !LGY_MODE_START | start
    }

    pub fn set_mode(&self, value: u16) {
        if value & LGY_MODE_START != 0 && !self.started.swap(true, Ordering::AcqRel) {
            info!("LGY: legacy core started");
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hardware::lgy9::LGY_MODE_AGB;

    #[test]
    fn mode_mirrors_the_arm9_selection() {
        let arm9 = Arc::new(Lgy9::new());
        let lgy = Lgy11::new(Arc::clone(&arm9));
        assert_eq!(lgy.mode(), 0);

        arm9.regs().mode = LGY_MODE_AGB;
        assert_eq!(lgy.mode(), LGY_MODE_AGB);

        lgy.set_mode(LGY_MODE_START);
        assert!(lgy.started());
        assert_eq!(lgy.mode(), LGY_MODE_AGB | LGY_MODE_START);
    }
}
