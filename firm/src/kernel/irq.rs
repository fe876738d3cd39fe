//! Interrupt controller of one CPU.
//!
//! Handlers are keyed by [`Irq`] and stay installed for as long as the
//! returned [`IsrRegistration`] lives. A raised line is delivered on the
//! raising context, like an ISR pre-empting whatever was running. While a
//! [`CriticalSection`] is held, raised lines are latched and delivered when
//! the last section on this CPU ends.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::error::{Error, Result};

/// Interrupt lines, numbered after the ARM11 interrupt ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Irq {
    /// Inter-processor interrupt used by core 1 to report a converted frame.
    Ipi15 = 15,
    Psc0 = 0x28,
    Psc1 = 0x29,
    Pdc0 = 0x2A,
    Pdc1 = 0x2B,
    Ppf = 0x2C,
    P3d = 0x2D,
    CdmaEvent0 = 0x30,
    CdmaEvent1 = 0x31,
    CdmaEvent2 = 0x32,
    CdmaEvent3 = 0x33,
    CdmaEvent4 = 0x34,
    CdmaEvent5 = 0x35,
    CdmaEvent6 = 0x36,
    CdmaEvent7 = 0x37,
    CdmaEvent8 = 0x38,
    CdmaFault = 0x3A,
    LgyCapTop = 0x4C,
    PxiSync = 0x50,
    PxiSendFifoEmpty = 0x52,
    PxiRecvFifoNotEmpty = 0x53,
}

impl Irq {
    const CDMA_EVENTS: [Self; 9] = [
        Self::CdmaEvent0,
        Self::CdmaEvent1,
        Self::CdmaEvent2,
        Self::CdmaEvent3,
        Self::CdmaEvent4,
        Self::CdmaEvent5,
        Self::CdmaEvent6,
        Self::CdmaEvent7,
        Self::CdmaEvent8,
    ];

    /// Line raised by `DMASEV event` on the DMA-330.
    #[must_use]
    pub fn cdma_event(event: u8) -> Option<Self> {
        Self::CDMA_EVENTS.get(usize::from(event)).copied()
    }

    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

type Handler = Arc<dyn Fn(Irq) + Send + Sync>;

#[derive(Default)]
struct State {
    handlers: HashMap<Irq, Handler>,
    masked: u32,
    latched: Vec<Irq>,
}

pub struct IrqController {
    cpu: &'static str,
    state: Mutex<State>,
}

impl fmt::Debug for IrqController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqController").field("cpu", &self.cpu).finish_non_exhaustive()
    }
}

impl IrqController {
    #[must_use]
    pub fn new(cpu: &'static str) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            state: Mutex::new(State::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Handlers never run under this lock, a poisoned lock only means a
        // panicking thread held it for a map update.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `handler` for `irq`.
    ///
    /// # Errors
    /// [`Error::IrqInUse`] if the line already has a handler.
    pub fn register<F>(self: &Arc<Self>, irq: Irq, handler: F) -> Result<IsrRegistration>
    where
        F: Fn(Irq) + Send + Sync + 'static,
    {
        let mut state = self.state();
        if state.handlers.contains_key(&irq) {
            return Err(Error::IrqInUse(irq));
        }
        state.handlers.insert(irq, Arc::new(handler));
        debug!("{}: registered {irq:?}", self.cpu);

        Ok(IsrRegistration {
            ctrl: Arc::clone(self),
            irq,
        })
    }

    #[must_use]
    pub fn is_registered(&self, irq: Irq) -> bool {
        self.state().handlers.contains_key(&irq)
    }

    fn unregister(&self, irq: Irq) {
        self.state().handlers.remove(&irq);
        debug!("{}: unregistered {irq:?}", self.cpu);
    }

    /// Asserts `irq`. Lines without a handler are dropped.
    pub fn raise(&self, irq: Irq) {
        let handler = {
            let mut state = self.state();
            if state.masked > 0 {
                if !state.latched.contains(&irq) {
                    state.latched.push(irq);
                }
                return;
            }
            state.handlers.get(&irq).cloned()
        };

        if let Some(handler) = handler {
            handler(irq);
        }
    }

    /// Masks delivery until the returned guard is dropped.
    #[must_use = "interrupts are unmasked again when the guard is dropped"]
    pub fn critical_section(self: &Arc<Self>) -> CriticalSection {
        self.state().masked += 1;
        CriticalSection {
            ctrl: Arc::clone(self),
        }
    }

    fn leave_critical_section(&self) {
        let pending = {
            let mut state = self.state();
            state.masked = state.masked.saturating_sub(1);
            if state.masked > 0 {
                return;
            }
            std::mem::take(&mut state.latched)
        };

        for irq in pending {
            self.raise(irq);
        }
    }
}

/// Keeps a handler installed. Dropping it unregisters the handler.
#[must_use = "the handler is unregistered when the registration is dropped"]
pub struct IsrRegistration {
    ctrl: Arc<IrqController>,
    irq: Irq,
}

impl IsrRegistration {
    #[must_use]
    pub const fn irq(&self) -> Irq {
        self.irq
    }
}

impl fmt::Debug for IsrRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IsrRegistration").field(&self.irq).finish()
    }
}

impl Drop for IsrRegistration {
    fn drop(&mut self) {
        self.ctrl.unregister(self.irq);
    }
}

/// Interrupts of one CPU are masked while this guard lives.
pub struct CriticalSection {
    ctrl: Arc<IrqController>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.ctrl.leave_critical_section();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn register_twice_fails() {
        let ctrl = IrqController::new("arm11");
        let _reg = ctrl.register(Irq::Ppf, |_| {}).unwrap();
        assert!(matches!(ctrl.register(Irq::Ppf, |_| {}), Err(Error::IrqInUse(Irq::Ppf))));
    }

    #[test]
    fn drop_unregisters() {
        let ctrl = IrqController::new("arm11");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let reg = ctrl
            .register(Irq::P3d, move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        ctrl.raise(Irq::P3d);
        drop(reg);
        ctrl.raise(Irq::P3d);

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!ctrl.is_registered(Irq::P3d));
    }

    #[test]
    fn critical_section_latches_once() {
        let ctrl = IrqController::new("arm9");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let _reg = ctrl
            .register(Irq::PxiSync, move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        {
            let _outer = ctrl.critical_section();
            {
                let _inner = ctrl.critical_section();
                ctrl.raise(Irq::PxiSync);
                ctrl.raise(Irq::PxiSync);
            }
            assert_eq!(hits.load(Ordering::Relaxed), 0);
        }

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cdma_event_lines() {
        assert_eq!(Irq::cdma_event(0), Some(Irq::CdmaEvent0));
        assert_eq!(Irq::cdma_event(8).map(Irq::id), Some(0x38));
        assert_eq!(Irq::cdma_event(9), None);
    }
}
