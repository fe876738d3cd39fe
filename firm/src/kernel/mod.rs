//! The small slice of an RTOS the drivers need: interrupt routing, events and
//! busy polling.

pub mod event;
pub mod irq;

pub use event::{Event, spin_until};
pub use irq::{CriticalSection, Irq, IrqController, IsrRegistration};
