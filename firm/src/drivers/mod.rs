//! Drivers for the hardware blocks, written against the register model in
//! [`crate::hardware`].

#[allow(clippy::cast_possible_truncation)]
pub mod dma330;
#[allow(clippy::cast_possible_truncation)]
pub mod dma_program;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_lossless)]
pub mod gx;
pub mod ipc;
pub mod lgy9;
#[allow(clippy::cast_possible_truncation)]
pub mod lgy11;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub mod lgycap;
pub mod pxi;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_sign_loss)]
pub mod scaler;
