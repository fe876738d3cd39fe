#[allow(clippy::module_name_repetitions)]
pub mod arm9;
#[allow(clippy::module_name_repetitions)]
pub mod arm11;

#[allow(clippy::cast_possible_truncation)]
pub mod bitmap;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_possible_wrap)]
mod bitwise;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_sign_loss)]
#[allow(clippy::unreadable_literal)]
pub mod color;
pub mod config;
pub mod core1;
pub mod drivers;
pub mod error;
pub mod fs;

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_lossless)]
#[allow(clippy::large_stack_frames)]
#[allow(clippy::unreadable_literal)]
pub mod hardware;
pub mod hid;
pub mod kernel;
pub mod panic;
pub mod rom;

#[allow(clippy::cast_possible_truncation)]
pub mod rtc;
pub mod save_type;
pub mod session;

#[allow(clippy::cast_possible_truncation)]
pub mod video;
