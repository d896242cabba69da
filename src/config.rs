//! Build-time configuration.

use crate::framebuffer::Color;
use crate::logger::Level;

pub const KERNEL_NAME: &str = "Sphynx";
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Records below this level are dropped.
pub const LOG_LEVEL: Level = Level::Debug;

/// UART used as the primary log sink.
pub const SERIAL_PORT: u16 = 0x3f8;
pub const SERIAL_BAUD: u32 = 115_200;
/// QEMU/Bochs debug console.
pub const DEBUG_CON_PORT: u16 = 0xe9;

pub const PANIC_FOREGROUND: Color = Color::Red;
pub const PANIC_BACKGROUND: Color = Color::Black;

/// Full register dump unless the `simple-panic` feature is on.
pub const VERBOSE_PANIC: bool = !cfg!(feature = "simple-panic");
