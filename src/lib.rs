//! Sphynx early hardware bring-up.
//!
//! Segmentation, interrupt dispatch, physical frame tracking and the panic
//! reporter. The kernel binary in `main.rs` wires the boot handoff to these.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

#[macro_use]
pub mod logger;

pub mod boot;
pub mod config;
pub mod console;
pub mod framebuffer;
pub mod interrupts;
pub mod io;
pub mod panic;
pub mod pmm;
#[cfg(feature = "qemu-tests")]
pub mod selftest;
pub mod serial;
pub mod x86;
