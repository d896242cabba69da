//! Manage x86 segmentation and interrupts.

use crate::x86;

/// Format for use by LIDT and LGDT
#[repr(C, packed(2))]
pub struct DescriptorTableRegister {
    /// Size of the DT in bytes, minus one.
    pub limit: u16,
    // Base address of the DT.
    pub base: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Ring {
    Ring0 = 0,
    Ring3 = 3,
}

// Segment selectors (4.5 AMD64 manual)
pub type SegmentSelector = u16;
const fn new_segment(index: u16, rpl: Ring) -> SegmentSelector {
    index << 3 | (rpl as u16)
}

pub const KERNEL_CS: SegmentSelector = new_segment(1, Ring::Ring0);
pub const KERNEL_DS: SegmentSelector = new_segment(2, Ring::Ring0);
pub const USER_CS: SegmentSelector = new_segment(3, Ring::Ring3);
pub const USER_DS: SegmentSelector = new_segment(4, Ring::Ring3);

pub mod dispatch;
pub mod frame;
pub mod gdt;
pub mod idt;
pub mod pic;

pub use frame::TrapFrame;

/// Bring up segmentation and interrupt dispatch.
/// Interrupts stay masked until the IDT is complete.
pub fn init() {
    x86::cli();
    debug!("Initializing GDT");
    gdt::init();
    debug!("Initializing IDT");
    idt::init();
}
