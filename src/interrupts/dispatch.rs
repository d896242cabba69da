//! Route a captured frame by vector.

use core::sync::atomic::{AtomicU64, Ordering};

use super::frame::{TrapFrame, NO_FRAME_VECTOR};
use super::pic::{PIC_1_OFFSET, PIC_2_OFFSET};

pub const SYSCALL_VECTOR: u8 = 0x80;
const IRQ_FIRST: u8 = PIC_1_OFFSET;
const IRQ_LAST: u8 = PIC_2_OFFSET + 7;

static EXCEPTION_NAMES: [&str; 32] = [
    "Division by Zero",
    "Debug",
    "Non-Maskable-Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid opcode",
    "Device (FPU) not available",
    "Double Fault",
    "Reserved Vector",
    "Invalid TSS",
    "Segment not present",
    "Stack Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved Vector",
    "x87 FP Exception",
    "Alignment Check",
    "Machine Check (Internal Error)",
    "SIMD FP Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved Vector",
    "Reserved Vector",
    "Reserved Vector",
    "Reserved Vector",
    "Reserved Vector",
    "Reserved Vector",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved Vector",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    /// CPU exception, always fatal for now.
    Exception(u8),
    /// Legacy PIC line, numbered from 0.
    Irq(u8),
    Syscall,
    /// Has a gate, but nobody listens.
    Unhandled(u64),
}

impl Vector {
    pub fn classify(vector: u64) -> Self {
        match u8::try_from(vector) {
            Ok(v @ 0..=0x1f) => Vector::Exception(v),
            Ok(v @ IRQ_FIRST..=IRQ_LAST) => Vector::Irq(v - IRQ_FIRST),
            Ok(SYSCALL_VECTOR) => Vector::Syscall,
            _ => Vector::Unhandled(vector),
        }
    }
}

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("Unknown Exception")
}

static LAST_VECTOR: AtomicU64 = AtomicU64::new(NO_FRAME_VECTOR);

/// Vector of the most recent trap to reach the dispatcher.
pub fn last_vector() -> u64 {
    LAST_VECTOR.load(Ordering::Relaxed)
}

/// Called by the common ISR stub with the frame it built on the stack.
///
/// # Safety
/// `frame` must point to a live, initialized [`TrapFrame`].
pub unsafe extern "C" fn excp_handler(frame: *mut TrapFrame) {
    let frame = &*frame;
    LAST_VECTOR.store(frame.vector, Ordering::Relaxed);

    match Vector::classify(frame.vector) {
        Vector::Exception(v) => crate::kpanic!(Some(frame), exception_name(v)),
        // TODO: route to device drivers once there are any.
        Vector::Irq(_) => {}
        // TODO: system call table.
        Vector::Syscall => {}
        Vector::Unhandled(_) => {}
    }
}
