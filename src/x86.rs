//! Wrappers around x86 instructions.
use core::arch::asm;

#[inline]
pub fn hlt() {
    unsafe {
        asm!("hlt", options(nomem, nostack));
    }
}

/// Mask maskable interrupts.
#[inline]
pub fn cli() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Unmask maskable interrupts.
#[inline]
pub fn sti() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Halt and catch fire: interrupts off, then park forever.
pub fn hcf() -> ! {
    cli();
    loop {
        hlt();
    }
}

pub fn rflags() -> u64 {
    let flags: u64;
    unsafe {
        asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags
}

/// RFLAGS.IF
pub fn interrupts_enabled() -> bool {
    rflags() & (1 << 9) != 0
}

macro_rules! read_segment {
    ($name: ident, $reg: literal) => {
        pub fn $name() -> u16 {
            let selector: u16;
            unsafe {
                asm!(concat!("mov {:x}, ", $reg), out(reg) selector, options(nomem, nostack, preserves_flags));
            }
            selector
        }
    };
}

read_segment!(cs, "cs");
read_segment!(ds, "ds");
read_segment!(es, "es");
read_segment!(ss, "ss");
