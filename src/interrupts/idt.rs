//! Interrupt Descriptor Table and the per-vector entry stubs.

use super::dispatch::excp_handler;
use super::frame::TrapFrame;
use super::{pic, DescriptorTableRegister, KERNEL_CS};
use crate::x86;
use bitflags::bitflags;
use core::arch::{asm, global_asm};
use core::mem::{offset_of, size_of};
use spin::Once;

bitflags! {
    /// P, DPL, 0, Type
    pub struct GateFlags: u8 {
        const INTERRUPT_GATE = 0b1110;
        const TRAP_GATE = 0b1111;
        const RING_0 = 0 << 5;
        const RING_3 = 3 << 5;
        const PRESENT = 1 << 7;

        const KERNEL_TRAP = Self::PRESENT.bits | Self::RING_0.bits | Self::TRAP_GATE.bits;
        const KERNEL_INTERRUPT = Self::PRESENT.bits | Self::RING_0.bits | Self::INTERRUPT_GATE.bits;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtDescriptor {
    offset_15_0: u16,
    segment_selector: u16,
    // Bits 0..2: IST, rest is 0
    ist: u8,
    attributes: GateFlags,
    offset_31_16: u16,
    offset_63_32: u32,
    _reserved: u32,
}

impl IdtDescriptor {
    pub const MISSING: Self = Self {
        offset_15_0: 0,
        segment_selector: 0,
        ist: 0,
        attributes: GateFlags::empty(),
        offset_31_16: 0,
        offset_63_32: 0,
        _reserved: 0,
    };

    pub fn new(handler: u64, ist: u8, attributes: GateFlags) -> Self {
        let addr = handler;
        Self {
            offset_15_0: addr as u16,
            offset_31_16: (addr >> 16) as u16,
            offset_63_32: (addr >> 32) as u32,
            segment_selector: KERNEL_CS,
            ist: ist & 0b111,
            attributes,
            _reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        (self.offset_63_32 as u64) << 32 | (self.offset_31_16 as u64) << 16 | self.offset_15_0 as u64
    }

    pub fn attributes(&self) -> GateFlags {
        self.attributes
    }

    pub fn selector(&self) -> u16 {
        self.segment_selector
    }

    pub fn ist(&self) -> u8 {
        self.ist
    }
}

pub const NB_ENTRIES: usize = 256;
/// Vectors below this are CPU exceptions.
pub const EXCEPTION_VECTORS: usize = 32;

#[repr(C, align(16))]
pub struct Idt {
    gates: [IdtDescriptor; NB_ENTRIES],
}

impl Idt {
    /// Exceptions get trap gates, everything else interrupt gates.
    pub fn new(handlers: &[u64; NB_ENTRIES]) -> Self {
        let mut gates = [IdtDescriptor::MISSING; NB_ENTRIES];
        for (vector, (gate, &handler)) in gates.iter_mut().zip(handlers.iter()).enumerate() {
            let attributes = if vector < EXCEPTION_VECTORS {
                GateFlags::KERNEL_TRAP
            } else {
                GateFlags::KERNEL_INTERRUPT
            };
            *gate = IdtDescriptor::new(handler, 0, attributes);
        }
        Self { gates }
    }

    pub fn gate(&self, vector: u8) -> &IdtDescriptor {
        &self.gates[vector as usize]
    }

    pub fn register(&self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            limit: (size_of::<Idt>() - 1) as u16,
            base: self as *const Idt as u64,
        }
    }

    pub fn load(&'static self) {
        let register_format = self.register();
        unsafe {
            asm!("lidt [{}]", in(reg) &register_format, options(readonly, nostack, preserves_flags));
        }
    }
}

extern "C" {
    /// Entry stub addresses, one per vector, emitted below.
    static isr_table: [u64; NB_ENTRIES];
}

static IDT: Once<Idt> = Once::new();

/// Install all 256 gates, load the table and unmask interrupts.
pub fn init() {
    let idt = IDT.call_once(|| Idt::new(unsafe { &isr_table }));
    idt.load();
    trace!("page fault gate {:#x?}", idt.gate(14));

    // Nothing handles device IRQs yet: park the PIC lines at 0x20..0x30, masked.
    pic::init();
    x86::sti();
}

pub fn loaded() -> Option<&'static Idt> {
    IDT.r#try()
}

/// What IDTR currently holds.
pub fn current_register() -> DescriptorTableRegister {
    let mut register = DescriptorTableRegister { limit: 0, base: 0 };
    unsafe {
        asm!("sidt [{}]", in(reg) &mut register, options(nostack, preserves_flags));
    }
    register
}

// Every stub leaves the stack as `[error code] vector` on top of the CPU frame,
// so the common path sees one layout. Vectors where the CPU pushes no error
// code get a zero in its place.
global_asm!(
    r#"
.pushsection .data.isr_table, "aw"
.balign 8
.global isr_table
isr_table:
.popsection

.macro isr_stub vec, has_err
    .balign 16
2:
    .if \has_err == 0
    pushq $0
    .endif
    pushq $\vec
    jmp isr_common
    .pushsection .data.isr_table, "aw"
    .quad 2b
    .popsection
.endm

.section .text
isr_stub 0, 0
isr_stub 1, 0
isr_stub 2, 0
isr_stub 3, 0
isr_stub 4, 0
isr_stub 5, 0
isr_stub 6, 0
isr_stub 7, 0
isr_stub 8, 1
isr_stub 9, 0
isr_stub 10, 1
isr_stub 11, 1
isr_stub 12, 1
isr_stub 13, 1
isr_stub 14, 1
isr_stub 15, 0
isr_stub 16, 0
isr_stub 17, 1
isr_stub 18, 0
isr_stub 19, 0
isr_stub 20, 0
isr_stub 21, 1
isr_stub 22, 0
isr_stub 23, 0
isr_stub 24, 0
isr_stub 25, 0
isr_stub 26, 0
isr_stub 27, 0
isr_stub 28, 0
isr_stub 29, 1
isr_stub 30, 1
isr_stub 31, 0

.set isr_vector, 32
.rept 224
isr_stub isr_vector, 0
.set isr_vector, isr_vector + 1
.endr

.balign 16
isr_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15

    movq %cr4, %rax
    pushq %rax
    movq %cr3, %rax
    pushq %rax
    movq %cr2, %rax
    pushq %rax
    movq %cr0, %rax
    pushq %rax

    xorl %eax, %eax
    movw %gs, %ax
    pushq %rax
    movw %fs, %ax
    pushq %rax
    movw %es, %ax
    pushq %rax
    movw %ds, %ax
    pushq %rax

    movq %rsp, %rdi
    cld
    call {handler}

    # selectors and control registers
    addq $64, %rsp

    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax

    # vector and error code
    addq $16, %rsp
    iretq
"#,
    handler = sym excp_handler,
    options(att_syntax)
);

global_asm!(
    r#"
.section .text
.balign 16
.global capture_regs
capture_regs:
    movq %rax, {rax}(%rdi)
    movq %rbx, {rbx}(%rdi)
    movq %rcx, {rcx}(%rdi)
    movq %rdx, {rdx}(%rdi)
    movq %rsi, {rsi}(%rdi)
    movq %rdi, {rdi}(%rdi)
    movq %rbp, {rbp}(%rdi)
    movq %r8, {r8}(%rdi)
    movq %r9, {r9}(%rdi)
    movq %r10, {r10}(%rdi)
    movq %r11, {r11}(%rdi)
    movq %r12, {r12}(%rdi)
    movq %r13, {r13}(%rdi)
    movq %r14, {r14}(%rdi)
    movq %r15, {r15}(%rdi)

    xorl %eax, %eax
    movw %cs, %ax
    movq %rax, {cs}(%rdi)
    movw %ss, %ax
    movq %rax, {ss}(%rdi)
    movw %ds, %ax
    movq %rax, {ds}(%rdi)
    movw %es, %ax
    movq %rax, {es}(%rdi)
    movw %fs, %ax
    movq %rax, {fs}(%rdi)
    movw %gs, %ax
    movq %rax, {gs}(%rdi)

    movq %cr0, %rax
    movq %rax, {cr0}(%rdi)
    movq %cr2, %rax
    movq %rax, {cr2}(%rdi)
    movq %cr3, %rax
    movq %rax, {cr3}(%rdi)
    movq %cr4, %rax
    movq %rax, {cr4}(%rdi)

    pushfq
    popq %rax
    movq %rax, {rflags}(%rdi)

    # the caller's view: just past our return address
    leaq 8(%rsp), %rax
    movq %rax, {rsp}(%rdi)
    movq (%rsp), %rax
    movq %rax, {rip}(%rdi)

    movq {rax}(%rdi), %rax
    ret
"#,
    rax = const offset_of!(TrapFrame, rax),
    rbx = const offset_of!(TrapFrame, rbx),
    rcx = const offset_of!(TrapFrame, rcx),
    rdx = const offset_of!(TrapFrame, rdx),
    rsi = const offset_of!(TrapFrame, rsi),
    rdi = const offset_of!(TrapFrame, rdi),
    rbp = const offset_of!(TrapFrame, rbp),
    r8 = const offset_of!(TrapFrame, r8),
    r9 = const offset_of!(TrapFrame, r9),
    r10 = const offset_of!(TrapFrame, r10),
    r11 = const offset_of!(TrapFrame, r11),
    r12 = const offset_of!(TrapFrame, r12),
    r13 = const offset_of!(TrapFrame, r13),
    r14 = const offset_of!(TrapFrame, r14),
    r15 = const offset_of!(TrapFrame, r15),
    cs = const offset_of!(TrapFrame, cs),
    ss = const offset_of!(TrapFrame, ss),
    ds = const offset_of!(TrapFrame, ds),
    es = const offset_of!(TrapFrame, es),
    fs = const offset_of!(TrapFrame, fs),
    gs = const offset_of!(TrapFrame, gs),
    cr0 = const offset_of!(TrapFrame, cr0),
    cr2 = const offset_of!(TrapFrame, cr2),
    cr3 = const offset_of!(TrapFrame, cr3),
    cr4 = const offset_of!(TrapFrame, cr4),
    rflags = const offset_of!(TrapFrame, rflags),
    rsp = const offset_of!(TrapFrame, rsp),
    rip = const offset_of!(TrapFrame, rip),
    options(att_syntax)
);

#[cfg(test)]
mod test {
    use super::*;

    fn fake_handlers() -> [u64; NB_ENTRIES] {
        let mut handlers = [0; NB_ENTRIES];
        for (vector, handler) in handlers.iter_mut().enumerate() {
            *handler = 0xffff_ffff_8000_0000 + vector as u64 * 16;
        }
        handlers
    }

    #[test]
    fn descriptor_layout() {
        assert_eq!(size_of::<IdtDescriptor>(), 16);
        assert_eq!(size_of::<Idt>(), 16 * NB_ENTRIES);
    }

    #[test]
    fn exceptions_get_trap_gates() {
        let idt = Idt::new(&fake_handlers());
        for vector in 0..EXCEPTION_VECTORS as u8 {
            assert_eq!(idt.gate(vector).attributes().bits(), 0b1000_1111);
        }
    }

    #[test]
    fn everything_else_gets_interrupt_gates() {
        let idt = Idt::new(&fake_handlers());
        for vector in EXCEPTION_VECTORS as u8..=u8::MAX {
            assert_eq!(idt.gate(vector).attributes().bits(), 0b1000_1110);
        }
    }

    #[test]
    fn no_gate_is_missing() {
        let idt = Idt::new(&fake_handlers());
        for vector in 0..=u8::MAX {
            let gate = idt.gate(vector);
            assert!(gate.attributes().contains(GateFlags::PRESENT));
            assert_eq!(gate.selector(), KERNEL_CS);
            assert_eq!(gate.ist(), 0);
            assert_ne!(gate.handler(), 0);
        }
    }

    #[test]
    fn handler_address_round_trips() {
        for addr in [
            0,
            0x1234,
            0xdead_beef,
            0x1_0000_0000,
            0x0000_7fff_ffff_f000,
            0xffff_ffff_8010_2030,
            u64::MAX,
        ] {
            let gate = IdtDescriptor::new(addr, 0, GateFlags::KERNEL_INTERRUPT);
            assert_eq!(gate.handler(), addr);
        }
    }

    #[test]
    fn register_covers_the_whole_table() {
        let idt = Idt::new(&fake_handlers());
        let register = idt.register();
        let limit = register.limit;
        let base = register.base;
        assert_eq!(limit, 4095);
        assert_eq!(base, &idt as *const Idt as u64);
    }
}
