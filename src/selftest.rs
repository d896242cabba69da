//! In-kernel self tests, run on real (emulated) hardware after bring-up.
//!
//! Needs QEMU started with `-device isa-debug-exit,iobase=0xf4,iosize=0x04`.
//! A failed assertion panics; the panic handler reports it through
//! [`on_panic`] before the normal panic screen.

use core::arch::asm;
use core::panic::PanicInfo;

use crate::interrupts::dispatch::last_vector;
use crate::interrupts::frame::{capture_regs, NO_FRAME_VECTOR};
use crate::interrupts::{idt, TrapFrame, KERNEL_CS, KERNEL_DS};
use crate::io::outl;
use crate::pmm::{FrameIndex, Pmm, PAGE_SIZE};
use crate::{serial_print, serial_println, x86};

const EXIT_PORT: u16 = 0xf4;

/// Test exit codes returned by QEMU.
/// Note that when exiting, QEMU will shift the exit code:
/// (exit << 1) | 1
/// so the value returned to the shell will NOT be these constants!
#[repr(u32)]
pub enum TestResult {
    // Returned value: 33 (0x10 << 1) | 1
    Success = 0x10,
    // Returned value: 35 (0x11 << 1) | 1
    Failure = 0x11,
}

pub fn exit_qemu(exit_code: TestResult) {
    unsafe { outl(EXIT_PORT, exit_code as u32) }
}

pub trait Test {
    fn run(&self, pmm: &mut Pmm);
}

impl<T> Test for T
where
    T: Fn(&mut Pmm),
{
    fn run(&self, pmm: &mut Pmm) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self(pmm);
        serial_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Test], pmm: &mut Pmm) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run(pmm);
    }
    exit_qemu(TestResult::Success)
}

/// Run every test against the live kernel state and leave QEMU.
pub fn run(pmm: &mut Pmm) -> ! {
    test_runner(
        &[
            &gdt_is_active,
            &idt_is_loaded,
            &interrupts_are_enabled,
            &software_interrupts_return,
            &capture_regs_sees_the_caller,
            &frames_are_distinct,
            &released_frames_are_reused,
        ],
        pmm,
    );
    x86::hcf()
}

pub fn on_panic(info: &PanicInfo) {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(TestResult::Failure);
}

fn gdt_is_active(_: &mut Pmm) {
    assert_eq!(x86::cs(), KERNEL_CS);
    assert_eq!(x86::ds(), KERNEL_DS);
    assert_eq!(x86::es(), KERNEL_DS);
    assert_eq!(x86::ss(), KERNEL_DS);
}

fn idt_is_loaded(_: &mut Pmm) {
    let idt = idt::loaded().expect("IDT was never built");
    let expected = idt.register();
    let current = idt::current_register();

    let (base, limit) = (current.base, current.limit);
    assert_eq!(base, { expected.base });
    assert_eq!(limit, { expected.limit });
}

fn interrupts_are_enabled(_: &mut Pmm) {
    assert!(x86::interrupts_enabled());
}

/// Fire `int $vector` with known values in the scratch and callee-saved
/// registers. Gives back those registers and RSP before and after.
macro_rules! fire {
    ($vector:literal) => {{
        let mut regs: [u64; 8] = [
            0x1111_1111_1111_1111,
            0x2222_2222_2222_2222,
            0x3333_3333_3333_3333,
            0x4444_4444_4444_4444,
            0x5555_5555_5555_5555,
            0x6666_6666_6666_6666,
            0x7777_7777_7777_7777,
            0x8888_8888_8888_8888,
        ];
        let (before, after): (u64, u64);
        unsafe {
            asm!(
                "mov {before}, rsp",
                concat!("int ", stringify!($vector)),
                "mov {after}, rsp",
                before = out(reg) before,
                after = out(reg) after,
                inout("rax") regs[0],
                inout("rcx") regs[1],
                inout("rdx") regs[2],
                inout("rsi") regs[3],
                inout("rdi") regs[4],
                inout("r8") regs[5],
                inout("r11") regs[6],
                inout("r15") regs[7],
            );
        }
        ($vector as u64, regs, before, after)
    }};
}

// Runs the whole stub path: push order, handler call, unwind and iretq.
fn software_interrupts_return(_: &mut Pmm) {
    for (vector, regs, before, after) in [fire!(0x80), fire!(0x21)] {
        assert_eq!(last_vector(), vector);
        assert_eq!(before, after);
        for (i, reg) in regs.iter().enumerate() {
            assert_eq!(*reg, 0x1111_1111_1111_1111 * (i as u64 + 1));
        }
        assert!(x86::interrupts_enabled());
    }
}

#[inline(never)]
fn capture_regs_sees_the_caller(_: &mut Pmm) {
    let marker = 0u64;
    let mut frame = TrapFrame::sentinel();
    unsafe { capture_regs(&mut frame) };

    // Left alone by the capture.
    assert_eq!(frame.vector, NO_FRAME_VECTOR);
    assert_eq!(frame.err, 0);

    assert_eq!(frame.cs, KERNEL_CS as u64);
    assert_eq!(frame.ss, KERNEL_DS as u64);
    assert_eq!(frame.ds, KERNEL_DS as u64);

    // RIP is the return address, inside this function.
    let entry = capture_regs_sees_the_caller as usize as u64;
    assert!(frame.rip > entry && frame.rip < entry + 0x1000);
    let stack = &marker as *const u64 as u64;
    assert!(frame.rsp.abs_diff(stack) < 0x1000);

    // Paging and protected mode on, interrupts on.
    assert_eq!(frame.cr0 & 1, 1);
    assert_ne!(frame.cr0 & (1 << 31), 0);
    assert_ne!(frame.cr3, 0);
    assert_ne!(frame.rflags & (1 << 9), 0);

    let here = TrapFrame::here();
    assert_eq!(here.vector, NO_FRAME_VECTOR);
    assert_eq!(here.cs, KERNEL_CS as u64);
}

fn frames_are_distinct(pmm: &mut Pmm) {
    let free = pmm.get_free();
    let a = pmm.request_pages(1).expect("out of frames");
    let b = pmm.request_pages(2).expect("out of frames");
    assert_ne!(a, b);
    assert!(b.as_u64() >= a.as_u64() + PAGE_SIZE || a.as_u64() >= b.as_u64() + 2 * PAGE_SIZE);
    assert_eq!(pmm.get_free(), free - 3 * PAGE_SIZE);

    pmm.release_pages(a, 1);
    pmm.release_pages(b, 2);
    assert_eq!(pmm.get_free(), free);
}

fn released_frames_are_reused(pmm: &mut Pmm) {
    let a = pmm.request_pages(4).expect("out of frames");
    assert!(pmm.is_used(FrameIndex::containing(a)));
    assert_eq!(pmm.release_pages(a, 4), 4);
    assert!(!pmm.is_used(FrameIndex::containing(a)));
    assert_eq!(pmm.request_pages(4), Some(a));
    pmm.release_pages(a, 4);
}
