//! Processor state captured at an interrupt boundary.

/// Vector stamped on frames that did not come from an interrupt.
pub const NO_FRAME_VECTOR: u64 = 0xdead_beef;

/// Lowest address first. The ISR stubs in `idt.rs` build this on the stack,
/// so the field order is the push order reversed and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    /// Zero when the CPU pushes no error code for this vector.
    pub err: u64,

    // Pushed by the CPU.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// An all-zero frame marked as not coming from an interrupt.
    pub const fn sentinel() -> Self {
        Self {
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: NO_FRAME_VECTOR,
            err: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    /// The frame of the current call site, see [`capture_regs`].
    pub fn here() -> Self {
        let mut frame = Self::sentinel();
        unsafe { capture_regs(&mut frame) };
        frame.vector = NO_FRAME_VECTOR;
        frame
    }
}

extern "C" {
    /// Store every general purpose register, the segment selectors, CR0/2/3/4,
    /// RSP and RFLAGS into `frame`. RIP is the return address of this call.
    /// `vector` and `err` are left untouched. Reads control registers, so
    /// ring 0 only.
    pub fn capture_regs(frame: *mut TrapFrame);
}

#[cfg(test)]
mod test {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn frame_is_thirty_quadwords() {
        assert_eq!(size_of::<TrapFrame>(), 30 * 8);
    }

    #[test]
    fn push_order() {
        assert_eq!(offset_of!(TrapFrame, ds), 0);
        assert_eq!(offset_of!(TrapFrame, gs), 3 * 8);
        assert_eq!(offset_of!(TrapFrame, cr0), 4 * 8);
        assert_eq!(offset_of!(TrapFrame, cr4), 7 * 8);
        assert_eq!(offset_of!(TrapFrame, r15), 8 * 8);
        assert_eq!(offset_of!(TrapFrame, rax), 22 * 8);
        assert_eq!(offset_of!(TrapFrame, vector), 23 * 8);
        assert_eq!(offset_of!(TrapFrame, err), 24 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 25 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 29 * 8);
    }

    #[test]
    fn sentinel_is_recognizable() {
        let frame = TrapFrame::sentinel();
        assert_eq!(frame.vector, NO_FRAME_VECTOR);
        assert_eq!(
            TrapFrame {
                vector: 0,
                ..frame
            },
            TrapFrame::default()
        );
    }
}
