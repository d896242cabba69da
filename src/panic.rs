//! Kernel panic: report the machine state, then halt.

use bitflags::bitflags;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{PANIC_BACKGROUND, PANIC_FOREGROUND, VERBOSE_PANIC};
use crate::console::CONSOLE;
use crate::interrupts::TrapFrame;
use crate::serial::{self, COM1};
use crate::x86;

pub const PAGE_FAULT_VECTOR: u64 = 14;

const BANNER: &str = "==================== KERNEL PANIC ====================";
const CLOSING_BANNER: &str = "======================================================";

bitflags! {
    /// Page fault error code pushed by the CPU.
    pub struct PageFaultError: u64 {
        /// Clear when the page was not present.
        const PROTECTION_VIOLATION = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED_WRITE = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultDetails(pub PageFaultError);

impl PageFaultDetails {
    pub fn from_error_code(err: u64) -> Self {
        Self(PageFaultError::from_bits_truncate(err))
    }

    pub fn operation(self) -> &'static str {
        if self.0.contains(PageFaultError::PROTECTION_VIOLATION) {
            "Protection Violation"
        } else {
            "Non-Present Page"
        }
    }

    pub fn access(self) -> &'static str {
        if self.0.contains(PageFaultError::WRITE) {
            "Write"
        } else {
            "Read"
        }
    }

    pub fn privilege(self) -> &'static str {
        if self.0.contains(PageFaultError::USER) {
            "User Mode"
        } else {
            "Supervisor Mode"
        }
    }
}

impl fmt::Display for PageFaultDetails {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Page Fault Details:")?;
        writeln!(f, "  Operation: {}", self.operation())?;
        writeln!(f, "  Access Type: {}", self.access())?;
        writeln!(f, "  Privilege Level: {}", self.privilege())?;
        if self.0.contains(PageFaultError::RESERVED_WRITE) {
            writeln!(f, "  Reserved Write: Yes")?;
        }
        if self.0.contains(PageFaultError::INSTRUCTION_FETCH) {
            writeln!(f, "  Instruction Fetch: Yes")?;
        }
        Ok(())
    }
}

/// Everything printed on the panic screen.
pub struct PanicReport<'a> {
    pub frame: &'a TrapFrame,
    pub reason: &'a str,
    pub file: &'a str,
    pub line: u32,
}

impl PanicReport<'_> {
    fn registers(&self) -> [(&'static str, u64); 30] {
        let f = self.frame;
        [
            ("CR0", f.cr0),
            ("CR2", f.cr2),
            ("CR3", f.cr3),
            ("CR4", f.cr4),
            ("RAX", f.rax),
            ("RBX", f.rbx),
            ("RCX", f.rcx),
            ("RDX", f.rdx),
            ("RSI", f.rsi),
            ("RDI", f.rdi),
            ("RBP", f.rbp),
            ("R8", f.r8),
            ("R9", f.r9),
            ("R10", f.r10),
            ("R11", f.r11),
            ("R12", f.r12),
            ("R13", f.r13),
            ("R14", f.r14),
            ("R15", f.r15),
            ("RIP", f.rip),
            ("CS", f.cs),
            ("RFLAGS", f.rflags),
            ("RSP", f.rsp),
            ("SS", f.ss),
            ("DS", f.ds),
            ("ES", f.es),
            ("FS", f.fs),
            ("GS", f.gs),
            ("ERR", f.err),
            ("VECTOR", f.vector),
        ]
    }

    /// One line, for the `simple-panic` build.
    pub fn write_simple(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(
            out,
            "Kernel Panic @ 0x{:016x}, Reason: \"{}\", {}:{}",
            self.frame.rip, self.reason, self.file, self.line
        )
    }
}

impl fmt::Display for PanicReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", BANNER)?;
        writeln!(
            f,
            "Kernel panic @ 0x{:016x}: {} (vector {:#x})",
            self.frame.rip, self.reason, self.frame.vector
        )?;
        writeln!(f, "In file: {}, line: {}", self.file, self.line)?;

        writeln!(f, "Register dump:")?;
        for (name, value) in self.registers() {
            writeln!(f, "  {:<12}: 0x{:016x}", name, value)?;
        }

        if self.frame.vector == PAGE_FAULT_VECTOR {
            write!(f, "{}", PageFaultDetails::from_error_code(self.frame.err))?;
        }

        writeln!(f, "Stack trace:")?;
        writeln!(f, "  (not available)")?;
        writeln!(f, "{}", CLOSING_BANNER)
    }
}

static PANICKING: AtomicBool = AtomicBool::new(false);

/// Report and halt. `frame` is the trapped state, if there is one; otherwise
/// the registers at this call are shown under a sentinel vector.
pub fn kpanic_at(frame: Option<&TrapFrame>, reason: &str, file: &str, line: u32) -> ! {
    x86::cli();

    if PANICKING.swap(true, Ordering::SeqCst) {
        // The report itself faulted; the console can't be trusted.
        serial::debug_print("\nKernel panic while panicking\n");
        x86::hcf();
    }

    let frame = match frame {
        Some(frame) => *frame,
        None => TrapFrame::here(),
    };
    let report = PanicReport {
        frame: &frame,
        reason,
        file,
        line,
    };

    // Whoever held these is never coming back.
    unsafe {
        CONSOLE.force_unlock();
        COM1.force_unlock();
    }

    let mut console = CONSOLE.lock();
    console.set_colors(PANIC_FOREGROUND, PANIC_BACKGROUND);
    console.clear();
    let _ = if VERBOSE_PANIC {
        write!(console, "{}", report)
    } else {
        report.write_simple(&mut *console)
    };
    drop(console);

    x86::hcf()
}

/// Panic at the call site. Takes an `Option<&TrapFrame>` and a reason.
#[macro_export]
macro_rules! kpanic {
    ($frame:expr, $reason:expr) => {
        $crate::panic::kpanic_at($frame, $reason, file!(), line!())
    };
}
