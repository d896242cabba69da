//! Kernel entry point.
//!
//! Only meaningful on bare metal (`--target x86_64-unknown-none`); host builds
//! get a stub so the library's unit tests can run with a plain `cargo test`.
#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use core::fmt::Write;
    use core::panic::PanicInfo;
    use core::slice;

    use sphynx::boot::BootInfo;
    use sphynx::config::{KERNEL_NAME, KERNEL_VERSION};
    use sphynx::console::CONSOLE;
    use sphynx::framebuffer::Framebuffer;
    use sphynx::pmm::Pmm;
    use sphynx::serial::{self, DebugCon};
    use sphynx::{debug, error, interrupts, kpanic, kprintln, log, warn, x86};

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        // DebugCon takes no lock, so this works whatever was held.
        let _ = writeln!(DebugCon, "PANIC: {}", info);

        #[cfg(feature = "qemu-tests")]
        sphynx::selftest::on_panic(info);

        let (file, line) = info
            .location()
            .map_or(("<unknown>", 0), |l| (l.file(), l.line()));
        sphynx::panic::kpanic_at(None, "Rust panic", file, line)
    }

    /// The loader jumps here with the handoff record in `rdi`.
    #[no_mangle]
    pub extern "C" fn _start(data: *const BootInfo) -> ! {
        let handoff = match unsafe { BootInfo::validate(data) } {
            Ok(handoff) => handoff,
            Err(err) => {
                let _ = writeln!(DebugCon, "ERROR: {}", err);
                x86::hcf();
            }
        };

        let fb = unsafe { Framebuffer::from_boot(handoff.framebuffer) };
        CONSOLE.lock().attach(fb);

        kprintln!(
            "{} v{} (Bootloader: {})",
            KERNEL_NAME,
            KERNEL_VERSION,
            handoff.loader_name
        );
        kprintln!(
            " - Screen: {}x{}",
            handoff.framebuffer.width,
            handoff.framebuffer.height
        );
        if let Err(err) = serial::com1_status() {
            warn!("COM1 disabled: {}", err);
        }
        debug!(
            "ramfs: {} bytes at {:#x}",
            handoff.ramfs.size, handoff.ramfs.address
        );

        interrupts::init();

        // The loader leaves physical memory identity mapped.
        let regions = unsafe { handoff.memory_map.regions() };
        let pmm = Pmm::init(regions, |base, len| unsafe {
            slice::from_raw_parts_mut(base.as_u64() as *mut u8, len)
        });
        let mut pmm = match pmm {
            Ok(pmm) => pmm,
            Err(err) => {
                error!("{}", err);
                kpanic!(None, "Failed to initialize physical memory")
            }
        };
        log!("Free memory: {} KiB", pmm.get_free() / 1024);

        match pmm.request_pages(1) {
            Some(page) => debug!("First page at {:#x}", page),
            None => kpanic!(None, "Failed to allocate a single page"),
        }

        #[cfg(feature = "qemu-tests")]
        sphynx::selftest::run(&mut pmm);

        loop {
            x86::hlt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("sphynx is a kernel: build it with --target x86_64-unknown-none");
}
