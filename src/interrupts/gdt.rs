//! Global Descriptor Table.
//! In AMD64, the GDT is mostly a legacy structure.
//! Its main use is for privilege level switching.
//! Because it's a set-once structure, this module is very inflexible:
//! five flat segments, null first.

use super::{DescriptorTableRegister, KERNEL_CS, KERNEL_DS};
use bitflags::bitflags;
use core::arch::asm;
use core::mem::size_of;
use spin::Once;

bitflags! {
    /// Upper nibble of byte 6.
    pub struct SegmentUpperFlags: u8 {
        /// Disables segmentation
        const LONG_MODE = 1 << 5;
        /// Limit is counted in 4 KiB units.
        const GRANULARITY = 1 << 7;

        const FLAT_64 = Self::LONG_MODE.bits | Self::GRANULARITY.bits;
    }
}

bitflags! {
    /// Many flags are ignored in 64-bit mode.
    /// See 4.7 Legacy Segment Descriptors, AMD64
    pub struct SegmentLowerFlags: u8 {
        const PRESENT = 1 << 7;
        /// Descriptor Privilege Level 0 = ring0, kernel
        const DPL_0 = 0 << 5;
        /// Descriptor Privilege Level 3 = ring3, user
        const DPL_3 = 3 << 5;
        /// "User descriptor": can be either a Code or Segment descriptor
        /// (AMD64 manual, Table 4.2. Descriptor Types)
        const USER_DESCRIPTOR = 1 << 4;
        /// Segment is a code segment. If not set, the segment is a data segment
        const EXECUTE = 1 << 3;
        /// For a code segment, means the segment is readable.
        /// For a data segment, means the segment is writable.
        const ACCESSIBLE = 1 << 1;

        const KERNEL_CODE = Self::PRESENT.bits | Self::DPL_0.bits | Self::USER_DESCRIPTOR.bits
         | Self::EXECUTE.bits | Self::ACCESSIBLE.bits;
        const KERNEL_DATA = Self::PRESENT.bits | Self::DPL_0.bits | Self::USER_DESCRIPTOR.bits
         | Self::ACCESSIBLE.bits;
        const USER_CODE = Self::PRESENT.bits | Self::DPL_3.bits | Self::USER_DESCRIPTOR.bits
         | Self::EXECUTE.bits | Self::ACCESSIBLE.bits;
        const USER_DATA = Self::PRESENT.bits | Self::DPL_3.bits | Self::USER_DESCRIPTOR.bits
         | Self::ACCESSIBLE.bits;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegmentDescriptor {
    limit_15_0: u16,
    base_15_0: u16,
    base_23_16: u8,
    access: SegmentLowerFlags,
    /// Bits 3:0 are limit 19:16,
    /// bits 7:4 are the flags.
    limit_and_upper_flags: u8,
    base_31_24: u8,
}

impl SegmentDescriptor {
    pub const NULL: Self = Self {
        limit_15_0: 0,
        base_15_0: 0,
        base_23_16: 0,
        access: SegmentLowerFlags::empty(),
        limit_and_upper_flags: 0,
        base_31_24: 0,
    };

    const MAX_LIMIT: u32 = 0xf_ffff;

    /// Base 0, maximal limit.
    pub const fn flat(upper_flags: SegmentUpperFlags, access: SegmentLowerFlags) -> Self {
        Self {
            limit_15_0: Self::MAX_LIMIT as u16,
            base_15_0: 0,
            base_23_16: 0,
            access,
            limit_and_upper_flags: upper_flags.bits() | (Self::MAX_LIMIT >> 16) as u8,
            base_31_24: 0,
        }
    }

    pub fn base(&self) -> u32 {
        (self.base_31_24 as u32) << 24 | (self.base_23_16 as u32) << 16 | self.base_15_0 as u32
    }

    pub fn limit(&self) -> u32 {
        ((self.limit_and_upper_flags & 0xf) as u32) << 16 | self.limit_15_0 as u32
    }

    pub fn access(&self) -> SegmentLowerFlags {
        self.access
    }

    pub fn upper_flags(&self) -> SegmentUpperFlags {
        SegmentUpperFlags::from_bits_truncate(self.limit_and_upper_flags & 0xf0)
    }
}

pub const NB_ENTRIES: usize = 5;

#[repr(C, align(8))]
#[derive(Debug)]
pub struct Gdt {
    entries: [SegmentDescriptor; NB_ENTRIES],
}

impl Gdt {
    pub const fn new() -> Self {
        Self {
            entries: [
                SegmentDescriptor::NULL,
                SegmentDescriptor::flat(SegmentUpperFlags::FLAT_64, SegmentLowerFlags::KERNEL_CODE),
                SegmentDescriptor::flat(SegmentUpperFlags::FLAT_64, SegmentLowerFlags::KERNEL_DATA),
                SegmentDescriptor::flat(SegmentUpperFlags::FLAT_64, SegmentLowerFlags::USER_CODE),
                SegmentDescriptor::flat(SegmentUpperFlags::FLAT_64, SegmentLowerFlags::USER_DATA),
            ],
        }
    }

    pub fn entries(&self) -> &[SegmentDescriptor; NB_ENTRIES] {
        &self.entries
    }

    pub fn register(&self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            limit: (size_of::<Gdt>() - 1) as u16,
            base: self as *const Gdt as u64,
        }
    }

    /// Load this table, then reload every segment register from it.
    pub fn reload(&'static self) {
        let register_format = self.register();

        unsafe {
            // Flush the GDT, update CS and other segments registers.
            //
            // Note that we can't update CS directly, since it would be a JMP:
            // instructions are fetched from CS:IP.
            // https://stackoverflow.com/questions/52490438/why-cant-mov-set-cs-the-code-segment-register-even-though-it-can-set-others
            // There are no long jumps in long mode, so we'll use the far return instruction,
            // which pops IP and CS off the stack.
            asm!(
                r#"
lgdt [{gdt}]
lea {ip}, [rip + 2f]
push {cs}
push {ip}
retfq
2:
mov ax, {ds}
mov ds, ax
mov es, ax
mov fs, ax
mov gs, ax
mov ss, ax
            "#,
                gdt = in(reg) &register_format,
                cs = const KERNEL_CS,
                ip = lateout(reg) _,
                ds = const KERNEL_DS,
                out("ax") _,
                options(preserves_flags)
            );
        }
    }
}

static GDT: Once<Gdt> = Once::new();

/// Build the table (first call only) and make it the active one.
pub fn init() {
    GDT.call_once(Gdt::new).reload();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interrupts::{USER_CS, USER_DS};

    fn entry(selector: u16) -> SegmentDescriptor {
        Gdt::new().entries()[(selector >> 3) as usize]
    }

    #[test]
    fn descriptor_layout() {
        assert_eq!(size_of::<SegmentDescriptor>(), 8);
        assert_eq!(size_of::<Gdt>(), 8 * NB_ENTRIES);
    }

    #[test]
    fn first_entry_is_null() {
        let gdt = Gdt::new();
        assert_eq!(gdt.entries()[0], SegmentDescriptor::NULL);
        let raw: [u8; 8] = unsafe { core::mem::transmute(gdt.entries()[0]) };
        assert_eq!(raw, [0; 8]);
    }

    #[test]
    fn access_bytes_match_ring_and_type() {
        assert_eq!(entry(KERNEL_CS).access().bits(), 0b1001_1010);
        assert_eq!(entry(KERNEL_DS).access().bits(), 0b1001_0010);
        assert_eq!(entry(USER_CS).access().bits(), 0b1111_1010);
        assert_eq!(entry(USER_DS).access().bits(), 0b1111_0010);
    }

    #[test]
    fn code_and_data_selectors_match() {
        assert!(entry(KERNEL_CS)
            .access()
            .contains(SegmentLowerFlags::KERNEL_CODE));
        assert!(entry(KERNEL_DS)
            .access()
            .contains(SegmentLowerFlags::KERNEL_DATA));
        assert!(!entry(KERNEL_DS)
            .access()
            .contains(SegmentLowerFlags::EXECUTE));
    }

    #[test]
    fn segments_are_flat() {
        for descriptor in &Gdt::new().entries()[1..] {
            assert_eq!(descriptor.base(), 0);
            assert_eq!(descriptor.limit(), 0xf_ffff);
            assert_eq!(descriptor.upper_flags(), SegmentUpperFlags::FLAT_64);
        }
    }

    #[test]
    fn raw_kernel_code_descriptor() {
        let raw: u64 = unsafe { core::mem::transmute(entry(KERNEL_CS)) };
        assert_eq!(raw, 0x00af_9a00_0000_ffff);
    }
}
