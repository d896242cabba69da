//! Boot handoff record.
//!
//! The loader passes a pointer to [`BootInfo`] in `rdi` when it jumps to
//! `_start`. Everything reachable from it is owned by the loader; the kernel
//! reads it once at start-up.

use core::ffi::{c_char, CStr};
use core::fmt;
use core::slice;

#[derive(Debug)]
#[repr(C)]
pub struct BootInfo {
    pub info: *const LoaderInfo,
    pub framebuffer: *const FramebufferInfo,
    pub ramfs: *const RamfsInfo,
    pub memory_map: *mut MemoryMap,
}

#[derive(Debug)]
#[repr(C)]
pub struct LoaderInfo {
    /// NUL terminated.
    pub name: *const c_char,
}

#[derive(Debug)]
#[repr(C)]
pub struct FramebufferInfo {
    pub address: u64,
    pub width: u64,
    pub height: u64,
    pub pitch: u64,
    pub bpp: u16,
    pub red_mask_size: u8,
    pub red_mask_shift: u8,
    pub green_mask_size: u8,
    pub green_mask_shift: u8,
    pub blue_mask_size: u8,
    pub blue_mask_shift: u8,
}

/// The read-only archive loaded next to the kernel.
#[derive(Debug)]
#[repr(C)]
pub struct RamfsInfo {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug)]
#[repr(C)]
pub struct MemoryMap {
    pub region_count: u64,
    pub regions: *mut *mut MemoryRegion,
}

impl MemoryMap {
    /// `None` if the loader left the region array out.
    ///
    /// # Safety
    /// `regions` must point to `region_count` valid, non-null region pointers
    /// that nothing else aliases.
    pub unsafe fn regions(&mut self) -> Option<&mut [&mut MemoryRegion]> {
        if self.regions.is_null() {
            return None;
        }
        Some(slice::from_raw_parts_mut(
            self.regions as *mut &mut MemoryRegion,
            self.region_count as usize,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryRegion {
    /// Physical address of base of the memory section
    pub base: u64,
    /// Length of the section
    pub length: u64,
    /// Raw [`MemmapType`] value; loaders may report types we don't know.
    pub mm_type: u64,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, mm_type: MemmapType) -> Self {
        Self {
            base,
            length,
            mm_type: mm_type as u64,
        }
    }

    pub fn end(&self) -> u64 {
        self.base + self.length
    }

    pub fn kind(&self) -> Option<MemmapType> {
        MemmapType::from_raw(self.mm_type)
    }

    pub fn is_usable(&self) -> bool {
        self.kind() == Some(MemmapType::Usable)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}..{:#018x} ", self.base, self.end())?;
        match self.kind() {
            Some(kind) => write!(f, "{:?}", kind),
            None => write!(f, "Unknown({:#x})", self.mm_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MemmapType {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    BadMemory = 5,
    BootloaderReclaimable = 0x1000,
    KernelAndModules = 0x1001,
    Framebuffer = 0x1002,
}

impl MemmapType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            1 => Self::Usable,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            0x1000 => Self::BootloaderReclaimable,
            0x1001 => Self::KernelAndModules,
            0x1002 => Self::Framebuffer,
            _ => return None,
        })
    }
}

/// A broken boot contract. Detected before any table is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    MissingBootInfo,
    MissingFramebuffer,
    MissingMemoryMap,
    MissingRamfs,
}

impl BootError {
    /// What we failed to get from the loader.
    pub fn what(self) -> &'static str {
        match self {
            BootError::MissingBootInfo => "boot info",
            BootError::MissingFramebuffer => "framebuffer",
            BootError::MissingMemoryMap => "memory map",
            BootError::MissingRamfs => "ramfs",
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Failed to get {}", self.what())
    }
}

/// The parts of the handoff the kernel cannot start without.
pub struct Handoff {
    pub loader_name: &'static str,
    pub framebuffer: &'static FramebufferInfo,
    pub ramfs: &'static RamfsInfo,
    pub memory_map: &'static mut MemoryMap,
}

impl BootInfo {
    /// Check the boot contract and borrow the pieces out of the raw record.
    ///
    /// # Safety
    /// Non-null pointers in the record must be valid for the kernel's lifetime.
    pub unsafe fn validate(data: *const BootInfo) -> Result<Handoff, BootError> {
        let data = data.as_ref().ok_or(BootError::MissingBootInfo)?;

        let framebuffer = data
            .framebuffer
            .as_ref()
            .filter(|fb| fb.address != 0)
            .ok_or(BootError::MissingFramebuffer)?;
        let memory_map = data
            .memory_map
            .as_mut()
            .ok_or(BootError::MissingMemoryMap)?;
        let ramfs = data.ramfs.as_ref().ok_or(BootError::MissingRamfs)?;

        let loader_name = data
            .info
            .as_ref()
            .filter(|info| !info.name.is_null())
            .and_then(|info| CStr::from_ptr(info.name).to_str().ok())
            .unwrap_or("unknown");

        Ok(Handoff {
            loader_name,
            framebuffer,
            ramfs,
            memory_map,
        })
    }
}
