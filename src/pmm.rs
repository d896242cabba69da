//! Physical memory allocator.
//! Hands out page frames.
//!
//! One bit per 4 KiB frame, 1 = used. The bitmap itself is carved out of the
//! first usable region big enough to hold it.

use core::fmt;

use crate::boot::MemoryRegion;

pub const PAGE_SIZE: u64 = 4096;

pub const fn align_up(x: u64, base: u64) -> u64 {
    (x + base - 1) & !(base - 1)
}

pub const fn div_ceil(x: u64, y: u64) -> u64 {
    (x + y - 1) / y
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Index of a page frame in the bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The frame `addr` falls in.
    pub const fn containing(addr: PhysAddr) -> Self {
        Self((addr.0 / PAGE_SIZE) as usize)
    }

    /// Only for addresses on a frame boundary.
    pub fn from_start(addr: PhysAddr) -> Option<Self> {
        addr.is_page_aligned().then(|| Self::containing(addr))
    }

    pub const fn index(self) -> usize {
        self.0
    }

    pub fn start_address(self) -> PhysAddr {
        PhysAddr(self.0 as u64 * PAGE_SIZE)
    }
}

/// A bitmap is an array of bits, usable as a set.
/// Backed by memory handed to it; indices past `bits` are ignored.
pub struct Bitmap<'a> {
    data: &'a mut [u8],
    bits: usize,
}

impl<'a> Bitmap<'a> {
    /// A bitmap of `bits` slots over `data`, every slot set.
    pub fn new_full(data: &'a mut [u8], bits: usize) -> Self {
        let bits = bits.min(data.len() * 8);
        data.fill(0xff);
        Self { data, bits }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Get bit `i`.
    pub fn get(&self, i: usize) -> bool {
        let byte = i / 8;
        let bit = i % 8;
        i < self.bits && self.data[byte] & (1 << bit) != 0
    }

    /// Set bit `i`.
    pub fn set(&mut self, i: usize) {
        if i < self.bits {
            self.data[i / 8] |= 1 << (i % 8);
        }
    }

    /// Unset bit `i`.
    pub fn unset(&mut self, i: usize) {
        if i < self.bits {
            self.data[i / 8] &= !(1 << (i % 8));
        }
    }

    /// Get an iterator to each entry of the bitmap.
    pub fn iter(&self) -> BitmapIter<'_, 'a> {
        BitmapIter {
            index: 0,
            bitmap: self,
        }
    }
}

pub struct BitmapIter<'b, 'a> {
    index: usize,
    bitmap: &'b Bitmap<'a>,
}

impl Iterator for BitmapIter<'_, '_> {
    type Item = bool;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index == self.bitmap.bits {
            return None;
        }

        let item = self.bitmap.get(self.index);

        self.index += 1;

        Some(item)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    MissingMemoryMap,
    NoUsableMemory,
    /// No single usable region can hold `needed` bytes of bitmap.
    NoRoomForBitmap { needed: u64 },
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PmmError::MissingMemoryMap => write!(f, "NULL Memory map passed to PMM init"),
            PmmError::NoUsableMemory => write!(f, "Memory map has no usable region"),
            PmmError::NoRoomForBitmap { needed } => {
                write!(f, "No usable region can hold the {:#x} byte PMM bitmap", needed)
            }
        }
    }
}

pub struct Pmm<'a> {
    bitmap: Bitmap<'a>,
    bitmap_base: PhysAddr,
    bitmap_size: u64,
}

impl<'a> Pmm<'a> {
    /// Build the frame bitmap from the loader's memory map.
    ///
    /// `map` turns a physical range into writable memory; the bitmap is stored
    /// there. The region hosting the bitmap is shrunk to exclude it.
    ///
    /// Usable regions are released relative to their own base: page `k` of a
    /// region is bit `k`. This matches absolute frame numbers only when the
    /// loader's regions are laid out from the frame grid's origin.
    pub fn init<F>(regions: Option<&mut [&mut MemoryRegion]>, map: F) -> Result<Self, PmmError>
    where
        F: FnOnce(PhysAddr, usize) -> &'a mut [u8],
    {
        let regions = regions.ok_or(PmmError::MissingMemoryMap)?;

        let mut high_addr = 0;
        for region in regions.iter().filter(|r| r.is_usable()) {
            debug!("Usable entry at {:#018x}", region.base);
            high_addr = high_addr.max(region.end());
        }
        if high_addr == 0 {
            return Err(PmmError::NoUsableMemory);
        }

        let frames = div_ceil(high_addr, PAGE_SIZE);
        let bitmap_size = align_up(div_ceil(frames, 8), PAGE_SIZE);

        let host = regions
            .iter_mut()
            .find(|r| r.is_usable() && r.length >= bitmap_size)
            .ok_or(PmmError::NoRoomForBitmap {
                needed: bitmap_size,
            })?;
        let bitmap_base = PhysAddr::new(host.base);
        let mut bitmap = Bitmap::new_full(map(bitmap_base, bitmap_size as usize), frames as usize);
        host.base += bitmap_size;
        host.length -= bitmap_size;

        for region in regions.iter().filter(|r| r.is_usable()) {
            let mut addr = region.base;
            while addr + PAGE_SIZE <= region.end() {
                let frame = FrameIndex::containing(PhysAddr::new(addr - region.base));
                bitmap.unset(frame.index());
                addr += PAGE_SIZE;
            }
        }

        debug!(
            "PMM bitmap at {:#x}: {} frames in {:#x} bytes",
            bitmap_base, frames, bitmap_size
        );

        Ok(Self {
            bitmap,
            bitmap_base,
            bitmap_size,
        })
    }

    pub fn total_frames(&self) -> usize {
        self.bitmap.len()
    }

    pub fn bitmap_base(&self) -> PhysAddr {
        self.bitmap_base
    }

    /// Bytes of physical memory taken by the bitmap, page aligned.
    pub fn bitmap_size(&self) -> u64 {
        self.bitmap_size
    }

    pub fn is_used(&self, frame: FrameIndex) -> bool {
        self.bitmap.get(frame.index())
    }

    /// Free bytes.
    pub fn get_free(&self) -> u64 {
        self.bitmap.iter().filter(|used| !used).count() as u64 * PAGE_SIZE
    }

    /// First fit: the lowest run of `count` free frames, marked used.
    pub fn request_pages(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }

        let mut start = 0;
        let mut run = 0;

        for i in 0..self.bitmap.len() {
            if self.bitmap.get(i) {
                run = 0;
                continue;
            }

            if run == 0 {
                start = i;
            }
            run += 1;
            if run == count {
                for j in start..start + count {
                    self.bitmap.set(j);
                }
                return Some(FrameIndex::new(start).start_address());
            }
        }

        None
    }

    /// Clear the run of free frames starting at `ptr`'s frame.
    ///
    /// No allocation length is kept, so this walks forward while frames are
    /// already free. Right after `request_pages` the first frame is used and
    /// nothing is released; use [`Pmm::release_pages`] to give frames back.
    /// Returns the length of the run that was walked.
    pub fn free_pages(&mut self, ptr: PhysAddr) -> usize {
        let start = FrameIndex::containing(ptr).index();

        let mut count = 0;
        while start + count < self.bitmap.len() && !self.bitmap.get(start + count) {
            count += 1;
        }

        for i in start..start + count {
            self.bitmap.unset(i);
        }
        count
    }

    /// Give back `count` frames starting at `ptr`'s frame.
    /// Returns how many of them were actually in use.
    pub fn release_pages(&mut self, ptr: PhysAddr, count: usize) -> usize {
        let start = FrameIndex::containing(ptr).index();
        let end = start.saturating_add(count).min(self.bitmap.len());

        let mut released = 0;
        for i in start..end {
            if self.bitmap.get(i) {
                self.bitmap.unset(i);
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::boot::MemmapType;
    use std::cell::Cell;

    const MIB: u64 = 0x10_0000;

    fn backing(_: PhysAddr, len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn init(regions: &mut [MemoryRegion]) -> Result<Pmm<'static>, PmmError> {
        let mut refs: Vec<&mut MemoryRegion> = regions.iter_mut().collect();
        Pmm::init(Some(&mut refs[..]), backing)
    }

    /// 1 MiB reserved, then 240 MiB usable.
    fn qemu_like() -> [MemoryRegion; 2] {
        [
            MemoryRegion::new(0, MIB, MemmapType::Reserved),
            MemoryRegion::new(MIB, 0x0f00_0000, MemmapType::Usable),
        ]
    }

    #[test]
    fn bitmap_works() {
        let mut data = [0u8; 2];
        let mut b = Bitmap::new_full(&mut data, 9);
        assert_eq!(b.len(), 9);
        assert!(b.iter().all(|bit| bit));

        b.unset(1);
        assert!(!b.get(1));
        b.set(1);
        assert!(b.get(1));
        b.unset(3);
        assert!(!b.get(3));
        assert!(b.get(2));
        assert!(b.get(4));

        // Past the end: ignored, reads as free.
        b.unset(12);
        assert!(!b.get(12));
        assert_eq!(b.iter().count(), 9);
        assert_eq!(b.iter().filter(|used| !used).count(), 1);
    }

    #[test]
    fn frame_index_conversions() {
        assert_eq!(FrameIndex::containing(PhysAddr::new(0x1fff)), FrameIndex::new(1));
        assert_eq!(FrameIndex::from_start(PhysAddr::new(0x2000)), Some(FrameIndex::new(2)));
        assert_eq!(FrameIndex::from_start(PhysAddr::new(0x2001)), None);
        assert_eq!(FrameIndex::new(3).start_address(), PhysAddr::new(0x3000));
    }

    #[test]
    fn sizes_bitmap_from_highest_usable_end() {
        let mut regions = qemu_like();
        let pmm = init(&mut regions).unwrap();

        // Highest usable end is 0x0f10_0000, not the 256 MiB the reserved
        // hole plus the region might suggest.
        assert_eq!(pmm.total_frames(), div_ceil(0x0f10_0000, PAGE_SIZE) as usize);
        assert_eq!(pmm.total_frames(), 0xf100);
        assert_eq!(pmm.bitmap_size(), align_up(0xf100 / 8, PAGE_SIZE));
        assert_eq!(pmm.bitmap_size(), 0x2000);
    }

    #[test]
    fn bitmap_is_carved_from_the_first_region_that_fits() {
        let mut regions = qemu_like();
        let pmm = init(&mut regions).unwrap();

        assert_eq!(pmm.bitmap_base(), PhysAddr::new(MIB));
        assert_eq!(regions[1].base, MIB + 0x2000);
        assert_eq!(regions[1].length, 0x0f00_0000 - 0x2000);
        assert_eq!(regions[0], MemoryRegion::new(0, MIB, MemmapType::Reserved));
    }

    #[test]
    fn only_one_region_absorbs_the_bitmap() {
        let mut regions = [
            MemoryRegion::new(0, 0x1000, MemmapType::Usable),
            MemoryRegion::new(MIB, 0x4000, MemmapType::Usable),
            MemoryRegion::new(2 * MIB, 0x0f00_0000, MemmapType::Usable),
        ];
        let mapped_at = Cell::new(None);
        let mut refs: Vec<&mut MemoryRegion> = regions.iter_mut().collect();
        let pmm = Pmm::init(Some(&mut refs[..]), |base, len| {
            mapped_at.set(Some((base, len)));
            backing(base, len)
        })
        .unwrap();

        assert_eq!(mapped_at.get(), Some((PhysAddr::new(MIB), 0x2000)));
        assert_eq!(pmm.bitmap_base(), PhysAddr::new(MIB));
        assert_eq!(regions[0].base, 0);
        assert_eq!(regions[1].base, MIB + 0x2000);
        assert_eq!(regions[2].base, 2 * MIB);
        assert_eq!(regions[2].length, 0x0f00_0000);
    }

    #[test]
    fn free_space_excludes_the_bitmap() {
        let mut regions = qemu_like();
        let pmm = init(&mut regions).unwrap();
        assert_eq!(pmm.get_free(), 0x0f00_0000 - 0x2000);
    }

    #[test]
    fn free_space_is_region_minus_bitmap() {
        for pages in [1u64, 2, 7, 64, 1000] {
            let length = (pages + 1) * PAGE_SIZE;
            let mut regions = [
                MemoryRegion::new(0, length, MemmapType::Usable),
                MemoryRegion::new(length, 0x3000, MemmapType::Reserved),
            ];
            let pmm = init(&mut regions).unwrap();
            assert_eq!(pmm.get_free(), length - pmm.bitmap_size());
        }
    }

    #[test]
    fn regions_index_relative_to_their_own_base() {
        // Both regions start releasing at bit 0, so they overlap in the bitmap.
        let mut regions = [
            MemoryRegion::new(0, 0x8000, MemmapType::Usable),
            MemoryRegion::new(0x10000, 0x4000, MemmapType::Usable),
        ];
        let pmm = init(&mut regions).unwrap();

        assert_eq!(pmm.total_frames(), 0x14);
        // Region 0 keeps 7 pages after the bitmap; region 1 covers bits 0..4.
        assert_eq!(pmm.get_free(), 7 * PAGE_SIZE);
        assert!(!pmm.is_used(FrameIndex::new(0)));
        assert!(pmm.is_used(FrameIndex::new(0x10)));
    }

    #[test]
    fn unusable_regions_are_never_released() {
        let mut regions = [
            MemoryRegion::new(0, 0x4000, MemmapType::Usable),
            MemoryRegion::new(0x4000, 0x10000, MemmapType::AcpiReclaimable),
            MemoryRegion::new(0x14000, 0x10000, MemmapType::BadMemory),
        ];
        let pmm = init(&mut regions).unwrap();
        assert_eq!(pmm.total_frames(), 4);
        assert_eq!(pmm.get_free(), 3 * PAGE_SIZE);
    }

    #[test]
    fn missing_memory_map_fails() {
        let err = Pmm::init(None, backing).err();
        assert_eq!(err, Some(PmmError::MissingMemoryMap));
    }

    #[test]
    fn no_usable_memory_fails() {
        let mut regions = [MemoryRegion::new(0, MIB, MemmapType::Reserved)];
        assert_eq!(init(&mut regions).err(), Some(PmmError::NoUsableMemory));
    }

    #[test]
    fn bitmap_must_fit_in_one_region() {
        // 128 MiB of address space needs a 4 KiB bitmap; no region has a full page.
        let mut regions = [
            MemoryRegion::new(0, 0x800, MemmapType::Usable),
            MemoryRegion::new(0x800_0000 - 0x800, 0x800, MemmapType::Usable),
        ];
        assert_eq!(
            init(&mut regions).err(),
            Some(PmmError::NoRoomForBitmap { needed: 0x1000 })
        );
    }

    #[test]
    fn zero_pages_is_a_failure() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let free = pmm.get_free();
        assert_eq!(pmm.request_pages(0), None);
        assert_eq!(pmm.get_free(), free);
    }

    #[test]
    fn first_page_is_frame_zero() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        assert_eq!(pmm.request_pages(1), Some(PhysAddr::new(0)));
        assert!(pmm.is_used(FrameIndex::new(0)));
    }

    #[test]
    fn sequential_single_pages() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        for frame in 0..4 {
            assert_eq!(
                pmm.request_pages(1),
                Some(FrameIndex::new(frame).start_address())
            );
        }
    }

    #[test]
    fn runs_marks_every_frame() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let free = pmm.get_free();
        assert_eq!(pmm.request_pages(5), Some(PhysAddr::new(0)));
        for i in 0..5 {
            assert!(pmm.is_used(FrameIndex::new(i)));
        }
        assert!(!pmm.is_used(FrameIndex::new(5)));
        assert_eq!(pmm.get_free(), free - 5 * PAGE_SIZE);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let a = pmm.request_pages(3).unwrap();
        let b = pmm.request_pages(2).unwrap();
        assert!(b.as_u64() >= a.as_u64() + 3 * PAGE_SIZE);
    }

    #[test]
    fn first_fit_skips_short_holes() {
        let mut regions = [MemoryRegion::new(0, 0x9000, MemmapType::Usable)];
        let mut pmm = init(&mut regions).unwrap();
        // 9 frames, bitmap takes one page: bits 0..8 free.
        assert_eq!(pmm.total_frames(), 9);
        let a = pmm.request_pages(1).unwrap();
        let _b = pmm.request_pages(1).unwrap();
        assert_eq!(pmm.release_pages(a, 1), 1);
        // The one-frame hole at 0 is too short for two frames.
        assert_eq!(pmm.request_pages(2), Some(PhysAddr::new(0x2000)));
        assert_eq!(pmm.request_pages(1), Some(PhysAddr::new(0)));
    }

    #[test]
    fn oversized_requests_fail_without_side_effects() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let free = pmm.get_free();
        let free_frames = (free / PAGE_SIZE) as usize;

        assert_eq!(pmm.request_pages(pmm.total_frames() + 1), None);
        assert_eq!(pmm.request_pages(free_frames + 1), None);
        assert_eq!(pmm.get_free(), free);

        assert_eq!(pmm.request_pages(free_frames), Some(PhysAddr::new(0)));
        assert_eq!(pmm.get_free(), 0);
        assert_eq!(pmm.request_pages(1), None);
    }

    #[test]
    fn freeing_a_fresh_allocation_releases_nothing() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let ptr = pmm.request_pages(1).unwrap();
        let free = pmm.get_free();

        assert_eq!(pmm.free_pages(ptr), 0);
        assert_eq!(pmm.get_free(), free);
        assert!(pmm.is_used(FrameIndex::containing(ptr)));
    }

    #[test]
    fn free_pages_walks_the_free_run() {
        let mut regions = [MemoryRegion::new(0, 0x9000, MemmapType::Usable)];
        let mut pmm = init(&mut regions).unwrap();
        pmm.request_pages(8).unwrap();
        pmm.release_pages(PhysAddr::new(0x2000), 3);
        let free = pmm.get_free();

        // Frames 2..5 are free and frame 5 is used.
        assert_eq!(pmm.free_pages(PhysAddr::new(0x2000)), 3);
        assert_eq!(pmm.get_free(), free);
        // Off the end of the bitmap: nothing to walk.
        assert_eq!(pmm.free_pages(PhysAddr::new(0x10_0000)), 0);
    }

    #[test]
    fn release_round_trip_restores_free_space() {
        let mut regions = qemu_like();
        let mut pmm = init(&mut regions).unwrap();
        let before = pmm.get_free();

        let ptr = pmm.request_pages(16).unwrap();
        assert_eq!(pmm.get_free(), before - 16 * PAGE_SIZE);
        assert_eq!(pmm.release_pages(ptr, 16), 16);
        assert_eq!(pmm.get_free(), before);

        // Releasing again changes nothing.
        assert_eq!(pmm.release_pages(ptr, 16), 0);
        assert_eq!(pmm.get_free(), before);
    }
}
