//! Legacy 8259 PIC pair.
//!
//! Remapped so IRQ 0-15 land on vectors 0x20..0x30 instead of on top of the
//! CPU exceptions, then fully masked until a driver asks for a line.

use pic8259::ChainedPics;
use spin::Mutex;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub fn init() {
    let mut pics = PICS.lock();
    unsafe {
        pics.initialize();
        pics.write_masks(0xff, 0xff);
    }
}
