//! Linear framebuffer handed over by the boot loader.
//!
//! Only solid fills live here; glyph rendering belongs to the text renderer.

use ::volatile::Volatile;

use crate::boot::FramebufferInfo;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

impl Color {
    /// 8-bit per channel value of the classic 16 colour palette.
    pub const fn rgb(self) -> (u8, u8, u8) {
        match self {
            Color::Black => (0x00, 0x00, 0x00),
            Color::Blue => (0x00, 0x00, 0xaa),
            Color::Green => (0x00, 0xaa, 0x00),
            Color::Cyan => (0x00, 0xaa, 0xaa),
            Color::Red => (0xaa, 0x00, 0x00),
            Color::Magenta => (0xaa, 0x00, 0xaa),
            Color::Brown => (0xaa, 0x55, 0x00),
            Color::LightGray => (0xaa, 0xaa, 0xaa),
            Color::DarkGray => (0x55, 0x55, 0x55),
            Color::LightBlue => (0x55, 0x55, 0xff),
            Color::LightGreen => (0x55, 0xff, 0x55),
            Color::LightCyan => (0x55, 0xff, 0xff),
            Color::LightRed => (0xff, 0x55, 0x55),
            Color::Pink => (0xff, 0x55, 0xff),
            Color::Yellow => (0xff, 0xff, 0x55),
            Color::White => (0xff, 0xff, 0xff),
        }
    }

    /// ANSI SGR foreground code; add 10 for the background code.
    pub const fn ansi(self) -> u8 {
        let (base, bright) = match self {
            Color::Black => (30, false),
            Color::Red => (31, false),
            Color::Green => (32, false),
            Color::Brown => (33, false),
            Color::Blue => (34, false),
            Color::Magenta => (35, false),
            Color::Cyan => (36, false),
            Color::LightGray => (37, false),
            Color::DarkGray => (30, true),
            Color::LightRed => (31, true),
            Color::LightGreen => (32, true),
            Color::Yellow => (33, true),
            Color::LightBlue => (34, true),
            Color::Pink => (35, true),
            Color::LightCyan => (36, true),
            Color::White => (37, true),
        };
        if bright {
            base + 60
        } else {
            base
        }
    }
}

/// Where each channel sits inside a 32-bit pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub red: (u8, u8),
    pub green: (u8, u8),
    pub blue: (u8, u8),
}

impl PixelFormat {
    /// Channels are `(mask_size, mask_shift)` pairs.
    pub fn encode(&self, color: Color) -> u32 {
        let (r, g, b) = color.rgb();
        channel(r, self.red) | channel(g, self.green) | channel(b, self.blue)
    }
}

fn channel(value: u8, (size, shift): (u8, u8)) -> u32 {
    if size == 0 {
        return 0;
    }
    let size = size.min(8);
    ((value as u32) >> (8 - size)) << shift
}

pub struct Framebuffer {
    base: *mut Volatile<u32>,
    width: usize,
    height: usize,
    /// Pixels per scanline.
    stride: usize,
    format: PixelFormat,
}

// Only ever touched from the single kernel context.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    /// # Safety
    /// `base` must point to `stride * height` writable 32-bit pixels.
    pub unsafe fn new(
        base: *mut u32,
        width: usize,
        height: usize,
        stride: usize,
        format: PixelFormat,
    ) -> Self {
        Self {
            base: base as *mut Volatile<u32>,
            width,
            height,
            stride,
            format,
        }
    }

    /// # Safety
    /// The descriptor must describe a mapped 32 bpp framebuffer.
    pub unsafe fn from_boot(info: &FramebufferInfo) -> Self {
        Self::new(
            info.address as *mut u32,
            info.width as usize,
            info.height as usize,
            info.pitch as usize / 4,
            PixelFormat {
                red: (info.red_mask_size, info.red_mask_shift),
                green: (info.green_mask_size, info.green_mask_shift),
                blue: (info.blue_mask_size, info.blue_mask_shift),
            },
        )
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn row(&mut self, y: usize) -> &mut [Volatile<u32>] {
        unsafe { core::slice::from_raw_parts_mut(self.base.add(y * self.stride), self.width) }
    }

    pub fn fill(&mut self, color: Color) {
        let pixel = self.format.encode(color);
        for y in 0..self.height {
            for px in self.row(y) {
                px.write(pixel);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const XRGB: PixelFormat = PixelFormat {
        red: (8, 16),
        green: (8, 8),
        blue: (8, 0),
    };

    #[test]
    fn encodes_xrgb8888() {
        assert_eq!(XRGB.encode(Color::Red), 0x00aa_0000);
        assert_eq!(XRGB.encode(Color::White), 0x00ff_ffff);
        assert_eq!(XRGB.encode(Color::Black), 0);
    }

    #[test]
    fn narrow_channels_keep_high_bits() {
        let rgb565 = PixelFormat {
            red: (5, 11),
            green: (6, 5),
            blue: (5, 0),
        };
        assert_eq!(rgb565.encode(Color::White), 0xffff);
        assert_eq!(rgb565.encode(Color::Red), (0xaa >> 3) << 11);
    }

    #[test]
    fn ansi_codes() {
        assert_eq!(Color::Red.ansi(), 31);
        assert_eq!(Color::Black.ansi() + 10, 40);
        assert_eq!(Color::White.ansi(), 97);
    }

    #[test]
    fn fill_respects_stride() {
        // 3x2 visible, 4 pixels per scanline.
        let mut mem = vec![0xdead_beefu32; 8];
        let mut fb = unsafe { Framebuffer::new(mem.as_mut_ptr(), 3, 2, 4, XRGB) };
        fb.fill(Color::Blue);
        assert_eq!(&mem[0..3], &[0xaa, 0xaa, 0xaa]);
        assert_eq!(mem[3], 0xdead_beef);
        assert_eq!(&mem[4..7], &[0xaa, 0xaa, 0xaa]);
        assert_eq!(mem[7], 0xdead_beef);
    }
}
