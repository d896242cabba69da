//! Kernel text console.
//!
//! Text goes to the serial sinks; the framebuffer, once attached, only takes
//! solid clears. Colours are mirrored to the terminal with ANSI escapes.

use core::fmt::{self, Write};

use spin::Mutex;

use crate::framebuffer::{Color, Framebuffer};

pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

pub struct Console {
    fb: Option<Framebuffer>,
    fg: Color,
    bg: Color,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            fb: None,
            fg: Color::White,
            bg: Color::Black,
        }
    }

    pub fn attach(&mut self, fb: Framebuffer) {
        self.fb = Some(fb);
    }

    /// Width and height of the attached screen, in pixels.
    pub fn screen_size(&self) -> Option<(usize, usize)> {
        self.fb.as_ref().map(|fb| (fb.width(), fb.height()))
    }

    pub fn colors(&self) -> (Color, Color) {
        (self.fg, self.bg)
    }

    pub fn set_colors(&mut self, fg: Color, bg: Color) {
        self.fg = fg;
        self.bg = bg;
    }

    /// Paint the screen with the background colour and home the terminal.
    pub fn clear(&mut self) {
        if let Some(fb) = self.fb.as_mut() {
            fb.fill(self.bg);
        }
        let _ = write_clear(&mut Sink, self.fg, self.bg);
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Sink.write_str(s)
    }
}

fn write_clear(out: &mut impl Write, fg: Color, bg: Color) -> fmt::Result {
    write!(out, "\x1b[{}m\x1b[{}m\x1b[2J\x1b[H", fg.ansi(), bg.ansi() + 10)
}

struct Sink;

#[cfg(not(test))]
impl Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::serial::_print(format_args!("{}", s));
        Ok(())
    }
}

#[cfg(test)]
impl Write for Sink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}
