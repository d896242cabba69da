//! Byte sinks: the 16550 UART and the debug console port.

use bitflags::bitflags;
use core::fmt::{self, Write};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{DEBUG_CON_PORT, SERIAL_BAUD, SERIAL_PORT};
use crate::io::{inb, outb};

/// The UART's input clock divided by 16.
const UART_CLOCK: u32 = 115_200;

// Register offsets from the base port.
// https://en.wikibooks.org/wiki/Serial_Programming/8250_UART_Programming
const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

bitflags! {
    struct LineControl: u8 {
        const WORD_8 = 0b11;
        /// Divisor Latch Access Bit: DATA and INTERRUPT_ENABLE hold the baud divisor.
        const DLAB = 1 << 7;
    }
}

bitflags! {
    struct ModemControl: u8 {
        const DTR = 1 << 0;
        const RTS = 1 << 1;
        const OUT1 = 1 << 2;
        const OUT2 = 1 << 3;
        const LOOPBACK = 1 << 4;
    }
}

bitflags! {
    struct LineStatus: u8 {
        const TX_EMPTY = 1 << 5;
    }
}

/// Divisor latch value for `baud`, never zero.
pub const fn divisor(baud: u32) -> u16 {
    if baud == 0 {
        return u16::MAX;
    }
    let d = UART_CLOCK / baud;
    if d == 0 {
        1
    } else if d > u16::MAX as u32 {
        u16::MAX
    } else {
        d as u16
    }
}

/// Byte sent through the loopback path during init.
const LOOPBACK_BYTE: u8 = 0x69;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// The loopback byte did not come back: no UART, or a broken one.
    FailedToInit { sent: u8, got: u8 },
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SerialError::FailedToInit { sent, got } => {
                write!(f, "Failed to init port (sent {:#04x}, read {:#04x})", sent, got)
            }
        }
    }
}

fn check_echo(sent: u8, got: u8) -> Result<(), SerialError> {
    if sent == got {
        Ok(())
    } else {
        Err(SerialError::FailedToInit { sent, got })
    }
}

pub struct Serial {
    port: u16,
}

impl Serial {
    /// Program the UART at `port` for 8N1 at `baud`, interrupts off, FIFOs on,
    /// then check it echoes a byte in loopback mode.
    pub fn init(port: u16, baud: u32) -> Result<Self, SerialError> {
        let [lo, hi] = divisor(baud).to_le_bytes();
        let echo = unsafe {
            outb(port + INTERRUPT_ENABLE, 0);

            outb(port + LINE_CONTROL, LineControl::DLAB.bits());
            outb(port + DATA, lo);
            outb(port + INTERRUPT_ENABLE, hi);
            outb(port + LINE_CONTROL, LineControl::WORD_8.bits());

            // Enable and clear both FIFOs, 14 byte trigger.
            outb(port + FIFO_CONTROL, 0xc7);

            let loopback = ModemControl::RTS | ModemControl::OUT1 | ModemControl::OUT2;
            outb(port + MODEM_CONTROL, (loopback | ModemControl::LOOPBACK).bits());
            outb(port + DATA, LOOPBACK_BYTE);
            inb(port + DATA)
        };
        check_echo(LOOPBACK_BYTE, echo)?;

        let normal = ModemControl::DTR | ModemControl::RTS | ModemControl::OUT1 | ModemControl::OUT2;
        unsafe { outb(port + MODEM_CONTROL, normal.bits()) };

        Ok(Self { port })
    }

    fn status(&self) -> LineStatus {
        LineStatus::from_bits_truncate(unsafe { inb(self.port + LINE_STATUS) })
    }

    pub fn tx(&mut self, byte: u8) {
        while !self.status().contains(LineStatus::TX_EMPTY) {
            core::hint::spin_loop();
        }
        unsafe { outb(self.port + DATA, byte) }
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(|b| self.tx(b));
        Ok(())
    }
}

/// Port 0xE9 hack: every byte written shows up on the emulator's debug console.
/// Needs no setup, so it is usable before anything else is initialized.
pub struct DebugCon;

impl Write for DebugCon {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            unsafe { outb(DEBUG_CON_PORT, byte) }
        }
        Ok(())
    }
}

/// Raw early output for boot contract failures.
pub fn debug_print(s: &str) {
    let _ = DebugCon.write_str(s);
}

lazy_static! {
    /// A port that failed its loopback check is left out; DebugCon still
    /// gets every byte.
    pub static ref COM1: Mutex<Result<Serial, SerialError>> =
        Mutex::new(Serial::init(SERIAL_PORT, SERIAL_BAUD));
}

/// Whether COM1 came up.
pub fn com1_status() -> Result<(), SerialError> {
    COM1.lock().as_ref().map(|_| ()).map_err(|err| *err)
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // Neither sink can fail.
    if let Ok(com1) = COM1.lock().as_mut() {
        let _ = com1.write_fmt(args);
    }
    let _ = DebugCon.write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
