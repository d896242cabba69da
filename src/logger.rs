//! Log data with various log levels.
//! NIH from log crate:
//! records go to both COM1 and the debug console.

use core::fmt::{self, write, Write};

use crate::config::LOG_LEVEL;

#[derive(Debug, Clone, Copy, PartialOrd, PartialEq)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Trace => "\x1b[1mTRACE",
            Level::Debug => "\x1b[1;36mDEBUG",
            Level::Info => "\x1b[1;34mINFO ",
            Level::Warn => "\x1b[1;33mWARN ",
            Level::Error => "\x1b[1;31mERROR",
        }
    }
}

pub struct Record<'a> {
    pub line: u32,
    pub file: &'a str,
    pub level: Level,
}

struct Logger;

#[cfg(not(test))]
impl Write for Logger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::serial::_print(format_args!("{}", s));
        Ok(())
    }
}

// Host unit tests have no UART; the test harness captures stdout.
#[cfg(test)]
impl Write for Logger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }
}

pub fn enabled(level: Level) -> bool {
    level >= LOG_LEVEL
}

pub fn _log(args: core::fmt::Arguments, record: Record) {
    if !enabled(record.level) {
        return;
    }

    let _ = emit(&mut Logger, args, &record);
}

fn emit(out: &mut impl Write, args: core::fmt::Arguments, record: &Record) -> fmt::Result {
    out.write_str(record.level.tag())?;
    out.write_str("\x1b[1;39m")?;
    write!(out, " [{}:{}] ", record.file, record.line)?;
    out.write_str("\x1b[0m")?;

    write(out, args)?;
    out.write_str("\n")
}

#[macro_export]
macro_rules! log_macro {
    ($level: expr, $($arg:tt)*) => (
        $crate::logger::_log(format_args!($($arg)*),
        $crate::logger::Record { line: line!(), file: file!(), level: $level })
    );
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => ($crate::log_macro!($crate::logger::Level::Trace, $($arg)+))
}
#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => ($crate::log_macro!($crate::logger::Level::Debug, $($arg)+))
}
#[macro_export]
macro_rules! log {
    ($($arg:tt)+) => ($crate::log_macro!($crate::logger::Level::Info, $($arg)+))
}
#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => ($crate::log_macro!($crate::logger::Level::Warn, $($arg)+))
}
#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => ($crate::log_macro!($crate::logger::Level::Error, $($arg)+))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn levels_below_threshold_are_dropped() {
        assert!(!enabled(Level::Trace));
        assert!(enabled(Level::Debug));
        assert!(enabled(Level::Error));
    }

    #[test]
    fn record_has_tag_location_and_message() {
        let mut out = String::new();
        let record = Record {
            line: 42,
            file: "src/pmm.rs",
            level: Level::Warn,
        };
        emit(&mut out, format_args!("{} frames", 3), &record).unwrap();
        assert!(out.starts_with("\x1b[1;33mWARN "));
        assert!(out.contains(" [src/pmm.rs:42] "));
        assert!(out.ends_with("\x1b[0m3 frames\n"));
    }
}
