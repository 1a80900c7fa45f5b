//! Kernel Logging
//!
//! Backend for the `log` facade used throughout the crate.
//!
//! Records are formatted into a stack buffer (no heap, no lock while
//! formatting) and handed to a [`Console`] as one string, so a line is never
//! split by a concurrent writer that locks per call.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

pub mod pl011;

pub use pl011::Pl011;

/// Bytes available for one formatted line; longer records are truncated.
pub const LINE_CAPACITY: usize = 256;

/// Output sink of the logger.
pub trait Console: Send + Sync {
    /// Write a string as one unit.
    fn puts(&self, s: &str);
}

/// Stack buffer for formatting one log line.
struct MessageBuffer {
    data: [u8; LINE_CAPACITY],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.data[..self.len]) {
            Ok(s) => s,
            // truncation split a multi-byte character
            Err(e) => core::str::from_utf8(&self.data[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let to_copy = bytes.len().min(LINE_CAPACITY - self.len);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

const fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => " WARN",
        Level::Info => " INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Format one record as `[LEVEL] target: message\n` into `out`.
///
/// The newline always survives truncation.
fn format_record(out: &mut MessageBuffer, level: Level, target: &str, args: fmt::Arguments<'_>) {
    let _ = write!(out, "[{}] {}: {}", level_tag(level), target, args);
    if out.len == LINE_CAPACITY {
        out.len -= 1;
        out.len = out.as_str().len();
    }
    let _ = out.write_str("\n");
}

/// `log` backend writing to a [`Console`].
pub struct KernelLogger {
    console: Once<&'static dyn Console>,
    level: AtomicUsize,
}

impl KernelLogger {
    /// Logger with no console attached; records are dropped until one is.
    pub const fn new() -> Self {
        Self {
            console: Once::new(),
            level: AtomicUsize::new(LevelFilter::Info as usize),
        }
    }

    /// Attach the console. Only the first call has an effect.
    pub fn attach(&self, console: &'static dyn Console) {
        self.console.call_once(|| console);
    }

    /// Change the level filter.
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    /// Current level filter.
    pub fn level(&self) -> LevelFilter {
        let raw = self.level.load(Ordering::Relaxed);
        LevelFilter::iter().nth(raw).unwrap_or(LevelFilter::Off)
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(console) = self.console.get() else {
            return;
        };

        let mut line = MessageBuffer::new();
        format_record(&mut line, record.level(), record.target(), *record.args());
        console.puts(line.as_str());
    }

    fn flush(&self) {}
}

/// Global logger instance
static LOGGER: KernelLogger = KernelLogger::new();

/// Install the kernel logger with `console` as its sink.
///
/// Fails if another logger was installed first.
pub fn init(console: &'static dyn Console, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.attach(console);
    LOGGER.set_level(level);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
