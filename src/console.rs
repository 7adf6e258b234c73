//! Kernel console and logger
//!
//! Kernel diagnostics are line buffered into a small fixed-capacity
//! history and, when a host sink is installed, forwarded line by line.
//! The `log` facade is routed here by [`init_logger`].
//!
//! This is the kernel's own diagnostic channel. Output produced by user
//! programs goes through [`crate::kern::services::ConsoleIo`] instead.

use core::fmt::{self, Write};
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Longest line kept; longer lines are split
pub const LINE_CAPACITY: usize = 160;
/// Lines of history retained for inspection
pub const HISTORY_LINES: usize = 64;

/// Host callback receiving each completed line
pub type LineSink = fn(&str);

/// Console writer interface
pub struct Console {
    line: String<LINE_CAPACITY>,
    history: Deque<String<LINE_CAPACITY>, HISTORY_LINES>,
    sink: Option<LineSink>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            line: String::new(),
            history: Deque::new(),
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: Option<LineSink>) {
        self.sink = sink;
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.flush_line();
            return;
        }
        if self.line.len() == LINE_CAPACITY {
            self.flush_line();
        }
        let c = if byte.is_ascii() { byte as char } else { '?' };
        // Room was made above
        let _ = self.line.push(c);
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }

    /// Completed lines, oldest first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(|line| line.as_str())
    }

    /// Text written since the last newline
    pub fn pending(&self) -> &str {
        self.line.as_str()
    }

    /// Clear the console
    pub fn clear(&mut self) {
        self.line.clear();
        self.history.clear();
    }

    fn flush_line(&mut self) {
        let line = core::mem::replace(&mut self.line, String::new());
        if let Some(sink) = self.sink {
            sink(line.as_str());
        }
        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(line);
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console subsystem
pub fn init(sink: Option<LineSink>) {
    let mut console = CONSOLE.lock();
    console.clear();
    console.set_sink(sink);
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

// ============================================================================
// Logger
// ============================================================================

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            print(format_args!(
                "[{:<5} {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;
static LOGGER_INIT: Once<()> = Once::new();

/// Route the `log` facade to the kernel console
///
/// Installing the logger happens once; later calls only change the level.
pub fn init_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        // Another logger may already be installed by an embedding host
        let _ = log::set_logger(&LOGGER);
    });
    log::set_max_level(level);
}
