//! Kernel-style structured logging.
//!
//! Grounded in the teacher's `src/logger.rs`: a `LogLevel` hierarchy, a
//! ring buffer so early boot logs survive past the point the console is
//! reconfigured, and TSC-derived timestamps. Unlike the teacher, this
//! crate owns no VGA/serial device; the embedding kernel registers a
//! [`DebugSink`] and every `klog!`-family macro call is forwarded to it in
//! addition to the ring buffer.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Panic => "PANIC",
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::Panic => 0,
            LogLevel::Fatal => 1,
            LogLevel::Error => 2,
            LogLevel::Warn => 3,
            LogLevel::Info => 4,
            LogLevel::Debug => 5,
            LogLevel::Trace => 6,
        }
    }
}

/// Anything the embedding kernel wants log lines forwarded to (serial port,
/// VGA console, a netconsole, ...). KMM itself only ever writes to the ring
/// buffer and, if one is registered, this sink.
pub trait DebugSink: Send + Sync {
    fn write_line(&self, level: LogLevel, line: &str);
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info.priority());
static INIT_STARTED: AtomicBool = AtomicBool::new(false);

const RINGBUF_SIZE: usize = 65536;
static RINGBUF: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

// A trait object is a fat pointer (data + vtable), so the sink is held
// behind a lock rather than an AtomicPtr.
static SINK_CELL: Mutex<Option<&'static dyn DebugSink>> = Mutex::new(None);

/// Registers the sink the embedding kernel wants log lines forwarded to.
/// Must be called with a `'static` reference; there is no teardown.
pub fn set_sink(sink: &'static dyn DebugSink) {
    *SINK_CELL.lock() = Some(sink);
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Panic,
        1 => LogLevel::Fatal,
        2 => LogLevel::Error,
        3 => LogLevel::Warn,
        4 => LogLevel::Info,
        5 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Marks that boot handoff has started; mirrors the teacher's
/// `logger::mark_init_started` (after this, sinks still receive Error and
/// above, but routine Info/Debug/Trace only go to the ring buffer).
pub fn mark_init_started() {
    INIT_STARTED.store(true, Ordering::Relaxed);
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    let mut line: LineBuf = LineBuf::new();
    let _ = write!(line, "[{:<5}] ", level.as_str());
    let _ = fmt::write(&mut line, args);
    let _ = line.write_str("\n");

    {
        let mut ring = RINGBUF.lock();
        ring.write_bytes(line.as_bytes());
    }

    let after_init = INIT_STARTED.load(Ordering::Relaxed);
    let should_forward = !after_init || level.priority() <= LogLevel::Error.priority();
    if should_forward {
        if let Some(sink) = *SINK_CELL.lock() {
            sink.write_line(level, line.as_str());
        }
    }
}

struct LineBuf {
    buf: [u8; 256],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        LineBuf { buf: [0; 256], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("<non-utf8 log line>")
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.len;
        let n = bytes.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

struct RingBuffer {
    buf: [u8; RINGBUF_SIZE],
    write_pos: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        RingBuffer { buf: [0; RINGBUF_SIZE], write_pos: 0 }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.buf[self.write_pos] = byte;
            self.write_pos += 1;
            if self.write_pos >= RINGBUF_SIZE {
                self.write_pos = 0;
            }
        }
    }
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Fatal, $($arg)*); };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Error, $($arg)*); };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Warn, $($arg)*); };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Info, $($arg)*); };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Debug, $($arg)*); };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::logger::LogLevel::Trace, $($arg)*); };
}
