// Kernel logging (printk) with ring buffer

use super::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level filter (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp_us: u64,
    pub hart: usize,
    pub level: LogLevel,
    pub message: [u8; 192],
    pub len: usize,
}

/// Recent kernel messages, kept for the panic path to replay.
static KERNEL_LOG: Mutex<RingBuffer<LogEntry, 256>> = Mutex::new(RingBuffer::new());

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::console_write(s.as_bytes());
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    struct BufWriter {
        buf: [u8; 192],
        len: usize,
    }

    impl Write for BufWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let room = self.buf.len() - self.len;
            let take = core::cmp::min(room, s.len());
            self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
            self.len += take;
            Ok(())
        }
    }

    let mut bw = BufWriter {
        buf: [0u8; 192],
        len: 0,
    };
    let _ = bw.write_fmt(args);

    let hart = crate::arch::hart_id();
    let entry = LogEntry {
        timestamp_us: crate::time::timestamp_us(),
        hart,
        level,
        message: bw.buf,
        len: bw.len,
    };

    KERNEL_LOG.lock().push(entry);

    let mut writer = ConsoleWriter;
    let _ = write!(writer, "[{}] [{}] ", level.as_str(), hart);
    crate::arch::console_write(&bw.buf[..bw.len]);
    crate::arch::console_write(b"\n");
}

/// Drain the buffered log tail; used by the panic path.
pub fn drain_recent() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.lock().drain_all()
}

/// Drain the buffer and replay its last `max` entries to the console.
/// Panic path only; the buffer does not survive the replay.
pub fn replay_recent(max: usize) {
    let entries = drain_recent();
    let start = entries.len().saturating_sub(max);
    for e in &entries[start..] {
        let mut writer = ConsoleWriter;
        let _ = write!(
            writer,
            "  [{:>10}us] [{}] [{}] ",
            e.timestamp_us,
            e.hart,
            e.level.as_str()
        );
        crate::arch::console_write(&e.message[..e.len]);
        crate::arch::console_write(b"\n");
    }
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        set_level(LogLevel::Warn);
        assert!(is_enabled(LogLevel::Error));
        assert!(is_enabled(LogLevel::Warn));
        assert!(!is_enabled(LogLevel::Info));
        set_level(LogLevel::Info);
    }
}
