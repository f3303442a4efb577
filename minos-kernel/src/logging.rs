//! Kernel logging
//!
//! A `log` crate backend that stamps records with the tick counter and
//! writes them through the arch debug console. Formatting happens in a
//! stack buffer so the logger never allocates; it is callable from any
//! context, interrupt handlers included.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use minos_arch::cpu;

/// Longest single log line kept; the rest is cut.
const LINE_SIZE: usize = 256;

struct LineBuffer {
    data: [u8; LINE_SIZE],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            data: [0; LINE_SIZE],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = LINE_SIZE - self.len;
        let take = bytes.len().min(room);
        self.data[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tick = crate::sched::uptime_ticks();
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut line = LineBuffer::new();
        let _ = write!(
            line,
            "[{:>8}] {} {}: {}\n",
            tick,
            level,
            record.target(),
            record.args()
        );
        cpu::debug_write(line.as_bytes());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. First boot step, so everything after it can
/// speak.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_bounds() {
        let mut line = LineBuffer::new();
        for _ in 0..LINE_SIZE {
            let _ = line.write_str("xy");
        }
        assert_eq!(line.as_bytes().len(), LINE_SIZE);
    }
}
