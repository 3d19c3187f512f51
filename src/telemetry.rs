//! Append-only, crash-tolerant telemetry log.
//!
//! The device runs on battery and can lose power mid-write, so the single
//! append handle is cycled every 50th write (bounds filesystem corruption
//! exposure) and flushed every 10th write (bounds unflushed loss to ≤9
//! lines). Logging is strictly best-effort: with no usable storage every
//! append is a silent no-op — nothing blocks, nothing errors upward.

use core::fmt::Write;

use heapless::String;

use crate::defaults::{LOG_FLUSH_INTERVAL, LOG_REOPEN_INTERVAL, LOG_SIZE_PROBE_INTERVAL_MS};

/// Storage access for the single append-only log destination.
pub trait LogStorage {
    /// Whether the backing store is usable right now.
    fn available(&mut self) -> bool;
    /// (Re)open the append handle; false when the open fails.
    fn open_append(&mut self) -> bool;
    fn close(&mut self);
    /// Append one already-formatted line.
    fn write_line(&mut self, line: &str) -> bool;
    fn flush(&mut self);
    /// Non-blocking size probe; None when not cheaply known.
    fn size(&mut self) -> Option<u64>;
}

pub struct TelemetryLog<S: LogStorage> {
    storage: S,
    open: bool,
    writes: u32,
    last_size_probe_ms: Option<u64>,
}

impl<S: LogStorage> TelemetryLog<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            open: false,
            writes: 0,
            last_size_probe_ms: None,
        }
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Append one line, prefixed with the supplied timestamp.
    ///
    /// Silent no-op when storage is unavailable or the handle cannot be
    /// (re)opened.
    pub fn append(&mut self, timestamp: &str, uptime_ms: u64, line: &str) {
        if !self.storage.available() {
            return;
        }

        if !self.open || self.writes % LOG_REOPEN_INTERVAL == 0 {
            if self.open {
                self.storage.close();
            }
            if !self.storage.open_append() {
                self.open = false;
                return;
            }
            self.open = true;
        }

        let mut entry: String<280> = String::new();
        if write!(entry, "[{}] {}", timestamp, line).is_err() {
            return;
        }
        if !self.storage.write_line(&entry) {
            self.open = false;
            return;
        }
        self.writes = self.writes.wrapping_add(1);

        if self.writes % LOG_FLUSH_INTERVAL == 0 {
            self.storage.flush();
        }

        let probe_due = match self.last_size_probe_ms {
            Some(last) => uptime_ms.saturating_sub(last) >= LOG_SIZE_PROBE_INTERVAL_MS,
            None => true,
        };
        if probe_due {
            self.last_size_probe_ms = Some(uptime_ms);
            if let Some(size) = self.storage.size() {
                log::debug!("telemetry log size: {} bytes", size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockStorage {
        available: bool,
        opens: u32,
        closes: u32,
        flushes: u32,
        size_probes: u32,
        lines: Vec<std::string::String>,
    }

    impl LogStorage for MockStorage {
        fn available(&mut self) -> bool {
            self.available
        }
        fn open_append(&mut self) -> bool {
            self.opens += 1;
            true
        }
        fn close(&mut self) {
            self.closes += 1;
        }
        fn write_line(&mut self, line: &str) -> bool {
            self.lines.push(line.into());
            true
        }
        fn flush(&mut self) {
            self.flushes += 1;
        }
        fn size(&mut self) -> Option<u64> {
            self.size_probes += 1;
            Some(1234)
        }
    }

    fn log_with_storage() -> TelemetryLog<MockStorage> {
        TelemetryLog::new(MockStorage {
            available: true,
            ..Default::default()
        })
    }

    #[test]
    fn lines_are_timestamp_prefixed() {
        let mut log = log_with_storage();
        log.append("2024-03-01 12:00:00", 0, "scan started");
        assert_eq!(
            log.storage_mut().lines[0],
            "[2024-03-01 12:00:00] scan started"
        );
    }

    #[test]
    fn unavailable_storage_is_silent_noop() {
        let mut log = TelemetryLog::new(MockStorage::default());
        for _ in 0..20 {
            log.append("00:00:01", 0, "dropped");
        }
        let storage = log.storage_mut();
        assert_eq!(storage.opens, 0);
        assert_eq!(storage.lines.len(), 0);
        assert_eq!(storage.flushes, 0);
    }

    #[test]
    fn flushes_every_tenth_write() {
        let mut log = log_with_storage();
        for i in 0..25 {
            log.append("00:00:01", i, "line");
        }
        assert_eq!(log.storage_mut().flushes, 2);
    }

    #[test]
    fn reopens_every_fiftieth_write() {
        let mut log = log_with_storage();
        for i in 0..101 {
            log.append("00:00:01", i, "line");
        }
        let storage = log.storage_mut();
        // Initial open plus one cycle after each 50 writes
        assert_eq!(storage.opens, 3);
        assert_eq!(storage.closes, 2);
        assert_eq!(storage.lines.len(), 101);
    }

    #[test]
    fn size_probe_rate_limited() {
        let mut log = log_with_storage();
        log.append("00:00:01", 0, "a");
        log.append("00:00:02", 1_000, "b");
        log.append("00:00:09", 9_999, "c");
        assert_eq!(log.storage_mut().size_probes, 1);
        log.append("00:00:10", 10_000, "d");
        assert_eq!(log.storage_mut().size_probes, 2);
    }

    #[test]
    fn failed_write_marks_handle_closed() {
        struct FlakyStorage {
            fail_writes: bool,
            opens: u32,
            lines: u32,
        }
        impl LogStorage for FlakyStorage {
            fn available(&mut self) -> bool {
                true
            }
            fn open_append(&mut self) -> bool {
                self.opens += 1;
                true
            }
            fn close(&mut self) {}
            fn write_line(&mut self, _line: &str) -> bool {
                if self.fail_writes {
                    return false;
                }
                self.lines += 1;
                true
            }
            fn flush(&mut self) {}
            fn size(&mut self) -> Option<u64> {
                None
            }
        }

        let mut log = TelemetryLog::new(FlakyStorage {
            fail_writes: true,
            opens: 0,
            lines: 0,
        });
        log.append("00:00:01", 0, "lost");
        log.storage_mut().fail_writes = false;
        log.append("00:00:02", 0, "kept");
        // The handle was reopened after the failed write
        assert_eq!(log.storage_mut().opens, 2);
        assert_eq!(log.storage_mut().lines, 1);
    }
}
