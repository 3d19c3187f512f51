//! Clock authority — reconciles GPS time, the battery-backed RTC, and a
//! boot-relative fallback into a single timestamp source.
//!
//! The RTC is authoritative when present and queried directly on every
//! call. Without one, timestamps degrade to boot-relative `HH:MM:SS`
//! wrapping at 24 h — explicitly non-monotonic across a later
//! RTC-becomes-available transition, which callers must tolerate.

use core::fmt::Write;

use heapless::String;

use crate::defaults::{
    GPS_YEAR_MAX, GPS_YEAR_MIN, RTC_DRIFT_THRESHOLD_SECS, RTC_SYNC_INTERVAL_MS,
};
use crate::mesh::{MeshPort, MeshTx};
use crate::protocol::PayloadString;
use crate::telemetry::{LogStorage, TelemetryLog};

/// "YYYY-MM-DD HH:MM:SS" or boot-relative "HH:MM:SS"
pub type TimestampString = String<20>;

/// Calendar date-time as held by the RTC and decoded from GPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CivilDateTime {
    /// Seconds since the Unix epoch (days-from-civil algorithm).
    pub fn epoch(&self) -> i64 {
        let y = i64::from(self.year) - i64::from(self.month <= 2);
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = y - era * 400;
        let m = i64::from(self.month);
        let doy = (153 * (m + if m > 2 { -3 } else { 9 }) + 2) / 5 + i64::from(self.day) - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = era * 146_097 + doe - 719_468;
        days * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.minute) * 60
            + i64::from(self.second)
    }

    /// Plausibility check for a GPS-decoded reading.
    fn in_gps_range(&self) -> bool {
        (GPS_YEAR_MIN..=GPS_YEAR_MAX).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour <= 23
            && self.minute <= 59
            && self.second <= 59
    }

    fn write_to(&self, out: &mut TimestampString) {
        let _ = write!(
            out,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        );
    }
}

/// Battery-backed clock access.
pub trait RtcDevice {
    /// Current calendar time; None when the bus read fails.
    fn now(&mut self) -> Option<CivilDateTime>;
    /// Write a new calendar time; false when the write fails.
    fn adjust(&mut self, dt: &CivilDateTime) -> bool;
}

/// One decoded GPS time report, validity flags included.
#[derive(Debug, Clone, Copy)]
pub struct GpsTimeReading {
    pub date_valid: bool,
    pub time_valid: bool,
    pub dt: CivilDateTime,
}

/// Where timestamps currently come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    RtcSynced,
    RtcUnsynced,
    BootRelative,
}

/// Result of a GPS sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped,
    Committed,
}

/// Boot-relative `HH:MM:SS`, wrapping at 24 h.
pub fn boot_hms(uptime_ms: u64) -> String<8> {
    let secs = uptime_ms / 1000;
    let mut out = String::new();
    let _ = write!(
        out,
        "{:02}:{:02}:{:02}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    );
    out
}

pub struct ClockAuthority<R: RtcDevice> {
    rtc: Option<R>,
    synced: bool,
    last_sync_ms: Option<u64>,
    last_sync_epoch: Option<i64>,
}

impl<R: RtcDevice> ClockAuthority<R> {
    pub fn new(rtc: Option<R>) -> Self {
        Self {
            rtc,
            synced: false,
            last_sync_ms: None,
            last_sync_epoch: None,
        }
    }

    pub fn source(&self) -> ClockSource {
        match (&self.rtc, self.synced) {
            (Some(_), true) => ClockSource::RtcSynced,
            (Some(_), false) => ClockSource::RtcUnsynced,
            (None, _) => ClockSource::BootRelative,
        }
    }

    pub fn last_sync_epoch(&self) -> Option<i64> {
        self.last_sync_epoch
    }

    pub fn last_sync_ms(&self) -> Option<u64> {
        self.last_sync_ms
    }

    /// Current timestamp: RTC calendar time when available, boot-relative
    /// `HH:MM:SS` otherwise (also the fallback on a failed RTC read).
    pub fn now(&mut self, uptime_ms: u64) -> TimestampString {
        if let Some(rtc) = self.rtc.as_mut() {
            if let Some(dt) = rtc.now() {
                let mut out = TimestampString::new();
                dt.write_to(&mut out);
                return out;
            }
        }
        let mut out = TimestampString::new();
        let _ = out.push_str(boot_hms(uptime_ms).as_str());
        out
    }

    /// Current Unix epoch, when an RTC is present and readable.
    pub fn epoch(&mut self) -> Option<i64> {
        self.rtc.as_mut()?.now().map(|dt| dt.epoch())
    }

    /// Reconcile the RTC against a decoded GPS time report.
    ///
    /// No-op unless an RTC is present, the report carries valid date and
    /// time, at least an hour passed since the previous commit, and the
    /// decoded fields are plausible. The RTC is rewritten only when the
    /// drift exceeds the threshold, avoiding wear and jitter-driven
    /// rewrites. A commit is audited to the telemetry log and announced
    /// over the mesh best-effort.
    pub fn try_sync_from_gps<S: LogStorage, P: MeshPort>(
        &mut self,
        reading: &GpsTimeReading,
        uptime_ms: u64,
        telemetry: &mut TelemetryLog<S>,
        mesh: &mut MeshTx<P>,
        node_id: &str,
    ) -> SyncOutcome {
        if self.rtc.is_none() || !reading.date_valid || !reading.time_valid {
            return SyncOutcome::Skipped;
        }
        if let Some(last) = self.last_sync_ms {
            if uptime_ms.saturating_sub(last) < RTC_SYNC_INTERVAL_MS {
                return SyncOutcome::Skipped;
            }
        }
        let dt = reading.dt;
        if !dt.in_gps_range() {
            return SyncOutcome::Skipped;
        }

        let gps_epoch = dt.epoch();
        let drift = {
            let rtc = match self.rtc.as_mut() {
                Some(r) => r,
                None => return SyncOutcome::Skipped,
            };
            let rtc_now = match rtc.now() {
                Some(now) => now,
                None => return SyncOutcome::Skipped,
            };
            let drift = (gps_epoch - rtc_now.epoch()).abs();
            if drift <= RTC_DRIFT_THRESHOLD_SECS {
                return SyncOutcome::Skipped;
            }
            if !rtc.adjust(&dt) {
                log::warn!("RTC adjust failed, sync not committed");
                return SyncOutcome::Skipped;
            }
            drift
        };

        self.synced = true;
        self.last_sync_ms = Some(uptime_ms);
        self.last_sync_epoch = Some(gps_epoch);

        let mut when = TimestampString::new();
        dt.write_to(&mut when);
        log::info!("RTC synced from GPS: {} UTC (drift {}s)", when, drift);

        let mut audit = String::<80>::new();
        let _ = write!(audit, "RTC synced from GPS: {} (drift {}s)", when, drift);
        telemetry.append(&when, uptime_ms, &audit);

        let mut announce = PayloadString::new();
        if write!(announce, "{}: RTC_SYNC: {}", node_id, audit).is_ok() {
            mesh.send(&announce);
        }

        SyncOutcome::Committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshPort;
    use crate::telemetry::LogStorage;

    struct FakeRtc {
        now: CivilDateTime,
        fail_read: bool,
        adjusted: Vec<CivilDateTime>,
    }

    impl FakeRtc {
        fn at(dt: CivilDateTime) -> Self {
            Self {
                now: dt,
                fail_read: false,
                adjusted: Vec::new(),
            }
        }
    }

    impl RtcDevice for FakeRtc {
        fn now(&mut self) -> Option<CivilDateTime> {
            (!self.fail_read).then_some(self.now)
        }
        fn adjust(&mut self, dt: &CivilDateTime) -> bool {
            self.now = *dt;
            self.adjusted.push(*dt);
            true
        }
    }

    struct NullStorage {
        lines: Vec<std::string::String>,
    }

    impl LogStorage for NullStorage {
        fn available(&mut self) -> bool {
            true
        }
        fn open_append(&mut self) -> bool {
            true
        }
        fn close(&mut self) {}
        fn write_line(&mut self, line: &str) -> bool {
            self.lines.push(line.into());
            true
        }
        fn flush(&mut self) {}
        fn size(&mut self) -> Option<u64> {
            None
        }
    }

    struct NullPort {
        sent: Vec<std::string::String>,
    }

    impl MeshPort for NullPort {
        fn free_capacity(&mut self) -> usize {
            4096
        }
        fn write_line(&mut self, payload: &str) {
            self.sent.push(payload.into());
        }
    }

    fn dt(y: u16, mo: u8, d: u8, h: u8, mi: u8, s: u8) -> CivilDateTime {
        CivilDateTime {
            year: y,
            month: mo,
            day: d,
            hour: h,
            minute: mi,
            second: s,
        }
    }

    fn harness() -> (TelemetryLog<NullStorage>, MeshTx<NullPort>) {
        (
            TelemetryLog::new(NullStorage { lines: Vec::new() }),
            MeshTx::new(NullPort { sent: Vec::new() }),
        )
    }

    fn valid_reading(d: CivilDateTime) -> GpsTimeReading {
        GpsTimeReading {
            date_valid: true,
            time_valid: true,
            dt: d,
        }
    }

    // ── Epoch conversion ────────────────────────────────────────────

    #[test]
    fn epoch_conversion_known_values() {
        assert_eq!(dt(1970, 1, 1, 0, 0, 0).epoch(), 0);
        assert_eq!(dt(2024, 3, 1, 12, 0, 0).epoch(), 1_709_294_400);
        // Leap day
        assert_eq!(
            dt(2024, 2, 29, 0, 0, 0).epoch() + 86_400,
            dt(2024, 3, 1, 0, 0, 0).epoch()
        );
    }

    // ── now() rendering ─────────────────────────────────────────────

    #[test]
    fn now_prefers_rtc() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 11, 59, 57))));
        assert_eq!(clock.now(123).as_str(), "2024-03-01 11:59:57");
        assert_eq!(clock.epoch(), Some(dt(2024, 3, 1, 11, 59, 57).epoch()));
        assert_eq!(clock.source(), ClockSource::RtcUnsynced);
    }

    #[test]
    fn now_falls_back_to_boot_relative() {
        let mut clock: ClockAuthority<FakeRtc> = ClockAuthority::new(None);
        assert_eq!(clock.source(), ClockSource::BootRelative);
        // 1h 2m 3s after boot
        assert_eq!(clock.now(3_723_000).as_str(), "01:02:03");
        // Wraps at 24 h
        assert_eq!(clock.now(24 * 3_600_000 + 1_000).as_str(), "00:00:01");
    }

    #[test]
    fn now_falls_back_when_rtc_read_fails() {
        let mut rtc = FakeRtc::at(dt(2024, 1, 1, 0, 0, 0));
        rtc.fail_read = true;
        let mut clock = ClockAuthority::new(Some(rtc));
        assert_eq!(clock.now(5_000).as_str(), "00:00:05");
    }

    // ── GPS sync ────────────────────────────────────────────────────

    #[test]
    fn sync_commits_on_drift() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 11, 59, 57))));
        let (mut telemetry, mut mesh) = harness();

        let outcome = clock.try_sync_from_gps(
            &valid_reading(dt(2024, 3, 1, 12, 0, 0)),
            10_000,
            &mut telemetry,
            &mut mesh,
            "NODE_01",
        );
        assert_eq!(outcome, SyncOutcome::Committed);
        assert_eq!(clock.source(), ClockSource::RtcSynced);
        assert_eq!(clock.last_sync_epoch(), Some(dt(2024, 3, 1, 12, 0, 0).epoch()));
        assert_eq!(clock.now(0).as_str(), "2024-03-01 12:00:00");

        // Audit line and mesh announcement
        assert!(telemetry_lines(&mut telemetry)[0].contains("RTC synced from GPS"));
        assert!(mesh.port_mut().sent[0].starts_with("NODE_01: RTC_SYNC:"));
    }

    fn telemetry_lines(t: &mut TelemetryLog<NullStorage>) -> &[std::string::String] {
        &t.storage_mut().lines
    }

    #[test]
    fn sync_skips_small_drift() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 11, 59, 58))));
        let (mut telemetry, mut mesh) = harness();

        // 2 s drift is within the rewrite threshold
        let outcome = clock.try_sync_from_gps(
            &valid_reading(dt(2024, 3, 1, 12, 0, 0)),
            10_000,
            &mut telemetry,
            &mut mesh,
            "NODE_01",
        );
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(clock.source(), ClockSource::RtcUnsynced);
    }

    #[test]
    fn sync_holds_off_for_an_hour() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 11, 59, 0))));
        let (mut telemetry, mut mesh) = harness();

        let first = clock.try_sync_from_gps(
            &valid_reading(dt(2024, 3, 1, 12, 0, 0)),
            0,
            &mut telemetry,
            &mut mesh,
            "NODE_01",
        );
        assert_eq!(first, SyncOutcome::Committed);

        // Large drift again, but inside the hold-off window
        let second = clock.try_sync_from_gps(
            &valid_reading(dt(2024, 3, 1, 13, 0, 0)),
            3_599_999,
            &mut telemetry,
            &mut mesh,
            "NODE_01",
        );
        assert_eq!(second, SyncOutcome::Skipped);

        let third = clock.try_sync_from_gps(
            &valid_reading(dt(2024, 3, 1, 13, 0, 0)),
            3_600_000,
            &mut telemetry,
            &mut mesh,
            "NODE_01",
        );
        assert_eq!(third, SyncOutcome::Committed);
    }

    #[test]
    fn sync_discards_implausible_readings() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 0, 0, 0))));
        let (mut telemetry, mut mesh) = harness();

        for bad in [
            dt(2019, 3, 1, 0, 0, 0),
            dt(2051, 3, 1, 0, 0, 0),
            dt(2024, 13, 1, 0, 0, 0),
            dt(2024, 3, 32, 0, 0, 0),
            dt(2024, 3, 1, 24, 0, 0),
            dt(2024, 3, 1, 0, 60, 0),
        ] {
            let outcome = clock.try_sync_from_gps(
                &valid_reading(bad),
                0,
                &mut telemetry,
                &mut mesh,
                "NODE_01",
            );
            assert_eq!(outcome, SyncOutcome::Skipped, "accepted {:?}", bad);
        }
    }

    #[test]
    fn sync_requires_validity_flags() {
        let mut clock = ClockAuthority::new(Some(FakeRtc::at(dt(2024, 3, 1, 0, 0, 0))));
        let (mut telemetry, mut mesh) = harness();

        let reading = GpsTimeReading {
            date_valid: true,
            time_valid: false,
            dt: dt(2024, 3, 1, 12, 0, 0),
        };
        assert_eq!(
            clock.try_sync_from_gps(&reading, 0, &mut telemetry, &mut mesh, "NODE_01"),
            SyncOutcome::Skipped
        );
    }

    #[test]
    fn sync_without_rtc_is_noop() {
        let mut clock: ClockAuthority<FakeRtc> = ClockAuthority::new(None);
        let (mut telemetry, mut mesh) = harness();
        assert_eq!(
            clock.try_sync_from_gps(
                &valid_reading(dt(2024, 3, 1, 12, 0, 0)),
                0,
                &mut telemetry,
                &mut mesh,
                "NODE_01"
            ),
            SyncOutcome::Skipped
        );
    }
}
