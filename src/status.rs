//! Status snapshots, diagnostics text, and boot/GPS notifications.
//!
//! The scan and detection engines populate [`SharedCounters`]; everything
//! here only reads. STATUS answers over the mesh as plain data lines (not
//! acks); diagnostics feed the web layer's text endpoint.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::{String, Vec};

use crate::clock::{boot_hms, ClockSource, TimestampString};
use crate::mesh::TrackerSnapshot;
use crate::protocol::{format_mac, MacString, PayloadString, ScanMode};

/// Counters populated by the external scan/detection tasks and read by
/// STATUS and diagnostics. Const-constructible so the firmware can hold
/// it in a static.
pub struct SharedCounters {
    pub scanning: AtomicBool,
    pub total_hits: AtomicU32,
    pub frames_seen: AtomicU32,
    pub ble_frames_seen: AtomicU32,
    pub unique_devices: AtomicU32,
    pub tracker_mode: AtomicBool,
}

impl SharedCounters {
    pub const fn new() -> Self {
        Self {
            scanning: AtomicBool::new(false),
            total_hits: AtomicU32::new(0),
            frames_seen: AtomicU32::new(0),
            ble_frames_seen: AtomicU32::new(0),
            unique_devices: AtomicU32::new(0),
            tracker_mode: AtomicBool::new(false),
        }
    }
}

/// GPS fix state maintained by the GPS reader thread.
#[derive(Debug, Clone, Copy)]
pub struct GpsState {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub sats: u32,
    pub hdop: f32,
}

impl GpsState {
    pub const fn new() -> Self {
        Self {
            valid: false,
            lat: 0.0,
            lon: 0.0,
            sats: 0,
            hdop: 0.0,
        }
    }
}

/// Everything the STATUS verb and diagnostics read, bundled to keep call
/// sites flat.
pub struct StatusSources<'a> {
    pub counters: &'a SharedCounters,
    pub gps: &'a GpsState,
    pub tracker: Option<TrackerSnapshot>,
    pub esp_temp_c: f32,
    pub ambient_temp_c: Option<f32>,
    pub uptime_ms: u64,
    pub target_count: usize,
}

/// STATUS response: main line plus optional tracker and GPS data lines.
pub type StatusLines = Vec<PayloadString, 4>;

fn c_to_f(c: f32) -> f32 {
    c * 9.0 / 5.0 + 32.0
}

/// Uptime as `HH:MM:SS`, hours unwrapped.
pub fn format_uptime(uptime_ms: u64) -> String<12> {
    let secs = uptime_ms / 1000;
    let mut out = String::new();
    let _ = write!(out, "{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    out
}

/// Build the multi-line STATUS snapshot.
pub fn status_report(node_id: &str, mode: ScanMode, src: &StatusSources) -> StatusLines {
    let mut lines = StatusLines::new();

    let mut main = PayloadString::new();
    if write_status_main(&mut main, node_id, mode, src).is_ok() {
        let _ = lines.push(main);
    }

    if src.counters.tracker_mode.load(Ordering::Relaxed) {
        if let Some(tracker) = &src.tracker {
            let mut mac = MacString::new();
            format_mac(&tracker.mac, &mut mac);
            let mut line = PayloadString::new();
            if write!(
                line,
                "{}: TRACKER: Target:{} RSSI:{}dBm Pkts:{}",
                node_id, mac, tracker.rssi, tracker.packets
            )
            .is_ok()
            {
                let _ = lines.push(line);
            }
        }
    }

    if src.gps.valid {
        let mut line = PayloadString::new();
        if write!(line, "{}: GPS: {:.6},{:.6}", node_id, src.gps.lat, src.gps.lon).is_ok() {
            let _ = lines.push(line);
        }
    }

    lines
}

fn write_status_main(
    out: &mut PayloadString,
    node_id: &str,
    mode: ScanMode,
    src: &StatusSources,
) -> core::fmt::Result {
    let scanning = src.counters.scanning.load(Ordering::Relaxed);
    write!(
        out,
        "{}: STATUS: Mode:{} Scan:{} Hits:{} Targets:{} Unique:{}",
        node_id,
        mode.as_str(),
        if scanning { "YES" } else { "NO" },
        src.counters.total_hits.load(Ordering::Relaxed),
        src.target_count,
        src.counters.unique_devices.load(Ordering::Relaxed),
    )?;
    if let Some(ambient) = src.ambient_temp_c {
        write!(out, " Ambient:{:.1}C/{:.1}F", ambient, c_to_f(ambient))?;
    }
    write!(
        out,
        " ESP:{:.1}C/{:.1}F Up:{}",
        src.esp_temp_c,
        c_to_f(src.esp_temp_c),
        format_uptime(src.uptime_ms)
    )
}

/// One-shot boot announcement, sent over the mesh and logged.
pub fn startup_message(
    node_id: &str,
    gps_valid: bool,
    esp_temp_c: f32,
    storage_ok: bool,
) -> PayloadString {
    let mut msg = PayloadString::new();
    let _ = write!(
        msg,
        "{}: STARTUP: System initialized GPS:{} TEMP:{:.1}C/{:.1}F SD:{} Status:ONLINE",
        node_id,
        if gps_valid { "LOCKED" } else { "SEARCHING" },
        esp_temp_c,
        c_to_f(esp_temp_c),
        if storage_ok { "OK" } else { "FAIL" },
    );
    msg
}

/// Fix-transition announcement (lock gained or lost).
pub fn gps_lock_message(node_id: &str, gps: &GpsState, locked: bool) -> PayloadString {
    let mut msg = PayloadString::new();
    if locked {
        let _ = write!(
            msg,
            "{}: GPS: LOCKED Location:{:.6},{:.6} Satellites:{} HDOP:{:.2}",
            node_id, gps.lat, gps.lon, gps.sats, gps.hdop
        );
    } else {
        let _ = write!(msg, "{}: GPS: LOST", node_id);
    }
    msg
}

/// Inputs for the diagnostics text beyond [`StatusSources`].
pub struct DiagInputs<'a> {
    pub node_id: &'a str,
    pub scan_mode: ScanMode,
    pub channels: &'a [u8],
    pub storage_available: bool,
    pub clock_source: ClockSource,
    pub rtc_time: Option<TimestampString>,
    pub last_sync_age_secs: Option<u64>,
    pub last_vibration_ms: Option<u64>,
    pub last_scan_secs: u32,
    pub last_scan_forever: bool,
}

pub type DiagText = String<1024>;

/// Render the web layer's diagnostics snapshot.
pub fn diagnostics(src: &StatusSources, diag: &DiagInputs) -> DiagText {
    let mut s = DiagText::new();

    let _ = writeln!(s, "Up:{}", format_uptime(src.uptime_ms));
    let _ = writeln!(s, "Scan Mode: {}", diag.scan_mode.as_str());
    let _ = writeln!(
        s,
        "Scanning: {}",
        if src.counters.scanning.load(Ordering::Relaxed) {
            "yes"
        } else {
            "no"
        }
    );
    let _ = writeln!(
        s,
        "WiFi Frames seen: {}",
        src.counters.frames_seen.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "BLE Frames seen: {}",
        src.counters.ble_frames_seen.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "Total hits: {}",
        src.counters.total_hits.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "Unique devices: {}",
        src.counters.unique_devices.load(Ordering::Relaxed)
    );
    let _ = writeln!(s, "Targets: {}", src.target_count);
    let _ = writeln!(s, "Mesh Node ID: {}", diag.node_id);

    match diag.last_vibration_ms {
        Some(at_ms) => {
            let _ = writeln!(s, "Vibration sensor: Active");
            let ago = src.uptime_ms.saturating_sub(at_ms) / 1000;
            let _ = writeln!(s, "Last Movement: {} ({}s ago)", boot_hms(at_ms), ago);
        }
        None => {
            let _ = writeln!(s, "Vibration sensor: Standby");
        }
    }

    let _ = writeln!(
        s,
        "Storage: {}",
        if diag.storage_available {
            "Available"
        } else {
            "Not available"
        }
    );

    let _ = writeln!(
        s,
        "GPS: {}",
        if src.gps.valid { "Locked" } else { "Waiting for data" }
    );

    match diag.clock_source {
        ClockSource::BootRelative => {
            let _ = writeln!(s, "RTC: Not available");
        }
        source => {
            let state = if source == ClockSource::RtcSynced {
                "Synced"
            } else {
                "Not synced"
            };
            match &diag.rtc_time {
                Some(time) => {
                    let _ = writeln!(s, "RTC: {} Time: {}", state, time);
                }
                None => {
                    let _ = writeln!(s, "RTC: {}", state);
                }
            }
            if let Some(age) = diag.last_sync_age_secs {
                let _ = writeln!(s, "Last sync: {}s ago", age);
            }
        }
    }

    if src.counters.tracker_mode.load(Ordering::Relaxed) {
        if let Some(tracker) = &src.tracker {
            let mut mac = MacString::new();
            format_mac(&tracker.mac, &mut mac);
            let ago_ms = src.uptime_ms.saturating_sub(tracker.last_seen_ms);
            let _ = writeln!(
                s,
                "Tracker: target={} lastRSSI={}dBm lastSeen(ms ago)={} pkts={}",
                mac, tracker.rssi, ago_ms, tracker.packets
            );
        }
    }

    let _ = writeln!(
        s,
        "Last scan secs: {}{}",
        diag.last_scan_secs,
        if diag.last_scan_forever { " (forever)" } else { "" }
    );
    let _ = writeln!(
        s,
        "ESP32 Temp: {:.1}C / {:.1}F",
        src.esp_temp_c,
        c_to_f(src.esp_temp_c)
    );

    let _ = write!(s, "WiFi Channels:");
    for ch in diag.channels {
        let _ = write!(s, " {}", ch);
    }
    let _ = writeln!(s);

    s
}
