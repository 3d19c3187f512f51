//! Control-plane defaults and protocol limits.
//!
//! Mesh framing caps and rate-limit windows come from the mesh radio's
//! line-length limits; the AP recovery counts bound the worst-case
//! blocking time of a scan-to-AP transition.

/// Soft-AP SSID hosted for the local web UI
pub const AP_SSID: &str = "meshsentry";

/// Soft-AP WPA2 passphrase
pub const AP_PASS: &str = "sentrymesh";

/// Configured soft-AP channel
pub const AP_CHANNEL: u8 = 6;

/// Fallback channel used on the final AP start attempt
pub const AP_FALLBACK_CHANNEL: u8 = 11;

/// Bounded AP start attempts before the device restarts
pub const AP_START_ATTEMPTS: u32 = 3;

/// Polls for the assigned AP address after a successful AP start
pub const AP_ADDR_POLL_ATTEMPTS: u32 = 10;

/// Delay between AP address polls in milliseconds
pub const AP_ADDR_POLL_INTERVAL_MS: u32 = 500;

/// Mesh UART baud rate
pub const MESH_BAUD: u32 = 115_200;

/// Maximum inbound mesh line length in bytes
pub const MAX_INBOUND_LINE: usize = 240;

/// Maximum outbound mesh payload length in bytes
pub const MAX_OUTBOUND_PAYLOAD: usize = 230;

/// Broadcast sentinel in the `@target ` address prefix
pub const BROADCAST_ID: &str = "ALL";

/// Maximum node identity length
pub const NODE_ID_MAX_LEN: usize = 16;

/// Minimum interval between target-hit mesh notifications
pub const HIT_NOTIFY_INTERVAL_MS: u64 = 3_500;

/// Minimum interval between periodic tracker telemetry lines
pub const TRACKER_NOTIFY_INTERVAL_MS: u64 = 15_000;

/// Minimum interval between vibration mesh alerts
pub const VIBRATION_ALERT_INTERVAL_MS: u64 = 5_000;

/// Upper clamp for scan/detection task durations in seconds (24 h)
pub const MAX_SCAN_SECS: u32 = 86_400;

/// Default list-scan duration in seconds
pub const DEFAULT_SCAN_SECS: u32 = 60;

/// Default tracker duration in seconds
pub const DEFAULT_TRACK_SECS: u32 = 180;

/// Default scan channel set
pub const DEFAULT_SCAN_CHANNELS: &[u8] = &[1, 6, 11];

/// Default tracker channel (single channel for smoother RSSI trend)
pub const DEFAULT_TRACK_CHANNEL: u8 = 6;

/// Valid range for beeps-per-hit
pub const BEEPS_MIN: u8 = 1;
pub const BEEPS_MAX: u8 = 10;

/// Valid range for the inter-beep gap in milliseconds
pub const GAP_MS_MIN: u16 = 20;
pub const GAP_MS_MAX: u16 = 2_000;

/// Default buzzer settings
pub const DEFAULT_BEEPS: u8 = 2;
pub const DEFAULT_GAP_MS: u16 = 80;

/// Minimum interval between RTC-from-GPS sync commits (1 h)
pub const RTC_SYNC_INTERVAL_MS: u64 = 3_600_000;

/// RTC is rewritten only when GPS/RTC drift exceeds this many seconds
pub const RTC_DRIFT_THRESHOLD_SECS: i64 = 2;

/// Plausibility window for GPS-reported years
pub const GPS_YEAR_MIN: u16 = 2020;
pub const GPS_YEAR_MAX: u16 = 2050;

/// Telemetry handle is closed and reopened every this many writes
pub const LOG_REOPEN_INTERVAL: u32 = 50;

/// Telemetry handle is flushed every this many writes
pub const LOG_FLUSH_INTERVAL: u32 = 10;

/// Minimum interval between telemetry size probes
pub const LOG_SIZE_PROBE_INTERVAL_MS: u64 = 10_000;

/// Maximum channels in a configured channel set
pub const MAX_CHANNELS: usize = 16;

/// Maximum entries in the target list
pub const MAX_TARGETS: usize = 64;
