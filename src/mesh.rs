//! Mesh link layer — framed, addressed text lines over the serial mesh UART.
//!
//! Receive side: a byte-at-a-time line reader that only ever yields clean
//! printable-ASCII lines. Send side: a capacity-gated transmitter plus the
//! rate-limited hit and tracker notifiers. The link is best-effort
//! at-most-once: nothing is queued, retried, or acknowledged across nodes.

use core::fmt::Write;

use crate::defaults::{
    BROADCAST_ID, HIT_NOTIFY_INTERVAL_MS, MAX_INBOUND_LINE, MAX_OUTBOUND_PAYLOAD,
    TRACKER_NOTIFY_INTERVAL_MS,
};
use crate::protocol::{format_mac, MacString, NameString, PayloadString};

/// Serial line reader state machine.
///
/// Accumulates printable ASCII (32–126) until a CR/LF terminator, then
/// yields the line. Bytes outside the printable range are stripped so a
/// garbled burst cannot smuggle control bytes into a command. On overflow
/// the buffer is reset rather than truncated — partial data is discarded
/// instead of being processed as a mangled command.
pub struct LineReader {
    buf: [u8; MAX_INBOUND_LINE],
    pos: usize,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_INBOUND_LINE],
            pos: 0,
        }
    }

    /// Feed a byte into the reader. Returns a complete non-empty line
    /// (without its terminator) when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&str> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let len = self.pos;
                self.pos = 0;
                core::str::from_utf8(&self.buf[..len]).ok()
            } else {
                None
            }
        } else if !(32..=126).contains(&byte) {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow — discard and reset
            self.pos = 0;
            None
        }
    }
}

/// Resolve the optional `@target ` address prefix on an inbound line.
///
/// Returns the command portion when the line is unaddressed, addressed to
/// `node_id`, or addressed to the `ALL` broadcast sentinel. Lines for
/// other nodes are ignored — this device has no multi-hop relay. An `@`
/// line with no space is malformed and dropped.
pub fn resolve_address<'a>(line: &'a str, node_id: &str) -> Option<&'a str> {
    match line.strip_prefix('@') {
        Some(rest) => {
            let space = rest.find(' ')?;
            let (target, command) = rest.split_at(space);
            if target == node_id || target == BROADCAST_ID {
                Some(&command[1..])
            } else {
                None
            }
        }
        None => Some(line),
    }
}

/// Transmit side of the mesh serial port.
pub trait MeshPort {
    /// Free bytes in the transmit buffer right now.
    fn free_capacity(&mut self) -> usize;
    /// Write one payload line; the port appends the line terminator.
    fn write_line(&mut self, payload: &str);
}

/// Capacity-gated mesh transmitter. The channel has no queue: a payload
/// the port cannot take right now is dropped, never buffered or retried.
pub struct MeshTx<P: MeshPort> {
    port: P,
}

impl<P: MeshPort> MeshTx<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Best-effort send. False when the payload exceeds the outbound cap
    /// or the port lacks capacity for it plus the line terminator.
    pub fn send(&mut self, payload: &str) -> bool {
        if payload.len() > MAX_OUTBOUND_PAYLOAD {
            return false;
        }
        if self.port.free_capacity() < payload.len() + 2 {
            return false;
        }
        self.port.write_line(payload);
        true
    }
}

/// Radio medium a hit was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Wifi,
    Ble,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Medium::Wifi => "WiFi",
            Medium::Ble => "BLE",
        }
    }
}

/// A detection event produced by the scan/detection engines.
#[derive(Debug, Clone)]
pub struct DetectionHit {
    pub mac: [u8; 6],
    pub medium: Medium,
    pub rssi: i8,
    pub name: NameString,
    pub ambient_temp: Option<f32>,
}

/// Rate limiter for target-hit notifications.
///
/// At most one mesh message per window; the current call's data wins and
/// in-window hits are dropped with no queuing. A drop by the capacity
/// gate still consumes the window (the link was busy either way).
pub struct HitNotifier {
    last_send_ms: Option<u64>,
}

impl HitNotifier {
    pub const fn new() -> Self {
        Self { last_send_ms: None }
    }

    pub fn notify<P: MeshPort>(
        &mut self,
        tx: &mut MeshTx<P>,
        node_id: &str,
        hit: &DetectionHit,
        now_ms: u64,
    ) -> bool {
        if let Some(last) = self.last_send_ms {
            if now_ms.saturating_sub(last) < HIT_NOTIFY_INTERVAL_MS {
                return false;
            }
        }
        self.last_send_ms = Some(now_ms);

        let mut msg = PayloadString::new();
        if format_hit(&mut msg, node_id, hit).is_err() {
            // Over the payload cap: drop rather than truncate
            return false;
        }
        tx.send(&msg)
    }
}

fn format_hit(msg: &mut PayloadString, node_id: &str, hit: &DetectionHit) -> core::fmt::Result {
    let mut mac = MacString::new();
    format_mac(&hit.mac, &mut mac);
    write!(
        msg,
        "{}: Target: {} {} RSSI:{}",
        node_id,
        hit.medium.as_str(),
        mac,
        hit.rssi
    )?;

    let name = clean_name(&hit.name);
    if !name.is_empty() {
        write!(msg, " Name:{}", name)?;
    }
    if let Some(temp) = hit.ambient_temp {
        write!(msg, " Temp:{:.1}C", temp)?;
    }
    Ok(())
}

/// Strip non-printable bytes from a hit name. The WiFi engine reports the
/// literal placeholder name "WiFi" for nameless stations; treat it as
/// absent.
fn clean_name(name: &NameString) -> NameString {
    let mut out = NameString::new();
    if name.as_str() == "WiFi" {
        return out;
    }
    for b in name.bytes().filter(|b| (32..=126).contains(b)) {
        if out.push(b as char).is_err() {
            break;
        }
    }
    out
}

/// Live tracker state populated by the tracker task.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSnapshot {
    pub mac: [u8; 6],
    pub rssi: i8,
    /// Uptime of the last sighting; 0 when never seen
    pub last_seen_ms: u64,
    pub packets: u32,
}

/// Rate limiter for periodic tracker-status telemetry, independent of the
/// hit notifier.
pub struct TrackerNotifier {
    last_send_ms: Option<u64>,
}

impl TrackerNotifier {
    pub const fn new() -> Self {
        Self { last_send_ms: None }
    }

    pub fn notify<P: MeshPort>(
        &mut self,
        tx: &mut MeshTx<P>,
        node_id: &str,
        tracker: &TrackerSnapshot,
        now_ms: u64,
    ) -> bool {
        if let Some(last) = self.last_send_ms {
            if now_ms.saturating_sub(last) < TRACKER_NOTIFY_INTERVAL_MS {
                return false;
            }
        }
        self.last_send_ms = Some(now_ms);

        let mut mac = MacString::new();
        format_mac(&tracker.mac, &mut mac);
        let ago_secs = if tracker.last_seen_ms > 0 {
            now_ms.saturating_sub(tracker.last_seen_ms) / 1000
        } else {
            999
        };

        let mut msg = PayloadString::new();
        if write!(
            msg,
            "{}: Tracking: {} RSSI:{}dBm LastSeen:{}s Pkts:{}",
            node_id, mac, tracker.rssi, ago_secs, tracker.packets
        )
        .is_err()
        {
            return false;
        }
        tx.send(&msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPort {
        capacity: usize,
        sent: Vec<std::string::String>,
    }

    impl TestPort {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                sent: Vec::new(),
            }
        }
    }

    impl MeshPort for TestPort {
        fn free_capacity(&mut self) -> usize {
            self.capacity
        }
        fn write_line(&mut self, payload: &str) {
            self.sent.push(payload.into());
        }
    }

    fn hit(rssi: i8) -> DetectionHit {
        DetectionHit {
            mac: [0xB4, 0x1E, 0x52, 0x01, 0x02, 0x03],
            medium: Medium::Ble,
            rssi,
            name: NameString::try_from("FS Ext Battery").unwrap(),
            ambient_temp: None,
        }
    }

    // ── LineReader ──────────────────────────────────────────────────

    #[test]
    fn reader_yields_complete_lines() {
        let mut reader = LineReader::new();
        for &b in b"STATUS" {
            assert_eq!(reader.feed(b), None);
        }
        assert_eq!(reader.feed(b'\n'), Some("STATUS"));
        // Terminator on an empty buffer yields nothing
        assert_eq!(reader.feed(b'\r'), None);
    }

    #[test]
    fn reader_strips_nonprintable_bytes() {
        let mut reader = LineReader::new();
        let mut out = None;
        for &b in b"ST\x00OP\x07\xff\n" {
            if let Some(line) = reader.feed(b) {
                out = Some(std::string::String::from(line));
            }
        }
        assert_eq!(out.as_deref(), Some("STOP"));
    }

    #[test]
    fn reader_resets_on_overflow() {
        let mut reader = LineReader::new();
        for _ in 0..300 {
            assert_eq!(reader.feed(b'A'), None);
        }
        // The 240-byte buffer overflowed and reset; the tail that fit
        // after the reset is all that survives to the terminator.
        let line = reader.feed(b'\n').unwrap();
        assert!(line.len() <= 240);
        assert!(line.bytes().all(|b| (32..=126).contains(&b)));
    }

    #[test]
    fn reader_accepts_exactly_240_bytes() {
        let mut reader = LineReader::new();
        for _ in 0..240 {
            assert_eq!(reader.feed(b'x'), None);
        }
        let line = reader.feed(b'\n').unwrap();
        assert_eq!(line.len(), 240);
    }

    // ── Addressing ──────────────────────────────────────────────────

    #[test]
    fn address_resolution() {
        assert_eq!(resolve_address("STATUS", "NODE_01"), Some("STATUS"));
        assert_eq!(resolve_address("@NODE_01 STATUS", "NODE_01"), Some("STATUS"));
        assert_eq!(resolve_address("@ALL STOP", "NODE_01"), Some("STOP"));
        assert_eq!(resolve_address("@NODE_02 STATUS", "NODE_01"), None);
        assert_eq!(resolve_address("@NODE_01", "NODE_01"), None);
    }

    // ── Capacity gate ───────────────────────────────────────────────

    #[test]
    fn send_respects_capacity_and_cap() {
        let mut tx = MeshTx::new(TestPort::new(10));
        assert!(tx.send("short"));
        assert!(!tx.send("longer than ten"));
        assert_eq!(tx.port_mut().sent.len(), 1);

        let mut tx = MeshTx::new(TestPort::new(4096));
        let big = "x".repeat(231);
        assert!(!tx.send(&big));
        assert!(tx.send(&big[..230]));
    }

    // ── Hit notifier ────────────────────────────────────────────────

    #[test]
    fn hit_notifier_rate_limits_latest_wins() {
        let mut tx = MeshTx::new(TestPort::new(4096));
        let mut notifier = HitNotifier::new();

        assert!(notifier.notify(&mut tx, "NODE_01", &hit(-40), 1_000));
        // Inside the window: dropped, not queued
        assert!(!notifier.notify(&mut tx, "NODE_01", &hit(-50), 2_000));
        assert!(!notifier.notify(&mut tx, "NODE_01", &hit(-60), 4_499));
        // Window reopens 3500 ms after the last emission
        assert!(notifier.notify(&mut tx, "NODE_01", &hit(-70), 4_500));

        let sent = &tx.port_mut().sent;
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("RSSI:-40"));
        assert!(sent[1].contains("RSSI:-70"));
    }

    #[test]
    fn hit_message_format() {
        let mut tx = MeshTx::new(TestPort::new(4096));
        let mut notifier = HitNotifier::new();
        let mut h = hit(-62);
        h.ambient_temp = Some(21.57);
        assert!(notifier.notify(&mut tx, "NODE_01", &h, 0));
        assert_eq!(
            tx.port_mut().sent[0],
            "NODE_01: Target: BLE B4:1E:52:01:02:03 RSSI:-62 Name:FS Ext Battery Temp:21.6C"
        );
    }

    #[test]
    fn hit_message_omits_placeholder_name() {
        let mut tx = MeshTx::new(TestPort::new(4096));
        let mut notifier = HitNotifier::new();
        let mut h = hit(-62);
        h.name = NameString::try_from("WiFi").unwrap();
        h.medium = Medium::Wifi;
        assert!(notifier.notify(&mut tx, "NODE_01", &h, 0));
        assert!(!tx.port_mut().sent[0].contains("Name:"));
    }

    // ── Tracker notifier ────────────────────────────────────────────

    #[test]
    fn tracker_notifier_independent_window() {
        let mut tx = MeshTx::new(TestPort::new(4096));
        let mut hits = HitNotifier::new();
        let mut tracker = TrackerNotifier::new();
        let snap = TrackerSnapshot {
            mac: [0x34, 0x21, 0x09, 0x83, 0xD9, 0x51],
            rssi: -55,
            last_seen_ms: 9_000,
            packets: 42,
        };

        assert!(hits.notify(&mut tx, "NODE_01", &hit(-40), 10_000));
        // The hit limiter does not gate tracker telemetry
        assert!(tracker.notify(&mut tx, "NODE_01", &snap, 10_000));
        assert!(!tracker.notify(&mut tx, "NODE_01", &snap, 20_000));
        assert!(tracker.notify(&mut tx, "NODE_01", &snap, 25_000));

        assert_eq!(
            tx.port_mut().sent[1],
            "NODE_01: Tracking: 34:21:09:83:D9:51 RSSI:-55dBm LastSeen:1s Pkts:42"
        );
    }

    #[test]
    fn tracker_never_seen_reports_sentinel_age() {
        let mut tx = MeshTx::new(TestPort::new(4096));
        let mut tracker = TrackerNotifier::new();
        let snap = TrackerSnapshot {
            mac: [0; 6],
            rssi: -127,
            last_seen_ms: 0,
            packets: 0,
        };
        assert!(tracker.notify(&mut tx, "NODE_01", &snap, 60_000));
        assert!(tx.port_mut().sent[0].contains("LastSeen:999s"));
    }
}
