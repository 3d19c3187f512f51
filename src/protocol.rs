//! Addressed text protocol — command verbs carried over the mesh.
//!
//! Commands are single printable-ASCII lines with `:`-delimited positional
//! fields and an optional literal trailing `FOREVER` token. The web layer
//! constructs the same [`CommandVerb`] values from validated form
//! parameters, so a request is handled identically regardless of origin.
//! Uses `heapless` types for no_std/no-alloc operation.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::defaults::{
    BEEPS_MAX, BEEPS_MIN, DEFAULT_SCAN_CHANNELS, DEFAULT_TRACK_CHANNEL, GAP_MS_MAX, GAP_MS_MIN,
    MAX_CHANNELS, MAX_OUTBOUND_PAYLOAD, MAX_TARGETS,
};

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Maximum length for device name strings carried in a hit
pub type NameString = String<33>;

/// Outbound mesh payload buffer (230-byte cap)
pub type PayloadString = String<MAX_OUTBOUND_PAYLOAD>;

/// Active WiFi channel set
pub type ChannelList = Vec<u8, MAX_CHANNELS>;

/// Scan target list
pub type TargetList = Vec<Target, MAX_TARGETS>;

/// Radio medium selector for scan and tracker tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Wifi,
    Ble,
    WifiBle,
}

impl ScanMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ScanMode::Wifi),
            1 => Some(ScanMode::Ble),
            2 => Some(ScanMode::WifiBle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Wifi => "WiFi",
            ScanMode::Ble => "BLE",
            ScanMode::WifiBle => "WiFi+BLE",
        }
    }
}

/// A scan-list entry: a full MAC or a 3-byte OUI prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Mac([u8; 6]),
    Oui([u8; 3]),
}

impl Target {
    /// Parse "AA:BB:CC:DD:EE:FF" (full MAC) or "AA:BB:CC" (OUI prefix).
    pub fn parse(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if part.len() != 2 || count == 6 {
                return None;
            }
            bytes[count] = u8::from_str_radix(part, 16).ok()?;
            count += 1;
        }
        match count {
            6 => Some(Target::Mac(bytes)),
            3 => Some(Target::Oui([bytes[0], bytes[1], bytes[2]])),
            _ => None,
        }
    }

    /// Whether an observed MAC matches this entry.
    pub fn matches(&self, mac: &[u8; 6]) -> bool {
        match self {
            Target::Mac(full) => full == mac,
            Target::Oui(prefix) => *prefix == [mac[0], mac[1], mac[2]],
        }
    }
}

/// Parse a full "AA:BB:CC:DD:EE:FF" MAC address.
pub fn parse_mac6(s: &str) -> Option<[u8; 6]> {
    match Target::parse(s)? {
        Target::Mac(mac) => Some(mac),
        Target::Oui(_) => None,
    }
}

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" form.
pub fn format_mac(mac: &[u8; 6], buf: &mut MacString) {
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

/// Parse a channel CSV ("1,6,11") into a channel set.
///
/// Every token must be a valid 2.4 GHz channel (1–14); any malformed or
/// out-of-range token rejects the whole set.
pub fn parse_channels_csv(csv: &str) -> Option<ChannelList> {
    let mut channels = ChannelList::new();
    for token in csv.split(',') {
        let ch: u8 = token.trim().parse().ok()?;
        if !(1..=14).contains(&ch) {
            return None;
        }
        if !channels.contains(&ch) {
            channels.push(ch).ok()?;
        }
    }
    if channels.is_empty() {
        None
    } else {
        Some(channels)
    }
}

/// Parse a target list (one MAC or OUI per line; commas accepted as an
/// alternate separator so a list fits on a single mesh line).
///
/// Blank entries are skipped; any malformed entry rejects the whole list.
/// An empty list is valid and clears the targets.
pub fn parse_targets(text: &str) -> Option<TargetList> {
    let mut targets = TargetList::new();
    for entry in text.split(|c| c == '\n' || c == ',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        targets.push(Target::parse(entry)?).ok()?;
    }
    Some(targets)
}

/// Parameters of a generic list-scan start.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub mode: ScanMode,
    pub secs: u32,
    pub channels: ChannelList,
    pub forever: bool,
}

/// Parameters of a single-MAC tracker start.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub mac: [u8; 6],
    pub mode: ScanMode,
    pub secs: u32,
    pub channels: ChannelList,
    pub forever: bool,
}

/// Typed command verbs.
///
/// A verb that fails its own parameter validation never parses, so it can
/// produce no side effect and no acknowledgment downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandVerb {
    ConfigBeeps(u8),
    ConfigGap(u16),
    ConfigChannels(ChannelList),
    ConfigTargets(TargetList),
    ScanStart(ScanRequest),
    TrackStart(TrackRequest),
    Stop,
    Status,
    BeepTest,
    VibrationStatus,
}

/// Tokenize and validate one command line into a typed verb.
///
/// Unknown verbs and out-of-range parameters are rejected (`None`).
pub fn parse_command(line: &str) -> Option<CommandVerb> {
    let (verb, params) = match line.find(':') {
        Some(i) => (&line[..i], Some(&line[i + 1..])),
        None => (line, None),
    };

    match verb {
        "CONFIG_BEEPS" => {
            let n: u8 = params?.parse().ok()?;
            (BEEPS_MIN..=BEEPS_MAX)
                .contains(&n)
                .then_some(CommandVerb::ConfigBeeps(n))
        }
        "CONFIG_GAP" => {
            let n: u16 = params?.parse().ok()?;
            (GAP_MS_MIN..=GAP_MS_MAX)
                .contains(&n)
                .then_some(CommandVerb::ConfigGap(n))
        }
        "CONFIG_CHANNELS" => parse_channels_csv(params?).map(CommandVerb::ConfigChannels),
        "CONFIG_TARGETS" => parse_targets(params?).map(CommandVerb::ConfigTargets),
        "SCAN_START" => parse_scan_start(params?),
        "TRACK_START" => parse_track_start(params?),
        "STOP" if params.is_none() => Some(CommandVerb::Stop),
        "STATUS" if params.is_none() => Some(CommandVerb::Status),
        "BEEP_TEST" if params.is_none() => Some(CommandVerb::BeepTest),
        "VIBRATION_STATUS" if params.is_none() => Some(CommandVerb::VibrationStatus),
        _ => None,
    }
}

/// `SCAN_START:<mode>:<secs>[:<channels>][:FOREVER]`
fn parse_scan_start(params: &str) -> Option<CommandVerb> {
    let mut fields = params.split(':');
    let mode = ScanMode::from_u8(fields.next()?.parse().ok()?)?;
    let secs: u32 = fields.next()?.parse().ok()?;

    let (channels, forever) = parse_scan_tail(fields, DEFAULT_SCAN_CHANNELS)?;
    Some(CommandVerb::ScanStart(ScanRequest {
        mode,
        secs,
        channels,
        forever,
    }))
}

/// `TRACK_START:<mac>:<mode>:<secs>[:<channels>][:FOREVER]`
fn parse_track_start(params: &str) -> Option<CommandVerb> {
    let mut fields = params.split(':');

    // The MAC itself contains ':' separators: consume its six hex fields.
    let mut mac = [0u8; 6];
    for byte in mac.iter_mut() {
        let part = fields.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    let mode = ScanMode::from_u8(fields.next()?.parse().ok()?)?;
    let secs: u32 = fields.next()?.parse().ok()?;

    let (channels, forever) = parse_scan_tail(fields, &[DEFAULT_TRACK_CHANNEL])?;
    Some(CommandVerb::TrackStart(TrackRequest {
        mac,
        mode,
        secs,
        channels,
        forever,
    }))
}

/// Shared tail of the start verbs: optional channel CSV, optional
/// literal `FOREVER`, nothing after it.
fn parse_scan_tail<'a>(
    fields: impl Iterator<Item = &'a str>,
    default_channels: &[u8],
) -> Option<(ChannelList, bool)> {
    let mut channels: Option<ChannelList> = None;
    let mut forever = false;

    for field in fields {
        if forever {
            return None;
        }
        if field == "FOREVER" {
            forever = true;
        } else if channels.is_none() {
            channels = Some(parse_channels_csv(field)?);
        } else {
            return None;
        }
    }

    let channels = match channels {
        Some(c) => c,
        None => ChannelList::from_slice(default_channels).ok()?,
    };
    Some((channels, forever))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(list: &[u8]) -> ChannelList {
        ChannelList::from_slice(list).unwrap()
    }

    // ── Start verbs ─────────────────────────────────────────────────

    #[test]
    fn scan_start_with_channels() {
        let verb = parse_command("SCAN_START:0:60:1,6,11").unwrap();
        assert_eq!(
            verb,
            CommandVerb::ScanStart(ScanRequest {
                mode: ScanMode::Wifi,
                secs: 60,
                channels: channels(&[1, 6, 11]),
                forever: false,
            })
        );
    }

    #[test]
    fn scan_start_defaults_channels() {
        let verb = parse_command("SCAN_START:2:120").unwrap();
        match verb {
            CommandVerb::ScanStart(req) => {
                assert_eq!(req.mode, ScanMode::WifiBle);
                assert_eq!(req.channels.as_slice(), &[1, 6, 11]);
                assert!(!req.forever);
            }
            other => panic!("unexpected verb {:?}", other),
        }
    }

    #[test]
    fn scan_start_forever_without_channels() {
        let verb = parse_command("SCAN_START:1:0:FOREVER").unwrap();
        match verb {
            CommandVerb::ScanStart(req) => {
                assert!(req.forever);
                assert_eq!(req.channels.as_slice(), &[1, 6, 11]);
            }
            other => panic!("unexpected verb {:?}", other),
        }
    }

    #[test]
    fn scan_start_rejects_bad_mode_and_channels() {
        assert_eq!(parse_command("SCAN_START:3:60"), None);
        assert_eq!(parse_command("SCAN_START:0:60:1,99"), None);
        assert_eq!(parse_command("SCAN_START:0"), None);
        assert_eq!(parse_command("SCAN_START:0:60:1,6:FOREVER:extra"), None);
    }

    #[test]
    fn track_start_full() {
        let verb = parse_command("TRACK_START:34:21:09:83:D9:51:0:180:6:FOREVER").unwrap();
        assert_eq!(
            verb,
            CommandVerb::TrackStart(TrackRequest {
                mac: [0x34, 0x21, 0x09, 0x83, 0xD9, 0x51],
                mode: ScanMode::Wifi,
                secs: 180,
                channels: channels(&[6]),
                forever: true,
            })
        );
    }

    #[test]
    fn track_start_rejects_short_mac() {
        assert_eq!(parse_command("TRACK_START:34:21:09:0:180"), None);
    }

    // ── Config verbs ────────────────────────────────────────────────

    #[test]
    fn config_beeps_range() {
        assert_eq!(parse_command("CONFIG_BEEPS:5"), Some(CommandVerb::ConfigBeeps(5)));
        assert_eq!(parse_command("CONFIG_BEEPS:15"), None);
        assert_eq!(parse_command("CONFIG_BEEPS:0"), None);
        assert_eq!(parse_command("CONFIG_BEEPS:abc"), None);
    }

    #[test]
    fn config_gap_range() {
        assert_eq!(parse_command("CONFIG_GAP:80"), Some(CommandVerb::ConfigGap(80)));
        assert_eq!(parse_command("CONFIG_GAP:19"), None);
        assert_eq!(parse_command("CONFIG_GAP:2001"), None);
    }

    #[test]
    fn config_channels_replaces_set() {
        let verb = parse_command("CONFIG_CHANNELS:1,2,3").unwrap();
        assert_eq!(verb, CommandVerb::ConfigChannels(channels(&[1, 2, 3])));
        assert_eq!(parse_command("CONFIG_CHANNELS:"), None);
        assert_eq!(parse_command("CONFIG_CHANNELS:0,6"), None);
    }

    #[test]
    fn config_targets_mixed_entries() {
        let verb = parse_command("CONFIG_TARGETS:AA:BB:CC:DD:EE:FF,DC:A6:32").unwrap();
        match verb {
            CommandVerb::ConfigTargets(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0], Target::Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
                assert_eq!(list[1], Target::Oui([0xDC, 0xA6, 0x32]));
            }
            other => panic!("unexpected verb {:?}", other),
        }
    }

    #[test]
    fn config_targets_rejects_garbage_entry() {
        assert_eq!(parse_command("CONFIG_TARGETS:AA:BB:CC:DD:EE:FF,notamac"), None);
    }

    // ── Bare verbs ──────────────────────────────────────────────────

    #[test]
    fn bare_verbs() {
        assert_eq!(parse_command("STOP"), Some(CommandVerb::Stop));
        assert_eq!(parse_command("STATUS"), Some(CommandVerb::Status));
        assert_eq!(parse_command("BEEP_TEST"), Some(CommandVerb::BeepTest));
        assert_eq!(
            parse_command("VIBRATION_STATUS"),
            Some(CommandVerb::VibrationStatus)
        );
        assert_eq!(parse_command("STOP:now"), None);
    }

    #[test]
    fn unknown_verb_rejected() {
        assert_eq!(parse_command("REBOOT"), None);
        assert_eq!(parse_command(""), None);
    }

    // ── Targets and MACs ────────────────────────────────────────────

    #[test]
    fn target_matching() {
        let mac = [0xB4, 0x1E, 0x52, 0x01, 0x02, 0x03];
        assert!(Target::parse("B4:1E:52").unwrap().matches(&mac));
        assert!(Target::parse("b4:1e:52:01:02:03").unwrap().matches(&mac));
        assert!(!Target::parse("B4:1E:53").unwrap().matches(&mac));
    }

    #[test]
    fn mac_roundtrip() {
        let mac = parse_mac6("34:21:09:83:d9:51").unwrap();
        let mut s = MacString::new();
        format_mac(&mac, &mut s);
        assert_eq!(s.as_str(), "34:21:09:83:D9:51");
    }

    #[test]
    fn mac_rejects_oui_and_junk() {
        assert_eq!(parse_mac6("AA:BB:CC"), None);
        assert_eq!(parse_mac6("zz:21:09:83:d9:51"), None);
    }
}
