//! Shared device configuration.
//!
//! One owned struct replaces the scatter of ambient globals a firmware
//! like this tends to grow: node identity, buzzer settings, the active
//! channel set, scan mode, and the target list. Components receive it by
//! reference; the firmware decides how it is shared between threads.

use heapless::String;
use serde::Serialize;

use crate::defaults::{DEFAULT_BEEPS, DEFAULT_GAP_MS, DEFAULT_SCAN_CHANNELS, NODE_ID_MAX_LEN};
use crate::protocol::{ChannelList, ScanMode, TargetList};

/// Short name uniquely identifying this device on the mesh
pub type NodeId = String<NODE_ID_MAX_LEN>;

/// Runtime device configuration, mutated only by validated commands
/// (or the web layer's equivalent entry points).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub node_id: NodeId,
    pub beeps_per_hit: u8,
    pub beep_gap_ms: u16,
    pub channels: ChannelList,
    pub scan_mode: ScanMode,
    pub targets: TargetList,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self {
            node_id: NodeId::new(),
            beeps_per_hit: DEFAULT_BEEPS,
            beep_gap_ms: DEFAULT_GAP_MS,
            channels: ChannelList::from_slice(DEFAULT_SCAN_CHANNELS).unwrap_or_default(),
            scan_mode: ScanMode::Wifi,
            targets: TargetList::new(),
        }
    }

    /// Replace the node identity. Rejects empty, oversized, or
    /// non-printable ids (the id travels in mesh address prefixes).
    pub fn set_node_id(&mut self, id: &str) -> bool {
        if id.is_empty()
            || id.len() > NODE_ID_MAX_LEN
            || !id.bytes().all(|b| (33..=126).contains(&b))
        {
            return false;
        }
        self.node_id.clear();
        if self.node_id.push_str(id).is_err() {
            return false;
        }
        log::info!("Node id set to {}", self.node_id);
        true
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON view of the buzzer settings for the web layer (`GET /config`).
#[derive(Serialize)]
pub struct BuzzerConfigView {
    pub beeps: u8,
    pub gap: u16,
}

/// JSON view of the node identity for the web layer (`GET /node-id`).
#[derive(Serialize)]
pub struct NodeIdView<'a> {
    #[serde(rename = "nodeId")]
    pub node_id: &'a str,
}

/// Render the buzzer settings as JSON.
pub fn buzzer_config_json(cfg: &DeviceConfig) -> Option<String<48>> {
    let view = BuzzerConfigView {
        beeps: cfg.beeps_per_hit,
        gap: cfg.beep_gap_ms,
    };
    to_json_string(&view)
}

/// Render the node identity as JSON.
pub fn node_id_json(cfg: &DeviceConfig) -> Option<String<48>> {
    let view = NodeIdView {
        node_id: cfg.node_id.as_str(),
    };
    to_json_string(&view)
}

fn to_json_string<T: Serialize>(value: &T) -> Option<String<48>> {
    let mut buf = [0u8; 48];
    let len = serde_json_core::to_slice(value, &mut buf).ok()?;
    let s = core::str::from_utf8(&buf[..len]).ok()?;
    String::try_from(s).ok()
}
