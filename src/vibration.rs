//! Vibration (movement) detection shared between ISR and poller.
//!
//! The interrupt handler performs exactly one atomic store and owns no
//! other state; the polling consumer clears the flag and owns the event
//! timestamp and the alert rate limit. No mutable buffer crosses the
//! interrupt boundary.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::clock::boot_hms;
use crate::defaults::VIBRATION_ALERT_INTERVAL_MS;
use crate::protocol::PayloadString;
use crate::status::GpsState;

/// ISR-to-task flag. Interrupt context only sets; the poller only clears.
pub struct VibrationSignal {
    detected: AtomicBool,
}

impl VibrationSignal {
    pub const fn new() -> Self {
        Self {
            detected: AtomicBool::new(false),
        }
    }

    /// Safe to call from interrupt context: a single atomic store.
    pub fn set(&self) {
        self.detected.store(true, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.detected.swap(false, Ordering::AcqRel)
    }
}

/// Poll result for one vibration check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VibrationPoll {
    Idle,
    Detected {
        /// Whether a mesh alert may be sent (rate limited to one per 5 s)
        alert: bool,
    },
}

/// Polling consumer of [`VibrationSignal`].
pub struct VibrationMonitor {
    last_event_ms: Option<u64>,
    last_alert_ms: Option<u64>,
}

impl VibrationMonitor {
    pub const fn new() -> Self {
        Self {
            last_event_ms: None,
            last_alert_ms: None,
        }
    }

    /// Consume a pending vibration event, if any. Every event updates the
    /// last-event time; alerts are rate limited.
    pub fn poll(&mut self, signal: &VibrationSignal, now_ms: u64) -> VibrationPoll {
        if !signal.take() {
            return VibrationPoll::Idle;
        }
        self.last_event_ms = Some(now_ms);

        let alert = match self.last_alert_ms {
            Some(last) => now_ms.saturating_sub(last) > VIBRATION_ALERT_INTERVAL_MS,
            None => true,
        };
        if alert {
            self.last_alert_ms = Some(now_ms);
        } else {
            log::debug!("vibration alert rate limited");
        }
        VibrationPoll::Detected { alert }
    }

    pub fn last_event_ms(&self) -> Option<u64> {
        self.last_event_ms
    }

    /// `VIBRATION_STATUS` data line.
    pub fn status_line(&self, node_id: &str, now_ms: u64) -> PayloadString {
        let mut msg = PayloadString::new();
        match self.last_event_ms {
            Some(at_ms) => {
                let ago = now_ms.saturating_sub(at_ms) / 1000;
                let _ = write!(
                    msg,
                    "{}: VIBRATION_STATUS: Last vibration: {}ms ({}s ago)",
                    node_id, at_ms, ago
                );
            }
            None => {
                let _ = write!(msg, "{}: VIBRATION_STATUS: No vibrations detected", node_id);
            }
        }
        msg
    }

    /// Mesh alert body for the most recent event, GPS-tagged when a fix
    /// is held. None before any event.
    pub fn alert_message(&self, node_id: &str, gps: &GpsState) -> Option<PayloadString> {
        let at_ms = self.last_event_ms?;
        let mut msg = PayloadString::new();
        write!(
            msg,
            "{}: VIBRATION: Movement detected at {}",
            node_id,
            boot_hms(at_ms)
        )
        .ok()?;
        if gps.valid {
            write!(msg, " GPS:{:.6},{:.6}", gps.lat, gps.lon).ok()?;
        }
        Some(msg)
    }
}
