//! Scan task supervision — at most one long-running task per category.
//!
//! Slot occupancy is the sole mutual-exclusion mechanism for the scan and
//! detection workers: claiming is a single compare-and-swap, so two
//! near-simultaneous start requests (HTTP and mesh arriving together)
//! resolve to exactly one winner without any blocking lock.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::defaults::MAX_SCAN_SECS;
use crate::radio::{RadioDriver, RadioLifecycleManager, ReleaseOutcome};

/// Long-running task categories with independent single-occupancy slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    /// Generic list scan and the single-MAC tracker
    Scan,
    /// Attack-signature detection variants
    Detection,
}

/// Detection variants sharing the detection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    DeviceScan,
    Deauth,
    BeaconFlood,
    Pwnagotchi,
    Pineapple,
    MultiSsid,
    Karma,
    ProbeFlood,
    BleSpam,
}

impl DetectionKind {
    /// Parse the web form's detection selector.
    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "device-scan" => Some(DetectionKind::DeviceScan),
            "deauth" => Some(DetectionKind::Deauth),
            "beacon-flood" => Some(DetectionKind::BeaconFlood),
            "pwnagotchi" => Some(DetectionKind::Pwnagotchi),
            "pineapple" => Some(DetectionKind::Pineapple),
            "multi-ssid" => Some(DetectionKind::MultiSsid),
            "karma" => Some(DetectionKind::Karma),
            "probe-flood" => Some(DetectionKind::ProbeFlood),
            "ble-spam" => Some(DetectionKind::BleSpam),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::DeviceScan => "device-scan",
            DetectionKind::Deauth => "deauth",
            DetectionKind::BeaconFlood => "beacon-flood",
            DetectionKind::Pwnagotchi => "pwnagotchi",
            DetectionKind::Pineapple => "pineapple",
            DetectionKind::MultiSsid => "multi-ssid",
            DetectionKind::Karma => "karma",
            DetectionKind::ProbeFlood => "probe-flood",
            DetectionKind::BleSpam => "ble-spam",
        }
    }
}

/// Ownership token for one task category.
pub struct TaskSlot {
    occupied: AtomicBool,
}

impl TaskSlot {
    pub const fn new() -> Self {
        Self {
            occupied: AtomicBool::new(false),
        }
    }

    /// Atomically claim the slot; false when already occupied.
    pub fn try_claim(&self) -> bool {
        self.occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.occupied.store(false, Ordering::Release);
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }
}

/// Cooperative stop request polled by running tasks. Never preempts.
pub struct StopFlag {
    requested: AtomicBool,
}

impl StopFlag {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Parameters granted to a scheduled task. `duration_secs == 0` always
/// pairs with the forever flag; it never means "instant".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTicket {
    pub category: TaskCategory,
    pub duration_secs: u32,
    pub forever: bool,
}

pub struct ScanTaskSupervisor {
    scan_slot: TaskSlot,
    detection_slot: TaskSlot,
    stop: StopFlag,
}

impl ScanTaskSupervisor {
    pub const fn new() -> Self {
        Self {
            scan_slot: TaskSlot::new(),
            detection_slot: TaskSlot::new(),
            stop: StopFlag::new(),
        }
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    fn slot(&self, category: TaskCategory) -> &TaskSlot {
        match category {
            TaskCategory::Scan => &self.scan_slot,
            TaskCategory::Detection => &self.detection_slot,
        }
    }

    pub fn is_running(&self, category: TaskCategory) -> bool {
        self.slot(category).is_occupied()
    }

    /// Claim the category slot and grant a ticket the platform schedules.
    ///
    /// Refuses (None) while a task of the category is outstanding —
    /// duplicate starts are idempotent no-ops. On a grant the duration is
    /// clamped to [0, 86400] and the global stop flag is cleared.
    pub fn request_start(
        &self,
        category: TaskCategory,
        secs: u32,
        forever: bool,
    ) -> Option<TaskTicket> {
        if !self.slot(category).try_claim() {
            log::debug!("{:?} slot occupied, start ignored", category);
            return None;
        }
        self.stop.clear();
        Some(TaskTicket {
            category,
            duration_secs: if forever { 0 } else { secs.min(MAX_SCAN_SECS) },
            forever,
        })
    }

    /// Called by the task itself at exit (normal, stop-requested, or
    /// duration-expired): restores AP mode, then frees the slot.
    ///
    /// The worst-case outcome of the AP restore is a device restart.
    pub fn complete<D: RadioDriver>(
        &self,
        category: TaskCategory,
        radio: &mut RadioLifecycleManager<D>,
    ) -> ReleaseOutcome {
        let outcome = radio.release_to_ap();
        self.slot(category).release();
        outcome
    }
}

impl Default for ScanTaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioDriver, RadioError, RadioLifecycleManager};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NullDriver;

    impl RadioDriver for NullDriver {
        fn stop_web_server(&mut self) {}
        fn start_web_server(&mut self) {}
        fn disable_promiscuous(&mut self) {}
        fn wifi_stop(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn wifi_deinit(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn wifi_init(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn configure_soft_ap(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn start_soft_ap(&mut self, _channel: u8) -> Result<(), RadioError> {
            Ok(())
        }
        fn soft_ap_address(&mut self) -> Option<[u8; 4]> {
            Some([192, 168, 4, 1])
        }
        fn delay_ms(&mut self, _ms: u32) {}
        fn restart(&mut self) {}
    }

    #[test]
    fn duplicate_start_is_refused() {
        let sup = ScanTaskSupervisor::new();
        let ticket = sup.request_start(TaskCategory::Scan, 60, false).unwrap();
        assert_eq!(ticket.duration_secs, 60);
        assert!(sup.is_running(TaskCategory::Scan));
        assert!(sup.request_start(TaskCategory::Scan, 60, false).is_none());
        // The detection slot is independent
        assert!(sup.request_start(TaskCategory::Detection, 60, false).is_some());
    }

    #[test]
    fn duration_clamped_and_forever_carried_separately() {
        let sup = ScanTaskSupervisor::new();
        let ticket = sup.request_start(TaskCategory::Scan, 1_000_000, false).unwrap();
        assert_eq!(ticket.duration_secs, 86_400);
        assert!(!ticket.forever);

        let sup = ScanTaskSupervisor::new();
        let ticket = sup.request_start(TaskCategory::Scan, 60, true).unwrap();
        assert_eq!(ticket.duration_secs, 0);
        assert!(ticket.forever);
    }

    #[test]
    fn start_clears_stop_flag() {
        let sup = ScanTaskSupervisor::new();
        sup.stop_flag().request();
        assert!(sup.stop_flag().is_requested());
        sup.request_start(TaskCategory::Scan, 60, false).unwrap();
        assert!(!sup.stop_flag().is_requested());
    }

    #[test]
    fn complete_restores_ap_and_frees_slot() {
        let sup = ScanTaskSupervisor::new();
        let mut radio = RadioLifecycleManager::new(NullDriver);
        sup.request_start(TaskCategory::Scan, 60, false).unwrap();
        radio.acquire_for_scanning();

        let outcome = sup.complete(TaskCategory::Scan, &mut radio);
        assert_eq!(outcome, crate::radio::ReleaseOutcome::Restored);
        assert!(!sup.is_running(TaskCategory::Scan));
        assert_eq!(radio.state(), crate::radio::RadioState::ApActive);
    }

    #[test]
    fn concurrent_starts_admit_one_winner() {
        let sup = Arc::new(ScanTaskSupervisor::new());
        let wins = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sup = Arc::clone(&sup);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if sup.request_start(TaskCategory::Detection, 30, false).is_some() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::Relaxed), 1);
    }
}
