//! Radio lifecycle arbitration.
//!
//! The single 2.4 GHz radio is shared by two mutually exclusive owners:
//! the soft-AP with its web server, and the promiscuous scan engines.
//! This module owns the transition sequencing between the two, including
//! the bounded AP recovery policy whose last resort is a device restart.
//! Transitions are strictly sequential and may block for several seconds;
//! callers must tolerate that.

use crate::defaults::{
    AP_ADDR_POLL_ATTEMPTS, AP_ADDR_POLL_INTERVAL_MS, AP_CHANNEL, AP_FALLBACK_CHANNEL,
    AP_START_ATTEMPTS,
};

/// Driver-reported failure code (`esp_err_t` style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioError(pub i32);

/// Platform radio and web-server operations the lifecycle manager drives.
///
/// Implementations may block. `restart` must not return control to the
/// caller in production; the mock used in tests records the call instead.
pub trait RadioDriver {
    fn stop_web_server(&mut self);
    fn start_web_server(&mut self);
    /// Detach promiscuous-mode callbacks before the driver goes down.
    fn disable_promiscuous(&mut self);
    fn wifi_stop(&mut self) -> Result<(), RadioError>;
    fn wifi_deinit(&mut self) -> Result<(), RadioError>;
    fn wifi_init(&mut self) -> Result<(), RadioError>;
    /// Apply the soft-AP network parameters (address, gateway, netmask).
    fn configure_soft_ap(&mut self) -> Result<(), RadioError>;
    fn start_soft_ap(&mut self, channel: u8) -> Result<(), RadioError>;
    /// Assigned AP address once the network interface is up.
    fn soft_ap_address(&mut self) -> Option<[u8; 4]>;
    fn delay_ms(&mut self, ms: u32);
    /// Full device restart; the last resort when AP recovery is exhausted.
    fn restart(&mut self);
}

/// Who currently owns the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    ApActive,
    TransitioningDown,
    ScanActive,
    TransitioningUp,
}

/// Terminal result of [`RadioLifecycleManager::release_to_ap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Restored,
    Restarted,
}

/// Sole writer of [`RadioState`]. Constructed around a driver whose AP
/// and web server are already up (boot brings the AP up before handing
/// the driver over).
pub struct RadioLifecycleManager<D: RadioDriver> {
    driver: D,
    state: RadioState,
}

impl<D: RadioDriver> RadioLifecycleManager<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            state: RadioState::ApActive,
        }
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Hand the radio to the scan engines: tear down the web server and
    /// soft-AP, detach promiscuous callbacks, and fully stop the driver.
    ///
    /// Driver stop/deinit failures are logged and retried once inline;
    /// this path never hard-fails.
    pub fn acquire_for_scanning(&mut self) {
        if self.state != RadioState::ApActive {
            log::warn!(
                "acquire_for_scanning ignored in state {:?}",
                self.state
            );
            return;
        }
        self.state = RadioState::TransitioningDown;
        log::info!("Stopping AP and web server for scan");

        self.driver.stop_web_server();
        self.driver.disable_promiscuous();
        self.radio_down();

        self.state = RadioState::ScanActive;
    }

    /// Return the radio to soft-AP/web mode.
    ///
    /// Bounded recovery: up to 3 AP start attempts, the 3rd on the
    /// fallback channel after the configured channel failed twice. If all
    /// attempts fail the device restarts — there is no further
    /// software-level recovery path.
    pub fn release_to_ap(&mut self) -> ReleaseOutcome {
        if self.state != RadioState::ScanActive {
            log::warn!("release_to_ap ignored in state {:?}", self.state);
            return ReleaseOutcome::Restored;
        }
        self.state = RadioState::TransitioningUp;
        log::info!("Restoring AP and web server");

        self.driver.stop_web_server();
        self.driver.disable_promiscuous();
        self.radio_down();

        for attempt in 1..=AP_START_ATTEMPTS {
            log::info!("AP start attempt {}/{}", attempt, AP_START_ATTEMPTS);

            if let Err(e) = self.driver.wifi_init() {
                log::warn!("WiFi init failed: {:?}", e);
                self.driver.delay_ms(2000);
                continue;
            }
            if let Err(e) = self.driver.configure_soft_ap() {
                log::warn!("AP config failed: {:?}", e);
                self.driver.delay_ms(1000);
            }

            let channel = if attempt == AP_START_ATTEMPTS {
                AP_FALLBACK_CHANNEL
            } else {
                AP_CHANNEL
            };
            match self.driver.start_soft_ap(channel) {
                Ok(()) => {
                    self.await_ap_address();
                    self.driver.start_web_server();
                    self.state = RadioState::ApActive;
                    log::info!("AP restored on channel {}", channel);
                    return ReleaseOutcome::Restored;
                }
                Err(e) => {
                    log::warn!("AP start failed on channel {}: {:?}", channel, e);
                    let _ = self.driver.wifi_stop();
                    let _ = self.driver.wifi_deinit();
                    self.driver.delay_ms(2000);
                }
            }
        }

        log::error!(
            "Cannot start AP after {} attempts, restarting device",
            AP_START_ATTEMPTS
        );
        self.driver.restart();
        ReleaseOutcome::Restarted
    }

    /// Stop and deinitialize the radio driver, retrying each step once.
    fn radio_down(&mut self) {
        if let Err(e) = self.driver.wifi_stop() {
            log::warn!("WiFi stop failed: {:?}, retrying", e);
            self.driver.delay_ms(500);
            if let Err(e) = self.driver.wifi_stop() {
                log::warn!("WiFi stop retry failed: {:?}", e);
            }
        }
        if let Err(e) = self.driver.wifi_deinit() {
            log::warn!("WiFi deinit failed: {:?}, retrying", e);
            let _ = self.driver.wifi_stop();
            self.driver.delay_ms(200);
            if let Err(e) = self.driver.wifi_deinit() {
                log::warn!("WiFi deinit retry failed: {:?}", e);
            }
        }
    }

    /// Poll for the assigned AP address before declaring the AP up.
    fn await_ap_address(&mut self) {
        for _ in 0..AP_ADDR_POLL_ATTEMPTS {
            if let Some(ip) = self.driver.soft_ap_address() {
                log::info!("AP address {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
                return;
            }
            self.driver.delay_ms(AP_ADDR_POLL_INTERVAL_MS);
        }
        log::warn!("AP address not assigned after {} polls", AP_ADDR_POLL_ATTEMPTS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Clone, Copy)]
    enum Call {
        StopWeb,
        StartWeb,
        DisablePromisc,
        Stop,
        Deinit,
        Init,
        ConfigAp,
        StartAp(u8),
        Restart,
    }

    #[derive(Default)]
    struct ScriptedDriver {
        calls: Vec<Call>,
        stop_failures: u32,
        deinit_failures: u32,
        init_failures: u32,
        ap_start_failures: u32,
        addr_polls_until_ready: u32,
        restarted: bool,
    }

    impl RadioDriver for ScriptedDriver {
        fn stop_web_server(&mut self) {
            self.calls.push(Call::StopWeb);
        }
        fn start_web_server(&mut self) {
            self.calls.push(Call::StartWeb);
        }
        fn disable_promiscuous(&mut self) {
            self.calls.push(Call::DisablePromisc);
        }
        fn wifi_stop(&mut self) -> Result<(), RadioError> {
            self.calls.push(Call::Stop);
            if self.stop_failures > 0 {
                self.stop_failures -= 1;
                return Err(RadioError(-1));
            }
            Ok(())
        }
        fn wifi_deinit(&mut self) -> Result<(), RadioError> {
            self.calls.push(Call::Deinit);
            if self.deinit_failures > 0 {
                self.deinit_failures -= 1;
                return Err(RadioError(-2));
            }
            Ok(())
        }
        fn wifi_init(&mut self) -> Result<(), RadioError> {
            self.calls.push(Call::Init);
            if self.init_failures > 0 {
                self.init_failures -= 1;
                return Err(RadioError(-3));
            }
            Ok(())
        }
        fn configure_soft_ap(&mut self) -> Result<(), RadioError> {
            self.calls.push(Call::ConfigAp);
            Ok(())
        }
        fn start_soft_ap(&mut self, channel: u8) -> Result<(), RadioError> {
            self.calls.push(Call::StartAp(channel));
            if self.ap_start_failures > 0 {
                self.ap_start_failures -= 1;
                return Err(RadioError(-4));
            }
            Ok(())
        }
        fn soft_ap_address(&mut self) -> Option<[u8; 4]> {
            if self.addr_polls_until_ready > 0 {
                self.addr_polls_until_ready -= 1;
                return None;
            }
            Some([192, 168, 4, 1])
        }
        fn delay_ms(&mut self, _ms: u32) {}
        fn restart(&mut self) {
            self.calls.push(Call::Restart);
            self.restarted = true;
        }
    }

    fn manager() -> RadioLifecycleManager<ScriptedDriver> {
        RadioLifecycleManager::new(ScriptedDriver::default())
    }

    fn ap_start_channels(driver: &ScriptedDriver) -> Vec<u8> {
        driver
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::StartAp(ch) => Some(*ch),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn acquire_then_release_roundtrip() {
        let mut mgr = manager();
        assert_eq!(mgr.state(), RadioState::ApActive);

        mgr.acquire_for_scanning();
        assert_eq!(mgr.state(), RadioState::ScanActive);

        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restored);
        assert_eq!(mgr.state(), RadioState::ApActive);

        // The web server came down before the radio and back up after it
        let calls = &mgr.driver_mut().calls;
        assert_eq!(calls[0], Call::StopWeb);
        assert_eq!(*calls.last().unwrap(), Call::StartWeb);
    }

    #[test]
    fn states_are_never_concurrent() {
        // Every observable state is exactly one variant; double calls in
        // the same direction are no-ops rather than state corruption.
        let mut mgr = manager();
        mgr.acquire_for_scanning();
        mgr.acquire_for_scanning();
        assert_eq!(mgr.state(), RadioState::ScanActive);
        mgr.release_to_ap();
        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restored);
        assert_eq!(mgr.state(), RadioState::ApActive);
    }

    #[test]
    fn stop_failure_is_retried_once_inline() {
        let mut mgr = manager();
        mgr.driver_mut().stop_failures = 1;
        mgr.acquire_for_scanning();
        assert_eq!(mgr.state(), RadioState::ScanActive);

        let stops = mgr
            .driver_mut()
            .calls
            .iter()
            .filter(|c| **c == Call::Stop)
            .count();
        assert_eq!(stops, 2);
    }

    #[test]
    fn third_attempt_uses_fallback_channel() {
        let mut mgr = manager();
        mgr.acquire_for_scanning();
        mgr.driver_mut().ap_start_failures = 2;

        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restored);
        assert_eq!(ap_start_channels(mgr.driver_mut()), vec![6, 6, 11]);
        assert!(!mgr.driver_mut().restarted);
    }

    #[test]
    fn exhausted_recovery_restarts_device() {
        let mut mgr = manager();
        mgr.acquire_for_scanning();
        mgr.driver_mut().ap_start_failures = 3;

        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restarted);
        assert!(mgr.driver_mut().restarted);
        assert_eq!(ap_start_channels(mgr.driver_mut()), vec![6, 6, 11]);
    }

    #[test]
    fn init_failure_consumes_an_attempt() {
        let mut mgr = manager();
        mgr.acquire_for_scanning();
        mgr.driver_mut().init_failures = 1;

        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restored);
        // First attempt died at init, second started the AP on the
        // configured channel
        assert_eq!(ap_start_channels(mgr.driver_mut()), vec![6]);
    }

    #[test]
    fn ap_address_is_polled_before_web_server_start() {
        let mut mgr = manager();
        mgr.acquire_for_scanning();
        mgr.driver_mut().addr_polls_until_ready = 3;

        assert_eq!(mgr.release_to_ap(), ReleaseOutcome::Restored);
        assert_eq!(mgr.state(), RadioState::ApActive);
    }
}
