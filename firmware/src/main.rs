//! Meshsentry — ESP-IDF firmware
//!
//! Thread-based control plane wiring over FreeRTOS threads and
//! `std::sync::mpsc` channels. The portable `meshsentry` crate owns all
//! protocol, lifecycle, and clock logic; this binary provides the radio,
//! storage, UARTs, and the worker threads that host the capture engines.
//!
//! Thread layout: the mesh read loop and the GPS reader block on their
//! UARTs, the control thread drains commands from both the mesh and the
//! web layer, and scan/detection workers are pinned to core 1 so the
//! radio-critical code never contends with the control plane.

mod buzzer;
mod drivers;
mod gps;
mod web;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::cpu::Core;
use esp_idf_svc::hal::gpio::{AnyIOPin, IOPin, InterruptType, PinDriver, Pull};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::hal::temp_sensor::{TempSensorConfig, TempSensorDriver};
use esp_idf_svc::hal::uart::{config::Config as UartConfig, UartDriver};
use esp_idf_svc::hal::units::Hertz;
use esp_idf_svc::nvs::EspDefaultNvsPartition;

use meshsentry::clock::ClockAuthority;
use meshsentry::config::DeviceConfig;
use meshsentry::defaults::AP_CHANNEL;
use meshsentry::dispatch::{dispatch, DispatchContext, Platform};
use meshsentry::mesh::{
    resolve_address, DetectionHit, HitNotifier, LineReader, MeshTx, TrackerNotifier,
    TrackerSnapshot,
};
use meshsentry::protocol::{parse_command, CommandVerb};
use meshsentry::radio::{RadioDriver, RadioLifecycleManager};
use meshsentry::status::{startup_message, GpsState, SharedCounters, StatusSources};
use meshsentry::tasks::{DetectionKind, ScanTaskSupervisor, TaskTicket};
use meshsentry::telemetry::TelemetryLog;
use meshsentry::vibration::{VibrationMonitor, VibrationPoll, VibrationSignal};

// ── Shared state ─────────────────────────────────────────────────────

pub(crate) static COUNTERS: SharedCounters = SharedCounters::new();
pub(crate) static SUPERVISOR: ScanTaskSupervisor = ScanTaskSupervisor::new();
pub(crate) static VIBRATION_SIGNAL: VibrationSignal = VibrationSignal::new();
pub(crate) static VIBRATION_MONITOR: Mutex<VibrationMonitor> = Mutex::new(VibrationMonitor::new());
pub(crate) static GPS_STATE: Mutex<GpsState> = Mutex::new(GpsState::new());
pub(crate) static TRACKER: Mutex<Option<TrackerSnapshot>> = Mutex::new(None);
pub(crate) static LAST_SCAN_SECS: AtomicU32 = AtomicU32::new(0);
pub(crate) static LAST_SCAN_FOREVER: AtomicBool = AtomicBool::new(false);
pub(crate) static ESP_TEMP_C: Mutex<f32> = Mutex::new(0.0);

/// Boot time — captured once in main, used for uptime calculation.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

pub(crate) fn uptime_ms() -> u64 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|boot| boot.map(|at| at.elapsed().as_millis() as u64))
        .unwrap_or(0)
}

pub(crate) type SharedClock = Arc<Mutex<ClockAuthority<drivers::Ds3231>>>;
pub(crate) type SharedTelemetry = Arc<Mutex<TelemetryLog<drivers::SdLogStorage>>>;
pub(crate) type SharedMesh = Arc<Mutex<MeshTx<drivers::UartMeshPort>>>;
pub(crate) type SharedConfig = Arc<Mutex<DeviceConfig>>;
pub(crate) type SharedRadio = Arc<Mutex<RadioLifecycleManager<drivers::EspRadioDriver>>>;
pub(crate) type SharedStore = Arc<Mutex<drivers::NvsConfigStore>>;

/// One control-plane request, from the mesh or the web layer.
pub(crate) enum ControlRequest {
    Command(CommandVerb),
    Detection {
        kind: DetectionKind,
        secs: u32,
        forever: bool,
    },
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    *BOOT_INSTANT.lock().unwrap() = Some(Instant::now());

    log::info!(
        "Meshsentry v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        meshsentry::board::BOARD_NAME
    );

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // ── Configuration from NVS ───────────────────────────────────────

    let mut store = drivers::NvsConfigStore::new(nvs_partition.clone())?;
    let mut config = DeviceConfig::new();
    store.load(&mut config);
    if config.node_id.is_empty() {
        let id = default_node_id();
        config.set_node_id(&id);
        store.save(&config);
    }
    log::info!("Node id: {}", config.node_id);
    let config: SharedConfig = Arc::new(Mutex::new(config));
    let store: SharedStore = Arc::new(Mutex::new(store));

    // ── Telemetry storage (SD over SPI, best-effort) ─────────────────

    let storage = drivers::SdLogStorage::mount(
        peripherals.spi2,
        peripherals.pins.gpio23.downgrade(),
        peripherals.pins.gpio19.downgrade(),
        peripherals.pins.gpio33.downgrade(),
        peripherals.pins.gpio15.downgrade(),
    );
    let telemetry: SharedTelemetry = Arc::new(Mutex::new(TelemetryLog::new(storage)));

    // ── RTC ──────────────────────────────────────────────────────────

    let rtc = drivers::Ds3231::probe(
        peripherals.i2c0,
        peripherals.pins.gpio3.downgrade(),
        peripherals.pins.gpio2.downgrade(),
    );
    let clock: SharedClock = Arc::new(Mutex::new(ClockAuthority::new(rtc)));

    // ── Mesh UART ────────────────────────────────────────────────────

    let (mesh_uart, mesh_port) = drivers::mesh_uart(
        peripherals.uart1,
        peripherals.pins.gpio5.downgrade(),
        peripherals.pins.gpio4.downgrade(),
    )?;
    let mesh: SharedMesh = Arc::new(Mutex::new(MeshTx::new(mesh_port)));

    // ── Channels ─────────────────────────────────────────────────────

    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<ControlRequest>(4);
    let (hit_tx, hit_rx) = mpsc::sync_channel::<DetectionHit>(16);
    let (buzzer_tx, buzzer_rx) = mpsc::sync_channel::<(u8, u16)>(2);
    // The capture engines report hits here
    let _engine_hit_tx: SyncSender<DetectionHit> = hit_tx;

    // ── Radio: initial AP + web bring-up ─────────────────────────────

    let web_ctx = web::WebContext {
        cmd: cmd_tx.clone(),
        config: config.clone(),
        store: store.clone(),
        clock: clock.clone(),
        telemetry: telemetry.clone(),
        buzzer: buzzer_tx.clone(),
    };
    let mut radio_driver =
        drivers::EspRadioDriver::new(peripherals.modem, sysloop, nvs_partition, web_ctx);
    bring_up_ap(&mut radio_driver);
    let radio: SharedRadio = Arc::new(Mutex::new(RadioLifecycleManager::new(radio_driver)));

    // ── Buzzer thread ────────────────────────────────────────────────

    {
        let timer = peripherals.ledc.timer0;
        let channel = peripherals.ledc.channel0;
        let pin = peripherals.pins.gpio8;
        thread::Builder::new()
            .name("buzzer".into())
            .stack_size(2048)
            .spawn(move || buzzer::buzzer_thread(buzzer_rx, timer, channel, pin))?;
    }

    // ── Mesh read loop ───────────────────────────────────────────────

    {
        let config = config.clone();
        let cmd_tx = cmd_tx.clone();
        thread::Builder::new()
            .name("mesh-rx".into())
            .stack_size(4096)
            .spawn(move || mesh_rx_thread(mesh_uart, config, cmd_tx))?;
    }

    // ── GPS reader ───────────────────────────────────────────────────

    {
        let gps_config = UartConfig::default().baudrate(Hertz(9_600));
        let gps_uart = UartDriver::new(
            peripherals.uart2,
            peripherals.pins.gpio43.downgrade(),
            peripherals.pins.gpio44.downgrade(),
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &gps_config,
        )?;
        let gps_uart: &'static UartDriver = Box::leak(Box::new(gps_uart));
        let clock = clock.clone();
        let telemetry = telemetry.clone();
        let mesh = mesh.clone();
        let config = config.clone();
        thread::Builder::new()
            .name("gps".into())
            .stack_size(4096)
            .spawn(move || gps::gps_thread(gps_uart, clock, telemetry, mesh, config))?;
    }

    // ── Temperature sampler ──────────────────────────────────────────

    {
        let mut sensor = TempSensorDriver::new(&TempSensorConfig::default(), peripherals.temp_sensor)?;
        sensor.enable()?;
        thread::Builder::new()
            .name("temp".into())
            .stack_size(2048)
            .spawn(move || loop {
                if let Ok(celsius) = sensor.get_celsius() {
                    *ESP_TEMP_C.lock().unwrap() = celsius;
                }
                thread::sleep(Duration::from_secs(5));
            })?;
    }

    // ── Control thread ───────────────────────────────────────────────

    {
        let config = config.clone();
        let radio = radio.clone();
        let store = store.clone();
        let mesh = mesh.clone();
        let buzzer_tx = buzzer_tx.clone();
        thread::Builder::new()
            .name("control".into())
            .stack_size(8192)
            .spawn(move || control_thread(cmd_rx, hit_rx, config, radio, store, mesh, buzzer_tx))?;
    }

    // ── Vibration sensor ISR ─────────────────────────────────────────

    let mut vibration_pin = PinDriver::input(peripherals.pins.gpio1)?;
    vibration_pin.set_pull(Pull::Down)?;
    vibration_pin.set_interrupt_type(InterruptType::PosEdge)?;
    // The handler performs exactly one atomic store; the poll loop below
    // owns everything else.
    unsafe {
        vibration_pin.subscribe(|| VIBRATION_SIGNAL.set())?;
    }
    vibration_pin.enable_interrupt()?;
    log::info!("Vibration sensor armed on GPIO1");

    // ── Startup announcement ─────────────────────────────────────────

    {
        let node_id = config.lock().unwrap().node_id.clone();
        let storage_ok = telemetry.lock().unwrap().storage_mut().available();
        let msg = startup_message(
            node_id.as_str(),
            GPS_STATE.lock().unwrap().valid,
            *ESP_TEMP_C.lock().unwrap(),
            storage_ok,
        );
        log::info!("{}", msg);
        mesh.lock().unwrap().send(&msg);
        let now_ms = uptime_ms();
        let ts = clock.lock().unwrap().now(now_ms);
        telemetry.lock().unwrap().append(&ts, now_ms, &msg);
    }

    // ── Vibration poll loop (main thread) ────────────────────────────

    loop {
        let now_ms = uptime_ms();
        let poll = VIBRATION_MONITOR
            .lock()
            .unwrap()
            .poll(&VIBRATION_SIGNAL, now_ms);

        if let VibrationPoll::Detected { alert } = poll {
            let _ = vibration_pin.enable_interrupt();
            let gps = *GPS_STATE.lock().unwrap();
            let node_id = config.lock().unwrap().node_id.clone();

            let ts = clock.lock().unwrap().now(now_ms);
            let mut event = String::from("Movement detected");
            if gps.valid {
                event.push_str(&format!(" @{:.4},{:.4}", gps.lat, gps.lon));
            }
            telemetry.lock().unwrap().append(&ts, now_ms, &event);
            log::info!("{}", event);

            if alert {
                let message = VIBRATION_MONITOR
                    .lock()
                    .unwrap()
                    .alert_message(node_id.as_str(), &gps);
                if let Some(message) = message {
                    mesh.lock().unwrap().send(&message);
                }
            }
        }

        thread::sleep(Duration::from_millis(200));
    }
}

/// First boot of the AP and web server, before the lifecycle manager
/// takes ownership of the driver (it assumes AP_ACTIVE at construction).
fn bring_up_ap(driver: &mut drivers::EspRadioDriver) {
    if let Err(e) = driver.wifi_init() {
        log::error!("WiFi init failed at boot: {:?}", e);
    }
    if let Err(e) = driver.configure_soft_ap() {
        log::error!("AP config failed at boot: {:?}", e);
    }
    if let Err(e) = driver.start_soft_ap(AP_CHANNEL) {
        log::error!("AP start failed at boot: {:?}", e);
    }
    driver.start_web_server();
    if let Some(ip) = driver.soft_ap_address() {
        log::info!("AP up at {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
    }
}

/// `NODE_` + the low bytes of the factory MAC.
fn default_node_id() -> String {
    let mut mac = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    format!("NODE_{:02X}{:02X}{:02X}{:02X}", mac[2], mac[3], mac[4], mac[5])
}

// ── Mesh read loop ───────────────────────────────────────────────────

fn mesh_rx_thread(
    uart: &'static UartDriver<'static>,
    config: SharedConfig,
    cmd_tx: SyncSender<ControlRequest>,
) {
    log::info!("Mesh read loop started");
    let mut reader = LineReader::new();
    let mut buf = [0u8; 256];

    loop {
        let n = uart.read(&mut buf, 100).unwrap_or(0);
        for &byte in &buf[..n] {
            let line = match reader.feed(byte) {
                Some(line) => line,
                None => continue,
            };
            let node_id = config.lock().unwrap().node_id.clone();
            let command = match resolve_address(line, node_id.as_str()) {
                Some(command) => command,
                None => continue,
            };
            match parse_command(command) {
                Some(verb) => {
                    let _ = cmd_tx.try_send(ControlRequest::Command(verb));
                }
                None => log::debug!("Unparseable mesh line ignored"),
            }
        }
    }
}

// ── Control thread ───────────────────────────────────────────────────

struct FwPlatform {
    radio: SharedRadio,
    store: SharedStore,
    buzzer: SyncSender<(u8, u16)>,
}

impl Platform for FwPlatform {
    fn save_config(&mut self, cfg: &DeviceConfig) {
        self.store.lock().unwrap().save(cfg);
    }

    fn beep(&mut self, beeps: u8, gap_ms: u16) {
        let _ = self.buzzer.try_send((beeps, gap_ms));
    }

    fn spawn_scan(&mut self, ticket: TaskTicket) {
        spawn_scan_worker(self.radio.clone(), ticket, None);
    }

    fn spawn_tracker(&mut self, ticket: TaskTicket, mac: [u8; 6]) {
        spawn_scan_worker(self.radio.clone(), ticket, Some(mac));
    }
}

fn control_thread(
    cmd_rx: mpsc::Receiver<ControlRequest>,
    hit_rx: mpsc::Receiver<DetectionHit>,
    config: SharedConfig,
    radio: SharedRadio,
    store: SharedStore,
    mesh: SharedMesh,
    buzzer_tx: SyncSender<(u8, u16)>,
) {
    log::info!("Control thread started");

    let mut platform = FwPlatform {
        radio,
        store,
        buzzer: buzzer_tx,
    };
    let mut hit_notifier = HitNotifier::new();
    let mut tracker_notifier = TrackerNotifier::new();

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ControlRequest::Command(verb)) => {
                let mut config = config.lock().unwrap();
                let mut mesh = mesh.lock().unwrap();
                let gps = *GPS_STATE.lock().unwrap();
                let tracker = *TRACKER.lock().unwrap();
                let vibration = VIBRATION_MONITOR.lock().unwrap();
                let target_count = config.target_count();
                let mut ctx = DispatchContext {
                    config: &mut config,
                    supervisor: &SUPERVISOR,
                    platform: &mut platform,
                    mesh: &mut mesh,
                    status: StatusSources {
                        counters: &COUNTERS,
                        gps: &gps,
                        tracker,
                        esp_temp_c: *ESP_TEMP_C.lock().unwrap(),
                        ambient_temp_c: None,
                        uptime_ms: uptime_ms(),
                        target_count,
                    },
                    vibration: &vibration,
                };
                dispatch(verb, &mut ctx);
            }
            Ok(ControlRequest::Detection {
                kind,
                secs,
                forever,
            }) => {
                if let Some(ticket) = SUPERVISOR.request_start(
                    meshsentry::tasks::TaskCategory::Detection,
                    secs,
                    forever,
                ) {
                    log::info!("{} detection starting", kind.as_str());
                    spawn_detection_worker(platform.radio.clone(), ticket, kind);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(hit) = hit_rx.try_recv() {
            let node_id = config.lock().unwrap().node_id.clone();
            let mut mesh = mesh.lock().unwrap();
            hit_notifier.notify(&mut mesh, node_id.as_str(), &hit, uptime_ms());
        }

        if COUNTERS.tracker_mode.load(Ordering::Relaxed) {
            if let Some(snapshot) = *TRACKER.lock().unwrap() {
                let node_id = config.lock().unwrap().node_id.clone();
                let mut mesh = mesh.lock().unwrap();
                tracker_notifier.notify(&mut mesh, node_id.as_str(), &snapshot, uptime_ms());
            }
        }
    }
}

// ── Scan/detection workers ───────────────────────────────────────────

/// Spawn a worker pinned to core 1, away from the control plane.
fn spawn_pinned(name: &'static str, stack_size: usize, f: impl FnOnce() + Send + 'static) {
    let _ = ThreadSpawnConfiguration {
        pin_to_core: Some(Core::Core1),
        stack_size,
        ..Default::default()
    }
    .set();
    if let Err(e) = thread::Builder::new()
        .name(name.into())
        .stack_size(stack_size)
        .spawn(f)
    {
        log::error!("{} spawn failed: {}", name, e);
    }
    let _ = ThreadSpawnConfiguration::default().set();
}

fn spawn_scan_worker(radio: SharedRadio, ticket: TaskTicket, tracker_mac: Option<[u8; 6]>) {
    LAST_SCAN_SECS.store(ticket.duration_secs, Ordering::Relaxed);
    LAST_SCAN_FOREVER.store(ticket.forever, Ordering::Relaxed);

    spawn_pinned("scan", 8192, move || {
        radio.lock().unwrap().acquire_for_scanning();

        if let Some(mac) = tracker_mac {
            COUNTERS.tracker_mode.store(true, Ordering::Relaxed);
            *TRACKER.lock().unwrap() = Some(TrackerSnapshot {
                mac,
                rssi: -127,
                last_seen_ms: 0,
                packets: 0,
            });
        }

        run_scan_window(&ticket);

        COUNTERS.tracker_mode.store(false, Ordering::Relaxed);
        let mut radio = radio.lock().unwrap();
        SUPERVISOR.complete(ticket.category, &mut radio);
        log::info!("Scan worker finished");
    });
}

fn spawn_detection_worker(radio: SharedRadio, ticket: TaskTicket, kind: DetectionKind) {
    LAST_SCAN_SECS.store(ticket.duration_secs, Ordering::Relaxed);
    LAST_SCAN_FOREVER.store(ticket.forever, Ordering::Relaxed);

    spawn_pinned("detect", 12288, move || {
        radio.lock().unwrap().acquire_for_scanning();
        run_scan_window(&ticket);
        let mut radio = radio.lock().unwrap();
        SUPERVISOR.complete(ticket.category, &mut radio);
        log::info!("{} detection finished", kind.as_str());
    });
}

/// Hold the scan window open until the stop flag or the deadline. The
/// capture engine owns the radio inside this window; the control plane
/// only polls for exit conditions.
fn run_scan_window(ticket: &TaskTicket) {
    COUNTERS.scanning.store(true, Ordering::Relaxed);
    let started = Instant::now();

    loop {
        if SUPERVISOR.stop_flag().is_requested() {
            break;
        }
        if !ticket.forever && started.elapsed().as_secs() >= u64::from(ticket.duration_secs) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    COUNTERS.scanning.store(false, Ordering::Relaxed);
}
