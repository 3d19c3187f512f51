//! ESP-IDF implementations of the portable control-plane traits.
//!
//! Radio/web lifecycle over `EspWifi` + `EspHttpServer`, configuration in
//! NVS, the telemetry log on a FAT-formatted SD card behind the VFS, the
//! DS3231 RTC over I2C, and the mesh UART transmit gate over the raw
//! driver queue.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::thread;
use std::time::Duration;

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::fs::fatfs::Fatfs;
use esp_idf_svc::hal::delay::BLOCK;
use esp_idf_svc::hal::gpio::AnyIOPin;
use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver, I2C0};
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::sd::{spi::SdSpiHostDriver, SdCardConfiguration, SdCardDriver};
use esp_idf_svc::hal::spi::{config::DriverConfig, SpiDriver, SPI2};
use esp_idf_svc::hal::uart::{config::Config as UartConfig, UartDriver, UART1};
use esp_idf_svc::hal::units::Hertz;
use esp_idf_svc::http::server::EspHttpServer;
use esp_idf_svc::io::vfs::MountedFatfs;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::wifi::{AccessPointConfiguration, AuthMethod, Configuration, EspWifi};

use meshsentry::clock::{CivilDateTime, RtcDevice};
use meshsentry::config::DeviceConfig;
use meshsentry::defaults::{AP_CHANNEL, AP_PASS, AP_SSID, MESH_BAUD};
use meshsentry::mesh::MeshPort;
use meshsentry::protocol::{format_mac, parse_targets, MacString, Target};
use meshsentry::radio::{RadioDriver, RadioError};
use meshsentry::telemetry::LogStorage;

use crate::web::{self, WebContext};

// ── Radio + web server ───────────────────────────────────────────────

pub struct EspRadioDriver {
    modem: Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    wifi: Option<EspWifi<'static>>,
    server: Option<EspHttpServer<'static>>,
    ctx: WebContext,
}

impl EspRadioDriver {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ctx: WebContext,
    ) -> Self {
        Self {
            modem,
            sysloop,
            nvs,
            wifi: None,
            server: None,
            ctx,
        }
    }

    fn ap_config(channel: u8) -> Configuration {
        Configuration::AccessPoint(AccessPointConfiguration {
            ssid: AP_SSID.try_into().unwrap_or_default(),
            password: AP_PASS.try_into().unwrap_or_default(),
            channel,
            auth_method: AuthMethod::WPA2Personal,
            max_connections: 8,
            ..Default::default()
        })
    }
}

impl RadioDriver for EspRadioDriver {
    fn stop_web_server(&mut self) {
        if self.server.take().is_some() {
            log::info!("Web server stopped");
        }
    }

    fn start_web_server(&mut self) {
        self.server = web::build_server(&self.ctx);
    }

    fn disable_promiscuous(&mut self) {
        unsafe {
            esp_idf_svc::sys::esp_wifi_set_promiscuous(false);
            esp_idf_svc::sys::esp_wifi_set_promiscuous_rx_cb(None);
        }
    }

    fn wifi_stop(&mut self) -> Result<(), RadioError> {
        match self.wifi.as_mut() {
            Some(wifi) => wifi.stop().map_err(|e| RadioError(e.code())),
            None => Ok(()),
        }
    }

    fn wifi_deinit(&mut self) -> Result<(), RadioError> {
        // Dropping the driver releases the WiFi stack
        self.wifi = None;
        Ok(())
    }

    fn wifi_init(&mut self) -> Result<(), RadioError> {
        if self.wifi.is_some() {
            return Ok(());
        }
        let modem = unsafe { self.modem.clone_unchecked() };
        let wifi = EspWifi::new(modem, self.sysloop.clone(), Some(self.nvs.clone()))
            .map_err(|e| RadioError(e.code()))?;
        self.wifi = Some(wifi);
        Ok(())
    }

    fn configure_soft_ap(&mut self) -> Result<(), RadioError> {
        let wifi = self.wifi.as_mut().ok_or(RadioError(-1))?;
        wifi.set_configuration(&Self::ap_config(AP_CHANNEL))
            .map_err(|e| RadioError(e.code()))
    }

    fn start_soft_ap(&mut self, channel: u8) -> Result<(), RadioError> {
        let wifi = self.wifi.as_mut().ok_or(RadioError(-1))?;
        wifi.set_configuration(&Self::ap_config(channel))
            .map_err(|e| RadioError(e.code()))?;
        wifi.start().map_err(|e| RadioError(e.code()))
    }

    fn soft_ap_address(&mut self) -> Option<[u8; 4]> {
        let info = self.wifi.as_ref()?.ap_netif().get_ip_info().ok()?;
        if info.ip.is_unspecified() {
            return None;
        }
        Some(info.ip.octets())
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn restart(&mut self) {
        log::error!("Device will restart in 5 seconds");
        thread::sleep(Duration::from_secs(5));
        unsafe { esp_idf_svc::sys::esp_restart() }
    }
}

// ── NVS-backed configuration store ───────────────────────────────────

pub struct NvsConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, "meshsentry", true)?,
        })
    }

    pub fn load(&mut self, cfg: &mut DeviceConfig) {
        let mut id_buf = [0u8; 32];
        if let Ok(Some(id)) = self.nvs.get_str("nodeId", &mut id_buf) {
            cfg.set_node_id(id);
        }
        if let Ok(Some(beeps)) = self.nvs.get_u8("beeps") {
            if (1..=10).contains(&beeps) {
                cfg.beeps_per_hit = beeps;
            }
        }
        if let Ok(Some(gap)) = self.nvs.get_u16("gap") {
            if (20..=2000).contains(&gap) {
                cfg.beep_gap_ms = gap;
            }
        }
        let mut target_buf = [0u8; 1280];
        if let Ok(Some(text)) = self.nvs.get_str("targets", &mut target_buf) {
            if let Some(targets) = parse_targets(text) {
                cfg.targets = targets;
            }
        }
    }

    pub fn save(&mut self, cfg: &DeviceConfig) {
        if let Err(e) = self.nvs.set_str("nodeId", cfg.node_id.as_str()) {
            log::warn!("NVS nodeId write failed: {}", e);
        }
        if let Err(e) = self.nvs.set_u8("beeps", cfg.beeps_per_hit) {
            log::warn!("NVS beeps write failed: {}", e);
        }
        if let Err(e) = self.nvs.set_u16("gap", cfg.beep_gap_ms) {
            log::warn!("NVS gap write failed: {}", e);
        }
        if let Err(e) = self.nvs.set_str("targets", &targets_text(cfg)) {
            log::warn!("NVS targets write failed: {}", e);
        }
    }
}

pub fn targets_text(cfg: &DeviceConfig) -> String {
    let mut text = String::new();
    for target in &cfg.targets {
        if !text.is_empty() {
            text.push('\n');
        }
        match target {
            Target::Mac(mac) => {
                let mut s = MacString::new();
                format_mac(mac, &mut s);
                text.push_str(&s);
            }
            Target::Oui(oui) => {
                text.push_str(&format!("{:02X}:{:02X}:{:02X}", oui[0], oui[1], oui[2]));
            }
        }
    }
    text
}

// ── SD-backed telemetry log storage ──────────────────────────────────

const LOG_PATH: &str = "/sdcard/telemetry.log";

pub struct SdLogStorage {
    available: bool,
    file: Option<File>,
}

impl SdLogStorage {
    pub fn mount(
        spi: SPI2,
        sclk: AnyIOPin,
        mosi: AnyIOPin,
        miso: AnyIOPin,
        cs: AnyIOPin,
    ) -> Self {
        match Self::try_mount(spi, sclk, mosi, miso, cs) {
            Ok(()) => {
                log::info!("SD card mounted at /sdcard");
                Self {
                    available: true,
                    file: None,
                }
            }
            Err(e) => {
                log::warn!("SD card unavailable: {}", e);
                Self {
                    available: false,
                    file: None,
                }
            }
        }
    }

    fn try_mount(
        spi: SPI2,
        sclk: AnyIOPin,
        mosi: AnyIOPin,
        miso: AnyIOPin,
        cs: AnyIOPin,
    ) -> anyhow::Result<()> {
        let spi_driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &DriverConfig::default())?;
        let sd_spi = SdSpiHostDriver::new(
            spi_driver,
            Some(cs),
            AnyIOPin::none(),
            AnyIOPin::none(),
            AnyIOPin::none(),
            #[cfg(not(any(
                esp_idf_version_major = "4",
                all(esp_idf_version_major = "5", esp_idf_version_minor = "0")
            )))]
            None,
        )?;
        let sd_card = SdCardDriver::new_spi(sd_spi, &SdCardConfiguration::new())?;
        let mounted = MountedFatfs::mount(Fatfs::new_sdcard(0, sd_card)?, "/sdcard", 4)?;
        // The mount lives for the life of the device
        Box::leak(Box::new(mounted));
        Ok(())
    }
}

impl LogStorage for SdLogStorage {
    fn available(&mut self) -> bool {
        self.available
    }

    fn open_append(&mut self) -> bool {
        match OpenOptions::new().create(true).append(true).open(LOG_PATH) {
            Ok(file) => {
                self.file = Some(file);
                true
            }
            Err(e) => {
                log::warn!("Log open failed: {}", e);
                false
            }
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn write_line(&mut self, line: &str) -> bool {
        match self.file.as_mut() {
            Some(file) => writeln!(file, "{}", line).is_ok(),
            None => false,
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.sync_all();
        }
    }

    fn size(&mut self) -> Option<u64> {
        std::fs::metadata(LOG_PATH).ok().map(|m| m.len())
    }
}

// ── DS3231 RTC ───────────────────────────────────────────────────────

const DS3231_ADDR: u8 = 0x68;

pub struct Ds3231 {
    i2c: I2cDriver<'static>,
}

impl Ds3231 {
    /// Probe the I2C bus; None when no DS3231 answers.
    pub fn probe(i2c: I2C0, sda: AnyIOPin, scl: AnyIOPin) -> Option<Self> {
        let config = I2cConfig::new().baudrate(Hertz(100_000).into());
        let mut driver = match I2cDriver::new(i2c, sda, scl, &config) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("I2C init failed: {}", e);
                return None;
            }
        };
        let mut probe = [0u8; 1];
        if driver.write_read(DS3231_ADDR, &[0x00], &mut probe, BLOCK).is_err() {
            log::warn!("No DS3231 on the I2C bus");
            return None;
        }
        log::info!("DS3231 RTC found");
        Some(Self { i2c: driver })
    }
}

fn bcd_to_dec(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0F)
}

fn dec_to_bcd(d: u8) -> u8 {
    ((d / 10) << 4) | (d % 10)
}

impl RtcDevice for Ds3231 {
    fn now(&mut self) -> Option<CivilDateTime> {
        let mut regs = [0u8; 7];
        self.i2c
            .write_read(DS3231_ADDR, &[0x00], &mut regs, BLOCK)
            .ok()?;
        Some(CivilDateTime {
            second: bcd_to_dec(regs[0] & 0x7F),
            minute: bcd_to_dec(regs[1] & 0x7F),
            hour: bcd_to_dec(regs[2] & 0x3F),
            day: bcd_to_dec(regs[4] & 0x3F),
            month: bcd_to_dec(regs[5] & 0x1F),
            year: 2000 + u16::from(bcd_to_dec(regs[6])),
        })
    }

    fn adjust(&mut self, dt: &CivilDateTime) -> bool {
        if !(2000..=2099).contains(&dt.year) {
            return false;
        }
        let regs = [
            0x00,
            dec_to_bcd(dt.second),
            dec_to_bcd(dt.minute),
            dec_to_bcd(dt.hour),
            1, // day-of-week register, unused
            dec_to_bcd(dt.day),
            dec_to_bcd(dt.month),
            dec_to_bcd((dt.year - 2000) as u8),
        ];
        self.i2c.write(DS3231_ADDR, &regs, BLOCK).is_ok()
    }
}

// ── Mesh UART ────────────────────────────────────────────────────────

const MESH_UART_NUM: i32 = 1;

/// Transmit gate over the mesh UART. Capacity comes straight from the
/// driver's TX ring buffer, so a send is dropped rather than blocking
/// behind a full queue.
pub struct UartMeshPort;

impl MeshPort for UartMeshPort {
    fn free_capacity(&mut self) -> usize {
        let mut free: usize = 0;
        let err = unsafe {
            esp_idf_svc::sys::uart_get_tx_buffer_free_size(MESH_UART_NUM, &mut free)
        };
        if err != esp_idf_svc::sys::ESP_OK {
            return 0;
        }
        free
    }

    fn write_line(&mut self, payload: &str) {
        unsafe {
            esp_idf_svc::sys::uart_write_bytes(
                MESH_UART_NUM,
                payload.as_ptr().cast(),
                payload.len(),
            );
            esp_idf_svc::sys::uart_write_bytes(MESH_UART_NUM, b"\r\n".as_ptr().cast(), 2);
        }
    }
}

/// Bring up the mesh UART, drain boot garbage, and hand out the receive
/// driver plus the transmit gate.
pub fn mesh_uart(
    uart: UART1,
    tx: AnyIOPin,
    rx: AnyIOPin,
) -> anyhow::Result<(&'static UartDriver<'static>, UartMeshPort)> {
    let config = UartConfig::default().baudrate(Hertz(MESH_BAUD));
    let driver = UartDriver::new(
        uart,
        tx,
        rx,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &config,
    )?;
    let driver: &'static UartDriver = Box::leak(Box::new(driver));

    // Drain whatever accumulated while the link was floating
    let mut junk = [0u8; 64];
    while matches!(driver.read(&mut junk, 0), Ok(n) if n > 0) {}

    log::info!("Mesh UART up at {} baud", MESH_BAUD);
    Ok((driver, UartMeshPort))
}
