//! GPS reader — NMEA decoding feeding the fix state and the RTC sync.
//!
//! Only the RMC (fix + date/time) and GGA (satellites + HDOP) sentences
//! are decoded; everything else on the wire is skipped. Fix transitions
//! are announced over the mesh and logged.

use esp_idf_svc::hal::uart::UartDriver;

use meshsentry::clock::{CivilDateTime, GpsTimeReading};
use meshsentry::mesh::LineReader;
use meshsentry::status::gps_lock_message;

use crate::{uptime_ms, SharedClock, SharedConfig, SharedMesh, SharedTelemetry, GPS_STATE};

/// Fix considered stale after this long without a valid sentence
const FIX_TIMEOUT_MS: u64 = 30_000;

pub struct RmcData {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub time: Option<(u8, u8, u8)>,
    pub date: Option<(u8, u8, u16)>,
}

pub struct GgaData {
    pub sats: u32,
    pub hdop: f32,
}

pub enum Sentence {
    Rmc(RmcData),
    Gga(GgaData),
}

/// Validate the `*XX` checksum when present.
fn checksum_ok(line: &str) -> bool {
    let body = match line.strip_prefix('$') {
        Some(b) => b,
        None => return false,
    };
    match body.split_once('*') {
        Some((data, sum)) => {
            let expected = match u8::from_str_radix(sum.trim(), 16) {
                Ok(v) => v,
                Err(_) => return false,
            };
            let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
            actual == expected
        }
        None => true,
    }
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed degrees.
fn parse_coord(field: &str, hemi: &str, deg_digits: usize) -> Option<f64> {
    if field.len() <= deg_digits {
        return None;
    }
    let degrees: f64 = field[..deg_digits].parse().ok()?;
    let minutes: f64 = field[deg_digits..].parse().ok()?;
    let mut value = degrees + minutes / 60.0;
    if hemi == "S" || hemi == "W" {
        value = -value;
    }
    Some(value)
}

/// Decode one NMEA line into the sentences the control plane consumes.
pub fn parse_sentence(line: &str) -> Option<Sentence> {
    if !checksum_ok(line) {
        return None;
    }
    let body = line.strip_prefix('$')?;
    let body = body.split('*').next()?;
    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields.first()?;

    if kind.ends_with("RMC") && fields.len() >= 10 {
        let valid = fields[2] == "A";
        let (lat, lon) = if valid {
            match (
                parse_coord(fields[3], fields[4], 2),
                parse_coord(fields[5], fields[6], 3),
            ) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => return None,
            }
        } else {
            (0.0, 0.0)
        };

        let time = fields[1].get(..6).and_then(|t| {
            Some((
                t[0..2].parse().ok()?,
                t[2..4].parse().ok()?,
                t[4..6].parse().ok()?,
            ))
        });
        let date = fields[9].get(..6).and_then(|d| {
            Some((
                d[0..2].parse().ok()?,
                d[2..4].parse().ok()?,
                2000u16 + d[4..6].parse::<u16>().ok()?,
            ))
        });

        return Some(Sentence::Rmc(RmcData {
            valid,
            lat,
            lon,
            time,
            date,
        }));
    }

    if kind.ends_with("GGA") && fields.len() >= 9 {
        let sats = fields[7].parse().unwrap_or(0);
        let hdop = fields[8].parse().unwrap_or(0.0);
        return Some(Sentence::Gga(GgaData { sats, hdop }));
    }

    None
}

/// Blocking GPS reader loop. Owns the fix-state transitions and drives
/// the hourly RTC reconciliation.
pub fn gps_thread(
    uart: &'static UartDriver<'static>,
    clock: SharedClock,
    telemetry: SharedTelemetry,
    mesh: SharedMesh,
    config: SharedConfig,
) {
    log::info!("GPS thread started");

    let mut reader = LineReader::new();
    let mut buf = [0u8; 128];
    let mut last_sentence_ms: Option<u64> = None;
    let mut was_locked = false;

    loop {
        let n = uart.read(&mut buf, 100).unwrap_or(0);
        for &byte in &buf[..n] {
            let line = match reader.feed(byte) {
                Some(line) => line,
                None => continue,
            };
            let sentence = match parse_sentence(line) {
                Some(s) => s,
                None => continue,
            };
            last_sentence_ms = Some(uptime_ms());

            match sentence {
                Sentence::Rmc(rmc) => {
                    let locked = rmc.valid;
                    {
                        let mut gps = GPS_STATE.lock().unwrap();
                        gps.valid = locked;
                        if locked {
                            gps.lat = rmc.lat;
                            gps.lon = rmc.lon;
                        }
                    }
                    if locked != was_locked {
                        announce_lock(&mesh, &telemetry, &clock, &config, locked);
                        was_locked = locked;
                    }
                    if locked {
                        try_rtc_sync(&rmc, &clock, &telemetry, &mesh, &config);
                    }
                }
                Sentence::Gga(gga) => {
                    let mut gps = GPS_STATE.lock().unwrap();
                    gps.sats = gga.sats;
                    gps.hdop = gga.hdop;
                }
            }
        }

        // A fix with no data behind it goes stale
        if was_locked {
            if let Some(last) = last_sentence_ms {
                if uptime_ms().saturating_sub(last) > FIX_TIMEOUT_MS {
                    GPS_STATE.lock().unwrap().valid = false;
                    announce_lock(&mesh, &telemetry, &clock, &config, false);
                    was_locked = false;
                }
            }
        }
    }
}

fn announce_lock(
    mesh: &SharedMesh,
    telemetry: &SharedTelemetry,
    clock: &SharedClock,
    config: &SharedConfig,
    locked: bool,
) {
    let node_id = config.lock().unwrap().node_id.clone();
    let gps = *GPS_STATE.lock().unwrap();
    let msg = gps_lock_message(node_id.as_str(), &gps, locked);
    log::info!("{}", msg);
    mesh.lock().unwrap().send(&msg);

    let now_ms = uptime_ms();
    let ts = clock.lock().unwrap().now(now_ms);
    telemetry.lock().unwrap().append(&ts, now_ms, &msg);
}

fn try_rtc_sync(
    rmc: &RmcData,
    clock: &SharedClock,
    telemetry: &SharedTelemetry,
    mesh: &SharedMesh,
    config: &SharedConfig,
) {
    let (time, date) = match (rmc.time, rmc.date) {
        (Some(t), Some(d)) => (t, d),
        _ => return,
    };
    let reading = GpsTimeReading {
        date_valid: true,
        time_valid: true,
        dt: CivilDateTime {
            year: date.2,
            month: date.1,
            day: date.0,
            hour: time.0,
            minute: time.1,
            second: time.2,
        },
    };
    let node_id = config.lock().unwrap().node_id.clone();
    let mut clock = clock.lock().unwrap();
    let mut telemetry = telemetry.lock().unwrap();
    let mut mesh = mesh.lock().unwrap();
    clock.try_sync_from_gps(
        &reading,
        uptime_ms(),
        &mut telemetry,
        &mut mesh,
        node_id.as_str(),
    );
}
