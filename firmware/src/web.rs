//! Web layer — HTTP routes funneling into the control plane.
//!
//! Route handlers only parse and validate form parameters; accepted
//! requests become the same [`CommandVerb`] values the mesh produces and
//! travel through the same dispatcher. The server itself is created and
//! destroyed by the radio lifecycle manager, never directly from here.

use std::sync::atomic::Ordering;
use std::sync::mpsc;

use esp_idf_svc::http::server::{Configuration as ServerConfiguration, EspHttpServer, Method};
use esp_idf_svc::io::{Read as _, Write as _};

use meshsentry::config::{buzzer_config_json, node_id_json};
use meshsentry::defaults::{DEFAULT_SCAN_SECS, DEFAULT_TRACK_SECS, MAX_SCAN_SECS};
use meshsentry::protocol::{
    parse_channels_csv, parse_mac6, parse_targets, ChannelList, CommandVerb, ScanMode,
    ScanRequest, TrackRequest,
};
use meshsentry::status::{diagnostics, DiagInputs, StatusSources};
use meshsentry::tasks::DetectionKind;

use crate::drivers::targets_text;
use crate::{
    uptime_ms, ControlRequest, SharedClock, SharedConfig, SharedStore, SharedTelemetry,
    COUNTERS, ESP_TEMP_C, GPS_STATE, LAST_SCAN_FOREVER, LAST_SCAN_SECS, SUPERVISOR, TRACKER,
    VIBRATION_MONITOR,
};

const INDEX_HTML: &str = "<!doctype html><html><head><title>Meshsentry</title></head>\
<body><h1>Meshsentry</h1><p>Control endpoints: /scan /track /sniffer /stop /config \
/node-id /diag /gps /sd-status /export /save /beep</p></body></html>";

/// Everything the route handlers reach, cloneable into each closure.
#[derive(Clone)]
pub struct WebContext {
    pub cmd: mpsc::SyncSender<ControlRequest>,
    pub config: SharedConfig,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub telemetry: SharedTelemetry,
    pub buzzer: mpsc::SyncSender<(u8, u16)>,
}

/// Extract and percent-decode one form field from a urlencoded body.
fn form_value(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(url_decode(v));
        }
    }
    None
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let Some(hex) = value.get(i + 1..i + 3) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(b'%');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn clamp_secs(value: Option<String>, default: u32) -> u32 {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
        .min(MAX_SCAN_SECS)
}

fn scan_mode(value: Option<String>) -> ScanMode {
    value
        .and_then(|v| v.parse().ok())
        .and_then(ScanMode::from_u8)
        .unwrap_or(ScanMode::Wifi)
}

fn channels_or(value: Option<String>, default: &[u8]) -> ChannelList {
    value
        .as_deref()
        .and_then(parse_channels_csv)
        .unwrap_or_else(|| ChannelList::from_slice(default).unwrap_or_default())
}

/// Create the HTTP server and register every route. Returns None when
/// the server cannot start (the AP recovery path logs and retries).
pub fn build_server(ctx: &WebContext) -> Option<EspHttpServer<'static>> {
    let mut server = match EspHttpServer::new(&ServerConfiguration::default()) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Web server start failed: {}", e);
            return None;
        }
    };

    let result = register_routes(&mut server, ctx);
    if let Err(e) = result {
        log::error!("Route registration failed: {}", e);
        return None;
    }

    log::info!("Web server started");
    Some(server)
}

fn register_routes(server: &mut EspHttpServer<'static>, ctx: &WebContext) -> anyhow::Result<()> {
    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/scan", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let forever = form_value(&body, "forever").is_some();
        let secs = clamp_secs(form_value(&body, "secs"), DEFAULT_SCAN_SECS);
        let request = ScanRequest {
            mode: scan_mode(form_value(&body, "mode")),
            secs,
            channels: channels_or(form_value(&body, "ch"), &[1, 6, 11]),
            forever,
        };
        let mode = request.mode;
        let _ = c.cmd.try_send(ControlRequest::Command(CommandVerb::ScanStart(request)));
        let reply = if forever {
            format!("Scan starting (forever) - {}", mode.as_str())
        } else {
            format!("Scan starting for {}s - {}", secs, mode.as_str())
        };
        req.into_ok_response()?.write_all(reply.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/track", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let mac = match form_value(&body, "mac").as_deref().and_then(parse_mac6) {
            Some(mac) => mac,
            None => {
                req.into_status_response(400)?.write_all(b"Invalid MAC")?;
                return Ok(());
            }
        };
        let forever = form_value(&body, "forever").is_some();
        let secs = clamp_secs(form_value(&body, "secs"), DEFAULT_TRACK_SECS);
        let request = TrackRequest {
            mac,
            mode: scan_mode(form_value(&body, "mode")),
            secs,
            channels: channels_or(form_value(&body, "ch"), &[6]),
            forever,
        };
        let mode = request.mode;
        let _ = c.cmd.try_send(ControlRequest::Command(CommandVerb::TrackStart(request)));
        let reply = if forever {
            format!("Tracker starting (forever) - {}", mode.as_str())
        } else {
            format!("Tracker starting for {}s - {}", secs, mode.as_str())
        };
        req.into_ok_response()?.write_all(reply.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/sniffer", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let detection = form_value(&body, "detection").unwrap_or_else(|| "device-scan".into());
        let kind = match DetectionKind::from_param(&detection) {
            Some(kind) => kind,
            None => {
                req.into_status_response(400)?
                    .write_all(b"Unknown detection mode")?;
                return Ok(());
            }
        };
        let forever = form_value(&body, "forever").is_some();
        let secs = clamp_secs(form_value(&body, "secs"), DEFAULT_SCAN_SECS);
        let _ = c.cmd.try_send(ControlRequest::Detection { kind, secs, forever });
        let reply = if forever {
            format!("{} detection starting (forever)", kind.as_str())
        } else {
            format!("{} detection starting for {}s", kind.as_str(), secs)
        };
        req.into_ok_response()?.write_all(reply.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/stop", Method::Get, |req| {
        SUPERVISOR.stop_flag().request();
        req.into_ok_response()?
            .write_all(b"Stopping... (AP will return shortly)")?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/beep", Method::Get, move |req| {
        let (beeps, gap) = {
            let config = c.config.lock().unwrap();
            (config.beeps_per_hit, config.beep_gap_ms)
        };
        let _ = c.buzzer.try_send((beeps, gap));
        req.into_ok_response()?.write_all(b"Beeped")?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
        let json = buzzer_config_json(&c.config.lock().unwrap()).unwrap_or_default();
        req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
            .write_all(json.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let mut config = c.config.lock().unwrap();
        if let Some(beeps) = form_value(&body, "beeps").and_then(|v| v.parse::<u8>().ok()) {
            config.beeps_per_hit = beeps.clamp(1, 10);
        }
        if let Some(gap) = form_value(&body, "gap").and_then(|v| v.parse::<u16>().ok()) {
            config.beep_gap_ms = gap.clamp(20, 2000);
        }
        c.store.lock().unwrap().save(&config);
        drop(config);
        req.into_ok_response()?.write_all(b"Config saved")?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/node-id", Method::Get, move |req| {
        let json = node_id_json(&c.config.lock().unwrap()).unwrap_or_default();
        req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
            .write_all(json.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/node-id", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let id = form_value(&body, "id").unwrap_or_default();
        let mut config = c.config.lock().unwrap();
        if config.set_node_id(&id) {
            c.store.lock().unwrap().save(&config);
            drop(config);
            req.into_ok_response()?.write_all(b"Node ID updated")?;
        } else {
            drop(config);
            req.into_status_response(400)?
                .write_all(b"Invalid ID (1-16 chars)")?;
        }
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/export", Method::Get, move |req| {
        let text = targets_text(&c.config.lock().unwrap());
        req.into_ok_response()?.write_all(text.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let body = read_body(&mut req)?;
        let list = match form_value(&body, "list") {
            Some(list) => list,
            None => {
                req.into_status_response(400)?.write_all(b"Missing 'list'")?;
                return Ok(());
            }
        };
        match parse_targets(&list) {
            Some(targets) => {
                let _ = c
                    .cmd
                    .try_send(ControlRequest::Command(CommandVerb::ConfigTargets(targets)));
                req.into_ok_response()?.write_all(b"Saved")?;
            }
            None => {
                req.into_status_response(400)?.write_all(b"Invalid target")?;
            }
        }
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/diag", Method::Get, move |req| {
        let text = build_diagnostics(&c);
        req.into_ok_response()?.write_all(text.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/gps", Method::Get, |req| {
        let gps = *GPS_STATE.lock().unwrap();
        let reply = if gps.valid {
            format!(
                "GPS: Locked\nLatitude: {:.6}\nLongitude: {:.6}\nSatellites: {}\nHDOP: {:.2}\n",
                gps.lat, gps.lon, gps.sats, gps.hdop
            )
        } else {
            "GPS: No valid fix\n".to_string()
        };
        req.into_ok_response()?.write_all(reply.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/sd-status", Method::Get, move |req| {
        let available = c.telemetry.lock().unwrap().storage_mut().available();
        let reply = if available {
            "SD card: Available"
        } else {
            "SD card: Not available"
        };
        req.into_ok_response()?.write_all(reply.as_bytes())?;
        Ok(())
    })?;

    let c = ctx.clone();
    server.fn_handler::<anyhow::Error, _>("/vibration", Method::Get, move |req| {
        let node_id = c.config.lock().unwrap().node_id.clone();
        let line = VIBRATION_MONITOR
            .lock()
            .unwrap()
            .status_line(node_id.as_str(), uptime_ms());
        req.into_ok_response()?.write_all(line.as_bytes())?;
        Ok(())
    })?;

    Ok(())
}

fn read_body(
    req: &mut esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection>,
) -> anyhow::Result<String> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 256];
    while body.len() < 2048 {
        let n = req.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn build_diagnostics(ctx: &WebContext) -> String {
    let config = ctx.config.lock().unwrap();
    let gps = *GPS_STATE.lock().unwrap();
    let tracker = *TRACKER.lock().unwrap();
    let now_ms = uptime_ms();

    let (clock_source, rtc_time, last_sync_age) = {
        let mut clock = ctx.clock.lock().unwrap();
        let source = clock.source();
        let time = if source == meshsentry::clock::ClockSource::BootRelative {
            None
        } else {
            Some(clock.now(now_ms))
        };
        let age = clock
            .last_sync_ms()
            .map(|at| now_ms.saturating_sub(at) / 1000);
        (source, time, age)
    };

    let sources = StatusSources {
        counters: &COUNTERS,
        gps: &gps,
        tracker,
        esp_temp_c: *ESP_TEMP_C.lock().unwrap(),
        ambient_temp_c: None,
        uptime_ms: now_ms,
        target_count: config.target_count(),
    };
    let diag = DiagInputs {
        node_id: config.node_id.as_str(),
        scan_mode: config.scan_mode,
        channels: &config.channels,
        storage_available: ctx.telemetry.lock().unwrap().storage_mut().available(),
        clock_source,
        rtc_time,
        last_sync_age_secs: last_sync_age,
        last_vibration_ms: VIBRATION_MONITOR.lock().unwrap().last_event_ms(),
        last_scan_secs: LAST_SCAN_SECS.load(Ordering::Relaxed),
        last_scan_forever: LAST_SCAN_FOREVER.load(Ordering::Relaxed),
    };

    diagnostics(&sources, &diag).as_str().to_string()
}
