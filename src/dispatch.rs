//! Command dispatch — validated verbs into configuration, task, and
//! notification effects.
//!
//! Every verb validated at parse time; here each arm applies its effect
//! and emits its acknowledgment. Invalid input never reaches this module,
//! and a start against an occupied slot falls through silently (no task,
//! no ack) so duplicate starts stay idempotent.

use core::fmt::Write;

use heapless::String;

use crate::config::DeviceConfig;
use crate::mesh::{MeshPort, MeshTx};
use crate::protocol::{format_mac, CommandVerb, MacString, PayloadString};
use crate::status::{status_report, StatusSources};
use crate::tasks::{ScanTaskSupervisor, TaskCategory, TaskTicket};
use crate::vibration::VibrationMonitor;

/// Platform effects reached from command dispatch.
pub trait Platform {
    /// Persist the mutable configuration (key-value mechanics are the
    /// platform's concern).
    fn save_config(&mut self, cfg: &DeviceConfig);
    /// Run the buzzer pattern.
    fn beep(&mut self, beeps: u8, gap_ms: u16);
    /// Schedule a granted generic scan task.
    fn spawn_scan(&mut self, ticket: TaskTicket);
    /// Schedule a granted tracker task for one MAC.
    fn spawn_tracker(&mut self, ticket: TaskTicket, mac: [u8; 6]);
}

/// Mutable dispatch dependencies, injected per call.
pub struct DispatchContext<'a, P: Platform, M: MeshPort> {
    pub config: &'a mut DeviceConfig,
    pub supervisor: &'a ScanTaskSupervisor,
    pub platform: &'a mut P,
    pub mesh: &'a mut MeshTx<M>,
    pub status: StatusSources<'a>,
    pub vibration: &'a VibrationMonitor,
}

/// Apply one validated verb.
pub fn dispatch<P: Platform, M: MeshPort>(verb: CommandVerb, ctx: &mut DispatchContext<'_, P, M>) {
    match verb {
        CommandVerb::ConfigBeeps(n) => {
            ctx.config.beeps_per_hit = n;
            ctx.platform.save_config(ctx.config);
            log::info!("Beeps per hit set to {}", n);
            send_ack(ctx, format_args!("CONFIG_ACK:BEEPS:{}", n));
        }
        CommandVerb::ConfigGap(n) => {
            ctx.config.beep_gap_ms = n;
            ctx.platform.save_config(ctx.config);
            log::info!("Beep gap set to {} ms", n);
            send_ack(ctx, format_args!("CONFIG_ACK:GAP:{}", n));
        }
        CommandVerb::ConfigChannels(channels) => {
            ctx.config.channels = channels;
            ctx.platform.save_config(ctx.config);
            let csv = channels_csv(&ctx.config.channels);
            log::info!("Channel set replaced: {}", csv);
            send_ack(ctx, format_args!("CONFIG_ACK:CHANNELS:{}", csv));
        }
        CommandVerb::ConfigTargets(targets) => {
            ctx.config.targets = targets;
            ctx.platform.save_config(ctx.config);
            log::info!("Target list replaced: {} entries", ctx.config.target_count());
            send_ack(ctx, format_args!("CONFIG_ACK:TARGETS:OK"));
        }
        CommandVerb::ScanStart(req) => {
            if let Some(ticket) =
                ctx.supervisor
                    .request_start(TaskCategory::Scan, req.secs, req.forever)
            {
                ctx.config.channels = req.channels;
                ctx.config.scan_mode = req.mode;
                log::info!(
                    "List scan starting: mode {} secs {} forever {}",
                    req.mode.as_str(),
                    ticket.duration_secs,
                    ticket.forever
                );
                ctx.platform.spawn_scan(ticket);
                send_ack(ctx, format_args!("SCAN_ACK:STARTED"));
            }
        }
        CommandVerb::TrackStart(req) => {
            if let Some(ticket) =
                ctx.supervisor
                    .request_start(TaskCategory::Scan, req.secs, req.forever)
            {
                ctx.config.channels = req.channels;
                ctx.config.scan_mode = req.mode;
                let mut mac = MacString::new();
                format_mac(&req.mac, &mut mac);
                log::info!("Tracker starting for {}", mac);
                ctx.platform.spawn_tracker(ticket, req.mac);
                send_ack(ctx, format_args!("TRACK_ACK:STARTED:{}", mac));
            }
        }
        CommandVerb::Stop => {
            ctx.supervisor.stop_flag().request();
            log::info!("Stop requested");
            send_ack(ctx, format_args!("STOP_ACK:OK"));
        }
        CommandVerb::Status => {
            let lines = status_report(
                ctx.config.node_id.as_str(),
                ctx.config.scan_mode,
                &ctx.status,
            );
            for line in &lines {
                ctx.mesh.send(line);
            }
        }
        CommandVerb::BeepTest => {
            ctx.platform
                .beep(ctx.config.beeps_per_hit, ctx.config.beep_gap_ms);
            send_ack(ctx, format_args!("BEEP_ACK:OK"));
        }
        CommandVerb::VibrationStatus => {
            let line = ctx
                .vibration
                .status_line(ctx.config.node_id.as_str(), ctx.status.uptime_ms);
            ctx.mesh.send(&line);
        }
    }
}

fn send_ack<P: Platform, M: MeshPort>(
    ctx: &mut DispatchContext<'_, P, M>,
    body: core::fmt::Arguments,
) {
    let mut msg = PayloadString::new();
    if write!(msg, "{}: {}", ctx.config.node_id, body).is_err() {
        return;
    }
    ctx.mesh.send(&msg);
}

fn channels_csv(channels: &[u8]) -> String<64> {
    let mut csv = String::new();
    for (i, ch) in channels.iter().enumerate() {
        if i > 0 {
            let _ = csv.push(',');
        }
        let _ = write!(csv, "{}", ch);
    }
    csv
}
