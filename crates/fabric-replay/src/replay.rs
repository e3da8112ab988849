//! The deadline-driven replayer (C5): launches many short, concurrent bulk transfers against an
//! emulated fabric in the order and relative timing of a synthesized trace.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rustc_hash::FxHashMap;

use fabric_core::controller::{Controller, MacAddr};
use fabric_core::placement::{group_key, PlacementMap};
use fabric_core::synth::FlowEvent;
use fabric_core::topology::Dpid;

use crate::adapters::{BulkTransferTool, CongestionControl, EmulatorDriver, LaunchSpec};

const PROGRESS_EVERY_N: usize = 1000;
const PROGRESS_EVERY_SECS: f64 = 5.0;
const ETHERTYPE_IPV4: u16 = 0x0800;
/// DSCP applied to flows whose endpoints share a group (intra-agent traffic).
const DSCP_INTRA_GROUP: u8 = 4;
/// DSCP applied to flows that cross group boundaries (agent-to-agent traffic).
const DSCP_INTER_GROUP: u8 = 8;

/// Replay options, mirroring the CLI flags in §6.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub time_scale: f64,
    pub num_server_ports: u16,
    pub base_port: u16,
    pub max_events: Option<usize>,
    pub cc: CongestionControl,
    pub priority_queues: bool,
    pub log_dir: PathBuf,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            num_server_ports: fabric_core::constants::N_PORTS_DEFAULT,
            base_port: 9000,
            max_events: None,
            cc: CongestionControl::default(),
            priority_queues: false,
            log_dir: PathBuf::from("/tmp/mininet_metrics"),
        }
    }
}

/// Why an event was skipped rather than launched (§4.5 skip policy). Skips are counted, never
/// fatal to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SenderNotPlaced,
    ReceiverNotPlaced,
    SameHost,
}

/// The outcome of a replay run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub flows_started: u64,
    pub skipped_sender_not_placed: u64,
    pub skipped_receiver_not_placed: u64,
    pub skipped_same_host: u64,
}

impl RunSummary {
    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::SenderNotPlaced => self.skipped_sender_not_placed += 1,
            SkipReason::ReceiverNotPlaced => self.skipped_receiver_not_placed += 1,
            SkipReason::SameHost => self.skipped_same_host += 1,
        }
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_sender_not_placed + self.skipped_receiver_not_placed + self.skipped_same_host
    }
}

/// A physical host's wire-level identity as far as the routing controller is concerned: the ToR
/// it hangs off, its host-facing port on that ToR, and the MAC address the controller learns it
/// by. Built once from the topology at startup, alongside the placement map.
#[derive(Debug, Clone, Copy)]
pub struct HostBinding {
    pub tor: Dpid,
    pub port: u16,
    pub mac: MacAddr,
}

/// Drives one replay: launches servers, sets TCP tunables, then walks the synthesized trace in
/// time order, honoring the deadline contract and the per-destination port round-robin, dispatching
/// each flow's endpoints through the routing controller before launching it, and finally waits out
/// the drain window before telling the tool to terminate in-flight transfers.
pub struct Replayer<'a> {
    emulator: &'a mut dyn EmulatorDriver,
    tool: &'a dyn BulkTransferTool,
    placement: &'a PlacementMap,
    controller: &'a mut Controller,
    bindings: &'a FxHashMap<String, HostBinding>,
    rng: &'a mut StdRng,
    opts: ReplayOptions,
}

impl<'a> Replayer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emulator: &'a mut dyn EmulatorDriver,
        tool: &'a dyn BulkTransferTool,
        placement: &'a PlacementMap,
        controller: &'a mut Controller,
        bindings: &'a FxHashMap<String, HostBinding>,
        rng: &'a mut StdRng,
        opts: ReplayOptions,
    ) -> Self {
        Self { emulator, tool, placement, controller, bindings, rng, opts }
    }

    /// Starts every distinct physical host found in the placement map and applies the configured
    /// congestion-control algorithm to each.
    pub fn start_hosts(&mut self) -> Result<(), crate::adapters::EmulatorError> {
        let mut seen = FxHashMap::default();
        let mut hosts = Vec::new();
        for host in self.placement.values() {
            if seen.insert(host.name.clone(), ()).is_none() {
                hosts.push(host.clone());
            }
        }
        self.emulator.start(&hosts)?;
        for host in &hosts {
            self.emulator.set_congestion_control(host, self.opts.cc)?;
        }
        Ok(())
    }

    /// Replays `events` (already time-sorted) against the placement map, returning progress lines
    /// it emitted along with the run's summary.
    pub fn replay(&mut self, events: &[FlowEvent]) -> std::io::Result<(RunSummary, Vec<String>)> {
        std::fs::create_dir_all(&self.opts.log_dir)?;

        let mut summary = RunSummary::default();
        let mut progress_lines = Vec::new();
        let mut port_counters: FxHashMap<String, u16> = FxHashMap::default();
        let mut flow_idx: u64 = 0;

        let start_wall = Instant::now();
        let t_first = events.first().map(|e| e.time.into_f64()).unwrap_or(0.0);
        let mut last_progress = Instant::now();

        for (event_idx, event) in events.iter().enumerate() {
            if let Some(max) = self.opts.max_events {
                if event_idx >= max {
                    break;
                }
            }

            self.wait_for_deadline(start_wall, t_first, event.time.into_f64());

            let Some(src_host) = self.placement.get(&event.sender) else {
                summary.record_skip(SkipReason::SenderNotPlaced);
                continue;
            };
            let src_host = src_host.clone();

            for receiver in &event.receiver {
                let Some(dst_host) = self.placement.get(receiver) else {
                    summary.record_skip(SkipReason::ReceiverNotPlaced);
                    continue;
                };
                let dst_host = dst_host.clone();
                if dst_host.name == src_host.name {
                    summary.record_skip(SkipReason::SameHost);
                    continue;
                }

                self.dispatch_through_controller(&event.sender, receiver, &src_host.name, &dst_host.name);

                let size_bytes = event.size.into_u64().max(fabric_core::constants::MIN_FLOW_SIZE.into_u64());
                let port = self.next_port(&mut port_counters, &dst_host.name);
                let log_path = self
                    .opts
                    .log_dir
                    .join(format!("{flow_idx}_{}_to_{}.json", event.sender, receiver));

                if self
                    .tool
                    .launch_flow(LaunchSpec {
                        flow_idx,
                        src: src_host.clone(),
                        dst: dst_host.clone(),
                        port,
                        size_bytes,
                        log_path,
                    })
                    .is_ok()
                {
                    summary.flows_started += 1;
                }
                flow_idx += 1;

                if flow_idx as usize % PROGRESS_EVERY_N == 0
                    || last_progress.elapsed().as_secs_f64() >= PROGRESS_EVERY_SECS
                {
                    let elapsed = start_wall.elapsed().as_secs_f64();
                    let rate = flow_idx as f64 / elapsed.max(1e-9);
                    let remaining = (events.len().saturating_sub(event_idx)) as f64;
                    let eta_s = remaining / rate.max(1e-9);
                    let line = format!("progress: flow {flow_idx} rate {rate:.1}/s eta {eta_s:.1}s");
                    log::info!("{line}");
                    progress_lines.push(line);
                    last_progress = Instant::now();
                }
            }
        }

        self.drain(summary.flows_started);
        let _ = self.tool.terminate_all();
        Ok((summary, progress_lines))
    }

    /// Exercises the routing controller for one flow's endpoints: classifies it intra- or
    /// inter-group for DSCP purposes (only when `--priority-queues` is set) and dispatches a
    /// `PacketIn` at the sender's ToR, so the VLB/ECMP path (or local rule) actually gets installed
    /// rather than the fabric being driven as a flat pipe.
    fn dispatch_through_controller(&mut self, sender: &str, receiver: &str, src_host: &str, dst_host: &str) {
        let (Some(src), Some(dst)) = (self.bindings.get(src_host), self.bindings.get(dst_host)) else {
            return;
        };
        let dscp = self.opts.priority_queues.then(|| {
            if group_key(sender) == group_key(receiver) {
                DSCP_INTRA_GROUP
            } else {
                DSCP_INTER_GROUP
            }
        });
        if let Err(e) =
            self.controller.dispatch_packet_in(src.tor, src.port, src.mac, dst.mac, ETHERTYPE_IPV4, dscp, self.rng)
        {
            log::warn!("controller dispatch failed for {src_host} -> {dst_host}: {e}");
        }
    }

    fn wait_for_deadline(&self, start_wall: Instant, t_first: f64, t_event: f64) {
        if self.opts.time_scale <= 0.0 {
            return;
        }
        let deadline = start_wall + Duration::from_secs_f64(self.opts.time_scale * (t_event - t_first).max(0.0));
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }

    fn next_port(&self, counters: &mut FxHashMap<String, u16>, dst: &str) -> u16 {
        let counter = counters.entry(dst.to_string()).or_insert(0);
        let port = self.opts.base_port + (*counter % self.opts.num_server_ports);
        *counter = counter.wrapping_add(1);
        port
    }

    fn drain(&self, flows_started: u64) {
        if self.opts.time_scale <= 0.0 {
            return;
        }
        let secs = (flows_started as f64 / 1000.0).max(10.0).min(60.0);
        std::thread::sleep(Duration::from_secs_f64(secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeBulkTransferTool, NullEmulatorDriver};
    use fabric_core::units::{Bytes, Secs};
    use rand::SeedableRng;
    use std::net::Ipv4Addr;

    fn placement_of(pairs: &[(&str, &str)]) -> PlacementMap {
        let mut map = PlacementMap::default();
        for (i, (id, host)) in pairs.iter().enumerate() {
            map.insert(
                id.to_string(),
                fabric_core::placement::PhysicalHost::new(*host, Ipv4Addr::new(10, 0, 0, i as u8 + 1), "tor-0"),
            );
        }
        map
    }

    fn event(sender: &str, receiver: &str, time: f64, size: u64) -> FlowEvent {
        FlowEvent {
            sender: sender.to_string(),
            receiver: vec![receiver.to_string()],
            time: Secs::new(time),
            size: Bytes::new(size),
        }
    }

    fn no_bindings() -> FxHashMap<String, HostBinding> {
        FxHashMap::default()
    }

    #[test]
    fn replay_skips_same_host_pairs() {
        let placement = placement_of(&[("0-1.0", "h0"), ("0-1.1", "h0")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let events = vec![event("0-1.0", "0-1.1", 0.0, 1_000_000)];
        let (summary, _) = replayer.replay(&events).unwrap();
        assert_eq!(summary.skipped_same_host, 1);
        assert_eq!(summary.flows_started, 0);
    }

    #[test]
    fn replay_skips_unplaced_endpoints() {
        let placement = placement_of(&[("0-1.0", "h0")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let events = vec![event("0-1.0", "0-2.0", 0.0, 1_000_000)];
        let (summary, _) = replayer.replay(&events).unwrap();
        assert_eq!(summary.skipped_receiver_not_placed, 1);
    }

    #[test]
    fn replay_launches_flow_between_distinct_hosts() {
        let placement = placement_of(&[("0-1.0", "h0"), ("0-2.0", "h1")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let events = vec![event("0-1.0", "0-2.0", 0.0, 1_000_000)];
        let (summary, _) = replayer.replay(&events).unwrap();
        assert_eq!(summary.flows_started, 1);
        assert_eq!(summary.total_skipped(), 0);
    }

    #[test]
    fn empty_trace_replays_with_zero_flows() {
        let placement = PlacementMap::default();
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let (summary, _) = replayer.replay(&[]).unwrap();
        assert_eq!(summary.flows_started, 0);
        assert_eq!(summary.total_skipped(), 0);
    }

    #[test]
    fn port_round_robin_advances_per_destination() {
        let placement = placement_of(&[("0-1.0", "h0"), ("0-2.0", "h1")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.num_server_ports = 2;
        opts.base_port = 9000;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let mut counters = FxHashMap::default();
        let p0 = replayer.next_port(&mut counters, "h1");
        let p1 = replayer.next_port(&mut counters, "h1");
        let p2 = replayer.next_port(&mut counters, "h1");
        assert_eq!([p0, p1, p2], [9000, 9001, 9000]);
    }

    #[test]
    fn undersized_flow_is_forced_up_to_minimum() {
        let placement = placement_of(&[("0-1.0", "h0"), ("0-2.0", "h1")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        let log_dir = tempfile::tempdir().unwrap();
        opts.log_dir = log_dir.path().to_path_buf();
        let mut controller = Controller::new();
        let bindings = no_bindings();
        let mut rng = StdRng::seed_from_u64(0);
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let events = vec![event("0-1.0", "0-2.0", 0.0, 0)];
        let (summary, _) = replayer.replay(&events).unwrap();
        assert_eq!(summary.flows_started, 1);
        let written = std::fs::read_to_string(log_dir.path().join("0_0-1.0_to_0-2.0.json")).unwrap();
        assert!(written.contains("1024"));
    }

    #[test]
    fn replay_installs_local_controller_rule_for_bound_same_tor_hosts() {
        let placement = placement_of(&[("0-1.0", "h0"), ("0-2.0", "h1")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();

        let mut controller = Controller::new();
        let tor = Dpid(3000);
        controller.on_switch_enter(tor).unwrap();
        let mac0 = MacAddr([0, 0, 0, 0, 0, 1]);
        let mac1 = MacAddr([0, 0, 0, 0, 0, 2]);
        controller.learn_host(tor, 1, mac0).unwrap();
        controller.learn_host(tor, 2, mac1).unwrap();
        let mut bindings = FxHashMap::default();
        bindings.insert("h0".to_string(), HostBinding { tor, port: 1, mac: mac0 });
        bindings.insert("h1".to_string(), HostBinding { tor, port: 2, mac: mac1 });
        let mut rng = StdRng::seed_from_u64(0);

        let before = controller.installed_rules().len();
        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        let events = vec![event("0-1.0", "0-2.0", 0.0, 1_000_000)];
        let (summary, _) = replayer.replay(&events).unwrap();
        assert_eq!(summary.flows_started, 1);
        assert!(controller.installed_rules().len() > before);
    }

    #[test]
    fn priority_queues_flag_gates_dscp_classification() {
        // Two hosts on different ToRs, so the controller must compute a VLB path (the only branch
        // that honors `dscp`) rather than installing a same-ToR local rule.
        let placement = placement_of(&[("a.0", "h0"), ("b.0", "h1")]);
        let mut driver = NullEmulatorDriver::default();
        let tool = FakeBulkTransferTool::default();
        let mut opts = ReplayOptions::default();
        opts.time_scale = 0.0;
        opts.priority_queues = true;
        opts.log_dir = tempfile::tempdir().unwrap().path().to_path_buf();

        let mut controller = Controller::new();
        let tor0 = Dpid(3000);
        let tor1 = Dpid(3001);
        let agg = Dpid(2000);
        for d in [tor0, tor1, agg] {
            controller.on_switch_enter(d).unwrap();
        }
        controller.on_link_add(tor0, 21, agg);
        controller.on_link_add(agg, 1, tor0);
        controller.on_link_add(tor1, 21, agg);
        controller.on_link_add(agg, 2, tor1);
        let mac0 = MacAddr([0, 0, 0, 0, 0, 1]);
        let mac1 = MacAddr([0, 0, 0, 0, 0, 2]);
        // Both endpoints must already be known to the controller for it to compute a VLB path
        // instead of flooding, same as `build_controller` pre-learning every pool host at startup.
        controller.learn_host(tor0, 1, mac0).unwrap();
        controller.learn_host(tor1, 1, mac1).unwrap();
        let mut bindings = FxHashMap::default();
        bindings.insert("h0".to_string(), HostBinding { tor: tor0, port: 1, mac: mac0 });
        bindings.insert("h1".to_string(), HostBinding { tor: tor1, port: 1, mac: mac1 });
        let mut rng = StdRng::seed_from_u64(0);

        let mut replayer = Replayer::new(&mut driver, &tool, &placement, &mut controller, &bindings, &mut rng, opts);
        // "a.0" -> "b.0" are different groups, so this must classify as inter-group (DSCP 8).
        let events = vec![event("a.0", "b.0", 0.0, 1_000_000)];
        replayer.replay(&events).unwrap();

        let installed_dscp = controller
            .installed_rules()
            .iter()
            .find_map(|r| match &r.matched {
                fabric_core::controller::Match::EthDstDscp { dscp, .. } => Some(*dscp),
                _ => None,
            });
        assert_eq!(installed_dscp, Some(DSCP_INTER_GROUP));
    }
}
