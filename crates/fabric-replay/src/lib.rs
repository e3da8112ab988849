#![warn(unreachable_pub, missing_debug_implementations)]

//! Replayer binary crate: wires the trace loader/synthesizer, process placer, and controller from
//! `fabric-core` together with the external emulator/bulk-transfer adapters defined here, driven
//! by the CLI in [`cli`].

pub mod adapters;
pub mod cli;
pub mod replay;

use std::net::Ipv4Addr;

use rand::SeedableRng;
use rustc_hash::FxHashMap;

use fabric_core::controller::{Controller, ControllerError, MacAddr};
use fabric_core::placement::{place_strided, pool_size, PhysicalHost};
use fabric_core::synth::synthesize;
use fabric_core::topology::Topology;
use fabric_core::trace::{load_logical, namespace_logical, TraceFormatError};

use adapters::{BulkTransferTool, EmulatorDriver, EmulatorError};
use cli::{Args, ExitCode};
use replay::{HostBinding, ReplayOptions, Replayer, RunSummary};

#[derive(Debug, thiserror::Error)]
pub enum ReplayRunError {
    #[error("every trace file failed to load")]
    AllTracesFailed,
    #[error("emulator startup failed: {0}")]
    EmulatorStartup(String),
    #[error("controller unreachable: {0}")]
    ControllerUnreachable(String),
}

impl ReplayRunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ReplayRunError::AllTracesFailed => ExitCode::TraceLoadError,
            ReplayRunError::EmulatorStartup(_) => ExitCode::EmulatorStartupFailure,
            ReplayRunError::ControllerUnreachable(_) => ExitCode::ControllerUnreachable,
        }
    }
}

/// Builds a deterministic physical host pool from a topology, each paired with its controller
/// wire identity (ToR, host-facing port, MAC). Each host's name, address, and binding are derived
/// purely from its position in `hosts_in_dpid_order`, so two runs against the same topology
/// produce the same pool.
fn host_entries(topology: &Topology) -> Vec<(PhysicalHost, HostBinding)> {
    topology
        .hosts_in_dpid_order()
        .into_iter()
        .enumerate()
        .map(|(i, host_id)| {
            let (tor_dpid, tor_port) = topology
                .links()
                .find_map(|link| {
                    if link.a == host_id {
                        topology.node(link.b).and_then(|n| n.dpid()).map(|d| (d, link.b_port))
                    } else if link.b == host_id {
                        topology.node(link.a).and_then(|n| n.dpid()).map(|d| (d, link.a_port))
                    } else {
                        None
                    }
                })
                .expect("every host in hosts_in_dpid_order has exactly one link, to its ToR");
            let octet3 = (i / 254) as u8;
            let octet4 = (i % 254) as u8 + 1;
            let ipv4 = Ipv4Addr::new(10, 0, octet3, octet4);
            let host = PhysicalHost::new(format!("h{}", host_id.inner()), ipv4, format!("tor-{tor_dpid}"));
            let binding = HostBinding { tor: tor_dpid, port: tor_port, mac: host_mac(ipv4) };
            (host, binding)
        })
        .collect()
}

/// Derives a deterministic, locally-administered MAC for a host from its IPv4 address. The real
/// deployment lets Mininet/OVS assign MACs at boot, so there is no ground-truth MAC to carry on
/// [`PhysicalHost`] itself; this stand-in only needs to be injective over the pool and stable
/// across a run, which embedding the IPv4 octets after the locally-administered prefix guarantees.
fn host_mac(ipv4: Ipv4Addr) -> MacAddr {
    let [a, b, c, d] = ipv4.octets();
    MacAddr([0x02, 0x00, a, b, c, d])
}

/// Builds a deterministic physical host pool from a topology, ordered by `hosts_in_dpid_order`.
pub fn host_pool(topology: &Topology) -> Vec<PhysicalHost> {
    host_entries(topology).into_iter().map(|(host, _)| host).collect()
}

/// Builds the routing controller for `topology`: every switch and link is learned, then every
/// host in `entries` is learned on its ToR's host-facing port, so the replay hot loop can dispatch
/// real `PacketIn`s against a fully-formed topology instead of discovering it on the fly.
fn build_controller(topology: &Topology, entries: &[(PhysicalHost, HostBinding)]) -> Result<Controller, ReplayRunError> {
    let mut controller = Controller::new();
    for node in topology.nodes() {
        if let Some(dpid) = node.dpid() {
            controller.on_switch_enter(dpid).map_err(map_controller_setup_error)?;
        }
    }
    for link in topology.links() {
        let (a_dpid, b_dpid) = (
            topology.node(link.a).and_then(|n| n.dpid()),
            topology.node(link.b).and_then(|n| n.dpid()),
        );
        if let (Some(a_dpid), Some(b_dpid)) = (a_dpid, b_dpid) {
            controller.on_link_add(a_dpid, link.a_port, b_dpid);
            controller.on_link_add(b_dpid, link.b_port, a_dpid);
        }
    }
    for (_, binding) in entries {
        controller
            .learn_host(binding.tor, binding.port, binding.mac)
            .map_err(map_controller_setup_error)?;
    }
    Ok(controller)
}

fn map_controller_setup_error(e: ControllerError) -> ReplayRunError {
    ReplayRunError::ControllerUnreachable(e.to_string())
}

/// Loads, namespaces, and synthesizes every trace file, skipping ones that fail to parse per the
/// §7 policy (skip-and-continue, abort only if every file fails). Returns the merged, time-sorted
/// flow event stream.
pub fn load_and_synthesize(
    paths: &[std::path::PathBuf],
    rng: &mut impl rand::Rng,
) -> Result<Vec<fabric_core::synth::FlowEvent>, ReplayRunError> {
    let mut all_events = Vec::new();
    let mut any_succeeded = false;

    for (trace_idx, path) in paths.iter().enumerate() {
        let loaded: Result<Vec<fabric_core::synth::FlowEvent>, TraceFormatError> = (|| {
            let entries = load_logical(path)?;
            let namespaced = namespace_logical(trace_idx, &entries)?;
            let (_process_map, events) = synthesize(&namespaced, rng).map_err(|e| {
                TraceFormatError::Json(path.clone(), format!("synthesis failed: {e}"))
            })?;
            Ok(events)
        })();

        match loaded {
            Ok(events) => {
                log::debug!("loaded {} flow events from {}", events.len(), path.display());
                any_succeeded = true;
                all_events.extend(events);
            }
            Err(e) => {
                log::warn!("skipping trace file {}: {e}", path.display());
                continue;
            }
        }
    }

    if !any_succeeded && !paths.is_empty() {
        return Err(ReplayRunError::AllTracesFailed);
    }

    all_events.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
    Ok(all_events)
}

/// Runs one full replay from parsed CLI args against the given topology, emulator driver, and
/// bulk-transfer tool. Builds the routing controller from `topology` up front, so every launched
/// flow is dispatched through real VLB/ECMP path computation and (when `--priority-queues` is set)
/// DSCP-qualified rule installation, rather than the fabric being driven as a flat pipe.
pub fn run(
    args: &Args,
    topology: &Topology,
    emulator: &mut dyn EmulatorDriver,
    tool: &dyn BulkTransferTool,
) -> Result<RunSummary, ReplayRunError> {
    let mut rng = rand::rngs::StdRng::from_entropy();

    let events = load_and_synthesize(&args.traces, &mut rng)?;

    let entries = host_entries(topology);
    let usable = pool_size(args.percentage.clamp(0.0, 1.0), entries.len());
    let entries = &entries[..usable.min(entries.len())];
    let pool: Vec<PhysicalHost> = entries.iter().map(|(host, _)| host.clone()).collect();
    let bindings: FxHashMap<String, HostBinding> =
        entries.iter().map(|(host, binding)| (host.name.clone(), *binding)).collect();

    let sub_node_ids: Vec<String> = {
        let mut ids: Vec<String> = events.iter().map(|e| e.sender.clone()).collect();
        ids.extend(events.iter().flat_map(|e| e.receiver.iter().cloned()));
        ids.sort();
        ids.dedup();
        ids
    };
    let placement = place_strided(&sub_node_ids, &pool);
    log::info!("placed {} sub-nodes across {} physical hosts", placement.len(), pool.len());

    let mut controller = build_controller(topology, entries)?;

    let opts = ReplayOptions {
        time_scale: args.time_scale,
        num_server_ports: args.num_server_ports,
        max_events: args.max_events,
        cc: args.cc,
        priority_queues: args.priority_queues,
        ..ReplayOptions::default()
    };

    let mut replayer = Replayer::new(emulator, tool, &placement, &mut controller, &bindings, &mut rng, opts);
    replayer.start_hosts().map_err(map_emulator_error)?;
    let (summary, _progress) = replayer
        .replay(&events)
        .map_err(|e| ReplayRunError::EmulatorStartup(e.to_string()))?;
    Ok(summary)
}

fn map_emulator_error(e: EmulatorError) -> ReplayRunError {
    match e {
        EmulatorError::StartupFailed(msg) => ReplayRunError::EmulatorStartup(msg),
        EmulatorError::ControllerUnreachable(msg) => ReplayRunError::ControllerUnreachable(msg),
    }
}
