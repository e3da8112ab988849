//! Command-line surface for the replayer, matching the flag set and exit-code contract the
//! harness is driven by in practice.

use std::path::PathBuf;

use clap::Parser;

use crate::adapters::CongestionControl;

#[derive(Parser, Debug)]
#[command(name = "fabric-replay", about = "Replay synthesized LLM-agent traffic against an emulated fabric")]
pub struct Args {
    /// Logical trace files to load, namespace, and synthesize.
    #[arg(long, required = true, num_args = 1..)]
    pub traces: Vec<PathBuf>,

    /// Fraction of the topology's hosts to draw the physical pool from, in `(0, 1]`.
    #[arg(long, default_value_t = 1.0)]
    pub percentage: f64,

    /// Processes packed per host under consecutive placement; ignored by strided placement.
    #[arg(long, default_value_t = 1)]
    pub procs_per_host: usize,

    /// Bulk-transfer listener ports per destination host.
    #[arg(long, default_value_t = fabric_core::constants::N_PORTS_DEFAULT)]
    pub num_server_ports: u16,

    /// Wall-clock seconds per simulated second; 0 disables pacing (launch everything immediately).
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,

    /// Stop after this many trace events (for smoke runs); unlimited if omitted.
    #[arg(long)]
    pub max_events: Option<usize>,

    /// TCP congestion-control algorithm applied to every host before replay starts.
    #[arg(long, value_enum, default_value_t = CongestionControl::Cubic)]
    pub cc: CongestionControl,

    /// Install DSCP-derived priority queues on the controller instead of a single best-effort queue.
    #[arg(long, default_value_t = false)]
    pub priority_queues: bool,

    /// Bulk-transfer binary to shell out to for each flow (e.g. `python3`). Omit to use the
    /// in-process fake tool instead of spawning anything.
    #[arg(long)]
    pub bulk_transfer_binary: Option<PathBuf>,

    /// Extra arguments placed before `--mode/--target/--port/--bytes` in the bulk-transfer
    /// invocation (e.g. `traffic_tool.py`).
    #[arg(long, num_args = 0..)]
    pub bulk_transfer_args: Vec<String>,
}

/// Exit codes per the CLI contract: 0 success (any number of successful flows, including zero),
/// 2 trace-load error, 3 emulator startup failure, 4 controller unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    TraceLoadError = 2,
    EmulatorStartupFailure = 3,
    ControllerUnreachable = 4,
}
