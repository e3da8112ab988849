//! Simulation constants shared across the trace synthesizer, placer, and routing controller.

use crate::units::Bytes;

/// Per-message framing overhead added by the wire-level trace synthesizer, in bytes.
///
/// Chosen to match the upstream LLM-agent simulators' default message framing.
pub const MSG_BYTES: u64 = 119_435;

/// Seconds of decode time charged per emitted output token.
pub const SEC_PER_TOKEN: f64 = 0.004;

/// Number of sub-nodes under every parallelism strategy.
pub const NODES_PER_AGENT: usize = 8;

/// Number of pairs in the hybrid parallelism partitioning (`NODES_PER_AGENT / 2`).
pub const HYBRID_PAIRS: usize = NODES_PER_AGENT / 2;

/// Maximum GPUs a single physical host can host, used by the offline capacity check.
pub const MAX_GPU_PER_HOST: u32 = 10;

/// Hosts per ToR in the VL2 topology builder.
pub const HOSTS_PER_TOR: u32 = 20;

/// Default number of bulk-transfer listener ports per physical host.
pub const N_PORTS_DEFAULT: u16 = 32;

/// DPID range start for intermediate switches.
pub const DPID_INTERMEDIATE_BASE: u32 = 1000;

/// DPID range start for aggregate switches.
pub const DPID_AGGREGATE_BASE: u32 = 2000;

/// DPID range start for ToR switches.
pub const DPID_TOR_BASE: u32 = 3000;

/// Highest ToR port number that is host-facing; everything above is an uplink.
pub const TOR_HOST_PORT_MAX: u16 = 20;

/// The size, in bytes, below which a flow is forced up to avoid degenerate stress-test flows.
pub const MIN_FLOW_SIZE: Bytes = Bytes::new(1024);
