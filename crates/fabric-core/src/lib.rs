#![warn(unreachable_pub, missing_debug_implementations)]

//! Core types and algorithms for a workload-driven network emulation harness: a VL2-style fabric
//! model, a trace synthesizer that expands logical agent messages into wire-level sub-flows,
//! a process placer, a VLB+ECMP routing controller, and a per-flow metrics analyzer.

#[macro_use]
mod ident;

pub mod constants;
pub mod controller;
pub mod metrics;
pub mod placement;
pub mod synth;
pub mod topology;
pub mod trace;
pub mod units;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{Controller, ControllerError, NoPathError};
pub use metrics::{build_report, FlowResult, Report};
pub use placement::{place_consecutive, place_strided, PlacementError, PlacementMap};
pub use synth::{synthesize, ParallelismStrategy, SynthesisError};
pub use topology::{build_clos, build_vl2, ClosParams, Dpid, Topology, TopologyError, Vl2Params};
pub use trace::{load_and_merge, load_logical, TraceFormatError};
