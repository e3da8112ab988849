//! Utilities for writing tests.

use crate::topology::{build_vl2, Topology, Vl2Params};

/// A small VL2 fabric: `D_A = 4`, `D_I = 4` (2 intermediates, 4 aggregates, 4 ToRs, 80 hosts).
pub fn small_vl2_topology() -> Topology {
    let (nodes, links) = build_vl2(Vl2Params { d_a: 4, d_i: 4 });
    Topology::new(&nodes, &links).expect("small_vl2_topology is internally consistent")
}

/// The smallest VL2 fabric with exactly one ToR per aggregate pair: `D_A = 2`, `D_I = 2`.
pub fn minimal_vl2_topology() -> Topology {
    let (nodes, links) = build_vl2(Vl2Params { d_a: 2, d_i: 2 });
    Topology::new(&nodes, &links).expect("minimal_vl2_topology is internally consistent")
}
