//! Topology models for the fabrics under emulation: a VL2-style fat tree (the harness's primary
//! subject) and a plain Clos network used for sanity-checking routing logic against a simpler
//! structure.
//!
//! A [`Topology`] is a directed graph over [`Node`]s connected by [`Link`]s. Every switch node
//! carries a [`Dpid`] whose numeric range identifies its role in the fabric — this is a contract
//! enforced here, not a property of the routing controller, since the controller only ever
//! classifies a DPID it is handed.

use itertools::Itertools;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::constants::{
    DPID_AGGREGATE_BASE, DPID_INTERMEDIATE_BASE, DPID_TOR_BASE, HOSTS_PER_TOR, TOR_HOST_PORT_MAX,
};

identifier!(NodeId, usize);

/// A switch datapath ID. Its numeric range identifies the switch's role (see
/// [`classify_dpid`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Dpid(pub u32);

impl std::fmt::Display for Dpid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a switch plays in a VL2 fabric, determined entirely by its [`Dpid`] range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchRole {
    /// DPIDs in `1000..2000`.
    Intermediate,
    /// DPIDs in `2000..3000`.
    Aggregate,
    /// DPIDs in `3000..4000`.
    Tor,
}

/// Classifies a DPID by range. This is a topology contract, not an OpenFlow property: the
/// controller never infers a role any other way.
pub fn classify_dpid(dpid: Dpid) -> Option<SwitchRole> {
    match dpid.0 {
        d if (DPID_INTERMEDIATE_BASE..DPID_AGGREGATE_BASE).contains(&d) => {
            Some(SwitchRole::Intermediate)
        }
        d if (DPID_AGGREGATE_BASE..DPID_TOR_BASE).contains(&d) => Some(SwitchRole::Aggregate),
        d if (DPID_TOR_BASE..DPID_TOR_BASE + 1000).contains(&d) => Some(SwitchRole::Tor),
        _ => None,
    }
}

/// A node in the topology: either a host or a switch playing one of the three VL2 roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Switch(Dpid),
}

impl Node {
    pub fn new_host(id: NodeId) -> Self {
        Self {
            id,
            kind: NodeKind::Host,
        }
    }

    pub fn new_switch(id: NodeId, dpid: Dpid) -> Self {
        Self {
            id,
            kind: NodeKind::Switch(dpid),
        }
    }

    pub fn dpid(&self) -> Option<Dpid> {
        match self.kind {
            NodeKind::Switch(dpid) => Some(dpid),
            NodeKind::Host => None,
        }
    }

    pub fn role(&self) -> Option<SwitchRole> {
        self.dpid().and_then(classify_dpid)
    }
}

/// A bidirectional link between two nodes, each endpoint tagged with the local port number used
/// to reach the other side. For a ToR, port numbers `1..=20` are host-facing; everything above is
/// an uplink — this correlation is an invariant of the topology, not a property of OpenFlow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub a: NodeId,
    pub a_port: u16,
    pub b: NodeId,
    pub b_port: u16,
}

impl Link {
    pub fn new(a: NodeId, a_port: u16, b: NodeId, b_port: u16) -> Self {
        Self { a, a_port, b, b_port }
    }
}

/// A network topology: switches, hosts, and the links between them.
#[derive(Debug, Clone)]
pub struct Topology {
    pub(crate) graph: DiGraph<Node, u16>,
    pub(crate) id2idx: FxHashMap<NodeId, NodeIndex>,
    pub(crate) links: Vec<Link>,
}

impl Topology {
    /// Builds a topology from nodes and links, enforcing:
    ///
    /// - Every node has a unique, contiguous-from-zero ID.
    /// - Every link has distinct, declared endpoints.
    /// - At most one link between any pair of nodes.
    /// - Every host has exactly one link.
    /// - Every ToR's host-facing ports fall in `1..=20`; its uplink ports do not.
    pub fn new(nodes: &[Node], links: &[Link]) -> Result<Self, TopologyError> {
        let mut g = DiGraph::new();
        let mut id2idx = FxHashMap::default();
        for (i, n) in nodes.iter().copied().sorted_by_key(|n| n.id).enumerate() {
            let id = n.id;
            let idx = g.add_node(n);
            if id2idx.insert(id, idx).is_some() {
                return Err(TopologyError::DuplicateNodeId(id));
            }
            if id.inner() != i {
                return Err(TopologyError::HoleBeforeId(id));
            }
        }
        let idx_of = |id| *id2idx.get(&id).unwrap();
        let mut referenced = FxHashSet::default();
        for &Link { a, a_port, b, b_port } in links {
            if a == b {
                return Err(TopologyError::NodeAdjacentSelf(a));
            }
            if !id2idx.contains_key(&a) {
                return Err(TopologyError::UndeclaredNode(a));
            }
            if !id2idx.contains_key(&b) {
                return Err(TopologyError::UndeclaredNode(b));
            }
            referenced.insert(a);
            referenced.insert(b);
            g.add_edge(idx_of(a), idx_of(b), a_port);
            g.add_edge(idx_of(b), idx_of(a), b_port);

            // CORRECTNESS: a ToR's host-facing ports are 1..=20; its uplinks are not.
            check_tor_port_contract(&g[idx_of(a)], a_port, &g[idx_of(b)])?;
            check_tor_port_contract(&g[idx_of(b)], b_port, &g[idx_of(a)])?;
        }
        for &id in id2idx.keys() {
            if !referenced.contains(&id) {
                return Err(TopologyError::IsolatedNode(id));
            }
        }
        for eidx in g.edge_indices() {
            let (a, b) = g.edge_endpoints(eidx).unwrap();
            if g.edges_connecting(a, b).count() > 1 {
                return Err(TopologyError::DuplicateLink {
                    n1: g[a].id,
                    n2: g[b].id,
                });
            }
            let Node { id, kind, .. } = g[a];
            if matches!(kind, NodeKind::Host) && g.edges(a).count() > 1 {
                return Err(TopologyError::TooManyHostLinks {
                    id,
                    n: g.edges(a).count(),
                });
            }
        }
        Ok(Self {
            graph: g,
            id2idx,
            links: links.to_vec(),
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.id2idx.get(&id).map(|&idx| &self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Hosts, ordered canonically by `(attached ToR DPID, host-facing port)` rather than by
    /// insertion/`NodeId` order — the only order that's stable across topology builders.
    pub fn hosts_in_dpid_order(&self) -> Vec<NodeId> {
        let mut entries = Vec::new();
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            if !matches!(node.kind, NodeKind::Host) {
                continue;
            }
            for edge in self.graph.edges(idx) {
                let neighbor = &self.graph[edge.target()];
                if let Some(dpid) = neighbor.dpid() {
                    entries.push((dpid, *edge.weight(), node.id));
                }
            }
        }
        entries.sort();
        entries.into_iter().map(|(_, _, id)| id).collect()
    }

    pub(crate) fn idx_of(&self, id: &NodeId) -> Option<&NodeIndex> {
        self.id2idx.get(id)
    }
}

fn check_tor_port_contract(at: &Node, port: u16, other: &Node) -> Result<(), TopologyError> {
    let NodeKind::Switch(dpid) = at.kind else {
        return Ok(());
    };
    if classify_dpid(dpid) != Some(SwitchRole::Tor) {
        return Ok(());
    }
    let is_host_facing = (1..=TOR_HOST_PORT_MAX).contains(&port);
    let neighbor_is_host = matches!(other.kind, NodeKind::Host);
    if is_host_facing != neighbor_is_host {
        return Err(TopologyError::HostPortOutOfRange { port });
    }
    Ok(())
}

/// An error describing why a topology specification is invalid.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("duplicate node ID {0}")]
    DuplicateNodeId(NodeId),

    #[error("node IDs not contiguous; hole before {0}")]
    HoleBeforeId(NodeId),

    #[error("node {0} is connected to itself")]
    NodeAdjacentSelf(NodeId),

    #[error("node {0} is not declared")]
    UndeclaredNode(NodeId),

    #[error("duplicate links between {n1} and {n2}")]
    DuplicateLink { n1: NodeId, n2: NodeId },

    #[error("host {id} has too many links (expected 1, got {n})")]
    TooManyHostLinks { id: NodeId, n: usize },

    #[error("node {0} is not connected to any other node")]
    IsolatedNode(NodeId),

    #[error("ToR port {port} used for a host link is out of the host-facing range 1..=20")]
    HostPortOutOfRange { port: u16 },
}

/// Parameters for a VL2 fabric: `d_a` is the aggregate switch port count, `d_i` the intermediate
/// switch port count.
#[derive(Debug, Clone, Copy)]
pub struct Vl2Params {
    pub d_a: u32,
    pub d_i: u32,
}

impl Vl2Params {
    pub fn num_intermediate(&self) -> u32 {
        self.d_a / 2
    }

    pub fn num_aggregate(&self) -> u32 {
        self.d_i
    }

    pub fn num_tor(&self) -> u32 {
        self.d_a * self.d_i / 4
    }

    pub fn num_hosts(&self) -> u32 {
        HOSTS_PER_TOR * self.num_tor()
    }
}

/// Builds a VL2 fabric from [`Vl2Params`], returning the node and link lists ready to hand to
/// [`Topology::new`].
pub fn build_vl2(params: Vl2Params) -> (Vec<Node>, Vec<Link>) {
    let num_inter = params.num_intermediate();
    let num_aggr = params.num_aggregate();
    let num_tor = params.num_tor();
    let num_hosts = params.num_hosts();

    let mut nodes = Vec::new();
    let mut next_id = 0usize;
    let mut new_id = || {
        let id = NodeId::new(next_id);
        next_id += 1;
        id
    };

    let host_ids = (0..num_hosts).map(|_| new_id()).collect::<Vec<_>>();
    let tor_ids = (0..num_tor)
        .map(|t| {
            let id = new_id();
            nodes.push(Node::new_switch(id, Dpid(DPID_TOR_BASE + t)));
            id
        })
        .collect::<Vec<_>>();
    let aggr_ids = (0..num_aggr)
        .map(|a| {
            let id = new_id();
            nodes.push(Node::new_switch(id, Dpid(DPID_AGGREGATE_BASE + a)));
            id
        })
        .collect::<Vec<_>>();
    let inter_ids = (0..num_inter)
        .map(|i| {
            let id = new_id();
            nodes.push(Node::new_switch(id, Dpid(DPID_INTERMEDIATE_BASE + i)));
            id
        })
        .collect::<Vec<_>>();
    for &id in &host_ids {
        nodes.push(Node::new_host(id));
    }
    nodes.sort_by_key(|n| n.id);

    let mut links = Vec::new();

    // Each ToR connects to 20 hosts on ports 1..=20.
    for (t, &tor) in tor_ids.iter().enumerate() {
        for h in 0..HOSTS_PER_TOR {
            let host = host_ids[t * HOSTS_PER_TOR as usize + h as usize];
            links.push(Link::new(tor, (h + 1) as u16, host, 1));
        }
    }

    // Each ToR uplinks to two distinct aggregates, chosen so load spreads evenly across
    // aggregates. Uplink ports start above the host-facing range.
    for (t, &tor) in tor_ids.iter().enumerate() {
        let a0 = (2 * t) % num_aggr as usize;
        let a1 = (2 * t + 1) % num_aggr as usize;
        links.push(Link::new(
            tor,
            HOSTS_PER_TOR as u16 + 1,
            aggr_ids[a0],
            (t as u16) + 1,
        ));
        if a1 != a0 {
            links.push(Link::new(
                tor,
                HOSTS_PER_TOR as u16 + 2,
                aggr_ids[a1],
                (t as u16) + 1 + num_tor as u16,
            ));
        }
    }

    // Each aggregate connects to d_a/2 intermediates, spread round-robin.
    let uplinks_per_aggr = (params.d_a / 2).max(1) as usize;
    for (a, &aggr) in aggr_ids.iter().enumerate() {
        for j in 0..uplinks_per_aggr {
            let inter = inter_ids[(a * uplinks_per_aggr + j) % inter_ids.len().max(1)];
            links.push(Link::new(
                aggr,
                (num_tor as u16) + (j as u16) + 1,
                inter,
                (a as u16) + 1,
            ));
        }
    }

    (nodes, links)
}

/// Parameters for a plain Clos fabric, used for sanity-checking routing against a simpler
/// structure than VL2.
#[derive(Debug, Clone, Copy)]
pub struct ClosParams {
    pub spines: u32,
    pub leaves: u32,
    pub hosts_per_leaf: u32,
}

/// Builds a Clos fabric: every leaf connects to every spine, and each leaf has
/// `hosts_per_leaf` directly-attached hosts.
pub fn build_clos(params: ClosParams) -> (Vec<Node>, Vec<Link>) {
    let mut nodes = Vec::new();
    let mut next_id = 0usize;
    let mut new_id = || {
        let id = NodeId::new(next_id);
        next_id += 1;
        id
    };

    let num_hosts = params.leaves * params.hosts_per_leaf;
    let host_ids = (0..num_hosts).map(|_| new_id()).collect::<Vec<_>>();
    let leaf_ids = (0..params.leaves)
        .map(|l| {
            let id = new_id();
            nodes.push(Node::new_switch(id, Dpid(DPID_TOR_BASE + l)));
            id
        })
        .collect::<Vec<_>>();
    let spine_ids = (0..params.spines)
        .map(|s| {
            let id = new_id();
            nodes.push(Node::new_switch(id, Dpid(DPID_AGGREGATE_BASE + s)));
            id
        })
        .collect::<Vec<_>>();
    for &id in &host_ids {
        nodes.push(Node::new_host(id));
    }
    nodes.sort_by_key(|n| n.id);

    let mut links = Vec::new();
    for (l, &leaf) in leaf_ids.iter().enumerate() {
        for h in 0..params.hosts_per_leaf {
            let host = host_ids[l * params.hosts_per_leaf as usize + h as usize];
            links.push(Link::new(leaf, (h + 1) as u16, host, 1));
        }
        for (s, &spine) in spine_ids.iter().enumerate() {
            links.push(Link::new(
                leaf,
                params.hosts_per_leaf as u16 + s as u16 + 1,
                spine,
                l as u16 + 1,
            ));
        }
    }
    (nodes, links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_dpid_ranges() {
        assert_eq!(classify_dpid(Dpid(1500)), Some(SwitchRole::Intermediate));
        assert_eq!(classify_dpid(Dpid(2500)), Some(SwitchRole::Aggregate));
        assert_eq!(classify_dpid(Dpid(3500)), Some(SwitchRole::Tor));
        assert_eq!(classify_dpid(Dpid(500)), None);
    }

    #[test]
    fn vl2_sizes_match_formulas() {
        let params = Vl2Params { d_a: 4, d_i: 4 };
        assert_eq!(params.num_intermediate(), 2);
        assert_eq!(params.num_aggregate(), 4);
        assert_eq!(params.num_tor(), 4);
        assert_eq!(params.num_hosts(), 80);
    }

    #[test]
    fn vl2_topology_is_valid() {
        let params = Vl2Params { d_a: 4, d_i: 4 };
        let (nodes, links) = build_vl2(params);
        let topo = Topology::new(&nodes, &links).expect("valid VL2 topology");
        assert_eq!(topo.nodes().filter(|n| n.kind == NodeKind::Host).count(), 80);
    }

    #[test]
    fn duplicate_node_fails() {
        let n1 = Node::new_host(NodeId::new(0));
        let n2 = Node::new_host(NodeId::new(0));
        let n3 = Node::new_switch(NodeId::new(2), Dpid(3000));
        let l1 = Link::new(n1.id, 1, n3.id, 1);
        let l2 = Link::new(n2.id, 1, n3.id, 2);
        let res = Topology::new(&[n1, n2, n3], &[l1, l2]);
        assert!(matches!(res, Err(TopologyError::DuplicateNodeId(..))));
    }

    #[test]
    fn non_contiguous_ids_fail() {
        let n1 = Node::new_host(NodeId::new(0));
        let n2 = Node::new_host(NodeId::new(1));
        let n3 = Node::new_switch(NodeId::new(3), Dpid(3000));
        let l1 = Link::new(n1.id, 1, n3.id, 1);
        let l2 = Link::new(n2.id, 1, n3.id, 2);
        let res = Topology::new(&[n1, n2, n3], &[l1, l2]);
        assert!(matches!(res, Err(TopologyError::HoleBeforeId(..))));
    }

    #[test]
    fn hosts_in_dpid_order_is_stable_under_reversed_insertion() {
        let params = Vl2Params { d_a: 4, d_i: 4 };
        let (mut nodes, links) = build_vl2(params);
        let topo1 = Topology::new(&nodes, &links).unwrap();
        nodes.reverse();
        let topo2 = Topology::new(&nodes, &links).unwrap();
        assert_eq!(topo1.hosts_in_dpid_order(), topo2.hosts_in_dpid_order());
    }
}
