//! Topology-learning, VLB+ECMP routing, and flow rule installation for the fabric's control plane
//! (C6).
//!
//! The controller's graph is the fabric's only long-lived mutable state, and it is mutated only
//! from [`Controller`]'s own methods — the single-writer discipline the event loop enforces by
//! construction. Path computation ([`Controller::ecmp_path`], [`Controller::vl2_path`]) is a pure
//! query over an immutable snapshot of that graph.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::topology::{classify_dpid, Dpid, SwitchRole};

/// A switch's MAC-learning table key, or a switch itself — the unit of the controller's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNode {
    Switch(Dpid),
    Host(MacAddr),
}

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

/// An installed OpenFlow-style rule: `(switch, match, priority, actions)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub switch: Dpid,
    pub matched: Match,
    pub priority: u16,
    pub actions: Vec<Action>,
}

/// The match portion of a [`FlowRule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    EthDst { eth_dst: MacAddr },
    EthDstDscp { eth_dst: MacAddr, dscp: u8 },
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SetQueue(Queue),
    Output(u16),
    ToController,
}

/// Priority queue selected by DSCP. `Q1` is the high-priority queue (`htb` priority 1); `Q0` is
/// the default, lower-priority queue (`htb` priority 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Q0,
    Q1,
}

impl Queue {
    pub fn for_dscp(dscp: u8) -> Self {
        if dscp == 8 {
            Queue::Q1
        } else {
            Queue::Q0
        }
    }
}

const TABLE_MISS_PRIORITY: u16 = 0;
const DEFAULT_PRIORITY: u16 = 10;
const DSCP_PRIORITY: u16 = 20;
const LLDP_ETHERTYPE: u16 = 0x88cc;

/// The controller's directed topology graph and the per-switch role index built from DPID ranges.
pub struct Controller {
    graph: DiGraph<GraphNode, u16>,
    index: FxHashMap<GraphNode, NodeIndex>,
    roles: FxHashMap<SwitchRole, Vec<Dpid>>,
    installed: Vec<FlowRule>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: FxHashMap::default(),
            roles: FxHashMap::default(),
            installed: Vec::new(),
        }
    }

    pub fn installed_rules(&self) -> &[FlowRule] {
        &self.installed
    }

    /// Handles a `SwitchEnter` event: classifies the DPID, registers it in its role set, and
    /// installs the table-miss rule.
    pub fn on_switch_enter(&mut self, dpid: Dpid) -> Result<(), ControllerError> {
        let role = classify_dpid(dpid).ok_or(ControllerError::UnclassifiableDpid { dpid })?;
        self.get_or_insert(GraphNode::Switch(dpid));
        self.roles.entry(role).or_default().push(dpid);
        self.installed.push(FlowRule {
            switch: dpid,
            matched: Match::Any,
            priority: TABLE_MISS_PRIORITY,
            actions: vec![Action::ToController],
        });
        Ok(())
    }

    /// Handles a `SwitchLeave` event: drops the node and its edges. Missing nodes are not an
    /// error — reconnect races are expected.
    pub fn on_switch_leave(&mut self, dpid: Dpid) {
        if let Some(idx) = self.index.remove(&GraphNode::Switch(dpid)) {
            self.graph.remove_node(idx);
        }
        for dpids in self.roles.values_mut() {
            dpids.retain(|&d| d != dpid);
        }
    }

    /// Handles a `LinkAdd` event: adds a directed edge carrying `out_port`.
    pub fn on_link_add(&mut self, src: Dpid, out_port: u16, dst: Dpid) {
        let a = self.get_or_insert(GraphNode::Switch(src));
        let b = self.get_or_insert(GraphNode::Switch(dst));
        self.graph.update_edge(a, b, out_port);
    }

    /// Handles a `LinkDelete` event.
    pub fn on_link_delete(&mut self, src: Dpid, dst: Dpid) {
        if let (Some(&a), Some(&b)) = (
            self.index.get(&GraphNode::Switch(src)),
            self.index.get(&GraphNode::Switch(dst)),
        ) {
            if let Some(e) = self.graph.find_edge(a, b) {
                self.graph.remove_edge(e);
            }
        }
    }

    fn get_or_insert(&mut self, node: GraphNode) -> NodeIndex {
        if let Some(&idx) = self.index.get(&node) {
            idx
        } else {
            let idx = self.graph.add_node(node);
            self.index.insert(node, idx);
            idx
        }
    }

    /// Learns a host's MAC on a ToR's host-facing port, per the port-range contract enforced by
    /// [`crate::topology`]. Idempotent relearning on a new port rewrites the edge.
    pub fn learn_host(&mut self, tor: Dpid, port: u16, mac: MacAddr) -> Result<(), ControllerError> {
        if classify_dpid(tor) != Some(SwitchRole::Tor) {
            return Err(ControllerError::NotATor { dpid: tor });
        }
        if !(1..=crate::constants::TOR_HOST_PORT_MAX).contains(&port) {
            return Err(ControllerError::HostPortOutOfRange { port });
        }
        let tor_idx = self.get_or_insert(GraphNode::Switch(tor));
        let host_idx = self.get_or_insert(GraphNode::Host(mac));
        self.graph.update_edge(tor_idx, host_idx, port);
        self.graph.update_edge(host_idx, tor_idx, port);
        Ok(())
    }

    /// Enumerates all shortest (hop-count) paths from `src` to `dst` and returns one uniformly at
    /// random.
    pub fn ecmp_path(&self, src: GraphNode, dst: GraphNode, rng: &mut impl Rng) -> Result<Vec<GraphNode>, NoPathError> {
        let (&s, &d) = (
            self.index.get(&src).ok_or(NoPathError { src, dst })?,
            self.index.get(&dst).ok_or(NoPathError { src, dst })?,
        );
        let paths = self.shortest_paths(s, d);
        if paths.is_empty() {
            return Err(NoPathError { src, dst });
        }
        let chosen = &paths[rng.gen_range(0..paths.len())];
        Ok(chosen.iter().map(|&idx| self.graph[idx]).collect())
    }

    /// VLB: picks a uniformly random intermediate switch, composes `ecmp_path(src, I)` with
    /// `ecmp_path(I, dst)` (dropping the duplicate `I`). Falls back to a plain `ecmp_path` if there
    /// are no intermediates, or either leg fails.
    pub fn vl2_path(&self, src: GraphNode, dst: GraphNode, rng: &mut impl Rng) -> Result<Vec<GraphNode>, NoPathError> {
        let intermediates = self.roles.get(&SwitchRole::Intermediate).cloned().unwrap_or_default();
        if intermediates.is_empty() {
            return self.ecmp_path(src, dst, rng);
        }
        let chosen = intermediates[rng.gen_range(0..intermediates.len())];
        let mid = GraphNode::Switch(chosen);
        match (self.ecmp_path(src, mid, rng), self.ecmp_path(mid, dst, rng)) {
            (Ok(mut first), Ok(second)) => {
                first.pop();
                first.extend(second);
                Ok(first)
            }
            _ => self.ecmp_path(src, dst, rng),
        }
    }

    fn shortest_paths(&self, src: NodeIndex, dst: NodeIndex) -> Vec<Vec<NodeIndex>> {
        use std::collections::VecDeque;

        if src == dst {
            return vec![vec![src]];
        }

        let mut dist: FxHashMap<NodeIndex, usize> = FxHashMap::default();
        dist.insert(src, 0);
        let mut queue = VecDeque::from([src]);
        while let Some(u) = queue.pop_front() {
            let du = dist[&u];
            for edge in self.graph.edges(u) {
                let v = edge.target();
                if !dist.contains_key(&v) {
                    dist.insert(v, du + 1);
                    queue.push_back(v);
                }
            }
        }
        let Some(&target_dist) = dist.get(&dst) else {
            return Vec::new();
        };

        // Re-walk from src, collecting every path whose length matches target_dist via DFS
        // restricted to nodes on a shortest path (distance strictly increasing towards dst).
        let mut paths = Vec::new();
        let mut stack = vec![vec![src]];
        while let Some(path) = stack.pop() {
            let last = *path.last().unwrap();
            if last == dst {
                if path.len() - 1 == target_dist {
                    paths.push(path);
                }
                continue;
            }
            if path.len() - 1 >= target_dist {
                continue;
            }
            for edge in self.graph.edges(last) {
                let v = edge.target();
                if dist.get(&v) == Some(&(path.len())) {
                    let mut next = path.clone();
                    next.push(v);
                    stack.push(next);
                }
            }
        }
        paths
    }

    /// Installs a [`FlowRule`] for each hop `(u, v)` along `path`, matching `dst_mac` (optionally
    /// DSCP-qualified) with actions `[set_queue(q), output(port_to_v)]`. If `originating` names the
    /// switch that raised the triggering `PacketIn`, also emits the matching `PacketOut` so the
    /// in-flight frame isn't lost. Per the ordering guarantee, downstream rules are installed
    /// before the `PacketOut` for the originating switch.
    pub fn install_path(
        &mut self,
        path: &[GraphNode],
        dst_mac: MacAddr,
        dscp: Option<u8>,
        originating: Option<Dpid>,
    ) -> Option<PacketOut> {
        let priority = if dscp.is_some() { DSCP_PRIORITY } else { DEFAULT_PRIORITY };
        let matched = match dscp {
            Some(d) => Match::EthDstDscp { eth_dst: dst_mac, dscp: d },
            None => Match::EthDst { eth_dst: dst_mac },
        };
        let queue = Queue::for_dscp(dscp.unwrap_or(0));

        let mut packet_out = None;
        for window in path.windows(2) {
            let (GraphNode::Switch(u), _v) = (window[0], window[1]) else {
                continue;
            };
            let Some(out_port) = self.out_port(window[0], window[1]) else {
                continue;
            };
            let actions = vec![Action::SetQueue(queue), Action::Output(out_port)];
            self.installed.push(FlowRule { switch: u, matched: matched.clone(), priority, actions: actions.clone() });
            if Some(u) == originating {
                packet_out = Some(PacketOut { switch: u, actions });
            }
        }
        packet_out
    }

    fn out_port(&self, from: GraphNode, to: GraphNode) -> Option<u16> {
        let a = *self.index.get(&from)?;
        let b = *self.index.get(&to)?;
        self.graph.find_edge(a, b).map(|e| self.graph[e])
    }

    /// Dispatches a `PacketIn` arriving at a ToR, per the four-way decision tree in the controller
    /// design: ignore LLDP, flood broadcast (never back out the source port), install a local rule
    /// for a same-ToR destination, or compute and install a VLB path for a known remote
    /// destination — falling back to flood when the destination hasn't been learned yet.
    pub fn dispatch_packet_in(
        &mut self,
        at: Dpid,
        in_port: u16,
        src_mac: MacAddr,
        dst_mac: MacAddr,
        ethertype: u16,
        dscp: Option<u8>,
        rng: &mut impl Rng,
    ) -> Result<PacketInOutcome, ControllerError> {
        match classify_dpid(at) {
            Some(SwitchRole::Tor) => {}
            Some(_) => return Ok(PacketInOutcome::IgnoredNonTor),
            None => return Err(ControllerError::UnclassifiableDpid { dpid: at }),
        }

        if ethertype == LLDP_ETHERTYPE {
            return Ok(PacketInOutcome::IgnoredLldp);
        }

        if (1..=crate::constants::TOR_HOST_PORT_MAX).contains(&in_port) {
            let _ = self.learn_host(at, in_port, src_mac);
        }

        if dst_mac == MacAddr::BROADCAST {
            let flood_ports = self.tor_host_ports(at, Some(in_port));
            return Ok(PacketInOutcome::Flood { ports: flood_ports });
        }

        let src_node = GraphNode::Switch(at);
        let dst_node = GraphNode::Host(dst_mac);

        if self.out_port(src_node, dst_node).is_some() {
            let actions = vec![Action::Output(self.out_port(src_node, dst_node).unwrap())];
            self.installed.push(FlowRule {
                switch: at,
                matched: Match::EthDst { eth_dst: dst_mac },
                priority: DEFAULT_PRIORITY,
                actions: actions.clone(),
            });
            return Ok(PacketInOutcome::InstalledLocal(PacketOut { switch: at, actions }));
        }

        if !self.index.contains_key(&dst_node) {
            let flood_ports = self.tor_host_ports(at, Some(in_port));
            return Ok(PacketInOutcome::Flood { ports: flood_ports });
        }

        match self.vl2_path(src_node, dst_node, rng) {
            Ok(path) => {
                let out = self.install_path(&path, dst_mac, dscp, Some(at));
                Ok(PacketInOutcome::InstalledPath { packet_out: out })
            }
            Err(_) => {
                let flood_ports = self.tor_host_ports(at, Some(in_port));
                Ok(PacketInOutcome::Flood { ports: flood_ports })
            }
        }
    }

    fn tor_host_ports(&self, tor: Dpid, exclude: Option<u16>) -> Vec<u16> {
        let Some(&idx) = self.index.get(&GraphNode::Switch(tor)) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .filter_map(|e| match self.graph[e.target()] {
                GraphNode::Host(_) => {
                    let port = *e.weight();
                    (Some(port) != exclude).then_some(port)
                }
                GraphNode::Switch(_) => None,
            })
            .collect()
    }
}

/// An OpenFlow `PacketOut`: emitted alongside rule installation on the switch that raised the
/// triggering `PacketIn`, so the in-flight frame is not lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub switch: Dpid,
    pub actions: Vec<Action>,
}

/// The controller's decision for one dispatched `PacketIn`.
#[derive(Debug)]
pub enum PacketInOutcome {
    IgnoredLldp,
    IgnoredNonTor,
    Flood { ports: Vec<u16> },
    InstalledLocal(PacketOut),
    InstalledPath { packet_out: Option<PacketOut> },
}

#[derive(Debug, thiserror::Error)]
#[error("no path between {src:?} and {dst:?}")]
pub struct NoPathError {
    pub src: GraphNode,
    pub dst: GraphNode,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("dpid {dpid} does not fall into any known switch role range")]
    UnclassifiableDpid { dpid: Dpid },
    #[error("dpid {dpid} is not a ToR switch")]
    NotATor { dpid: Dpid },
    #[error("port {port} is outside the ToR host-facing range")]
    HostPortOutOfRange { port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, b])
    }

    fn two_tor_fabric() -> (Controller, Dpid, Dpid, Dpid) {
        let mut c = Controller::new();
        let tor0 = Dpid(3000);
        let tor1 = Dpid(3001);
        let agg = Dpid(2000);
        let inter = Dpid(1000);
        for d in [tor0, tor1, agg, inter] {
            c.on_switch_enter(d).unwrap();
        }
        c.on_link_add(tor0, 21, agg);
        c.on_link_add(agg, 1, tor0);
        c.on_link_add(tor1, 21, agg);
        c.on_link_add(agg, 2, tor1);
        c.on_link_add(agg, 3, inter);
        c.on_link_add(inter, 1, agg);
        (c, tor0, tor1, inter)
    }

    #[test]
    fn switch_enter_installs_table_miss_rule() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        assert_eq!(c.installed_rules().len(), 1);
        assert_eq!(c.installed_rules()[0].priority, TABLE_MISS_PRIORITY);
    }

    #[test]
    fn unclassifiable_dpid_is_rejected() {
        let mut c = Controller::new();
        assert!(c.on_switch_enter(Dpid(99)).is_err());
    }

    #[test]
    fn ecmp_path_finds_direct_link() {
        let (c, tor0, tor1, _) = two_tor_fabric();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let path = c
            .ecmp_path(GraphNode::Switch(tor0), GraphNode::Switch(tor1), &mut rng)
            .unwrap();
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn ecmp_path_fails_when_disconnected() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        c.on_switch_enter(Dpid(3001)).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let res = c.ecmp_path(GraphNode::Switch(Dpid(3000)), GraphNode::Switch(Dpid(3001)), &mut rng);
        assert!(res.is_err());
    }

    #[test]
    fn vl2_path_includes_an_intermediate_dpid() {
        let (c, tor0, tor1, inter) = two_tor_fabric();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let path = c
            .vl2_path(GraphNode::Switch(tor0), GraphNode::Switch(tor1), &mut rng)
            .unwrap();
        assert!(path.contains(&GraphNode::Switch(inter)));
    }

    #[test]
    fn host_learning_requires_host_facing_port() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        assert!(c.learn_host(Dpid(3000), 25, mac(1)).is_err());
        assert!(c.learn_host(Dpid(3000), 5, mac(1)).is_ok());
    }

    #[test]
    fn broadcast_never_floods_back_out_input_port() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        c.learn_host(Dpid(3000), 1, mac(1)).unwrap();
        c.learn_host(Dpid(3000), 2, mac(2)).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let outcome = c
            .dispatch_packet_in(Dpid(3000), 1, mac(1), MacAddr::BROADCAST, 0x0800, None, &mut rng)
            .unwrap();
        match outcome {
            PacketInOutcome::Flood { ports } => assert!(!ports.contains(&1)),
            other => panic!("expected flood, got {other:?}"),
        }
    }

    #[test]
    fn lldp_is_ignored() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let outcome = c
            .dispatch_packet_in(Dpid(3000), 1, mac(1), mac(2), LLDP_ETHERTYPE, None, &mut rng)
            .unwrap();
        assert!(matches!(outcome, PacketInOutcome::IgnoredLldp));
    }

    #[test]
    fn same_tor_destination_installs_local_rule() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        c.learn_host(Dpid(3000), 1, mac(1)).unwrap();
        c.learn_host(Dpid(3000), 2, mac(2)).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let outcome = c
            .dispatch_packet_in(Dpid(3000), 1, mac(1), mac(2), 0x0800, None, &mut rng)
            .unwrap();
        assert!(matches!(outcome, PacketInOutcome::InstalledLocal(_)));
    }

    #[test]
    fn unknown_destination_floods() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let outcome = c
            .dispatch_packet_in(Dpid(3000), 1, mac(1), mac(9), 0x0800, None, &mut rng)
            .unwrap();
        assert!(matches!(outcome, PacketInOutcome::Flood { .. }));
    }

    #[test]
    fn switch_leave_drops_node_without_panicking_on_unknown_dpid() {
        let mut c = Controller::new();
        c.on_switch_enter(Dpid(3000)).unwrap();
        c.on_switch_leave(Dpid(3000));
        c.on_switch_leave(Dpid(9999));
    }

    #[test]
    fn queue_selection_is_dscp_derived() {
        assert_eq!(Queue::for_dscp(8), Queue::Q1);
        assert_eq!(Queue::for_dscp(4), Queue::Q0);
        assert_eq!(Queue::for_dscp(0), Queue::Q0);
    }
}
