//! Mapping of logical processes onto physical emulated hosts (C4).
//!
//! Two disciplines are offered; [`place_strided`] is the default the replayer should reach for,
//! since [`place_consecutive`] pins every sub-node of one agent to a single host and so never
//! exercises the fabric for intra-agent traffic. [`check_capacity`] is a separate, purely
//! off-line feasibility check: the online replay path never enforces GPU cost.

use rustc_hash::FxHashMap;

use crate::constants::MAX_GPU_PER_HOST;
use crate::units::GpuCost;

/// A physical emulated endpoint: a stable name, an IPv4 address, its ToR attachment, and a
/// remaining-GPU counter used only by [`check_capacity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalHost {
    pub name: String,
    pub ipv4: std::net::Ipv4Addr,
    pub tor: String,
    pub remaining_gpus: u32,
}

impl PhysicalHost {
    pub fn new(name: impl Into<String>, ipv4: std::net::Ipv4Addr, tor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv4,
            tor: tor.into(),
            remaining_gpus: MAX_GPU_PER_HOST,
        }
    }
}

/// An injective-per-run assignment of namespaced sub-node IDs to physical hosts.
pub type PlacementMap = FxHashMap<String, PhysicalHost>;

/// Physical pool size for a given usage percentage: `ceil(percent_usage * total_hosts)`, clamped
/// to at least 1.
pub fn pool_size(percent_usage: f64, total_hosts: usize) -> usize {
    ((percent_usage * total_hosts as f64).ceil() as usize).max(1)
}

/// Consecutive bin-pack: fills hosts in pool order, `procs_per_host` processes at a time, and
/// wraps around if the pool is exhausted. Every sub-node of one logical agent tends to land on
/// the same host, so intra-agent communication never crosses the fabric.
pub fn place_consecutive(
    sub_node_ids: &[String],
    pool: &[PhysicalHost],
    procs_per_host: usize,
) -> PlacementMap {
    let mut map = PlacementMap::default();
    if pool.is_empty() || procs_per_host == 0 {
        return map;
    }
    for (i, id) in sub_node_ids.iter().enumerate() {
        let host_idx = (i / procs_per_host) % pool.len();
        map.insert(id.clone(), pool[host_idx].clone());
    }
    map
}

/// Strided group mapping (default). Groups sub-node IDs by their group key (everything before
/// the final `.`), then assigns the *i*-th member of each group to `pool[i mod pool.len()]`.
/// Guarantees no two members of a group with `|group| <= pool.len()` share a host.
pub fn place_strided(sub_node_ids: &[String], pool: &[PhysicalHost]) -> PlacementMap {
    let mut map = PlacementMap::default();
    if pool.is_empty() {
        return map;
    }

    let mut groups: FxHashMap<&str, Vec<&String>> = FxHashMap::default();
    for id in sub_node_ids {
        groups.entry(group_key(id)).or_default().push(id);
    }

    for members in groups.values() {
        for (i, id) in members.iter().enumerate() {
            map.insert((*id).clone(), pool[i % pool.len()].clone());
        }
    }
    map
}

/// Everything before the final `.` in a namespaced sub-node ID — the group key identifying its
/// owning logical agent.
pub fn group_key(namespaced_id: &str) -> &str {
    namespaced_id.rfind('.').map_or(namespaced_id, |i| &namespaced_id[..i])
}

/// Checks whether `sub_nodes` (each with a GPU cost) fit within `pool`'s capacity, deducting as it
/// goes. Rolls back on failure so `pool` is left untouched if the check fails.
pub fn check_capacity(
    sub_nodes: &[(String, GpuCost)],
    pool: &mut [PhysicalHost],
) -> Result<(), PlacementError> {
    let mut deducted: Vec<(usize, u32)> = Vec::new();
    for (sub_id, cost) in sub_nodes {
        let cost = cost.into_u32();
        let Some(idx) = pool.iter().position(|h| h.remaining_gpus >= cost) else {
            for (idx, amount) in deducted {
                pool[idx].remaining_gpus += amount;
            }
            return Err(PlacementError::ResourceExhausted { sub_id: sub_id.clone() });
        };
        pool[idx].remaining_gpus -= cost;
        deducted.push((idx, cost));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no host has enough remaining GPU capacity for sub-node {sub_id}")]
    ResourceExhausted { sub_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pool(n: usize) -> Vec<PhysicalHost> {
        (0..n)
            .map(|i| PhysicalHost::new(format!("h{i}"), Ipv4Addr::new(10, 0, 0, i as u8 + 1), "tor-0"))
            .collect()
    }

    #[test]
    fn group_key_strips_subnode_suffix() {
        assert_eq!(group_key("0-1.3"), "0-1");
        assert_eq!(group_key("0-1"), "0-1");
    }

    #[test]
    fn strided_placement_spreads_one_group_across_hosts() {
        let ids: Vec<String> = (0..8).map(|i| format!("0-1.{i}")).collect();
        let p = pool(8);
        let map = place_strided(&ids, &p);
        let hosts: std::collections::HashSet<_> = map.values().map(|h| h.name.clone()).collect();
        assert_eq!(hosts.len(), 8);
    }

    #[test]
    fn strided_placement_wraps_when_group_exceeds_pool() {
        let ids: Vec<String> = (0..8).map(|i| format!("0-1.{i}")).collect();
        let p = pool(4);
        let map = place_strided(&ids, &p);
        assert_eq!(map.get("0-1.0").unwrap().name, map.get("0-1.4").unwrap().name);
    }

    #[test]
    fn consecutive_placement_packs_in_order() {
        let ids: Vec<String> = (0..6).map(|i| format!("0-{i}.0")).collect();
        let p = pool(3);
        let map = place_consecutive(&ids, &p, 2);
        assert_eq!(map.get("0-0.0").unwrap().name, "h0");
        assert_eq!(map.get("0-1.0").unwrap().name, "h0");
        assert_eq!(map.get("0-2.0").unwrap().name, "h1");
    }

    #[test]
    fn pool_size_clamps_to_at_least_one() {
        assert_eq!(pool_size(0.0, 100), 1);
        assert_eq!(pool_size(0.01, 10), 1);
        assert_eq!(pool_size(0.5, 10), 5);
    }

    #[test]
    fn capacity_check_rolls_back_on_exhaustion() {
        let mut p = pool(1);
        p[0].remaining_gpus = 5;
        let subs = vec![
            ("a.0".to_string(), GpuCost::new(3)),
            ("a.1".to_string(), GpuCost::new(3)),
        ];
        let err = check_capacity(&subs, &mut p).unwrap_err();
        assert!(matches!(err, PlacementError::ResourceExhausted { .. }));
        assert_eq!(p[0].remaining_gpus, 5);
    }

    #[test]
    fn capacity_check_succeeds_within_budget() {
        let mut p = pool(1);
        let subs = vec![("a.0".to_string(), GpuCost::new(4)), ("a.1".to_string(), GpuCost::new(4))];
        check_capacity(&subs, &mut p).unwrap();
        assert_eq!(p[0].remaining_gpus, MAX_GPU_PER_HOST - 8);
    }
}
