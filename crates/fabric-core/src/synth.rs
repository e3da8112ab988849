//! Synthesis of logical agent traces into wire-level flow traces (C3).
//!
//! Each logical sender is assigned a [`ParallelismStrategy`] once, uniformly at random, and its
//! entries are processed in time order against a running `cumulative_time` clock. Every entry
//! first expands into zero or more intra-agent sub-flows (the strategy's prefill/decode
//! communication pattern) and then, for entries that carry real generation work, a single
//! application message from the agent's last sub-node to its receivers' `.0` sub-nodes.

use std::collections::BTreeMap;

use rand::Rng;

use crate::constants::{HYBRID_PAIRS, NODES_PER_AGENT, SEC_PER_TOKEN};
use crate::trace::{NamespacedEntry, ReceiverRef, SenderRef};
use crate::units::{Bytes, GpuCost, Secs};

/// Maps a namespaced agent ID to its sub-nodes, each carrying a per-sub-node GPU cost.
pub type ProcessDescriptor = BTreeMap<String, Vec<(String, GpuCost)>>;

/// A wire-level message between two namespaced sub-node IDs, the unit C5 replays.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlowEvent {
    pub sender: String,
    pub receiver: Vec<String>,
    pub time: Secs,
    pub size: Bytes,
}

impl FlowEvent {
    pub(crate) fn namespaced(self, trace_idx: usize) -> Self {
        Self {
            sender: format!("{trace_idx}-{}", self.sender),
            receiver: self
                .receiver
                .into_iter()
                .map(|r| format!("{trace_idx}-{r}"))
                .collect(),
            ..self
        }
    }
}

/// The parallelism strategy governing one agent's intra-node communication pattern, chosen
/// uniformly at random per logical sender at synthesis time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelismStrategy {
    Pipeline,
    Tensor,
    Hybrid,
}

impl ParallelismStrategy {
    fn sample(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..3) {
            0 => Self::Pipeline,
            1 => Self::Tensor,
            _ => Self::Hybrid,
        }
    }

    /// Sub-node pairs (src, dst) touched by one synchronization tick of this strategy's pattern.
    fn tick_edges(self) -> Vec<(usize, usize)> {
        let n = NODES_PER_AGENT;
        match self {
            Self::Pipeline => (0..n - 1).map(|i| (i, i + 1)).collect(),
            Self::Tensor => (0..n)
                .flat_map(|i| (0..n).map(move |j| (i, j)))
                .filter(|(i, j)| i != j)
                .collect(),
            Self::Hybrid => (0..HYBRID_PAIRS)
                .flat_map(|p| {
                    let (a, b) = (p * 2, p * 2 + 1);
                    [(a, b), (b, a)]
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct SenderState {
    strategy: Option<ParallelismStrategy>,
    cumulative: Secs,
    last_data_size_kb: f64,
}

/// Synthesizes a namespaced logical trace into a wire-level [`ProcessDescriptor`] and
/// [`FlowEvent`] sequence.
///
/// `entries` must already be namespaced and sorted by time (see [`crate::trace`]).
pub fn synthesize(
    entries: &[NamespacedEntry],
    rng: &mut impl Rng,
) -> Result<(ProcessDescriptor, Vec<FlowEvent>), SynthesisError> {
    let mut process_map = ProcessDescriptor::new();
    let mut states: BTreeMap<String, SenderState> = BTreeMap::new();
    let mut events = Vec::new();

    for entry in entries {
        let SenderRef::Agent(agent_id) = &entry.sender else {
            continue;
        };

        let state = states.entry(agent_id.clone()).or_default();
        let strategy = *state
            .strategy
            .get_or_insert_with(|| ParallelismStrategy::sample(rng));
        process_map
            .entry(agent_id.clone())
            .or_insert_with(|| sub_nodes(agent_id, strategy));

        let input_size_kb = state.last_data_size_kb;
        let output_size_kb = entry.data_size_kb;
        let cumulative = state.cumulative;

        if entry.sender != SenderRef::External && !entry.receiver.iter().any(|r| *r == ReceiverRef::Sink)
            && entry.llm_gen_time != 0.0
        {
            emit_entry(
                agent_id,
                strategy,
                cumulative,
                entry.llm_gen_time,
                input_size_kb,
                output_size_kb,
                &entry.receiver,
                &mut events,
            )?;
            state.cumulative = Secs::new(cumulative.into_f64() + entry.llm_gen_time);
        }
        state.last_data_size_kb = output_size_kb;
    }

    events.sort_by(|a: &FlowEvent, b: &FlowEvent| {
        a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok((process_map, events))
}

fn sub_nodes(agent_id: &str, strategy: ParallelismStrategy) -> Vec<(String, GpuCost)> {
    let cost_per_node = match strategy {
        ParallelismStrategy::Pipeline => GpuCost::new(1),
        ParallelismStrategy::Tensor => GpuCost::new(1),
        ParallelismStrategy::Hybrid => GpuCost::new(1),
    };
    (0..NODES_PER_AGENT)
        .map(|i| (format!("{agent_id}.{i}"), cost_per_node))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn emit_entry(
    agent_id: &str,
    strategy: ParallelismStrategy,
    cumulative: Secs,
    llm_gen_time: f64,
    input_size_kb: f64,
    output_size_kb: f64,
    receivers: &[ReceiverRef],
    out: &mut Vec<FlowEvent>,
) -> Result<(), SynthesisError> {
    if llm_gen_time < 0.0 {
        return Err(SynthesisError::NegativeGenTime { agent_id: agent_id.to_string() });
    }

    let nodes = NODES_PER_AGENT as f64;
    let tokens_out = (output_size_kb * 1000.0 / 4.0).max(0.0);
    let decode_time = tokens_out * SEC_PER_TOKEN;
    let prefill_time = (llm_gen_time - decode_time).max(0.0);
    let tokens_out = tokens_out.round() as u64;
    let prefill_interval = Secs::new(prefill_time / nodes);
    let decode_interval = Secs::new(SEC_PER_TOKEN);

    let prefill_size =
        Bytes::new((crate::constants::MSG_BYTES as f64 * (input_size_kb * 1000.0 / 4.0) * 2.0).max(0.0) as u64);
    let decode_size = Bytes::new(crate::constants::MSG_BYTES);

    let edges = strategy.tick_edges();
    let sub_id = |idx: usize| format!("{agent_id}.{idx}");

    match strategy {
        ParallelismStrategy::Pipeline => {
            for (k, &(src, dst)) in edges.iter().enumerate() {
                let time = Secs::new(cumulative.into_f64() + (k as f64 + 1.0) * prefill_interval.into_f64());
                out.push(FlowEvent {
                    sender: sub_id(src),
                    receiver: vec![sub_id(dst)],
                    time,
                    size: prefill_size,
                });
            }
            for tick in 0..tokens_out {
                let time = Secs::new(
                    cumulative.into_f64() + prefill_time + (tick as f64 + 1.0) * decode_interval.into_f64(),
                );
                for &(src, dst) in &edges {
                    out.push(FlowEvent {
                        sender: sub_id(src),
                        receiver: vec![sub_id(dst)],
                        time,
                        size: decode_size,
                    });
                }
            }
        }
        ParallelismStrategy::Tensor | ParallelismStrategy::Hybrid => {
            let prefill_round_time = Secs::new(cumulative.into_f64() + prefill_time);
            for &(src, dst) in &edges {
                out.push(FlowEvent {
                    sender: sub_id(src),
                    receiver: vec![sub_id(dst)],
                    time: prefill_round_time,
                    size: prefill_size,
                });
            }
            for tick in 0..tokens_out {
                let time = Secs::new(
                    cumulative.into_f64() + prefill_time + (tick as f64 + 1.0) * decode_interval.into_f64(),
                );
                for &(src, dst) in &edges {
                    out.push(FlowEvent {
                        sender: sub_id(src),
                        receiver: vec![sub_id(dst)],
                        time,
                        size: decode_size,
                    });
                }
            }
        }
    }

    let receivers_sub0: Vec<String> = receivers
        .iter()
        .filter_map(|r| match r {
            ReceiverRef::Agent(id) => Some(format!("{id}.0")),
            ReceiverRef::Sink => None,
        })
        .collect();
    if !receivers_sub0.is_empty() {
        out.push(FlowEvent {
            sender: sub_id(NODES_PER_AGENT - 1),
            receiver: receivers_sub0,
            time: Secs::new(cumulative.into_f64() + llm_gen_time),
            size: Bytes::new((output_size_kb * 1000.0).max(0.0) as u64),
        });
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("agent {agent_id} has a negative llm_gen_time")]
    NegativeGenTime { agent_id: String },
}
