//! Loading and merging of logical agent traces (C2).
//!
//! Two distinct file shapes pass through here: a *logical* trace (plain JSON array of
//! [`LogicalEntry`], the upstream LLM-agent simulators' output format) and a *synthesized* trace
//! (a leading process-descriptor map followed by wire-level flow events, [`synth`](crate::synth)'s
//! output format). [`load_logical`] reads the former; [`load_and_merge`] reads and merges one or
//! more of the latter, which is what lets the round-trip property
//! `load_and_merge([synthesize(load_logical(L))])` type-check and hold.

use std::cmp::Ordering;
use std::path::Path;

use crate::synth::{FlowEvent, ProcessDescriptor};
use crate::units::Secs;

/// A single entry in a raw logical agent trace, as produced by an upstream LLM-agent simulator.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LogicalEntry {
    /// Sending logical node ID. `-1` denotes the external user.
    pub sender: i64,
    /// Receiving logical node IDs; non-empty. `-1` denotes the final sink.
    pub receiver: Vec<i64>,
    pub time_sent: TimeSent,
    pub llm_gen_time: f64,
    #[serde(rename = "data_size(kb)")]
    pub data_size_kb: f64,
}

impl LogicalEntry {
    /// An entry seeds context but produces no wire flows when the sender or any receiver is the
    /// external sentinel, or there is no generation time to synthesize against.
    pub fn produces_wire_flows(&self) -> bool {
        self.sender != -1 && !self.receiver.iter().any(|&r| r == -1) && self.llm_gen_time != 0.0
    }
}

/// A trace's `time_sent` field, which upstream tools emit either as an ISO-8601 wall-clock
/// timestamp or as a float second offset. A single file must commit to one representation.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum TimeSent {
    Offset(f64),
    Iso(String),
}

impl<'de> serde::Deserialize<'de> for TimeSent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(TimeSent::Offset)
                .ok_or_else(|| serde::de::Error::custom("time_sent number is not a valid f64")),
            serde_json::Value::String(s) => Ok(TimeSent::Iso(s)),
            other => Err(serde::de::Error::custom(format!(
                "time_sent must be a number or string, got {other}"
            ))),
        }
    }
}

/// A [`LogicalEntry`] whose identifiers have been namespaced with a trace-file prefix and whose
/// `time_sent` has been normalized to a float second offset from the earliest event in its file.
#[derive(Debug, Clone)]
pub struct NamespacedEntry {
    pub sender: SenderRef,
    pub receiver: Vec<ReceiverRef>,
    pub time: Secs,
    pub llm_gen_time: f64,
    pub data_size_kb: f64,
}

/// A namespaced sender: either the external user, or a namespaced agent ID like `"0-1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderRef {
    External,
    Agent(String),
}

/// A namespaced receiver: either the final sink, or a namespaced agent ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReceiverRef {
    Sink,
    Agent(String),
}

fn namespace_id(trace_idx: usize, id: i64) -> Option<String> {
    (id != -1).then(|| format!("{trace_idx}-{id}"))
}

/// Loads one logical trace file, returning its entries in file order. Does not namespace or sort
/// — that is [`load_and_merge`]'s job, applied after synthesis turns this into wire-level flows.
pub fn load_logical(path: impl AsRef<Path>) -> Result<Vec<LogicalEntry>, TraceFormatError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| TraceFormatError::Io(path.to_owned(), e.to_string()))?;
    let entries: Vec<LogicalEntry> = serde_json::from_str(&contents)
        .map_err(|e| TraceFormatError::Json(path.to_owned(), e.to_string()))?;
    Ok(entries)
}

/// Namespaces and time-normalizes the entries of one logical trace, identified by `trace_idx`.
///
/// Fails with [`TraceFormatError::MixedTimeRepresentation`] if a file mixes ISO-8601 and float
/// `time_sent` values — per design, this is never silently resolved.
pub fn namespace_logical(
    trace_idx: usize,
    entries: &[LogicalEntry],
) -> Result<Vec<NamespacedEntry>, TraceFormatError> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    let is_iso = matches!(entries[0].time_sent, TimeSent::Iso(_));
    let mut seconds = Vec::with_capacity(entries.len());
    for e in entries {
        let this_is_iso = matches!(e.time_sent, TimeSent::Iso(_));
        if this_is_iso != is_iso {
            return Err(TraceFormatError::MixedTimeRepresentation { trace_idx });
        }
        seconds.push(to_epoch_seconds(&e.time_sent)?);
    }
    let start = seconds.iter().cloned().fold(f64::INFINITY, f64::min);

    let out = entries
        .iter()
        .zip(seconds)
        .map(|(e, secs)| NamespacedEntry {
            sender: match namespace_id(trace_idx, e.sender) {
                Some(id) => SenderRef::Agent(id),
                None => SenderRef::External,
            },
            receiver: e
                .receiver
                .iter()
                .map(|&r| match namespace_id(trace_idx, r) {
                    Some(id) => ReceiverRef::Agent(id),
                    None => ReceiverRef::Sink,
                })
                .collect(),
            time: Secs::new(secs - start),
            llm_gen_time: e.llm_gen_time,
            data_size_kb: e.data_size_kb,
        })
        .collect();
    Ok(out)
}

fn to_epoch_seconds(ts: &TimeSent) -> Result<f64, TraceFormatError> {
    match ts {
        TimeSent::Offset(s) => Ok(*s),
        TimeSent::Iso(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 * 1e-9)
            .map_err(|_| TraceFormatError::InvalidIsoTimestamp(s.clone())),
    }
}

/// Loads and merges one or more *synthesized* trace files — the output of
/// [`synth::synthesize`](crate::synth::synthesize) — namespacing every identifier with its file
/// index and stable-sorting the merged events by time.
///
/// Each file must be a JSON array whose first element is either a process-descriptor map or a
/// directly recognizable flow event (in which case the file is taken to carry an empty process
/// map). Anything else is a [`TraceFormatError`].
pub fn load_and_merge(
    paths: &[impl AsRef<Path>],
) -> Result<(ProcessDescriptor, Vec<FlowEvent>), TraceFormatError> {
    let mut merged_map = ProcessDescriptor::new();
    let mut merged_events = Vec::new();
    let mut failures = Vec::new();

    for (k, path) in paths.iter().enumerate() {
        match load_and_namespace_one(k, path.as_ref()) {
            Ok((map, events)) => {
                merged_map.extend(map);
                merged_events.extend(events);
            }
            Err(e) => failures.push(e),
        }
    }

    if !paths.is_empty() && failures.len() == paths.len() {
        return Err(TraceFormatError::AllFilesFailed(
            failures.into_iter().map(|e| e.to_string()).collect(),
        ));
    }

    // CORRECTNESS: ties keep their file/list order (stable sort).
    merged_events.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(Ordering::Equal));
    Ok((merged_map, merged_events))
}

fn load_and_namespace_one(
    trace_idx: usize,
    path: &Path,
) -> Result<(ProcessDescriptor, Vec<FlowEvent>), TraceFormatError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| TraceFormatError::Io(path.to_owned(), e.to_string()))?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .map_err(|e| TraceFormatError::Json(path.to_owned(), e.to_string()))?;

    let Some(first) = values.first() else {
        return Ok((ProcessDescriptor::new(), Vec::new()));
    };

    let looks_like_event = |v: &serde_json::Value| {
        v.get("sender").is_some() && v.get("time").is_some() && v.get("size").is_some()
    };
    let looks_like_map = |v: &serde_json::Value| v.is_object() && !looks_like_event(v);

    let (raw_map, raw_events): (ProcessDescriptor, &[serde_json::Value]) = if looks_like_map(first) {
        let map: ProcessDescriptor = serde_json::from_value(first.clone())
            .map_err(|e| TraceFormatError::Json(path.to_owned(), e.to_string()))?;
        (map, &values[1..])
    } else if looks_like_event(first) {
        return Err(TraceFormatError::MissingProcessMap(path.to_owned()));
    } else {
        return Err(TraceFormatError::UnrecognizedLeadingElement(path.to_owned()));
    };

    let namespaced_map = raw_map
        .into_iter()
        .map(|(agent, subs)| {
            let agent_ns = format!("{trace_idx}-{agent}");
            let subs_ns = subs
                .into_iter()
                .map(|(sub, cost)| (format!("{trace_idx}-{sub}"), cost))
                .collect();
            (agent_ns, subs_ns)
        })
        .collect();

    let mut events = Vec::with_capacity(raw_events.len());
    for v in raw_events {
        let e: FlowEvent = serde_json::from_value(v.clone())
            .map_err(|e| TraceFormatError::Json(path.to_owned(), e.to_string()))?;
        events.push(e.namespaced(trace_idx));
    }

    Ok((namespaced_map, events))
}

/// Errors encountered while loading or merging trace files.
#[derive(Debug, thiserror::Error)]
pub enum TraceFormatError {
    #[error("failed to read trace file {0}: {1}")]
    Io(std::path::PathBuf, String),

    #[error("failed to parse trace file {0} as JSON: {1}")]
    Json(std::path::PathBuf, String),

    #[error("trace {trace_idx} mixes ISO-8601 and float time_sent representations")]
    MixedTimeRepresentation { trace_idx: usize },

    #[error("invalid ISO-8601 timestamp: {0}")]
    InvalidIsoTimestamp(String),

    #[error("{0}: first element is neither a process map nor a recognizable event")]
    UnrecognizedLeadingElement(std::path::PathBuf),

    #[error("{0}: first element looks like a flow event with no leading process-descriptor map")]
    MissingProcessMap(std::path::PathBuf),

    #[error("all trace files failed to load: {0:?}")]
    AllFilesFailed(Vec<String>),
}
