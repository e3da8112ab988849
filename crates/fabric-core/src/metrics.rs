//! Parsing and aggregation of per-flow completion records produced by a replay run (C7).
//!
//! Input is a directory of files named `<idx>_<src_logical>_to_<dst_logical>.json`, each either a
//! bulk-transfer completion record or an error. Classification (intra-group vs inter-group) is
//! derived purely from the filename's group keys, never from file contents.

use std::path::Path;

use crate::placement::group_key;

/// A single flow's outcome, after parsing its completion record.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub src: String,
    pub dst: String,
    pub class: FlowClass,
    pub outcome: Result<Completion, FlowToolError>,
}

/// Intra-group (distributed inference) versus inter-group (agent-to-agent) traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowClass {
    IntraGroup,
    InterGroup,
}

/// A successfully completed flow: duration and bytes transferred.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub duration_s: f64,
    pub bytes_sent: u64,
}

/// The error taxonomy reported verbatim by C7; none are fatal to the overall report.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FlowToolError {
    #[error("completion file is empty")]
    EmptyFile,
    #[error("JSON parse error: {0}")]
    JsonParseError(String),
    #[error("incomplete JSON: no end.sum_sent")]
    IncompleteJson,
    #[error("server busy")]
    ServerBusy,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("tool error: {0}")]
    OtherToolError(String),
}

/// Parses every `*.json` file in `dir` into a [`FlowResult`], classifying each by its filename.
pub fn load_flow_results(dir: impl AsRef<Path>) -> std::io::Result<Vec<FlowResult>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some((src, dst)) = parse_filename(&path) else { continue };
        let class = if group_key(&src) == group_key(&dst) {
            FlowClass::IntraGroup
        } else {
            FlowClass::InterGroup
        };
        let contents = std::fs::read_to_string(&path)?;
        let outcome = parse_completion(&contents);
        out.push(FlowResult { src, dst, class, outcome });
    }
    Ok(out)
}

/// Parses the `<idx>_<src>_to_<dst>.json` filename convention.
fn parse_filename(path: &Path) -> Option<(String, String)> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.splitn(2, '_').nth(1)?;
    let (src, dst) = rest.split_once("_to_")?;
    Some((src.to_string(), dst.to_string()))
}

/// Parses one completion-record file's contents, trying the native bulk-transfer-tool schema
/// first and falling back to iperf3's `-J` schema.
pub fn parse_completion(contents: &str) -> Result<Completion, FlowToolError> {
    if contents.trim().is_empty() {
        return Err(FlowToolError::EmptyFile);
    }
    let v: serde_json::Value =
        serde_json::from_str(contents).map_err(|e| FlowToolError::JsonParseError(e.to_string()))?;

    if let Some(event) = v.get("event").and_then(|e| e.as_str()) {
        return match event {
            "flow_complete" => {
                let duration_s = v.get("duration_sec").and_then(|x| x.as_f64());
                let bytes_sent = v.get("bytes").and_then(|x| x.as_u64());
                match (duration_s, bytes_sent) {
                    (Some(duration_s), Some(bytes_sent)) => Ok(Completion { duration_s, bytes_sent }),
                    _ => Err(FlowToolError::IncompleteJson),
                }
            }
            "error" => Err(classify_error(v.get("error").and_then(|e| e.as_str()).unwrap_or(""))),
            other => Err(FlowToolError::OtherToolError(format!("unknown event {other}"))),
        };
    }

    if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
        return Err(classify_error(err));
    }

    let sum_sent = v.pointer("/end/sum_sent");
    match sum_sent {
        Some(sum) => {
            let duration_s = sum.get("seconds").and_then(|x| x.as_f64());
            let bytes_sent = sum.get("bytes").and_then(|x| x.as_u64());
            match (duration_s, bytes_sent) {
                (Some(duration_s), Some(bytes_sent)) => Ok(Completion { duration_s, bytes_sent }),
                _ => Err(FlowToolError::IncompleteJson),
            }
        }
        None => Err(FlowToolError::IncompleteJson),
    }
}

fn classify_error(msg: &str) -> FlowToolError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("busy") {
        FlowToolError::ServerBusy
    } else if lower.contains("refused") {
        FlowToolError::ConnectionRefused
    } else {
        FlowToolError::OtherToolError(msg.to_string())
    }
}

/// Aggregate statistics over a set of completed flows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassStats {
    pub count: usize,
    pub mean_size_bytes: f64,
    pub mean_fct_s: f64,
    pub p50_fct_s: f64,
    pub p99_fct_s: f64,
    pub max_fct_s: f64,
    pub throughput_mbps: f64,
    pub total_bytes: u64,
}

/// Computes [`ClassStats`] over the successful completions in `results`. Returns `None` when
/// there are zero successful flows in the set — callers report that explicitly rather than
/// dividing by zero.
pub fn aggregate(results: &[&FlowResult]) -> Option<ClassStats> {
    let completions: Vec<Completion> = results.iter().filter_map(|r| r.outcome.as_ref().ok()).copied().collect();
    if completions.is_empty() {
        return None;
    }

    let count = completions.len();
    let total_bytes: u64 = completions.iter().map(|c| c.bytes_sent).sum();
    let mean_size_bytes = total_bytes as f64 / count as f64;

    let mut fcts: Vec<f64> = completions.iter().map(|c| c.duration_s).collect();
    fcts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mean_fct_s = fcts.iter().sum::<f64>() / count as f64;
    let p50_fct_s = percentile(&fcts, 0.50);
    let p99_fct_s = percentile(&fcts, 0.99);
    let max_fct_s = *fcts.last().unwrap();
    let throughput_mbps = if mean_fct_s > 0.0 {
        (mean_size_bytes * 8.0) / mean_fct_s / 1_000_000.0
    } else {
        0.0
    };

    Some(ClassStats {
        count,
        mean_size_bytes,
        mean_fct_s,
        p50_fct_s,
        p99_fct_s,
        max_fct_s,
        throughput_mbps,
        total_bytes,
    })
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// A full metrics report: per-class breakdown plus the overall aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub intra_group: Option<ClassStats>,
    pub inter_group: Option<ClassStats>,
    pub overall: Option<ClassStats>,
    pub error_counts: Vec<(String, usize)>,
}

/// Builds a full [`Report`] from a set of flow results.
pub fn build_report(results: &[FlowResult]) -> Report {
    let intra: Vec<&FlowResult> = results.iter().filter(|r| r.class == FlowClass::IntraGroup).collect();
    let inter: Vec<&FlowResult> = results.iter().filter(|r| r.class == FlowClass::InterGroup).collect();
    let all: Vec<&FlowResult> = results.iter().collect();

    let mut error_counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for r in results {
        if let Err(e) = &r.outcome {
            *error_counts.entry(e.to_string()).or_insert(0) += 1;
        }
    }

    Report {
        intra_group: aggregate(&intra),
        inter_group: aggregate(&inter),
        overall: aggregate(&all),
        error_counts: error_counts.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_filename_splits_src_and_dst() {
        let p = PathBuf::from("42_0-1.3_to_0-2.0.json");
        let (src, dst) = parse_filename(&p).unwrap();
        assert_eq!(src, "0-1.3");
        assert_eq!(dst, "0-2.0");
    }

    #[test]
    fn classification_by_group_key() {
        assert_eq!(group_key("0-1.3"), group_key("0-1.5"));
        assert_ne!(group_key("0-1.3"), group_key("0-2.0"));
    }

    #[test]
    fn parse_completion_native_schema() {
        let json = r#"{"event":"flow_complete","target_ip":"10.0.0.1","bytes":1024,"duration_sec":0.5,"throughput_mbps":16.0}"#;
        let c = parse_completion(json).unwrap();
        assert_eq!(c.bytes_sent, 1024);
        assert_eq!(c.duration_s, 0.5);
    }

    #[test]
    fn parse_completion_iperf3_schema() {
        let json = r#"{"end":{"sum_sent":{"seconds":1.2,"bytes":2048}}}"#;
        let c = parse_completion(json).unwrap();
        assert_eq!(c.bytes_sent, 2048);
        assert_eq!(c.duration_s, 1.2);
    }

    #[test]
    fn parse_completion_empty_file_is_empty_error() {
        assert_eq!(parse_completion(""), Err(FlowToolError::EmptyFile));
    }

    #[test]
    fn parse_completion_error_event_classifies_server_busy() {
        let json = r#"{"event":"error","error":"server busy, try again"}"#;
        assert_eq!(parse_completion(json), Err(FlowToolError::ServerBusy));
    }

    #[test]
    fn parse_completion_malformed_json_is_parse_error() {
        assert!(matches!(parse_completion("{not json"), Err(FlowToolError::JsonParseError(_))));
    }

    #[test]
    fn aggregate_returns_none_for_zero_successes() {
        let results = vec![FlowResult {
            src: "0-1.0".into(),
            dst: "0-2.0".into(),
            class: FlowClass::InterGroup,
            outcome: Err(FlowToolError::ConnectionRefused),
        }];
        let refs: Vec<&FlowResult> = results.iter().collect();
        assert!(aggregate(&refs).is_none());
    }

    #[test]
    fn aggregate_computes_throughput_from_mean_size_and_fct() {
        let results = vec![
            FlowResult {
                src: "0-1.0".into(),
                dst: "0-1.1".into(),
                class: FlowClass::IntraGroup,
                outcome: Ok(Completion { duration_s: 1.0, bytes_sent: 1_000_000 }),
            },
            FlowResult {
                src: "0-1.0".into(),
                dst: "0-1.2".into(),
                class: FlowClass::IntraGroup,
                outcome: Ok(Completion { duration_s: 2.0, bytes_sent: 1_000_000 }),
            },
        ];
        let refs: Vec<&FlowResult> = results.iter().collect();
        let stats = aggregate(&refs).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mean_fct_s, 1.5);
        assert!(stats.throughput_mbps > 0.0);
    }

    #[test]
    fn build_report_buckets_by_class() {
        let results = vec![
            FlowResult {
                src: "0-1.0".into(),
                dst: "0-1.1".into(),
                class: FlowClass::IntraGroup,
                outcome: Ok(Completion { duration_s: 1.0, bytes_sent: 100 }),
            },
            FlowResult {
                src: "0-1.0".into(),
                dst: "0-2.0".into(),
                class: FlowClass::InterGroup,
                outcome: Ok(Completion { duration_s: 1.0, bytes_sent: 200 }),
            },
        ];
        let report = build_report(&results);
        assert_eq!(report.intra_group.unwrap().count, 1);
        assert_eq!(report.inter_group.unwrap().count, 1);
        assert_eq!(report.overall.unwrap().count, 2);
    }
}
