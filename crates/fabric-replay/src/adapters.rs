//! External collaborators the replayer drives but does not implement (C8): the emulator that
//! instantiates virtual hosts/switches and the bulk-transfer tool that generates actual bytes
//! between them. Both are named interfaces, not an embedded implementation — the replay hot loop
//! only ever talks to them through structured, non-blocking command invocation, never shell
//! strings.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use fabric_core::placement::PhysicalHost;

/// TCP congestion-control algorithm applied to every host before a replay starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum CongestionControl {
    Cubic,
    Reno,
    Bbr,
    Dctcp,
}

impl CongestionControl {
    /// `dctcp` additionally requires ECN on the host's TCP stack.
    pub fn requires_ecn(self) -> bool {
        matches!(self, CongestionControl::Dctcp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CongestionControl::Cubic => "cubic",
            CongestionControl::Reno => "reno",
            CongestionControl::Bbr => "bbr",
            CongestionControl::Dctcp => "dctcp",
        }
    }
}

impl Default for CongestionControl {
    fn default() -> Self {
        CongestionControl::Cubic
    }
}

impl std::fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Drives the emulator that instantiates virtual hosts and switches. Out of scope per the
/// harness's purpose — implementations talk to whatever emulator is actually deployed.
pub trait EmulatorDriver: Send + Sync {
    fn start(&mut self, hosts: &[PhysicalHost]) -> Result<(), EmulatorError>;
    fn set_congestion_control(&mut self, host: &PhysicalHost, cc: CongestionControl) -> Result<(), EmulatorError>;
    fn stop(&mut self) -> Result<(), EmulatorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("emulator startup failed: {0}")]
    StartupFailed(String),
    #[error("controller unreachable: {0}")]
    ControllerUnreachable(String),
}

/// One flow to launch: a bulk transfer from `src` to `dst` over `port`, whose completion record
/// lands at `log_path`.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub flow_idx: u64,
    pub src: PhysicalHost,
    pub dst: PhysicalHost,
    pub port: u16,
    pub size_bytes: u64,
    pub log_path: PathBuf,
}

/// Generates actual bytes between two hosts. `launch_flow` must return immediately — the
/// replayer's hot loop is never allowed to block on an in-flight transfer; completion is observed
/// later, purely by reading `log_path`.
pub trait BulkTransferTool: Send + Sync {
    fn launch_flow(&self, spec: LaunchSpec) -> Result<(), LaunchError>;
    fn terminate_all(&self) -> Result<(), LaunchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to launch flow {flow_idx}: {reason}")]
    SpawnFailed { flow_idx: u64, reason: String },
    #[error("failed to terminate in-flight transfers: {0}")]
    TerminateFailed(String),
}

/// Shells out to an external bulk-transfer binary via structured argv (never an interpolated
/// shell string), redirecting its stdout to `spec.log_path`.
pub struct ProcessBulkTransferTool {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessBulkTransferTool {
    pub fn new(binary: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self { binary: binary.into(), extra_args }
    }
}

impl BulkTransferTool for ProcessBulkTransferTool {
    fn launch_flow(&self, spec: LaunchSpec) -> Result<(), LaunchError> {
        let log = std::fs::File::create(&spec.log_path).map_err(|e| LaunchError::SpawnFailed {
            flow_idx: spec.flow_idx,
            reason: e.to_string(),
        })?;
        Command::new(&self.binary)
            .args(&self.extra_args)
            .arg("--mode")
            .arg("client")
            .arg("--target")
            .arg(spec.dst.ipv4.to_string())
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--bytes")
            .arg(spec.size_bytes.to_string())
            .stdout(Stdio::from(log))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed { flow_idx: spec.flow_idx, reason: e.to_string() })?;
        Ok(())
    }

    fn terminate_all(&self) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// An in-process stand-in for the bulk-transfer tool, used in tests and for dry runs: writes a
/// synthetic flow-completion record without spawning anything or touching the network.
pub struct FakeBulkTransferTool {
    pub link_bw_bytes_per_sec: f64,
}

impl Default for FakeBulkTransferTool {
    fn default() -> Self {
        Self { link_bw_bytes_per_sec: 10_000_000_000.0 / 8.0 }
    }
}

impl BulkTransferTool for FakeBulkTransferTool {
    fn launch_flow(&self, spec: LaunchSpec) -> Result<(), LaunchError> {
        let duration_sec = spec.size_bytes as f64 / self.link_bw_bytes_per_sec;
        let record = serde_json::json!({
            "event": "flow_complete",
            "target_ip": spec.dst.ipv4.to_string(),
            "bytes": spec.size_bytes,
            "duration_sec": duration_sec,
            "throughput_mbps": (spec.size_bytes as f64 * 8.0 / duration_sec.max(1e-9)) / 1_000_000.0,
        });
        std::fs::write(&spec.log_path, record.to_string()).map_err(|e| LaunchError::SpawnFailed {
            flow_idx: spec.flow_idx,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn terminate_all(&self) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// An in-process stand-in for the emulator driver: records what it was asked to do without
/// touching any real virtual hosts or switches.
#[derive(Debug, Default)]
pub struct NullEmulatorDriver {
    pub started: bool,
    pub cc_assignments: Vec<(String, CongestionControl)>,
}

impl EmulatorDriver for NullEmulatorDriver {
    fn start(&mut self, _hosts: &[PhysicalHost]) -> Result<(), EmulatorError> {
        self.started = true;
        Ok(())
    }

    fn set_congestion_control(&mut self, host: &PhysicalHost, cc: CongestionControl) -> Result<(), EmulatorError> {
        self.cc_assignments.push((host.name.clone(), cc));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EmulatorError> {
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(name: &str) -> PhysicalHost {
        PhysicalHost::new(name, Ipv4Addr::new(10, 0, 0, 1), "tor-0")
    }

    #[test]
    fn dctcp_requires_ecn() {
        assert!(CongestionControl::Dctcp.requires_ecn());
        assert!(!CongestionControl::Cubic.requires_ecn());
    }

    #[test]
    fn fake_tool_writes_completion_record() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("0_a_to_b.json");
        let tool = FakeBulkTransferTool::default();
        tool.launch_flow(LaunchSpec {
            flow_idx: 0,
            src: host("h0"),
            dst: host("h1"),
            port: 9000,
            size_bytes: 1_000_000,
            log_path: log_path.clone(),
        })
        .unwrap();
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("flow_complete"));
    }

    #[test]
    fn null_emulator_records_cc_assignment() {
        let mut driver = NullEmulatorDriver::default();
        driver.start(&[host("h0")]).unwrap();
        driver.set_congestion_control(&host("h0"), CongestionControl::Dctcp).unwrap();
        assert_eq!(driver.cc_assignments, vec![("h0".to_string(), CongestionControl::Dctcp)]);
    }
}
