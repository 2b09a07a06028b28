//! Core data model: Job, Volume, Network, Workflow, log chunks,
//! metric samples, and their constituent value types.
//!
//! Every persisted/wire type here is a plain value type — the
//! State Store hands out owned clones by UUID rather than long-lived
//! references, eliminating reference cycles between a job, its cgroup
//! handle, its network allocation, and its subscribers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Forward-only lifecycle states, with one bidirectional exception:
/// `INITIALIZING -> SCHEDULED <-> RUNNING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Initializing,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initializing => "INITIALIZING",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if *self == next {
            return true;
        }
        match (*self, next) {
            (Initializing, Scheduled | Running | Failed | Stopped) => true,
            (Scheduled, Running | Failed | Stopped) => true,
            (Running, Scheduled) => true, // the one permitted backward hop
            (Running, Completed | Failed | Stopped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Standard,
    RuntimeBuild,
}

/// CPU/memory/IO/core-pin limits, declared and effective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// 0 = unlimited.
    pub cpu_percent: u32,
    pub memory_mb: u64,
    /// Bytes/sec; 0 = unlimited.
    pub io_bytes_per_sec: u64,
    /// CPU-set notation, e.g. "0-3,7"; empty = no pinning.
    pub cpuset: String,
}

/// An upload manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub path: String,
    pub mode: u32,
    pub is_directory: bool,
    pub size: u64,
}

/// Partitioned environment: regular vars plus masked-secret vars.
/// Secret values are exported to the child process but never reported back
/// in status/list output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEnvironment {
    pub vars: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

impl JobEnvironment {
    /// All variables (regular + secret) for actually launching the process.
    pub fn effective(&self) -> BTreeMap<String, String> {
        let mut all = self.vars.clone();
        all.extend(self.secrets.clone());
        all
    }

    /// Variables safe to report: secret values replaced with "***".
    pub fn masked(&self) -> BTreeMap<String, String> {
        let mut all = self.vars.clone();
        for key in self.secrets.keys() {
            all.insert(key.clone(), "***".to_string());
        }
        all
    }
}

/// A request to run a job, before it has been assigned an identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub environment: JobEnvironment,
    pub runtime: Option<String>,
    pub volumes: Vec<String>,
    pub network: Option<String>,
    pub limits: ResourceLimits,
    pub uploads: Vec<UploadEntry>,
    /// RFC 3339 wall time; empty = run immediately.
    pub schedule: Option<String>,
    pub job_type: JobType,
}

impl Default for JobType {
    fn default() -> Self {
        JobType::Standard
    }
}

/// The atomic unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub environment: JobEnvironment,
    pub runtime: Option<String>,
    pub volumes: Vec<String>,
    pub network: Option<String>,
    pub declared_limits: ResourceLimits,
    pub effective_limits: ResourceLimits,
    pub uploads: Vec<UploadEntry>,
    /// RFC 3339 wall time this job was submitted to run at; `None` means
    /// "as soon as possible".
    pub schedule: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub pid: Option<i32>,
    pub cgroup_path: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub exit_code: Option<i32>,
    pub last_error: Option<JobErrorInfo>,
    pub network_allocation: Option<NetworkAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorInfo {
    pub kind: String,
    pub message: String,
}

impl Job {
    pub fn new(id: Uuid, spec: JobSpec, created_at: String) -> Self {
        Job {
            id,
            name: spec.name,
            command: spec.command,
            args: spec.args,
            environment: spec.environment,
            runtime: spec.runtime,
            volumes: spec.volumes,
            network: spec.network,
            declared_limits: spec.limits.clone(),
            effective_limits: spec.limits,
            uploads: spec.uploads,
            schedule: spec.schedule,
            job_type: spec.job_type,
            status: JobStatus::Initializing,
            pid: None,
            cgroup_path: None,
            created_at,
            started_at: None,
            ended_at: None,
            exit_code: None,
            last_error: None,
            network_allocation: None,
        }
    }
}

/// A named, typed storage area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Filesystem,
    Tmpfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub kind: VolumeKind,
    pub host_path: String,
    pub size_mb: u64,
    /// Reference count of jobs currently mounting this volume.
    #[serde(skip)]
    pub ref_count: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl Volume {
    pub fn new(name: String, kind: VolumeKind, host_path: String, size_mb: u64) -> Self {
        Volume {
            name,
            kind,
            host_path,
            size_mb,
            ref_count: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0)),
        }
    }

    pub fn in_use(&self) -> bool {
        self.ref_count.load(std::sync::atomic::Ordering::SeqCst) > 0
    }
}

/// A named bridge definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub cidr: String,
    pub bridge_name: String,
    pub gateway: String,
}

/// Pairing of a job with an allocated IP and veth pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAllocation {
    pub job_id: Uuid,
    pub network: String,
    pub ip: std::net::Ipv4Addr,
    pub veth_host: String,
    pub veth_guest: String,
}

/// A dependency edge's condition expression, stored as source
/// text; `workflow::expr` compiles it to an `Expr` AST at graph-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub condition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub source_yaml: String,
    pub jobs: Vec<String>,
    pub edges: Vec<DependencyEdge>,
    pub status: WorkflowStatus,
    /// Maps workflow-local job name to the UUID once submitted.
    pub job_ids: BTreeMap<String, Uuid>,
}

/// An opaque, timestamped, job-scoped, monotonically sequenced byte slice
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_id: Uuid,
    pub stream: LogStream,
    pub sequence: u64,
    pub wall_ns: u128,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A point-in-time resource usage sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub job_id: Uuid,
    pub timestamp_ns: u128,
    pub sequence: u64,
    pub cpu_frac: f64,
    pub memory_bytes: u64,
    pub gpu_frac: f64,
    pub disk_io_bytes_per_sec: u64,
    pub net_io_bytes_per_sec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_lifecycle_table() {
        assert!(JobStatus::Initializing.can_transition_to(JobStatus::Scheduled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Scheduled));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Scheduled));
    }

    #[test]
    fn masked_environment_hides_secret_values_but_keeps_keys() {
        let mut env = JobEnvironment::default();
        env.vars.insert("PATH".into(), "/usr/bin".into());
        env.secrets.insert("TOKEN".into(), "sekret".into());

        let masked = env.masked();
        assert_eq!(masked["PATH"], "/usr/bin");
        assert_eq!(masked["TOKEN"], "***");

        let effective = env.effective();
        assert_eq!(effective["TOKEN"], "sekret");
    }

    #[test]
    fn fresh_volume_has_zero_refcount() {
        let v = Volume::new("data".into(), VolumeKind::Filesystem, "/vol/data".into(), 100);
        assert!(!v.in_use());
    }
}
