//! Job execution: `start`/`stop`/`delete`/
//! `get`/`list`, a scheduling timer for jobs with a future `schedule`
//! time, and the `IsolationMode` capability split that lets the whole
//! engine run (and be tested) without root.
//!
//! `IsolationMode::Full` drives real namespaces/cgroups/chroot through
//! `src/init.rs`/`src/cgroup.rs`/`src/netns.rs`. `IsolationMode::Bypass`
//! runs the job's command as a plain child process with no isolation at
//! all, so the rest of the engine can run and be tested on a machine
//! without root or a Linux kernel new enough for unprivileged namespaces.
//!
//! Every launched job gets its own reaper thread that blocks on
//! `waitpid`, since both launchers hand back a pid that is a direct
//! child of this process (`FullLauncher`'s via a raw `fork()` in
//! `src/init.rs`, `BypassLauncher`'s via `std::process::Command`) — one
//! reaping strategy covers both.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::cgroup::CgroupHandle;
use crate::errors::{JobletError, Result};
use crate::logpipeline::LogPipeline;
use crate::model::{Job, JobSpec, JobStatus, LogChunk, LogStream};
use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    Full,
    Bypass,
}

impl From<crate::config::IsolationModeConfig> for IsolationMode {
    fn from(cfg: crate::config::IsolationModeConfig) -> Self {
        match cfg {
            crate::config::IsolationModeConfig::Full => IsolationMode::Full,
            crate::config::IsolationModeConfig::Bypass => IsolationMode::Bypass,
        }
    }
}

/// The capability-set seam between "really isolate this job" and "just
/// run the command".
pub trait JobLauncher: Send + Sync {
    fn launch(&self, job: &Job) -> Result<(i32, LaunchHandle, JobPipes)>;
    fn terminate(&self, handle: &LaunchHandle, pid: i32) -> Result<()>;
}

/// Whatever per-job OS resources a launcher created and must tear down.
pub enum LaunchHandle {
    Full { cgroup: CgroupHandle },
    Bypass,
}

/// The stdout/stderr read ends a launcher can hand back for log capture.
/// Either may be `None` when a launcher has no way to capture that
/// stream.
pub struct JobPipes {
    pub stdout: Option<std::process::ChildStdout>,
    pub stderr: Option<std::process::ChildStderr>,
}

impl JobPipes {
    fn none() -> Self {
        JobPipes { stdout: None, stderr: None }
    }
}

pub struct FullLauncher {
    pub cgroup_root: std::path::PathBuf,
    pub self_exe: std::path::PathBuf,
}

impl JobLauncher for FullLauncher {
    fn launch(&self, job: &Job) -> Result<(i32, LaunchHandle, JobPipes)> {
        let (pid, cgroup, _effective) = crate::init::spawn_supervised_child(job, &self.cgroup_root, &self.self_exe)?;
        // The namespaced child's stdout/stderr aren't plumbed back to this
        // process as pipes (that would require allocating and dup2-ing
        // them before the pre-fork unshare in `src/init.rs`); log capture
        // is `BypassLauncher`-only for now.
        Ok((pid, LaunchHandle::Full { cgroup }, JobPipes::none()))
    }

    fn terminate(&self, _handle: &LaunchHandle, pid: i32) -> Result<()> {
        send_signal(pid, libc::SIGTERM);
        Ok(())
    }
}

/// Runs the job's command directly, with its declared environment, no
/// namespaces/cgroup/chroot — the macOS-development / root-free test
/// path.
pub struct BypassLauncher;

impl JobLauncher for BypassLauncher {
    fn launch(&self, job: &Job) -> Result<(i32, LaunchHandle, JobPipes)> {
        let mut cmd = Command::new(&job.command);
        cmd.args(&job.args)
            .envs(job.environment.effective())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child: Child = cmd
            .spawn()
            .map_err(|e| JobletError::isolation_setup(format!("spawn job command: {e}")).with_source(e))?;
        let pid = child.id() as i32;
        let pipes = JobPipes { stdout: child.stdout.take(), stderr: child.stderr.take() };
        // Reaping happens on a dedicated thread that calls `waitpid`
        // directly on `pid` (see `Executor::spawn_reaper`); forgetting
        // `Child` here avoids a double-reap race against its own `Drop`
        // impl, which would otherwise also try to wait() on it.
        std::mem::forget(child);
        Ok((pid, LaunchHandle::Bypass, pipes))
    }

    fn terminate(&self, _handle: &LaunchHandle, pid: i32) -> Result<()> {
        send_signal(pid, libc::SIGTERM);
        Ok(())
    }
}

fn send_signal(pid: i32, sig: i32) {
    unsafe {
        libc::kill(pid, sig);
    }
}

/// The 10-second SIGTERM-then-SIGKILL escalation `stop` applies,
/// shared by the `ipc::supervisor` module for the persist
/// subprocess.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// How often the scheduling timer checks for due `Scheduled` jobs.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Bytes read per `read(2)` call when draining a job's stdout/stderr pipe.
const LOG_READ_CHUNK: usize = 8192;

struct JobHandle {
    pid: i32,
    launch: LaunchHandle,
    stop_requested: Arc<AtomicBool>,
    done_rx: crossbeam_channel::Receiver<()>,
}

struct ExecutorInner {
    store: Arc<StateStore>,
    launcher: Arc<dyn JobLauncher>,
    log_pipeline: Arc<LogPipeline>,
    persist_tx: tokio::sync::mpsc::UnboundedSender<Vec<LogChunk>>,
    handles: Mutex<HashMap<Uuid, JobHandle>>,
    /// Jobs whose batcher task has already been spawned. A job that never
    /// writes to stdout/stderr never gets an entry here, which keeps
    /// `LogPipeline::topic_for` from ever running for it — `tail_logs`
    /// relies on "no topic" to mean "not found" for such jobs.
    batchers_spawned: Mutex<std::collections::HashSet<Uuid>>,
}

/// Cheap to clone (backed by a single `Arc`); the scheduling timer and
/// each job's reaper/log-reader threads hold their own clone.
#[derive(Clone)]
pub struct Executor(Arc<ExecutorInner>);

impl Executor {
    pub fn new(store: Arc<StateStore>, launcher: Arc<dyn JobLauncher>, log_pipeline: Arc<LogPipeline>) -> Self {
        // Batches that aren't claimed by a durable persistence writer are
        // simply dropped; `flush_once` already tolerates a closed
        // receiver. Wiring this to the `persist` subprocess is a
        // follow-up, not something this executor owns.
        let (persist_tx, _persist_rx) = tokio::sync::mpsc::unbounded_channel();

        let executor = Executor(Arc::new(ExecutorInner {
            store,
            launcher,
            log_pipeline,
            persist_tx,
            handles: Mutex::new(HashMap::new()),
            batchers_spawned: Mutex::new(std::collections::HashSet::new()),
        }));
        executor.spawn_scheduler();
        executor
    }

    /// Submit and immediately launch a job, unless `spec.schedule` names a
    /// future time, in which case the scheduling timer will launch it
    /// later. Allocates the job's identity here via `idgen::new_job_id`.
    pub fn start(&self, spec: JobSpec) -> Result<Uuid> {
        let id = crate::idgen::new_job_id();
        self.start_with_id(id, spec)?;
        Ok(id)
    }

    /// Like `start`, but for a caller (the workflow resolver) that has
    /// already allocated the job's identity and needs the job actually
    /// created under that same id.
    pub fn start_with_id(&self, id: Uuid, spec: JobSpec) -> Result<()> {
        validate_spec(&spec)?;
        let created_at = now_rfc3339();
        let job = Job::new(id, spec, created_at);
        self.0.store.create_job(job.clone());

        if job_is_due_now(&job) {
            self.launch_job(id)?;
        } else {
            let mut scheduled = job;
            scheduled.status = JobStatus::Scheduled;
            self.0.store.update_job(id, scheduled)?;
        }
        Ok(())
    }

    fn launch_job(&self, id: Uuid) -> Result<()> {
        let mut job = self
            .0
            .store
            .get_job(id)
            .ok_or_else(|| JobletError::not_found(format!("job {id} not found")))?;

        let (pid, handle, pipes) = self.0.launcher.launch(&job)?;

        for name in &job.volumes {
            if let Some(v) = self.0.store.get_volume(name) {
                v.ref_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.0.handles.lock().insert(
            id,
            JobHandle { pid, launch: handle, stop_requested: stop_requested.clone(), done_rx },
        );

        self.spawn_log_readers(id, pipes);
        self.spawn_reaper(id, pid, job.volumes.clone(), stop_requested, done_tx);

        job.pid = Some(pid);
        job.status = JobStatus::Running;
        job.started_at = Some(now_rfc3339());
        self.0.store.update_job(id, job)
    }

    fn spawn_log_readers(&self, id: Uuid, pipes: JobPipes) {
        if let Some(stdout) = pipes.stdout {
            self.spawn_log_reader(id, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = pipes.stderr {
            self.spawn_log_reader(id, LogStream::Stderr, stderr);
        }
    }

    fn spawn_log_reader<R: Read + Send + 'static>(&self, id: Uuid, stream: LogStream, mut reader: R) {
        let executor = self.clone();
        std::thread::spawn(move || {
            let queue = executor.0.log_pipeline.queue_for(id);
            let mut buf = [0u8; LOG_READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        executor.ensure_batcher(id);
                        let chunk = LogChunk {
                            job_id: id,
                            stream,
                            sequence: queue.next_sequence(),
                            wall_ns: wall_clock_ns(),
                            bytes: buf[..n].to_vec(),
                        };
                        let _ = queue.push(chunk);
                    }
                    Err(_) => break,
                }
            }
        });
    }

    /// Spawn the batcher task the first time a job actually produces a log
    /// chunk. A job that never writes to stdout/stderr never reaches this,
    /// so it never gets a `Topic` registered in the log pipeline.
    fn ensure_batcher(&self, id: Uuid) {
        let mut spawned = self.0.batchers_spawned.lock();
        if spawned.insert(id) {
            self.0.log_pipeline.spawn_batcher(id, self.0.persist_tx.clone());
        }
    }

    /// Block the job's exit, reap it, and record the outcome. Runs on its
    /// own thread for the lifetime of the job.
    fn spawn_reaper(
        &self,
        id: Uuid,
        pid: i32,
        volumes: Vec<String>,
        stop_requested: Arc<AtomicBool>,
        done_tx: crossbeam_channel::Sender<()>,
    ) {
        let executor = self.clone();
        std::thread::spawn(move || {
            let mut status: libc::c_int = 0;
            loop {
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret == pid {
                    break;
                }
                if ret == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break;
            }

            let exit_code = if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            };

            if let Some(mut job) = executor.0.store.get_job(id) {
                job.exit_code = Some(exit_code);
                job.ended_at = Some(now_rfc3339());
                job.status = if stop_requested.load(Ordering::SeqCst) {
                    JobStatus::Stopped
                } else if exit_code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                let _ = executor.0.store.update_job(id, job);
            }

            for name in &volumes {
                if let Some(v) = executor.0.store.get_volume(name) {
                    v.ref_count.fetch_sub(1, Ordering::SeqCst);
                }
            }

            if let Some(handle) = executor.0.handles.lock().remove(&id) {
                if let LaunchHandle::Full { cgroup } = handle.launch {
                    cgroup.remove().ok();
                }
            }
            executor.0.batchers_spawned.lock().remove(&id);
            executor.0.log_pipeline.teardown(id);

            let _ = done_tx.send(());
        });
    }

    /// SIGTERM, wait `STOP_GRACE`, then SIGKILL. Marks `stop_requested`
    /// before signaling so the reaper records `Stopped` rather than
    /// `Failed` for the resulting exit.
    pub fn stop(&self, id: Uuid) -> Result<()> {
        let job = self
            .0
            .store
            .get_job(id)
            .ok_or_else(|| JobletError::not_found(format!("job {id} not found")))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let (pid, done_rx) = {
            let handles = self.0.handles.lock();
            let handle = handles
                .get(&id)
                .ok_or_else(|| JobletError::conflict(format!("job {id} has no running process")))?;
            handle.stop_requested.store(true, Ordering::SeqCst);
            self.0.launcher.terminate(&handle.launch, handle.pid)?;
            (handle.pid, handle.done_rx.clone())
        };

        if done_rx.recv_timeout(STOP_GRACE).is_err() {
            send_signal(pid, libc::SIGKILL);
            let _ = done_rx.recv_timeout(Duration::from_secs(5));
        }
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let job = self
            .0
            .store
            .get_job(id)
            .ok_or_else(|| JobletError::not_found(format!("job {id} not found")))?;
        if !job.status.is_terminal() {
            return Err(JobletError::conflict(format!(
                "job {id} must be stopped before it can be deleted"
            )));
        }
        self.0.store.delete_job(id);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.0.store.get_job(id)
    }

    pub fn list(&self) -> Vec<Job> {
        self.0.store.list_jobs()
    }

    /// Launch any job whose scheduled time has arrived.
    pub fn poll_scheduled(&self) -> Result<usize> {
        let mut launched = 0;
        for job in self.0.store.list_jobs() {
            if job.status == JobStatus::Scheduled && job_is_due_now(&job) {
                self.launch_job(job.id)?;
                launched += 1;
            }
        }
        Ok(launched)
    }

    /// Background timer driving `poll_scheduled`. Holds only a weak
    /// reference, so it exits once every other `Executor` clone is gone.
    fn spawn_scheduler(&self) {
        let weak = Arc::downgrade(&self.0);
        std::thread::spawn(move || loop {
            std::thread::sleep(SCHEDULER_TICK);
            match weak.upgrade() {
                Some(inner) => {
                    let _ = Executor(inner).poll_scheduled();
                }
                None => break,
            }
        });
    }
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.command.trim().is_empty() {
        return Err(JobletError::validation("job command must not be empty"));
    }
    if let Some(schedule) = &spec.schedule {
        if parse_rfc3339_unix_secs(schedule).is_none() {
            return Err(JobletError::validation(format!("invalid schedule '{schedule}': not RFC 3339")));
        }
    }
    Ok(())
}

fn job_is_due_now(job: &Job) -> bool {
    match &job.schedule {
        None => true,
        // A schedule string that fails to parse was already rejected by
        // `validate_spec` at submission time, so this should be
        // unreachable for a stored job; treat it as due rather than
        // wedging the job forever.
        Some(ts) => parse_rfc3339_unix_secs(ts).map(|at| at <= unix_now_secs()).unwrap_or(true),
    }
}

fn wall_clock_ns() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn unix_now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_rfc3339() -> String {
    // A bare decimal seconds-since-epoch string rather than an actual
    // calendar rendering: avoids pulling in `chrono`/`time` purely for
    // display formatting, since nothing parses `created_at`/`ended_at`
    // back into a date today.
    format!("{}", unix_now_secs())
}

/// Parse an RFC 3339 UTC timestamp (`Z` or `+HH:MM`/`-HH:MM` offset,
/// optional fractional seconds) into seconds since the Unix epoch.
fn parse_rfc3339_unix_secs(s: &str) -> Option<i64> {
    if s.len() < 20 {
        return None;
    }
    let bytes = s.as_bytes();
    let year: i64 = s.get(0..4)?.parse().ok()?;
    if bytes.get(4) != Some(&b'-') {
        return None;
    }
    let month: u32 = s.get(5..7)?.parse().ok()?;
    if bytes.get(7) != Some(&b'-') {
        return None;
    }
    let day: u32 = s.get(8..10)?.parse().ok()?;
    match bytes.get(10) {
        Some(b'T') | Some(b't') | Some(b' ') => {}
        _ => return None,
    }
    let hour: i64 = s.get(11..13)?.parse().ok()?;
    if bytes.get(13) != Some(&b':') {
        return None;
    }
    let minute: i64 = s.get(14..16)?.parse().ok()?;
    if bytes.get(16) != Some(&b':') {
        return None;
    }
    let second: i64 = s.get(17..19)?.parse().ok()?;

    let mut rest = &s[19..];
    if let Some(stripped) = rest.strip_prefix('.') {
        let digits_end = stripped.find(|c: char| !c.is_ascii_digit()).unwrap_or(stripped.len());
        rest = &stripped[digits_end..];
    }

    let offset_secs: i64 = if rest.eq_ignore_ascii_case("z") {
        0
    } else if rest.len() == 6 && (rest.as_bytes()[0] == b'+' || rest.as_bytes()[0] == b'-') {
        let sign = if rest.as_bytes()[0] == b'-' { -1 } else { 1 };
        if rest.as_bytes()[3] != b':' {
            return None;
        }
        let off_h: i64 = rest.get(1..3)?.parse().ok()?;
        let off_m: i64 = rest.get(4..6)?.parse().ok()?;
        sign * (off_h * 3600 + off_m * 60)
    } else {
        return None;
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || !(0..=23).contains(&hour) || !(0..=59).contains(&minute) || !(0..=60).contains(&second)
    {
        return None;
    }

    let days = days_from_civil(year, month, day);
    Some(days * 86_400 + hour * 3600 + minute * 60 + second - offset_secs)
}

/// Howard Hinnant's `days_from_civil`: days since the Unix epoch for a
/// proleptic-Gregorian UTC calendar date, valid across the full `i64`
/// year range without a lookup table.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let (m, d) = (m as i64, d as i64);
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_executor() -> (Executor, tokio::runtime::Runtime) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let log_pipeline = Arc::new(LogPipeline::new(crate::config::LogPipelineConfig::default(), rt.handle().clone()));
        let store = Arc::new(StateStore::new());
        let executor = Executor::new(store, Arc::new(BypassLauncher), log_pipeline);
        (executor, rt)
    }

    #[test]
    fn start_rejects_empty_command() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec { command: "".into(), ..Default::default() };
        assert!(executor.start(spec).is_err());
    }

    #[test]
    fn start_rejects_unparseable_schedule() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec { command: "/bin/true".into(), schedule: Some("not-a-timestamp".into()), ..Default::default() };
        assert!(executor.start(spec).is_err());
    }

    #[test]
    fn start_with_bypass_launcher_runs_true() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec { command: "/bin/true".into(), ..Default::default() };
        let id = executor.start(spec).unwrap();
        let job = executor.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn future_schedule_holds_the_job_as_scheduled() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec {
            command: "/bin/true".into(),
            schedule: Some("2999-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let id = executor.start(spec).unwrap();
        let job = executor.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.pid.is_none());
    }

    #[test]
    fn past_schedule_runs_immediately() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec {
            command: "/bin/true".into(),
            schedule: Some("2000-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let id = executor.start(spec).unwrap();
        let job = executor.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn delete_before_stop_is_rejected() {
        let (executor, _rt) = test_executor();
        let spec = JobSpec { command: "/bin/true".into(), ..Default::default() };
        let id = executor.start(spec).unwrap();
        assert!(executor.delete(id).is_err());
    }

    #[test]
    fn rfc3339_parses_z_and_numeric_offset_to_the_same_instant() {
        let z = parse_rfc3339_unix_secs("2026-01-01T00:00:00Z").unwrap();
        let offset = parse_rfc3339_unix_secs("2026-01-01T02:00:00+02:00").unwrap();
        assert_eq!(z, offset);
    }

    #[test]
    fn rfc3339_rejects_malformed_input() {
        assert!(parse_rfc3339_unix_secs("garbage").is_none());
        assert!(parse_rfc3339_unix_secs("2026-01-01").is_none());
    }
}
