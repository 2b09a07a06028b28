//! Two-phase job startup: the daemon re-execs itself as a
//! hidden `_init` subcommand, dispatching on the `JOB_PHASE` environment
//! variable set by the parent before `clone()`.
//!
//! `upload` phase: the child runs inside its new namespaces and cgroup
//! with the staging root writable, materializing uploaded files (billed
//! against the job's own cgroup — see `src/upload.rs`).
//!
//! `execute` phase: the child chroots into the finished staging root,
//! mounts a fresh `/proc`, and execves the job's command.

use std::ffi::CString;
use std::io::Read;
use std::path::Path;

use crate::cgroup::CgroupHandle;
use crate::errors::{JobletError, Result};
use crate::model::{Job, ResourceLimits};

pub const JOB_PHASE_VAR: &str = "JOB_PHASE";
pub const JOB_PHASE_UPLOAD: &str = "upload";
pub const JOB_PHASE_EXECUTE: &str = "execute";

/// Namespace flags cloned for every job. `CLONE_NEWNET`
/// is applied only when the job has no dedicated network allocation (the
/// `Full` launcher instead joins a pre-created namespace for networked
/// jobs — see `src/netns.rs::join_namespace`).
pub const NAMESPACE_FLAGS: i32 = libc::CLONE_NEWPID
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWCGROUP;

/// Spawn the job's supervising child: clone with the job's namespace set,
/// assign it to its cgroup, verify membership, then let it proceed to its
/// own re-exec into the `execute` phase. Returns the child PID.
pub fn spawn_supervised_child(
    job: &Job,
    cgroup_root: &Path,
    self_exe: &Path,
) -> Result<(i32, CgroupHandle, ResourceLimits)> {
    let (handle, effective) = CgroupHandle::create(cgroup_root, &job.id.simple().to_string(), &job.declared_limits)?;

    let pid = unsafe { clone_into_namespaces()? };

    if pid == 0 {
        // Child: exec straight into our own binary's hidden re-exec entry
        // point with JOB_PHASE=execute, inheriting the fds the parent set
        // up for stdout/stderr capture.
        let _ = exec_self(self_exe, job, JOB_PHASE_EXECUTE);
        // exec_self only returns on failure.
        std::process::exit(127);
    }

    handle.assign(pid)?;
    handle.verify_membership(pid)?;

    Ok((pid, handle, effective))
}

/// Run from inside the re-exec'd child: chroot into
/// the staged root, mount a fresh `/proc`, then execve the job's command.
/// Never returns on success.
pub fn run_execute_phase(staged_root: &Path, command: &str, args: &[String], env: &[(String, String)]) -> Result<()> {
    chroot_and_chdir(staged_root)?;
    mount_proc()?;
    execve_command(command, args, env)
}

/// Run the upload-materialization phase inside the job's own cgroup
///: the parent has already moved this process into the
/// job's cgroup and namespaces before re-exec, so reads/writes here are
/// billed to the job.
pub fn run_upload_phase(staged_root: &Path, manifest_path: &Path, archive_path: &Path) -> Result<()> {
    let manifest_text = std::fs::read_to_string(manifest_path)
        .map_err(|e| JobletError::isolation_setup(format!("read manifest {}: {e}", manifest_path.display())).with_source(e))?;
    let entries = crate::upload::decode_manifest(&manifest_text)?;

    let mut archive = std::fs::File::open(archive_path)
        .map_err(|e| JobletError::isolation_setup(format!("open archive {}: {e}", archive_path.display())).with_source(e))?;

    for entry in &entries {
        if entry.is_directory {
            crate::upload::materialize_entry(staged_root, entry, &mut std::io::empty())?;
            continue;
        }
        let mut limited = (&mut archive).take(entry.size);
        crate::upload::materialize_entry(staged_root, entry, &mut limited)?;
    }
    Ok(())
}

/// SAFETY: must be called before any additional threads are spawned in
/// the calling process; this mirrors the single-threaded-fork discipline
/// every `libc::clone`/`fork` based supervisor requires.
unsafe fn clone_into_namespaces() -> Result<i32> {
    let pid = libc::fork();
    if pid < 0 {
        return Err(JobletError::isolation_setup(format!(
            "fork failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if pid == 0 {
        if libc::unshare(NAMESPACE_FLAGS) != 0 {
            eprintln!("unshare failed: {}", std::io::Error::last_os_error());
            libc::_exit(126);
        }
    }
    Ok(pid)
}

fn exec_self(self_exe: &Path, job: &Job, phase: &str) -> Result<()> {
    let exe = CString::new(self_exe.as_os_str().as_encoded_bytes())
        .map_err(|e| JobletError::internal(format!("self-exe path has nul byte: {e}")))?;
    let job_id_arg = CString::new(job.id.to_string()).unwrap();
    let argv = [exe.as_ptr(), CString::new("_init").unwrap().as_ptr(), job_id_arg.as_ptr(), std::ptr::null()];

    let phase_var = CString::new(format!("{JOB_PHASE_VAR}={phase}")).unwrap();
    let mut envp: Vec<CString> = vec![phase_var];
    for (k, v) in &job.environment.effective() {
        if let Ok(c) = CString::new(format!("{k}={v}")) {
            envp.push(c);
        }
    }
    let mut envp_ptrs: Vec<*const i8> = envp.iter().map(|c| c.as_ptr()).collect();
    envp_ptrs.push(std::ptr::null());

    unsafe {
        libc::execve(exe.as_ptr(), argv.as_ptr(), envp_ptrs.as_ptr());
    }
    Err(JobletError::isolation_setup(format!(
        "execve self failed: {}",
        std::io::Error::last_os_error()
    )))
}

fn chroot_and_chdir(root: &Path) -> Result<()> {
    let c_root = CString::new(root.as_os_str().as_encoded_bytes())
        .map_err(|e| JobletError::internal(format!("root path has nul byte: {e}")))?;
    unsafe {
        if libc::chroot(c_root.as_ptr()) != 0 {
            return Err(JobletError::isolation_setup(format!(
                "chroot({}) failed: {}",
                root.display(),
                std::io::Error::last_os_error()
            )));
        }
        let slash = CString::new("/").unwrap();
        if libc::chdir(slash.as_ptr()) != 0 {
            return Err(JobletError::isolation_setup(format!(
                "chdir(/) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn mount_proc() -> Result<()> {
    let source = CString::new("proc").unwrap();
    let target = CString::new("/proc").unwrap();
    let fstype = CString::new("proc").unwrap();
    unsafe {
        if libc::mount(source.as_ptr(), target.as_ptr(), fstype.as_ptr(), 0, std::ptr::null()) != 0 {
            return Err(JobletError::isolation_setup(format!(
                "mount proc failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn execve_command(command: &str, args: &[String], env: &[(String, String)]) -> Result<()> {
    let c_command = CString::new(command)
        .map_err(|e| JobletError::validation(format!("command has nul byte: {e}")))?;
    let mut c_args: Vec<CString> = vec![c_command.clone()];
    for a in args {
        c_args.push(CString::new(a.as_str()).map_err(|e| JobletError::validation(format!("arg has nul byte: {e}")))?);
    }
    let mut argv: Vec<*const i8> = c_args.iter().map(|c| c.as_ptr()).collect();
    argv.push(std::ptr::null());

    let c_env: Vec<CString> = env
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    let mut envp: Vec<*const i8> = c_env.iter().map(|c| c.as_ptr()).collect();
    envp.push(std::ptr::null());

    unsafe {
        libc::execve(c_command.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    Err(JobletError::isolation_setup(format!(
        "execve({command}) failed: {}",
        std::io::Error::last_os_error()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_flags_cover_the_spec_set() {
        assert_ne!(NAMESPACE_FLAGS & libc::CLONE_NEWPID, 0);
        assert_ne!(NAMESPACE_FLAGS & libc::CLONE_NEWNS, 0);
        assert_ne!(NAMESPACE_FLAGS & libc::CLONE_NEWUTS, 0);
        assert_ne!(NAMESPACE_FLAGS & libc::CLONE_NEWIPC, 0);
        assert_ne!(NAMESPACE_FLAGS & libc::CLONE_NEWCGROUP, 0);
    }
}
