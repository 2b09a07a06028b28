//! Supervises the `persist` subprocess: spawns it, restarts
//! it if it dies, and on daemon shutdown sends SIGTERM, waits up to 10
//! seconds, then SIGKILLs — the same escalation the job executor applies
//! to job processes (see `src/executor.rs`), reused here for consistency.

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::errors::{JobletError, Result};

pub struct PersistSupervisor {
    persist_exe: std::path::PathBuf,
    socket_path: std::path::PathBuf,
    child: Option<Child>,
}

impl PersistSupervisor {
    pub fn new(persist_exe: std::path::PathBuf, socket_path: std::path::PathBuf) -> Self {
        PersistSupervisor {
            persist_exe,
            socket_path,
            child: None,
        }
    }

    pub fn spawn(&mut self) -> Result<()> {
        let child = Command::new(&self.persist_exe)
            .arg("--socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JobletError::isolation_setup(format!("spawn persist subprocess: {e}")).with_source(e))?;
        self.child = Some(child);
        Ok(())
    }

    /// Restart if the subprocess has exited; no-op otherwise. Returns
    /// whether a restart happened.
    pub fn respawn_if_dead(&mut self) -> Result<bool> {
        let dead = match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        };
        if dead {
            self.spawn()?;
        }
        Ok(dead)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub fn shutdown(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id() as i32;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let deadline = std::time::Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if std::time::Instant::now() >= deadline => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(JobletError::internal(format!("wait persist subprocess: {e}"))),
            }
        }

        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        child
            .wait()
            .map_err(|e| JobletError::internal(format!("wait persist subprocess after kill: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawn_reports_true_when_no_child_yet() {
        let mut sup = PersistSupervisor::new("/bin/true".into(), "/tmp/joblet-test.sock".into());
        let restarted = sup.respawn_if_dead().unwrap();
        assert!(restarted);
    }

    #[test]
    fn shutdown_on_already_exited_child_is_a_noop() {
        let mut sup = PersistSupervisor::new("/bin/true".into(), "/tmp/joblet-test2.sock".into());
        sup.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        sup.shutdown(Duration::from_millis(100)).unwrap();
    }
}
