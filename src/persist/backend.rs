//! Storage backend for durable log chunks and state snapshots: a trait so the
//! persist subprocess's main loop isn't wedded to local files, plus the
//! local-filesystem implementation Joblet actually ships.
//!
//! Layout under `data_root/jobs/<job-id>/`:
//!   - `log.<stream>.jsonl` — append-only log chunk records, rotated at
//!     `log_rotate_bytes` (default 10 MiB) into `log.<stream>.<n>.jsonl`.
//!   - `state.json` — latest `Job` snapshot.
//! Rotated files older than `log_retention_days` (default 7) are pruned
//! by `prune_expired`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::errors::{JobletError, Result};
use crate::model::LogChunk;

pub trait StorageBackend: Send + Sync {
    fn append_log_chunks(&self, job_id: Uuid, chunks: &[LogChunk]) -> Result<()>;
    fn write_state_snapshot(&self, job_id: Uuid, snapshot: &[u8]) -> Result<()>;
    fn prune_expired(&self, retention: Duration) -> Result<usize>;
}

pub struct LocalFileBackend {
    data_root: PathBuf,
    rotate_bytes: u64,
}

impl LocalFileBackend {
    pub fn new(data_root: PathBuf, rotate_bytes: u64) -> Self {
        LocalFileBackend { data_root, rotate_bytes }
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.data_root.join("jobs").join(job_id.to_string())
    }

    fn log_path(&self, job_id: Uuid, stream: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("log.{stream}.jsonl"))
    }

    fn rotate_if_needed(&self, path: &Path) -> Result<()> {
        let Ok(meta) = fs::metadata(path) else { return Ok(()) };
        if meta.len() < self.rotate_bytes {
            return Ok(());
        }
        let mut n = 1u32;
        loop {
            let candidate = path.with_extension(format!("{n}.jsonl"));
            if !candidate.exists() {
                fs::rename(path, &candidate)
                    .map_err(|e| JobletError::upstream_io_err("rotate log file", e))?;
                return Ok(());
            }
            n += 1;
        }
    }
}

impl StorageBackend for LocalFileBackend {
    fn append_log_chunks(&self, job_id: Uuid, chunks: &[LogChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).map_err(|e| JobletError::upstream_io_err("create job log dir", e))?;

        let mut by_stream: std::collections::BTreeMap<&'static str, Vec<&LogChunk>> = Default::default();
        for chunk in chunks {
            let stream_name = match chunk.stream {
                crate::model::LogStream::Stdout => "stdout",
                crate::model::LogStream::Stderr => "stderr",
            };
            by_stream.entry(stream_name).or_default().push(chunk);
        }

        for (stream_name, stream_chunks) in by_stream {
            let path = self.log_path(job_id, stream_name);
            self.rotate_if_needed(&path)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| JobletError::upstream_io_err("open log file", e))?;
            for chunk in stream_chunks {
                let line = serde_json::to_string(chunk)
                    .map_err(|e| JobletError::internal(format!("serialize log chunk: {e}")))?;
                writeln!(file, "{line}").map_err(|e| JobletError::upstream_io_err("append log chunk", e))?;
            }
        }
        Ok(())
    }

    fn write_state_snapshot(&self, job_id: Uuid, snapshot: &[u8]) -> Result<()> {
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir).map_err(|e| JobletError::upstream_io_err("create job dir", e))?;
        let tmp_path = dir.join("state.json.tmp");
        let final_path = dir.join("state.json");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| JobletError::upstream_io_err("create state tmp", e))?;
            tmp.write_all(snapshot).map_err(|e| JobletError::upstream_io_err("write state tmp", e))?;
            tmp.sync_data().ok();
        }
        fs::rename(&tmp_path, &final_path).map_err(|e| JobletError::upstream_io_err("rename state snapshot", e))
    }

    fn prune_expired(&self, retention: Duration) -> Result<usize> {
        let jobs_dir = self.data_root.join("jobs");
        let Ok(entries) = fs::read_dir(&jobs_dir) else { return Ok(0) };
        let now = SystemTime::now();
        let mut pruned = 0;
        for entry in entries.flatten() {
            let Ok(dir_entries) = fs::read_dir(entry.path()) else { continue };
            for file_entry in dir_entries.flatten() {
                let path = file_entry.path();
                let is_rotated_log = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("log.") && n.matches('.').count() >= 2 && n != "state.json")
                    .unwrap_or(false);
                if !is_rotated_log {
                    continue;
                }
                if let Ok(meta) = file_entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        if now.duration_since(modified).unwrap_or_default() > retention {
                            if fs::remove_file(&path).is_ok() {
                                pruned += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogStream;

    fn chunk(seq: u64) -> LogChunk {
        LogChunk {
            job_id: Uuid::nil(),
            stream: LogStream::Stdout,
            sequence: seq,
            wall_ns: 0,
            bytes: b"hello".to_vec(),
        }
    }

    #[test]
    fn append_and_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().to_path_buf(), 10 * 1024 * 1024);
        let job_id = Uuid::new_v4();

        backend.append_log_chunks(job_id, &[chunk(0), chunk(1)]).unwrap();
        let log_path = backend.log_path(job_id, "stdout");
        let contents = fs::read_to_string(log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        backend.write_state_snapshot(job_id, b"{\"status\":\"RUNNING\"}").unwrap();
        let state_path = backend.job_dir(job_id).join("state.json");
        assert_eq!(fs::read_to_string(state_path).unwrap(), "{\"status\":\"RUNNING\"}");
    }

    #[test]
    fn prune_expired_removes_only_rotated_logs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().to_path_buf(), 1); // rotate immediately
        let job_id = Uuid::new_v4();
        backend.append_log_chunks(job_id, &[chunk(0)]).unwrap();
        backend.append_log_chunks(job_id, &[chunk(1)]).unwrap(); // triggers rotation of the first write

        let pruned = backend.prune_expired(Duration::from_secs(0)).unwrap();
        assert!(pruned >= 1);
    }
}
