//! The four overflow strategies a bounded per-job log queue can apply
//! once it hits its soft memory cap: compress the backlog in
//! place, spill it to a temp file, sample (keep every Nth chunk), or
//! alert (drop new chunks and record that it happened).

use std::io::Write;
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::{JobletError, Result};
use crate::model::LogChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    Compress,
    Spill,
    Sample,
    Alert,
}

/// What happened to a batch of chunks that arrived after the queue was
/// already at capacity.
pub enum OverflowOutcome {
    /// Chunks were gzip-compressed and are still deliverable, just not as
    /// raw bytes (the consumer decompresses on read).
    Compressed(Vec<u8>),
    /// Chunks were written to a temp file; only the path is kept in memory.
    Spilled(PathBuf),
    /// Only these chunks (already thinned to every Nth) are kept.
    Sampled(Vec<LogChunk>),
    /// Chunks were dropped entirely; the count is for the alert record.
    Alerted(usize),
}

pub fn apply(strategy: OverflowStrategy, chunks: &[LogChunk], sample_every: usize) -> Result<OverflowOutcome> {
    match strategy {
        OverflowStrategy::Compress => Ok(OverflowOutcome::Compressed(compress(chunks)?)),
        OverflowStrategy::Spill => Ok(OverflowOutcome::Spilled(spill(chunks)?)),
        OverflowStrategy::Sample => Ok(OverflowOutcome::Sampled(sample(chunks, sample_every))),
        OverflowStrategy::Alert => Ok(OverflowOutcome::Alerted(chunks.len())),
    }
}

fn compress(chunks: &[LogChunk]) -> Result<Vec<u8>> {
    let joined = serde_json::to_vec(chunks)
        .map_err(|e| JobletError::internal(format!("serialize chunks for compression: {e}")))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&joined)
        .map_err(|e| JobletError::internal(format!("gzip write: {e}")))?;
    encoder
        .finish()
        .map_err(|e| JobletError::internal(format!("gzip finish: {e}")))
}

fn spill(chunks: &[LogChunk]) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("joblet-log-spill-")
        .tempfile()
        .map_err(|e| JobletError::resource_exhausted(format!("create spill file: {e}")))?;
    let bytes = serde_json::to_vec(chunks)
        .map_err(|e| JobletError::internal(format!("serialize chunks for spill: {e}")))?;
    file.write_all(&bytes)
        .map_err(|e| JobletError::resource_exhausted(format!("write spill file: {e}")))?;
    let (_, path) = file
        .keep()
        .map_err(|e| JobletError::internal(format!("persist spill file: {e}")))?;
    Ok(path)
}

fn sample(chunks: &[LogChunk], every: usize) -> Vec<LogChunk> {
    let every = every.max(1);
    chunks
        .iter()
        .step_by(every)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(seq: u64) -> LogChunk {
        LogChunk {
            job_id: Uuid::nil(),
            stream: crate::model::LogStream::Stdout,
            sequence: seq,
            wall_ns: 0,
            bytes: b"x".to_vec(),
        }
    }

    #[test]
    fn sample_keeps_every_nth() {
        let chunks: Vec<_> = (0..10).map(chunk).collect();
        let sampled = sample(&chunks, 3);
        let seqs: Vec<u64> = sampled.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 3, 6, 9]);
    }

    #[test]
    fn alert_reports_dropped_count() {
        let chunks: Vec<_> = (0..5).map(chunk).collect();
        match apply(OverflowStrategy::Alert, &chunks, 1).unwrap() {
            OverflowOutcome::Alerted(n) => assert_eq!(n, 5),
            _ => panic!("expected Alerted"),
        }
    }

    #[test]
    fn compress_produces_nonempty_gzip() {
        let chunks: Vec<_> = (0..3).map(chunk).collect();
        match apply(OverflowStrategy::Compress, &chunks, 1).unwrap() {
            OverflowOutcome::Compressed(bytes) => assert!(!bytes.is_empty()),
            _ => panic!("expected Compressed"),
        }
    }
}
