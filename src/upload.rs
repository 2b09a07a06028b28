//! Upload manifest handling: encoding/decoding the list of
//! files a job brings with it, and writing them into the job's staged
//! root in 32 KiB chunks so the write itself is billed against the job's
//! own cgroup rather than a parent-streamed named pipe, which would bill
//! I/O to the daemon's own cgroup instead — the child-phase path was
//! chosen as canonical for exactly that reason.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::errors::{JobletError, Result};
use crate::model::UploadEntry;

const CHUNK_SIZE: usize = 32 * 1024;
const FSYNC_EVERY_N_CHUNKS: usize = 16;

/// Serialize the manifest to the newline-delimited JSON form stored
/// alongside a job's upload archive.
pub fn encode_manifest(entries: &[UploadEntry]) -> Result<String> {
    let mut out = String::new();
    for entry in entries {
        let line = serde_json::to_string(entry)
            .map_err(|e| JobletError::internal(format!("encode upload entry: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_manifest(text: &str) -> Result<Vec<UploadEntry>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| JobletError::validation(format!("malformed upload manifest line: {e}")))
        })
        .collect()
}

/// Materialize one upload entry under `staging_root`, reading its bytes
/// from `source` in fixed-size chunks. A short write (the underlying
/// filesystem refusing a chunk, e.g. `ENOSPC`) is reported as
/// `RESOURCE_EXHAUSTED`.
pub fn materialize_entry(staging_root: &Path, entry: &UploadEntry, source: &mut dyn Read) -> Result<()> {
    let dest = staging_root.join(entry.path.trim_start_matches('/'));
    if entry.is_directory {
        fs::create_dir_all(&dest)
            .map_err(|e| JobletError::isolation_setup(format!("mkdir {}: {e}", dest.display())).with_source(e))?;
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| JobletError::isolation_setup(format!("mkdir {}: {e}", parent.display())).with_source(e))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(entry.mode)
        .open(&dest)
        .map_err(|e| JobletError::isolation_setup(format!("create {}: {e}", dest.display())).with_source(e))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    let mut chunks_since_sync = 0usize;

    loop {
        let n = source
            .read(&mut buf)
            .map_err(|e| JobletError::upstream_io_err(format!("read upload source for {}: {e}", entry.path), e))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero || e.raw_os_error() == Some(libc::ENOSPC) {
                JobletError::resource_exhausted(format!("short write for {}: {e}", entry.path))
            } else {
                JobletError::isolation_setup(format!("write {}: {e}", dest.display())).with_source(e)
            }
        })?;
        written += n as u64;
        chunks_since_sync += 1;
        if chunks_since_sync >= FSYNC_EVERY_N_CHUNKS {
            file.sync_data().ok();
            chunks_since_sync = 0;
        }
    }
    file.sync_data().ok();

    if written != entry.size {
        return Err(JobletError::resource_exhausted(format!(
            "upload entry {} expected {} bytes, wrote {}",
            entry.path, entry.size, written
        )));
    }

    fs::set_permissions(&dest, fs::Permissions::from_mode(entry.mode))
        .map_err(|e| JobletError::isolation_setup(format!("chmod {}: {e}", dest.display())).with_source(e))?;
    Ok(())
}

/// Convenience wrapper reading an entry's bytes from an already-open file
/// (used when the manifest references paths inside an extracted archive).
pub fn materialize_from_file(staging_root: &Path, entry: &UploadEntry, mut src: File) -> Result<()> {
    materialize_entry(staging_root, entry, &mut src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn manifest_round_trips() {
        let entries = vec![
            UploadEntry { path: "a.txt".into(), mode: 0o644, is_directory: false, size: 3 },
            UploadEntry { path: "sub".into(), mode: 0o755, is_directory: true, size: 0 },
        ];
        let encoded = encode_manifest(&entries).unwrap();
        let decoded = decode_manifest(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path, "a.txt");
        assert!(decoded[1].is_directory);
    }

    #[test]
    fn materialize_writes_expected_bytes_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let entry = UploadEntry { path: "out.bin".into(), mode: 0o600, is_directory: false, size: 5 };
        let mut src = Cursor::new(b"hello".to_vec());
        materialize_entry(dir.path(), &entry, &mut src).unwrap();

        let contents = fs::read(dir.path().join("out.bin")).unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn size_mismatch_is_resource_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let entry = UploadEntry { path: "short.bin".into(), mode: 0o600, is_directory: false, size: 100 };
        let mut src = Cursor::new(b"short".to_vec());
        let err = materialize_entry(dir.path(), &entry, &mut src).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn decode_rejects_malformed_line() {
        assert!(decode_manifest("not json\n").is_err());
    }
}
