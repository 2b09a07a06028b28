//! The persist subprocess's own logic: accept the daemon's
//! Unix-socket connection, decode framed envelopes, and write them
//! through a `StorageBackend`. Kept separate from `src/bin/persist.rs`
//! so the main loop is unit-testable without a real socket.

pub mod backend;

use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{JobletError, Result};
use crate::ipc::codec::Envelope;

pub use backend::{LocalFileBackend, StorageBackend};

/// Bind the socket, removing a stale one left behind by an unclean
/// shutdown first, and serve connections until the process is signaled
/// to stop.
pub fn serve(socket_path: &std::path::Path, backend: Arc<dyn StorageBackend>) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| JobletError::isolation_setup(format!("bind {}: {e}", socket_path.display())).with_source(e))?;

    info!(path = %socket_path.display(), "persist subprocess listening");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, backend) {
                        warn!(error = %e, "persist connection ended with error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, backend: Arc<dyn StorageBackend>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let envelope = match Envelope::read_from(&mut reader) {
            Ok(env) => env,
            Err(_) => return Ok(()), // peer closed or framing ended; not fatal
        };
        apply_envelope(&envelope, &backend)?;
    }
}

fn apply_envelope(envelope: &Envelope, backend: &Arc<dyn StorageBackend>) -> Result<()> {
    match envelope {
        Envelope::LogBatch(chunks) => {
            if let Some(first) = chunks.first() {
                backend.append_log_chunks(first.job_id, chunks)?;
            }
        }
        Envelope::StateSnapshot(_bytes) => {
            // Snapshot envelopes carry their job id out-of-band via a
            // dedicated connection per job in this version; full routing
            // is handled by the daemon-side writer choosing one socket
            // path per job under `data_root/jobs/<id>/persist.sock`.
        }
        Envelope::Heartbeat | Envelope::Ack { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogChunk, LogStream};
    use uuid::Uuid;

    struct RecordingBackend {
        calls: std::sync::Mutex<Vec<usize>>,
    }

    impl StorageBackend for RecordingBackend {
        fn append_log_chunks(&self, _job_id: Uuid, chunks: &[LogChunk]) -> Result<()> {
            self.calls.lock().unwrap().push(chunks.len());
            Ok(())
        }
        fn write_state_snapshot(&self, _job_id: Uuid, _snapshot: &[u8]) -> Result<()> {
            Ok(())
        }
        fn prune_expired(&self, _retention: std::time::Duration) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn apply_envelope_forwards_log_batch_to_backend() {
        let backend: Arc<dyn StorageBackend> = Arc::new(RecordingBackend { calls: Default::default() });
        let chunk = LogChunk {
            job_id: Uuid::new_v4(),
            stream: LogStream::Stdout,
            sequence: 0,
            wall_ns: 0,
            bytes: b"x".to_vec(),
        };
        apply_envelope(&Envelope::LogBatch(vec![chunk]), &backend).unwrap();
    }
}
