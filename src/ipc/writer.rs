//! Non-blocking writer side of the daemon/persist IPC boundary: queues envelopes in memory and writes them on a background
//! thread, reconnecting with exponential backoff when the persist
//! subprocess's socket disappears.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::errors::{JobletError, Result};

use super::codec::Envelope;

pub struct IpcWriter {
    tx: Sender<Envelope>,
}

impl IpcWriter {
    /// Spawn the background connection thread and return a handle whose
    /// `send` never blocks the caller (the log pipeline's batcher tasks
    /// in particular must never stall on a slow or absent socket).
    pub fn spawn(socket_path: PathBuf, backoff_min: Duration, backoff_max: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(4096);
        std::thread::spawn(move || connection_loop(socket_path, rx, backoff_min, backoff_max));
        IpcWriter { tx }
    }

    /// Enqueue an envelope. Returns an error only if the internal queue
    /// is full, meaning the persist subprocess has fallen far enough
    /// behind (or is down long enough) that backpressure is warranted.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(JobletError::resource_exhausted("ipc writer queue full")),
            Err(TrySendError::Disconnected(_)) => Err(JobletError::internal("ipc writer thread exited")),
        }
    }
}

fn connection_loop(socket_path: PathBuf, rx: Receiver<Envelope>, backoff_min: Duration, backoff_max: Duration) {
    let mut backoff = backoff_min;
    loop {
        match UnixStream::connect(&socket_path) {
            Ok(mut stream) => {
                backoff = backoff_min;
                loop {
                    match rx.recv_timeout(Duration::from_secs(5)) {
                        Ok(envelope) => {
                            if envelope.write_to(&mut stream).is_err() {
                                break; // reconnect
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if Envelope::Heartbeat.write_to(&mut stream).is_err() {
                                break;
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    }
                }
            }
            Err(_) => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_succeeds_while_queue_has_room() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("nonexistent.sock");
        let writer = IpcWriter::spawn(socket, Duration::from_millis(1), Duration::from_millis(10));
        assert!(writer.send(Envelope::Heartbeat).is_ok());
    }
}
