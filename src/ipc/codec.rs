//! The framed wire envelope between the daemon and its `persist`
//! subprocess.
//!
//! This crate has no other use for a protoc-driven build step, so the
//! envelope is a hand-rolled fixed layout instead: a 4-byte big-endian
//! length prefix followed by a 1-byte message-type tag and a JSON body.
//! This keeps the framing discipline that actually matters here — bounded
//! reads, length-prefixed records — without pulling in `prost`/`tonic`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::errors::{JobletError, Result};
use crate::model::LogChunk;

pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    LogBatch(Vec<LogChunk>),
    StateSnapshot(Vec<u8>),
    Heartbeat,
    Ack { sequence: u64 },
}

impl Envelope {
    fn tag(&self) -> u8 {
        match self {
            Envelope::LogBatch(_) => 1,
            Envelope::StateSnapshot(_) => 2,
            Envelope::Heartbeat => 3,
            Envelope::Ack { .. } => 4,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| JobletError::internal(format!("encode envelope: {e}")))?;
        let len = body.len() as u32 + 1;
        let mut out = Vec::with_capacity(4 + body.len() + 1);
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.tag());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        let bytes = self.encode()?;
        w.write_all(&bytes)
            .map_err(|e| JobletError::upstream_io_err("write ipc frame", e))
    }

    /// Read one frame, enforcing the max-size cap before allocating a
    /// buffer for the body.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)
            .map_err(|e| JobletError::upstream_io_err("read ipc frame length", e))?;
        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(JobletError::validation(format!(
                "ipc frame length {len} out of bounds"
            )));
        }
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body)
            .map_err(|e| JobletError::upstream_io_err("read ipc frame body", e))?;
        // body[0] is the tag, kept for wire debuggability; the JSON body
        // that follows is self-describing via serde's enum tagging.
        serde_json::from_slice(&body[1..])
            .map_err(|e| JobletError::validation(format!("decode ipc frame: {e}")))
    }
}

/// A read error distinguishing "peer closed cleanly" from a real failure,
/// since EOF on frame boundary is the normal shutdown path for the
/// persist subprocess's connection loop.
pub fn is_clean_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let env = Envelope::Heartbeat;
        let mut buf = Vec::new();
        env.write_to(&mut buf).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let decoded = Envelope::read_from(&mut cursor).unwrap();
        matches!(decoded, Envelope::Heartbeat);
    }

    #[test]
    fn ack_round_trips_with_sequence() {
        let env = Envelope::Ack { sequence: 42 };
        let mut buf = Vec::new();
        env.write_to(&mut buf).unwrap();
        let mut cursor = io::Cursor::new(buf);
        match Envelope::read_from(&mut cursor).unwrap() {
            Envelope::Ack { sequence } => assert_eq!(sequence, 42),
            _ => panic!("expected Ack"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(buf);
        assert!(Envelope::read_from(&mut cursor).is_err());
    }
}
