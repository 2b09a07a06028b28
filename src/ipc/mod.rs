//! Persistence IPC boundary: a framed Unix-domain-socket
//! protocol between the daemon and an out-of-process `persist` writer,
//! plus supervision of that subprocess's lifecycle.

pub mod codec;
pub mod supervisor;
pub mod writer;

pub use codec::Envelope;
pub use supervisor::PersistSupervisor;
pub use writer::IpcWriter;
