/// Swarmcast: reliable one-to-many file broadcast over UDP multicast.
///
/// One Master delivers a single file to a fleet of UAV receivers with:
/// - Window-oriented broadcast and per-window repair rounds
/// - 64-bit received-bitmaps with per-chunk CRC-16 integrity
/// - Distributed NACK suppression: random backoff plus overheard-superset
///   cancellation, keeping feedback proportional to the union of losses
/// - A padded 32-bit FNV-1a file-hash commit at end of session

pub mod bitmap;
pub mod checksum;
pub mod logging;
pub mod master;
pub mod nack;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod transport;

// Re-export key types for convenience.
pub use logging::{BroadcastEvent, BroadcastLog, BroadcastLogger, NullLogger, TracingLogger};
pub use master::{run_master, MasterConfig, MasterError, MasterReport, MasterTiming};
pub use protocol::{Message, MAX_CHUNK_SIZE, MAX_DATAGRAM, WINDOW_SIZE};
pub use receiver::{run_receiver, ReceiverConfig, ReceiverError, ReceiverEvent};
pub use session::SessionParams;
pub use transport::{MulticastConfig, MulticastSocket, Transport};
