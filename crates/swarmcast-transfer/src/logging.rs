/// Structured broadcast logging.
///
/// Master and UAV components emit structured events through a logger
/// trait; implementations can forward to `tracing`, record for test
/// assertions, or discard.

use std::fmt;

/// Structured log entry for a broadcast session.
#[derive(Debug, Clone)]
pub struct BroadcastLog {
    pub component: &'static str,
    pub file_id: u16,
    pub event: BroadcastEvent,
}

/// Events the protocol can log.
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    /// Master: session announced
    AnnounceSent {
        total_chunks: u32,
        total_windows: u32,
    },
    /// Receiver: session allocated
    SessionStarted {
        filename: String,
        total_chunks: u32,
    },
    /// Master: all chunks of a window broadcast
    WindowBroadcast {
        window_id: u32,
        chunks: u16,
    },
    /// Master: probe for a repair round
    StatusRequested {
        window_id: u32,
        round_id: u16,
    },
    /// Receiver: backoff timer armed
    NackArmed {
        window_id: u32,
        round_id: u16,
        missing: u64,
        delay_ms: u64,
    },
    /// Receiver: pending NACK cancelled by an overheard superset
    NackSuppressed {
        window_id: u32,
        round_id: u16,
        by_uav: u8,
    },
    /// Receiver: NACK emitted
    NackSent {
        window_id: u32,
        round_id: u16,
        missing: u64,
    },
    /// Master: NACK aggregated
    NackReceived {
        window_id: u32,
        round_id: u16,
        uav_id: u8,
        missing: u64,
    },
    /// Master: chunks re-sent for a round
    Retransmit {
        window_id: u32,
        round_id: u16,
        chunks: u32,
    },
    /// Master: window reached no-NACK stability
    WindowCompleted {
        window_id: u32,
        rounds: u16,
    },
    /// Master: repair rounds exhausted, moving on best-effort
    RepairExhausted {
        window_id: u32,
        missing: u64,
    },
    /// Receiver: chunk dropped on CRC mismatch
    CrcMismatch {
        chunk_id: u32,
    },
    /// Master: end-of-session commit
    EndSent {
        file_hash: u32,
    },
    /// Receiver: file hash check result
    HashVerified {
        expected: u32,
        actual: u32,
        ok: bool,
    },
    /// Receiver: session left incomplete at END
    TransferIncomplete {
        missing_chunks: u64,
    },
    /// Either side: session finished
    TransferComplete {
        total_chunks: u32,
        retransmits: u64,
    },
}

impl fmt::Display for BroadcastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnnounceSent { total_chunks, total_windows } => {
                write!(f, "announce_sent chunks={} windows={}", total_chunks, total_windows)
            }
            Self::SessionStarted { filename, total_chunks } => {
                write!(f, "session_started file={} chunks={}", filename, total_chunks)
            }
            Self::WindowBroadcast { window_id, chunks } => {
                write!(f, "window_broadcast window={} chunks={}", window_id, chunks)
            }
            Self::StatusRequested { window_id, round_id } => {
                write!(f, "status_requested window={} round={}", window_id, round_id)
            }
            Self::NackArmed { window_id, round_id, missing, delay_ms } => {
                write!(
                    f,
                    "nack_armed window={} round={} missing={:#x} delay_ms={}",
                    window_id, round_id, missing, delay_ms
                )
            }
            Self::NackSuppressed { window_id, round_id, by_uav } => {
                write!(f, "nack_suppressed window={} round={} by_uav={}", window_id, round_id, by_uav)
            }
            Self::NackSent { window_id, round_id, missing } => {
                write!(f, "nack_sent window={} round={} missing={:#x}", window_id, round_id, missing)
            }
            Self::NackReceived { window_id, round_id, uav_id, missing } => {
                write!(
                    f,
                    "nack_received window={} round={} uav={} missing={:#x}",
                    window_id, round_id, uav_id, missing
                )
            }
            Self::Retransmit { window_id, round_id, chunks } => {
                write!(f, "retransmit window={} round={} chunks={}", window_id, round_id, chunks)
            }
            Self::WindowCompleted { window_id, rounds } => {
                write!(f, "window_completed window={} rounds={}", window_id, rounds)
            }
            Self::RepairExhausted { window_id, missing } => {
                write!(f, "repair_exhausted window={} missing={:#x}", window_id, missing)
            }
            Self::CrcMismatch { chunk_id } => {
                write!(f, "crc_mismatch chunk={}", chunk_id)
            }
            Self::EndSent { file_hash } => {
                write!(f, "end_sent hash={:#010x}", file_hash)
            }
            Self::HashVerified { expected, actual, ok } => {
                write!(f, "hash_verified expected={:#010x} actual={:#010x} ok={}", expected, actual, ok)
            }
            Self::TransferIncomplete { missing_chunks } => {
                write!(f, "transfer_incomplete missing={}", missing_chunks)
            }
            Self::TransferComplete { total_chunks, retransmits } => {
                write!(f, "transfer_complete chunks={} retransmits={}", total_chunks, retransmits)
            }
        }
    }
}

/// Trait for broadcast logging. Implementations can forward to `tracing`,
/// buffer for assertions, or discard.
pub trait BroadcastLogger: Send + Sync {
    fn log(&self, entry: BroadcastLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl BroadcastLogger for TracingLogger {
    fn log(&self, entry: BroadcastLog) {
        // warn for degraded outcomes, info for lifecycle, debug for
        // per-chunk and per-round spam
        match &entry.event {
            BroadcastEvent::RepairExhausted { .. }
            | BroadcastEvent::TransferIncomplete { .. } => {
                tracing::warn!(
                    component = entry.component,
                    file_id = entry.file_id,
                    "{}",
                    entry.event,
                );
            }
            BroadcastEvent::HashVerified { ok: false, .. } => {
                tracing::warn!(
                    component = entry.component,
                    file_id = entry.file_id,
                    "{}",
                    entry.event,
                );
            }
            BroadcastEvent::AnnounceSent { .. }
            | BroadcastEvent::SessionStarted { .. }
            | BroadcastEvent::EndSent { .. }
            | BroadcastEvent::HashVerified { .. }
            | BroadcastEvent::TransferComplete { .. } => {
                tracing::info!(
                    component = entry.component,
                    file_id = entry.file_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    file_id = entry.file_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl BroadcastLogger for NullLogger {
    fn log(&self, _entry: BroadcastLog) {}
}
