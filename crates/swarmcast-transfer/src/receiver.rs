/// UAV-side receiver: session tracking, chunk ingest, NACK arming.
///
/// Flow:
///   1. `SESSION_ANNOUNCE` with a new file_id allocates window state and
///      the output file `received_uav<id>_<filename>`
///   2. Data chunks are CRC-checked, written at their absolute offset,
///      then marked in the window bitmap (write first, mark second, so a
///      set bit always means persisted bytes)
///   3. `STATUS_REQ` for an incomplete window arms the suppression engine
///   4. Overheard NACKs from other UAVs feed suppression
///   5. `END` verifies the padded FNV-1a hash against what was written
///
/// The run loop blocks until cancelled; completion is reported over the
/// event channel so callers never poll.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::checksum::{crc16, hash_file_padded};
use crate::logging::{BroadcastEvent, BroadcastLog, BroadcastLogger, NullLogger};
use crate::nack::{NackEngine, NackSink};
use crate::protocol::{DataChunk, End, Message, SessionAnnounce, StatusReq, MAX_DATAGRAM, NACK_TIMEOUT_MS};
use crate::session::SessionParams;
use crate::transport::{is_timeout, Transport};

/// Receiver configuration.
pub struct ReceiverConfig {
    /// UAV identity, 0..=31; selects the NACK bit and the output filename.
    pub uav_id: u8,
    /// Directory the received file is written into.
    pub output_dir: PathBuf,
    /// NACK backoff window.
    pub nack_timeout: Duration,
    pub logger: Arc<dyn BroadcastLogger>,
}

impl ReceiverConfig {
    pub fn new(uav_id: u8, output_dir: impl Into<PathBuf>) -> Self {
        ReceiverConfig {
            uav_id,
            output_dir: output_dir.into(),
            nack_timeout: Duration::from_millis(NACK_TIMEOUT_MS),
            logger: Arc::new(NullLogger),
        }
    }
}

/// Messages from the receiver to its controller.
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    SessionStarted {
        file_id: u16,
        filename: String,
        total_chunks: u32,
    },
    Progress {
        received_chunks: u32,
        total_chunks: u32,
    },
    /// END arrived with every chunk present; `hash_ok` is the verdict of
    /// the file-hash check.
    Complete { file_id: u16, hash_ok: bool },
    /// END arrived but chunks are still missing.
    Incomplete { file_id: u16, missing_chunks: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("uav id {0} outside 0..=31")]
    UavIdRange(u8),
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowState {
    received_bitmap: u64,
    completed: bool,
}

/// What became of one ingested chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ingest {
    Stored,
    Duplicate,
    CrcMismatch,
    Rejected,
}

struct Session {
    params: SessionParams,
    windows: Vec<WindowState>,
    received_chunks: u32,
    file: File,
    output_path: PathBuf,
    active: bool,
    end_reported: bool,
}

impl Session {
    fn create(params: SessionParams, uav_id: u8, output_dir: &Path) -> io::Result<Session> {
        let output_path =
            output_dir.join(format!("received_uav{}_{}", uav_id, params.filename));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output_path)?;
        let windows = vec![WindowState::default(); params.total_windows() as usize];
        Ok(Session {
            params,
            windows,
            received_chunks: 0,
            file,
            output_path,
            active: true,
            end_reported: false,
        })
    }

    /// Validate, persist, and mark one chunk. The write lands before the
    /// bit is set; duplicates are suppressed by the prior-set check, so
    /// re-ingesting a chunk never rewrites the file or bumps counters.
    fn ingest(&mut self, chunk: &DataChunk) -> io::Result<Ingest> {
        if chunk.file_id != self.params.file_id
            || chunk.chunk_id >= self.params.total_chunks
            || chunk.data.len() > self.params.chunk_size as usize
        {
            return Ok(Ingest::Rejected);
        }
        if crc16(&chunk.data) != chunk.crc {
            return Ok(Ingest::CrcMismatch);
        }

        let (window_id, offset) = self.params.locate(chunk.chunk_id);
        let bit = 1u64 << offset;
        if self.windows[window_id as usize].received_bitmap & bit != 0 {
            return Ok(Ingest::Duplicate);
        }

        let file_offset = chunk.chunk_id as u64 * self.params.chunk_size as u64;
        self.file.seek(SeekFrom::Start(file_offset))?;
        self.file.write_all(&chunk.data)?;
        self.file.flush()?;

        let window = &mut self.windows[window_id as usize];
        window.received_bitmap |= bit;
        self.received_chunks += 1;
        if window.received_bitmap == self.params.expected_bitmap(window_id) {
            window.completed = true;
        }
        Ok(Ingest::Stored)
    }

    /// Missing-polarity bitmap for a window, None when out of range.
    fn missing_bitmap(&self, window_id: u32) -> Option<u64> {
        let window = self.windows.get(window_id as usize)?;
        Some(self.params.expected_bitmap(window_id) & !window.received_bitmap)
    }

    fn is_complete(&self) -> bool {
        self.received_chunks == self.params.total_chunks
    }

    /// Recompute the padded FNV-1a over the file that was actually
    /// written; the caller compares it against the Master's commit.
    fn verify(&mut self) -> io::Result<u32> {
        self.file.sync_all()?;
        hash_file_padded(
            &self.output_path,
            self.params.total_chunks,
            self.params.chunk_size,
        )
    }
}

/// Run the receiver loop. Blocks until `cancelled` is set; session
/// outcomes are reported through `event_tx`.
pub fn run_receiver(
    config: ReceiverConfig,
    transport: Arc<dyn Transport>,
    event_tx: Sender<ReceiverEvent>,
    cancelled: Arc<AtomicBool>,
) -> Result<(), ReceiverError> {
    if config.uav_id > 31 {
        return Err(ReceiverError::UavIdRange(config.uav_id));
    }

    let logger = config.logger.clone();
    let session: Mutex<Option<Session>> = Mutex::new(None);

    let sink_transport = transport.clone();
    let sink: NackSink = Arc::new(move |nack| {
        // Best-effort, like everything on this wire.
        let _ = sink_transport.send(&Message::Nack(nack).encode());
    });
    let engine = NackEngine::new(config.uav_id, config.nack_timeout, sink, logger.clone());

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let len = match transport.recv(&mut buf) {
            Ok((len, _src)) => len,
            Err(ref e) if is_timeout(e) => continue,
            Err(e) => return Err(e.into()),
        };

        let Some(msg) = Message::decode(&buf[..len]) else {
            continue; // undersized or unknown frame
        };

        match msg {
            Message::SessionAnnounce(announce) => {
                handle_announce(&config, &session, &announce, &event_tx, &logger)?;
            }
            Message::DataChunk(chunk) => {
                handle_chunk(&session, &chunk, &event_tx, &logger)?;
            }
            Message::StatusReq(req) => {
                handle_status_req(&session, &req, &engine);
            }
            Message::Nack(nack) => {
                engine.observe(&nack);
            }
            Message::End(end) => {
                handle_end(&session, &end, &event_tx, &logger)?;
            }
        }
    }
}

fn handle_announce(
    config: &ReceiverConfig,
    session: &Mutex<Option<Session>>,
    announce: &SessionAnnounce,
    event_tx: &Sender<ReceiverEvent>,
    logger: &Arc<dyn BroadcastLogger>,
) -> Result<(), ReceiverError> {
    let Some(params) = SessionParams::from_announce(announce) else {
        return Ok(()); // geometry the protocol cannot represent
    };

    let mut guard = session.lock();
    if let Some(existing) = guard.as_ref() {
        if existing.params.file_id == params.file_id {
            return Ok(()); // announce repeats are idempotent
        }
    }

    let created = Session::create(params, config.uav_id, &config.output_dir)?;
    let (file_id, filename, total_chunks) = (
        created.params.file_id,
        created.params.filename.clone(),
        created.params.total_chunks,
    );
    *guard = Some(created);
    drop(guard);

    logger.log(BroadcastLog {
        component: "uav",
        file_id,
        event: BroadcastEvent::SessionStarted {
            filename: filename.clone(),
            total_chunks,
        },
    });
    let _ = event_tx.send(ReceiverEvent::SessionStarted {
        file_id,
        filename,
        total_chunks,
    });
    Ok(())
}

fn handle_chunk(
    session: &Mutex<Option<Session>>,
    chunk: &DataChunk,
    event_tx: &Sender<ReceiverEvent>,
    logger: &Arc<dyn BroadcastLogger>,
) -> Result<(), ReceiverError> {
    let mut guard = session.lock();
    let Some(s) = guard.as_mut() else {
        return Ok(());
    };
    if !s.active {
        return Ok(());
    }

    let outcome = s.ingest(chunk)?;
    let (file_id, received, total) = (s.params.file_id, s.received_chunks, s.params.total_chunks);
    drop(guard);

    match outcome {
        Ingest::Stored => {
            if received % 100 == 0 || received == total {
                let _ = event_tx.send(ReceiverEvent::Progress {
                    received_chunks: received,
                    total_chunks: total,
                });
            }
        }
        Ingest::CrcMismatch => {
            logger.log(BroadcastLog {
                component: "uav",
                file_id,
                event: BroadcastEvent::CrcMismatch {
                    chunk_id: chunk.chunk_id,
                },
            });
        }
        Ingest::Duplicate | Ingest::Rejected => {}
    }
    Ok(())
}

fn handle_status_req(session: &Mutex<Option<Session>>, req: &StatusReq, engine: &NackEngine) {
    let missing = {
        let guard = session.lock();
        let Some(s) = guard.as_ref() else { return };
        if !s.active || s.params.file_id != req.file_id {
            return;
        }
        if s.windows
            .get(req.window_id as usize)
            .map_or(true, |w| w.completed)
        {
            return;
        }
        match s.missing_bitmap(req.window_id) {
            Some(m) if m != 0 => m,
            _ => return,
        }
    };
    // Lock released: the engine takes its own lock and must never nest
    // inside the session lock.
    engine.arm(req.file_id, req.window_id, req.round_id, missing);
}

fn handle_end(
    session: &Mutex<Option<Session>>,
    end: &End,
    event_tx: &Sender<ReceiverEvent>,
    logger: &Arc<dyn BroadcastLogger>,
) -> Result<(), ReceiverError> {
    let mut guard = session.lock();
    let Some(s) = guard.as_mut() else {
        return Ok(());
    };
    if s.params.file_id != end.file_id || !s.active || s.end_reported {
        return Ok(());
    }

    if s.is_complete() {
        let actual = s.verify()?;
        let hash_ok = actual == end.file_hash;
        s.end_reported = true;
        if hash_ok {
            s.active = false;
        }
        let (file_id, total) = (s.params.file_id, s.params.total_chunks);
        drop(guard);

        logger.log(BroadcastLog {
            component: "uav",
            file_id,
            event: BroadcastEvent::HashVerified {
                expected: end.file_hash,
                actual,
                ok: hash_ok,
            },
        });
        if hash_ok {
            logger.log(BroadcastLog {
                component: "uav",
                file_id,
                event: BroadcastEvent::TransferComplete {
                    total_chunks: total,
                    retransmits: 0,
                },
            });
        }
        let _ = event_tx.send(ReceiverEvent::Complete { file_id, hash_ok });
    } else {
        s.end_reported = true;
        let file_id = s.params.file_id;
        let missing = (s.params.total_chunks - s.received_chunks) as u64;
        drop(guard);

        logger.log(BroadcastLog {
            component: "uav",
            file_id,
            event: BroadcastEvent::TransferIncomplete {
                missing_chunks: missing,
            },
        });
        let _ = event_tx.send(ReceiverEvent::Incomplete {
            file_id,
            missing_chunks: missing,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("swarmcast_receiver_tests").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn params(total_chunks: u32, chunk_size: u32, window_size: u16) -> SessionParams {
        SessionParams {
            file_id: 7,
            chunk_size,
            window_size,
            total_chunks,
            filename: "blob.bin".into(),
        }
    }

    fn chunk(chunk_id: u32, data: Vec<u8>) -> DataChunk {
        DataChunk {
            file_id: 7,
            chunk_id,
            crc: crc16(&data),
            data,
        }
    }

    #[test]
    fn ingest_writes_then_marks() {
        let dir = test_dir("ingest");
        let mut s = Session::create(params(3, 4, 64), 2, &dir).unwrap();

        assert_eq!(s.ingest(&chunk(0, vec![1, 2, 3, 4])).unwrap(), Ingest::Stored);
        assert_eq!(s.ingest(&chunk(2, vec![9, 9, 9])).unwrap(), Ingest::Stored);
        assert_eq!(s.received_chunks, 2);
        assert_eq!(s.windows[0].received_bitmap, 0b101);
        assert!(!s.windows[0].completed);

        let written = std::fs::read(&s.output_path).unwrap();
        assert_eq!(&written[0..4], &[1, 2, 3, 4]);
        assert_eq!(&written[8..11], &[9, 9, 9]);
    }

    #[test]
    fn duplicate_ingest_is_idempotent() {
        let dir = test_dir("dup");
        let mut s = Session::create(params(3, 4, 64), 2, &dir).unwrap();

        assert_eq!(s.ingest(&chunk(1, vec![5; 4])).unwrap(), Ingest::Stored);
        let bitmap = s.windows[0].received_bitmap;
        let before = std::fs::read(&s.output_path).unwrap();

        // Same chunk again, different payload bytes: prior-set check wins,
        // nothing is rewritten.
        let mut dup = chunk(1, vec![6; 4]);
        dup.crc = crc16(&dup.data);
        assert_eq!(s.ingest(&dup).unwrap(), Ingest::Duplicate);
        assert_eq!(s.received_chunks, 1);
        assert_eq!(s.windows[0].received_bitmap, bitmap);
        assert_eq!(std::fs::read(&s.output_path).unwrap(), before);
    }

    #[test]
    fn crc_mismatch_is_treated_as_loss() {
        let dir = test_dir("crc");
        let mut s = Session::create(params(3, 4, 64), 2, &dir).unwrap();

        let mut bad = chunk(0, vec![1, 2, 3, 4]);
        bad.crc ^= 0x0101;
        assert_eq!(s.ingest(&bad).unwrap(), Ingest::CrcMismatch);
        assert_eq!(s.received_chunks, 0);
        assert_eq!(s.missing_bitmap(0), Some(0b111));

        // Clean retransmission is then accepted.
        assert_eq!(s.ingest(&chunk(0, vec![1, 2, 3, 4])).unwrap(), Ingest::Stored);
    }

    #[test]
    fn rejects_foreign_and_out_of_range_chunks() {
        let dir = test_dir("reject");
        let mut s = Session::create(params(3, 4, 64), 2, &dir).unwrap();

        let mut foreign = chunk(0, vec![0; 4]);
        foreign.file_id = 8;
        assert_eq!(s.ingest(&foreign).unwrap(), Ingest::Rejected);
        assert_eq!(s.ingest(&chunk(3, vec![0; 4])).unwrap(), Ingest::Rejected);
        assert_eq!(s.received_chunks, 0);
    }

    #[test]
    fn partial_final_window_completes_on_low_bits() {
        let dir = test_dir("partial");
        // 6 chunks, window of 4: second window holds 2 chunks.
        let mut s = Session::create(params(6, 4, 4), 2, &dir).unwrap();

        for id in [4u32, 5] {
            assert_eq!(s.ingest(&chunk(id, vec![id as u8; 4])).unwrap(), Ingest::Stored);
        }
        assert!(s.windows[1].completed);
        assert_eq!(s.missing_bitmap(1), Some(0));
        assert!(!s.windows[0].completed);
        assert_eq!(s.missing_bitmap(0), Some(0b1111));
    }

    #[test]
    fn verify_checks_padded_hash() {
        let dir = test_dir("verify");
        let mut s = Session::create(params(2, 4, 64), 2, &dir).unwrap();
        s.ingest(&chunk(0, vec![1, 2, 3, 4])).unwrap();
        s.ingest(&chunk(1, vec![5, 6])).unwrap(); // short final chunk
        assert!(s.is_complete());

        // Hash covers 2 * 4 bytes with the tail zero-padded.
        let expected = crate::checksum::fnv1a(&[1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(s.verify().unwrap(), expected);
    }
}
