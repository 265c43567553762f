/// Master-side transmission driver.
///
/// State machine per session:
///   1. ANNOUNCE: repeat the session announce, then let receivers settle
///   2. Per window: broadcast every chunk at a fixed pacing, then run the
///      repair loop — probe with STATUS_REQ, aggregate NACKs, retransmit
///      exactly the union of reported losses, and declare the window done
///      after three consecutive quiet rounds
///   3. END: commit the padded file hash and drain
///
/// A concurrent NACK receiver demultiplexes incoming NACKs into the
/// shared session state under a single mutex: `need_retransmit` is a
/// monotone OR within a round, `responded_uav_bitmap` tracks who answered
/// this round, and `known_uavs_bitmap` only ever grows.
///
/// A UAV that went silent would otherwise stay "expected" forever and
/// stall every later window at the probe cap, so a UAV only counts as
/// expected while it has NACKed within `uav_liveness_timeout`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bitmap::set_offsets;
use crate::checksum::{crc16, hash_file_padded};
use crate::logging::{BroadcastEvent, BroadcastLog, BroadcastLogger, NullLogger};
use crate::protocol::{
    DataChunk, End, Message, Nack, StatusReq, ANNOUNCE_REPEAT_COUNT, MAX_CHUNK_SIZE, MAX_DATAGRAM,
    MAX_RESEND_BITMAP_ASK, MAX_RETRANS_ROUNDS, STATUS_REQ_INTERVAL_MS, WINDOW_SIZE,
};
use crate::session::SessionParams;
use crate::transport::{is_timeout, Transport};

/// Master configuration.
pub struct MasterConfig {
    pub file_id: u16,
    pub chunk_size: u32,
    pub window_size: u16,
    pub timing: MasterTiming,
    pub logger: Arc<dyn BroadcastLogger>,
}

impl MasterConfig {
    pub fn new(file_id: u16) -> Self {
        MasterConfig {
            file_id,
            chunk_size: MAX_CHUNK_SIZE,
            window_size: WINDOW_SIZE,
            timing: MasterTiming::default(),
            logger: Arc::new(NullLogger),
        }
    }
}

/// Every delay and bound in the state machine. Defaults are the protocol
/// constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct MasterTiming {
    pub announce_repeats: u32,
    pub announce_gap: Duration,
    pub settle_delay: Duration,
    pub chunk_pacing: Duration,
    /// Probe wait. Must exceed the receivers' NACK backoff plus network
    /// delay so a round's NACKs arrive before the snapshot.
    pub status_req_interval: Duration,
    pub max_status_req_asks: u32,
    pub max_retrans_rounds: u16,
    /// Consecutive quiet rounds before a window counts as delivered.
    pub stable_rounds: u16,
    /// How long a known UAV stays "expected to answer" after its last
    /// NACK.
    pub uav_liveness_timeout: Duration,
    pub end_repeats: u32,
    pub end_gap: Duration,
    pub drain: Duration,
}

impl Default for MasterTiming {
    fn default() -> Self {
        MasterTiming {
            announce_repeats: ANNOUNCE_REPEAT_COUNT,
            announce_gap: Duration::from_millis(10),
            settle_delay: Duration::from_secs(1),
            chunk_pacing: Duration::from_millis(1),
            status_req_interval: Duration::from_millis(STATUS_REQ_INTERVAL_MS),
            max_status_req_asks: MAX_RESEND_BITMAP_ASK,
            max_retrans_rounds: MAX_RETRANS_ROUNDS,
            stable_rounds: 3,
            uav_liveness_timeout: Duration::from_millis(
                2 * MAX_RESEND_BITMAP_ASK as u64 * STATUS_REQ_INTERVAL_MS,
            ),
            end_repeats: 5,
            end_gap: Duration::from_millis(50),
            drain: Duration::from_secs(5),
        }
    }
}

/// What the session did, for the CLI summary and for tests.
#[derive(Debug, Clone)]
pub struct MasterReport {
    pub total_chunks: u32,
    pub total_windows: u32,
    pub file_hash: u32,
    pub retransmitted_chunks: u64,
    /// Windows that never reached no-NACK stability.
    pub exhausted_windows: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

#[derive(Debug, Clone, Copy, Default)]
struct MasterWindow {
    need_retransmit: u64,
    responded_uavs: u32,
    round_count: u16,
    completed: bool,
}

struct MasterState {
    windows: Vec<MasterWindow>,
    /// Union over all time of UAV ids that have ever NACKed.
    known_uavs: u32,
    last_heard: [Option<Instant>; 32],
}

impl MasterState {
    fn new(total_windows: u32) -> Self {
        MasterState {
            windows: vec![MasterWindow::default(); total_windows as usize],
            known_uavs: 0,
            last_heard: [None; 32],
        }
    }

    /// Known UAVs that answered recently enough to be expected this round.
    fn alive_mask(&self, liveness: Duration, now: Instant) -> u32 {
        let mut mask = 0u32;
        for id in 0..32 {
            if self.known_uavs & (1 << id) == 0 {
                continue;
            }
            if let Some(heard) = self.last_heard[id] {
                if now.duration_since(heard) <= liveness {
                    mask |= 1 << id;
                }
            }
        }
        mask
    }

    /// Fold one NACK into the session state. Bits past the window's
    /// expected bitmap are discarded so a bogus NACK cannot request
    /// chunks that do not exist.
    fn absorb_nack(&mut self, params: &SessionParams, nack: &Nack) {
        if nack.uav_id > 31 {
            return;
        }
        self.known_uavs |= 1 << nack.uav_id;
        self.last_heard[nack.uav_id as usize] = Some(Instant::now());
        if let Some(window) = self.windows.get_mut(nack.window_id as usize) {
            window.need_retransmit |= nack.missing_bitmap & params.expected_bitmap(nack.window_id);
            window.responded_uavs |= 1 << nack.uav_id;
        }
    }
}

struct Master {
    config: MasterConfig,
    params: SessionParams,
    path: std::path::PathBuf,
    file: File,
    file_size: u64,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<MasterState>>,
    retransmitted: u64,
}

/// Broadcast `path` to the session's multicast group. Blocks until the
/// session is finished, END is committed, and the drain interval elapsed.
pub fn run_master(
    config: MasterConfig,
    path: &Path,
    transport: Arc<dyn Transport>,
) -> Result<MasterReport, MasterError> {
    if config.window_size == 0 || config.window_size > 64 {
        return Err(MasterError::Config("window_size must be 1..=64"));
    }
    if config.chunk_size == 0 || config.chunk_size > MAX_CHUNK_SIZE {
        return Err(MasterError::Config("chunk_size must be 1..=1024"));
    }

    let params =
        SessionParams::from_file(config.file_id, path, config.chunk_size, config.window_size)?;
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let state = Arc::new(Mutex::new(MasterState::new(params.total_windows())));

    let done = Arc::new(AtomicBool::new(false));
    let nack_thread = spawn_nack_receiver(
        transport.clone(),
        state.clone(),
        params.clone(),
        config.logger.clone(),
        done.clone(),
    );

    let mut master = Master {
        config,
        params,
        path: path.to_path_buf(),
        file,
        file_size,
        transport,
        state,
        retransmitted: 0,
    };
    let result = master.drive();

    done.store(true, Ordering::Relaxed);
    let _ = nack_thread.join();
    result
}

impl Master {
    fn drive(&mut self) -> Result<MasterReport, MasterError> {
        let timing = self.config.timing.clone();

        // ANNOUNCE
        let announce = Message::SessionAnnounce(self.params.announce()).encode();
        for _ in 0..timing.announce_repeats {
            self.transport.send(&announce)?;
            std::thread::sleep(timing.announce_gap);
        }
        self.log(BroadcastEvent::AnnounceSent {
            total_chunks: self.params.total_chunks,
            total_windows: self.params.total_windows(),
        });
        std::thread::sleep(timing.settle_delay);

        // Per-window broadcast + repair
        let mut exhausted_windows = Vec::new();
        for window_id in 0..self.params.total_windows() {
            self.broadcast_window(window_id, &timing)?;
            if !self.repair_window(window_id, &timing)? {
                exhausted_windows.push(window_id);
            }
        }

        // END: commit the padded hash and give late receivers a chance to
        // hear it. Hashing re-reads the file from disk so the commit
        // covers exactly what receivers will verify against.
        let file_hash = hash_file_padded(&self.path, self.params.total_chunks, self.params.chunk_size)?;
        let end = Message::End(End {
            file_id: self.params.file_id,
            total_chunks: self.params.total_chunks,
            file_hash,
        })
        .encode();
        for _ in 0..timing.end_repeats {
            self.transport.send(&end)?;
            std::thread::sleep(timing.end_gap);
        }
        self.log(BroadcastEvent::EndSent { file_hash });
        std::thread::sleep(timing.drain);

        self.log(BroadcastEvent::TransferComplete {
            total_chunks: self.params.total_chunks,
            retransmits: self.retransmitted,
        });

        Ok(MasterReport {
            total_chunks: self.params.total_chunks,
            total_windows: self.params.total_windows(),
            file_hash,
            retransmitted_chunks: self.retransmitted,
            exhausted_windows,
        })
    }

    fn broadcast_window(&mut self, window_id: u32, timing: &MasterTiming) -> Result<(), MasterError> {
        let first = self.params.first_chunk(window_id);
        let chunks = self.params.chunks_in_window(window_id);
        for offset in 0..chunks {
            self.send_chunk(first + offset as u32)?;
            std::thread::sleep(timing.chunk_pacing);
        }
        self.log(BroadcastEvent::WindowBroadcast { window_id, chunks });
        Ok(())
    }

    /// Repair loop for one window. Returns true when the window reached
    /// no-NACK stability, false when the round budget ran out.
    fn repair_window(&mut self, window_id: u32, timing: &MasterTiming) -> Result<bool, MasterError> {
        let mut no_nack_rounds: u16 = 0;

        for round in 0..timing.max_retrans_rounds {
            {
                let mut state = self.state.lock();
                let window = &mut state.windows[window_id as usize];
                window.need_retransmit = 0;
                window.responded_uavs = 0;
                window.round_count = round;
            }

            // Probe until every live UAV answered or the ask budget is
            // spent. With nobody known alive a single probe suffices.
            let probe = Message::StatusReq(StatusReq {
                file_id: self.params.file_id,
                window_id,
                round_id: round,
            })
            .encode();
            let mut asks = 0;
            loop {
                self.transport.send(&probe)?;
                self.log(BroadcastEvent::StatusRequested {
                    window_id,
                    round_id: round,
                });
                asks += 1;
                std::thread::sleep(timing.status_req_interval);

                let state = self.state.lock();
                let responded = state.windows[window_id as usize].responded_uavs;
                let alive = state.alive_mask(timing.uav_liveness_timeout, Instant::now());
                drop(state);
                if alive == 0 || responded & alive == alive {
                    break;
                }
                if asks >= timing.max_status_req_asks {
                    break;
                }
            }

            // Snapshot after the probe wait; NACKs for this round have
            // had status_req_interval to land.
            let (need, all_live_responded) = {
                let state = self.state.lock();
                let window = &state.windows[window_id as usize];
                let alive = state.alive_mask(timing.uav_liveness_timeout, Instant::now());
                (
                    window.need_retransmit,
                    alive == 0 || window.responded_uavs & alive == alive,
                )
            };

            if need != 0 {
                let first = self.params.first_chunk(window_id);
                let mut count = 0u32;
                for offset in set_offsets(need) {
                    self.send_chunk(first + offset as u32)?;
                    std::thread::sleep(timing.chunk_pacing);
                    count += 1;
                }
                self.retransmitted += count as u64;
                self.log(BroadcastEvent::Retransmit {
                    window_id,
                    round_id: round,
                    chunks: count,
                });
                no_nack_rounds = 0;
            } else if all_live_responded {
                no_nack_rounds += 1;
                if no_nack_rounds >= timing.stable_rounds {
                    let rounds = {
                        let mut state = self.state.lock();
                        let window = &mut state.windows[window_id as usize];
                        window.completed = true;
                        window.round_count + 1
                    };
                    self.log(BroadcastEvent::WindowCompleted { window_id, rounds });
                    return Ok(true);
                }
            } else {
                no_nack_rounds = 0;
            }
        }

        let missing = self.state.lock().windows[window_id as usize].need_retransmit;
        self.log(BroadcastEvent::RepairExhausted { window_id, missing });
        Ok(false)
    }

    fn send_chunk(&mut self, chunk_id: u32) -> Result<(), MasterError> {
        let offset = chunk_id as u64 * self.params.chunk_size as u64;
        let len = (self.file_size.saturating_sub(offset)).min(self.params.chunk_size as u64);
        let mut data = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut data)?;

        let msg = Message::DataChunk(DataChunk {
            file_id: self.params.file_id,
            chunk_id,
            crc: crc16(&data),
            data,
        });
        self.transport.send(&msg.encode())?;
        Ok(())
    }

    fn log(&self, event: BroadcastEvent) {
        self.config.logger.log(BroadcastLog {
            component: "master",
            file_id: self.params.file_id,
            event,
        });
    }
}

fn spawn_nack_receiver(
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<MasterState>>,
    params: SessionParams,
    logger: Arc<dyn BroadcastLogger>,
    done: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !done.load(Ordering::Relaxed) {
            let len = match transport.recv(&mut buf) {
                Ok((len, _src)) => len,
                Err(ref e) if is_timeout(e) => continue,
                Err(_) => break,
            };
            let Some(Message::Nack(nack)) = Message::decode(&buf[..len]) else {
                continue; // the Master also hears its own announces/chunks
            };
            if nack.file_id != params.file_id {
                continue;
            }
            state.lock().absorb_nack(&params, &nack);
            logger.log(BroadcastLog {
                component: "master",
                file_id: params.file_id,
                event: BroadcastEvent::NackReceived {
                    window_id: nack.window_id,
                    round_id: nack.round_id,
                    uav_id: nack.uav_id,
                    missing: nack.missing_bitmap,
                },
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(total_chunks: u32) -> SessionParams {
        SessionParams {
            file_id: 1,
            chunk_size: 1024,
            window_size: 64,
            total_chunks,
            filename: "f.bin".into(),
        }
    }

    fn nack(uav_id: u8, window_id: u32, missing: u64) -> Nack {
        Nack {
            file_id: 1,
            window_id,
            round_id: 0,
            uav_id,
            missing_bitmap: missing,
        }
    }

    #[test]
    fn absorb_nack_ors_missing_and_tracks_uavs() {
        let mut state = MasterState::new(2);
        let p = params(128);

        state.absorb_nack(&p, &nack(3, 0, 0b0011));
        state.absorb_nack(&p, &nack(5, 0, 0b0110));
        assert_eq!(state.windows[0].need_retransmit, 0b0111);
        assert_eq!(state.windows[0].responded_uavs, (1 << 3) | (1 << 5));
        assert_eq!(state.known_uavs, (1 << 3) | (1 << 5));
    }

    #[test]
    fn absorb_nack_masks_bits_past_partial_window() {
        let mut state = MasterState::new(1);
        let p = params(3); // one window, 3 chunks
        state.absorb_nack(&p, &nack(0, 0, u64::MAX));
        assert_eq!(state.windows[0].need_retransmit, 0b111);
    }

    #[test]
    fn absorb_nack_ignores_out_of_range_ids() {
        let mut state = MasterState::new(1);
        let p = params(3);
        state.absorb_nack(&p, &nack(32, 0, 0b1));
        assert_eq!(state.known_uavs, 0);
        state.absorb_nack(&p, &nack(0, 9, 0b1)); // window out of range
        assert_eq!(state.known_uavs, 1);
        assert_eq!(state.windows[0].need_retransmit, 0);
    }

    #[test]
    fn alive_mask_expires_silent_uavs() {
        let mut state = MasterState::new(1);
        let p = params(3);
        state.absorb_nack(&p, &nack(2, 0, 0b1));

        let now = Instant::now();
        assert_eq!(state.alive_mask(Duration::from_secs(5), now), 1 << 2);
        // Well past the liveness window the UAV is known but not expected.
        let later = now + Duration::from_secs(60);
        assert_eq!(state.alive_mask(Duration::from_secs(5), later), 0);
        assert_eq!(state.known_uavs, 1 << 2);
    }
}
