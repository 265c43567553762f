/// Distributed NACK suppression.
///
/// When the Master probes a window, every receiver with losses wants to
/// answer. To keep feedback proportional to the union of losses rather
/// than the number of receivers, each receiver waits a uniform random
/// backoff before answering and stays silent if an overheard NACK from
/// another UAV already requests a superset of its own missing set. A
/// receiver whose loss set is strictly wider still fires, and the
/// Master's OR-union picks up the difference.
///
/// There is at most one pending context per receiver. Contexts carry a
/// monotonically increasing generation; arming supersedes the previous
/// context, and a superseded timer that fires late detects it is stale by
/// generation mismatch instead of racing on a shared flag.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::bitmap::covers;
use crate::logging::{BroadcastEvent, BroadcastLog, BroadcastLogger};
use crate::protocol::Nack;

/// Where fired NACKs go; the receiver wires this to a multicast send.
pub type NackSink = Arc<dyn Fn(Nack) + Send + Sync>;

struct Pending {
    generation: u64,
    file_id: u16,
    window_id: u32,
    round_id: u16,
    missing: u64,
    suppressed: bool,
}

struct Inner {
    uav_id: u8,
    timeout: Duration,
    sink: NackSink,
    logger: Arc<dyn BroadcastLogger>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    generation: u64,
    pending: Option<Pending>,
}

#[derive(Clone)]
pub struct NackEngine {
    inner: Arc<Inner>,
}

impl NackEngine {
    pub fn new(
        uav_id: u8,
        timeout: Duration,
        sink: NackSink,
        logger: Arc<dyn BroadcastLogger>,
    ) -> Self {
        NackEngine {
            inner: Arc::new(Inner {
                uav_id,
                timeout,
                sink,
                logger,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Schedule a NACK for `(window_id, round_id)` after a uniform random
    /// delay in `[0, timeout)`. Any prior pending context is superseded.
    pub fn arm(&self, file_id: u16, window_id: u32, round_id: u16, missing: u64) {
        let timeout_ms = self.inner.timeout.as_millis() as u64;
        let delay_ms = if timeout_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..timeout_ms)
        };
        self.arm_with_delay(file_id, window_id, round_id, missing, delay_ms);
    }

    fn arm_with_delay(
        &self,
        file_id: u16,
        window_id: u32,
        round_id: u16,
        missing: u64,
        delay_ms: u64,
    ) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.pending = Some(Pending {
                generation: state.generation,
                file_id,
                window_id,
                round_id,
                missing,
                suppressed: false,
            });
            state.generation
        };

        self.inner.logger.log(BroadcastLog {
            component: "uav",
            file_id,
            event: BroadcastEvent::NackArmed {
                window_id,
                round_id,
                missing,
                delay_ms,
            },
        });

        let engine = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(delay_ms));
            engine.fire(generation);
        });
    }

    /// Inspect an overheard NACK from another UAV. Suppresses the pending
    /// context when the overheard missing set covers ours for the same
    /// probe.
    pub fn observe(&self, nack: &Nack) {
        if nack.uav_id == self.inner.uav_id {
            return; // loopback of our own NACK
        }
        let mut state = self.inner.state.lock();
        let Some(pending) = state.pending.as_mut() else {
            return;
        };
        if pending.suppressed
            || pending.file_id != nack.file_id
            || pending.window_id != nack.window_id
            || pending.round_id != nack.round_id
        {
            return;
        }
        if covers(nack.missing_bitmap, pending.missing) {
            pending.suppressed = true;
            let (file_id, window_id, round_id) =
                (pending.file_id, pending.window_id, pending.round_id);
            drop(state);
            self.inner.logger.log(BroadcastLog {
                component: "uav",
                file_id,
                event: BroadcastEvent::NackSuppressed {
                    window_id,
                    round_id,
                    by_uav: nack.uav_id,
                },
            });
        }
    }

    /// Timer expiry. Emits only if the context at `generation` is still
    /// current and unsuppressed; a stale generation means the context was
    /// superseded and this timer has nothing to do.
    fn fire(&self, generation: u64) {
        let fired = {
            let mut state = self.inner.state.lock();
            match state.pending.take() {
                Some(p) if p.generation == generation => {
                    if p.suppressed {
                        None
                    } else {
                        Some(Nack {
                            file_id: p.file_id,
                            window_id: p.window_id,
                            round_id: p.round_id,
                            uav_id: self.inner.uav_id,
                            missing_bitmap: p.missing,
                        })
                    }
                }
                other => {
                    state.pending = other;
                    None
                }
            }
        };

        if let Some(nack) = fired {
            self.inner.logger.log(BroadcastLog {
                component: "uav",
                file_id: nack.file_id,
                event: BroadcastEvent::NackSent {
                    window_id: nack.window_id,
                    round_id: nack.round_id,
                    missing: nack.missing_bitmap,
                },
            });
            (self.inner.sink)(nack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;

    fn recording_engine(uav_id: u8) -> (NackEngine, Arc<Mutex<Vec<Nack>>>) {
        let sent: Arc<Mutex<Vec<Nack>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_sent = sent.clone();
        let sink: NackSink = Arc::new(move |nack| sink_sent.lock().push(nack));
        let engine = NackEngine::new(uav_id, Duration::from_millis(50), sink, Arc::new(NullLogger));
        (engine, sent)
    }

    fn other_nack(window_id: u32, round_id: u16, missing: u64) -> Nack {
        Nack {
            file_id: 1,
            window_id,
            round_id,
            uav_id: 9,
            missing_bitmap: missing,
        }
    }

    #[test]
    fn fires_when_nothing_covers_us() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0110, 5);
        std::thread::sleep(Duration::from_millis(100));
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].uav_id, 3);
        assert_eq!(sent[0].missing_bitmap, 0b0110);
    }

    #[test]
    fn covering_nack_suppresses() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0110, 10_000);
        engine.observe(&other_nack(0, 0, 0b1110));
        engine.fire(1);
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn wider_local_set_still_fires() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0111, 10_000);
        // Overheard NACK misses chunk 0 only; ours is strictly wider.
        engine.observe(&other_nack(0, 0, 0b0001));
        engine.fire(1);
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn suppression_requires_matching_probe() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 2, 4, 0b0110, 10_000);
        engine.observe(&other_nack(2, 5, u64::MAX)); // different round
        engine.observe(&other_nack(3, 4, u64::MAX)); // different window
        engine.fire(1);
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn own_loopback_does_not_suppress() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0110, 10_000);
        let mut own = other_nack(0, 0, u64::MAX);
        own.uav_id = 3;
        engine.observe(&own);
        engine.fire(1);
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn superseded_timer_is_stale() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0001, 10_000); // generation 1
        engine.arm_with_delay(1, 1, 0, 0b0010, 10_000); // generation 2 supersedes
        engine.fire(1); // stale timer
        assert!(sent.lock().is_empty());
        engine.fire(2);
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].window_id, 1);
    }

    #[test]
    fn fire_is_one_shot() {
        let (engine, sent) = recording_engine(3);
        engine.arm_with_delay(1, 0, 0, 0b0001, 10_000);
        engine.fire(1);
        engine.fire(1);
        assert_eq!(sent.lock().len(), 1);
    }
}
