//! Latest-frame bus between the capture loop and stream sessions

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use tokio::sync::watch;
use tracing::debug;

use crate::capture::Frame;
use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Capture is running; publishes are accepted
    Open,
    /// Reconfiguration in flight; new waiters park until capture resumes
    Paused,
    /// No capture until an operator retry; waiters fail fast
    Closed,
}

struct Slot {
    frame: Option<Frame>,
    sequence: u64,
    /// Bumped on every pause/close so parked waiters can tell they were cut off
    epoch: u64,
    gate: Gate,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    rejected: AtomicU64,
}

/// Publish counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub rejected: u64,
}

/// Single-slot frame buffer with wake-all notification.
///
/// Only the newest frame is retained. A slow reader skips intermediate frames
/// but never sees an older frame than the one it already has, since every
/// publish gets a strictly greater sequence number.
pub struct FrameBus {
    tx: watch::Sender<Slot>,
    stats: CachePadded<Stats>,
}

impl FrameBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Slot {
            frame: None,
            sequence: 0,
            epoch: 0,
            gate: Gate::Open,
        });
        Self {
            tx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the latest frame and wake every waiter.
    ///
    /// Fails while the bus is paused or closed; the frame is dropped.
    pub fn publish(&self, mut frame: Frame) -> Result<u64, BusError> {
        let mut published = None;

        self.tx.send_if_modified(|slot| {
            if slot.gate != Gate::Open {
                return false;
            }
            slot.sequence += 1;
            frame.sequence = slot.sequence;
            published = Some(slot.sequence);
            slot.frame = Some(frame);
            true
        });

        match published {
            Some(sequence) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("zerocam_frames_published_total").increment(1);
                Ok(sequence)
            }
            None => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("zerocam_publish_rejected_total").increment(1);
                Err(BusError::SourceUnavailable)
            }
        }
    }

    /// Consumer: wait for a frame newer than `last_seen`.
    ///
    /// Returns immediately if the slot already holds one. Fails with
    /// `SourceUnavailable` when the bus is paused or closed during the wait,
    /// or is closed on entry.
    pub async fn wait_for_next(&self, last_seen: u64) -> Result<Frame, BusError> {
        let mut rx = self.tx.subscribe();
        let epoch = rx.borrow().epoch;

        let slot = rx
            .wait_for(|slot| {
                slot.epoch != epoch
                    || slot.gate == Gate::Closed
                    || slot.frame.as_ref().is_some_and(|f| f.sequence > last_seen)
            })
            .await
            .map_err(|_| BusError::SourceUnavailable)?;

        if slot.epoch != epoch || slot.gate == Gate::Closed {
            return Err(BusError::SourceUnavailable);
        }
        slot.frame.clone().ok_or(BusError::SourceUnavailable)
    }

    /// Stop accepting frames and cut off current waiters. Waiters arriving
    /// afterwards park until [`FrameBus::resume`] and the next publish.
    pub fn pause(&self) {
        self.tx.send_modify(|slot| {
            slot.epoch += 1;
            slot.gate = Gate::Paused;
            slot.frame = None;
        });
        debug!("Frame bus paused");
    }

    /// Reopen a paused bus. Returns false if it was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.tx.send_if_modified(|slot| {
            if slot.gate != Gate::Paused {
                return false;
            }
            slot.gate = Gate::Open;
            true
        });
        if resumed {
            debug!("Frame bus resumed");
        }
        resumed
    }

    /// Tear down: fail every current and future waiter until the next
    /// pause/resume cycle.
    pub fn close(&self) {
        self.tx.send_modify(|slot| {
            slot.epoch += 1;
            slot.gate = Gate::Closed;
            slot.frame = None;
        });
        debug!("Frame bus closed");
    }

    pub fn is_open(&self) -> bool {
        self.tx.borrow().gate == Gate::Open
    }

    /// Most recent frame, if capture has produced one since the last pause
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().frame.clone()
    }

    /// Sequence number of the last published frame
    pub fn sequence(&self) -> u64 {
        self.tx.borrow().sequence
    }

    /// Number of callers currently inside `wait_for_next`
    pub fn waiters(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}
