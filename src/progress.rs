//! Progress accounting and delivery to the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A frame finished (successfully or not).
    Frames {
        /// Frames completed so far in the current batch.
        processed: usize,
        /// Frames in the batch.
        total: usize,
    },
    /// The pipeline entered a new phase.
    Phase {
        /// Human-readable phase label.
        label: String,
        /// Time since the run started.
        elapsed: Duration,
    },
    /// Overall completion after a phase finished, in percent.
    Overall {
        /// `completed_phases * 100 / total_phases`, rounded down.
        percent: u8,
    },
}

/// Receiver of progress events.
///
/// Called from batch worker threads, so implementations must be thread-safe.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event.
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Point-in-time copy of [`ProgressState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Frames completed in the current batch.
    pub processed: usize,
    /// Frames in the current batch.
    pub total: usize,
    /// Current phase label.
    pub phase: String,
    /// Time since the state was created or last reset.
    pub elapsed: Duration,
}

/// Shared counters for one run.
///
/// The frame counter is incremented lock-free by workers; the phase label is
/// written only by the coordinating thread.
#[derive(Debug)]
pub struct ProgressState {
    processed: AtomicUsize,
    total: AtomicUsize,
    phase: Mutex<String>,
    started: Mutex<Instant>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    /// Start counting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            processed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            phase: Mutex::new(String::new()),
            started: Mutex::new(Instant::now()),
        }
    }

    /// Clear every counter and the phase label, and restart the clock.
    pub fn reset(&self) {
        self.begin_batch(0);
        self.set_phase("");
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Reset the frame counters for a new batch of `total` frames.
    pub fn begin_batch(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
    }

    /// Count one completed frame and return the new count.
    pub fn record_frame(&self) -> usize {
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Frames completed in the current batch.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Frames in the current batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Replace the phase label.
    pub fn set_phase(&self, label: &str) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        label.clone_into(&mut *phase);
    }

    /// Time since the state was created or last reset.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed(),
            total: self.total(),
            phase: self
                .phase
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            elapsed: self.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let state = Arc::new(ProgressState::new());
        state.begin_batch(800);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..100 {
                        state.record_frame();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(state.processed(), 800);
        assert_eq!(state.total(), 800);
    }

    #[test]
    fn begin_batch_resets_counter() {
        let state = ProgressState::new();
        state.begin_batch(3);
        state.record_frame();
        state.begin_batch(5);
        assert_eq!(state.processed(), 0);
        assert_eq!(state.record_frame(), 1);
    }

    #[test]
    fn reset_clears_counters_and_restarts_clock() {
        let state = ProgressState::new();
        state.begin_batch(4);
        state.record_frame();
        state.set_phase("Completed");
        thread::sleep(Duration::from_millis(200));

        state.reset();
        let snap = state.snapshot();
        assert_eq!((snap.processed, snap.total), (0, 0));
        assert_eq!(snap.phase, "");
        assert!(snap.elapsed < Duration::from_millis(200));
    }

    #[test]
    fn snapshot_carries_phase_label() {
        let state = ProgressState::new();
        state.set_phase("Removing watermarks");
        assert_eq!(state.snapshot().phase, "Removing watermarks");
    }

    #[test]
    fn channel_sink_delivers_events() {
        let (tx, rx) = mpsc::channel();
        tx.report(ProgressEvent::Overall { percent: 50 });
        assert_eq!(rx.recv().unwrap(), ProgressEvent::Overall { percent: 50 });

        drop(rx);
        tx.report(ProgressEvent::Overall { percent: 100 });
    }
}
