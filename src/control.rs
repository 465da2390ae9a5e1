//! Cooperative run control: cancellation and pause/resume.
//!
//! Both signals are observed only at frame boundaries, never in the middle of
//! decoding, inpainting, or encoding a frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// How often a paused worker re-checks cancellation.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared, cloneable cancellation flag.
///
/// Cancelling is sticky: once set it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Two-state gate: open lets workers run, closed blocks them at the next
/// frame boundary.
#[derive(Debug, Clone)]
pub struct PauseGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self {
            inner: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }
}

impl PauseGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate.
    pub fn pause(&self) {
        self.set_open(false);
    }

    /// Open the gate and wake every waiting worker.
    pub fn resume(&self) {
        self.set_open(true);
    }

    /// Whether the gate is currently closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        let (lock, _) = &*self.inner;
        !*lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the gate is open or `cancel` fires.
    ///
    /// Returns `false` if it returned because of cancellation.
    pub fn wait(&self, cancel: &CancellationToken) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut open = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            if cancel.is_cancelled() {
                return false;
            }
            open = cvar
                .wait_timeout(open, PAUSE_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !cancel.is_cancelled()
    }

    fn set_open(&self, value: bool) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = value;
        cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn open_gate_does_not_block() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert!(gate.wait(&CancellationToken::new()));
    }

    #[test]
    fn paused_gate_blocks_until_resumed() {
        let gate = PauseGate::new();
        gate.pause();
        let (tx, rx) = mpsc::channel();
        let worker_gate = gate.clone();
        let handle = thread::spawn(move || {
            let passed = worker_gate.wait(&CancellationToken::new());
            tx.send(passed).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        gate.resume();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn cancellation_releases_paused_worker() {
        let gate = PauseGate::new();
        gate.pause();
        let token = CancellationToken::new();
        let (worker_gate, worker_token) = (gate.clone(), token.clone());
        let handle = thread::spawn(move || worker_gate.wait(&worker_token));

        thread::sleep(Duration::from_millis(100));
        token.cancel();
        assert!(!handle.join().unwrap());
        assert!(gate.is_paused());
    }
}
