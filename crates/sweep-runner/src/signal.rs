//! One-shot run signals shared between the scheduler, output monitors and
//! the command listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessHit {
    pub index: u64,
    pub line: String,
}

/// What the scheduler sees at its single per-iteration observation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Success(SuccessHit),
    Save,
    Quiet,
}

#[derive(Debug)]
struct Shared {
    success: Mutex<Option<SuccessHit>>,
    success_set: AtomicBool,
    save: AtomicBool,
    wake: Sender<()>,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

/// Receiving side of the coordinator's wake channel; owned by the scheduler.
#[derive(Debug)]
pub struct WakeReceiver {
    rx: Receiver<()>,
}

impl WakeReceiver {
    /// Blocks until something pokes the coordinator or `timeout` elapses,
    /// then drains any further pending wakes.
    pub fn wait(&self, timeout: Duration) {
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(timeout),
        }
        while self.rx.try_recv().is_ok() {}
    }
}

impl Coordinator {
    pub fn new() -> (Self, WakeReceiver) {
        let (tx, rx) = mpsc::channel();
        let shared = Shared {
            success: Mutex::new(None),
            success_set: AtomicBool::new(false),
            save: AtomicBool::new(false),
            wake: tx,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            WakeReceiver { rx },
        )
    }

    /// Records a success line if none has been recorded yet. Returns whether
    /// this call won.
    pub fn record_success(&self, index: u64, line: impl Into<String>) -> bool {
        let won = {
            let mut slot = self
                .shared
                .success
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                false
            } else {
                *slot = Some(SuccessHit {
                    index,
                    line: line.into(),
                });
                self.shared.success_set.store(true, Ordering::Release);
                true
            }
        };
        if won {
            self.wake();
        }
        won
    }

    pub fn success_found(&self) -> bool {
        self.shared.success_set.load(Ordering::Acquire)
    }

    pub fn success(&self) -> Option<SuccessHit> {
        self.shared
            .success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the save flag. Only the first call returns true.
    pub fn request_save(&self) -> bool {
        let first = !self.shared.save.swap(true, Ordering::AcqRel);
        if first {
            self.wake();
        }
        first
    }

    pub fn save_requested(&self) -> bool {
        self.shared.save.load(Ordering::Acquire)
    }

    /// Success takes priority over save.
    pub fn observe(&self) -> Observation {
        if let Some(hit) = self.success() {
            return Observation::Success(hit);
        }
        if self.save_requested() {
            return Observation::Save;
        }
        Observation::Quiet
    }

    pub fn wake(&self) {
        let _ = self.shared.wake.send(());
    }
}
