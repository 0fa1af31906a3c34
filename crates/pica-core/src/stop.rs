//! Cooperative stop control: per-task one-shot pause/cancel tokens.
//!
//! Each running task is registered with a stop token. The REST layer can
//! signal pause or cancel for a task; the download pipeline polls the token
//! at every suspension point and unwinds with a `Stopped` error that the
//! scheduler translates into the `paused` or `canceled` terminal state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// How a task was asked to stop. Pause keeps the staging directory for a
/// later resume; cancel tears it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Pause,
    Cancel,
}

/// Error raised when a task is stopped by user request (pause or cancel).
///
/// This is not a failure: the scheduler downcasts it out of the error chain
/// and records the matching terminal state instead of `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    pub mode: StopMode,
}

impl std::fmt::Display for Stopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            StopMode::Pause => write!(f, "task paused by user"),
            StopMode::Cancel => write!(f, "task canceled by user"),
        }
    }
}

impl std::error::Error for Stopped {}

const MODE_NONE: u8 = 0;
const MODE_PAUSE: u8 = 1;
const MODE_CANCEL: u8 = 2;

/// One-shot stop flag for a single task execution. The first `signal` wins;
/// later signals (and signals of the other mode) are ignored.
#[derive(Debug, Default)]
pub struct StopToken {
    mode: AtomicU8,
}

impl StopToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current mode, `None` while the task is unsignaled. O(1), lock-free.
    pub fn mode(&self) -> Option<StopMode> {
        match self.mode.load(Ordering::Acquire) {
            MODE_PAUSE => Some(StopMode::Pause),
            MODE_CANCEL => Some(StopMode::Cancel),
            _ => None,
        }
    }

    /// Request a stop. Returns true if this call was the winning signal.
    pub fn signal(&self, mode: StopMode) -> bool {
        let raw = match mode {
            StopMode::Pause => MODE_PAUSE,
            StopMode::Cancel => MODE_CANCEL,
        };
        self.mode
            .compare_exchange(MODE_NONE, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Poll the token. Returns `Err(Stopped)` once a stop has been signaled;
    /// call at every suspension point (between HTTP round trips, between
    /// fan-out jobs).
    pub fn check(&self) -> Result<(), Stopped> {
        match self.mode() {
            Some(mode) => Err(Stopped { mode }),
            None => Ok(()),
        }
    }
}

/// Shared registry of task id -> stop token. The scheduler registers a token
/// when a worker picks up a task and unregisters it when the worker exits;
/// the REST layer signals through it. Tokens live only in memory, so a
/// process restart forgets all pending stops by design.
#[derive(Default)]
pub struct StopRegistry {
    tokens: RwLock<HashMap<String, Arc<StopToken>>>,
}

impl StopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for a task about to run.
    pub fn register(&self, task_id: &str) -> Arc<StopToken> {
        let token = StopToken::new();
        self.tokens
            .write()
            .unwrap()
            .insert(task_id.to_string(), Arc::clone(&token));
        token
    }

    /// Drop the token when the worker exits (any terminal state).
    pub fn unregister(&self, task_id: &str) {
        self.tokens.write().unwrap().remove(task_id);
    }

    /// Signal a running task. Returns false if no worker owns the task.
    pub fn signal(&self, task_id: &str, mode: StopMode) -> bool {
        match self.tokens.read().unwrap().get(task_id) {
            Some(token) => {
                token.signal(mode);
                true
            }
            None => false,
        }
    }
}
