use crate::model::DEFAULT_SPEED;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// Recovers the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub unix_ms: u64,
    pub at: Instant,
}

impl Stamp {
    pub fn now() -> Self {
        Self {
            unix_ms: now_unix_ms(),
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionState {
    pub action: String,
    pub speed: u8,
    pub flash_on: bool,
    pub updated_at: Option<Stamp>,
    pub emergency_stop_at: Option<u64>,
}

impl Default for ActionState {
    fn default() -> Self {
        Self {
            action: "stop".to_string(),
            speed: DEFAULT_SPEED,
            flash_on: false,
            updated_at: None,
            emergency_stop_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameState {
    pub bytes: Arc<[u8]>,
    pub updated_at: Stamp,
}

#[derive(Debug, Default)]
pub struct SharedState {
    action: Mutex<ActionState>,
    frame: Mutex<Option<FrameState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    // Only flash_on/flash_off change the lamp.
    pub fn set_action(&self, action: &str, speed: u8) -> ActionState {
        let mut current = lock(&self.action);
        let flash_on = match action {
            "flash_on" => true,
            "flash_off" => false,
            _ => current.flash_on,
        };
        *current = ActionState {
            action: action.to_string(),
            speed,
            flash_on,
            updated_at: Some(Stamp::now()),
            emergency_stop_at: current.emergency_stop_at,
        };
        current.clone()
    }

    pub fn mark_emergency_stop(&self) -> u64 {
        let at = now_unix_ms();
        lock(&self.action).emergency_stop_at = Some(at);
        at
    }

    pub fn action(&self) -> ActionState {
        lock(&self.action).clone()
    }

    pub fn set_frame(&self, bytes: Arc<[u8]>) -> Stamp {
        let stamp = Stamp::now();
        *lock(&self.frame) = Some(FrameState {
            bytes,
            updated_at: stamp,
        });
        stamp
    }

    pub fn frame(&self) -> Option<FrameState> {
        lock(&self.frame).clone()
    }
}
