use crate::model::{Role, StatusSnapshot};
use crate::registry::PeerRegistry;
use crate::state::{now_unix_ms, FrameState, SharedState};
use std::sync::Arc;

#[derive(Clone)]
pub struct StatusFacade {
    state: Arc<SharedState>,
    registry: Arc<PeerRegistry>,
}

impl StatusFacade {
    pub fn new(state: Arc<SharedState>, registry: Arc<PeerRegistry>) -> Self {
        Self { state, registry }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let action = self.state.action();
        let frame = self.state.frame();

        StatusSnapshot {
            current_action: action.action,
            current_speed: action.speed,
            flash_on: action.flash_on,
            action_updated_at: action.updated_at.map(|s| s.unix_ms),
            has_frame: frame.is_some(),
            frame_age_ms: frame
                .as_ref()
                .map(|f| f.updated_at.at.elapsed().as_millis() as u64),
            frame_updated_at: frame.as_ref().map(|f| f.updated_at.unix_ms),
            frame_bytes: frame.as_ref().map(|f| f.bytes.len()).unwrap_or(0),
            last_emergency_stop_at: action.emergency_stop_at,
            devices_connected: self.registry.count(Role::Device),
            controllers_connected: self.registry.count(Role::Controller),
            timestamp: now_unix_ms(),
        }
    }

    pub fn last_frame(&self) -> Option<FrameState> {
        self.state.frame()
    }

    pub fn device_connected(&self) -> bool {
        self.registry.count(Role::Device) > 0
    }
}
