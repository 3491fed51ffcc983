use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEVICE_ROLE_NAME: &str = "esp32";

pub const DEFAULT_SPEED: u8 = 255;

// accepted by POST /command
pub const KNOWN_ACTIONS: &[&str] = &[
    "forward",
    "backward",
    "left",
    "right",
    "stop",
    "flash_on",
    "flash_off",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Device,
    Controller,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Device => f.write_str("device"),
            Role::Controller => f.write_str("controller"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub action: String,
    pub speed: u8,
}

impl Command {
    pub fn new(action: impl Into<String>, speed: Option<i64>) -> Self {
        Self {
            action: action.into(),
            speed: clamp_speed(speed),
        }
    }
}

pub fn clamp_speed(speed: Option<i64>) -> u8 {
    match speed {
        Some(s) => s.clamp(0, u8::MAX as i64) as u8,
        None => DEFAULT_SPEED,
    }
}

pub fn normalize_action(label: &str) -> Option<String> {
    let lowered = label.trim().to_ascii_lowercase();
    if KNOWN_ACTIONS.contains(&lowered.as_str()) {
        Some(lowered)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Command(Command),
    // None: payload follows as the next binary message
    Image(Option<Vec<u8>>),
    Unknown(String),
}

#[derive(Deserialize)]
struct CommandPayload {
    value: String,
    #[serde(default)]
    speed: Option<i64>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = value
            .as_object()
            .ok_or(DecodeError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match tag.as_deref() {
            Some("command") => {
                let payload: CommandPayload = serde_json::from_value(value)?;
                Ok(Self::Command(Command::new(payload.value, payload.speed)))
            }
            Some("image") => match value.get("value").and_then(Value::as_str) {
                Some(encoded) => Ok(Self::Image(Some(decode_inline_image(encoded)?))),
                None => Ok(Self::Image(None)),
            },
            Some(other) => Ok(Self::Unknown(other.to_string())),
            None => Ok(Self::Unknown(String::new())),
        }
    }
}

fn decode_inline_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // Browsers and some firmware send data URLs.
    let raw = match encoded.split_once("base64,") {
        Some((_, rest)) => rest,
        None => encoded,
    };
    general_purpose::STANDARD.decode(raw.trim())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceMessage {
    Action { value: String, speed: u8 },
}

impl From<&Command> for DeviceMessage {
    fn from(command: &Command) -> Self {
        DeviceMessage::Action {
            value: command.action.clone(),
            speed: command.speed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub current_action: String,
    pub current_speed: u8,
    pub flash_on: bool,
    pub action_updated_at: Option<u64>,
    pub has_frame: bool,
    pub frame_age_ms: Option<u64>,
    pub frame_updated_at: Option<u64>,
    pub frame_bytes: usize,
    pub last_emergency_stop_at: Option<u64>,
    pub devices_connected: usize,
    pub controllers_connected: usize,
    pub timestamp: u64,
}
