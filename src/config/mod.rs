use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "ROVER_HUB_";
const RESERVED_PATHS: &[&str] = &[
    "/",
    "/health",
    "/status",
    "/frame",
    "/command",
    "/robots/command",
    "/emergency-stop",
];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub outbound_queue: usize,
    pub delivery_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 32,
            delivery_timeout_ms: 2000,
            handshake_timeout_ms: 10_000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            outbound_queue: self.outbound_queue,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub cors_origins: Vec<String>,
    pub static_dir: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://127.0.0.1:8080".to_string(),
                "http://localhost:5173".to_string(),
            ],
            static_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();

        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => Self::from_toml(&raw)
                .map_err(|e| format!("invalid config {}: {}", config_path.display(), e))?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok());

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    // `lookup` receives names without the ROVER_HUB_ prefix
    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server settings
        if let Some(val) = lookup("BIND") {
            self.server.bind = val;
        }
        if let Some(val) = lookup("PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Some(val) = lookup("WS_PATH") {
            self.server.ws_path = val;
        }

        // Relay settings
        if let Some(val) = lookup("OUTBOUND_QUEUE") {
            if let Ok(n) = val.parse() {
                self.relay.outbound_queue = n;
            }
        }
        if let Some(val) = lookup("DELIVERY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.relay.delivery_timeout_ms = ms;
            }
        }
        if let Some(val) = lookup("HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.relay.handshake_timeout_ms = ms;
            }
        }
        if let Some(val) = lookup("MAX_FRAME_BYTES") {
            if let Ok(n) = val.parse() {
                self.relay.max_frame_bytes = n;
            }
        }

        // HTTP settings
        if let Some(val) = lookup("CORS_ORIGINS") {
            self.http.cors_origins = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(val) = lookup("STATIC_DIR") {
            self.http.static_dir = Some(val).filter(|v| !v.trim().is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err(format!("server.bind is not an IP address: {}", self.server.bind).into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if !self.server.ws_path.starts_with('/') {
            return Err("server.ws_path must start with '/'".into());
        }
        if RESERVED_PATHS.contains(&self.server.ws_path.as_str())
            || self.server.ws_path.starts_with("/static")
        {
            return Err(format!("server.ws_path collides with an http route: {}", self.server.ws_path).into());
        }
        if self.relay.outbound_queue == 0 {
            return Err("relay.outbound_queue must be non-zero".into());
        }
        if self.relay.delivery_timeout_ms == 0 {
            return Err("relay.delivery_timeout_ms must be non-zero".into());
        }
        if self.relay.handshake_timeout_ms == 0 {
            return Err("relay.handshake_timeout_ms must be non-zero".into());
        }
        if self.relay.max_frame_bytes == 0 {
            return Err("relay.max_frame_bytes must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        active_config_path()
    }
}

fn active_config_path() -> PathBuf {
    match env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(CONFIG_FILE),
    }
}
