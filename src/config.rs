//! Konfiguration für Signaling und Calls
//!
//! Alle ehemals globalen Konstanten (Sample Rate, Frame-Dauer, ICE Server)
//! werden als expliziter Wert bei der Session-Erstellung übergeben.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Frame-Dauer in Millisekunden (fest)
pub const FRAME_DURATION_MS: u32 = 20;

/// Maximale Größe eines kodierten Frames
pub const MAX_ENCODED_SIZE: usize = 4000;

/// Sample Rates, die Opus unterstützt
const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Server inkl. optionaler Credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Medien-Parameter einer Call-Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub ice_servers: Vec<IceServerConfig>,
    pub max_reassembly_depth: usize,
    pub send_queue_capacity: usize,
    pub receive_queue_capacity: usize,
    pub max_encoded_size: usize,
    /// Lebensdauer eines Invites, danach wird aufgelegt
    pub invite_lifetime_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: FRAME_DURATION_MS,
            ice_servers: default_ice_servers(),
            max_reassembly_depth: 10,
            send_queue_capacity: 50,
            receive_queue_capacity: 50,
            max_encoded_size: MAX_ENCODED_SIZE,
            invite_lifetime_ms: 60_000,
        }
    }
}

impl CallConfig {
    /// Samples pro Frame (20ms @ 48kHz = 960 samples)
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Fügt einen TURN-Server hinzu
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_duration_ms != FRAME_DURATION_MS {
            return Err(ConfigError::Invalid(format!(
                "frameDurationMs must be {}, got {}",
                FRAME_DURATION_MS, self.frame_duration_ms
            )));
        }
        if !OPUS_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "unsupported sampleRate {}",
                self.sample_rate
            )));
        }
        if self.max_reassembly_depth == 0 {
            return Err(ConfigError::Invalid(
                "maxReassemblyDepth must be at least 1".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 || self.receive_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        if self.max_encoded_size == 0 {
            return Err(ConfigError::Invalid(
                "maxEncodedSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SIGNALING CONFIG
// ============================================================================

/// Zugangsdaten und Raum für den Matrix Homeserver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingConfig {
    pub homeserver: String,
    pub username: String,
    pub password: String,
    pub room_id: String,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl SignalingConfig {
    pub fn new(
        homeserver: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            homeserver: homeserver.into(),
            username: username.into(),
            password: password.into(),
            room_id: room_id.into(),
            sync_timeout_ms: default_sync_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.homeserver)
            .map_err(|e| ConfigError::Invalid(format!("homeserver: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "homeserver must be http(s), got {}",
                url.scheme()
            )));
        }
        if self.room_id.is_empty() {
            return Err(ConfigError::Invalid("roomId must not be empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub call: CallConfig,
}

impl ClientConfig {
    pub fn new(signaling: SignalingConfig) -> Self {
        Self {
            signaling,
            call: CallConfig::default(),
        }
    }

    /// Lädt die Konfiguration aus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        fn var(name: &'static str) -> Result<String, ConfigError> {
            std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
        }

        let signaling = SignalingConfig::new(
            var("PULSE_HOMESERVER")?,
            var("PULSE_USER")?,
            var("PULSE_PASSWORD")?,
            var("PULSE_ROOM")?,
        );

        let mut call = CallConfig::default();
        if let Ok(turn_url) = std::env::var("PULSE_TURN_URL") {
            call = call.with_turn_server(
                turn_url,
                std::env::var("PULSE_TURN_USER").unwrap_or_default(),
                std::env::var("PULSE_TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        let config = Self { signaling, call };
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Standard-Pfad der Konfigurationsdatei
    ///
    /// - Linux: `~/.config/pulse-call/config.json`
    /// - macOS: `~/Library/Application Support/com.kaufm.pulse-call/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("com", "kaufm", "pulse-call")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join("config.json"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.signaling.validate()?;
        self.call.validate()
    }
}

// ============================================================================
// TESTS
// ============================================================================
