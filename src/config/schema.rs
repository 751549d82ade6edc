//! Configuration schema
//!
//! Sectioned configuration with per-section defaults, loadable from a TOML
//! file. Missing sections and fields fall back to their defaults so a
//! minimal config file stays minimal.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, StreamError};
use crate::qos::QosConfig;
use crate::transport::server::TransportProtocol;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Network and session settings
    pub network: NetworkConfig,
    /// Video stream settings
    pub video: VideoConfig,
    /// Audio stream settings
    pub audio: AudioConfig,
    /// QoS control loop tuning
    pub qos: QosConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(StreamError::Io)?;
        toml::from_str(&text).map_err(|e| StreamError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address
    pub bind_address: String,
    /// Listen port (0 picks an ephemeral port)
    pub port: u16,
    /// Transport protocol
    pub protocol: TransportProtocol,
    /// Optional passphrase; enables whole-message encryption
    pub passphrase: Option<String>,
    /// Maximum concurrent connected clients
    pub max_subscribers: usize,
    /// Seconds of silence before a session is timed out
    pub idle_timeout_secs: f32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1235,
            protocol: TransportProtocol::Tcp,
            passphrase: None,
            max_subscribers: 4,
            idle_timeout_secs: 10.0,
        }
    }
}

/// Video stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Encoded stream width
    pub width: u32,
    /// Encoded stream height
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: i64,
    /// Target framerate
    pub framerate: f32,
    /// Request HDR encoding when the encoder supports it
    pub hdr: bool,
    /// Letterbox instead of stretching on aspect-ratio mismatch
    pub preserve_aspect_ratio: bool,
    /// Intra-refresh period in frames (0 disables)
    pub intra_refresh_period: i64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            bitrate: 20_000_000,
            framerate: 60.0,
            hdr: false,
            preserve_aspect_ratio: true,
            intra_refresh_period: 0,
        }
    }
}

/// Audio stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output sampling rate
    pub sampling_rate: u32,
    /// Output channel count
    pub channels: u32,
    /// Target bitrate in bits per second
    pub bitrate: i64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 48_000,
            channels: 2,
            bitrate: 256_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.network.port, 1235);
        assert_eq!(config.video.framerate, 60.0);
        assert_eq!(config.audio.channels, 2);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[network]\nport = 9000\npassphrase = \"secret\"\n\n[video]\nbitrate = 5000000\n"
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.passphrase.as_deref(), Some("secret"));
        assert_eq!(config.video.bitrate, 5_000_000);
        // Unspecified fields keep their defaults
        assert_eq!(config.video.width, 1920);
        assert_eq!(config.network.max_subscribers, 4);
    }

    #[test]
    fn test_bad_file_reports_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "network = \"not a table\"").unwrap();
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }
}
