//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// TCP listener settings.
    pub tcp: TcpSection,
    /// Reliable-UDP settings.
    pub udp: UdpSection,
    /// Message pipeline settings, shared by both transports.
    pub pipeline: PipelineSection,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpSection {
    /// Interface to bind.
    pub bind_address: String,
    /// Listening port.
    pub port: u16,
    /// Maximum concurrent sessions; further clients wait in the backlog.
    pub max_sessions: u32,
    /// Per-session read buffer in bytes.
    pub recv_buffer_size: usize,
    /// Disable Nagle's algorithm on every stream.
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds, `None` to disable.
    pub keepalive_secs: Option<u64>,
}

/// Reliable-UDP configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UdpSection {
    /// Interface to bind.
    pub bind_address: String,
    /// Listening port.
    pub port: u16,
    /// Session tick period in milliseconds.
    pub tick_ms: u64,
    /// ARQ internal flush interval in milliseconds, 10..=5000.
    pub interval_ms: u32,
    /// Maximum datagram size.
    pub mtu: usize,
    /// ARQ send window in segments.
    pub send_window: u16,
    /// ARQ receive window in segments.
    pub recv_window: u16,
    /// Duplicate acks before fast retransmit, 0 disables.
    pub fast_resend: u32,
    /// Ack immediately with the aggressive retransmit floor.
    pub nodelay: bool,
    /// Enable the ARQ congestion window.
    pub congestion_control: bool,
    /// Datagram and reassembly buffer in bytes.
    pub recv_buffer_size: usize,
    /// Seconds an issued conv waits for the client's first datagram.
    pub handshake_ttl_secs: u64,
}

/// Message pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    /// Enable LZ4 compression.
    pub compression: bool,
    /// Payloads smaller than this are sent uncompressed.
    pub compression_threshold: usize,
    /// AES-256-GCM key as 64 hex characters, `None` for plaintext.
    pub encryption_key: Option<String>,
    /// Largest accepted frame payload in bytes.
    pub max_frame_size: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Log active session counts once per second.
    pub log_stats: bool,
}

// --- Default implementations ---

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            max_sessions: 256,
            recv_buffer_size: 2048,
            nodelay: true,
            keepalive_secs: Some(30),
        }
    }
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7778,
            tick_ms: 10,
            interval_ms: 10,
            mtu: 512,
            send_window: 64,
            recv_window: 64,
            fast_resend: 2,
            nodelay: true,
            congestion_control: false,
            recv_buffer_size: 2048,
            handshake_ttl_secs: 10,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            compression: true,
            compression_threshold: 256,
            encryption_key: None,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_stats: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Default config directory: `<platform config dir>/lattice`.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("lattice"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 7777"));
        assert!(ron_str.contains("mtu: 512"));
        assert!(ron_str.contains("max_frame_size: 1048576"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.pipeline.encryption_key = Some("00".repeat(32));
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(tcp: (port: 9000), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.tcp.port, 9000);
        assert_eq!(config.tcp.max_sessions, 256);
        assert_eq!(config.udp, UdpSection::default());
        assert_eq!(config.pipeline, PipelineSection::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.tcp.port = 9100;
        config.udp.tick_ms = 20;
        config.pipeline.compression = false;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.udp.mtu = 1200;
        modified.udp.interval_ms = 40;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(
            result.map(|c| (c.udp.mtu, c.udp.interval_ms)),
            Some((1200, 40))
        );
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_ron_comments_accepted() {
        let ron_str = "// This is a comment\n(\n  // Another comment\n)";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config, Config::default());
    }
}
