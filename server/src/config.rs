//! Configuration management for DuoCall Server

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub matching: MatchingConfig,
    pub ice: IceConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
    pub guest_session_hours: i64,
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Waiting requests older than this are cancelled by cleanup.
    pub stale_request_minutes: i64,
    /// Sessions stuck in `connecting` longer than this are ended with `timeout`.
    pub stale_session_minutes: i64,
    /// Upper bound on claim retries for a single arrival.
    pub max_claim_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub secret: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_signal_size_kb: u64,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9443,
            },
            storage: StorageConfig {
                database_path: "./data/duocall.db".to_string(),
                guest_session_hours: 24,
                cleanup_interval_minutes: 5,
            },
            matching: MatchingConfig {
                stale_request_minutes: 60,
                stale_session_minutes: 10,
                max_claim_attempts: 16,
            },
            ice: IceConfig {
                stun_urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                turn: None,
            },
            limits: LimitsConfig {
                max_signal_size_kb: 64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.matching.stale_request_minutes, 60);
        assert_eq!(parsed.server.port, 9443);
        assert!(parsed.ice.turn.is_none());
    }
}
