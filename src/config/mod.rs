use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::clamd::types::MIN_STREAM_CHUNK_SIZE;
use crate::clamd::{ClamdAddress, ConnectOpts, CoordinatorOpts, RetryPolicy, SessionOpts};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub clamd: ClamdConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClamdConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_connect_retry_interval")]
    pub connect_retry_interval_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "unix".to_string()
}

fn default_address() -> String {
    "/var/run/clamav/clamd.ctl".to_string()
}

fn default_min_workers() -> usize {
    5
}

fn default_max_workers() -> usize {
    5
}

fn default_connect_max_retries() -> u32 {
    3
}

fn default_connect_retry_interval() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    5
}

fn default_stream_chunk_size() -> usize {
    2048
}

fn default_heartbeat_interval() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ClamdConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_address(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            connect_max_retries: default_connect_max_retries(),
            connect_retry_interval_ms: default_connect_retry_interval(),
            connect_timeout_seconds: default_connect_timeout(),
            read_timeout_seconds: default_read_timeout(),
            write_timeout_seconds: default_write_timeout(),
            stream_chunk_size: default_stream_chunk_size(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Loads the first config file found in the default locations, or
    /// the built-in defaults when none exists.
    pub async fn load_from_default_locations() -> Result<Self> {
        let locations = vec![
            PathBuf::from("/etc/clamgate/config.toml"),
            dirs::config_dir()
                .map(|d| d.join("clamgate/config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|d| d.join(".clamgate/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in locations {
            if path.exists() {
                tracing::info!("Loading config from: {:?}", path);
                return Self::load(path).await;
            }
        }

        tracing::info!("No config file found, using defaults");
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // fail fast on addresses the dialer would reject later
        ClamdAddress::new(&self.clamd.network, &self.clamd.address)?;

        if self.clamd.min_workers == 0 {
            return Err(Error::Config("minWorkers must be at least 1".to_string()));
        }
        if self.clamd.max_workers < self.clamd.min_workers {
            return Err(Error::Config(
                "maxWorkers must not be smaller than minWorkers".to_string(),
            ));
        }
        if self.clamd.stream_chunk_size < MIN_STREAM_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "streamChunkSize must be at least {} bytes",
                MIN_STREAM_CHUNK_SIZE
            )));
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }
}

impl ClamdConfig {
    pub fn address(&self) -> Result<ClamdAddress> {
        ClamdAddress::new(&self.network, &self.address)
    }

    pub fn connect_opts(&self) -> ConnectOpts {
        ConnectOpts::default()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
            .with_read_timeout(Duration::from_secs(self.read_timeout_seconds))
            .with_write_timeout(Duration::from_secs(self.write_timeout_seconds))
            .with_stream_chunk_size(self.stream_chunk_size)
    }

    pub fn session_opts(&self) -> SessionOpts {
        let retry_interval = Duration::from_millis(self.connect_retry_interval_ms);
        SessionOpts::default()
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_seconds))
            .with_connect_retries(RetryPolicy::fixed(self.connect_max_retries, retry_interval))
    }

    pub fn coordinator_opts(&self, shutdown_timeout: Duration) -> CoordinatorOpts {
        CoordinatorOpts {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            autoscale: false,
            shutdown_timeout,
        }
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".config")))
    }

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .ok()
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.log.level, "info");
        assert!(!config.cors.enabled);
        assert_eq!(config.clamd.network, "unix");
        assert_eq!(config.clamd.min_workers, 5);
        assert_eq!(config.clamd.stream_chunk_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full() {
        let raw = r#"
[server]
host = "127.0.0.1"
port = 9090
shutdown_timeout_seconds = 30

[log]
level = "debug"

[cors]
enabled = true

[clamd]
network = "tcp"
address = "localhost:3310"
min_workers = 2
max_workers = 4
connect_max_retries = 5
connect_retry_interval_ms = 200
connect_timeout_seconds = 2
read_timeout_seconds = 120
write_timeout_seconds = 3
stream_chunk_size = 4096
heartbeat_interval_seconds = 15
"#;

        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.log.level, "debug");
        assert!(config.cors.enabled);
        assert_eq!(config.clamd.network, "tcp");
        assert_eq!(config.clamd.max_workers, 4);

        let connect_opts = config.clamd.connect_opts();
        assert_eq!(connect_opts.connect_timeout, Duration::from_secs(2));
        assert_eq!(connect_opts.read_timeout, Duration::from_secs(120));
        assert_eq!(connect_opts.stream_chunk_size, 4096);

        let session_opts = config.clamd.session_opts();
        assert_eq!(session_opts.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(session_opts.connect_retries.attempts(), 5);
    }

    #[test]
    fn test_partial_sections_get_defaults() {
        let raw = r#"
[clamd]
network = "tcp"
address = "localhost:3310"
"#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.clamd.min_workers, 5);
        assert_eq!(config.clamd.heartbeat_interval_seconds, 10);
    }

    #[test]
    fn test_invalid_network_rejected() {
        let raw = r#"
[clamd]
network = "udp"
address = "localhost:3310"
"#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let raw = r#"
[clamd]
min_workers = 0
"#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_small_chunk_size_rejected() {
        let raw = r#"
[clamd]
stream_chunk_size = 4
"#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_max_workers_below_min_rejected() {
        let raw = r#"
[clamd]
min_workers = 5
max_workers = 2
"#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
