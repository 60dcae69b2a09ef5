use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 2048;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Smallest usable chunk: the 4-byte length prefix plus one data byte.
pub const MIN_STREAM_CHUNK_SIZE: usize = 5;

/// Outcome class of a single scan command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FOUND")]
    Found,
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStatus::Ok => write!(f, "OK"),
            ScanStatus::Found => write!(f, "FOUND"),
            ScanStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Parsed outcome of a SCAN or INSTREAM command.
///
/// Exactly one of `virus` and `error` is non-empty, matching `status`
/// being `Found` or `Error`; both are empty for `Ok`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Verbatim reply line(s) from clamd.
    pub raw: Vec<String>,
    pub status: ScanStatus,
    /// Scanned path, or the literal `"stream"` for INSTREAM.
    pub file_name: String,
    /// Signature name when `status` is `Found`.
    pub virus: String,
    /// clamd-reported error text when `status` is `Error`.
    pub error: String,
    /// Second reply line clamd emits after an ERROR status, when it
    /// arrived within the drain window.
    pub details: Option<String>,
}

/// Address of one clamd backend.
#[derive(Debug, Clone)]
pub enum ClamdAddress {
    Tcp { address: String },
    Unix { path: String },
}

impl ClamdAddress {
    /// Builds an address from the `(network, address)` pair used in
    /// configuration. `network` must be `"tcp"` or `"unix"`.
    pub fn new(network: &str, address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::Config("clamd address must not be empty".to_string()));
        }

        match network {
            "tcp" => Ok(ClamdAddress::Tcp {
                address: address.to_string(),
            }),
            "unix" => Ok(ClamdAddress::Unix {
                path: address.to_string(),
            }),
            other => Err(Error::Config(format!("unknown clamd network: {}", other))),
        }
    }
}

impl fmt::Display for ClamdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClamdAddress::Tcp { address } => write!(f, "tcp://{}", address),
            ClamdAddress::Unix { path } => write!(f, "unix://{}", path),
        }
    }
}

/// Socket-level options of a single connection.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Size of one INSTREAM chunk buffer, length prefix included.
    pub stream_chunk_size: usize,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
        }
    }
}

impl ConnectOpts {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_stream_chunk_size(mut self, size: usize) -> Self {
        self.stream_chunk_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_chunk_size < MIN_STREAM_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "stream chunk size must be at least {} bytes, got {}",
                MIN_STREAM_CHUNK_SIZE, self.stream_chunk_size
            )));
        }
        Ok(())
    }
}

/// Retry policy for an operation. `max_attempts = 0` means "try once".
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl RetryPolicy {
    pub fn new<F>(max_attempts: u32, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            max_attempts,
            backoff: Arc::new(backoff),
        }
    }

    /// Constant interval between attempts.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self::new(max_attempts, move |_| interval)
    }

    /// Sleep duration after the given zero-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// Number of attempts that will actually be made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(0, Duration::from_secs(1))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Options of an IDSESSION-mode session.
#[derive(Debug, Clone)]
pub struct SessionOpts {
    pub heartbeat_interval: Duration,
    pub connect_retries: RetryPolicy,
    /// Command retry is the caller's responsibility: a retried INSTREAM
    /// cannot reuse a spent reader. Carried for callers that wrap the
    /// coordinator, never applied internally.
    pub command_retries: RetryPolicy,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_retries: RetryPolicy::default(),
            command_retries: RetryPolicy::default(),
        }
    }
}

impl SessionOpts {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_retries(mut self, retries: RetryPolicy) -> Self {
        self.connect_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_opts_defaults() {
        let opts = ConnectOpts::default();
        assert_eq!(opts.connect_timeout, Duration::from_secs(5));
        assert_eq!(opts.read_timeout, Duration::from_secs(60));
        assert_eq!(opts.write_timeout, Duration::from_secs(5));
        assert_eq!(opts.stream_chunk_size, 2048);
    }

    #[test]
    fn test_connect_opts_builder() {
        let opts = ConnectOpts::default()
            .with_connect_timeout(Duration::from_secs(1))
            .with_stream_chunk_size(512);
        assert_eq!(opts.connect_timeout, Duration::from_secs(1));
        assert_eq!(opts.stream_chunk_size, 512);
    }

    #[test]
    fn test_connect_opts_chunk_size_validation() {
        assert!(ConnectOpts::default().with_stream_chunk_size(4).validate().is_err());
        assert!(ConnectOpts::default().with_stream_chunk_size(5).validate().is_ok());
    }

    #[test]
    fn test_address_tcp() {
        let address = ClamdAddress::new("tcp", "localhost:3310").unwrap();
        match address {
            ClamdAddress::Tcp { address } => assert_eq!(address, "localhost:3310"),
            _ => panic!("expected tcp address"),
        }
    }

    #[test]
    fn test_address_unix() {
        let address = ClamdAddress::new("unix", "/tmp/clamd.sock").unwrap();
        match address {
            ClamdAddress::Unix { path } => assert_eq!(path, "/tmp/clamd.sock"),
            _ => panic!("expected unix address"),
        }
    }

    #[test]
    fn test_address_unknown_network() {
        let result = ClamdAddress::new("udp", "localhost:3310");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_address_empty() {
        let result = ClamdAddress::new("tcp", "");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_retry_policy_try_once() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 0);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_retry_policy_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(250));
    }

    #[test]
    fn test_session_opts_defaults() {
        let opts = SessionOpts::default();
        assert_eq!(opts.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(opts.connect_retries.attempts(), 1);
    }

    #[test]
    fn test_scan_status_display() {
        assert_eq!(ScanStatus::Ok.to_string(), "OK");
        assert_eq!(ScanStatus::Found.to_string(), "FOUND");
        assert_eq!(ScanStatus::Error.to_string(), "ERROR");
    }
}
