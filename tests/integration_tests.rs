use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use clamgate::clamd::{Clamd, ClamdAddress};
use clamgate::config::Config;
use clamgate::error::Error;

#[tokio::test]
async fn test_config_integration() {
    let config_content = r#"
[server]
host = "127.0.0.1"
port = 9090
shutdown_timeout_seconds = 5

[log]
level = "debug"

[clamd]
network = "tcp"
address = "localhost:3310"
min_workers = 3
max_workers = 3
connect_max_retries = 2
connect_retry_interval_ms = 100
heartbeat_interval_seconds = 1
"#;

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::load(temp_file.path()).await.unwrap();

    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.clamd.min_workers, 3);

    // the parsed config wires straight into the clamd layer
    let session_opts = config.clamd.session_opts();
    assert_eq!(session_opts.heartbeat_interval, Duration::from_secs(1));
    assert_eq!(session_opts.connect_retries.attempts(), 2);
    assert_eq!(
        session_opts.connect_retries.backoff(0),
        Duration::from_millis(100)
    );

    let coordinator_opts = config.clamd.coordinator_opts(config.shutdown_timeout());
    assert_eq!(coordinator_opts.min_workers, 3);
    assert_eq!(coordinator_opts.shutdown_timeout, Duration::from_secs(5));

    let backend = Clamd::new(config.clamd.address().unwrap());
    match backend.address() {
        ClamdAddress::Tcp { address } => assert_eq!(address, "localhost:3310"),
        other => panic!("expected tcp address, got {}", other),
    }
}

#[tokio::test]
async fn test_config_validation_integration() {
    let invalid_config = r#"
[clamd]
network = "carrier-pigeon"
address = "somewhere"
"#;

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(invalid_config.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let result = Config::load(temp_file.path()).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_config_missing_file() {
    let result = Config::load("/no/such/clamgate/config.toml").await;
    assert!(matches!(result, Err(Error::Config(_))));
}
