use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("Coordinator is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
