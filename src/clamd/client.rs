use tokio::io::AsyncRead;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use super::conn::{ClamdStream, Connection};
use super::types::{ClamdAddress, ConnectOpts, ScanResult};
use crate::error::{Error, Result};

/// One clamd backend: an address plus connection options.
///
/// Offers one-shot commands that dial, run one command and close. For
/// many commands over one connection, open a
/// [`Session`](super::session::Session) instead.
#[derive(Debug, Clone)]
pub struct Clamd {
    address: ClamdAddress,
    opts: ConnectOpts,
}

impl Clamd {
    pub fn new(address: ClamdAddress) -> Self {
        Self {
            address,
            opts: ConnectOpts::default(),
        }
    }

    pub fn with_opts(mut self, opts: ConnectOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn address(&self) -> &ClamdAddress {
        &self.address
    }

    /// Dials the backend and hands ownership of the socket to a new
    /// [`Connection`].
    pub async fn connect(&self) -> Result<Connection> {
        debug!(address = %self.address, "connecting to clamd");

        let stream = match &self.address {
            ClamdAddress::Tcp { address } => {
                let stream = timeout(self.opts.connect_timeout, TcpStream::connect(address))
                    .await
                    .map_err(|_| {
                        Error::Timeout(format!("connection to {} timed out", address))
                    })?
                    .map_err(|e| Error::Connect(format!("unable to connect to {}: {}", address, e)))?;
                ClamdStream::Tcp(stream)
            }
            #[cfg(unix)]
            ClamdAddress::Unix { path } => {
                let stream = timeout(self.opts.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| Error::Timeout(format!("connection to {} timed out", path)))?
                    .map_err(|e| Error::Connect(format!("unable to connect to {}: {}", path, e)))?;
                ClamdStream::Unix(stream)
            }
            #[cfg(not(unix))]
            ClamdAddress::Unix { .. } => {
                return Err(Error::Connect(
                    "unix sockets are not supported on this platform".to_string(),
                ));
            }
        };

        Ok(Connection::new(stream, &self.opts))
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connect().await?;
        let (_, pong) = conn.ping().await?;
        conn.close().await?;
        Ok(pong)
    }

    pub async fn version(&self) -> Result<String> {
        let mut conn = self.connect().await?;
        let (_, version) = conn.version().await?;
        conn.close().await?;
        Ok(version)
    }

    pub async fn stats(&self) -> Result<String> {
        let mut conn = self.connect().await?;
        let (_, stats) = conn.stats().await?;
        conn.close().await?;
        Ok(stats)
    }

    pub async fn scan(&self, path: &str) -> Result<ScanResult> {
        let mut conn = self.connect().await?;
        let (_, result) = conn.scan(path).await?;
        conn.close().await?;
        Ok(result)
    }

    pub async fn instream<R>(&self, reader: &mut R) -> Result<ScanResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut conn = self.connect().await?;
        let (_, result) = conn.instream(reader).await?;
        conn.close().await?;
        Ok(result)
    }
}
