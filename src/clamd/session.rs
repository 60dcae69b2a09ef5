use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::client::Clamd;
use super::conn::Connection;
use super::types::{ScanResult, SessionOpts};
use crate::error::{Error, Result};

/// A connection that has switched into IDSESSION mode: clamd prefixes
/// every reply with a monotonically increasing request id.
///
/// A session is not internally synchronised. It is owned and driven by
/// exactly one worker; the heartbeat and the command path run on the
/// same task and never race.
pub struct Session {
    id: u64,
    opts: SessionOpts,
    clamd: Clamd,
    conn: Option<Connection>,
}

impl Session {
    /// Dials the backend with the configured retry policy and performs
    /// the IDSESSION handshake.
    pub async fn open(id: u64, clamd: Clamd, opts: SessionOpts) -> Result<Self> {
        let mut session = Self {
            id,
            opts,
            clamd,
            conn: None,
        };

        session.connect().await?;

        if let Err(err) = session.conn_mut()?.idsession().await {
            if let Some(mut conn) = session.conn.take() {
                conn.close().await.ok();
            }
            return Err(Error::Session(format!("unable to open session: {}", err)));
        }

        debug!(session_id = id, "clamd session open");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ends the session and closes the socket. Closing an already
    /// closed session is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        if let Err(err) = conn.end().await {
            conn.close().await.ok();
            return Err(Error::Session(format!("unable to end session: {}", err)));
        }

        conn.close().await?;
        debug!(session_id = self.id, "clamd session closed");
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(u64, String)> {
        self.conn_mut()?.ping().await
    }

    pub async fn version(&mut self) -> Result<(u64, String)> {
        self.conn_mut()?.version().await
    }

    pub async fn stats(&mut self) -> Result<(u64, String)> {
        self.conn_mut()?.stats().await
    }

    pub async fn scan(&mut self, path: &str) -> Result<(u64, ScanResult)> {
        self.conn_mut()?.scan(path).await
    }

    pub async fn instream<R>(&mut self, reader: &mut R) -> Result<(u64, ScanResult)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.conn_mut()?.instream(reader).await
    }

    /// Keeps the session alive with a PING and verifies the reply.
    pub async fn heartbeat(&mut self) -> Result<()> {
        let (_, pong) = self
            .ping()
            .await
            .map_err(|err| Error::Session(format!("missed heartbeat: {}", err)))?;

        if pong != "PONG" {
            return Err(Error::Session(format!(
                "missed heartbeat: invalid ping reply '{}'",
                pong
            )));
        }

        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let retries = self.opts.connect_retries.clone();
        let attempts = retries.attempts();

        let mut last_err = None;
        for attempt in 0..attempts {
            match self.clamd.connect().await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        session_id = self.id,
                        attempt,
                        error = %err,
                        "clamd connect attempt failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(retries.backoff(attempt)).await;
                    }
                }
            }
        }

        let last_err = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::Session(format!("max retries reached: {}", last_err)))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Session("session is closed".to_string()))
    }
}
