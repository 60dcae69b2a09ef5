use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::trace;

use super::parser;
use super::types::{ConnectOpts, ScanResult, ScanStatus};
use crate::error::{Error, Result};

const CMD_INITIALIZER: u8 = b'z';
const CMD_TERMINATOR: u8 = 0x00;

/// How long to wait for the second reply line clamd emits after an
/// ERROR status. There is no in-protocol way to know whether the line
/// is coming, so the wait is bounded.
const ERROR_DETAILS_TIMEOUT: Duration = Duration::from_millis(100);

/// One live byte stream to a clamd backend.
pub enum ClamdStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ClamdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            ClamdStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClamdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClamdStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            ClamdStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            ClamdStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClamdStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            ClamdStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Owns one socket to clamd and speaks the command framing on it.
///
/// Every read and write is bounded by a fresh deadline taken from the
/// connection options. Commands must be issued one at a time; the
/// session and coordinator layers enforce that.
pub struct Connection {
    stream: BufReader<ClamdStream>,
    read_timeout: Duration,
    write_timeout: Duration,
    stream_chunk_size: usize,
}

impl Connection {
    pub(crate) fn new(stream: ClamdStream, opts: &ConnectOpts) -> Self {
        Self {
            stream: BufReader::new(stream),
            read_timeout: opts.read_timeout,
            write_timeout: opts.write_timeout,
            stream_chunk_size: opts.stream_chunk_size,
        }
    }

    /// Shuts the socket down. Dropping the connection afterwards (or
    /// instead) releases it either way.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(u64, String)> {
        self.simple_command("PING").await
    }

    pub async fn version(&mut self) -> Result<(u64, String)> {
        self.simple_command("VERSION").await
    }

    pub async fn stats(&mut self) -> Result<(u64, String)> {
        self.simple_command("STATS").await
    }

    pub async fn scan(&mut self, path: &str) -> Result<(u64, ScanResult)> {
        self.send_command(&format!("SCAN {}", path)).await?;
        self.recv_scan_reply().await
    }

    /// Streams `reader` to clamd as length-prefixed chunks and returns
    /// the scan reply. The reply's file name is the literal `"stream"`.
    pub async fn instream<R>(&mut self, reader: &mut R) -> Result<(u64, ScanResult)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.send_command("INSTREAM").await?;

        // first 4 bytes of the buffer are reserved for the length prefix
        let mut buf = vec![0u8; self.stream_chunk_size];
        loop {
            let n = reader.read(&mut buf[4..]).await?;
            if n == 0 {
                break;
            }

            buf[..4].copy_from_slice(&(n as u32).to_be_bytes());
            self.write_with_deadline(&buf[..n + 4]).await?;
        }

        // zero-length chunk terminates the upload
        self.write_with_deadline(&0u32.to_be_bytes()).await?;

        self.recv_scan_reply().await
    }

    pub async fn idsession(&mut self) -> Result<()> {
        self.send_command("IDSESSION").await
    }

    pub async fn end(&mut self) -> Result<()> {
        self.send_command("END").await
    }

    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        let mut frame = Vec::with_capacity(command.len() + 2);
        frame.push(CMD_INITIALIZER);
        frame.extend_from_slice(command.as_bytes());
        frame.push(CMD_TERMINATOR);

        self.write_with_deadline(&frame).await
    }

    /// Reads up to and including the next null terminator and returns
    /// the content without it. End-of-stream after at least one byte
    /// counts as a terminator: it may be the last byte on a half-closed
    /// socket. End-of-stream before any byte means the peer closed the
    /// connection and is an error, not an empty line.
    pub async fn recv_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let n = timeout(
            self.read_timeout,
            self.stream.read_until(CMD_TERMINATOR, &mut line),
        )
        .await
        .map_err(|_| Error::Timeout("read deadline exceeded".to_string()))??;

        if n == 0 {
            return Err(Error::Protocol(
                "connection closed before reply".to_string(),
            ));
        }

        if line.last() == Some(&CMD_TERMINATOR) {
            line.pop();
        }

        String::from_utf8(line).map_err(|e| Error::Protocol(format!("invalid UTF-8 in reply: {}", e)))
    }

    async fn recv_scan_reply(&mut self) -> Result<(u64, ScanResult)> {
        let status_line = self.recv_line().await?;
        let (request_id, mut result) = parser::parse_scan_reply(&status_line)?;

        if result.status == ScanStatus::Error {
            // clamd duplicates the error on a second null-terminated
            // line. A session must drain it or the next command reads
            // stale data, but clamd does not always send it, so the
            // wait is bounded and an absent line is abandoned.
            match timeout(ERROR_DETAILS_TIMEOUT, self.recv_line()).await {
                Ok(Ok(second_line)) => {
                    result.raw.push(second_line.clone());
                    result.details = Some(second_line);
                }
                Ok(Err(_)) | Err(_) => {
                    trace!("no second line after ERROR reply");
                }
            }
        }

        Ok((request_id, result))
    }

    async fn simple_command(&mut self, command: &str) -> Result<(u64, String)> {
        self.send_command(command).await?;
        let reply = self.recv_line().await?;
        parser::parse_generic_reply(&reply)
    }

    async fn write_with_deadline(&mut self, buf: &[u8]) -> Result<()> {
        timeout(self.write_timeout, self.stream.write_all(buf))
            .await
            .map_err(|_| Error::Timeout("write deadline exceeded".to_string()))??;
        Ok(())
    }
}
