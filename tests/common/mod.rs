//! In-process clamd stand-in for integration tests.
//!
//! Listens on a loopback TCP socket and speaks the clamd framing:
//! null-terminated `z`-prefixed commands, null-terminated replies,
//! IDSESSION request-id prefixes, INSTREAM length-prefixed chunks and
//! the duplicated second line after an ERROR scan reply.

use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const EICAR: &[u8] = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

pub const MOCK_VERSION: &str = "ClamAV 1.4.3/27500/Tue Jul 29 09:32:11 2025";

pub struct MockClamd {
    pub address: String,
    handle: JoinHandle<()>,
}

impl Drop for MockClamd {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn() -> MockClamd {
    spawn_with_limit(None).await
}

/// A daemon that abruptly drops every connection once it has received
/// `max_commands` commands on it, to exercise worker supervision.
pub async fn spawn_flaky(max_commands: usize) -> MockClamd {
    spawn_with_limit(Some(max_commands)).await
}

async fn spawn_with_limit(max_commands: Option<usize>) -> MockClamd {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_connection(stream, max_commands));
        }
    });

    MockClamd { address, handle }
}

async fn serve_connection(stream: TcpStream, max_commands: Option<usize>) {
    let mut stream = BufReader::new(stream);
    let mut in_session = false;
    let mut request_id: u64 = 0;
    let mut commands_seen: usize = 0;

    loop {
        let mut raw = Vec::new();
        match stream.read_until(0, &mut raw).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(_) => return,
        }
        if raw.last() == Some(&0) {
            raw.pop();
        }

        let Ok(command) = String::from_utf8(raw) else {
            return;
        };
        let Some(command) = command.strip_prefix('z') else {
            return;
        };

        commands_seen += 1;
        // drop the connection mid-command to simulate a dying daemon
        if let Some(limit) = max_commands {
            if commands_seen > limit {
                return;
            }
        }

        match command {
            "IDSESSION" => {
                in_session = true;
                request_id = 0;
                continue;
            }
            "END" => {
                return;
            }
            _ => {}
        }

        if in_session {
            request_id += 1;
        }
        let prefix = if in_session {
            format!("{}: ", request_id)
        } else {
            String::new()
        };

        match command {
            "PING" => {
                reply(&mut stream, &format!("{}PONG", prefix)).await;
            }
            "VERSION" => {
                reply(&mut stream, &format!("{}{}", prefix, MOCK_VERSION)).await;
            }
            "STATS" => {
                let stats = "POOLS: 1\n\nSTATE: VALID PRIMARY\nTHREADS: live 1  idle 0 max 10 idle-timeout 30\nQUEUE: 0 items\nMEMSTATS: heap N/A mmap N/A used N/A free N/A releasable N/A pools 1 pools_used 1213.438M pools_total 1213.465M\nEND";
                reply(&mut stream, &format!("{}{}", prefix, stats)).await;
            }
            "INSTREAM" => {
                let Some(data) = read_instream_chunks(&mut stream).await else {
                    return;
                };
                if contains(&data, EICAR) {
                    reply(
                        &mut stream,
                        &format!("{}stream: Win.Test.EICAR_HDB-1 FOUND", prefix),
                    )
                    .await;
                } else {
                    reply(&mut stream, &format!("{}stream: OK", prefix)).await;
                }
            }
            _ => {
                if let Some(path) = command.strip_prefix("SCAN ") {
                    if Path::new(path).exists() {
                        reply(&mut stream, &format!("{}{}: OK", prefix, path)).await;
                    } else {
                        let message = "lstat() failed: No such file or directory. ERROR";
                        reply(&mut stream, &format!("{}{}: {}", prefix, path, message)).await;
                        // clamd duplicates the error on a second line
                        reply(&mut stream, message).await;
                    }
                } else {
                    reply(&mut stream, &format!("{}UNKNOWN COMMAND", prefix)).await;
                }
            }
        }
    }
}

async fn read_instream_chunks(stream: &mut BufReader<TcpStream>) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.ok()?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Some(data);
        }

        let mut chunk = vec![0u8; len];
        stream.read_exact(&mut chunk).await.ok()?;
        data.extend_from_slice(&chunk);
    }
}

async fn reply(stream: &mut BufReader<TcpStream>, line: &str) {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(0);
    let _ = stream.write_all(&framed).await;
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
