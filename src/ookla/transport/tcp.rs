//! Text-line TCP client for the measurement-server control protocol.
//!
//! Lines are newline-terminated ASCII. The client greets with `HI` on
//! connect and caches the server version from the reply; `PING <ns>` probes
//! round-trip time, `PING LOSS <id>` registers a UDP loss session and
//! `PLOSS <id>` polls its counters. `QUIT` is sent best-effort on
//! disconnect.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use super::PLoss;
use crate::errors::{Error, Result};
use crate::ookla::Dialer;

const UNKNOWN_VERSION: &str = "unknown";

/// Line-protocol client. States: disconnected, connected, closed.
pub struct Client {
    id: String,
    host: String,
    version: Option<String>,
    stream: Option<BufReader<TcpStream>>,
}

impl Client {
    /// Dials `host` and performs the `HI` greeting exchange.
    pub async fn connect(dialer: &Dialer, host: &str) -> Result<Self> {
        let stream = dialer.dial(host).await?;

        let mut client = Client {
            id: Uuid::new_v4().to_string(),
            host: host.to_string(),
            version: None,
            stream: Some(BufReader::new(stream)),
        };
        client.greet().await?;

        Ok(client)
    }

    /// Session id shared with the UDP data channel.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote server version cached from the greeting.
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(UNKNOWN_VERSION)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut message = Vec::with_capacity(line.len() + 1);
        message.extend_from_slice(line);
        message.push(b'\n');
        stream.get_mut().write_all(&message).await?;

        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut line = String::new();
        let read = stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::Protocol(
                "connection closed by server".to_string(),
            ));
        }

        Ok(line)
    }

    async fn greet(&mut self) -> Result<()> {
        self.write_line(b"HI").await?;

        let line = self.read_line().await?;
        let line = line.trim();
        if !line.starts_with("HI") {
            return Err(Error::Protocol(format!(
                "unexpected greeting: {line}"
            )));
        }

        let version = line
            .strip_prefix("HI")
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .unwrap_or(UNKNOWN_VERSION);
        self.version = Some(version.to_string());

        Ok(())
    }

    /// One `PING <ns>` exchange; returns the wall-clock round trip in
    /// nanoseconds.
    pub async fn ping(&mut self) -> Result<i64> {
        let unix_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let started = Instant::now();
        self.write_line(format!("PING {unix_nanos}").as_bytes()).await?;

        let line = self.read_line().await?;
        if !line.starts_with("PONG") {
            return Err(Error::Protocol(format!(
                "unexpected ping reply: {}",
                line.trim()
            )));
        }

        Ok(started.elapsed().as_nanos() as i64)
    }

    /// Registers this session for UDP packet-loss counting.
    pub async fn init_packet_loss(&mut self) -> Result<()> {
        let id = self.id.clone();
        self.write_line(format!("PING LOSS {id}").as_bytes()).await?;

        let line = self.read_line().await?;
        if line.contains("UNSUPPORTED") {
            return Err(Error::Unsupported);
        }

        Ok(())
    }

    /// Polls the server's loss counters for this session.
    pub async fn packet_loss(&mut self) -> Result<PLoss> {
        let id = self.id.clone();
        self.write_line(format!("PLOSS {id}").as_bytes()).await?;

        let line = self.read_line().await?;
        let line = line.trim();
        if line.contains("UNSUPPORTED") {
            return Err(Error::Unsupported);
        }

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("PLOSS"), Some(sent), Some(dup), Some(max)) => {
                let field = |raw: &str| {
                    raw.parse::<i64>().map_err(|_| {
                        Error::Protocol(format!("bad PLOSS reply: {line}"))
                    })
                };

                Ok(PLoss {
                    sent: field(sent)?,
                    dup: field(dup)?,
                    max: field(max)?,
                })
            }
            _ => Err(Error::Protocol(format!("bad PLOSS reply: {line}"))),
        }
    }

    /// Sends `QUIT` best-effort and releases the socket.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().write_all(b"QUIT\n").await;
        }

        self.version = None;

        Ok(())
    }
}
