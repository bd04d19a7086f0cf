//! Latency probers: HTTP, TCP line protocol and ICMP echo.
//!
//! Each prober returns the ordered nanosecond RTT samples of its successful
//! attempts. A prober whose every attempt fails reports
//! [`Error::ConnectTimeout`]; a cancelled prober returns the partial samples
//! it collected, or [`Error::Cancelled`] when it has none.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket, Type};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{Error, Result};
use crate::ookla::server::Server;
use crate::ookla::{sibling_url, transport};

/// Callback invoked with each successful RTT sample.
pub type PingCallback = dyn Fn(Duration) + Sync;

const ECHO_OPTION_DATA_SIZE: usize = 32;
const ICMP_HEADER_SIZE: usize = 8;
const IP_HEADER_SIZE: usize = 20;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0x00;

impl Server {
    /// HTTP ping against the server's `latency.txt` sibling endpoint.
    ///
    /// One extra warm-up request is issued first and its RTT discarded, so
    /// connection setup never skews the estimate.
    pub async fn http_ping(
        &self,
        token: &CancellationToken,
        echo_times: usize,
        echo_freq: Duration,
        callback: Option<&PingCallback>,
    ) -> Result<Vec<i64>> {
        let core = self.engine.core()?;

        let ping_url = sibling_url(&self.url, "latency.txt")?;
        debug!("echo: {ping_url}");

        // the warm-up attempt
        let attempts = echo_times + 1;
        let mut latencies = Vec::with_capacity(echo_times);
        let mut fail_times = 0;

        for attempt in 0..attempts {
            let started = Instant::now();
            let response = tokio::select! {
                _ = token.cancelled() => {
                    return if latencies.is_empty() {
                        Err(Error::Cancelled)
                    } else {
                        Ok(latencies)
                    };
                }
                response = core.client.get(ping_url.clone()).send() => response,
            };
            let rtt = started.elapsed();

            match response {
                Ok(response) => {
                    let _ = response.bytes().await;

                    if attempt > 0 {
                        let nanos = rtt.as_nanos() as i64;
                        debug!("rtt: {nanos}");
                        latencies.push(nanos);

                        if let Some(callback) = callback {
                            callback(rtt);
                        }
                    }
                }
                Err(err) => {
                    debug!("http ping attempt failed: {err}");
                    fail_times += 1;
                }
            }

            time::sleep(echo_freq).await;
        }

        if fail_times == attempts {
            return Err(Error::ConnectTimeout);
        }

        Ok(latencies)
    }

    /// TCP ping over the line protocol: `PING <ns>` per attempt after the
    /// `HI` handshake.
    pub async fn tcp_ping(
        &self,
        token: &CancellationToken,
        echo_times: usize,
        echo_freq: Duration,
        callback: Option<&PingCallback>,
    ) -> Result<Vec<i64>> {
        let core = self.engine.core()?;
        let ping_dst = self.ping_host()?;

        let mut client =
            transport::Client::connect(&core.tcp_dialer, &ping_dst).await?;

        let mut latencies = Vec::with_capacity(echo_times);
        let mut fail_times = 0;

        for _ in 0..echo_times {
            let latency = tokio::select! {
                _ = token.cancelled() => None,
                latency = client.ping() => Some(latency),
            };

            let Some(latency) = latency else {
                let _ = client.disconnect().await;
                return if latencies.is_empty() {
                    Err(Error::Cancelled)
                } else {
                    Ok(latencies)
                };
            };

            match latency {
                Ok(nanos) => {
                    latencies.push(nanos);
                    if let Some(callback) = callback {
                        callback(Duration::from_nanos(nanos.max(0) as u64));
                    }
                }
                Err(err) => {
                    debug!("tcp ping attempt failed: {err}");
                    fail_times += 1;
                }
            }

            time::sleep(echo_freq).await;
        }

        let _ = client.disconnect().await;

        if echo_times > 0 && fail_times == echo_times {
            return Err(Error::ConnectTimeout);
        }

        Ok(latencies)
    }

    /// ICMP echo ping. Privileged: opens a raw ICMPv4 socket.
    pub async fn icmp_ping(
        &self,
        token: &CancellationToken,
        read_timeout: Duration,
        echo_times: usize,
        echo_freq: Duration,
        callback: Option<&PingCallback>,
    ) -> Result<Vec<i64>> {
        let core = self.engine.core()?;

        let url = Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| {
                Error::Protocol(format!("no host in {}", self.url))
            })?
            .to_string();
        debug!("echo: {host}");

        let source = core.source_ip;
        let blocking_token = token.clone();
        let latencies = tokio::task::spawn_blocking(move || {
            icmp_ping_blocking(
                &host,
                source,
                read_timeout,
                echo_times,
                echo_freq,
                blocking_token,
            )
        })
        .await
        .map_err(|err| Error::Protocol(err.to_string()))??;

        if let Some(callback) = callback {
            for &nanos in &latencies {
                callback(Duration::from_nanos(nanos.max(0) as u64));
            }
        }

        Ok(latencies)
    }
}

fn icmp_ping_blocking(
    host: &str,
    source: Option<IpAddr>,
    read_timeout: Duration,
    echo_times: usize,
    echo_freq: Duration,
    token: CancellationToken,
) -> Result<Vec<i64>> {
    let mut resolved = (host, 0u16).to_socket_addrs()?;
    let addr = resolved
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| Error::Protocol(format!("no IPv4 address for {host}")))?;

    let socket =
        Socket::new(Domain::IPV4, Type::RAW, Some(IpProtocol::ICMPV4))?;
    if let Some(source) = source {
        socket.bind(&SockAddr::from(SocketAddr::new(source, 0)))?;
    }

    socket.set_read_timeout(Some(read_timeout))?;
    socket.set_write_timeout(Some(read_timeout))?;
    socket.connect(&SockAddr::from(addr))?;

    let mut packet = prepare_icmp_packet();
    let mut latencies = Vec::with_capacity(echo_times);
    let mut fail_times = 0;

    for _ in 0..echo_times {
        if token.is_cancelled() {
            break;
        }

        match send_one_icmp_ping(&socket, &mut packet) {
            Ok(rtt) => {
                let nanos = rtt.as_nanos() as i64;
                debug!("1rtt: {nanos}");
                latencies.push(nanos);
            }
            Err(err) => {
                debug!("icmp ping attempt failed: {err}");
                fail_times += 1;
            }
        }

        std::thread::sleep(echo_freq);
    }

    if echo_times > 0 && fail_times == echo_times {
        return Err(Error::ConnectTimeout);
    }

    Ok(latencies)
}

fn send_one_icmp_ping(
    socket: &Socket,
    packet: &mut [u8],
) -> Result<Duration> {
    // refresh checksum and sequence before each send
    packet[2] = 0;
    packet[3] = 0;
    packet[6] = 0;
    packet[7] = 1;
    let sum = checksum(packet);
    packet[2] = (sum >> 8) as u8;
    packet[3] = sum as u8;

    let started = std::time::Instant::now();

    let mut socket_ref = socket;
    socket_ref.write_all(packet)?;

    let mut buffer =
        [0u8; IP_HEADER_SIZE + ECHO_OPTION_DATA_SIZE + ICMP_HEADER_SIZE];
    let read = socket_ref.read(&mut buffer)?;

    // byte 20 is the ICMP type after the IPv4 header
    if read <= IP_HEADER_SIZE || buffer[IP_HEADER_SIZE] != ICMP_ECHO_REPLY {
        return Err(Error::Protocol("not an ICMP echo reply".to_string()));
    }

    Ok(started.elapsed())
}

/// Echo-request packet: 8-byte header (type 8, code 0, id 1, seq 1) plus a
/// 32-byte payload ending in 0x06.
pub(crate) fn prepare_icmp_packet(
) -> [u8; ICMP_HEADER_SIZE + ECHO_OPTION_DATA_SIZE] {
    let mut data = [0u8; ICMP_HEADER_SIZE + ECHO_OPTION_DATA_SIZE];
    data[0] = ICMP_ECHO_REQUEST;
    data[1] = 0; // code
    data[2] = 0; // checksum
    data[3] = 0; // checksum
    data[4] = 0; // id
    data[5] = 1; // id
    data[6] = 0; // seq
    data[7] = 1; // seq

    let echo_message = "Hi! SpeedTest-Go \\(●'◡'●)/";
    for (index, byte) in echo_message.bytes().enumerate() {
        data[ICMP_HEADER_SIZE + index] = byte;
    }

    data[ICMP_HEADER_SIZE + ECHO_OPTION_DATA_SIZE - 1] = 6;

    data
}

/// Internet checksum: one's complement of the wrapping 16-bit big-endian
/// word sum.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum: u16 = 0;

    let mut index = 0;
    while index + 1 < data.len() {
        sum = sum.wrapping_add(
            ((data[index] as u16) << 8).wrapping_add(data[index + 1] as u16),
        );
        index += 2;
    }

    if data.len() % 2 == 1 {
        sum = sum.wrapping_add((data[data.len() - 1] as u16) << 8);
    }

    !sum
}
