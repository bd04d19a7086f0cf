//! Uplink packet-loss analysis over paired TCP/UDP channels.
//!
//! Per host, a sender task emits sequenced datagrams while a sampler polls
//! the control channel for the server's `sent / dup / max_seq` counters and
//! hands each reading to the caller. Multi-host runs aggregate by summing
//! the counters.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::ookla::transport::{Client, PLoss, PacketLossSender};
use crate::ookla::Dialer;

const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_SAMPLER_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_SAMPLER_WARMUP: Duration = Duration::from_secs(1);
const DEFAULT_SAMPLING_DURATION: Duration = Duration::from_secs(40);

/// Tunables of the packet-loss analyzer.
#[derive(Debug, Clone)]
pub struct PacketLossAnalyzerOptions {
    /// Local address bound on the UDP data channel.
    pub source: Option<IpAddr>,
    /// Dialer for the TCP control channel.
    pub tcp_dialer: Dialer,
    /// Spacing between datagrams.
    pub send_interval: Duration,
    /// Spacing between control-channel polls.
    pub sampler_period: Duration,
    /// Delay before the first poll, giving the first datagrams time to
    /// land.
    pub sampler_warmup: Duration,
    /// Total duration of one run.
    pub sampling_duration: Duration,
}

impl Default for PacketLossAnalyzerOptions {
    fn default() -> Self {
        PacketLossAnalyzerOptions {
            source: None,
            tcp_dialer: Dialer::default(),
            send_interval: DEFAULT_SEND_INTERVAL,
            sampler_period: DEFAULT_SAMPLER_PERIOD,
            sampler_warmup: DEFAULT_SAMPLER_WARMUP,
            sampling_duration: DEFAULT_SAMPLING_DURATION,
        }
    }
}

/// Packet-loss analyzer; one instance can be reused across runs.
pub struct PacketLossAnalyzer {
    options: PacketLossAnalyzerOptions,
}

impl PacketLossAnalyzer {
    pub fn new(options: Option<PacketLossAnalyzerOptions>) -> Self {
        PacketLossAnalyzer { options: options.unwrap_or_default() }
    }

    pub fn options(&self) -> &PacketLossAnalyzerOptions {
        &self.options
    }

    /// Runs one bounded packet-loss session against `host`, invoking
    /// `callback` with every reading (and once more with the final one).
    pub async fn run(
        &self,
        host: &str,
        callback: impl Fn(&PLoss),
    ) -> Result<()> {
        self.run_with_token(&CancellationToken::new(), host, callback).await
    }

    /// Like [`run`](Self::run), observing `token`.
    pub async fn run_with_token(
        &self,
        token: &CancellationToken,
        host: &str,
        callback: impl Fn(&PLoss),
    ) -> Result<()> {
        let mut client =
            Client::connect(&self.options.tcp_dialer, host).await?;
        client.init_packet_loss().await?;

        let mut sender =
            PacketLossSender::new(client.id(), self.options.source);
        sender.connect(host).await?;

        let session = token.child_token();
        let sender_task = spawn_sender(
            sender,
            session.clone(),
            self.options.send_interval,
        );

        let mut latest: Option<PLoss> = None;
        let mut failure: Option<Error> = None;

        {
            // completes only when the server rejects the session
            let sampling = async {
                time::sleep(self.options.sampler_warmup).await;

                let mut ticker =
                    time::interval(self.options.sampler_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;

                    match client.packet_loss().await {
                        Ok(reading) => {
                            callback(&reading);
                            latest = Some(reading);
                        }
                        Err(Error::Unsupported) => break Error::Unsupported,
                        Err(err) => debug!("loss sample failed: {err}"),
                    }
                }
            };
            tokio::pin!(sampling);

            tokio::select! {
                _ = session.cancelled() => {}
                _ = time::sleep(self.options.sampling_duration) => {}
                err = &mut sampling => failure = Some(err),
            }
        }

        session.cancel();
        let _ = sender_task.await;
        let _ = client.disconnect().await;

        if let Some(err) = failure {
            return Err(err);
        }

        // the expiring run still reports its final reading
        if let Some(reading) = latest.as_ref() {
            callback(reading);
        }

        Ok(())
    }

    /// Runs one analyzer per host in parallel and sums the counters.
    pub async fn run_multi(&self, hosts: &[String]) -> Result<PLoss> {
        self.run_multi_with_token(&CancellationToken::new(), hosts).await
    }

    /// Like [`run_multi`](Self::run_multi), observing `token`.
    pub async fn run_multi_with_token(
        &self,
        token: &CancellationToken,
        hosts: &[String],
    ) -> Result<PLoss> {
        if hosts.is_empty() {
            return Err(Error::NoAvailableHosts);
        }

        let readings: Arc<Mutex<HashMap<String, PLoss>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut runs = JoinSet::new();
        for host in hosts {
            let host = host.clone();
            let options = self.options.clone();
            let readings = readings.clone();
            let token = token.clone();

            runs.spawn(async move {
                let analyzer = PacketLossAnalyzer { options };
                let reading_host = host.clone();
                let readings = readings.clone();

                analyzer
                    .run_with_token(&token, &host, move |reading| {
                        readings
                            .lock()
                            .insert(reading_host.clone(), *reading);
                    })
                    .await
            });
        }

        let mut any_unsupported = false;
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(Err(Error::Unsupported)) => any_unsupported = true,
                Ok(Err(err)) => debug!("packet loss host failed: {err}"),
                _ => {}
            }
        }

        let readings = readings.lock();
        if readings.is_empty() {
            return Err(if any_unsupported {
                Error::Unsupported
            } else {
                Error::NoAvailableHosts
            });
        }

        Ok(readings
            .values()
            .copied()
            .fold(PLoss::default(), |sum, reading| sum + reading))
    }
}

fn spawn_sender(
    sender: PacketLossSender,
    session: CancellationToken,
    send_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sequence: i64 = 0;
        let mut ticker = time::interval(send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = sender.send(sequence).await {
                        debug!("loss datagram {sequence} failed: {err}");
                    }
                    sequence += 1;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, UdpSocket};

    fn quick_options() -> PacketLossAnalyzerOptions {
        PacketLossAnalyzerOptions {
            send_interval: Duration::from_millis(20),
            sampler_period: Duration::from_millis(100),
            sampler_warmup: Duration::from_millis(50),
            sampling_duration: Duration::from_millis(600),
            ..PacketLossAnalyzerOptions::default()
        }
    }

    /// Loss-capable stub: a line server on TCP plus a datagram sink on the
    /// same port number over UDP.
    async fn spawn_loss_stub(ploss_reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let udp_sink = UdpSocket::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let mut buffer = [0u8; 512];
            while udp_sink.recv_from(&mut buffer).await.is_ok() {}
        });

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };

                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();

                    loop {
                        line.clear();
                        let Ok(read) = reader.read_line(&mut line).await
                        else {
                            return;
                        };
                        if read == 0 {
                            return;
                        }

                        let reply = if line.starts_with("HI") {
                            "HI 2.11.0\n".to_string()
                        } else if line.starts_with("PING LOSS") {
                            "OK\n".to_string()
                        } else if line.starts_with("PLOSS") {
                            format!("{ploss_reply}\n")
                        } else if line.starts_with("QUIT") {
                            return;
                        } else {
                            "ERR\n".to_string()
                        };

                        if reader
                            .get_mut()
                            .write_all(reply.as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_run_reports_readings_until_expiry() {
        let addr = spawn_loss_stub("PLOSS 100 2 100").await;
        let analyzer = PacketLossAnalyzer::new(Some(quick_options()));

        let readings = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(PLoss::default()));

        let readings_cb = readings.clone();
        let last_cb = last.clone();
        analyzer
            .run(&addr.to_string(), move |reading| {
                readings_cb.fetch_add(1, Ordering::SeqCst);
                *last_cb.lock() = *reading;
            })
            .await
            .unwrap();

        assert!(readings.load(Ordering::SeqCst) >= 2);
        assert_eq!(*last.lock(), PLoss { sent: 100, dup: 2, max: 100 });
    }

    #[tokio::test]
    async fn test_run_surfaces_unsupported() {
        let addr = spawn_loss_stub("ERR UNSUPPORTED").await;
        let analyzer = PacketLossAnalyzer::new(Some(quick_options()));

        let err =
            analyzer.run(&addr.to_string(), |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test]
    async fn test_run_multi_aggregates_hosts() {
        let a = spawn_loss_stub("PLOSS 100 2 100").await;
        let b = spawn_loss_stub("PLOSS 50 0 50").await;
        let analyzer = PacketLossAnalyzer::new(Some(quick_options()));

        let total = analyzer
            .run_multi(&[a.to_string(), b.to_string()])
            .await
            .unwrap();

        assert_eq!(total, PLoss { sent: 150, dup: 2, max: 150 });
        // 1 - (150 - 2) / 151
        assert!((total.loss_percent() - 100.0 * (3.0 / 151.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_multi_rejects_empty_and_dead_hosts() {
        let analyzer = PacketLossAnalyzer::new(Some(quick_options()));

        let err = analyzer.run_multi(&[]).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableHosts));

        // a bound-then-dropped port refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let err =
            analyzer.run_multi(&[dead.to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableHosts));
    }

    #[tokio::test]
    async fn test_run_multi_all_unsupported() {
        let addr = spawn_loss_stub("ERR UNSUPPORTED").await;
        let analyzer = PacketLossAnalyzer::new(Some(quick_options()));

        let err =
            analyzer.run_multi(&[addr.to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));
    }

    #[tokio::test]
    async fn test_run_with_cancelled_token_stops_early() {
        let addr = spawn_loss_stub("PLOSS 10 0 10").await;
        let analyzer = PacketLossAnalyzer::new(Some(
            PacketLossAnalyzerOptions {
                sampling_duration: Duration::from_secs(30),
                ..quick_options()
            },
        ));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        analyzer
            .run_with_token(&token, &addr.to_string(), |_| {})
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
