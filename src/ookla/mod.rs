//! Engine facade for Ookla-protocol measurement servers.
//!
//! [`Speedtest`] owns the HTTP client, the dialers and the data manager; the
//! [`Server`](server::Server) entities it produces carry a non-owning handle
//! back to it and expose the per-server measurement operations.

pub mod catalog;
pub mod loss;
pub mod ping;
pub mod request;
pub mod server;
pub mod transport;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time;
use url::Url;

use crate::errors::{Error, Result};
use crate::location::Location;
use crate::manager::DataManager;
use catalog::User;
use loss::{PacketLossAnalyzer, PacketLossAnalyzerOptions};

/// User agent sent with every outbound HTTP request unless overridden.
pub const DEFAULT_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// reqwest exposes no TLS-handshake timeout; the handshake budget is folded
// into the connect timeout.
const MAX_IDLE_CONNECTIONS: usize = 100;
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol used by the latency prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingMode {
    #[default]
    Http,
    Tcp,
    /// Requires privileges to open a raw ICMP socket.
    Icmp,
}

/// Engine configuration.
///
/// All fields have usable zero values; `UserConfig::default()` yields a
/// plain HTTP-probing engine with one worker per CPU.
#[derive(Debug, Clone, Default)]
pub struct UserConfig {
    /// Header injected on all outbound HTTP requests; empty selects
    /// [`DEFAULT_USER_AGENT`].
    pub user_agent: String,
    /// HTTP or SOCKS proxy URL; overrides the environment proxy when it
    /// parses.
    pub proxy: Option<String>,
    /// Local address bound on TCP, ICMP and UDP sockets. An optional
    /// `scheme://` prefix is ignored.
    pub source: Option<String>,
    /// Route DNS lookups through the engine's own resolver instead of the
    /// system's getaddrinfo path.
    pub dns_bind_source: bool,
    pub ping_mode: PingMode,
    /// Forces the worker population to 1.
    pub saving_mode: bool,
    /// Worker population; 0 selects the available parallelism.
    pub max_connections: usize,
    /// Pre-populated location forwarded to the server catalog query.
    pub location: Option<Location>,
    /// Fuzzy `search=` term forwarded to the server catalog query.
    pub keyword: Option<String>,
    /// Log engine internals at debug level.
    pub debug: bool,
}

/// Shared engine state; servers hold a weak handle to it.
pub(crate) struct EngineCore {
    pub(crate) client: reqwest::Client,
    pub(crate) config: UserConfig,
    pub(crate) manager: Arc<DataManager>,
    pub(crate) tcp_dialer: Dialer,
    pub(crate) source_ip: Option<IpAddr>,
    pub(crate) user: RwLock<Option<User>>,
}

/// The measurement engine.
pub struct Speedtest {
    pub(crate) core: Arc<EngineCore>,
}

impl Speedtest {
    /// Builds an engine from `config`.
    pub fn new(mut config: UserConfig) -> Result<Self> {
        if config.user_agent.is_empty() {
            config.user_agent = DEFAULT_USER_AGENT.to_string();
        }

        if config.saving_mode {
            config.max_connections = 1;
        }

        let source_ip = match config.source.as_deref() {
            Some(raw) => match parse_source(raw) {
                Ok(ip) => Some(ip),
                Err(err) => {
                    warn!("skipping source address {raw}: {err}");
                    None
                }
            },
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(ip) = source_ip {
            builder = builder.local_address(ip);
        }

        if let Some(proxy) = config.proxy.as_deref() {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => warn!("skipping proxy {proxy}: {err}"),
            }
        }

        if config.dns_bind_source {
            builder = builder.dns_resolver(Arc::new(EngineDns::from_system()));
        }

        let client = builder.build()?;

        let manager = DataManager::new();
        manager.set_workers(config.max_connections);

        if config.debug {
            debug!("source: {:?}", config.source);
            debug!("proxy: {:?}", config.proxy);
            debug!("saving mode: {}", config.saving_mode);
            debug!("keyword: {:?}", config.keyword);
            debug!("ping mode: {:?}", config.ping_mode);
            debug!("workers: {}", manager.workers());
        }

        Ok(Speedtest {
            core: Arc::new(EngineCore {
                client,
                manager,
                tcp_dialer: Dialer {
                    source: source_ip,
                    timeout: DIAL_TIMEOUT,
                },
                source_ip,
                user: RwLock::new(None),
                config,
            }),
        })
    }

    /// Engine with the default configuration.
    pub fn default_engine() -> Result<Self> {
        Self::new(UserConfig::default())
    }

    pub fn config(&self) -> &UserConfig {
        &self.core.config
    }

    pub fn manager(&self) -> Arc<DataManager> {
        self.core.manager.clone()
    }

    /// The user record from the last [`fetch_user_info`] call.
    ///
    /// [`fetch_user_info`]: Speedtest::fetch_user_info
    pub fn user(&self) -> Option<User> {
        self.core.user.read().clone()
    }

    /// Archives the current snapshot and resets both transfer directions;
    /// call between servers.
    pub fn reset(&self) {
        self.core.manager.reset();
    }

    /// Packet-loss analyzer seeded with this engine's source binding and
    /// dialer.
    pub fn packet_loss_analyzer(&self) -> PacketLossAnalyzer {
        PacketLossAnalyzer::new(Some(PacketLossAnalyzerOptions {
            source: self.core.source_ip,
            tcp_dialer: self.core.tcp_dialer.clone(),
            ..PacketLossAnalyzerOptions::default()
        }))
    }

    pub(crate) fn handle(&self) -> server::EngineRef {
        server::EngineRef(Arc::downgrade(&self.core))
    }
}

/// Strips an optional `scheme://` prefix and parses the remainder as an IP
/// address.
fn parse_source(raw: &str) -> Result<IpAddr> {
    let address = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };

    address
        .parse()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// TCP dialer that reuses the configured source address.
#[derive(Debug, Clone)]
pub struct Dialer {
    pub source: Option<IpAddr>,
    pub timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Dialer { source: None, timeout: DIAL_TIMEOUT }
    }
}

impl Dialer {
    pub async fn dial(&self, host: &str) -> Result<TcpStream> {
        let mut addrs = lookup_host(host).await?;
        let addr = addrs.next().ok_or_else(|| {
            Error::Protocol(format!("no address found for {host}"))
        })?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if let Some(source) = self.source {
            socket.bind(SocketAddr::new(source, 0))?;
        }

        let stream = time::timeout(self.timeout, socket.connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        Ok(stream)
    }
}

/// Engine-owned DNS resolution, installed on the HTTP client when
/// `dns_bind_source` is set.
struct EngineDns {
    resolver: Arc<TokioAsyncResolver>,
}

impl EngineDns {
    fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .unwrap_or_else(|_| {
                TokioAsyncResolver::tokio(
                    hickory_resolver::config::ResolverConfig::default(),
                    hickory_resolver::config::ResolverOpts::default(),
                )
            });

        EngineDns { resolver: Arc::new(resolver) }
    }
}

impl Resolve for EngineDns {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(
                lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)),
            );

            Ok(addrs)
        })
    }
}

/// Replaces the last path segment of `base` with `file`, keeping the origin.
///
/// `http://h/speedtest/upload.php` + `latency.txt` becomes
/// `http://h/speedtest/latency.txt`.
pub(crate) fn sibling_url(base: &str, file: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;

    url.path_segments_mut()
        .map_err(|_| Error::Protocol(format!("not a base URL: {base}")))?
        .pop()
        .push(file);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_url() {
        let url = sibling_url(
            "http://example.com:8080/speedtest/upload.php",
            "latency.txt",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.com:8080/speedtest/latency.txt"
        );

        let url = sibling_url(
            "http://example.com/speedtest/upload.php",
            "random350x350.jpg",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "http://example.com/speedtest/random350x350.jpg"
        );
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(
            parse_source("192.168.1.10").unwrap(),
            "192.168.1.10".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_source("tcp://10.0.0.1").unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(parse_source("not-an-ip").is_err());
    }

    #[test]
    fn test_new_applies_saving_mode() {
        let engine = Speedtest::new(UserConfig {
            saving_mode: true,
            max_connections: 8,
            ..UserConfig::default()
        })
        .unwrap();
        assert_eq!(engine.manager().workers(), 1);
    }

    #[test]
    fn test_new_defaults_user_agent() {
        let engine = Speedtest::default_engine().unwrap();
        assert_eq!(engine.config().user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_new_survives_bad_proxy_and_source() {
        let engine = Speedtest::new(UserConfig {
            proxy: Some("::not a proxy::".to_string()),
            source: Some("not-an-ip".to_string()),
            ..UserConfig::default()
        })
        .unwrap();
        assert!(engine.core.source_ip.is_none());
    }

    #[tokio::test]
    async fn test_dialer_rejects_unresolvable_host() {
        let dialer = Dialer::default();
        assert!(dialer.dial("host.invalid.:1").await.is_err());
    }
}
