//! Server catalog and user-geolocation retrieval.
//!
//! The catalog endpoint serves JSON; an empty body falls back to the legacy
//! XML list. Every fetched server is probed once (with a shared four-second
//! budget) in the configured ping mode, distances are computed when the
//! user's coordinates are known, and the result is sorted by distance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{Error, Result};
use crate::location::distance;
use crate::ookla::server::{Server, Servers, PING_TIMEOUT};
use crate::ookla::{EngineCore, PingMode, Speedtest};

const SERVERS_URL: &str = "https://www.speedtest.net/api/js/servers";
const SERVERS_ALTERNATIVE_URL: &str =
    "https://www.speedtest.net/speedtest-servers-static.php";
const SERVERS_ADVANCED_URL: &str =
    "https://www.speedtest.net/api/ios-config.php";
const USER_CONFIG_URL: &str =
    "https://www.speedtest.net/speedtest-config.php";

const PING_SWEEP_BUDGET: Duration = Duration::from_secs(4);

/// Information determined about the caller by the catalog operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub ip: String,
    pub lat: String,
    pub lon: String,
    pub isp: String,
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) [{}, {}]", self.ip, self.isp, self.lat, self.lon)
    }
}

// XML wire shapes. The legacy endpoints serve a <settings> document with
// attribute-carrying <server> and <client> children.

#[derive(Debug, Deserialize)]
struct XmlSettings {
    #[serde(default)]
    servers: XmlServers,
    #[serde(rename = "client", default)]
    clients: Vec<XmlClient>,
}

#[derive(Debug, Default, Deserialize)]
struct XmlServers {
    #[serde(rename = "server", default)]
    servers: Vec<XmlServer>,
}

#[derive(Debug, Deserialize)]
struct XmlServer {
    #[serde(rename = "@url")]
    url: String,
    #[serde(rename = "@lat", default)]
    lat: String,
    #[serde(rename = "@lon", default)]
    lon: String,
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@country", default)]
    country: String,
    #[serde(rename = "@sponsor", default)]
    sponsor: String,
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@host", default)]
    host: String,
}

#[derive(Debug, Deserialize)]
struct XmlClient {
    #[serde(rename = "@ip", default)]
    ip: String,
    #[serde(rename = "@lat", default)]
    lat: String,
    #[serde(rename = "@lon", default)]
    lon: String,
    #[serde(rename = "@isp", default)]
    isp: String,
}

impl From<XmlServer> for Server {
    fn from(xml: XmlServer) -> Self {
        Server {
            url: xml.url,
            lat: xml.lat,
            lon: xml.lon,
            name: xml.name,
            country: xml.country,
            sponsor: xml.sponsor,
            id: xml.id,
            host: xml.host,
            ..Server::default()
        }
    }
}

impl From<XmlClient> for User {
    fn from(xml: XmlClient) -> Self {
        User { ip: xml.ip, lat: xml.lat, lon: xml.lon, isp: xml.isp }
    }
}

fn decode_xml_servers(raw: &str) -> Result<(Servers, Vec<User>)> {
    let settings: XmlSettings = quick_xml::de::from_str(raw)?;
    let servers =
        Servers(settings.servers.servers.into_iter().map(Into::into).collect());
    let users = settings.clients.into_iter().map(Into::into).collect();

    Ok((servers, users))
}

fn decode_user_config(raw: &str) -> Result<User> {
    let settings: XmlSettings = quick_xml::de::from_str(raw)?;
    settings
        .clients
        .into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| Error::Protocol("no client record in config".into()))
}

impl Speedtest {
    /// Retrieves the caller's IP/ISP/coordinates record.
    pub async fn fetch_user_info(&self) -> Result<User> {
        self.fetch_user_info_with(&CancellationToken::new()).await
    }

    /// Retrieves the caller's record, observing `token`.
    pub async fn fetch_user_info_with(
        &self,
        token: &CancellationToken,
    ) -> Result<User> {
        debug!("retrieving user info: {USER_CONFIG_URL}");

        let body =
            fetch_text(&self.core, token, USER_CONFIG_URL.to_string()).await?;
        let user = decode_user_config(&body)?;

        *self.core.user.write() = Some(user.clone());

        Ok(user)
    }

    /// Retrieves, probes and sorts the server catalog.
    pub async fn fetch_servers(&self) -> Result<Servers> {
        self.fetch_servers_with(&CancellationToken::new()).await
    }

    /// Retrieves, probes and sorts the server catalog, observing `token`.
    pub async fn fetch_servers_with(
        &self,
        token: &CancellationToken,
    ) -> Result<Servers> {
        let list_url = self.build_server_list_url()?;
        debug!("retrieving servers: {list_url}");

        let body =
            fetch_text(&self.core, token, list_url.to_string()).await?;

        let mut servers = if body.trim().is_empty() {
            debug!("empty catalog body, falling back to {SERVERS_ALTERNATIVE_URL}");
            let alternative = fetch_text(
                &self.core,
                token,
                SERVERS_ALTERNATIVE_URL.to_string(),
            )
            .await?;
            decode_xml_servers(&alternative)?.0
        } else {
            Servers(serde_json::from_str::<Vec<Server>>(&body)?)
        };

        debug!("servers num: {}", servers.len());
        if servers.is_empty() {
            return Err(Error::NoServer);
        }

        for server in servers.iter_mut() {
            server.engine = self.handle();
        }

        ping_sweep(&mut servers, token, self.core.config.ping_mode).await;

        // Distance is only computed when user info is already known;
        // otherwise the catalog's own ordering stands in.
        if let Some(user) = self.user() {
            let user_lat: f64 = user.lat.parse().unwrap_or_default();
            let user_lon: f64 = user.lon.parse().unwrap_or_default();

            for server in servers.iter_mut() {
                let server_lat: f64 = server.lat.parse().unwrap_or_default();
                let server_lon: f64 = server.lon.parse().unwrap_or_default();
                server.distance =
                    distance(server_lat, server_lon, user_lat, user_lon);
            }
        }

        servers.sort_by_distance();

        Ok(servers)
    }

    /// Retrieves one server by its catalog id.
    pub async fn fetch_server_by_id(&self, server_id: &str) -> Result<Server> {
        self.fetch_server_by_id_with(&CancellationToken::new(), server_id)
            .await
    }

    /// Retrieves one server by its catalog id, observing `token`.
    pub async fn fetch_server_by_id_with(
        &self,
        token: &CancellationToken,
        server_id: &str,
    ) -> Result<Server> {
        let mut url = Url::parse(SERVERS_ADVANCED_URL)?;
        url.query_pairs_mut().append_pair("serverid", server_id);

        let body = fetch_text(&self.core, token, url.to_string()).await?;
        let (servers, users) = decode_xml_servers(&body)?;

        let mut server = servers
            .into_iter()
            .find(|server| server.id == server_id)
            .ok_or(Error::NoServer)?;

        server.engine = self.handle();

        if let Some(user) = users.first() {
            let server_lat: f64 = server.lat.parse().unwrap_or_default();
            let server_lon: f64 = server.lon.parse().unwrap_or_default();
            let user_lat: f64 = user.lat.parse().unwrap_or_default();
            let user_lon: f64 = user.lon.parse().unwrap_or_default();
            server.distance =
                distance(server_lat, server_lon, user_lat, user_lon);
        }

        Ok(server)
    }

    fn build_server_list_url(&self) -> Result<Url> {
        let mut url = Url::parse(SERVERS_URL)?;

        {
            let mut query = url.query_pairs_mut();
            if let Some(keyword) = self.core.config.keyword.as_deref() {
                query.append_pair("search", keyword);
            }

            if let Some(location) = self.core.config.location.as_ref() {
                query.append_pair("lat", &location.lat.to_string());
                query.append_pair("lon", &location.lon.to_string());
            }
        }

        Ok(url)
    }
}

async fn fetch_text(
    core: &Arc<EngineCore>,
    token: &CancellationToken,
    url: String,
) -> Result<String> {
    let response = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        response = core.client.get(url).send() => response?,
    };

    let body = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        body = response.text() => body?,
    };

    Ok(body)
}

/// Probes every server once, writing either a latency or the timeout
/// sentinel. The whole sweep shares one wall-clock budget.
async fn ping_sweep(
    servers: &mut Servers,
    token: &CancellationToken,
    ping_mode: PingMode,
) {
    debug!("echo each server...");

    let results: Arc<Mutex<HashMap<usize, Option<Duration>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let sweep_token = token.child_token();

    let mut probes = JoinSet::new();
    for (index, server) in servers.iter().enumerate() {
        let server = server.clone();
        let results = results.clone();
        let sweep_token = sweep_token.clone();

        probes.spawn(async move {
            let latency = probe_once(&server, &sweep_token, ping_mode).await;
            results.lock().insert(index, latency);
        });
    }

    let _ = time::timeout(PING_SWEEP_BUDGET, async {
        while probes.join_next().await.is_some() {}
    })
    .await;
    sweep_token.cancel();
    probes.abort_all();

    let results = results.lock();
    for (index, server) in servers.iter_mut().enumerate() {
        server.latency = match results.get(&index) {
            Some(Some(latency)) => Some(*latency),
            _ => Some(PING_TIMEOUT),
        };
    }
}

async fn probe_once(
    server: &Server,
    token: &CancellationToken,
    ping_mode: PingMode,
) -> Option<Duration> {
    let echo_freq = Duration::from_millis(1);

    let samples = match ping_mode {
        PingMode::Tcp => server.tcp_ping(token, 1, echo_freq, None).await,
        PingMode::Icmp => {
            server
                .icmp_ping(token, PING_SWEEP_BUDGET, 1, echo_freq, None)
                .await
        }
        PingMode::Http => server.http_ping(token, 1, echo_freq, None).await,
    };

    match samples {
        Ok(samples) if !samples.is_empty() => {
            Some(Duration::from_nanos(samples[0].max(0) as u64))
        }
        _ => None,
    }
}
