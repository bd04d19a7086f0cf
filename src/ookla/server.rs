//! Server entities and collections.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Error, Result};
use crate::ookla::transport::PLoss;
use crate::ookla::{EngineCore, Speedtest};
use crate::units::ByteRate;

/// Latency sentinel recorded when every probe attempt against a server
/// failed.
pub const PING_TIMEOUT: Duration = Duration::MAX;

/// Non-owning handle from a server back to the engine that produced it.
///
/// A dead handle surfaces as [`Error::UninitializedManager`]; embedding an
/// owning pointer here would create a reference cycle with the engine.
#[derive(Clone, Default)]
pub struct EngineRef(pub(crate) Weak<EngineCore>);

impl EngineRef {
    pub(crate) fn core(&self) -> Result<Arc<EngineCore>> {
        self.0.upgrade().ok_or(Error::UninitializedManager)
    }
}

impl fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineRef")
    }
}

/// One measurement server from the catalog (or a custom URL).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub lon: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub sponsor: String,
    pub id: String,
    #[serde(default)]
    pub host: String,
    #[serde(skip)]
    pub distance: f64,
    /// `None` until a prober has run; [`PING_TIMEOUT`] when every attempt
    /// failed.
    #[serde(skip)]
    pub latency: Option<Duration>,
    #[serde(skip)]
    pub max_latency: Duration,
    #[serde(skip)]
    pub min_latency: Duration,
    #[serde(skip)]
    pub jitter: Duration,
    #[serde(skip)]
    pub dl_speed: ByteRate,
    #[serde(skip)]
    pub ul_speed: ByteRate,
    #[serde(skip)]
    pub test_duration: TestDuration,
    #[serde(skip)]
    pub packet_loss: PLoss,
    #[serde(skip)]
    pub(crate) engine: EngineRef,
}

/// Wall-clock spent in each test phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TestDuration {
    pub ping: Option<Duration>,
    pub download: Option<Duration>,
    pub upload: Option<Duration>,
    pub total: Option<Duration>,
}

impl Server {
    /// True when the last probe sweep could not reach this server.
    pub fn timed_out(&self) -> bool {
        self.latency == Some(PING_TIMEOUT)
    }

    /// Probe target: the explicit host field when present, otherwise the
    /// host part of the URL.
    pub(crate) fn ping_host(&self) -> Result<String> {
        if !self.host.is_empty() {
            return Ok(self.host.clone());
        }

        let url = Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Protocol(format!("no host in {}", self.url)))?;

        Ok(match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Sanity check that download and upload results are within two orders
    /// of magnitude of each other.
    pub fn check_result_valid(&self) -> bool {
        self.dl_speed.0 * 100.0 >= self.ul_speed.0
            && self.dl_speed.0 <= self.ul_speed.0 * 100.0
    }

    pub(crate) fn update_total_duration(&mut self) {
        let total = self.test_duration.ping.unwrap_or_default()
            + self.test_duration.download.unwrap_or_default()
            + self.test_duration.upload.unwrap_or_default();
        self.test_duration.total = Some(total);
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sponsor == "?" {
            return write!(f, "[{:>4}] {}", self.id, self.name);
        }

        if self.country.is_empty() {
            return write!(
                f,
                "[{:>4}] {:.2}km {} by {}",
                self.id, self.distance, self.name, self.sponsor
            );
        }

        write!(
            f,
            "[{:>4}] {:.2}km {} ({}) by {}",
            self.id, self.distance, self.name, self.country, self.sponsor
        )
    }
}

/// An ordered collection of servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Servers(pub Vec<Server>);

impl Servers {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Server> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Server> {
        self.0.iter_mut()
    }

    pub fn push(&mut self, server: Server) {
        self.0.push(server);
    }

    /// Servers whose last probe did not time out, ordered by latency.
    pub fn available(&self) -> Servers {
        let mut available: Vec<Server> = self
            .0
            .iter()
            .filter(|server| !server.timed_out())
            .cloned()
            .collect();

        available.sort_by_key(|server| server.latency.unwrap_or_default());

        Servers(available)
    }

    /// Hosts of all servers, in order.
    pub fn hosts(&self) -> Vec<String> {
        self.0.iter().map(|server| server.host.clone()).collect()
    }

    /// Finds servers by id. When none of the ids match, falls back to the
    /// single server with the lowest measured latency.
    pub fn find_server(&self, ids: &[&str]) -> Result<Servers> {
        if self.0.is_empty() {
            return Err(Error::NoServer);
        }

        let mut found = Servers::default();
        for id in ids {
            if let Some(server) =
                self.0.iter().find(|server| server.id == *id)
            {
                found.push(server.clone());
            }
        }

        if found.is_empty() {
            let lowest = self
                .0
                .iter()
                .filter(|server| {
                    matches!(server.latency, Some(latency)
                        if latency > Duration::ZERO && latency != PING_TIMEOUT)
                })
                .min_by_key(|server| server.latency)
                .unwrap_or(&self.0[0]);
            found.push(lowest.clone());
        }

        Ok(found)
    }

    /// Sorts in place by great-circle distance from the user.
    pub fn sort_by_distance(&mut self) {
        self.0.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

impl fmt::Display for Servers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for server in &self.0 {
            writeln!(f, "{server}")?;
        }

        Ok(())
    }
}

impl IntoIterator for Servers {
    type Item = Server;
    type IntoIter = std::vec::IntoIter<Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Servers {
    type Item = &'a Server;
    type IntoIter = std::slice::Iter<'a, Server>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Speedtest {
    /// Builds a server record from a bare URL, with as much filled in as
    /// possible. The path is forced to the standard upload endpoint.
    pub fn custom_server(&self, host: &str) -> Result<Server> {
        if host.is_empty() {
            return Err(Error::Protocol("host cannot be empty".to_string()));
        }

        let mut url = Url::parse(host)?;
        url.set_path("/speedtest/upload.php");

        let host_port = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        };

        Ok(Server {
            id: "Custom".to_string(),
            lat: "?".to_string(),
            lon: "?".to_string(),
            country: "?".to_string(),
            sponsor: "?".to_string(),
            url: url.to_string(),
            name: host_port.clone(),
            host: host_port,
            engine: self.handle(),
            ..Server::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ookla::UserConfig;

    fn engine() -> Speedtest {
        Speedtest::new(UserConfig::default()).unwrap()
    }

    fn server(id: &str, latency: Option<Duration>) -> Server {
        Server {
            id: id.to_string(),
            url: format!("http://server-{id}.test/speedtest/upload.php"),
            host: format!("server-{id}.test:8080"),
            latency,
            ..Server::default()
        }
    }

    #[test]
    fn test_custom_server_shape() {
        let engine = engine();
        let custom =
            engine.custom_server("http://example.com:8080/foo").unwrap();

        assert_eq!(custom.id, "Custom");
        assert_eq!(custom.url, "http://example.com:8080/speedtest/upload.php");
        assert_eq!(custom.host, "example.com:8080");
        assert_eq!(custom.name, "example.com:8080");
        assert_eq!(custom.sponsor, "?");
        assert!(custom.engine.core().is_ok());
    }

    #[test]
    fn test_custom_server_rejects_empty_and_bad_urls() {
        let engine = engine();
        assert!(engine.custom_server("").is_err());
        assert!(engine.custom_server("://nope").is_err());
    }

    #[test]
    fn test_engine_ref_dies_with_engine() {
        let custom = {
            let engine = engine();
            engine.custom_server("http://example.com").unwrap()
        };

        assert!(matches!(
            custom.engine.core(),
            Err(Error::UninitializedManager)
        ));
    }

    #[test]
    fn test_available_filters_and_sorts() {
        let servers = Servers(vec![
            server("1", Some(Duration::from_millis(30))),
            server("2", Some(PING_TIMEOUT)),
            server("3", Some(Duration::from_millis(10))),
            server("4", None),
        ]);

        let available = servers.available();
        assert_eq!(available.len(), 3);
        // the unprobed server (latency None) sorts first, then by latency
        assert_eq!(available.0[0].id, "4");
        assert_eq!(available.0[1].id, "3");
        assert_eq!(available.0[2].id, "1");
    }

    #[test]
    fn test_find_server_by_id_and_fallback() {
        let servers = Servers(vec![
            server("10", Some(Duration::from_millis(50))),
            server("20", Some(Duration::from_millis(5))),
        ]);

        let found = servers.find_server(&["10"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.0[0].id, "10");

        // unknown id falls back to the lowest-latency server
        let found = servers.find_server(&["99"]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.0[0].id, "20");

        assert!(Servers::default().find_server(&["1"]).is_err());
    }

    #[test]
    fn test_ping_host_prefers_host_field() {
        let with_host = server("1", None);
        assert_eq!(with_host.ping_host().unwrap(), "server-1.test:8080");

        let mut from_url = server("2", None);
        from_url.host = String::new();
        from_url.url = "http://fallback.test/speedtest/upload.php".to_string();
        assert_eq!(from_url.ping_host().unwrap(), "fallback.test:80");
    }

    #[test]
    fn test_check_result_valid() {
        let mut s = server("1", None);
        s.dl_speed = ByteRate(1_000_000.0);
        s.ul_speed = ByteRate(500_000.0);
        assert!(s.check_result_valid());

        s.ul_speed = ByteRate(1.0);
        assert!(!s.check_result_valid());
    }

    #[test]
    fn test_display_variants() {
        let mut s = server("1234", None);
        s.sponsor = "?".to_string();
        s.name = "Somewhere".to_string();
        assert_eq!(s.to_string(), "[1234] Somewhere");

        s.sponsor = "ISP".to_string();
        s.country = "JP".to_string();
        s.distance = 12.5;
        assert_eq!(s.to_string(), "[1234] 12.50km Somewhere (JP) by ISP");
    }

    #[test]
    fn test_total_duration_sums_phases() {
        let mut s = server("1", None);
        s.test_duration.ping = Some(Duration::from_millis(100));
        s.test_duration.download = Some(Duration::from_millis(200));
        s.update_total_duration();
        assert_eq!(s.test_duration.total, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_catalog_json_decodes_into_servers() {
        let raw = r#"[{"url":"http://a.test/speedtest/upload.php",
            "lat":"35.0","lon":"139.0","name":"Tokyo","country":"Japan",
            "sponsor":"Example","id":"1","host":"a.test:8080"}]"#;

        let servers: Vec<Server> = serde_json::from_str(raw).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "1");
        assert_eq!(servers[0].host, "a.test:8080");
        assert!(servers[0].latency.is_none());
    }
}
