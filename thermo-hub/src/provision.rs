//! Provisioning client: pushes the hub's ingest URL, token and sampling
//! interval to one probe.
//!
//! A probe is tried by numeric address first and by its advertised hostname
//! second: `.local` names do not resolve reliably from every OS, but some
//! firmware only answers requests addressed to its own hostname.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PROVISION_PATH: &str = "/provision";
pub const INGEST_PATH: &str = "/ingest";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Body POSTed to `<probe>/provision`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRequest {
    pub server_url: String,
    pub token: String,
    pub interval_ms: u64,
}

impl ProvisionRequest {
    pub fn new(server_base: &str, token: &str, interval_ms: u64) -> Self {
        Self {
            server_url: format!("{}{}", server_base.trim_end_matches('/'), INGEST_PATH),
            token: token.to_string(),
            interval_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvisionTarget {
    pub host: String,
    pub port: u16,
}

impl ProvisionTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.trim().trim_end_matches('.').to_string(), port }
    }
}

impl fmt::Display for ProvisionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("probe {target} unreachable ({} attempt(s) failed)", attempts.len())]
    Unreachable { target: String, attempts: Vec<AttemptFailure> },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

#[async_trait]
pub trait ProvisionTransport: Send + Sync {
    async fn post(&self, url: &str, body: &ProvisionRequest, timeout: Duration) -> Result<(), TransportError>;
}

/// Provisioning d'une cible complète, vu par la boucle de réconciliation
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision_target(
        &self,
        target: &ProvisionTarget,
        request: &ProvisionRequest,
    ) -> Result<String, ProvisionError>;
}

/// Résolution via le resolver système, IPv4 préférée
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                addrs.iter().find(|ip| ip.is_ipv4()).or_else(|| addrs.first()).copied()
            }
            Err(e) => {
                debug!("[provision] cannot resolve {host}: {e}");
                None
            }
        }
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisionTransport for HttpTransport {
    async fn post(&self, url: &str, body: &ProvisionRequest, timeout: Duration) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(resp.status().as_u16()))
        }
    }
}

fn url_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
        _ => host.to_string(),
    }
}

/// URLs à essayer, dans l'ordre : adresse numérique résolue puis hostname
pub fn candidate_urls(host: &str, resolved: Option<IpAddr>, port: u16) -> Vec<String> {
    let mut urls = Vec::with_capacity(2);
    if let Some(ip) = resolved {
        if ip.to_string() != host {
            urls.push(format!("http://{}:{}{}", url_host(&ip.to_string()), port, PROVISION_PATH));
        }
    }
    urls.push(format!("http://{}:{}{}", url_host(host), port, PROVISION_PATH));
    urls
}

#[derive(Clone)]
pub struct ProvisionClient {
    resolver: Arc<dyn HostResolver>,
    transport: Arc<dyn ProvisionTransport>,
    timeout: Duration,
}

impl ProvisionClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_parts(Arc::new(SystemResolver), Arc::new(HttpTransport::new()), timeout)
    }

    pub fn with_parts(
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn ProvisionTransport>,
        timeout: Duration,
    ) -> Self {
        Self { resolver, transport, timeout }
    }

    /// Returns the URL that accepted the configuration.
    pub async fn try_provision(
        &self,
        host: &str,
        port: u16,
        request: &ProvisionRequest,
    ) -> Result<String, ProvisionError> {
        let target = ProvisionTarget::new(host, port);
        let resolved = self.resolver.resolve(&target.host).await;
        let mut attempts = Vec::new();

        for url in candidate_urls(&target.host, resolved, port) {
            match self.transport.post(&url, request, self.timeout).await {
                Ok(()) => {
                    info!(url = %url, "[provision] OK");
                    return Ok(url);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "[provision] attempt failed");
                    attempts.push(AttemptFailure { url, reason: e.to_string() });
                }
            }
        }

        Err(ProvisionError::Unreachable { target: target.to_string(), attempts })
    }

    /// Variante booléenne de `try_provision`; la réconciliation garde le détail des tentatives
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn provision(
        &self,
        host: &str,
        port: u16,
        server_base: &str,
        token: &str,
        interval_ms: u64,
    ) -> bool {
        let request = ProvisionRequest::new(server_base, token, interval_ms);
        self.try_provision(host, port, &request).await.is_ok()
    }
}

#[async_trait]
impl Provisioner for ProvisionClient {
    async fn provision_target(
        &self,
        target: &ProvisionTarget,
        request: &ProvisionRequest,
    ) -> Result<String, ProvisionError> {
        self.try_provision(&target.host, target.port, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use probe_devkit::ProbeStub;
    use std::collections::{HashMap, HashSet};

    struct FixedResolver(HashMap<String, IpAddr>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn resolve(&self, host: &str) -> Option<IpAddr> {
            host.parse().ok().or_else(|| self.0.get(host).copied())
        }
    }

    /// Enregistre les URLs appelées; échoue pour celles listées
    #[derive(Default)]
    struct ScriptedTransport {
        calls: Mutex<Vec<(String, ProvisionRequest)>>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl ProvisionTransport for ScriptedTransport {
        async fn post(&self, url: &str, body: &ProvisionRequest, _t: Duration) -> Result<(), TransportError> {
            self.calls.lock().push((url.to_string(), body.clone()));
            if self.failing.contains(url) {
                Err(TransportError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn client(failing: &[&str]) -> (ProvisionClient, Arc<ScriptedTransport>) {
        let resolver = FixedResolver(
            [("probe1.local".to_string(), "10.0.0.7".parse().unwrap())].into_iter().collect(),
        );
        let transport = Arc::new(ScriptedTransport {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        (
            ProvisionClient::with_parts(Arc::new(resolver), transport.clone(), DEFAULT_TIMEOUT),
            transport,
        )
    }

    fn called(t: &ScriptedTransport) -> Vec<String> {
        t.calls.lock().iter().map(|(u, _)| u.clone()).collect()
    }

    #[test]
    fn test_request_body() {
        let req = ProvisionRequest::new("http://10.0.0.5:8080/", "tok", 5000);
        assert_eq!(req.server_url, "http://10.0.0.5:8080/ingest");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({
            "server_url": "http://10.0.0.5:8080/ingest",
            "token": "tok",
            "interval_ms": 5000
        }));
    }

    #[test]
    fn test_candidate_urls() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(
            candidate_urls("probe1.local", Some(ip), 80),
            vec!["http://10.0.0.7:80/provision", "http://probe1.local:80/provision"]
        );
        assert_eq!(candidate_urls("10.0.0.7", Some(ip), 80), vec!["http://10.0.0.7:80/provision"]);
        assert_eq!(candidate_urls("probe1.local", None, 8080), vec!["http://probe1.local:8080/provision"]);

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(
            candidate_urls("probe6.local", Some(v6), 80)[0],
            "http://[fe80::1]:80/provision"
        );
    }

    #[tokio::test]
    async fn test_numeric_address_first_and_stops_on_success() {
        let (client, transport) = client(&[]);
        let ok = client.provision("probe1.local", 80, "http://10.0.0.5:8080", "tok", 5000).await;
        assert!(ok);
        assert_eq!(called(&transport), vec!["http://10.0.0.7:80/provision"]);

        let calls = transport.calls.lock();
        assert_eq!(calls[0].1.server_url, "http://10.0.0.5:8080/ingest");
        assert_eq!(calls[0].1.interval_ms, 5000);
    }

    #[tokio::test]
    async fn test_falls_back_to_hostname() {
        let (client, transport) = client(&["http://10.0.0.7:80/provision"]);
        let req = ProvisionRequest::new("http://10.0.0.5:8080", "tok", 5000);
        let url = client.try_provision("probe1.local.", 80, &req).await.unwrap();
        assert_eq!(url, "http://probe1.local:80/provision");
        assert_eq!(
            called(&transport),
            vec!["http://10.0.0.7:80/provision", "http://probe1.local:80/provision"]
        );
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let (client, _transport) = client(&[
            "http://10.0.0.7:80/provision",
            "http://probe1.local:80/provision",
        ]);
        let req = ProvisionRequest::new("http://10.0.0.5:8080", "", 2000);
        let err = client.try_provision("probe1.local", 80, &req).await.unwrap_err();
        let ProvisionError::Unreachable { target, attempts } = err;
        assert_eq!(target, "probe1.local:80");
        assert_eq!(attempts.len(), 2);
        assert!(!client.provision("probe1.local", 80, "http://10.0.0.5:8080", "", 2000).await);
    }

    #[tokio::test]
    async fn test_unresolvable_host_tries_hostname_only() {
        let (client, transport) = client(&[]);
        assert!(client.provision("ghost.local", 80, "http://hub", "", 1000).await);
        assert_eq!(called(&transport), vec!["http://ghost.local:80/provision"]);
    }

    #[tokio::test]
    async fn test_http_transport_against_probe_stub() {
        let stub = ProbeStub::spawn().await.unwrap();
        let client = ProvisionClient::new(DEFAULT_TIMEOUT);
        let port = stub.addr().port();

        assert!(client.provision("127.0.0.1", port, "http://10.0.0.5:8080", "tok", 5000).await);
        let received = stub.provision_requests();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["server_url"], "http://10.0.0.5:8080/ingest");
        assert_eq!(received[0]["token"], "tok");

        stub.fail_with(503);
        assert!(!client.provision("127.0.0.1", port, "http://10.0.0.5:8080", "tok", 5000).await);
    }
}
