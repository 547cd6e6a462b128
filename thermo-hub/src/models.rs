use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use time::OffsetDateTime;

/// Provenance d'une entrée de la table de découverte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOrigin {
    /// déclarée dans hub.yaml
    Static,
    /// annoncée par un mécanisme de découverte externe
    Discovered,
    /// créée à la réception d'une lecture d'une sonde inconnue
    Provisional,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub key: String,
    pub name: Option<String>,
    pub probe_id: Option<String>,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub last_seen: Option<OffsetDateTime>,
    pub origin: ProbeOrigin,
}

impl ProbeRecord {
    pub fn new(key: impl Into<String>, origin: ProbeOrigin) -> Self {
        Self {
            key: key.into(),
            name: None,
            probe_id: None,
            host: None,
            ip: None,
            port: None,
            last_seen: None,
            origin,
        }
    }

    /// Adresse utilisable pour joindre la sonde : IP d'abord, sinon hostname.
    /// Les points finaux (`probe.local.`) sont retirés.
    pub fn address(&self) -> Option<String> {
        let raw = match (&self.ip, &self.host) {
            (Some(ip), _) => ip.to_string(),
            (None, Some(host)) => host.clone(),
            (None, None) => return None,
        };
        let trimmed = raw.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn port_or_default(&self) -> u16 {
        match self.port {
            Some(0) | None => 80,
            Some(p) => p,
        }
    }

    /// Applique un patch partiel; `last_seen` ne recule jamais.
    pub fn apply(&mut self, patch: ProbePatch) {
        if let Some(name) = patch.name {
            self.name = Some(name);
        }
        if let Some(probe_id) = patch.probe_id {
            self.probe_id = Some(probe_id);
        }
        if let Some(host) = patch.host {
            self.host = Some(host);
        }
        if let Some(ip) = patch.ip {
            self.ip = Some(ip);
        }
        if let Some(port) = patch.port {
            self.port = Some(port);
        }
        if let Some(seen) = patch.last_seen {
            self.last_seen = Some(match self.last_seen {
                Some(prev) if prev > seen => prev,
                _ => seen,
            });
        }
    }
}

/// Champs partiels pour `upsert`; `None` = champ inchangé
#[derive(Debug, Clone, Default)]
pub struct ProbePatch {
    pub name: Option<String>,
    pub probe_id: Option<String>,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub last_seen: Option<OffsetDateTime>,
    /// utilisé seulement à la création
    pub origin: Option<ProbeOrigin>,
}

impl ProbePatch {
    pub fn seen_now() -> Self {
        Self {
            last_seen: Some(OffsetDateTime::now_utc()),
            ..Self::default()
        }
    }
}

pub type ProbesMap = BTreeMap<String, ProbeRecord>;

/// Vue sérialisée d'une sonde pour `GET /probes`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeView {
    pub key: String,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub probe_id: Option<String>,
    pub last_seen: Option<String>, // RFC3339
    pub stale: bool,
    pub stale_for_seconds: Option<i64>,
    pub origin: ProbeOrigin,
}

/// Une ligne du journal CSV
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub timestamp: String,
    pub temperature_c: f64,
    pub temperature_f: f64,
    #[serde(default)]
    pub probe_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_address_prefers_ip_and_trims_dot() {
        let mut rec = ProbeRecord::new("p1", ProbeOrigin::Discovered);
        rec.host = Some("probe1.local.".into());
        assert_eq!(rec.address().as_deref(), Some("probe1.local"));

        rec.ip = Some("10.0.0.7".parse().unwrap());
        assert_eq!(rec.address().as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_address_empty_host_is_unusable() {
        let mut rec = ProbeRecord::new("p1", ProbeOrigin::Discovered);
        assert!(rec.address().is_none());
        rec.host = Some("  .".into());
        assert!(rec.address().is_none());
    }

    #[test]
    fn test_port_defaults_to_80() {
        let mut rec = ProbeRecord::new("p1", ProbeOrigin::Static);
        assert_eq!(rec.port_or_default(), 80);
        rec.port = Some(0);
        assert_eq!(rec.port_or_default(), 80);
        rec.port = Some(8081);
        assert_eq!(rec.port_or_default(), 8081);
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let now = OffsetDateTime::now_utc();
        let mut rec = ProbeRecord::new("p1", ProbeOrigin::Discovered);
        rec.apply(ProbePatch { last_seen: Some(now), ..Default::default() });
        rec.apply(ProbePatch {
            last_seen: Some(now - Duration::seconds(30)),
            host: Some("probe1.local".into()),
            ..Default::default()
        });
        assert_eq!(rec.last_seen, Some(now));
        assert_eq!(rec.host.as_deref(), Some("probe1.local"));
    }
}
