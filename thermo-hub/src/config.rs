use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::liveness::MatchPolicy;
use crate::models::{ProbeOrigin, ProbeRecord};
use crate::provision::DEFAULT_TIMEOUT;
use crate::reconciler::FailurePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid listen address '{0}'")]
    Listen(String),
}

/// Configuration statique du hub (hub.yaml)
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    pub csv_file: Option<PathBuf>,
    pub settings_file: Option<PathBuf>,
    /// ex: "http://temps-hub.lan:8080"; sinon IP LAN détectée à chaque cycle
    pub public_base: Option<String>,
    pub server_token: Option<String>,
    pub reconcile: ReconcileConf,
    pub liveness: LivenessConf,
    pub probes: Vec<StaticProbeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcileConf {
    pub period_sec: u64,
    pub timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LivenessConf {
    pub match_policy: MatchPolicy,
    pub stale_after_secs: i64,
}

/// Sonde déclarée à la main (réseaux sans mDNS fiable)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StaticProbeConf {
    pub key: Option<String>,
    pub name: Option<String>,
    pub probe_id: Option<String>,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            data_dir: PathBuf::from("./data"),
            csv_file: None,
            settings_file: None,
            public_base: None,
            server_token: None,
            reconcile: ReconcileConf::default(),
            liveness: LivenessConf::default(),
            probes: Vec::new(),
        }
    }
}

impl Default for ReconcileConf {
    fn default() -> Self {
        Self { period_sec: 10, timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64, failure_policy: FailurePolicy::RetryForever }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { match_policy: MatchPolicy::Exact, stale_after_secs: 90 }
    }
}

impl HubConfig {
    pub fn parse(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    /// Surcharges par variables d'environnement (PUBLIC_BASE, PORT, SERVER_TOKEN, CSV_FILE)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(base) = non_empty("PUBLIC_BASE") {
            self.public_base = Some(base);
        }
        if let Some(token) = non_empty("SERVER_TOKEN") {
            self.server_token = Some(token);
        }
        if let Some(csv) = non_empty("CSV_FILE") {
            self.csv_file = Some(PathBuf::from(csv));
        }
        if let Some(port) = non_empty("PORT").and_then(|p| p.parse::<u16>().ok()) {
            let host = self.listen.rsplit_once(':').map(|(h, _)| h).unwrap_or("0.0.0.0");
            self.listen = format!("{host}:{port}");
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| ConfigError::Listen(self.listen.clone()))
    }

    pub fn csv_path(&self) -> PathBuf {
        self.csv_file.clone().unwrap_or_else(|| self.data_dir.join("temperature_log.csv"))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_file.clone().unwrap_or_else(|| self.data_dir.join("settings.json"))
    }

    /// Token serveur effectif ("" = API ouverte)
    pub fn token(&self) -> &str {
        self.server_token.as_deref().map(str::trim).unwrap_or("")
    }

    /// Entrées de la table de découverte issues de `probes:`
    pub fn static_records(&self) -> Vec<ProbeRecord> {
        self.probes.iter().filter_map(StaticProbeConf::to_record).collect()
    }
}

impl StaticProbeConf {
    fn to_record(&self) -> Option<ProbeRecord> {
        let key = self
            .key
            .clone()
            .or_else(|| self.probe_id.clone())
            .or_else(|| self.name.clone())
            .or_else(|| self.host.clone())
            .or_else(|| self.ip.map(|ip| ip.to_string()))?;

        let mut rec = ProbeRecord::new(key, ProbeOrigin::Static);
        rec.name = self.name.clone();
        rec.probe_id = self.probe_id.clone();
        rec.host = self.host.clone();
        rec.ip = self.ip;
        rec.port = self.port;
        Some(rec)
    }
}

pub async fn load_config() -> HubConfig {
    let path = std::env::var("THERMO_HUB_CONFIG").unwrap_or_else(|_| "hub.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        HubConfig::parse(&txt).unwrap_or_else(|e| {
            warn!("[hub] config invalide ({path}): {e}");
            HubConfig::default()
        })
    } else {
        warn!("[hub] pas de {path}, usage config par défaut");
        HubConfig::default()
    };
    cfg.apply_overrides(|k| std::env::var(k).ok());
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty_gives_defaults() {
        let cfg = HubConfig::parse("").unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.reconcile.period_sec, 10);
        assert_eq!(cfg.reconcile.failure_policy, FailurePolicy::RetryForever);
        assert_eq!(cfg.liveness.match_policy, MatchPolicy::Exact);
        assert_eq!(cfg.csv_path(), PathBuf::from("./data/temperature_log.csv"));
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
listen: "127.0.0.1:9000"
public_base: "http://10.0.0.5:9000"
reconcile:
  period_sec: 30
  failure_policy:
    mode: backoff
    max_skip_cycles: 4
liveness:
  match_policy: substring
probes:
  - name: kitchen
    host: probe1.local
    port: 80
  - ip: 10.0.0.9
"#;
        let cfg = HubConfig::parse(yaml).unwrap();
        assert_eq!(cfg.listen_addr().unwrap().port(), 9000);
        assert_eq!(cfg.reconcile.period_sec, 30);
        assert_eq!(cfg.reconcile.timeout_ms, 3000);
        assert_eq!(cfg.reconcile.failure_policy, FailurePolicy::Backoff { max_skip_cycles: 4 });
        assert_eq!(cfg.liveness.match_policy, MatchPolicy::Substring);

        let recs = cfg.static_records();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].key, "kitchen");
        assert_eq!(recs[1].key, "10.0.0.9");
        assert_eq!(recs[1].origin, ProbeOrigin::Static);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "8181"),
            ("SERVER_TOKEN", " secret "),
            ("PUBLIC_BASE", ""),
            ("CSV_FILE", "/tmp/t.csv"),
        ]
        .into_iter()
        .collect();

        let mut cfg = HubConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.listen, "0.0.0.0:8181");
        assert_eq!(cfg.token(), "secret");
        assert!(cfg.public_base.is_none());
        assert_eq!(cfg.csv_path(), PathBuf::from("/tmp/t.csv"));
    }

    #[test]
    fn test_static_probe_without_identity_is_dropped() {
        let cfg = HubConfig {
            probes: vec![StaticProbeConf { port: Some(80), ..Default::default() }],
            ..Default::default()
        };
        assert!(cfg.static_records().is_empty());
    }
}
