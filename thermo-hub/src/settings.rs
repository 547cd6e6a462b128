/**
 * RUNTIME SETTINGS - Réglages modifiables à chaud (settings.json)
 *
 * RÔLE :
 * Intervalle d'échantillonnage, token poussé aux sondes, activation du
 * provisioning auto et du poller. Lu à chaque cycle par les boucles de fond,
 * modifié via POST /config.
 *
 * FONCTIONNEMENT :
 * - Une seule frontière d'exclusion : chaque get/set/merge se fait sous le Mutex
 * - Toute mutation est validée (types, bornes) avant d'être appliquée puis persistée
 * - Les clés inconnues sont conservées telles quelles
 */

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::state::{new_state, snapshot, Shared};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings value: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("settings applied but not persisted to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Au-delà d'un jour, l'intervalle n'a plus de sens pour une sonde
pub const MAX_INTERVAL_SEC: u64 = 86_400;

fn default_interval() -> u64 {
    5
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSettings {
    #[serde(default = "default_interval")]
    pub interval_sec: u64,
    #[serde(default = "enabled")]
    pub pull_enabled: bool,
    #[serde(default = "enabled")]
    pub auto_provision: bool,
    #[serde(default)]
    pub provision_token: String,
    /// endpoint CSV d'une sonde à interroger (mode pull)
    #[serde(default)]
    pub pull_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            interval_sec: default_interval(),
            pull_enabled: true,
            auto_provision: true,
            provision_token: String::new(),
            pull_url: None,
            extra: Map::new(),
        }
    }
}

impl HubSettings {
    pub fn interval_ms(&self) -> u64 {
        self.interval_sec.clamp(1, MAX_INTERVAL_SEC).saturating_mul(1000)
    }

    fn validated(self) -> Result<Self, serde_json::Error> {
        if self.interval_sec > MAX_INTERVAL_SEC {
            return Err(serde_json::Error::custom(format!(
                "interval_sec must be at most {MAX_INTERVAL_SEC}, got {}",
                self.interval_sec
            )));
        }
        Ok(self)
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    data: Shared<HubSettings>,
}

impl SettingsStore {
    /// Charge settings.json; un fichier absent ou illisible donne les valeurs par défaut
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(txt) => serde_json::from_str(&txt).and_then(HubSettings::validated).unwrap_or_else(|e| {
                warn!("[settings] {} unreadable ({e}), using defaults", path.display());
                HubSettings::default()
            }),
            Err(_) => HubSettings::default(),
        };
        Self { path, data: new_state(data) }
    }

    #[cfg(test)]
    pub fn in_memory(data: HubSettings) -> Self {
        Self { path: PathBuf::new(), data: new_state(data) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> HubSettings {
        snapshot(&self.data)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().to_map().remove(key)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<HubSettings, SettingsError> {
        self.mutate(|map| {
            map.insert(key.to_string(), value);
        })
    }

    /// Fusionne les clés fournies puis persiste
    pub fn merge(&self, patch: Map<String, Value>) -> Result<HubSettings, SettingsError> {
        self.mutate(|map| map.extend(patch))
    }

    fn mutate<F>(&self, f: F) -> Result<HubSettings, SettingsError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut guard = self.data.lock();
        let mut map = guard.to_map();
        f(&mut map);
        let next = serde_json::from_value::<HubSettings>(Value::Object(map))?.validated()?;
        *guard = next.clone();

        if !self.path.as_os_str().is_empty() {
            persist(&self.path, &guard)?;
        }
        Ok(next)
    }
}

fn persist(path: &Path, settings: &HubSettings) -> Result<(), SettingsError> {
    let wrap = |source| SettingsError::Persist { path: path.to_path_buf(), source };
    let json = serde_json::to_string_pretty(settings)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    std::fs::write(path, json).map_err(wrap)
}

pub type SharedSettings = Arc<SettingsStore>;
