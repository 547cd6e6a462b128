/*!
Utilitaires de test pour le hub

- `ReadingPayload` : construit les payloads d'ingestion (alias de champs variés)
- `TempStore` : répertoire de données jetable (CSV + settings.json)
*/

use anyhow::Result;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tempfile::TempDir;

/// Builder de payload `/ingest`
#[derive(Debug, Default, Clone)]
pub struct ReadingPayload {
    fields: Map<String, Value>,
}

impl ReadingPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn celsius(self, c: f64) -> Self {
        self.field("temperature_c", json!(c))
    }

    pub fn fahrenheit(self, f: f64) -> Self {
        self.field("temperature_f", json!(f))
    }

    /// Champ arbitraire, p.ex. un alias `t_c` ou une valeur en chaîne
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn probe_id(self, id: &str) -> Self {
        self.field("probe_id", json!(id))
    }

    pub fn timestamp(self, ts: &str) -> Self {
        self.field("timestamp", json!(ts))
    }

    pub fn token(self, token: &str) -> Self {
        self.field("token", json!(token))
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }

    /// Même payload en query string (GET /ingest)
    pub fn to_query(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Répertoire de données temporaire, supprimé au drop
pub struct TempStore {
    dir: TempDir,
}

impl TempStore {
    pub fn new() -> Result<Self> {
        Ok(Self { dir: tempfile::tempdir()? })
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.path().join("temperature_log.csv")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.path().join("settings.json")
    }

    /// Fichier au format d'avant la colonne probe_id
    pub fn write_legacy_csv(&self, rows: &[(&str, f64)]) -> Result<()> {
        let mut txt = String::from("timestamp,temperature_c,temperature_f\n");
        for (ts, c) in rows {
            txt.push_str(&format!("{ts},{c},{}\n", c * 9.0 / 5.0 + 32.0));
        }
        std::fs::write(self.csv_path(), txt)?;
        Ok(())
    }

    /// Lignes brutes du CSV, en-tête compris
    pub fn csv_lines(&self) -> Result<Vec<String>> {
        let txt = std::fs::read_to_string(self.csv_path())?;
        Ok(txt.lines().map(String::from).collect())
    }

    pub fn write_settings(&self, settings: &Value) -> Result<()> {
        std::fs::write(self.settings_path(), serde_json::to_string_pretty(settings)?)?;
        Ok(())
    }
}
