/**
 * INGEST NORMALIZER - Payloads hétérogènes → (timestamp, °C, °F)
 *
 * RÔLE :
 * Les sondes (et les anciens firmwares) envoient la température sous des noms
 * de champs variés, en nombre JSON ou en chaîne (ingestion par query string).
 * Ce module ramène tout à une seule forme avant écriture dans le store.
 *
 * RÈGLES :
 * - Alias °C : temperature_c, temp_c, t_c, c  (premier présent gagne)
 * - Alias °F : temperature_f, temp_f, t_f, f
 * - °C fait foi : si présent, °F est toujours dérivé (f = c * 9/5 + 32)
 * - Aucun des deux → MissingTemperature (seule erreur visible du client)
 * - Timestamp : `timestamp` puis `ts`, sinon maintenant (heure locale, seconde)
 */

use serde_json::{Map, Value};
use time::macros::format_description;
use time::OffsetDateTime;

pub const CELSIUS_ALIASES: [&str; 4] = ["temperature_c", "temp_c", "t_c", "c"];
pub const FAHRENHEIT_ALIASES: [&str; 4] = ["temperature_f", "temp_f", "t_f", "f"];

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub timestamp: String,
    pub celsius: f64,
    pub fahrenheit: f64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("temperature value required")]
    MissingTemperature,
    #[error("invalid temperature in '{field}': {value}")]
    InvalidTemperature { field: String, value: String },
}

pub fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

pub fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Horodatage courant, heure locale si disponible, à la seconde
pub fn now_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let fmt = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    now.format(&fmt).unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn first_alias<'a>(payload: &'a Map<String, Value>, aliases: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    aliases
        .iter()
        .find_map(|name| payload.get(*name).filter(|v| !v.is_null()).map(|v| (*name, v)))
}

fn as_temperature(field: &str, value: &Value) -> Result<f64, NormalizeError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).ok_or_else(|| NormalizeError::InvalidTemperature {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn explicit_timestamp(payload: &Map<String, Value>) -> Option<String> {
    ["timestamp", "ts"].iter().find_map(|k| match payload.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub fn normalize(payload: &Map<String, Value>) -> Result<NormalizedReading, NormalizeError> {
    let celsius = first_alias(payload, &CELSIUS_ALIASES)
        .map(|(field, v)| as_temperature(field, v))
        .transpose()?;

    let (celsius, fahrenheit) = match celsius {
        Some(c) => (c, c_to_f(c)),
        None => {
            let (field, v) =
                first_alias(payload, &FAHRENHEIT_ALIASES).ok_or(NormalizeError::MissingTemperature)?;
            let f = as_temperature(field, v)?;
            (f_to_c(f), f)
        }
    };

    Ok(NormalizedReading {
        timestamp: explicit_timestamp(payload).unwrap_or_else(now_timestamp),
        celsius,
        fahrenheit,
    })
}

/// Corps texte pour /ingest_csv : une ligne `celsius[,probe_id]` par lecture.
/// Les lignes illisibles (en-tête compris) sont ignorées.
pub fn parse_csv_lines(text: &str) -> Vec<(f64, String)> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split(',').map(str::trim);
            let c = cols.next()?.parse::<f64>().ok().filter(|v| v.is_finite())?;
            let probe_id = cols.next().unwrap_or_default().to_string();
            Some((c, probe_id))
        })
        .collect()
}
