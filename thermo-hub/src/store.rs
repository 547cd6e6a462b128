/**
 * TIME-SERIES STORE - Journal CSV des lectures de température
 *
 * RÔLE :
 * Un seul fichier `timestamp,temperature_c,temperature_f[,probe_id]`, rempli
 * ligne par ligne dans l'ordre de réception. Le hub en est le seul écrivain.
 *
 * FONCTIONNEMENT :
 * - Un Mutex unique sérialise append, upgrade de schéma et repli minimal
 * - Upgrade (ajout de la colonne probe_id) : fichier temporaire voisin puis
 *   rename atomique; en cas d'échec l'original n'est jamais touché
 * - Toute erreur du chemin principal → ligne minimale (3 décimales), la lecture
 *   n'est jamais perdue; l'appelant reçoit `Degraded` pour le log
 * - Les lignes antérieures à la colonne probe_id sont relues avec un id vide
 */

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ingest::{c_to_f, now_timestamp};
use crate::models::Reading;

pub const BASE_COLUMNS: [&str; 3] = ["timestamp", "temperature_c", "temperature_f"];
pub const PROBE_ID_COLUMN: &str = "probe_id";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schema upgrade of {path} failed: {reason}")]
    SchemaUpgradeFailed { path: PathBuf, reason: String },
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Résultat d'un append réussi
#[derive(Debug)]
pub enum AppendOutcome {
    Full,
    /// le chemin principal a échoué, la ligne minimale a été écrite à la place
    Degraded(StoreError),
}

impl AppendOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, AppendOutcome::Degraded(_))
    }
}

pub struct TimeSeriesStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TimeSeriesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Crée le fichier avec l'en-tête complet s'il n'existe pas; ne tronque jamais
    pub fn ensure_initialized(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        self.init_locked()
    }

    pub fn append(
        &self,
        timestamp: &str,
        celsius: f64,
        fahrenheit: f64,
        probe_id: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        let _guard = self.lock.lock();
        match self.append_locked(timestamp, celsius, fahrenheit, probe_id) {
            Ok(()) => Ok(AppendOutcome::Full),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "[store] append failed, writing minimal row");
                self.minimal_locked(Some(timestamp), celsius, None)?;
                Ok(AppendOutcome::Degraded(e))
            }
        }
    }

    /// Ligne minimale horodatée maintenant (3 décimales), utilisée par l'ingestion CSV en masse
    pub fn append_minimal(&self, celsius: f64, probe_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        self.minimal_locked(None, celsius, Some(probe_id))
    }

    /// Les `limit` dernières lectures, filtrées par sonde si demandé
    pub fn read_recent(&self, limit: usize, probe_id: Option<&str>) -> Result<Vec<Reading>, StoreError> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let headers = rdr.headers()?.clone();
        let col = |name: &str| headers.iter().position(|h| h.trim() == name);
        let (Some(ts_i), Some(c_i), Some(f_i)) = (col("timestamp"), col("temperature_c"), col("temperature_f")) else {
            return Ok(Vec::new());
        };
        let id_i = col(PROBE_ID_COLUMN);

        let mut rows = Vec::new();
        for record in rdr.records().flatten() {
            let num = |i: usize| record.get(i).and_then(|v| v.trim().parse::<f64>().ok());
            let (Some(c), Some(f)) = (num(c_i), num(f_i)) else {
                continue;
            };
            let id = id_i.and_then(|i| record.get(i)).unwrap_or_default().to_string();
            if probe_id.is_some_and(|want| want != id) {
                continue;
            }
            rows.push(Reading {
                timestamp: record.get(ts_i).unwrap_or_default().to_string(),
                temperature_c: c,
                temperature_f: f,
                probe_id: id,
            });
        }

        let skip = rows.len().saturating_sub(limit);
        Ok(rows.split_off(skip))
    }

    fn init_locked(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        if file.metadata()?.len() == 0 {
            let mut wtr = csv::Writer::from_writer(file);
            wtr.write_record(BASE_COLUMNS.iter().chain([&PROBE_ID_COLUMN]))?;
            wtr.flush()?;
            info!(path = %self.path.display(), "[store] created");
        }
        Ok(())
    }

    fn headers_locked(&self) -> Result<Vec<String>, StoreError> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        Ok(rdr.headers()?.iter().map(|h| h.trim().to_string()).collect())
    }

    fn has_probe_column(&self) -> Result<bool, StoreError> {
        Ok(self.headers_locked()?.iter().any(|h| h == PROBE_ID_COLUMN))
    }

    fn append_locked(&self, ts: &str, c: f64, f: f64, probe_id: Option<&str>) -> Result<(), StoreError> {
        self.init_locked()?;
        let mut has_id = self.has_probe_column()?;
        if probe_id.is_some() && !has_id {
            self.upgrade_locked()?;
            has_id = true;
        }

        let mut row = vec![ts.to_string(), c.to_string(), f.to_string()];
        if has_id {
            row.push(probe_id.unwrap_or_default().to_string());
        }
        self.write_row(&row)
    }

    fn minimal_locked(&self, ts: Option<&str>, c: f64, probe_id: Option<&str>) -> Result<(), StoreError> {
        self.init_locked()?;
        let mut has_id = self.has_probe_column().unwrap_or(false);
        let id = probe_id.unwrap_or_default();
        if !id.is_empty() && !has_id {
            match self.upgrade_locked() {
                Ok(()) => has_id = true,
                Err(e) => warn!(error = %e, "[store] minimal row written without probe id"),
            }
        }

        let ts = ts.map(String::from).unwrap_or_else(now_timestamp);
        let mut row = vec![ts, format!("{c:.3}"), format!("{:.3}", c_to_f(c))];
        if has_id {
            row.push(id.to_string());
        }
        self.write_row(&row)
    }

    fn write_row(&self, row: &[String]) -> Result<(), StoreError> {
        let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        ensure_trailing_newline(&mut file)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        wtr.write_record(row)?;
        wtr.flush()?;
        Ok(())
    }

    /// Ajoute la colonne probe_id : tout ou rien
    fn upgrade_locked(&self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("csv.upgrade");
        let result = self.rewrite_with_probe_column(&tmp);
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::SchemaUpgradeFailed { path: self.path.clone(), reason: e.to_string() });
        }
        info!(path = %self.path.display(), "[store] schema upgraded with probe_id column");
        Ok(())
    }

    fn rewrite_with_probe_column(&self, tmp: &Path) -> Result<(), StoreError> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let mut headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
        let width = headers.len();
        headers.push(PROBE_ID_COLUMN.to_string());

        let mut wtr = csv::WriterBuilder::new().flexible(true).from_path(tmp)?;
        wtr.write_record(&headers)?;
        for record in rdr.records() {
            let record = record?;
            let mut fields: Vec<&str> = record.iter().collect();
            fields.resize(width.max(fields.len()), "");
            fields.push("");
            wtr.write_record(&fields)?;
        }
        drop(rdr);
        let file = wtr.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

fn ensure_trailing_newline(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}
