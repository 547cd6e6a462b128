//! Mode pull : interroge périodiquement l'endpoint CSV d'une sonde.
//!
//! Même forme que la réconciliation : réveil, lecture des réglages, fetch ou
//! skip, pause. Les erreurs sont loggées, jamais fatales.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::health::HealthTracker;
use crate::ingest::now_timestamp;
use crate::settings::SharedSettings;
use crate::store::TimeSeriesStore;
use crate::worker::{sleep_or_stop, stop_channel, stop_requested, LoopHandle};

pub const PULL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("unexpected CSV body: {0}")]
    Body(String),
}

/// Deuxième ligne `ts,c,f` de la réponse → (c, f)
pub fn parse_probe_csv(body: &str) -> Result<(f64, f64), PollError> {
    let line = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .nth(1)
        .ok_or_else(|| PollError::Body("no data line".into()))?;
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    let num = |i: usize| cols.get(i).and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite());
    match (num(1), num(2)) {
        (Some(c), Some(f)) => Ok((c, f)),
        _ => Err(PollError::Body(line.to_string())),
    }
}

pub struct Poller {
    settings: SharedSettings,
    store: Arc<TimeSeriesStore>,
    health: HealthTracker,
    client: reqwest::Client,
}

impl Poller {
    pub fn new(settings: SharedSettings, store: Arc<TimeSeriesStore>, health: HealthTracker) -> Self {
        Self { settings, store, health, client: reqwest::Client::new() }
    }

    /// Un réveil : `Ok(None)` si le pull est désactivé ou sans URL
    pub async fn poll_once(&self) -> Result<Option<(f64, f64)>, PollError> {
        let settings = self.settings.snapshot();
        let url = match settings.pull_url.as_deref().map(str::trim) {
            Some(url) if settings.pull_enabled && !url.is_empty() => url.to_string(),
            _ => return Ok(None),
        };

        let resp = self.client.get(&url).timeout(PULL_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            return Err(PollError::Status(resp.status().as_u16()));
        }
        let (c, f) = parse_probe_csv(&resp.text().await?)?;

        let store = self.store.clone();
        let ts = now_timestamp();
        let outcome = tokio::task::spawn_blocking(move || store.append(&ts, c, f, None))
            .await
            .map_err(|e| PollError::Body(format!("store task: {e}")))?;
        match outcome {
            Ok(outcome) => self.health.reading_accepted(outcome.is_degraded()),
            Err(e) => {
                self.health.reading_rejected();
                warn!(error = %e, "[poller] reading not stored");
            }
        }
        debug!(url = %url, c, "[poller] pulled");
        Ok(Some((c, f)))
    }

    pub fn spawn(self: Arc<Self>) -> LoopHandle {
        let (stop_tx, mut stop_rx) = stop_channel();
        let join = tokio::spawn(async move {
            info!("[poller] started");
            loop {
                if stop_requested(&stop_rx) {
                    break;
                }
                if let Err(e) = self.poll_once().await {
                    warn!("[poller] {e}");
                }
                let period = Duration::from_millis(self.settings.snapshot().interval_ms());
                if sleep_or_stop(&mut stop_rx, period).await {
                    break;
                }
            }
            info!("[poller] stopped");
        });
        LoopHandle::new(stop_tx, join)
    }
}
