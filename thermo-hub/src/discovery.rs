/**
 * DISCOVERY TABLE - Registre partagé des sondes connues
 *
 * RÔLE :
 * Table process-wide clé → ProbeRecord (localisation réseau + dernier contact).
 * Alimentée par le mécanisme de découverte (ici : seed hub.yaml) et par le
 * Liveness Updater; lue à chaque cycle par la boucle de réconciliation.
 *
 * FONCTIONNEMENT :
 * - Un seul Mutex autour d'une BTreeMap (petite table, peu d'écritures)
 * - `list()` renvoie une copie : l'appelant ne voit jamais les écritures suivantes
 * - `upsert()` crée ou patche une entrée, `last_seen` ne recule jamais
 * - Trait `ProbeDirectory` : une source absente/en erreur = zéro sonde
 */

use std::sync::Arc;
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::warn;

use crate::models::{ProbeOrigin, ProbePatch, ProbeRecord, ProbeView, ProbesMap};
use crate::state::{new_state, snapshot, Shared};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// source externe (navigateur mDNS) hors service; la table en mémoire ne la produit pas
    #[error("discovery unavailable: {0}")]
    #[cfg_attr(not(test), allow(dead_code))]
    Unavailable(String),
}

/// Interface lue par la réconciliation et écrite par le suivi de liveness
pub trait ProbeDirectory: Send + Sync {
    fn list(&self) -> Result<ProbesMap, DiscoveryError>;
    fn upsert(&self, key: &str, patch: ProbePatch) -> Result<ProbeRecord, DiscoveryError>;
}

pub type SharedDirectory = Arc<dyn ProbeDirectory>;

#[derive(Clone)]
pub struct DiscoveryTable {
    probes: Shared<ProbesMap>,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self { probes: new_state(ProbesMap::new()) }
    }

    pub fn seeded(records: impl IntoIterator<Item = ProbeRecord>) -> Self {
        let table = Self::new();
        {
            let mut map = table.probes.lock();
            for rec in records {
                map.insert(rec.key.clone(), rec);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }
}

impl Default for DiscoveryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeDirectory for DiscoveryTable {
    fn list(&self) -> Result<ProbesMap, DiscoveryError> {
        Ok(snapshot(&self.probes))
    }

    fn upsert(&self, key: &str, patch: ProbePatch) -> Result<ProbeRecord, DiscoveryError> {
        let mut map = self.probes.lock();
        let origin = patch.origin.unwrap_or(ProbeOrigin::Discovered);
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| ProbeRecord::new(key, origin));
        entry.apply(patch);
        Ok(entry.clone())
    }
}

/// Snapshot tolérant : une source indisponible est vue comme vide
pub fn snapshot_or_empty(dir: &dyn ProbeDirectory) -> ProbesMap {
    match dir.list() {
        Ok(map) => map,
        Err(e) => {
            warn!("[discovery] {e} - treating as zero probes");
            ProbesMap::new()
        }
    }
}

pub fn to_view(rec: &ProbeRecord, now: OffsetDateTime, stale_after: Duration) -> ProbeView {
    let age = rec.last_seen.map(|seen| now - seen);
    ProbeView {
        key: rec.key.clone(),
        host: rec.host.clone(),
        ip: rec.ip.map(|ip| ip.to_string()),
        port: rec.port_or_default(),
        name: rec.name.clone(),
        probe_id: rec.probe_id.clone(),
        last_seen: rec.last_seen.and_then(|t| t.format(&Rfc3339).ok()),
        stale: age.map(|a| a > stale_after).unwrap_or(true),
        stale_for_seconds: age.map(|a| a.whole_seconds().max(0)),
        origin: rec.origin,
    }
}

/// Liste stable pour le dashboard : tri par nom, puis adresse, puis clé
pub fn listing(dir: &dyn ProbeDirectory, stale_after: Duration) -> Vec<ProbeView> {
    let now = OffsetDateTime::now_utc();
    let mut views: Vec<ProbeView> = snapshot_or_empty(dir)
        .values()
        .map(|rec| to_view(rec, now, stale_after))
        .collect();

    views.sort_by(|a, b| {
        let addr = |v: &ProbeView| v.ip.clone().or_else(|| v.host.clone()).unwrap_or_default();
        let name = |v: &ProbeView| v.name.clone().unwrap_or_default();
        (name(a), addr(a), a.key.clone()).cmp(&(name(b), addr(b), b.key.clone()))
    });
    views
}
