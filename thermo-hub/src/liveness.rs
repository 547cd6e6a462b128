//! Suivi de liveness : chaque lecture entrante rafraîchit `last_seen` de la
//! sonde qui l'a envoyée, ou crée une entrée provisoire si la sonde est inconnue.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::discovery::{DiscoveryError, ProbeDirectory};
use crate::models::{ProbeOrigin, ProbePatch, ProbeRecord};

/// Comment un `probe_id` entrant est rapproché d'une entrée de la table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// égalité après normalisation (trim, '.' final, minuscules)
    #[default]
    Exact,
    /// ancien comportement : le champ contient l'identifiant
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessOutcome {
    Touched(String),
    Created(String),
    Skipped,
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl MatchPolicy {
    fn matches(self, candidate: &str, probe_id: &str) -> bool {
        match self {
            MatchPolicy::Exact => normalize(candidate) == normalize(probe_id),
            MatchPolicy::Substring => candidate.contains(probe_id),
        }
    }

    fn matches_record(self, rec: &ProbeRecord, probe_id: &str) -> bool {
        std::iter::once(Some(rec.key.as_str()))
            .chain([rec.probe_id.as_deref(), rec.name.as_deref(), rec.host.as_deref()])
            .flatten()
            .filter(|field| !field.is_empty())
            .any(|field| self.matches(field, probe_id))
    }
}

/// Rafraîchit ou crée l'entrée correspondant à `probe_id`.
///
/// Les entrées sont parcourues dans l'ordre des clés, la première qui matche gagne.
pub fn touch(
    directory: &dyn ProbeDirectory,
    probe_id: &str,
    origin_ip: Option<IpAddr>,
    host_hint: Option<&str>,
    policy: MatchPolicy,
) -> Result<LivenessOutcome, DiscoveryError> {
    let probe_id = probe_id.trim();
    if probe_id.is_empty() {
        return Ok(LivenessOutcome::Skipped);
    }

    let existing = directory
        .list()?
        .into_values()
        .find(|rec| policy.matches_record(rec, probe_id));

    if let Some(rec) = existing {
        // un match partiel ne doit pas renommer l'entrée
        let adopt = policy == MatchPolicy::Exact && rec.probe_id.is_none();
        let patch = ProbePatch {
            probe_id: adopt.then(|| probe_id.to_string()),
            ..ProbePatch::seen_now()
        };
        directory.upsert(&rec.key, patch)?;
        debug!(key = %rec.key, probe_id, "[liveness] touched");
        return Ok(LivenessOutcome::Touched(rec.key));
    }

    let host = host_hint
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .or_else(|| origin_ip.map(|ip| ip.to_string()));
    let patch = ProbePatch {
        probe_id: Some(probe_id.to_string()),
        host,
        ip: origin_ip,
        port: Some(80),
        last_seen: Some(OffsetDateTime::now_utc()),
        origin: Some(ProbeOrigin::Provisional),
        ..Default::default()
    };
    directory.upsert(probe_id, patch)?;
    info!(probe_id, ip = ?origin_ip, "[liveness] unknown probe, provisional entry created");
    Ok(LivenessOutcome::Created(probe_id.to_string()))
}
