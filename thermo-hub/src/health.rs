use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::discovery::{snapshot_or_empty, ProbeDirectory};
use crate::models::ProbeOrigin;
use crate::state::{new_state, Shared};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HubHealth {
    pub uptime_seconds: u64,
    pub probes_tracked: u32,
    pub provisional_probes: u32,
    pub reconcile_cycles: u64,
    pub last_cycle_at: Option<String>,
    pub provision_ok: u64,
    pub provision_failed: u64,
    pub readings_accepted: u64,
    pub readings_degraded: u64,
    pub readings_rejected: u64,
    pub memory_usage_mb: f32,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    provision_ok: AtomicU64,
    provision_failed: AtomicU64,
    readings_accepted: AtomicU64,
    readings_degraded: AtomicU64,
    readings_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    last_cycle_at: Shared<Option<OffsetDateTime>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            last_cycle_at: new_state(None),
        }
    }

    pub fn record_cycle(&self, succeeded: usize, failed: usize) {
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        self.counters.provision_ok.fetch_add(succeeded as u64, Ordering::Relaxed);
        self.counters.provision_failed.fetch_add(failed as u64, Ordering::Relaxed);
        *self.last_cycle_at.lock() = Some(OffsetDateTime::now_utc());
    }

    pub fn reading_accepted(&self, degraded: bool) {
        self.counters.readings_accepted.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.counters.readings_degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reading_rejected(&self) {
        self.counters.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, probes: &dyn ProbeDirectory) -> HubHealth {
        let map = snapshot_or_empty(probes);
        let provisional = map.values().filter(|p| p.origin == ProbeOrigin::Provisional).count();
        let c = &self.counters;
        let last_cycle = *self.last_cycle_at.lock();

        HubHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            probes_tracked: map.len() as u32,
            provisional_probes: provisional as u32,
            reconcile_cycles: c.cycles.load(Ordering::Relaxed),
            last_cycle_at: last_cycle.and_then(|t| t.format(&Rfc3339).ok()),
            provision_ok: c.provision_ok.load(Ordering::Relaxed),
            provision_failed: c.provision_failed.load(Ordering::Relaxed),
            readings_accepted: c.readings_accepted.load(Ordering::Relaxed),
            readings_degraded: c.readings_degraded.load(Ordering::Relaxed),
            readings_rejected: c.readings_rejected.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
