/**
 * RECONCILER - Boucle de réconciliation des sondes
 *
 * RÔLE :
 * Toutes les `period` secondes, pousse la configuration désirée (URL d'ingestion,
 * token, intervalle) à chaque sonde connue de la table de découverte.
 *
 * FONCTIONNEMENT :
 * - Base URL publique + réglages relus à chaque cycle (jamais figés au démarrage)
 * - Snapshot de la table → cibles (ip|host, port|80), entrées sans adresse ignorées
 * - Une tâche par cible : l'échec d'une sonde ne bloque ni n'annule les autres
 * - Échec = log + retry au cycle suivant; pas d'éviction
 * - Politique `backoff` optionnelle : saute une cible en échec pendant N cycles
 * - Arrêt coopératif entre deux cycles, jamais au milieu d'un provisioning
 */

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{snapshot_or_empty, SharedDirectory};
use crate::health::HealthTracker;
use crate::models::ProbesMap;
use crate::network::PublicBase;
use crate::provision::{ProvisionError, ProvisionRequest, ProvisionTarget, Provisioner};
use crate::settings::SharedSettings;
use crate::state::{new_state, Shared};
use crate::worker::{sleep_or_stop, stop_channel, stop_requested, LoopHandle};

/// Que faire d'une sonde qui échoue cycle après cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// réessayer à chaque cycle, sans limite
    RetryForever,
    /// après k échecs consécutifs, sauter min(k, max_skip_cycles) cycles
    Backoff { max_skip_cycles: u32 },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::RetryForever
    }
}

#[derive(Debug)]
pub struct TargetOutcome {
    pub target: ProvisionTarget,
    pub result: Result<String, ProvisionError>,
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub server_base: Option<String>,
    pub outcomes: Vec<TargetOutcome>,
    /// entrées sans adresse exploitable
    pub unusable: usize,
    /// cibles mises de côté par la politique de backoff
    pub deferred: Vec<ProvisionTarget>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    #[cfg(test)]
    pub fn outcome(&self, target: &ProvisionTarget) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| &o.target == target)
    }
}

/// Surcharges ponctuelles d'un provisioning manuel
#[derive(Debug, Default, Clone)]
pub struct ProvisionOverrides {
    pub token: Option<String>,
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FailureState {
    consecutive: u32,
    skip_remaining: u32,
}

/// Cibles de provisioning d'un snapshot, dédupliquées, dans l'ordre des clés
pub fn collect_targets(probes: &ProbesMap) -> (Vec<ProvisionTarget>, usize) {
    let mut seen = BTreeSet::new();
    let mut targets = Vec::new();
    let mut unusable = 0;

    for rec in probes.values() {
        match rec.address() {
            Some(addr) => {
                let target = ProvisionTarget::new(&addr, rec.port_or_default());
                if seen.insert(target.clone()) {
                    targets.push(target);
                }
            }
            None => unusable += 1,
        }
    }
    (targets, unusable)
}

/// Provisionne toutes les cibles en parallèle; chaque résultat est indépendant
pub async fn provision_all(
    provisioner: &dyn Provisioner,
    targets: Vec<ProvisionTarget>,
    request: &ProvisionRequest,
) -> Vec<TargetOutcome> {
    let calls = targets.into_iter().map(|target| async move {
        let result = provisioner.provision_target(&target, request).await;
        TargetOutcome { target, result }
    });
    join_all(calls).await
}

pub struct Reconciler {
    directory: SharedDirectory,
    provisioner: Arc<dyn Provisioner>,
    settings: SharedSettings,
    public_base: PublicBase,
    policy: FailurePolicy,
    health: HealthTracker,
    /// token du hub, poussé quand `provision_token` est vide
    server_token: String,
    failures: Shared<HashMap<ProvisionTarget, FailureState>>,
}

impl Reconciler {
    pub fn new(
        directory: SharedDirectory,
        provisioner: Arc<dyn Provisioner>,
        settings: SharedSettings,
        public_base: PublicBase,
        policy: FailurePolicy,
        health: HealthTracker,
    ) -> Self {
        Self {
            directory,
            provisioner,
            settings,
            public_base,
            policy,
            health,
            server_token: String::new(),
            failures: new_state(HashMap::new()),
        }
    }

    pub fn with_server_token(mut self, token: &str) -> Self {
        self.server_token = token.trim().to_string();
        self
    }

    /// Requête poussée aux sondes : surcharge, sinon réglages, sinon token du hub
    fn desired_request(&self, base: &str, overrides: &ProvisionOverrides) -> ProvisionRequest {
        let settings = self.settings.snapshot();
        let token = [overrides.token.as_deref(), Some(settings.provision_token.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
            .unwrap_or(self.server_token.as_str())
            .to_string();
        let interval_ms = overrides.interval_ms.filter(|ms| *ms > 0).unwrap_or_else(|| settings.interval_ms());
        ProvisionRequest::new(base, &token, interval_ms)
    }

    /// Un passage complet sur la table de découverte
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let Some(base) = self.public_base.resolve() else {
            warn!(%cycle_id, "[reconciler] no public base URL, skipping cycle");
            return CycleReport {
                cycle_id,
                server_base: None,
                outcomes: Vec::new(),
                unusable: 0,
                deferred: Vec::new(),
            };
        };

        let request = self.desired_request(&base, &ProvisionOverrides::default());

        let probes = snapshot_or_empty(self.directory.as_ref());
        let (targets, unusable) = collect_targets(&probes);
        let (due, deferred) = self.partition_due(targets);

        debug!(%cycle_id, due = due.len(), deferred = deferred.len(), "[reconciler] cycle start");
        let outcomes = provision_all(self.provisioner.as_ref(), due, &request).await;
        self.record_outcomes(&outcomes);

        for o in &outcomes {
            if let Err(e) = &o.result {
                warn!(%cycle_id, target = %o.target, "[reconciler] {e}, will retry");
            }
        }

        let report = CycleReport { cycle_id, server_base: Some(base), outcomes, unusable, deferred };
        self.health.record_cycle(report.succeeded(), report.failed());
        info!(
            %cycle_id,
            ok = report.succeeded(),
            failed = report.failed(),
            deferred = report.deferred.len(),
            unusable = report.unusable,
            "[reconciler] cycle done"
        );
        report
    }

    /// Provisioning manuel (POST /provision) : une cible explicite ou toute la table.
    /// Ignore la politique de backoff et ne compte pas comme un cycle.
    pub async fn provision_now(&self, only: Option<ProvisionTarget>, overrides: ProvisionOverrides) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let server_base = self.public_base.resolve();
        let Some(base) = server_base.clone() else {
            return CycleReport { cycle_id, server_base, outcomes: Vec::new(), unusable: 0, deferred: Vec::new() };
        };

        let request = self.desired_request(&base, &overrides);
        let (targets, unusable) = match only {
            Some(target) => (vec![target], 0),
            None => collect_targets(&snapshot_or_empty(self.directory.as_ref())),
        };

        let outcomes = provision_all(self.provisioner.as_ref(), targets, &request).await;
        info!(%cycle_id, ok = outcomes.iter().filter(|o| o.result.is_ok()).count(), total = outcomes.len(), "[reconciler] manual provisioning");
        CycleReport { cycle_id, server_base, outcomes, unusable, deferred: Vec::new() }
    }

    pub fn public_base(&self) -> Option<String> {
        self.public_base.resolve()
    }

    fn partition_due(&self, targets: Vec<ProvisionTarget>) -> (Vec<ProvisionTarget>, Vec<ProvisionTarget>) {
        let mut failures = self.failures.lock();
        // adresses disparues de la table (bail DHCP renouvelé, entrée retirée)
        failures.retain(|t, _| targets.contains(t));
        targets.into_iter().partition(|t| match failures.get_mut(t) {
            Some(state) if state.skip_remaining > 0 => {
                state.skip_remaining -= 1;
                false
            }
            _ => true,
        })
    }

    fn record_outcomes(&self, outcomes: &[TargetOutcome]) {
        let mut failures = self.failures.lock();
        for o in outcomes {
            if o.result.is_ok() {
                failures.remove(&o.target);
                continue;
            }
            let state = failures.entry(o.target.clone()).or_default();
            state.consecutive = state.consecutive.saturating_add(1);
            state.skip_remaining = match self.policy {
                FailurePolicy::RetryForever => 0,
                FailurePolicy::Backoff { max_skip_cycles } => state.consecutive.min(max_skip_cycles),
            };
        }
    }

    /// Lance la boucle en tâche de fond
    pub fn spawn(self: Arc<Self>, period: Duration) -> LoopHandle {
        let (stop_tx, mut stop_rx) = stop_channel();
        let join = tokio::spawn(async move {
            info!("[reconciler] started (period {}s)", period.as_secs());
            loop {
                if stop_requested(&stop_rx) {
                    break;
                }
                if self.settings.snapshot().auto_provision {
                    let report = self.run_cycle().await;
                    debug!(cycle_id = %report.cycle_id, "[reconciler] next cycle in {}s", period.as_secs());
                } else {
                    debug!("[reconciler] auto_provision disabled, idle");
                }
                if sleep_or_stop(&mut stop_rx, period).await {
                    break;
                }
            }
            info!("[reconciler] stopped");
        });
        LoopHandle::new(stop_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryTable, ProbeDirectory};
    use crate::models::{ProbeOrigin, ProbePatch, ProbeRecord};
    use crate::provision::AttemptFailure;
    use crate::settings::{HubSettings, SettingsStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;

    /// Provisioner scripté : échoue pour les hôtes listés, enregistre les appels
    #[derive(Default)]
    struct ScriptedProvisioner {
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<(ProvisionTarget, ProvisionRequest)>>,
    }

    impl ScriptedProvisioner {
        fn failing(hosts: &[&str]) -> Self {
            let p = Self::default();
            p.failing.lock().extend(hosts.iter().map(|h| h.to_string()));
            p
        }

        fn hosts_called(&self) -> Vec<String> {
            let mut hosts: Vec<String> = self.calls.lock().iter().map(|(t, _)| t.host.clone()).collect();
            hosts.sort();
            hosts
        }
    }

    #[async_trait]
    impl Provisioner for ScriptedProvisioner {
        async fn provision_target(
            &self,
            target: &ProvisionTarget,
            request: &ProvisionRequest,
        ) -> Result<String, ProvisionError> {
            self.calls.lock().push((target.clone(), request.clone()));
            if self.failing.lock().contains(&target.host) {
                return Err(ProvisionError::Unreachable {
                    target: target.to_string(),
                    attempts: vec![AttemptFailure { url: format!("http://{target}/provision"), reason: "timeout".into() }],
                });
            }
            Ok(format!("http://{target}/provision"))
        }
    }

    fn probe(key: &str, ip: Option<&str>, host: Option<&str>, port: Option<u16>) -> ProbeRecord {
        let mut rec = ProbeRecord::new(key, ProbeOrigin::Discovered);
        rec.ip = ip.map(|s| s.parse().unwrap());
        rec.host = host.map(String::from);
        rec.port = port;
        rec
    }

    fn fixed_base() -> PublicBase {
        PublicBase::with_detector(Some("http://10.0.0.5:8080".into()), 8080, || None)
    }

    fn reconciler(
        table: DiscoveryTable,
        provisioner: Arc<ScriptedProvisioner>,
        policy: FailurePolicy,
    ) -> Reconciler {
        let settings = HubSettings { provision_token: "tok".into(), interval_sec: 2, ..Default::default() };
        reconciler_with(table, provisioner, policy, Arc::new(SettingsStore::in_memory(settings)))
    }

    fn reconciler_with(
        table: DiscoveryTable,
        provisioner: Arc<ScriptedProvisioner>,
        policy: FailurePolicy,
        settings: SharedSettings,
    ) -> Reconciler {
        Reconciler::new(Arc::new(table), provisioner, settings, fixed_base(), policy, HealthTracker::new())
    }

    fn three_probes() -> DiscoveryTable {
        DiscoveryTable::seeded(vec![
            probe("p1", Some("10.0.0.1"), None, None),
            probe("p2", Some("10.0.0.2"), None, None),
            probe("p3", None, Some("probe3.local."), Some(8080)),
        ])
    }

    #[test]
    fn test_collect_targets() {
        let table = DiscoveryTable::seeded(vec![
            probe("a", Some("10.0.0.1"), Some("a.local"), None),
            probe("b", None, Some("b.local."), Some(81)),
            probe("c", None, None, None),
            probe("d", Some("10.0.0.1"), None, Some(80)),
        ]);
        let (targets, unusable) = collect_targets(&table.list().unwrap());
        assert_eq!(
            targets,
            vec![ProvisionTarget::new("10.0.0.1", 80), ProvisionTarget::new("b.local", 81)]
        );
        assert_eq!(unusable, 1);
    }

    #[tokio::test]
    async fn test_failing_target_does_not_block_siblings() {
        let provisioner = Arc::new(ScriptedProvisioner::failing(&["10.0.0.2"]));
        let rec = reconciler(three_probes(), provisioner.clone(), FailurePolicy::RetryForever);

        let report = rec.run_cycle().await;
        assert_eq!(provisioner.hosts_called(), vec!["10.0.0.1", "10.0.0.2", "probe3.local"]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.outcome(&ProvisionTarget::new("10.0.0.1", 80)).unwrap().result.is_ok());
        assert!(report.outcome(&ProvisionTarget::new("10.0.0.2", 80)).unwrap().result.is_err());
        assert!(report.outcome(&ProvisionTarget::new("probe3.local", 8080)).unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn test_request_reflects_current_settings_and_base() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let rec = reconciler(three_probes(), provisioner.clone(), FailurePolicy::RetryForever);

        let report = rec.run_cycle().await;
        assert_eq!(report.server_base.as_deref(), Some("http://10.0.0.5:8080"));
        let calls = provisioner.calls.lock();
        assert!(calls.iter().all(|(_, req)| req.server_url == "http://10.0.0.5:8080/ingest"
            && req.token == "tok"
            && req.interval_ms == 2000));
    }

    #[tokio::test]
    async fn test_retry_forever_retries_every_cycle() {
        let provisioner = Arc::new(ScriptedProvisioner::failing(&["10.0.0.2"]));
        let rec = reconciler(three_probes(), provisioner.clone(), FailurePolicy::RetryForever);

        for _ in 0..3 {
            let report = rec.run_cycle().await;
            assert!(report.deferred.is_empty());
        }
        let tries = provisioner.calls.lock().iter().filter(|(t, _)| t.host == "10.0.0.2").count();
        assert_eq!(tries, 3);
    }

    #[tokio::test]
    async fn test_backoff_skips_then_resumes() {
        let provisioner = Arc::new(ScriptedProvisioner::failing(&["10.0.0.2"]));
        let rec = reconciler(three_probes(), provisioner.clone(), FailurePolicy::Backoff { max_skip_cycles: 1 });
        let p2 = ProvisionTarget::new("10.0.0.2", 80);

        assert!(rec.run_cycle().await.outcome(&p2).is_some());
        let second = rec.run_cycle().await;
        assert!(second.outcome(&p2).is_none());
        assert_eq!(second.deferred, vec![p2.clone()]);

        provisioner.failing.lock().clear();
        assert!(rec.run_cycle().await.outcome(&p2).unwrap().result.is_ok());
        assert!(rec.run_cycle().await.outcome(&p2).is_some());
    }

    #[tokio::test]
    async fn test_manual_provisioning_ignores_backoff() {
        let provisioner = Arc::new(ScriptedProvisioner::failing(&["10.0.0.2"]));
        let rec = reconciler(three_probes(), provisioner.clone(), FailurePolicy::Backoff { max_skip_cycles: 5 });
        rec.run_cycle().await;

        let all = rec.provision_now(None, ProvisionOverrides::default()).await;
        assert_eq!(all.outcomes.len(), 3);

        let one = rec
            .provision_now(Some(ProvisionTarget::new("probe9.local.", 81)), ProvisionOverrides::default())
            .await;
        assert_eq!(one.outcomes.len(), 1);
        assert_eq!(one.outcomes[0].target, ProvisionTarget::new("probe9.local", 81));
        assert!(one.outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_directory_means_zero_targets() {
        struct Offline;
        impl ProbeDirectory for Offline {
            fn list(&self) -> Result<ProbesMap, crate::discovery::DiscoveryError> {
                Err(crate::discovery::DiscoveryError::Unavailable("down".into()))
            }
            fn upsert(&self, _: &str, _: ProbePatch) -> Result<ProbeRecord, crate::discovery::DiscoveryError> {
                Err(crate::discovery::DiscoveryError::Unavailable("down".into()))
            }
        }

        let provisioner = Arc::new(ScriptedProvisioner::default());
        let rec = Reconciler::new(
            Arc::new(Offline),
            provisioner.clone(),
            Arc::new(SettingsStore::in_memory(HubSettings::default())),
            fixed_base(),
            FailurePolicy::RetryForever,
            HealthTracker::new(),
        );
        let report = rec.run_cycle().await;
        assert!(report.outcomes.is_empty());
        assert!(provisioner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_table_is_a_quiet_cycle() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let rec = reconciler(DiscoveryTable::new(), provisioner.clone(), FailurePolicy::RetryForever);
        let report = rec.run_cycle().await;
        assert!(report.outcomes.is_empty());
        assert!(provisioner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_no_public_base_skips_cycle() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let rec = Reconciler::new(
            Arc::new(three_probes()),
            provisioner.clone(),
            Arc::new(SettingsStore::in_memory(HubSettings::default())),
            PublicBase::with_detector(None, 8080, || None),
            FailurePolicy::RetryForever,
            HealthTracker::new(),
        );
        let report = rec.run_cycle().await;
        assert!(report.server_base.is_none());
        assert!(provisioner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_loop_picks_up_new_probes_and_stops() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let table = DiscoveryTable::new();
        let rec = Arc::new(reconciler(table.clone(), provisioner.clone(), FailurePolicy::RetryForever));

        let handle = rec.spawn(Duration::from_millis(20));
        table
            .upsert("late", ProbePatch { ip: Some("10.0.0.42".parse().unwrap()), ..Default::default() })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !provisioner.hosts_called().contains(&"10.0.0.42".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_token_falls_back_to_server_token() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let settings: SharedSettings = Arc::new(SettingsStore::in_memory(HubSettings::default()));
        let rec = reconciler_with(three_probes(), provisioner.clone(), FailurePolicy::RetryForever, settings.clone())
            .with_server_token("secret");

        rec.run_cycle().await;
        assert!(provisioner.calls.lock().iter().all(|(_, req)| req.token == "secret" && req.interval_ms == 5000));

        settings.set("provision_token", json!("field-tok")).unwrap();
        provisioner.calls.lock().clear();
        rec.run_cycle().await;
        assert!(provisioner.calls.lock().iter().all(|(_, req)| req.token == "field-tok"));

        provisioner.calls.lock().clear();
        let overrides = ProvisionOverrides { token: Some("once".into()), interval_ms: Some(750) };
        rec.provision_now(Some(ProvisionTarget::new("10.0.0.9", 80)), overrides).await;
        let calls = provisioner.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.token, "once");
        assert_eq!(calls[0].1.interval_ms, 750);
    }

    #[tokio::test]
    async fn test_failure_state_dropped_when_address_changes() {
        let provisioner = Arc::new(ScriptedProvisioner::failing(&["10.0.0.2"]));
        let table = three_probes();
        let rec = reconciler(table.clone(), provisioner.clone(), FailurePolicy::Backoff { max_skip_cycles: 3 });
        let old = ProvisionTarget::new("10.0.0.2", 80);

        rec.run_cycle().await;
        assert!(rec.failures.lock().contains_key(&old));

        table
            .upsert("p2", ProbePatch { ip: Some("10.0.0.22".parse().unwrap()), ..Default::default() })
            .unwrap();
        let report = rec.run_cycle().await;
        assert!(report.outcome(&ProvisionTarget::new("10.0.0.22", 80)).unwrap().result.is_ok());
        assert!(rec.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_loop_idles_while_auto_provision_disabled() {
        let provisioner = Arc::new(ScriptedProvisioner::default());
        let settings: SharedSettings = Arc::new(SettingsStore::in_memory(HubSettings::default()));
        settings.set("auto_provision", json!(false)).unwrap();
        let rec = Arc::new(reconciler_with(three_probes(), provisioner.clone(), FailurePolicy::RetryForever, settings.clone()));

        let handle = rec.spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(provisioner.calls.lock().is_empty());

        settings.set("auto_provision", json!(true)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while provisioner.hosts_called().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown()).await.unwrap();
    }
}
