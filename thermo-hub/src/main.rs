/**
 * THERMO HUB - Point d'entrée du hub de température LAN
 *
 * RÔLE : Orchestration de tous les modules : config, table de découverte,
 * réconciliation des sondes, ingestion, store CSV, poller, HTTP.
 *
 * ARCHITECTURE : API REST (sondes + dashboard) + deux boucles de fond
 * (réconciliation, pull) partageant la table de découverte et le store.
 */

mod config;
mod discovery;
mod health;
mod http;
mod ingest;
mod liveness;
mod models;
mod network;
mod poller;
mod provision;
mod reconciler;
mod settings;
mod state;
mod store;
mod worker;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::discovery::{DiscoveryTable, SharedDirectory};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::network::PublicBase;
use crate::poller::Poller;
use crate::provision::ProvisionClient;
use crate::reconciler::Reconciler;
use crate::settings::{SettingsStore, SharedSettings};
use crate::store::TimeSeriesStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("thermo_hub=info,tower_http=warn")),
        )
        .with_target(false)
        .init();

    let cfg = load_config().await;
    let addr = cfg.listen_addr()?;

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        warn!("[hub] failed to create data dir {}: {e}", cfg.data_dir.display());
    }

    // réglages modifiables à chaud
    let settings: SharedSettings = Arc::new(SettingsStore::open(cfg.settings_path()));
    let boot = settings.snapshot();
    info!("[hub] settings loaded from {}", settings.path().display());

    // store CSV
    let store = Arc::new(TimeSeriesStore::new(cfg.csv_path()));
    match store.ensure_initialized() {
        Ok(()) => info!("[hub] readings stored in {}", store.path().display()),
        Err(e) => warn!("[hub] store not initialized ({e}), will retry on first append"),
    }

    // table de découverte, seedée depuis hub.yaml
    let table = DiscoveryTable::seeded(cfg.static_records());
    info!("[hub] {} static probe(s) loaded", table.len());
    let directory: SharedDirectory = Arc::new(table);

    let health = HealthTracker::new();
    let public_base = PublicBase::new(cfg.public_base.clone(), addr.port());
    let provisioner = Arc::new(ProvisionClient::new(Duration::from_millis(cfg.reconcile.timeout_ms)));

    let reconciler = Arc::new(
        Reconciler::new(
            directory.clone(),
            provisioner,
            settings.clone(),
            public_base,
            cfg.reconcile.failure_policy.clone(),
            health.clone(),
        )
        .with_server_token(cfg.token()),
    );

    // boucles de fond
    let mut loops = Vec::new();
    if boot.auto_provision {
        let period = Duration::from_secs(cfg.reconcile.period_sec.max(1));
        loops.push(reconciler.clone().spawn(period));
    } else {
        info!("[hub] auto_provision disabled, reconciler not started");
    }
    let poller = Arc::new(Poller::new(settings.clone(), store.clone(), health.clone()));
    loops.push(poller.spawn());

    let app_state = AppState {
        directory,
        settings,
        store,
        health,
        reconciler,
        token: cfg.token().to_string(),
        match_policy: cfg.liveness.match_policy,
        stale_after: time::Duration::seconds(cfg.liveness.stale_after_secs),
    };
    if app_state.token.is_empty() {
        warn!("[hub] no SERVER_TOKEN set, ingestion is open to the LAN");
    }

    let app = http::build_router(app_state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("[hub] listening on http://{addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("[hub] shutdown requested");
        })
        .await?;

    for handle in loops {
        handle.shutdown().await;
    }
    Ok(())
}
