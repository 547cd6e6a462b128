/**
 * API REST THERMO HUB - Serveur HTTP du hub de température
 *
 * RÔLE :
 * Point d'entrée des sondes (ingestion) et du dashboard (listing, lectures,
 * réglages, provisioning manuel).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, état unique `AppState` partagé par les handlers
 * - Routes : /health, /system/health, /probes, /readings, /config, /config/{key},
 *   /provision, /ingest, /ingest_csv
 * - I/O fichier (CSV, settings.json) déportées sur `spawn_blocking`
 *
 * SÉCURITÉ :
 * - Si un token serveur est configuré : routes mutantes + /ingest protégées
 * - Token accepté en header X-Token, en query `token` ou dans le corps JSON
 * - Sans token configuré, tout est ouvert (LAN de confiance)
 */

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::discovery::{listing, snapshot_or_empty, to_view, SharedDirectory};
use crate::health::{HealthTracker, HubHealth};
use crate::ingest::{normalize, now_timestamp, parse_csv_lines};
use crate::liveness::{self, LivenessOutcome, MatchPolicy};
use crate::models::{ProbeView, Reading};
use crate::provision::ProvisionTarget;
use crate::reconciler::{ProvisionOverrides, Reconciler};
use crate::settings::{HubSettings, SettingsError, SharedSettings};
use crate::store::{AppendOutcome, TimeSeriesStore};

const MAX_AUTH_BODY: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub directory: SharedDirectory,
    pub settings: SharedSettings,
    pub store: Arc<TimeSeriesStore>,
    pub health: HealthTracker,
    pub reconciler: Arc<Reconciler>,
    /// vide = pas d'authentification
    pub token: String,
    pub match_policy: MatchPolicy,
    pub stale_after: time::Duration,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/system/health", get(get_system_health))
        .route("/probes", get(get_probes))
        .route("/probes/{key}", get(get_probe))
        .route("/readings", get(get_readings))
        .route("/config", get(get_config).post(post_config))
        .route("/config/{key}", get(get_config_key).post(post_config_key))
        .route("/provision", post(post_provision))
        .route("/ingest", get(ingest_query).post(ingest_json))
        .route("/ingest_csv", post(ingest_csv))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_token))
        .with_state(app_state)
}

fn failure(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(json!({ "ok": false, "error": msg.into() }))).into_response()
}

fn needs_token(method: &Method, path: &str) -> bool {
    method != Method::GET || path.starts_with("/ingest")
}

async fn require_token(State(app): State<AppState>, req: Request, next: Next) -> Response {
    if app.token.is_empty() || !needs_token(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    let from_header = req
        .headers()
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.get("token").cloned());
    if from_header.or(from_query).is_some_and(|t| t == app.token) {
        return next.run(req).await;
    }

    // dernier recours : champ `token` du corps JSON, corps remis en place ensuite
    let (parts, body) = req.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, MAX_AUTH_BODY).await else {
        return failure(StatusCode::PAYLOAD_TOO_LARGE, "body too large");
    };
    let from_body = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("token").and_then(Value::as_str).map(str::to_string));
    if from_body.is_some_and(|t| t == app.token) {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    warn!(path = %parts.uri.path(), "[hub] unauthorized request");
    failure(StatusCode::UNAUTHORIZED, "unauthorized")
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<Value> {
    let probes = snapshot_or_empty(app.directory.as_ref()).len();
    Json(json!({
        "ok": true,
        "probes": probes,
        "base": app.reconciler.public_base(),
        "time": now_timestamp(),
    }))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<HubHealth> {
    Json(app.health.get_health(app.directory.as_ref()))
}

// GET /probes
async fn get_probes(State(app): State<AppState>) -> Json<Vec<ProbeView>> {
    Json(listing(app.directory.as_ref(), app.stale_after))
}

// GET /probes/{key}
async fn get_probe(State(app): State<AppState>, Path(key): Path<String>) -> Result<Json<ProbeView>, StatusCode> {
    let map = snapshot_or_empty(app.directory.as_ref());
    let Some(rec) = map.get(&key) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(to_view(rec, time::OffsetDateTime::now_utc(), app.stale_after)))
}

#[derive(Debug, Deserialize)]
struct ReadingsParams {
    limit: Option<usize>,
    probe_id: Option<String>,
}

// GET /readings?limit=&probe_id=
async fn get_readings(
    State(app): State<AppState>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<Reading>>, Response> {
    let store = app.store.clone();
    let limit = params.limit.unwrap_or(100);
    let filter = params.probe_id.filter(|p| !p.is_empty());
    let rows = tokio::task::spawn_blocking(move || store.read_recent(limit, filter.as_deref()))
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            error!("[store] read failed: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(rows))
}

// GET /config
async fn get_config(State(app): State<AppState>) -> Json<Map<String, Value>> {
    Json(app.settings.snapshot().to_map())
}

// POST /config (merge + persistance)
async fn post_config(State(app): State<AppState>, body: Bytes) -> Response {
    let Ok(Value::Object(mut patch)) = serde_json::from_slice::<Value>(&body) else {
        return failure(StatusCode::BAD_REQUEST, "expected a JSON object");
    };
    patch.remove("token");

    let settings = app.settings.clone();
    settings_response(tokio::task::spawn_blocking(move || settings.merge(patch)).await)
}

// GET /config/{key}
async fn get_config_key(State(app): State<AppState>, Path(key): Path<String>) -> Result<Json<Value>, StatusCode> {
    app.settings.get(&key).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// POST /config/{key} (corps = valeur JSON brute)
async fn post_config_key(State(app): State<AppState>, Path(key): Path<String>, body: Bytes) -> Response {
    if key == "token" {
        return failure(StatusCode::BAD_REQUEST, "token is not a setting");
    }
    let Ok(value) = serde_json::from_slice::<Value>(&body) else {
        return failure(StatusCode::BAD_REQUEST, "expected a JSON value");
    };

    let settings = app.settings.clone();
    settings_response(tokio::task::spawn_blocking(move || settings.set(&key, value)).await)
}

fn settings_response(res: Result<Result<HubSettings, SettingsError>, tokio::task::JoinError>) -> Response {
    match res {
        Ok(Ok(cfg)) => {
            info!("[hub] settings updated");
            Json(json!({ "ok": true, "config": cfg.to_map() })).into_response()
        }
        Ok(Err(e @ SettingsError::Invalid(_))) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Ok(Err(e @ SettingsError::Persist { .. })) => {
            error!("[hub] {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProvisionBody {
    host: Option<String>,
    port: Option<u16>,
    /// token à pousser, sinon celui des réglages ou du hub
    token: Option<String>,
    #[serde(alias = "interval")]
    interval_ms: Option<u64>,
}

// POST /provision (provisioning manuel : une sonde ou toutes)
async fn post_provision(State(app): State<AppState>, body: Bytes) -> Response {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        ProvisionBody::default()
    } else {
        match serde_json::from_slice::<ProvisionBody>(&body) {
            Ok(b) => b,
            Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };
    let only = body
        .host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| ProvisionTarget::new(h, body.port.filter(|p| *p != 0).unwrap_or(80)));
    let overrides = ProvisionOverrides { token: body.token, interval_ms: body.interval_ms };

    let report = app.reconciler.provision_now(only, overrides).await;
    let Some(base) = report.server_base.clone() else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "public base URL unknown");
    };

    let (ok, failed): (Vec<_>, Vec<_>) = report.outcomes.iter().partition(|o| o.result.is_ok());
    Json(json!({
        "ok": !ok.is_empty(),
        "provided_to": ok.iter().map(|o| o.target.to_string()).collect::<Vec<_>>(),
        "failed": failed.iter().map(|o| o.target.to_string()).collect::<Vec<_>>(),
        "total": report.outcomes.len(),
        "success_count": ok.len(),
        "server_base": base,
        "cycle_id": report.cycle_id.to_string(),
    }))
    .into_response()
}

fn probe_id_from(headers: &HeaderMap, payload: &Map<String, Value>) -> String {
    headers
        .get("x-probe-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| match payload.get("probe_id") {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Chemin commun POST/GET /ingest : normalisation, écriture, liveness
async fn accept_reading(app: AppState, payload: Map<String, Value>, probe_id: String, origin: IpAddr) -> Response {
    let reading = match normalize(&payload) {
        Ok(r) => r,
        Err(e) => {
            app.health.reading_rejected();
            return failure(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let store = app.store.clone();
    let id = (!probe_id.is_empty()).then(|| probe_id.clone());
    let stored = tokio::task::spawn_blocking(move || {
        store.append(&reading.timestamp, reading.celsius, reading.fahrenheit, id.as_deref())
    })
    .await;
    match stored {
        Ok(Ok(AppendOutcome::Full)) => app.health.reading_accepted(false),
        Ok(Ok(AppendOutcome::Degraded(e))) => {
            warn!(probe_id = %probe_id, "[ingest] stored degraded row: {e}");
            app.health.reading_accepted(true);
        }
        Ok(Err(e)) => {
            error!(probe_id = %probe_id, "[ingest] reading lost: {e}");
            app.health.reading_rejected();
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable");
        }
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let host_hint = payload.get("host").and_then(Value::as_str);
    match liveness::touch(app.directory.as_ref(), &probe_id, Some(origin), host_hint, app.match_policy) {
        Ok(LivenessOutcome::Skipped) | Ok(LivenessOutcome::Touched(_)) => {}
        Ok(LivenessOutcome::Created(key)) => info!(key = %key, "[ingest] new probe seen"),
        Err(e) => warn!(probe_id = %probe_id, "[ingest] liveness not updated: {e}"),
    }

    Json(json!({ "ok": true })).into_response()
}

// POST /ingest (JSON)
async fn ingest_json(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let probe_id = probe_id_from(&headers, &payload);
    accept_reading(app, payload, probe_id, peer.ip()).await
}

// GET /ingest?c=21.5&probe_id=...
async fn ingest_query(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let payload: Map<String, Value> = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    let probe_id = probe_id_from(&headers, &payload);
    accept_reading(app, payload, probe_id, peer.ip()).await
}

// POST /ingest_csv (texte, une ligne `celsius[,probe_id]` par lecture)
async fn ingest_csv(State(app): State<AppState>, body: String) -> Response {
    let rows = parse_csv_lines(&body);
    let store = app.store.clone();
    let written = tokio::task::spawn_blocking(move || {
        rows.iter()
            .filter(|(c, id)| match store.append_minimal(*c, id) {
                Ok(()) => true,
                Err(e) => {
                    error!("[ingest] csv row lost: {e}");
                    false
                }
            })
            .count()
    })
    .await;

    match written {
        Ok(n) => {
            for _ in 0..n {
                app.health.reading_accepted(false);
            }
            Json(json!({ "ok": true, "rows": n })).into_response()
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
