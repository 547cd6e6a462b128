/*!
Sonde simulée pour développement sans matériel

Petit serveur axum sur 127.0.0.1:0 qui se comporte comme une sonde :
- `POST /provision` enregistre la configuration reçue
- `GET /` sert la dernière lecture au format CSV (mode pull)
- `fail_with(status)` force une réponse d'erreur sur les deux routes
*/

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct StubState {
    provision_requests: Vec<Value>,
    forced_status: Option<u16>,
    reading: (f64, f64),
    reading_hits: usize,
}

type Shared = Arc<Mutex<StubState>>;

pub struct ProbeStub {
    addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl ProbeStub {
    pub async fn spawn() -> Result<Self> {
        let state: Shared = Arc::new(Mutex::new(StubState {
            provision_requests: Vec::new(),
            forced_status: None,
            reading: (21.0, 69.8),
            reading_hits: 0,
        }));

        let app = Router::new()
            .route("/", get(serve_reading))
            .route("/provision", post(accept_provision))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!("[probe-stub] server stopped: {e}");
            }
        });

        tracing::debug!("[probe-stub] listening on {addr}");
        Ok(Self { addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Corps JSON reçus sur /provision, dans l'ordre
    pub fn provision_requests(&self) -> Vec<Value> {
        self.state.lock().provision_requests.clone()
    }

    pub fn last_provision(&self) -> Option<Value> {
        self.state.lock().provision_requests.last().cloned()
    }

    /// Toutes les routes répondent `status` jusqu'à `recover()`
    pub fn fail_with(&self, status: u16) {
        self.state.lock().forced_status = Some(status);
    }

    pub fn recover(&self) {
        self.state.lock().forced_status = None;
    }

    pub fn set_reading(&self, celsius: f64, fahrenheit: f64) {
        self.state.lock().reading = (celsius, fahrenheit);
    }

    /// Nombre de lectures servies avec succès sur GET /
    pub fn reading_hits(&self) -> usize {
        self.state.lock().reading_hits
    }
}

impl Drop for ProbeStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn forced(state: &Shared) -> Option<Response> {
    let status = state.lock().forced_status?;
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Some((code, Json(json!({"ok": false}))).into_response())
}

async fn accept_provision(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    if let Some(resp) = forced(&state) {
        return resp;
    }
    state.lock().provision_requests.push(body);
    Json(json!({"ok": true})).into_response()
}

async fn serve_reading(State(state): State<Shared>) -> Response {
    if let Some(resp) = forced(&state) {
        return resp;
    }
    let mut st = state.lock();
    st.reading_hits += 1;
    let (c, f) = st.reading;
    format!("timestamp,temperature_c,temperature_f\n2024-01-01T00:00:00,{c},{f}\n").into_response()
}
