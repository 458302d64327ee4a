use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advisory::{build_strategy_prompt, GeminiGenerator, StrategyInput, StrategyResponse, TextGenerator};
use crate::config::AppConfig;
use crate::error::{Result, SignalError};
use crate::index::{HttpIndex, MemoryIndex, SignalIndex, SimilarityIndex};
use crate::scorer::{assess, RiskSummary};
use crate::simulator::{StreamLoop, TickMessage};
use crate::types::SignalKind;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(e: SignalError) -> ApiError {
    let status = match &e {
        SignalError::SchemaMismatch { .. } | SignalError::MalformedRecord(_) => StatusCode::BAD_REQUEST,
        SignalError::IndexUnavailable(_) | SignalError::Advisory(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn parse_kind(raw: &str) -> std::result::Result<SignalKind, ApiError> {
    raw.parse()
        .map_err(|_| (StatusCode::NOT_FOUND, Json(json!({ "error": format!("unknown signal `{raw}`") }))))
}

/// Index connection for one signal: the hosted index when a host is
/// configured, otherwise a process-local one.
pub fn build_index(config: &AppConfig, kind: SignalKind) -> Result<SignalIndex> {
    let sig = config.signal(kind);
    let timeout = config.index.query_timeout();
    let inner: Arc<dyn SimilarityIndex> = match &sig.host {
        Some(host) => {
            let key = config.index.api_key.as_deref().ok_or_else(|| {
                SignalError::Config(format!("{kind} index host set but no INDEX_API_KEY"))
            })?;
            info!("{kind} index `{}` at {host}", sig.index_name);
            Arc::new(HttpIndex::new(host, key, timeout)?)
        }
        None => {
            warn!("no host for {kind} index `{}`; using an in-memory index", sig.index_name);
            Arc::new(MemoryIndex::new())
        }
    };
    Ok(SignalIndex::new(kind, inner)
        .with_batch_size(config.index.batch_size)
        .with_timeout(timeout))
}

pub struct SignalIndexes {
    cliff: SignalIndex,
    undercut: SignalIndex,
    overtake: SignalIndex,
}

impl SignalIndexes {
    pub fn new(cliff: SignalIndex, undercut: SignalIndex, overtake: SignalIndex) -> Self {
        Self { cliff, undercut, overtake }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            build_index(config, SignalKind::Cliff)?,
            build_index(config, SignalKind::Undercut)?,
            build_index(config, SignalKind::Overtake)?,
        ))
    }

    pub fn get(&self, kind: SignalKind) -> &SignalIndex {
        match kind {
            SignalKind::Cliff => &self.cliff,
            SignalKind::Undercut => &self.undercut,
            SignalKind::Overtake => &self.overtake,
        }
    }
}

// ---------- Server state ----------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub indexes: Arc<SignalIndexes>,
    pub advisor: Option<Arc<dyn TextGenerator>>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let indexes = SignalIndexes::from_config(&config)?;
        let advisor = GeminiGenerator::from_config(&config.advisory)?.map(|g| Arc::new(g) as Arc<dyn TextGenerator>);
        if advisor.is_none() {
            warn!("GEMINI_API_KEY not set; /api/strategy is disabled");
        }
        Ok(Self {
            config: Arc::new(config),
            indexes: Arc::new(indexes),
            advisor,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:kind", get(stream_ws))
        .route("/api/risk/:kind", post(risk))
        .route("/api/strategy", post(strategy))
        .route("/health", get(health))
        .with_state(state)
}

// ---------- Handlers ----------

async fn stream_ws(
    ws: WebSocketUpgrade,
    Path(kind): Path<String>,
    State(state): State<AppState>,
) -> std::result::Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let stream = StreamLoop::from_config(&state.config, state.indexes.get(kind).clone()).map_err(api_error)?;
    Ok(ws.on_upgrade(move |socket| serve_stream(socket, kind, stream)))
}

/// Pumps ticks to the client until either side goes away, then cancels the loop.
async fn serve_stream(socket: WebSocket, kind: SignalKind, stream: StreamLoop) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<TickMessage>(4);
    let cancel = CancellationToken::new();
    let producer = tokio::spawn(stream.run(tx, cancel.clone()));
    info!("{kind} client connected");

    loop {
        tokio::select! {
            tick = rx.recv() => {
                let Some(tick) = tick else { break };
                let text = match serde_json::to_string(&tick) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("failed to encode {kind} tick: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(other)) => debug!("ignoring {kind} client message: {other:?}"),
            },
        }
    }

    cancel.cancel();
    if let Err(e) = producer.await {
        error!("{kind} stream task failed: {e}");
    }
    info!("{kind} client disconnected");
}

#[derive(Debug, Deserialize)]
pub struct RiskQuery {
    pub vector: Vec<f32>,
    /// Identity used by the overtake reducer.
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

async fn risk(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(q): Json<RiskQuery>,
) -> std::result::Result<Json<RiskSummary>, ApiError> {
    let kind = parse_kind(&kind)?;
    let top_k = q.top_k.unwrap_or(state.config.signal(kind).top_k).max(1);
    let driver = q.driver.as_deref().unwrap_or("MY_CAR");
    let result = assess(state.indexes.get(kind), &q.vector, top_k, driver, &state.config.scoring.params())
        .await
        .map_err(api_error)?;
    Ok(Json(result.summary))
}

async fn strategy(
    State(state): State<AppState>,
    Json(input): Json<StrategyInput>,
) -> std::result::Result<Json<StrategyResponse>, ApiError> {
    let Some(advisor) = state.advisor.as_ref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no advisory model configured" })),
        ));
    };
    let prompt = build_strategy_prompt(&input);
    let strategy = advisor.generate(&prompt).await.map_err(api_error)?;
    Ok(Json(StrategyResponse { strategy }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// Binds and serves until the process is stopped.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = router(state);
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
