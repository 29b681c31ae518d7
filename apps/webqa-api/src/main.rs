use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use webqa_capture::{cancel_running_run, ensure_running_run, wrap};
use webqa_protocol::{
    EventFamily, EventRecord, Run, RunId, RunStatus, TestId, TranscriptMessage, reconstruct,
};
use webqa_store::{EventStore, FileStore, RunStore, Store};

mod agent;

use crate::agent::{AgentClient, UI_MESSAGE_STREAM_HEADER, UI_MESSAGE_STREAM_VERSION};

#[derive(Debug, Parser)]
#[command(name = "webqa-api")]
#[command(about = "Web QA console capture/replay API")]
struct Cli {
    #[arg(long, default_value = ".webqa")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8790")]
    listen: SocketAddr,
    /// Upstream browser-agent endpoint producing the UI message stream.
    #[arg(long, default_value = "http://127.0.0.1:4111/agent/stream")]
    agent_url: String,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    agent: AgentClient,
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    prompt: String,
    test_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RunListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunListResponse {
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize, Default)]
struct EventListQuery {
    family: Option<EventFamily>,
    from_sequence: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventListResponse {
    run_id: RunId,
    events: Vec<EventRecord>,
}

#[derive(Debug, Serialize)]
struct TranscriptResponse {
    run_id: RunId,
    messages: Vec<TranscriptMessage>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_gateway(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: error.to_string(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let state = AppState {
        store: Arc::new(FileStore::new(&cli.root)),
        agent: AgentClient::new(&cli.agent_url),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions/{session_key}/runs", post(start_run))
        .route("/sessions/{session_key}/runs/cancel", post(cancel_run))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/events", get(list_events))
        .route("/runs/{run_id}/transcript", get(get_transcript))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        listen = %cli.listen,
        root = %cli.root.display(),
        agent = %cli.agent_url,
        "webqa-api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "webqa-api"
    }))
}

/// Establish the session's running run, start the agent, and respond
/// with the agent's stream tapped by the logger. The client sees the
/// agent's bytes untouched; the persisted log is a side effect.
async fn start_run(
    Path(session_key): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<Response> {
    let test_id = request.test_id.map(TestId::from_string);
    let run = ensure_running_run(state.store.as_ref(), &session_key, &request.prompt, test_id)
        .await
        .map_err(ApiError::internal)?;

    let upstream = match state.agent.start_stream(&run, &request.prompt).await {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!(run_id = %run.run_id, %error, "agent stream unavailable");
            // Nothing will ever close this run; do it here.
            if let Err(finish_error) = state
                .store
                .finish_if_running(&run.run_id, RunStatus::Error, Utc::now())
                .await
            {
                warn!(run_id = %run.run_id, %finish_error, "failed to close run after agent error");
            }
            return Err(ApiError::bad_gateway(error));
        }
    };

    let logged = wrap(upstream, state.store.clone(), run.run_id.clone());

    let mut response = Response::new(Body::from_stream(logged));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        UI_MESSAGE_STREAM_HEADER,
        HeaderValue::from_static(UI_MESSAGE_STREAM_VERSION),
    );
    if let Ok(run_id) = HeaderValue::from_str(run.run_id.as_str()) {
        headers.insert("x-webqa-run-id", run_id);
    }
    Ok(response)
}

async fn cancel_run(
    Path(session_key): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Run>> {
    match cancel_running_run(state.store.as_ref(), &session_key)
        .await
        .map_err(ApiError::internal)?
    {
        Some(run) => Ok(Json(run)),
        None => Err(ApiError::not_found(format!(
            "no running run for session {session_key}"
        ))),
    }
}

async fn list_runs(
    Query(query): Query<RunListQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<RunListResponse>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let runs = state.store.list(limit).await.map_err(ApiError::internal)?;
    Ok(Json(RunListResponse { runs }))
}

async fn get_run(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Run>> {
    let run_id = RunId::from_string(run_id);
    match state.store.get(&run_id).await.map_err(ApiError::internal)? {
        Some(run) => Ok(Json(run)),
        None => Err(ApiError::not_found(format!("run not found: {run_id}"))),
    }
}

async fn list_events(
    Path(run_id): Path<String>,
    Query(query): Query<EventListQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<EventListResponse>> {
    let run_id = RunId::from_string(run_id);
    let from_sequence = query.from_sequence.unwrap_or(0);
    let limit = query.limit.unwrap_or(500).clamp(1, 5000);

    let events = state
        .store
        .read_from(&run_id, query.family, from_sequence, limit)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(EventListResponse { run_id, events }))
}

async fn get_transcript(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<TranscriptResponse>> {
    let run_id = RunId::from_string(run_id);
    let events = state
        .store
        .read_all(&run_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(TranscriptResponse {
        messages: reconstruct(events),
        run_id,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
