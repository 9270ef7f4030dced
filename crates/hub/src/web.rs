use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::history::{HistoryFilter, HistoryReader};
use crate::scheduler::{Command, CommandError, CommandTx};
use crate::state::SharedState;

/// Upper bound on `/api/history?limit=`.
const MAX_HISTORY_LIMIT: i64 = 500;

/// Everything the handlers can see: projections and the command channel.
#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub history: HistoryReader,
    pub commands: CommandTx,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/zones/{id}/start", post(api_zone_start))
        .route("/api/zones/{id}/stop", post(api_zone_stop))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    zone: Option<u8>,
    limit: Option<i64>,
    since: Option<i64>,
}

async fn api_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let filter = HistoryFilter {
        zone_id: params.zone,
        since: params.since,
        limit: Some(params.limit.unwrap_or(50).clamp(1, MAX_HISTORY_LIMIT)),
    };
    match state.history.query(&filter).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => {
            error!(error = %e, "history query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "history query failed")
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartBody {
    duration_sec: i64,
}

async fn api_zone_start(
    State(state): State<AppState>,
    Path(zone_id): Path<u8>,
    Json(body): Json<StartBody>,
) -> Response {
    let (reply, rx) = oneshot::channel();
    let cmd = Command::StartZone {
        zone_id,
        duration_sec: body.duration_sec,
        reply: Some(reply),
    };
    dispatch(&state, cmd, rx).await
}

async fn api_zone_stop(State(state): State<AppState>, Path(zone_id): Path<u8>) -> Response {
    let (reply, rx) = oneshot::channel();
    let cmd = Command::StopZone {
        zone_id,
        reply: Some(reply),
    };
    dispatch(&state, cmd, rx).await
}

/// Hand a command to the scheduler and translate its answer.
async fn dispatch(
    state: &AppState,
    cmd: Command,
    rx: oneshot::Receiver<Result<(), CommandError>>,
) -> Response {
    if state.commands.send(cmd).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "scheduler is not running");
    }
    match rx.await {
        Ok(Ok(())) => (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response(),
        Ok(Err(e)) => error_response(command_status(&e), &e.to_string()),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "scheduler is not running"),
    }
}

fn command_status(e: &CommandError) -> StatusCode {
    match e {
        CommandError::UnknownZone(_) => StatusCode::NOT_FOUND,
        CommandError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
        CommandError::ZoneDisabled(_) | CommandError::ZoneBusy(_) | CommandError::NotRunning(_) => {
            StatusCode::CONFLICT
        }
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
