//! HTTP + WebSocket Transport
//!
//! Thin axum layer over the `LifecycleController`. Mirrors the teacher's
//! `main.rs` request/response idiom (`Result<Json<T>, StatusCode>`,
//! `ws.on_upgrade(handle_socket)`, a broadcast-backed streaming loop with
//! ping/pong) rather than inventing a new transport style.

use crate::error::EngineError;
use crate::lifecycle::{CreateSessionParams, LifecycleController, SessionSnapshot};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub type AppState = Arc<LifecycleController>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/speed", post(set_speed))
        .route("/sessions/:id/start", post(start_session))
        .route("/sessions/:id/pause", post(pause_session))
        .route("/sessions/:id/resume", post(resume_session))
        .route("/sessions/:id/reset", post(reset_session))
        .route("/sessions/:id/throughput-mode", post(set_throughput_mode))
        .route("/sessions/:id/liquidation-cascade", post(trigger_liquidation_cascade))
        .route("/ws/:id", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition(_) | EngineError::UnknownThroughputMode(_) | EngineError::InvalidSpeed(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::OperationInProgress => StatusCode::CONFLICT,
            EngineError::SingleSessionLock(_) => StatusCode::CONFLICT,
            EngineError::WrongMode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionRequest {
    custom_price: Option<f64>,
    duration_minutes: Option<u32>,
    speed: Option<u32>,
    volatility_multiplier: Option<f64>,
    initial_liquidity: Option<f64>,
}

impl From<CreateSessionRequest> for CreateSessionParams {
    fn from(req: CreateSessionRequest) -> Self {
        Self {
            custom_price: req.custom_price,
            duration_minutes: req.duration_minutes,
            speed: req.speed,
            volatility_multiplier: req.volatility_multiplier,
            initial_liquidity: req.initial_liquidity,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    id: Uuid,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, EngineError> {
    let id = state.create_session(req.into()).await?;
    Ok(Json(CreateSessionResponse { id }))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<SessionSnapshot>, EngineError> {
    Ok(Json(state.get_session(id).await?))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.list_sessions().await)
}

#[derive(Debug, Deserialize)]
struct SetSpeedRequest {
    speed: u32,
}

async fn set_speed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetSpeedRequest>,
) -> Result<Json<u32>, EngineError> {
    Ok(Json(state.set_speed(id, req.speed).await?))
}

async fn start_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.start_session(id).await?;
    Ok(StatusCode::OK)
}

async fn pause_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.pause_session(id).await?;
    Ok(StatusCode::OK)
}

async fn resume_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.resume_session(id).await?;
    Ok(StatusCode::OK)
}

async fn reset_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.reset_session(id).await?;
    Ok(StatusCode::OK)
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, EngineError> {
    state.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ThroughputModeRequest {
    mode: String,
}

#[derive(Debug, Serialize)]
struct ThroughputModeResponse {
    previous: String,
    actual_tps: f64,
    configured_tps: f64,
}

async fn set_throughput_mode(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ThroughputModeRequest>,
) -> Result<Json<ThroughputModeResponse>, EngineError> {
    let (previous, snapshot) = state.set_throughput_mode(id, &req.mode).await?;
    Ok(Json(ThroughputModeResponse {
        previous: format!("{previous:?}"),
        actual_tps: snapshot.actual_tps,
        configured_tps: snapshot.configured_tps,
    }))
}

#[derive(Debug, Serialize)]
struct LiquidationCascadeResponse {
    generated: usize,
    estimated_impact: f64,
    cascade_size: usize,
}

async fn trigger_liquidation_cascade(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LiquidationCascadeResponse>, EngineError> {
    let (generated, estimated_impact, cascade_size) = state.trigger_liquidation_cascade(id).await?;
    Ok(Json(LiquidationCascadeResponse {
        generated,
        estimated_impact,
        cascade_size,
    }))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, id: Uuid) {
    let mut rx = match state.subscribe(id) {
        Ok(rx) => rx,
        Err(e) => {
            let msg = serde_json::to_string(&ErrorBody { error: e.to_string() }).unwrap_or_default();
            let _ = socket.send(Message::Text(msg)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Ok(event) = event else { break };
                let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                    tracing::warn!(session = %id, error = %e, "failed to serialize stream event");
                    "{}".to_string()
                });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
