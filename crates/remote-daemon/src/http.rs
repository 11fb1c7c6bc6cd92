//! HTTP/WebSocket surface consumed by remote clients.
//!
//! Thin routing around the supervisor and the transcode orchestrator:
//! instance CRUD, the high-level command vocabulary, playlist/segment
//! retrieval, and an event WebSocket that relays broadcaster events after
//! an initial status snapshot.
//!
//! The single-instance policy lives here, not in the supervisor: when a
//! Running instance exists, creation requests are redirected to load the
//! new file into it instead of spawning a second player.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use remote_proto::protocol::{RemoteCommand, StreamEvent};

use crate::error::DaemonError;
use crate::events::EventHub;
use crate::hls::HlsService;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub hls: Arc<HlsService>,
    pub hub: Arc<EventHub>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: AppState,
) -> tokio::task::JoinHandle<()> {
    let app = router(state);

    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        info!("HTTP API listening on http://{}", addr);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind HTTP API on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("HTTP API error: {}", e);
        }
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/instances", get(list_instances).post(create_instance))
        .route(
            "/api/instances/{id}",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/instances/{id}/command", post(post_command))
        .route("/api/instances/{id}/tracks", get(get_tracks).post(set_track))
        .route(
            "/api/instances/{id}/stream",
            post(start_stream).delete(stop_stream),
        )
        .route("/api/instances/{id}/stream/status", get(stream_status))
        .route("/api/instances/{id}/hls/playlist.m3u8", get(get_playlist))
        .route("/api/instances/{id}/hls/{segment}", get(get_segment))
        .route("/api/instances/{id}/events", get(events_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── error mapping ─────────────────────────────────────────────────────────────

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::InvalidState { .. } | DaemonError::StreamAlreadyActive(_) => {
                StatusCode::CONFLICT
            }
            DaemonError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DaemonError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

// ── instance CRUD ─────────────────────────────────────────────────────────────

async fn get_status() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_instances(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.supervisor.list_instances().await))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceBody {
    media_file: Option<String>,
    #[serde(default)]
    stream_audio: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceResponse {
    instance_id: String,
    message: String,
}

async fn create_instance(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<CreateInstanceResponse>, DaemonError> {
    // An empty body is a plain "give me an instance" request.
    let body: CreateInstanceBody = if body.is_empty() {
        CreateInstanceBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| DaemonError::Validation(format!("invalid request body: {}", e)))?
    };

    if let Some(file) = &body.media_file {
        if !tokio::fs::try_exists(file).await.unwrap_or(false) {
            return Err(DaemonError::Validation(format!(
                "media file not found: {}",
                file
            )));
        }
    }

    // Steady-state policy: one player.  Reuse a running instance when one
    // exists; loading fails over to a fresh spawn.
    if let Some(running_id) = state.supervisor.running_instance().await {
        match &body.media_file {
            Some(file) => match state.supervisor.load_file(&running_id, file).await {
                Ok(_) => {
                    return Ok(Json(CreateInstanceResponse {
                        instance_id: running_id,
                        message: "Reused existing mpv instance".into(),
                    }))
                }
                Err(e) => {
                    warn!("failed to reuse instance {}: {}, spawning new", running_id, e)
                }
            },
            None => {
                return Ok(Json(CreateInstanceResponse {
                    instance_id: running_id,
                    message: "Reused existing mpv instance".into(),
                }))
            }
        }
    }

    let id = state
        .supervisor
        .create_instance(body.media_file.as_deref(), body.stream_audio)
        .await?;

    if body.stream_audio {
        if let Some(file) = &body.media_file {
            if let Err(e) = state.hls.start_stream(&id, file).await {
                warn!("instance {} created but stream start failed: {}", id, e);
            }
        }
    }

    Ok(Json(CreateInstanceResponse {
        instance_id: id,
        message: "mpv instance created successfully".into(),
    }))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DaemonError> {
    match state.supervisor.get_instance(&id).await {
        Some(info) => Ok(Json(json!(info))),
        None => Err(DaemonError::InstanceNotFound(id)),
    }
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DaemonError> {
    // A live transcode session is bound to the instance; tear it down first.
    state.hls.stop_stream(&id).await;
    state.supervisor.stop_instance(&id).await?;
    Ok(Json(json!({ "message": "Instance stopped" })))
}

// ── commands and tracks ───────────────────────────────────────────────────────

async fn post_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(cmd): Json<RemoteCommand>,
) -> Result<Json<Value>, DaemonError> {
    let response = state.supervisor.execute_remote(&id, &cmd).await?;
    Ok(Json(json!(response)))
}

async fn get_tracks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, DaemonError> {
    let tracks = state.supervisor.get_tracks(&id).await?;
    Ok(Json(json!(tracks)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetTrackBody {
    #[serde(rename = "type")]
    kind: String,
    track_id: Value,
}

async fn set_track(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetTrackBody>,
) -> Result<Json<Value>, DaemonError> {
    state
        .supervisor
        .set_track(&id, &body.kind, &body.track_id)
        .await?;
    Ok(Json(json!({ "message": "Track set successfully" })))
}

// ── streaming ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamBody {
    media_file: String,
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StartStreamBody>,
) -> Result<Json<Value>, DaemonError> {
    // The instance must exist and be commandable before encoding starts.
    state
        .supervisor
        .state_of(&id)
        .await
        .ok_or_else(|| DaemonError::InstanceNotFound(id.clone()))?;
    state.hls.start_stream(&id, &body.media_file).await?;
    Ok(Json(json!({ "message": "Stream started" })))
}

async fn stop_stream(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.hls.stop_stream(&id).await;
    Json(json!({ "message": "Stream stopped" }))
}

async fn stream_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let status = state.hls.stream_status(&id).await;
    Json(json!({
        "status": status,
        "segments": state.hls.segment_count(&id).await,
    }))
}

async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, DaemonError> {
    let Some(path) = state.hls.playlist_path(&id).await else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let content = tokio::fs::read(&path).await?;
    Ok(file_response(content, "application/vnd.apple.mpegurl"))
}

async fn get_segment(
    State(state): State<AppState>,
    Path((id, segment)): Path<(String, String)>,
) -> Result<Response, DaemonError> {
    let Some(number) = crate::hls::parse_segment_number(&segment) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let Some(path) = state.hls.segment_path(&id, number).await else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let content = tokio::fs::read(&path).await?;
    Ok(file_response(content, "audio/aac"))
}

fn file_response(content: Vec<u8>, content_type: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(content))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ── event subscription ────────────────────────────────────────────────────────

async fn events_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state, id))
}

/// Pushes an initial status snapshot, then relays broadcaster events for
/// the instance until either side goes away.
async fn handle_events_socket(mut socket: WebSocket, state: AppState, id: String) {
    let (mut rx, snapshot) = attach_subscriber(&state, &id).await;
    if socket
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }
    debug!(instance = %id, "event subscriber connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(instance = %id, "event subscriber missed {} events", n);
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // clients have nothing to say here
                Some(Err(_)) => break,
            },
        }
    }
    debug!(instance = %id, "event subscriber disconnected");

    // push a final close so well-behaved clients stop cleanly
    let _ = socket.send(Message::Close(None)).await;
}

/// Subscribe before reading the status snapshot: an event published while
/// the snapshot is being assembled lands in the receiver's buffer instead
/// of falling into a gap between snapshot and subscription.
async fn attach_subscriber(
    state: &AppState,
    id: &str,
) -> (tokio::sync::broadcast::Receiver<StreamEvent>, Value) {
    let rx = state.hub.subscribe(id).await;
    let snapshot = json!({
        "type": "status",
        "status": state.hls.stream_status(id).await,
        "segments": state.hls.segment_count(id).await,
    });
    (rx, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_proto::config::{HlsConfig, MpvConfig};

    fn test_state() -> AppState {
        let hub = Arc::new(EventHub::new());
        AppState {
            supervisor: Arc::new(Supervisor::new(MpvConfig::default())),
            hls: Arc::new(HlsService::new(HlsConfig::default(), Arc::clone(&hub))),
            hub,
        }
    }

    #[tokio::test]
    async fn subscription_is_live_before_the_snapshot_is_taken() {
        let state = test_state();
        let (mut rx, snapshot) = attach_subscriber(&state, "i").await;
        assert_eq!(snapshot["type"], "status");
        assert_eq!(snapshot["status"], "not_found");
        assert_eq!(snapshot["segments"], 0);

        // An event fired concurrently with the snapshot read is buffered
        // on the already-attached receiver rather than lost.
        state.hub.publish("i", StreamEvent::Ready).await;
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Ready));
    }
}
