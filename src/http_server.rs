//! HTTP server implementation using Axum.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::hub::VIEWER_QUEUE_DEPTH;
use crate::state::AppState;

const VIEWER_HTML: &str = include_str!("../assets/viewer.html");
const SAMPLE_SPEC: &str = include_str!("../assets/sample-visualization-spec.json");
const FAVICON_URL: &str = "https://vega.github.io/favicon.ico";

/// Body of `POST /live-data`. A string spec is forwarded verbatim.
#[derive(Deserialize)]
struct LiveDataRequest {
    spec: Value,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: &'static str,
}

impl StatusResponse {
    fn success(message: &'static str) -> Json<Self> {
        Json(Self {
            status: "success",
            message,
        })
    }
}

/// Handler failure rendered as `500 {"detail": ...}`.
#[derive(Debug)]
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("{}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "detail": self.0 })),
        )
            .into_response()
    }
}

fn broadcast_failure(e: impl std::fmt::Display) -> ApiError {
    ApiError(format!("Failed to broadcast live visualization specification: {e}"))
}

/// Build the viewer web server's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(viewer_page))
        .route("/favicon.ico", get(favicon))
        .route("/sample-data", get(sample_data))
        .route("/live-data", post(live_data))
        .route("/ws", get(viewer_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn viewer_page(State(state): State<AppState>) -> Html<String> {
    Html(render_viewer(state.port))
}

fn render_viewer(port: u16) -> String {
    VIEWER_HTML.replace("{{port}}", &port.to_string())
}

async fn favicon() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, FAVICON_URL)])
}

async fn sample_data(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let spec: Value = serde_json::from_str(SAMPLE_SPEC).map_err(broadcast_failure)?;
    state.hub.broadcast(spec.to_string()).await;
    Ok(StatusResponse::success(
        "Sample visualization specification successfully sent to connected clients",
    ))
}

async fn live_data(
    State(state): State<AppState>,
    Json(req): Json<LiveDataRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let payload = spec_payload(req.spec).map_err(broadcast_failure)?;
    let reached = state.hub.broadcast(payload).await;
    info!(reached, "POST /live-data - visualization broadcast");
    Ok(StatusResponse::success(
        "Visualization specification successfully sent to connected clients",
    ))
}

/// Strings are forwarded verbatim, anything else is serialized to JSON.
fn spec_payload(spec: Value) -> serde_json::Result<String> {
    match spec {
        Value::String(s) => Ok(s),
        other => serde_json::to_string(&other),
    }
}

async fn viewer_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

/// Push-only viewer channel: forward hub payloads, ignore client frames.
async fn handle_viewer(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(VIEWER_QUEUE_DEPTH);
    let id = state.hub.connect(out_tx).await;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(payload) => {
                        if ws_tx.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped us (server shutting down).
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    state.hub.disconnect(id).await;
    debug!(?id, "Viewer socket closed");
}
