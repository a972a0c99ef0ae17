use crate::pipeline::Pipeline;
use crate::relay::Relay;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;

const DEFAULT_EVENT_COUNT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub relay: Relay,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    count: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(status))
        .route("/api/loops/:loop_id/events", get(loop_events))
        .route("/api/loops/:loop_id", delete(remove_loop))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| async move {
        relay.handle_socket(socket, addr).await;
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let loops = state.pipeline.loop_states().await;
    let viewers = state.relay.viewer_count().await;
    Json(json!({ "ok": true, "viewers": viewers, "loops": loops }))
}

async fn loop_events(
    State(state): State<AppState>,
    Path(loop_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> axum::response::Response {
    let count = query.count.unwrap_or(DEFAULT_EVENT_COUNT);
    match state.pipeline.recent_events(&loop_id, count).await {
        Some(events) => Json(events).into_response(),
        None => loop_not_found(),
    }
}

async fn remove_loop(
    State(state): State<AppState>,
    Path(loop_id): Path<String>,
) -> axum::response::Response {
    if state.pipeline.remove_loop(&loop_id).await {
        Json(json!({ "ok": true, "loopId": loop_id })).into_response()
    } else {
        loop_not_found()
    }
}

fn loop_not_found() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": "loop_not_found" })),
    )
        .into_response()
}
