use axum::{
    Json, Router,
    extract::Path,
    routing::{get, post},
};
use mux_bus::protocol::ContainerFlavor;
use serde::{Deserialize, Serialize};

use crate::{handler::ApiJsonResult, manager, media::types::SessionConfig};

pub fn session_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/list", get(list_sessions))
        .route("/add", post(add_session))
        .route("/end/{id}", get(end_session))
        .route("/abort/{id}", get(abort_session))
        .route("/remove/{id}", get(remove_session))
        .route("/status/{id}", get(session_status))
}

#[derive(Serialize, Deserialize)]
struct SessionRequest {
    id: String,
    url: String,
    /// "hls" (default) or "dash".
    format: Option<String>,
    rotate: Option<bool>,
    frame_rate: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct SessionStatus {
    id: String,
    state: String,
    url: String,
}

async fn index() -> &'static str {
    "session route!"
}

async fn list_sessions() -> Json<Vec<String>> {
    let sessions = manager::get_session_manager().read().await;
    Json(sessions.keys().cloned().collect())
}

async fn add_session(Json(req): Json<SessionRequest>) -> ApiJsonResult<String> {
    let flavor = match req.format.as_deref() {
        Some("dash") => ContainerFlavor::Dash,
        Some("hls") | None => ContainerFlavor::Hls,
        Some(other) => {
            return Err(anyhow::anyhow!("unknown output format: {}", other).into());
        }
    };
    let mut config = SessionConfig::new(req.url, flavor);
    if let Some(rotate) = req.rotate {
        config.rotate = rotate;
    }
    config.frame_rate = req.frame_rate.unwrap_or(crate::config::config().frame_rate());
    manager::add_session(&req.id, config).await?;
    Ok(Json(req.id))
}

async fn end_session(Path(id): Path<String>) -> ApiJsonResult<String> {
    manager::end_session(&id, false).await?;
    Ok(Json(id))
}

async fn abort_session(Path(id): Path<String>) -> ApiJsonResult<String> {
    manager::end_session(&id, true).await?;
    Ok(Json(id))
}

async fn remove_session(Path(id): Path<String>) -> ApiJsonResult<String> {
    manager::remove_session(&id).await?;
    Ok(Json(id))
}

async fn session_status(Path(id): Path<String>) -> ApiJsonResult<SessionStatus> {
    match manager::get_session(&id).await {
        Some(pipeline) => Ok(Json(SessionStatus {
            id,
            state: pipeline.state().description().to_string(),
            url: pipeline.config().destination_url.clone(),
        })),
        None => Err(anyhow::anyhow!("session not found").into()),
    }
}
