// --- Local HTTP surface ---------------------------------------------------
//
// Serves the content library to the renderer and a few JSON endpoints:
//   GET  /files/{name}     library files
//   GET  /api/v1/files     library index
//   GET  /api/v1/loop      current loop as renderer entries
//   GET  /api/v1/status    session + loop summary
//   POST /api/v1/stats     renderer play start/end
//   POST /api/v1/collect   run a collection cycle now
// Bind to loopback; the renderer runs on the same machine.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::cache::{ContentCache, LocalFile};
use crate::config::FILES_PREFIX;
use crate::schedule::{RendererEntry, ScheduleEngine};
use crate::session::{SessionClient, SessionState};
use crate::stats::{StatKey, StatType, StatsStore};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub cache: ContentCache,
    pub engine: Arc<ScheduleEngine>,
    pub session: Arc<SessionClient>,
    pub stats: StatsStore,
}

pub fn build_router(state: AppState) -> Router {
    let library = ServeDir::new(state.cache.library_dir());
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/loop", get(layout_loop))
        .route("/api/v1/files", get(files))
        .route("/api/v1/stats", post(record_stat))
        .route("/api/v1/collect", post(collect_now))
        .nest_service(FILES_PREFIX, library)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: String,
    session: SessionState,
    schedule_status: String,
    current_layout_id: Option<i64>,
    hostname: Option<String>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.clone(),
        session: state.session.state(),
        schedule_status: state.engine.loop_status(),
        current_layout_id: state.engine.current_layout(),
        hostname: sysinfo::System::host_name(),
    })
}

async fn layout_loop(State(state): State<AppState>) -> Json<Vec<RendererEntry>> {
    Json(state.engine.layout_loop(&state.cache).await)
}

async fn files(State(state): State<AppState>) -> Result<Json<Vec<LocalFile>>, StatusCode> {
    state.cache.downloaded_files().await.map(Json).map_err(|e| {
        warn!("failed to list library files: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatAction {
    Start,
    End,
}

#[derive(Debug, Deserialize)]
pub struct StatRequest {
    pub action: StatAction,
    pub key: StatKey,
    #[serde(default)]
    pub tag: Option<String>,
}

async fn record_stat(
    State(state): State<AppState>,
    Json(req): Json<StatRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match req.action {
        StatAction::Start => {
            if req.key.kind == StatType::Layout {
                state.engine.set_current_layout(Some(req.key.layout_id));
                state.engine.increment_play_count(req.key.schedule_id);
            }
            let id = state.stats.open_stat(req.key, req.tag).await.map_err(|e| {
                warn!("failed to open stat: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            Ok(Json(json!({ "ok": true, "id": id })))
        }
        StatAction::End => {
            let closed = state.stats.close_stat(req.key).await.map_err(|e| {
                warn!("failed to close stat: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            match closed {
                Some(stat) => Ok(Json(json!({ "ok": true, "id": stat.id, "duration": stat.duration }))),
                None => {
                    debug!("stat end without a matching start");
                    Err(StatusCode::NOT_FOUND)
                }
            }
        }
    }
}

async fn collect_now(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let session = Arc::clone(&state.session);
    match session.collect_now().await {
        Some(report) => Ok(Json(json!({
            "ok": true,
            "registered": report.registered,
            "unauthorized": report.unauthorized,
            "requiredFilesFetched": report.required_files_fetched,
            "scheduleFetched": report.schedule_fetched,
        }))),
        None => Err(StatusCode::CONFLICT),
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
