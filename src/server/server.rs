use super::metrics::metrics_handler;
use super::state::ServerState;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Serialize)]
struct ServerStats {
    version: String,
    uptime_secs: u64,
    schedulers: usize,
}

fn version_string() -> String {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILDGATE_GIT_DESCRIBE")
    )
}

async fn home(State(state): State<ServerState>) -> Json<ServerStats> {
    Json(ServerStats {
        version: version_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        schedulers: state.schedulers.schedulers().len(),
    })
}

async fn list_schedulers(State(state): State<ServerState>) -> Response {
    match state.schedulers.statuses().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => {
            error!("Failed to collect scheduler status: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_scheduler(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    let Some(scheduler) = state.schedulers.get(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match scheduler.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            error!("Failed to collect status for {}: {:#}", name, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/metrics", get(metrics_handler))
        .route("/schedulers", get(list_schedulers))
        .route("/schedulers/{name}", get(get_scheduler))
        .with_state(state)
}

/// Serve metrics and scheduler status until `shutdown` is cancelled.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = make_app(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind status server on port {}", port))?;
    info!("Metrics and status available at port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
