//! Health check endpoints
//!
//! - /health, /healthz - Liveness check with a summary of background tasks
//! - /version - Build information for deployment verification

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::server::AppState;

/// Liveness response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always true while the process serves requests
    pub healthy: bool,
    /// 'online' when every background task runs, 'degraded' otherwise
    pub status: &'static str,
    pub version: &'static str,
    /// Seconds since the server state was built
    pub uptime: u64,
    pub timestamp: String,
    /// 'development' or 'production'
    pub mode: &'static str,
    /// 'mongodb' or 'memory'
    pub storage: &'static str,
    pub push_clients: usize,
    pub background: BackgroundHealth,
    /// KPIs whose stats are waiting for a repair pass
    pub pending_repairs: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundHealth {
    pub heartbeat: bool,
    pub stats_sweeper: bool,
    pub reminders: bool,
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    let background = BackgroundHealth {
        heartbeat: state.push.is_running().await,
        stats_sweeper: state.stats.is_running().await,
        reminders: state.reminders.is_running().await,
    };
    let all_running = background.heartbeat && background.stats_sweeper && background.reminders;

    HealthResponse {
        healthy: true,
        status: if all_running { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        storage: state.storage_kind,
        push_clients: state.push.client_count(),
        background,
        pending_repairs: state.stats.pending_repairs(),
    }
}

/// Handle liveness check (/health, /healthz)
///
/// Returns 200 whenever the process is up; check `status` for background
/// task health.
pub async fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = build_health_response(&state).await;

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"healthy":true,"error":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    /// Cargo package version
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Git commit hash (full)
    pub commit_full: &'static str,
    pub branch: &'static str,
    /// Cargo profile, 'debug' or 'release'
    pub profile: &'static str,
    /// Build timestamp
    pub build_time: &'static str,
    /// Service name
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        branch: option_env!("GIT_BRANCH").unwrap_or("unknown"),
        profile: option_env!("BUILD_PROFILE").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "barracks",
    };

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"version":"unknown","commit":"unknown"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
