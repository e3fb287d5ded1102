//! Status routes
//!
//! - `PUT /api/statuses/{id}` with `{"status": "in_progress", "progress": 40}`
//! - `GET /api/me/kpis`, `GET /api/me/summary` for the member in `X-User-Id`

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::Deserialize;
use std::sync::Arc;

use super::util::{actor, ok, parse_id, read_json, respond, FullBody};
use crate::server::AppState;
use crate::types::{BarracksError, Result};
use crate::views::StatusView;

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub progress: Option<i64>,
}

pub async fn handle_status_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/statuses").unwrap_or("");

    let result = match (method, subpath) {
        (Method::PUT, p) if p.matches('/').count() == 1 && p.len() > 1 => {
            let id = p[1..].to_string();
            update_status(req, state, &id).await
        }
        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

async fn update_status(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let id = parse_id(id, "status")?;
    let body: UpdateStatusRequest = read_json(req).await?;
    let record = state
        .kpis
        .update_status(actor, id, &body.status, body.progress)
        .await?;
    ok(&StatusView::from(&record))
}

pub async fn handle_me_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    respond(me(req, state, path).await)
}

async fn me(req: Request<Incoming>, state: Arc<AppState>, path: &str) -> Result<Response<FullBody>> {
    let user = actor(&req)?;
    let method = req.method().clone();
    match (method, path) {
        (Method::GET, "/api/me/kpis") => ok(&state.dashboard.my_kpis(user).await?),
        (Method::GET, "/api/me/summary") => ok(&state.dashboard.user_summary(user).await?),
        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    }
}
