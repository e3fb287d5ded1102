//! Live metrics routes
//!
//! - `GET /api/metrics/live` for the member in `X-User-Id`
//! - `GET /api/metrics/summary` across all members
//! - `GET /api/metrics/user/{id}`
//! - `GET /api/metrics/{type}` with `completion-rate`, `performance-score`,
//!   `on-time-delivery` or `efficiency`, scoped to `X-User-Id` when present

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::sync::Arc;

use super::util::{actor, ok, parse_id, respond, FullBody, ACTOR_HEADER};
use crate::metrics::MetricKind;
use crate::server::AppState;
use crate::types::{BarracksError, Result};

pub async fn handle_metrics_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/metrics").unwrap_or("");
    let now = DateTime::now();

    let result = match (method, subpath) {
        (Method::GET, "/live") => live(&req, state, now).await,
        (Method::GET, "/summary") => summary(state, now).await,
        (Method::GET, p) if p.starts_with("/user/") => {
            let id = p.trim_start_matches("/user/").to_string();
            user_metrics(state, &id, now).await
        }
        (Method::GET, p) if p.matches('/').count() == 1 && p.len() > 1 => {
            let kind = p[1..].to_string();
            single(&req, state, &kind, now).await
        }
        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

async fn live(
    req: &Request<Incoming>,
    state: Arc<AppState>,
    now: DateTime,
) -> Result<Response<FullBody>> {
    let actor = actor(req)?;
    ok(&state.metrics.live_metrics(Some(actor), now).await?)
}

async fn summary(state: Arc<AppState>, now: DateTime) -> Result<Response<FullBody>> {
    ok(&state.metrics.summary(now).await?)
}

async fn user_metrics(state: Arc<AppState>, id: &str, now: DateTime) -> Result<Response<FullBody>> {
    let id = parse_id(id, "user")?;
    ok(&state.metrics.live_metrics(Some(id), now).await?)
}

async fn single(
    req: &Request<Incoming>,
    state: Arc<AppState>,
    kind: &str,
    now: DateTime,
) -> Result<Response<FullBody>> {
    let kind: MetricKind = kind.parse()?;
    let user = if req.headers().contains_key(ACTOR_HEADER) {
        Some(actor(req)?)
    } else {
        None
    };
    ok(&state.metrics.metric(kind, user, now).await?)
}
