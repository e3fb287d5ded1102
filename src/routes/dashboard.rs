//! Dashboard routes
//!
//! - `GET /api/dashboard/battalions/{battalion}`
//! - `GET /api/dashboard/members?status=notStarted|inProgress|completed`
//! - `GET /api/dashboard/overview`

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::Deserialize;
use std::sync::Arc;

use super::util::{ok, read_query, respond, FullBody};
use crate::dashboard::MemberProgress;
use crate::db::schemas::Battalion;
use crate::server::AppState;
use crate::types::{BarracksError, Result};

#[derive(Debug, Default, Deserialize)]
pub struct MembersQuery {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn handle_dashboard_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/dashboard").unwrap_or("");

    let result = match (method, subpath) {
        (Method::GET, "/overview") => overview(state).await,
        (Method::GET, "/members") => members(req, state).await,
        (Method::GET, p) if p.starts_with("/battalions/") => {
            let name = p.trim_start_matches("/battalions/").to_string();
            battalion(state, &name).await
        }
        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

async fn battalion(state: Arc<AppState>, name: &str) -> Result<Response<FullBody>> {
    let battalion: Battalion = name.parse()?;
    ok(&state.dashboard.battalion_summary(battalion).await?)
}

async fn members(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<FullBody>> {
    let query: MembersQuery = read_query(&req)?;
    let filter = match query.status.as_deref() {
        Some(raw) => raw.parse()?,
        None => MemberProgress::NotStarted,
    };
    ok(&state.dashboard.members_by_progress(filter).await?)
}

async fn overview(state: Arc<AppState>) -> Result<Response<FullBody>> {
    ok(&state.dashboard.management_overview().await?)
}
