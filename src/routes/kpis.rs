//! KPI routes
//!
//! - `GET    /api/kpis`                  list (`?include_deleted=true` for audit)
//! - `POST   /api/kpis`                  create and assign
//! - `GET    /api/kpis/active`           active, non-deleted KPIs
//! - `GET    /api/kpis/overdue`          past-deadline KPIs with severity
//! - `POST   /api/kpis/recompute`        recompute stats of every active KPI
//! - `GET    /api/kpis/{id}`             one KPI
//! - `PUT    /api/kpis/{id}`             edit (optional `expectedVersion`)
//! - `DELETE /api/kpis/{id}`             soft delete
//! - `GET    /api/kpis/{id}/statuses`    status records of one KPI
//! - `POST   /api/kpis/{id}/recompute`   recompute one KPI's stats

use bson::DateTime;
use chrono::{NaiveDate, TimeZone, Utc};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::util::{actor, created, ok, parse_id, read_json, read_query, respond, FullBody};
use crate::db::schemas::{Battalion, Category, KpiLifecycle, Priority, Role, Targets};
use crate::kpi::{BatchReport, KpiUpdate, LegacyAssignment, NewKpi};
use crate::server::AppState;
use crate::store::UserId;
use crate::types::{BarracksError, Result};
use crate::views::{KpiView, StatsView, StatusView};

/// Targeting rule as sent by clients
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsBody {
    #[serde(default, alias = "all_users")]
    pub all_users: bool,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub battalions: BTreeSet<Battalion>,
    #[serde(default, alias = "specific_users")]
    pub specific_users: BTreeSet<UserId>,
}

impl From<TargetsBody> for Targets {
    fn from(body: TargetsBody) -> Self {
        Targets {
            all_users: body.all_users,
            roles: body.roles,
            battalions: body.battalions,
            specific_users: body.specific_users,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateKpiRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub targets: Option<TargetsBody>,
    #[serde(flatten)]
    pub legacy: LegacyAssignment,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKpiRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub status: Option<KpiLifecycle>,
    #[serde(default)]
    pub targets: Option<TargetsBody>,
    #[serde(default, alias = "expected_version")]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    kpi: KpiView,
    target_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OverdueResponse<T: Serialize> {
    count: usize,
    overdue_kpis: Vec<T>,
}

#[derive(Serialize)]
struct FailedRecompute {
    kpi: String,
    error: String,
}

#[derive(Serialize)]
struct BatchResponse {
    succeeded: usize,
    failed: Vec<FailedRecompute>,
}

impl From<BatchReport> for BatchResponse {
    fn from(report: BatchReport) -> Self {
        Self {
            succeeded: report.succeeded,
            failed: report
                .failed
                .into_iter()
                .map(|(kpi, e)| FailedRecompute {
                    kpi: kpi.to_hex(),
                    error: e.to_string(),
                })
                .collect(),
        }
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (end of that day, UTC)
pub fn parse_deadline(raw: &str) -> Result<DateTime> {
    let raw = raw.trim();
    if let Ok(at) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(DateTime::from_chrono(at.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|naive| DateTime::from_chrono(Utc.from_utc_datetime(&naive)))
        .ok_or_else(|| BarracksError::Validation(format!("Invalid deadline '{}'", raw)))
}

fn parse_deadline_opt(raw: Option<&str>) -> Result<Option<DateTime>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(parse_deadline)
        .transpose()
}

pub async fn handle_kpi_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/kpis").unwrap_or("");

    let result = match (method, subpath) {
        (Method::GET, "") | (Method::GET, "/") => list_kpis(req, state).await,
        (Method::POST, "") | (Method::POST, "/") => create_kpi(req, state).await,
        (Method::GET, "/active") => {
            let kpis = state.kpis.find_active().await;
            kpis.and_then(|k| ok(&k.iter().map(KpiView::from).collect::<Vec<_>>()))
        }
        (Method::GET, "/overdue") => overdue_kpis(state).await,
        (Method::POST, "/recompute") => recompute_all(state).await,

        (Method::GET, p) if p.ends_with("/statuses") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/statuses"))
                .unwrap_or("");
            kpi_statuses(state, id).await
        }
        (Method::POST, p) if p.ends_with("/recompute") => {
            let id = p
                .strip_prefix('/')
                .and_then(|s| s.strip_suffix("/recompute"))
                .unwrap_or("");
            recompute_one(state, id).await
        }

        (Method::GET, p) if p.matches('/').count() == 1 => get_kpi(state, &p[1..]).await,
        (Method::PUT, p) if p.matches('/').count() == 1 => {
            let id = p[1..].to_string();
            update_kpi(req, state, &id).await
        }
        (Method::DELETE, p) if p.matches('/').count() == 1 => {
            let id = p[1..].to_string();
            delete_kpi(req, state, &id).await
        }

        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

async fn list_kpis(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<FullBody>> {
    let query: ListQuery = read_query(&req)?;
    let kpis = state.kpis.list_kpis(query.include_deleted).await?;
    ok(&kpis.iter().map(KpiView::from).collect::<Vec<_>>())
}

async fn create_kpi(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let body: CreateKpiRequest = read_json(req).await?;
    let new = NewKpi {
        title: body.title,
        description: body.description,
        category: body.category,
        priority: body.priority,
        deadline: parse_deadline_opt(body.deadline.as_deref())?,
        targets: body.targets.map(Targets::from),
        legacy: body.legacy,
    };
    let result = state.kpis.create_kpi(actor, new).await?;
    created(&CreatedResponse {
        kpi: KpiView::from(&result.kpi),
        target_count: result.target_count,
        warning: result.warning,
    })
}

async fn get_kpi(state: Arc<AppState>, id: &str) -> Result<Response<FullBody>> {
    let kpi = state.kpis.get_kpi(parse_id(id, "KPI")?).await?;
    ok(&KpiView::from(&kpi))
}

async fn update_kpi(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let id = parse_id(id, "KPI")?;
    let body: UpdateKpiRequest = read_json(req).await?;
    let update = KpiUpdate {
        title: body.title,
        description: body.description,
        category: body.category,
        priority: body.priority,
        deadline: parse_deadline_opt(body.deadline.as_deref())?,
        status: body.status,
        targets: body.targets.map(Targets::from),
        expected_version: body.expected_version,
    };
    let kpi = state.kpis.update_kpi(actor, id, update).await?;
    ok(&KpiView::from(&kpi))
}

async fn delete_kpi(
    req: Request<Incoming>,
    state: Arc<AppState>,
    id: &str,
) -> Result<Response<FullBody>> {
    let actor = actor(&req)?;
    let kpi = state.kpis.soft_delete(actor, parse_id(id, "KPI")?).await?;
    ok(&KpiView::from(&kpi))
}

async fn kpi_statuses(state: Arc<AppState>, id: &str) -> Result<Response<FullBody>> {
    let statuses = state.kpis.statuses_for(parse_id(id, "KPI")?).await?;
    ok(&statuses.iter().map(StatusView::from).collect::<Vec<_>>())
}

async fn overdue_kpis(state: Arc<AppState>) -> Result<Response<FullBody>> {
    let overdue = state.dashboard.overdue_kpis(DateTime::now()).await?;
    ok(&OverdueResponse {
        count: overdue.len(),
        overdue_kpis: overdue,
    })
}

async fn recompute_one(state: Arc<AppState>, id: &str) -> Result<Response<FullBody>> {
    let id = parse_id(id, "KPI")?;
    state.kpis.get_kpi(id).await?;
    let stats = state.stats.recompute(id).await?;
    ok(&StatsView::from(&stats))
}

async fn recompute_all(state: Arc<AppState>) -> Result<Response<FullBody>> {
    let report = state.stats.recompute_all_active().await?;
    ok(&BatchResponse::from(report))
}
