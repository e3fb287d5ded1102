//! Reminder scheduler control
//!
//! - `GET /api/notifications/status`
//! - `POST /api/notifications/start`, `POST /api/notifications/stop`
//! - `POST /api/notifications/send-kpi-reminders`
//! - `POST /api/notifications/send-overdue-alerts`
//! - `POST /api/notifications/send-weekly-reports`
//!
//! Manual sends share the scheduler's per-day dedup, so triggering one right
//! after a scheduled pass only reaches KPIs the pass has not covered yet.

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::util::{ok, respond, FullBody};
use crate::notify::FanOutReport;
use crate::server::AppState;
use crate::types::{BarracksError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub job: &'static str,
    pub report: FanOutReport,
}

pub async fn handle_notification_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<FullBody> {
    let method = req.method().clone();
    let subpath = path.strip_prefix("/api/notifications").unwrap_or("");
    let now = DateTime::now();

    let result = match (method, subpath) {
        (Method::GET, "/status") => ok(&state.reminders.status().await),
        (Method::POST, "/start") => {
            state.reminders.start().await;
            info!("Reminder scheduler started on request");
            ok(&state.reminders.status().await)
        }
        (Method::POST, "/stop") => {
            state.reminders.stop().await;
            info!("Reminder scheduler stopped on request");
            ok(&state.reminders.status().await)
        }
        (Method::POST, "/send-kpi-reminders") => {
            triggered("deadline-reminders", state.reminders.send_deadline_reminders(now).await)
        }
        (Method::POST, "/send-overdue-alerts") => {
            triggered("overdue-alerts", state.reminders.send_overdue_alerts(now).await)
        }
        (Method::POST, "/send-weekly-reports") => {
            triggered("weekly-reports", state.reminders.send_weekly_reports(now).await)
        }
        _ => Err(BarracksError::NotFound(format!("Route {}", path))),
    };
    respond(result)
}

fn triggered(job: &'static str, report: Result<FanOutReport>) -> Result<Response<FullBody>> {
    let report = report?;
    info!(job, delivered = report.delivered, failed = report.failed, "Manual send finished");
    ok(&TriggerResponse { job, report })
}
