//! Live performance metrics
//!
//! Computed on request from status records, either for one member or for
//! everyone. Each metric compares the current period with the one before
//! it and reports the difference as `trend`:
//!
//! - completion rate: done this calendar month (UTC) per assignment on an
//!   active KPI
//! - performance score: priority-weighted progress of completions in the
//!   last 30 days against the 30 days before
//! - on-time delivery: share of those completions marked by the deadline
//! - efficiency: progress made relative to the time a KPI allowed

use bson::DateTime;
use chrono::{Datelike, Months, NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use crate::db::schemas::{KpiDoc, KpiStatusDoc, Priority, ProgressStatus, UserDoc};
use crate::store::{EntityStore, KpiId, KpiQuery, StatusQuery, TargetSubject, UserId, UserQuery};
use crate::types::{BarracksError, Result};
use crate::views::iso;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const PERIOD_MS: i64 = 30 * DAY_MS;

/// Days a KPI without a deadline is assumed to allow
const DEFAULT_SPAN_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    CompletionRate,
    PerformanceScore,
    OnTimeDelivery,
    Efficiency,
}

impl FromStr for MetricKind {
    type Err = BarracksError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "completion-rate" => Ok(MetricKind::CompletionRate),
            "performance-score" => Ok(MetricKind::PerformanceScore),
            "on-time-delivery" => Ok(MetricKind::OnTimeDelivery),
            "efficiency" => Ok(MetricKind::Efficiency),
            other => Err(BarracksError::Validation(format!(
                "Invalid metric type '{}' (expected one of: completion-rate, performance-score, on-time-delivery, efficiency)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRate {
    pub value: i64,
    pub trend: i64,
    pub current_month_completed: u64,
    pub last_month_completed: u64,
    pub total_assigned: u64,
}

/// A 30-day metric with the record counts behind both periods
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodMetric {
    pub value: i64,
    pub trend: i64,
    pub current_period: u64,
    pub previous_period: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricDetail {
    CompletionRate(CompletionRate),
    Period(PeriodMetric),
}

#[derive(Debug, Clone, Serialize)]
pub struct Headline {
    pub value: i64,
    pub trend: i64,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMetrics {
    pub completion_rate: Headline,
    pub performance_score: Headline,
    pub on_time_delivery: Headline,
    pub efficiency: Headline,
    pub last_updated: String,
    pub is_live: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberCounts {
    pub total_users: u64,
    pub active_users: u64,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    #[serde(flatten)]
    pub metrics: LiveMetrics,
    pub summary: MemberCounts,
}

/// Start of the current and the previous calendar month (UTC)
fn month_starts(now: DateTime) -> (DateTime, DateTime) {
    let today = now.to_chrono().date_naive();
    let this_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let last_month = this_month
        .checked_sub_months(Months::new(1))
        .unwrap_or(this_month);
    let start = |d: NaiveDate| DateTime::from_chrono(d.and_time(NaiveTime::MIN).and_utc());
    (start(this_month), start(last_month))
}

fn percent(part: f64, whole: f64) -> i64 {
    if whole > 0.0 {
        (part / whole * 100.0).round() as i64
    } else {
        0
    }
}

fn priority_weight(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 4.0,
        Priority::High => 3.0,
        Priority::Medium => 2.0,
        Priority::Low => 1.0,
    }
}

/// Progress credited to a record; done records without one count as 100
fn credited_progress(record: &KpiStatusDoc) -> f64 {
    match record.progress {
        Some(p) if p > 0 => f64::from(p),
        _ if record.status == ProgressStatus::Done => 100.0,
        _ => 0.0,
    }
}

/// Priority-weighted average progress, as a percentage
fn weighted_score(records: &[KpiStatusDoc], kpis: &HashMap<KpiId, KpiDoc>) -> i64 {
    let (score, weight) = records.iter().fold((0.0, 0.0), |(score, weight), r| {
        let w = kpis
            .get(&r.kpi)
            .map(|k| priority_weight(k.priority))
            .unwrap_or(1.0);
        (score + credited_progress(r) / 100.0 * w, weight + w)
    });
    percent(score, weight)
}

/// Share of completions marked no later than their deadline
fn on_time_rate(records: &[KpiStatusDoc], kpis: &HashMap<KpiId, KpiDoc>) -> i64 {
    let on_time = records
        .iter()
        .filter(|r| {
            match (r.marked_at, kpis.get(&r.kpi).and_then(|k| k.deadline)) {
                (Some(marked), Some(deadline)) => marked <= deadline,
                _ => true,
            }
        })
        .count();
    percent(on_time as f64, records.len() as f64)
}

/// Average of progress scaled by allowed time over used time, capped at 100
fn efficiency_of(records: &[KpiStatusDoc], kpis: &HashMap<KpiId, KpiDoc>) -> i64 {
    let days = |from: DateTime, to: DateTime| {
        (to.timestamp_millis() - from.timestamp_millis()) as f64 / DAY_MS as f64
    };
    let scores: Vec<f64> = records
        .iter()
        .filter_map(|r| {
            let kpi = kpis.get(&r.kpi)?;
            let created = kpi.metadata.created_at?;
            let allowed = kpi
                .deadline
                .map(|d| days(created, d).max(1.0))
                .unwrap_or(DEFAULT_SPAN_DAYS);
            let used = r.marked_at.map(|m| days(created, m)).unwrap_or(allowed);
            Some((credited_progress(r) / used.max(1.0) * allowed).min(100.0))
        })
        .collect();
    if scores.is_empty() {
        return 0;
    }
    (scores.iter().sum::<f64>() / scores.len() as f64).round() as i64
}

pub struct MetricsService {
    store: Arc<dyn EntityStore>,
}

impl MetricsService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Every metric for `user`, or for all members when `None`
    pub async fn live_metrics(&self, user: Option<UserId>, now: DateTime) -> Result<LiveMetrics> {
        let scope = self.scope(user).await?;
        let scope = scope.as_ref();
        let (completion, performance, on_time, efficiency) = tokio::try_join!(
            self.completion_rate_for(scope, now),
            self.performance_score_for(scope, now),
            self.on_time_delivery_for(scope, now),
            self.efficiency_for(scope, now)
        )?;

        let headline = |value, trend, description| Headline {
            value,
            trend,
            description,
        };
        Ok(LiveMetrics {
            completion_rate: headline(
                completion.value,
                completion.trend,
                "KPIs completed this month",
            ),
            performance_score: headline(
                performance.value,
                performance.trend,
                "Overall performance score",
            ),
            on_time_delivery: headline(on_time.value, on_time.trend, "Deadlines met on time"),
            efficiency: headline(efficiency.value, efficiency.trend, "Resource utilization"),
            last_updated: iso(now),
            is_live: true,
        })
    }

    pub async fn metric(
        &self,
        kind: MetricKind,
        user: Option<UserId>,
        now: DateTime,
    ) -> Result<MetricDetail> {
        let scope = self.scope(user).await?;
        let scope = scope.as_ref();
        Ok(match kind {
            MetricKind::CompletionRate => {
                MetricDetail::CompletionRate(self.completion_rate_for(scope, now).await?)
            }
            MetricKind::PerformanceScore => {
                MetricDetail::Period(self.performance_score_for(scope, now).await?)
            }
            MetricKind::OnTimeDelivery => {
                MetricDetail::Period(self.on_time_delivery_for(scope, now).await?)
            }
            MetricKind::Efficiency => MetricDetail::Period(self.efficiency_for(scope, now).await?),
        })
    }

    /// Battalion-wide metrics with member counts
    pub async fn summary(&self, now: DateTime) -> Result<MetricsSummary> {
        let everyone = UserQuery::default();
        let active = UserQuery::active();
        let (metrics, all_users, active_users) = tokio::try_join!(
            self.live_metrics(None, now),
            self.store.find_users(&everyone),
            self.store.find_users(&active)
        )?;
        Ok(MetricsSummary {
            metrics,
            summary: MemberCounts {
                total_users: all_users.len() as u64,
                active_users: active_users.len() as u64,
                last_updated: iso(now),
            },
        })
    }

    async fn scope(&self, user: Option<UserId>) -> Result<Option<UserDoc>> {
        let Some(id) = user else {
            return Ok(None);
        };
        match self.store.get_user(id).await? {
            Some(user) => Ok(Some(user)),
            None => Err(BarracksError::NotFound(format!("User {}", id))),
        }
    }

    /// Active KPIs whose rule selects the member, or all active KPIs
    async fn assigned(&self, scope: Option<&UserDoc>) -> Result<Vec<KpiDoc>> {
        let query = match scope {
            Some(user) => {
                let Some(subject) = TargetSubject::of(user) else {
                    return Ok(Vec::new());
                };
                KpiQuery {
                    could_target: vec![subject],
                    ..KpiQuery::active()
                }
            }
            None => KpiQuery::active(),
        };
        self.store.find_kpis(&query).await
    }

    /// Records marked in `[from, to)` (open-ended when `to` is `None`)
    async fn marked(
        &self,
        scope: Option<&UserDoc>,
        done_only: bool,
        from: DateTime,
        to: Option<DateTime>,
    ) -> Result<Vec<KpiStatusDoc>> {
        let query = StatusQuery {
            user: scope.and_then(|u| u._id),
            status: done_only.then_some(ProgressStatus::Done),
            marked_after: Some(from),
            marked_before: to,
            ..Default::default()
        };
        self.store.find_statuses(&query).await
    }

    async fn kpi_index(&self) -> Result<HashMap<KpiId, KpiDoc>> {
        Ok(self
            .store
            .find_kpis(&KpiQuery::all(true))
            .await?
            .into_iter()
            .filter_map(|k| Some((k._id?, k)))
            .collect())
    }

    /// Done records of the last 30 days and of the 30 days before
    async fn completions_by_period(
        &self,
        scope: Option<&UserDoc>,
        now: DateTime,
    ) -> Result<(Vec<KpiStatusDoc>, Vec<KpiStatusDoc>)> {
        let (recent_start, previous_start) = periods(now);
        tokio::try_join!(
            self.marked(scope, true, recent_start, None),
            self.marked(scope, true, previous_start, Some(recent_start))
        )
    }

    async fn completion_rate_for(
        &self,
        scope: Option<&UserDoc>,
        now: DateTime,
    ) -> Result<CompletionRate> {
        let (this_month, last_month) = month_starts(now);
        let records = StatusQuery {
            user: scope.and_then(|u| u._id),
            ..Default::default()
        };
        let (current, previous, assigned, records) = tokio::try_join!(
            self.marked(scope, true, this_month, None),
            self.marked(scope, true, last_month, Some(this_month)),
            self.assigned(scope),
            self.store.find_statuses(&records)
        )?;
        let live: HashSet<KpiId> = assigned.iter().filter_map(|k| k._id).collect();
        let total_assigned = records.iter().filter(|r| live.contains(&r.kpi)).count() as u64;

        let value = percent(current.len() as f64, total_assigned as f64);
        let last = percent(previous.len() as f64, total_assigned as f64);
        Ok(CompletionRate {
            value,
            trend: value - last,
            current_month_completed: current.len() as u64,
            last_month_completed: previous.len() as u64,
            total_assigned,
        })
    }

    async fn performance_score_for(
        &self,
        scope: Option<&UserDoc>,
        now: DateTime,
    ) -> Result<PeriodMetric> {
        let ((recent, previous), kpis) =
            tokio::try_join!(self.completions_by_period(scope, now), self.kpi_index())?;
        Ok(period_metric(
            weighted_score(&recent, &kpis),
            weighted_score(&previous, &kpis),
            &recent,
            &previous,
        ))
    }

    async fn on_time_delivery_for(
        &self,
        scope: Option<&UserDoc>,
        now: DateTime,
    ) -> Result<PeriodMetric> {
        let ((recent, previous), kpis) =
            tokio::try_join!(self.completions_by_period(scope, now), self.kpi_index())?;
        Ok(period_metric(
            on_time_rate(&recent, &kpis),
            on_time_rate(&previous, &kpis),
            &recent,
            &previous,
        ))
    }

    /// Any record marked on an assigned KPI counts, done or not
    async fn efficiency_for(&self, scope: Option<&UserDoc>, now: DateTime) -> Result<PeriodMetric> {
        let (recent_start, previous_start) = periods(now);
        let (assigned, recent, previous) = tokio::try_join!(
            self.assigned(scope),
            self.marked(scope, false, recent_start, None),
            self.marked(scope, false, previous_start, Some(recent_start))
        )?;
        let kpis: HashMap<KpiId, KpiDoc> = assigned
            .into_iter()
            .filter_map(|k| Some((k._id?, k)))
            .collect();
        let ids: HashSet<KpiId> = kpis.keys().copied().collect();
        let recent: Vec<_> = recent.into_iter().filter(|r| ids.contains(&r.kpi)).collect();
        let previous: Vec<_> = previous.into_iter().filter(|r| ids.contains(&r.kpi)).collect();
        Ok(period_metric(
            efficiency_of(&recent, &kpis),
            efficiency_of(&previous, &kpis),
            &recent,
            &previous,
        ))
    }
}

/// Start of the recent and of the previous 30-day period
fn periods(now: DateTime) -> (DateTime, DateTime) {
    let now_ms = now.timestamp_millis();
    (
        DateTime::from_millis(now_ms - PERIOD_MS),
        DateTime::from_millis(now_ms - 2 * PERIOD_MS),
    )
}

fn period_metric(
    value: i64,
    previous_value: i64,
    recent: &[KpiStatusDoc],
    previous: &[KpiStatusDoc],
) -> PeriodMetric {
    PeriodMetric {
        value,
        trend: value - previous_value,
        current_period: recent.len() as u64,
        previous_period: previous.len() as u64,
    }
}
