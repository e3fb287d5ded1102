//! Deadline reminders, overdue alerts and weekly reports
//!
//! While running, each pass emails assignees who are not done yet: a
//! reminder when a KPI is due in 3, 1 or 0 days, and an alert once it is
//! overdue. A KPI gets at most one reminder and one alert per calendar day
//! (UTC) within a process. On Mondays commanders also get a digest of the
//! past week's completions, once per week.
//!
//! Each job can also be triggered by hand through the notification routes.

use bson::DateTime;
use chrono::{Datelike, Weekday};
use dashmap::DashSet;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::dispatcher::{FanOutReport, NotificationDispatcher};
use super::templates::Completion;
use crate::db::schemas::{KpiDoc, ProgressStatus, Role, UserDoc};
use crate::store::{EntityStore, KpiId, KpiQuery, StatusQuery, UserId, UserQuery};
use crate::tasks::PeriodicTask;
use crate::types::Result;
use crate::views::iso;

/// Days-before-deadline on which a reminder goes out
pub const REMINDER_DAYS: [i64; 3] = [3, 1, 0];

/// Jobs run by each scheduled pass
pub const JOBS: [&str; 3] = ["deadline-reminders", "overdue-alerts", "weekly-reports"];

pub const WEEKLY_REPORT_DAY: Weekday = Weekday::Mon;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NoticeKind {
    Reminder,
    Overdue,
}

/// Emails sent by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub reminders: FanOutReport,
    pub overdue: FanOutReport,
    pub weekly: FanOutReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub scheduled_jobs: Vec<&'static str>,
    pub interval_secs: u64,
    pub last_run: Option<String>,
    pub last_weekly_report: Option<String>,
}

pub struct ReminderScheduler {
    store: Arc<dyn EntityStore>,
    dispatcher: Arc<NotificationDispatcher>,
    interval: Duration,
    sent: DashSet<(KpiId, i64, NoticeKind)>,
    /// Day (since epoch) the last weekly digest went out
    weekly_sent_on: Mutex<Option<i64>>,
    last_run: Mutex<Option<DateTime>>,
    task: Mutex<Option<PeriodicTask>>,
}

fn day_of(now: DateTime) -> i64 {
    now.timestamp_millis().div_euclid(DAY_MS)
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Arc<NotificationDispatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            interval,
            sent: DashSet::new(),
            weekly_sent_on: Mutex::new(None),
            last_run: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Run one scheduled pass as of `now`
    pub async fn run_once(&self, now: DateTime) -> Result<ReminderReport> {
        let today = day_of(now);
        self.sent.retain(|(_, day, _)| *day >= today);

        let mut report = ReminderReport {
            reminders: self.send_deadline_reminders(now).await?,
            overdue: self.send_overdue_alerts(now).await?,
            weekly: FanOutReport::default(),
        };

        if now.to_chrono().weekday() == WEEKLY_REPORT_DAY {
            let already = *self.weekly_sent_on.lock().await == Some(today);
            if !already {
                report.weekly = self.send_weekly_reports(now).await?;
            }
        }

        *self.last_run.lock().await = Some(now);
        info!(
            reminders = report.reminders.delivered,
            overdue = report.overdue.delivered,
            weekly = report.weekly.delivered,
            "Reminder pass finished"
        );
        Ok(report)
    }

    /// Remind open assignees of KPIs due in 3, 1 or 0 days
    pub async fn send_deadline_reminders(&self, now: DateTime) -> Result<FanOutReport> {
        let now_ms = now.timestamp_millis();
        let upcoming = self
            .store
            .find_kpis(&KpiQuery {
                deadline_after: Some(now),
                deadline_before: Some(DateTime::from_millis(now_ms + 3 * DAY_MS + 1)),
                ..KpiQuery::active()
            })
            .await?;

        let mut total = FanOutReport::default();
        for kpi in &upcoming {
            let Some(days_left) = kpi.days_until_deadline(now) else {
                continue;
            };
            if !REMINDER_DAYS.contains(&days_left) {
                continue;
            }
            if let Some(sent) = self
                .notify_once(kpi, day_of(now), NoticeKind::Reminder, days_left)
                .await
            {
                add(&mut total, sent);
            }
        }
        Ok(total)
    }

    /// Alert open assignees of active KPIs past their deadline
    pub async fn send_overdue_alerts(&self, now: DateTime) -> Result<FanOutReport> {
        let overdue = self
            .store
            .find_kpis(&KpiQuery {
                deadline_before: Some(now),
                ..KpiQuery::active()
            })
            .await?;

        let mut total = FanOutReport::default();
        for kpi in &overdue {
            let Some(days_left) = kpi.days_until_deadline(now) else {
                continue;
            };
            // ceil of elapsed days, reported as a negative offset
            let days_overdue = (-days_left).max(1);
            if let Some(sent) = self
                .notify_once(kpi, day_of(now), NoticeKind::Overdue, -days_overdue)
                .await
            {
                add(&mut total, sent);
            }
        }
        Ok(total)
    }

    /// Send every active commander a digest of other members' completions
    /// in the seven days before `now`
    pub async fn send_weekly_reports(&self, now: DateTime) -> Result<FanOutReport> {
        let since = DateTime::from_millis(now.timestamp_millis() - 7 * DAY_MS);
        let done = StatusQuery::default()
            .with_status(ProgressStatus::Done)
            .marked_between(since, now);
        let commanders_query = UserQuery::active().with_role(Role::Commander);
        let (commanders, completed) = tokio::try_join!(
            self.store.find_users(&commanders_query),
            self.store.find_statuses(&done)
        )?;

        let kpis: HashMap<KpiId, KpiDoc> = self
            .store
            .find_kpis(&KpiQuery::all(false))
            .await?
            .into_iter()
            .filter_map(|k| Some((k._id?, k)))
            .collect();
        let members: HashMap<UserId, UserDoc> = self
            .dispatcher
            .load_users(completed.iter().map(|s| s.user).collect())
            .await
            .into_iter()
            .filter_map(|u| Some((u._id?, u)))
            .collect();

        let mut lines: Vec<(UserId, Completion)> = completed
            .iter()
            .filter_map(|s| {
                let kpi = kpis.get(&s.kpi)?;
                let member = members.get(&s.user)?;
                Some((
                    s.user,
                    Completion {
                        member: member.full_name(),
                        kpi_title: kpi.title.clone(),
                        completed_at: s.marked_at,
                    },
                ))
            })
            .collect();
        lines.sort_by(|a, b| a.1.completed_at.cmp(&b.1.completed_at));

        let reports = commanders
            .into_iter()
            .map(|commander| {
                let own = commander._id;
                let theirs = lines
                    .iter()
                    .filter(|(user, _)| Some(*user) != own)
                    .map(|(_, line)| line.clone())
                    .collect();
                (commander, theirs)
            })
            .collect();

        let report = self.dispatcher.notify_weekly_reports(reports).await;
        *self.weekly_sent_on.lock().await = Some(day_of(now));
        info!(
            completions = lines.len(),
            delivered = report.delivered,
            "Weekly KPI reports sent"
        );
        Ok(report)
    }

    /// Notify open assignees once per (KPI, day, kind); a failed lookup
    /// leaves the slot free for the next pass
    async fn notify_once(
        &self,
        kpi: &KpiDoc,
        day: i64,
        kind: NoticeKind,
        days_left: i64,
    ) -> Option<FanOutReport> {
        let kpi_id = kpi._id?;
        let key = (kpi_id, day, kind);
        if !self.sent.insert(key) {
            debug!(kpi = %kpi_id, ?kind, "Already notified today");
            return None;
        }

        let statuses = match self.store.find_statuses(&StatusQuery::for_kpi(kpi_id)).await {
            Ok(statuses) => statuses,
            Err(e) => {
                self.sent.remove(&key);
                warn!(kpi = %kpi_id, ?kind, "Could not load assignees, will retry: {}", e);
                return None;
            }
        };
        let open: Vec<_> = statuses
            .into_iter()
            .filter(|s| s.status != ProgressStatus::Done)
            .map(|s| s.user)
            .collect();
        let assignees = self.dispatcher.load_users(open).await;
        Some(
            self.dispatcher
                .notify_deadline(kpi, &assignees, days_left)
                .await,
        )
    }

    pub async fn status(&self) -> SchedulerStatus {
        let weekly = *self.weekly_sent_on.lock().await;
        SchedulerStatus {
            is_running: self.is_running().await,
            scheduled_jobs: JOBS.to_vec(),
            interval_secs: self.interval.as_secs(),
            last_run: self.last_run.lock().await.map(iso),
            last_weekly_report: weekly.map(|day| iso(DateTime::from_millis(day * DAY_MS))),
        }
    }

    /// Start the periodic pass (no-op when already running)
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *task = Some(PeriodicTask::spawn("deadline reminders", self.interval, move || {
            let scheduler = Arc::clone(&scheduler);
            async move {
                if let Err(e) = scheduler.run_once(DateTime::now()).await {
                    warn!("Reminder pass failed: {}", e);
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

fn add(total: &mut FanOutReport, more: FanOutReport) {
    total.attempted += more.attempted;
    total.delivered += more.delivered;
    total.failed += more.failed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{KpiStatusDoc, Targets};
    use crate::notify::dispatcher::tests::FlakyMailer;
    use crate::notify::dispatcher::DispatchConfig;
    use crate::notify::PushHub;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: Arc<InMemoryStore>,
        mailer: Arc<FlakyMailer>,
        scheduler: Arc<ReminderScheduler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let mailer = Arc::new(FlakyMailer::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            mailer.clone(),
            store.clone(),
            Arc::new(PushHub::new(Duration::from_secs(30))),
            DispatchConfig {
                backoff_ms: 1,
                ..Default::default()
            },
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            store.clone(),
            dispatcher,
            Duration::from_secs(3600),
        ));
        Fixture {
            store,
            mailer,
            scheduler,
        }
    }

    async fn kpi_due_in(f: &Fixture, now: DateTime, offset_ms: i64, done: bool) -> KpiId {
        let kpi = f
            .store
            .insert_kpi(KpiDoc {
                title: format!("Due {}", offset_ms),
                deadline: Some(DateTime::from_millis(now.timestamp_millis() + offset_ms)),
                targets: Targets {
                    all_users: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let kpi_id = kpi._id.unwrap();
        let user = f
            .store
            .insert_user(UserDoc::new(
                "M",
                "Ember",
                format!("{}@barracks.test", kpi_id),
                Role::Commando,
                None,
            ))
            .await
            .unwrap();
        let mut record = KpiStatusDoc::pending(user._id.unwrap(), kpi_id);
        if done {
            record.status = ProgressStatus::Done;
        }
        f.store.insert_statuses(vec![record]).await.unwrap();
        kpi_id
    }

    /// 2026-10-19 was a Monday
    fn monday_noon() -> DateTime {
        DateTime::from_chrono(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap())
    }

    fn tuesday_noon() -> DateTime {
        DateTime::from_millis(monday_noon().timestamp_millis() + DAY_MS)
    }

    async fn enlist(f: &Fixture, first: &str, role: Role) -> UserDoc {
        f.store
            .insert_user(UserDoc::new(
                first,
                "Tester",
                format!("{}@barracks.test", first.to_lowercase()),
                role,
                None,
            ))
            .await
            .unwrap()
    }

    fn done_at(user: &UserDoc, kpi: KpiId, marked_at: DateTime) -> KpiStatusDoc {
        let mut record = KpiStatusDoc::pending(user._id.unwrap(), kpi);
        record.status = ProgressStatus::Done;
        record.marked_at = Some(marked_at);
        record
    }

    #[tokio::test]
    async fn test_reminders_only_on_reminder_days() {
        let f = fixture();
        let now = tuesday_noon();
        // ceil(2.5) = 3 days left, ceil(1.5) = 2 days left
        kpi_due_in(&f, now, 5 * DAY_MS / 2, false).await;
        kpi_due_in(&f, now, 3 * DAY_MS / 2, false).await;

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.reminders.delivered, 1);
        assert_eq!(report.overdue.attempted, 0);
    }

    #[tokio::test]
    async fn test_done_assignees_are_skipped() {
        let f = fixture();
        let now = tuesday_noon();
        kpi_due_in(&f, now, DAY_MS / 2, true).await;

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.reminders.attempted, 0);
        assert!(f.mailer.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_alert_sent_once_per_day() {
        let f = fixture();
        let now = tuesday_noon();
        kpi_due_in(&f, now, -DAY_MS - 1, false).await;

        let first = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(first.overdue.delivered, 1);

        let second = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(second.overdue.attempted, 0);
        assert_eq!(f.mailer.sent_to().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_assignee_lookup_is_retried() {
        let f = fixture();
        let now = tuesday_noon();
        kpi_due_in(&f, now, -DAY_MS - 1, false).await;
        f.store.inject_status_read_failures(1);

        let first = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(first.overdue.attempted, 0);
        assert!(f.scheduler.sent.is_empty());

        let second = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(second.overdue.delivered, 1);
        assert_eq!(f.mailer.sent_to().len(), 1);
    }

    #[tokio::test]
    async fn test_previous_days_are_forgotten() {
        let f = fixture();
        let now = tuesday_noon();
        kpi_due_in(&f, now, -DAY_MS - 1, false).await;

        f.scheduler.run_once(now).await.unwrap();
        assert_eq!(f.scheduler.sent.len(), 1);

        let next_day = DateTime::from_millis(now.timestamp_millis() + DAY_MS);
        let report = f.scheduler.run_once(next_day).await.unwrap();
        assert_eq!(report.overdue.delivered, 1);
        assert_eq!(f.scheduler.sent.len(), 1);
        assert!(f.scheduler.sent.iter().all(|k| k.key().1 == day_of(next_day)));
    }

    #[tokio::test]
    async fn test_weekly_report_on_monday() {
        let f = fixture();
        let now = monday_noon();
        let kpi = kpi_due_in(&f, now, 30 * DAY_MS, false).await;

        let first = enlist(&f, "First", Role::Commander).await;
        let second = enlist(&f, "Second", Role::Commander).await;
        let ann = enlist(&f, "Ann", Role::Commando).await;
        let bob = enlist(&f, "Bob", Role::Commando).await;
        let back = |days: i64| DateTime::from_millis(now.timestamp_millis() - days * DAY_MS);
        f.store
            .insert_statuses(vec![
                done_at(&ann, kpi, back(2)),
                // outside the seven-day window
                done_at(&bob, kpi, back(10)),
                done_at(&first, kpi, back(1)),
            ])
            .await
            .unwrap();

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.weekly.delivered, 2);
        let subjects: Vec<(String, String)> = f.mailer.sent.lock().unwrap().clone();
        // First's own completion is left out of their digest
        assert!(subjects.contains(&(
            first.email.clone(),
            "Weekly KPI report: 1 completion(s)".to_string()
        )));
        assert!(subjects.contains(&(
            second.email.clone(),
            "Weekly KPI report: 2 completion(s)".to_string()
        )));

        // Later passes the same Monday do not repeat it
        let again = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(again.weekly.attempted, 0);
        let status = f.scheduler.status().await;
        assert_eq!(status.last_run, Some(iso(now)));
        assert!(status.last_weekly_report.is_some());
    }

    #[tokio::test]
    async fn test_no_weekly_report_midweek() {
        let f = fixture();
        let now = tuesday_noon();
        let kpi = kpi_due_in(&f, now, 30 * DAY_MS, false).await;
        enlist(&f, "Chief", Role::Commander).await;
        let ann = enlist(&f, "Ann", Role::Commando).await;
        f.store
            .insert_statuses(vec![done_at(
                &ann,
                kpi,
                DateTime::from_millis(now.timestamp_millis() - DAY_MS / 24),
            )])
            .await
            .unwrap();

        let report = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(report.weekly, FanOutReport::default());

        // A manual trigger ignores the weekday
        let manual = f.scheduler.send_weekly_reports(now).await.unwrap();
        assert_eq!(manual.delivered, 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let f = fixture();
        f.scheduler.start().await;
        assert!(f.scheduler.is_running().await);
        let status = f.scheduler.status().await;
        assert!(status.is_running);
        assert_eq!(status.scheduled_jobs.len(), 3);
        assert_eq!(status.interval_secs, 3600);
        f.scheduler.stop().await;
        assert!(!f.scheduler.is_running().await);
    }
}
