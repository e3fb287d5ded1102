//! Notification dispatcher
//!
//! Email delivery retries with exponential backoff and records every
//! delivery in the email log. Nothing here returns an error to the core:
//! callers get a delivered flag or a [`FanOutReport`].

use bson::oid::ObjectId;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::mailer::Mailer;
use super::push::PushHub;
use super::templates::{self, Email};
use crate::db::schemas::{EmailLogDoc, KpiDoc, Role, UserDoc};
use crate::store::{EntityStore, UserQuery};

/// Retry and concurrency settings for outgoing email
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt
    pub backoff_ms: u64,
    /// Emails in flight at once during a fan-out
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            concurrency: 8,
        }
    }
}

/// Per-recipient outcome counts of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    store: Arc<dyn EntityStore>,
    push: Arc<PushHub>,
    config: DispatchConfig,
}

impl NotificationDispatcher {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        store: Arc<dyn EntityStore>,
        push: Arc<PushHub>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            mailer,
            store,
            push,
            config,
        }
    }

    pub fn push(&self) -> &Arc<PushHub> {
        &self.push
    }

    /// Deliver one email, retrying with exponential backoff
    ///
    /// Returns whether it was delivered. The outcome is logged and written
    /// to the email log either way.
    pub async fn send_with_retry(&self, email: &Email) -> bool {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;
            match self.mailer.send(&email.to, &email.subject, &email.html).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Email attempt {}/{} to {} failed: {}",
                        attempts, max_attempts, email.to, e
                    );
                    last_error = Some(e.to_string());
                    if attempts < max_attempts {
                        tokio::time::sleep(self.backoff(attempts)).await;
                    }
                }
            }
        }

        let success = last_error.is_none();
        if success {
            debug!(to = %email.to, subject = %email.subject, attempts, "Email delivered");
        } else {
            error!(
                "Email to {} failed after {} attempts: {}",
                email.to,
                attempts,
                last_error.as_deref().unwrap_or("unknown error")
            );
        }

        let log = EmailLogDoc {
            to: email.to.clone(),
            subject: email.subject.clone(),
            success,
            attempts: attempts as i32,
            error: last_error,
            ..Default::default()
        };
        if let Err(e) = self.store.record_email(log).await {
            warn!("Failed to record email log for {}: {}", email.to, e);
        }
        success
    }

    /// `backoff_ms * 2^(attempt - 1)`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.backoff_ms.saturating_mul(factor))
    }

    /// Send every email with bounded concurrency; one failure never stops
    /// the others
    pub async fn fan_out(&self, emails: Vec<Email>) -> FanOutReport {
        let attempted = emails.len();
        let delivered = stream::iter(emails)
            .map(|email| async move { self.send_with_retry(&email).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        let report = FanOutReport {
            attempted,
            delivered,
            failed: attempted - delivered,
        };
        if attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                failed = report.failed,
                "Email fan-out finished"
            );
        }
        report
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    pub async fn notify_welcome(&self, user: &UserDoc) -> bool {
        self.send_with_retry(&templates::welcome(user)).await
    }

    pub async fn notify_kpi_assigned(&self, kpi: &KpiDoc, users: &[UserDoc]) -> FanOutReport {
        let emails = users
            .iter()
            .map(|user| templates::kpi_assigned(user, kpi))
            .collect();
        self.fan_out(emails).await
    }

    /// Tell every commander except the completer that a KPI was completed
    pub async fn notify_kpi_completed(
        &self,
        kpi: &KpiDoc,
        completer: &UserDoc,
        completed_at: Option<bson::DateTime>,
    ) -> FanOutReport {
        let commanders = match self
            .store
            .find_users(&UserQuery::active().with_role(Role::Commander))
            .await
        {
            Ok(users) => users,
            Err(e) => {
                warn!("Could not load commanders for completion notice: {}", e);
                return FanOutReport::default();
            }
        };

        let emails = commanders
            .iter()
            .filter(|c| c._id != completer._id)
            .map(|c| templates::kpi_completed(c, completer, kpi, completed_at))
            .collect();
        self.fan_out(emails).await
    }

    pub async fn notify_role_changed(
        &self,
        user: &UserDoc,
        old: Role,
        new: Role,
        changed_by: Option<&UserDoc>,
    ) -> bool {
        self.send_with_retry(&templates::role_changed(user, old, new, changed_by))
            .await
    }

    pub async fn notify_account_status(
        &self,
        user: &UserDoc,
        active: bool,
        reason: Option<&str>,
    ) -> bool {
        self.send_with_retry(&templates::account_status(user, active, reason))
            .await
    }

    /// Deadline reminders (or overdue alerts, for negative `days_left`) to
    /// the given assignees
    pub async fn notify_deadline(
        &self,
        kpi: &KpiDoc,
        assignees: &[UserDoc],
        days_left: i64,
    ) -> FanOutReport {
        let emails = assignees
            .iter()
            .map(|user| templates::deadline_reminder(user, kpi, days_left))
            .collect();
        self.fan_out(emails).await
    }

    /// One digest per commander; commanders with nothing to report get none
    pub async fn notify_weekly_reports(
        &self,
        reports: Vec<(UserDoc, Vec<templates::Completion>)>,
    ) -> FanOutReport {
        let emails = reports
            .iter()
            .filter(|(_, completions)| !completions.is_empty())
            .map(|(commander, completions)| templates::weekly_report(commander, completions))
            .collect();
        self.fan_out(emails).await
    }

    /// Look up users by id, skipping missing ones
    pub async fn load_users(&self, ids: Vec<ObjectId>) -> Vec<UserDoc> {
        if ids.is_empty() {
            return Vec::new();
        }
        let query = UserQuery {
            ids: Some(ids),
            ..Default::default()
        };
        match self.store.find_users(&query).await {
            Ok(users) => users,
            Err(e) => {
                warn!("Could not load notification recipients: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{BarracksError, Result};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mailer that fails a configurable number of times per recipient
    #[derive(Default)]
    pub(crate) struct FlakyMailer {
        failures: Mutex<HashMap<String, u32>>,
        pub(crate) sent: Mutex<Vec<(String, String)>>,
    }

    impl FlakyMailer {
        pub(crate) fn fail(&self, to: &str, times: u32) {
            self.failures.lock().unwrap().insert(to.to_string(), times);
        }

        pub(crate) fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(to, _)| to.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(to) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BarracksError::Notification("smtp unavailable".into()));
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    fn dispatcher(
        mailer: Arc<FlakyMailer>,
        store: Arc<InMemoryStore>,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(
            mailer,
            store,
            Arc::new(PushHub::new(Duration::from_secs(30))),
            DispatchConfig {
                max_attempts: 3,
                backoff_ms: 1,
                concurrency: 4,
            },
        )
    }

    fn email(to: &str) -> Email {
        Email {
            to: to.into(),
            subject: "Subject".into(),
            html: "<p>x</p>".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_attempts_are_logged() {
        let mailer = Arc::new(FlakyMailer::default());
        let store = Arc::new(InMemoryStore::new());
        mailer.fail("slow@barracks.test", 2);
        let d = dispatcher(Arc::clone(&mailer), Arc::clone(&store));

        assert!(d.send_with_retry(&email("slow@barracks.test")).await);

        let logs = store.email_logs().await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].attempts, 3);
        assert!(logs[0].error.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_logged_as_failure() {
        let mailer = Arc::new(FlakyMailer::default());
        let store = Arc::new(InMemoryStore::new());
        mailer.fail("down@barracks.test", 10);
        let d = dispatcher(Arc::clone(&mailer), Arc::clone(&store));

        assert!(!d.send_with_retry(&email("down@barracks.test")).await);

        let logs = store.email_logs().await;
        assert!(!logs[0].success);
        assert_eq!(logs[0].attempts, 3);
        assert!(logs[0].error.as_deref().unwrap().contains("smtp unavailable"));
    }

    #[tokio::test]
    async fn test_fan_out_partial_failure() {
        let mailer = Arc::new(FlakyMailer::default());
        let store = Arc::new(InMemoryStore::new());
        mailer.fail("c@barracks.test", 10);
        let d = dispatcher(Arc::clone(&mailer), Arc::clone(&store));

        let report = d
            .fan_out(vec![
                email("a@barracks.test"),
                email("b@barracks.test"),
                email("c@barracks.test"),
            ])
            .await;
        assert_eq!(
            report,
            FanOutReport {
                attempted: 3,
                delivered: 2,
                failed: 1
            }
        );
        let mut sent = mailer.sent_to();
        sent.sort();
        assert_eq!(sent, vec!["a@barracks.test", "b@barracks.test"]);
        assert_eq!(store.email_logs().await.len(), 3);
    }

    #[test]
    fn test_backoff_doubles() {
        let d = NotificationDispatcher::new(
            Arc::new(FlakyMailer::default()),
            Arc::new(InMemoryStore::new()),
            Arc::new(PushHub::new(Duration::from_secs(30))),
            DispatchConfig {
                backoff_ms: 100,
                ..Default::default()
            },
        );
        assert_eq!(d.backoff(1), Duration::from_millis(100));
        assert_eq!(d.backoff(2), Duration::from_millis(200));
        assert_eq!(d.backoff(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_completion_skips_the_completer() {
        let mailer = Arc::new(FlakyMailer::default());
        let store = Arc::new(InMemoryStore::new());
        let d = dispatcher(Arc::clone(&mailer), Arc::clone(&store));

        let completer = store
            .insert_user(UserDoc::new("C", "One", "c1@barracks.test", Role::Commander, None))
            .await
            .unwrap();
        store
            .insert_user(UserDoc::new("C", "Two", "c2@barracks.test", Role::Commander, None))
            .await
            .unwrap();
        store
            .insert_user(UserDoc::new("S", "Three", "s3@barracks.test", Role::Commando, None))
            .await
            .unwrap();

        let kpi = KpiDoc {
            title: "Mentor a recruit".into(),
            ..Default::default()
        };
        let report = d.notify_kpi_completed(&kpi, &completer, None).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(mailer.sent_to(), vec!["c2@barracks.test"]);
    }
}
