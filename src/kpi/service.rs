//! KPI lifecycle flows
//!
//! Creation, edits, soft deletion and status updates, each wiring the store,
//! target resolver, ledger, stats and notifications together. Notifications
//! are spawned off the calling task and never affect the returned result.

use bson::DateTime;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{
    Category, KpiDoc, KpiLifecycle, KpiStats, KpiStatusDoc, Priority, ProgressStatus, Targets,
    DESCRIPTION_MAX_LEN, TITLE_MAX_LEN,
};
use crate::kpi::ledger::StatusLedger;
use crate::kpi::stats::StatsAggregator;
use crate::kpi::targets::{resolve_targets, LegacyAssignment};
use crate::notify::{now_timestamp, NotificationDispatcher, PushEvent};
use crate::store::{EntityStore, KpiId, KpiQuery, StatusId, UserId, UserQuery};
use crate::types::{BarracksError, Result};

/// Writes retried when a concurrent stats refresh moved the version
const DEFINITION_WRITE_ATTEMPTS: u32 = 5;

/// Input for a new KPI
#[derive(Debug, Clone, Default)]
pub struct NewKpi {
    pub title: String,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub deadline: Option<DateTime>,
    pub targets: Option<Targets>,
    /// Older single-field assignment shapes, merged into `targets`
    pub legacy: LegacyAssignment,
}

/// Partial edit of a KPI; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct KpiUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub deadline: Option<DateTime>,
    pub status: Option<KpiLifecycle>,
    pub targets: Option<Targets>,
    /// When set, the edit only applies to exactly this version
    pub expected_version: Option<i64>,
}

/// Result of creating a KPI
#[derive(Debug, Clone)]
pub struct CreatedKpi {
    pub kpi: KpiDoc,
    pub target_count: usize,
    pub warning: Option<String>,
}

pub struct KpiService {
    store: Arc<dyn EntityStore>,
    ledger: Arc<StatusLedger>,
    stats: Arc<StatsAggregator>,
    dispatcher: Arc<NotificationDispatcher>,
}

fn clean_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(BarracksError::Validation("Title is required".into()));
    }
    if title.chars().count() > TITLE_MAX_LEN {
        return Err(BarracksError::Validation(format!(
            "Title cannot exceed {} characters",
            TITLE_MAX_LEN
        )));
    }
    Ok(title.to_string())
}

fn clean_description(description: &str) -> Result<String> {
    let description = description.trim();
    if description.chars().count() > DESCRIPTION_MAX_LEN {
        return Err(BarracksError::Validation(format!(
            "Description cannot exceed {} characters",
            DESCRIPTION_MAX_LEN
        )));
    }
    Ok(description.to_string())
}

fn check_future(deadline: DateTime, now: DateTime) -> Result<()> {
    if deadline <= now {
        return Err(BarracksError::Validation(
            "Deadline must be in the future".into(),
        ));
    }
    Ok(())
}

/// Apply `update` to `kpi` in place; returns whether the targeting rule
/// changed
fn apply_update(kpi: &mut KpiDoc, update: &KpiUpdate, now: DateTime) -> Result<bool> {
    if let Some(ref title) = update.title {
        kpi.title = clean_title(title)?;
    }
    if let Some(ref description) = update.description {
        kpi.description = clean_description(description)?;
    }
    if let Some(category) = update.category {
        kpi.category = category;
    }
    if let Some(priority) = update.priority {
        kpi.priority = priority;
    }
    if let Some(deadline) = update.deadline {
        if kpi.deadline != Some(deadline) {
            check_future(deadline, now)?;
            kpi.deadline = Some(deadline);
        }
    }
    if let Some(status) = update.status {
        if status == KpiLifecycle::Cancelled {
            return Err(BarracksError::Validation(
                "Use delete to cancel a KPI".into(),
            ));
        }
        kpi.status = status;
    }
    let mut targets_changed = false;
    if let Some(ref targets) = update.targets {
        targets.validate()?;
        targets_changed = *targets != kpi.targets;
        kpi.targets = targets.clone();
    }
    Ok(targets_changed)
}

impl KpiService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        ledger: Arc<StatusLedger>,
        stats: Arc<StatsAggregator>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            ledger,
            stats,
            dispatcher,
        }
    }

    /// Validate, persist and assign a new KPI
    ///
    /// Nothing is written when validation fails. A rule that currently
    /// matches nobody is accepted with a warning.
    pub async fn create_kpi(&self, actor: UserId, new: NewKpi) -> Result<CreatedKpi> {
        let now = DateTime::now();
        let title = clean_title(&new.title)?;
        let description = clean_description(new.description.as_deref().unwrap_or(""))?;
        if let Some(deadline) = new.deadline {
            check_future(deadline, now)?;
        }
        let mut targets = new.targets.unwrap_or_default();
        new.legacy.apply_to(&mut targets)?;
        targets.validate()?;

        let kpi = self
            .store
            .insert_kpi(KpiDoc {
                title,
                description,
                category: new.category.unwrap_or_default(),
                priority: new.priority.unwrap_or_default(),
                created_by: Some(actor),
                last_modified_by: Some(actor),
                deadline: new.deadline,
                status: KpiLifecycle::Active,
                version: 1,
                targets,
                stats: KpiStats::default(),
                ..Default::default()
            })
            .await?;
        let kpi_id = kpi
            ._id
            .ok_or_else(|| BarracksError::Internal("Inserted KPI has no id".into()))?;

        let catalog = self.store.find_users(&UserQuery::active()).await?;
        let resolution = resolve_targets(&kpi.targets, &catalog);
        let target_count = resolution.target_count();
        self.ledger
            .create_for_targets(kpi_id, &resolution.user_ids)
            .await?;

        info!(
            kpi = %kpi_id,
            actor = %actor,
            target_count,
            targets = %kpi.targets.describe(),
            "KPI created"
        );

        let kpi = self.store.get_kpi(kpi_id).await?.unwrap_or(kpi);

        self.dispatcher.push().broadcast(PushEvent::KpiCreated {
            timestamp: now_timestamp(),
            kpi_id: kpi_id.to_hex(),
            title: kpi.title.clone(),
            target_count,
        });

        let assignees: Vec<_> = catalog
            .into_iter()
            .filter(|u| u._id.is_some_and(|id| resolution.user_ids.contains(&id)))
            .collect();
        if !assignees.is_empty() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let notice = kpi.clone();
            tokio::spawn(async move {
                dispatcher.notify_kpi_assigned(&notice, &assignees).await;
            });
        }

        let warning = (target_count == 0)
            .then(|| "No active users currently match the targeting rule".to_string());
        if let Some(ref w) = warning {
            warn!(kpi = %kpi_id, "{}", w);
        }

        Ok(CreatedKpi {
            kpi,
            target_count,
            warning,
        })
    }

    /// A non-deleted KPI
    pub async fn get_kpi(&self, id: KpiId) -> Result<KpiDoc> {
        match self.store.get_kpi(id).await? {
            Some(kpi) if !kpi.metadata.is_deleted => Ok(kpi),
            _ => Err(BarracksError::NotFound(format!("KPI {}", id))),
        }
    }

    pub async fn list_kpis(&self, include_deleted: bool) -> Result<Vec<KpiDoc>> {
        self.store.find_kpis(&KpiQuery::all(include_deleted)).await
    }

    pub async fn find_active(&self) -> Result<Vec<KpiDoc>> {
        self.store.find_kpis(&KpiQuery::active()).await
    }

    /// Edit a KPI's definition
    ///
    /// With `expected_version` the edit fails with a conflict unless the
    /// stored version matches. Without it, the edit is reapplied on top of
    /// concurrent stats refreshes. New targets are assigned idempotently.
    pub async fn update_kpi(&self, actor: UserId, id: KpiId, update: KpiUpdate) -> Result<KpiDoc> {
        let now = DateTime::now();
        let mut attempt = 0;
        let (kpi, targets_changed) = loop {
            attempt += 1;
            let mut kpi = self.get_kpi(id).await?;
            if let Some(expected) = update.expected_version {
                if kpi.version != expected {
                    return Err(BarracksError::Conflict(format!(
                        "KPI {} is at version {}, not {}",
                        id, kpi.version, expected
                    )));
                }
            }
            let version = kpi.version;
            let targets_changed = apply_update(&mut kpi, &update, now)?;
            kpi.last_modified_by = Some(actor);

            if self.store.update_kpi_definition(&kpi, version).await? {
                kpi.version = version + 1;
                break (kpi, targets_changed);
            }
            if update.expected_version.is_some() || attempt >= DEFINITION_WRITE_ATTEMPTS {
                return Err(BarracksError::Conflict(format!(
                    "KPI {} was modified concurrently",
                    id
                )));
            }
            debug!(kpi = %id, attempt, "KPI definition write lost version race");
        };

        info!(kpi = %id, actor = %actor, targets_changed, "KPI updated");

        if targets_changed && kpi.status == KpiLifecycle::Active {
            let catalog = self.store.find_users(&UserQuery::active()).await?;
            let resolution = resolve_targets(&kpi.targets, &catalog);
            let assigned: HashSet<UserId> = self
                .ledger
                .find_by_kpi(id)
                .await?
                .into_iter()
                .map(|s| s.user)
                .collect();
            let added = self
                .ledger
                .create_for_targets(id, &resolution.user_ids)
                .await?;
            if added > 0 {
                let assignees: Vec<_> = catalog
                    .into_iter()
                    .filter(|u| {
                        u._id.is_some_and(|uid| {
                            !assigned.contains(&uid) && resolution.user_ids.contains(&uid)
                        })
                    })
                    .collect();
                let dispatcher = Arc::clone(&self.dispatcher);
                let notice = kpi.clone();
                tokio::spawn(async move {
                    dispatcher.notify_kpi_assigned(&notice, &assignees).await;
                });
            }
        }

        self.dispatcher.push().broadcast(PushEvent::KpiUpdated {
            timestamp: now_timestamp(),
            kpi_id: id.to_hex(),
            title: kpi.title.clone(),
        });

        self.get_kpi(id).await
    }

    /// Soft-delete a KPI and remove its status records
    pub async fn soft_delete(&self, actor: UserId, id: KpiId) -> Result<KpiDoc> {
        let mut attempt = 0;
        let kpi = loop {
            attempt += 1;
            let mut kpi = self.get_kpi(id).await?;
            let version = kpi.version;
            kpi.metadata.mark_deleted(actor);
            kpi.status = KpiLifecycle::Cancelled;
            kpi.last_modified_by = Some(actor);
            if self.store.update_kpi_definition(&kpi, version).await? {
                kpi.version = version + 1;
                break kpi;
            }
            if attempt >= DEFINITION_WRITE_ATTEMPTS {
                return Err(BarracksError::Conflict(format!(
                    "KPI {} was modified concurrently",
                    id
                )));
            }
        };

        let removed = self.ledger.delete_all_for_kpi(id).await?;
        info!(kpi = %id, actor = %actor, removed, "KPI soft-deleted");

        self.dispatcher.push().broadcast(PushEvent::KpiDeleted {
            timestamp: now_timestamp(),
            kpi_id: id.to_hex(),
        });
        Ok(kpi)
    }

    pub async fn statuses_for(&self, id: KpiId) -> Result<Vec<KpiStatusDoc>> {
        self.get_kpi(id).await?;
        self.ledger.find_by_kpi(id).await
    }

    /// Record a member's progress and tell whoever should know
    pub async fn update_status(
        &self,
        actor: UserId,
        status_id: StatusId,
        status: &str,
        progress: Option<i64>,
    ) -> Result<KpiStatusDoc> {
        let record = self.ledger.update_status(status_id, status, progress).await?;
        info!(
            status_record = %status_id,
            actor = %actor,
            status = %record.status,
            "KPI status changed"
        );

        let progress_percentage = match self.store.get_kpi(record.kpi).await {
            Ok(Some(kpi)) => kpi.stats.progress_percentage,
            _ => 0,
        };
        let event = PushEvent::KpiStatusChanged {
            timestamp: now_timestamp(),
            kpi_id: record.kpi.to_hex(),
            user_id: record.user.to_hex(),
            status: record.status.to_string(),
            progress_percentage,
        };
        let push = self.dispatcher.push();
        push.send_to_user(record.user, event.clone());
        push.broadcast(event);

        if record.status == ProgressStatus::Done {
            let store = Arc::clone(&self.store);
            let dispatcher = Arc::clone(&self.dispatcher);
            let done = record.clone();
            tokio::spawn(async move {
                let (kpi, user) = match tokio::try_join!(store.get_kpi(done.kpi), store.get_user(done.user)) {
                    Ok((Some(kpi), Some(user))) => (kpi, user),
                    Ok(_) => return,
                    Err(e) => {
                        warn!("Skipping completion notice for {:?}: {}", done._id, e);
                        return;
                    }
                };
                dispatcher
                    .notify_kpi_completed(&kpi, &user, done.marked_at)
                    .await;
            });
        }

        Ok(record)
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{Battalion, Role, UserDoc};
    use crate::kpi::stats::StatsConfig;
    use crate::notify::{DispatchConfig, LogMailer, PushHub};
    use crate::store::{InMemoryStore, StatusQuery};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        push: Arc<PushHub>,
        service: KpiService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let stats = Arc::new(StatsAggregator::new(
            store.clone(),
            StatsConfig {
                backoff_ms: 1,
                ..Default::default()
            },
        ));
        let ledger = Arc::new(StatusLedger::new(store.clone(), Arc::clone(&stats)));
        let push = Arc::new(PushHub::new(Duration::from_secs(30)));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(LogMailer),
            store.clone(),
            Arc::clone(&push),
            DispatchConfig {
                backoff_ms: 1,
                ..Default::default()
            },
        ));
        let service = KpiService::new(store.clone(), ledger, stats, dispatcher);
        Fixture {
            store,
            push,
            service,
        }
    }

    async fn add_user(f: &Fixture, role: Role, battalion: Option<Battalion>) -> UserId {
        f.store
            .insert_user(UserDoc::new(
                "Test",
                "User",
                format!("{}@barracks.test", bson::oid::ObjectId::new()),
                role,
                battalion,
            ))
            .await
            .unwrap()
            ._id
            .unwrap()
    }

    fn future(days: i64) -> DateTime {
        DateTime::from_millis(DateTime::now().timestamp_millis() + days * 24 * 60 * 60 * 1000)
    }

    #[tokio::test]
    async fn test_create_assigns_union_of_targets() {
        let f = fixture();
        for _ in 0..5 {
            add_user(&f, Role::Commando, Some(Battalion::Alpha)).await;
        }
        for _ in 0..3 {
            add_user(&f, Role::Commander, Some(Battalion::Bravo)).await;
        }
        let actor = add_user(&f, Role::Commander, None).await;

        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "  Memorize Psalm 23  ".into(),
                    deadline: Some(future(7)),
                    targets: Some(Targets {
                        roles: [Role::Commando].into_iter().collect(),
                        battalions: [Battalion::Alpha].into_iter().collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(created.target_count, 5);
        assert!(created.warning.is_none());
        assert_eq!(created.kpi.title, "Memorize Psalm 23");
        assert_eq!(created.kpi.stats.total_members, 5);
        assert_eq!(created.kpi.stats.not_started, 5);
    }

    #[tokio::test]
    async fn test_empty_rule_persists_nothing() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        let err = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Orphan".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BarracksError::Validation(_)));
        assert!(f.service.list_kpis(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        let all = Some(Targets {
            all_users: true,
            ..Default::default()
        });

        let past = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Late".into(),
                    deadline: Some(future(-1)),
                    targets: all.clone(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(past, Err(BarracksError::Validation(_))));

        let long = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "x".repeat(TITLE_MAX_LEN + 1),
                    targets: all,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(long, Err(BarracksError::Validation(_))));
    }

    #[tokio::test]
    async fn test_zero_targets_is_a_warning() {
        let f = fixture();
        let actor = add_user(&f, Role::Commando, None).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Delta only".into(),
                    legacy: LegacyAssignment {
                        battalion: Some(Battalion::Delta),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.target_count, 0);
        assert!(created.warning.is_some());
    }

    #[tokio::test]
    async fn test_soft_delete_excludes_and_cascades() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        add_user(&f, Role::Commando, None).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Temporary".into(),
                    targets: Some(Targets {
                        all_users: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = created.kpi._id.unwrap();
        assert_eq!(created.target_count, 2);

        let deleted = f.service.soft_delete(actor, id).await.unwrap();
        assert!(deleted.metadata.is_deleted);
        assert_eq!(deleted.metadata.deleted_by, Some(actor));
        assert_eq!(deleted.status, KpiLifecycle::Cancelled);

        assert!(f.service.find_active().await.unwrap().is_empty());
        assert!(matches!(
            f.service.get_kpi(id).await,
            Err(BarracksError::NotFound(_))
        ));
        assert_eq!(
            f.store
                .count_statuses(&StatusQuery::for_kpi(id))
                .await
                .unwrap(),
            0
        );
        // still listed for audit
        assert_eq!(f.service.list_kpis(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Versioned".into(),
                    targets: Some(Targets {
                        all_users: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = created.kpi._id.unwrap();
        let version = created.kpi.version;

        let updated = f
            .service
            .update_kpi(
                actor,
                id,
                KpiUpdate {
                    title: Some("Versioned v2".into()),
                    expected_version: Some(version),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Versioned v2");
        assert_eq!(updated.version, version + 1);

        let stale = f
            .service
            .update_kpi(
                actor,
                id,
                KpiUpdate {
                    title: Some("Versioned v3".into()),
                    expected_version: Some(version),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(stale, Err(BarracksError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_retargeting_assigns_new_members() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        add_user(&f, Role::Commando, Some(Battalion::Charlie)).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Commanders first".into(),
                    targets: Some(Targets {
                        roles: [Role::Commander].into_iter().collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.target_count, 1);
        let id = created.kpi._id.unwrap();

        let updated = f
            .service
            .update_kpi(
                actor,
                id,
                KpiUpdate {
                    targets: Some(Targets {
                        roles: [Role::Commander].into_iter().collect(),
                        battalions: [Battalion::Charlie].into_iter().collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.stats.total_members, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_status_updates_are_both_counted() {
        let f = fixture();
        let actor = add_user(&f, Role::Commander, None).await;
        add_user(&f, Role::Commando, None).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Race".into(),
                    targets: Some(Targets {
                        all_users: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let id = created.kpi._id.unwrap();
        let records = f.service.statuses_for(id).await.unwrap();
        assert_eq!(records.len(), 2);
        let (a, b) = (records[0]._id.unwrap(), records[1]._id.unwrap());

        let service = Arc::new(f.service);
        let spawn_done = |status| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.update_status(actor, status, "done", None).await })
        };
        let (ra, rb) = tokio::join!(spawn_done(a), spawn_done(b));
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        let kpi = service.get_kpi(id).await.unwrap();
        assert_eq!(kpi.stats.completed, 2);
        assert_eq!(kpi.stats.progress_percentage, 100);
    }

    #[tokio::test]
    async fn test_status_change_is_pushed() {
        let f = fixture();
        let mut rx = f.push.subscribe();
        let actor = add_user(&f, Role::Commander, None).await;
        let created = f
            .service
            .create_kpi(
                actor,
                NewKpi {
                    title: "Push me".into(),
                    targets: Some(Targets {
                        specific_users: [actor].into_iter().collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let created_event = rx.recv().await.unwrap();
        assert!(matches!(created_event.event, PushEvent::KpiCreated { target_count: 1, .. }));

        let record = f.service.statuses_for(created.kpi._id.unwrap()).await.unwrap()[0].clone();
        f.service
            .update_status(actor, record._id.unwrap(), "in_progress", Some(30))
            .await
            .unwrap();

        let to_user = rx.recv().await.unwrap();
        assert!(to_user.is_for(Some(actor)));
        assert!(!to_user.is_for(None));
        match to_user.event {
            PushEvent::KpiStatusChanged {
                status,
                progress_percentage,
                ..
            } => {
                assert_eq!(status, "in_progress");
                assert_eq!(progress_percentage, 100);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let to_all = rx.recv().await.unwrap();
        assert!(to_all.is_for(None));
    }
}
