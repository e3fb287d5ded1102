//! In-memory entity store for tests and database-less dev mode

use bson::{oid::ObjectId, DateTime};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{EntityStore, KpiId, KpiQuery, StatusId, StatusQuery, UserId, UserQuery};
use crate::db::schemas::{
    EmailLogDoc, KpiDoc, KpiStats, KpiStatusDoc, Metadata, ProgressStatus, UserDoc,
};
use crate::types::{BarracksError, Result};

/// Entity store backed by hash maps behind async locks
#[derive(Default)]
pub struct InMemoryStore {
    users: Arc<RwLock<HashMap<UserId, UserDoc>>>,
    kpis: Arc<RwLock<HashMap<KpiId, KpiDoc>>>,
    statuses: Arc<RwLock<HashMap<StatusId, KpiStatusDoc>>>,
    email_logs: Arc<RwLock<Vec<EmailLogDoc>>>,
    /// Stats writes that will lose to a simulated concurrent writer
    forced_conflicts: AtomicUsize,
    /// Status reads that will fail as if the database were unreachable
    forced_read_failures: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` stats writes fail as if another writer bumped the
    /// KPI version first
    pub fn inject_stats_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` status lookups fail with a database error
    pub fn inject_status_read_failures(&self, n: usize) {
        self.forced_read_failures.store(n, Ordering::SeqCst);
    }

    /// Every email log written so far
    pub async fn email_logs(&self) -> Vec<EmailLogDoc> {
        self.email_logs.read().await.clone()
    }

    fn take_forced_conflict(&self) -> bool {
        take_one(&self.forced_conflicts)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (Option<DateTime>, Option<ObjectId>)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[async_trait::async_trait]
impl EntityStore for InMemoryStore {
    async fn insert_user(&self, mut user: UserDoc) -> Result<UserDoc> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(BarracksError::Validation(format!(
                "Email '{}' is already registered",
                user.email
            )));
        }
        let id = ObjectId::new();
        user._id = Some(id);
        user.metadata = Metadata::new();
        users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<UserDoc>> {
        Ok(self
            .users
            .read()
            .await
            .get(&id)
            .filter(|u| !u.metadata.is_deleted)
            .cloned())
    }

    async fn find_users(&self, query: &UserQuery) -> Result<Vec<UserDoc>> {
        let mut found: Vec<UserDoc> = self
            .users
            .read()
            .await
            .values()
            .filter(|u| query.matches(u))
            .cloned()
            .collect();
        newest_first(&mut found, |u| (u.metadata.created_at, u._id));
        Ok(found)
    }

    async fn update_user(&self, user: &UserDoc) -> Result<()> {
        let id = user
            ._id
            .ok_or_else(|| BarracksError::Validation("User has no id".into()))?;
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(&id)
            .ok_or_else(|| BarracksError::NotFound(format!("User {}", id)))?;
        let created_at = stored.metadata.created_at;
        *stored = user.clone();
        stored.metadata.created_at = created_at;
        stored.metadata.touch();
        Ok(())
    }

    async fn insert_kpi(&self, mut kpi: KpiDoc) -> Result<KpiDoc> {
        let id = ObjectId::new();
        kpi._id = Some(id);
        kpi.metadata = Metadata::new();
        self.kpis.write().await.insert(id, kpi.clone());
        Ok(kpi)
    }

    async fn get_kpi(&self, id: KpiId) -> Result<Option<KpiDoc>> {
        Ok(self.kpis.read().await.get(&id).cloned())
    }

    async fn find_kpis(&self, query: &KpiQuery) -> Result<Vec<KpiDoc>> {
        let mut found: Vec<KpiDoc> = self
            .kpis
            .read()
            .await
            .values()
            .filter(|k| query.matches(k))
            .cloned()
            .collect();
        newest_first(&mut found, |k| (k.metadata.created_at, k._id));
        Ok(found)
    }

    async fn update_kpi_definition(&self, kpi: &KpiDoc, expected_version: i64) -> Result<bool> {
        let Some(id) = kpi._id else {
            return Ok(false);
        };
        let mut kpis = self.kpis.write().await;
        let Some(stored) = kpis.get_mut(&id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }
        let stats = stored.stats.clone();
        let created_at = stored.metadata.created_at;
        *stored = kpi.clone();
        stored.stats = stats;
        stored.metadata.created_at = created_at;
        stored.metadata.touch();
        stored.version = expected_version + 1;
        Ok(true)
    }

    async fn write_stats(
        &self,
        id: KpiId,
        expected_version: i64,
        stats: &KpiStats,
    ) -> Result<bool> {
        let mut kpis = self.kpis.write().await;
        let Some(stored) = kpis.get_mut(&id) else {
            return Ok(false);
        };
        if self.take_forced_conflict() {
            stored.version += 1;
            return Ok(false);
        }
        if stored.version != expected_version {
            return Ok(false);
        }
        stored.stats = stats.clone();
        stored.metadata.touch();
        stored.version = expected_version + 1;
        Ok(true)
    }

    async fn insert_statuses(&self, records: Vec<KpiStatusDoc>) -> Result<usize> {
        let mut statuses = self.statuses.write().await;
        let mut inserted = 0;
        for mut record in records {
            let exists = statuses
                .values()
                .any(|s| s.kpi == record.kpi && s.user == record.user);
            if exists {
                continue;
            }
            let id = ObjectId::new();
            record._id = Some(id);
            record.metadata = Metadata::new();
            statuses.insert(id, record);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_status(&self, id: StatusId) -> Result<Option<KpiStatusDoc>> {
        Ok(self.statuses.read().await.get(&id).cloned())
    }

    async fn find_statuses(&self, query: &StatusQuery) -> Result<Vec<KpiStatusDoc>> {
        if take_one(&self.forced_read_failures) {
            return Err(BarracksError::Database("status lookup unavailable".to_string()));
        }
        let mut found: Vec<KpiStatusDoc> = self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        newest_first(&mut found, |s| (s.metadata.created_at, s._id));
        Ok(found)
    }

    async fn count_statuses(&self, query: &StatusQuery) -> Result<u64> {
        Ok(self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| query.matches(s))
            .count() as u64)
    }

    async fn set_status(
        &self,
        id: StatusId,
        status: ProgressStatus,
        progress: Option<i32>,
        marked_at: DateTime,
    ) -> Result<Option<KpiStatusDoc>> {
        let mut statuses = self.statuses.write().await;
        let Some(record) = statuses.get_mut(&id) else {
            return Ok(None);
        };
        record.status = status;
        if progress.is_some() {
            record.progress = progress;
        }
        record.marked_at = Some(marked_at);
        record.metadata.touch();
        Ok(Some(record.clone()))
    }

    async fn delete_statuses(&self, query: &StatusQuery) -> Result<u64> {
        let mut statuses = self.statuses.write().await;
        let before = statuses.len();
        statuses.retain(|_, s| !query.matches(s));
        Ok((before - statuses.len()) as u64)
    }

    async fn record_email(&self, mut log: EmailLogDoc) -> Result<()> {
        log._id = Some(ObjectId::new());
        log.metadata = Metadata::new();
        self.email_logs.write().await.push(log);
        Ok(())
    }
}
