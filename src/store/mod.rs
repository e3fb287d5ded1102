//! Entity store abstraction
//!
//! Every service reads and writes through [`EntityStore`]. Two backends:
//! [`MongoStore`] for production and [`InMemoryStore`] for tests and
//! dev mode without a database.
//!
//! The KPI `stats` block is only ever written through
//! [`EntityStore::write_stats`], which succeeds only when the stored version
//! still equals the version the caller read.

mod memory;
mod mongo;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};

use crate::db::schemas::{
    Battalion, EmailLogDoc, KpiDoc, KpiLifecycle, KpiStats, KpiStatusDoc, ProgressStatus, Role,
    Targets, UserDoc,
};
use crate::db::without_deleted;
use crate::types::Result;

pub type UserId = ObjectId;
pub type KpiId = ObjectId;
pub type StatusId = ObjectId;

/// Persistence operations needed by the KPI core
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert a user, returning it with its assigned id
    async fn insert_user(&self, user: UserDoc) -> Result<UserDoc>;

    async fn get_user(&self, id: UserId) -> Result<Option<UserDoc>>;

    async fn find_users(&self, query: &UserQuery) -> Result<Vec<UserDoc>>;

    /// Overwrite the stored user's profile fields; `NotFound` if missing
    async fn update_user(&self, user: &UserDoc) -> Result<()>;

    /// Insert a KPI, returning it with its assigned id
    async fn insert_kpi(&self, kpi: KpiDoc) -> Result<KpiDoc>;

    /// Fetch a KPI by id, soft-deleted ones included
    async fn get_kpi(&self, id: KpiId) -> Result<Option<KpiDoc>>;

    async fn find_kpis(&self, query: &KpiQuery) -> Result<Vec<KpiDoc>>;

    /// Write every field of `kpi` except `stats`, if the stored version is
    /// still `expected_version`. Bumps the version. Returns false on mismatch.
    async fn update_kpi_definition(&self, kpi: &KpiDoc, expected_version: i64) -> Result<bool>;

    /// Replace the stats block if the stored version is still
    /// `expected_version`. Bumps the version. Returns false on mismatch.
    async fn write_stats(&self, id: KpiId, expected_version: i64, stats: &KpiStats)
        -> Result<bool>;

    /// Bulk insert status records, skipping any (kpi, user) pair that
    /// already has one. Returns how many were inserted.
    async fn insert_statuses(&self, statuses: Vec<KpiStatusDoc>) -> Result<usize>;

    async fn get_status(&self, id: StatusId) -> Result<Option<KpiStatusDoc>>;

    /// Matching status records, newest first
    async fn find_statuses(&self, query: &StatusQuery) -> Result<Vec<KpiStatusDoc>>;

    async fn count_statuses(&self, query: &StatusQuery) -> Result<u64>;

    /// Set status, progress (when given) and `marked_at` on one record,
    /// returning the updated record or `None` if it does not exist
    async fn set_status(
        &self,
        id: StatusId,
        status: ProgressStatus,
        progress: Option<i32>,
        marked_at: DateTime,
    ) -> Result<Option<KpiStatusDoc>>;

    /// Hard delete matching status records
    async fn delete_statuses(&self, query: &StatusQuery) -> Result<u64>;

    async fn record_email(&self, log: EmailLogDoc) -> Result<()>;
}

// ============================================================================
// Queries
// ============================================================================

/// Filter over users
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub ids: Option<Vec<UserId>>,
    pub role: Option<Role>,
    pub battalion: Option<Battalion>,
    pub active: Option<bool>,
}

impl UserQuery {
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_battalion(mut self, battalion: Battalion) -> Self {
        self.battalion = Some(battalion);
        self
    }

    pub fn to_document(&self) -> Document {
        let mut filter = doc! {};
        if let Some(ref ids) = self.ids {
            filter.insert("_id", doc! { "$in": ids.clone() });
        }
        if let Some(role) = self.role {
            filter.insert("role", role.as_str());
        }
        if let Some(battalion) = self.battalion {
            filter.insert("battalion", battalion.as_str());
        }
        if let Some(active) = self.active {
            filter.insert("is_active", active);
        }
        without_deleted(filter)
    }

    pub fn matches(&self, user: &UserDoc) -> bool {
        if user.metadata.is_deleted {
            return false;
        }
        if let Some(ref ids) = self.ids {
            if !user._id.is_some_and(|id| ids.contains(&id)) {
                return false;
            }
        }
        if self.role.is_some_and(|role| user.role != role) {
            return false;
        }
        if self.battalion.is_some() && user.battalion != self.battalion {
            return false;
        }
        if self.active.is_some_and(|active| user.is_active != active) {
            return false;
        }
        true
    }
}

/// A user's targeting-relevant attributes, used to find KPIs whose rule
/// could select that user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSubject {
    pub user: UserId,
    pub role: Role,
    pub battalion: Option<Battalion>,
}

impl TargetSubject {
    pub fn of(user: &UserDoc) -> Option<Self> {
        Some(Self {
            user: user._id?,
            role: user.role,
            battalion: user.battalion,
        })
    }

    /// Whether a rule selects a user with these attributes
    pub fn selected_by(&self, targets: &Targets) -> bool {
        targets.all_users
            || targets.roles.contains(&self.role)
            || self
                .battalion
                .is_some_and(|b| targets.battalions.contains(&b))
            || targets.specific_users.contains(&self.user)
    }

    fn to_clauses(&self) -> Vec<Bson> {
        let mut clauses = vec![
            Bson::Document(doc! { "targets.all_users": true }),
            Bson::Document(doc! { "targets.roles": self.role.as_str() }),
            Bson::Document(doc! { "targets.specific_users": self.user }),
        ];
        if let Some(battalion) = self.battalion {
            clauses.push(Bson::Document(
                doc! { "targets.battalions": battalion.as_str() },
            ));
        }
        clauses
    }
}

/// Filter over KPIs
#[derive(Debug, Clone, Default)]
pub struct KpiQuery {
    /// Lifecycle statuses to include (empty means any)
    pub statuses: Vec<KpiLifecycle>,
    pub include_deleted: bool,
    /// Deadline strictly before this instant
    pub deadline_before: Option<DateTime>,
    /// Deadline at or after this instant
    pub deadline_after: Option<DateTime>,
    /// Keep KPIs whose rule selects any of these subjects (empty means no
    /// targeting restriction)
    pub could_target: Vec<TargetSubject>,
}

impl KpiQuery {
    /// Non-deleted KPIs in the active lifecycle state
    pub fn active() -> Self {
        Self {
            statuses: vec![KpiLifecycle::Active],
            ..Default::default()
        }
    }

    pub fn all(include_deleted: bool) -> Self {
        Self {
            include_deleted,
            ..Default::default()
        }
    }

    pub fn to_document(&self) -> Document {
        let mut filter = doc! {};
        if !self.statuses.is_empty() {
            let statuses: Vec<&str> = self.statuses.iter().map(|s| s.as_str()).collect();
            filter.insert("status", doc! { "$in": statuses });
        }
        let mut deadline = doc! {};
        if let Some(before) = self.deadline_before {
            deadline.insert("$lt", before);
        }
        if let Some(after) = self.deadline_after {
            deadline.insert("$gte", after);
        }
        if !deadline.is_empty() {
            filter.insert("deadline", deadline);
        }
        if !self.could_target.is_empty() {
            let clauses: Vec<Bson> = self
                .could_target
                .iter()
                .flat_map(TargetSubject::to_clauses)
                .collect();
            filter.insert("$or", clauses);
        }
        if self.include_deleted {
            filter
        } else {
            without_deleted(filter)
        }
    }

    pub fn matches(&self, kpi: &KpiDoc) -> bool {
        if !self.include_deleted && kpi.metadata.is_deleted {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&kpi.status) {
            return false;
        }
        if self.deadline_before.is_some() || self.deadline_after.is_some() {
            let Some(deadline) = kpi.deadline else {
                return false;
            };
            if self.deadline_before.is_some_and(|before| deadline >= before) {
                return false;
            }
            if self.deadline_after.is_some_and(|after| deadline < after) {
                return false;
            }
        }
        if !self.could_target.is_empty()
            && !self
                .could_target
                .iter()
                .any(|subject| subject.selected_by(&kpi.targets))
        {
            return false;
        }
        true
    }
}

/// Filter over KPI status records
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub kpi: Option<KpiId>,
    pub user: Option<UserId>,
    pub users: Option<Vec<UserId>>,
    pub status: Option<ProgressStatus>,
    /// `marked_at` at or after this instant
    pub marked_after: Option<DateTime>,
    /// `marked_at` strictly before this instant
    pub marked_before: Option<DateTime>,
}

impl StatusQuery {
    pub fn for_kpi(kpi: KpiId) -> Self {
        Self {
            kpi: Some(kpi),
            ..Default::default()
        }
    }

    pub fn for_user(user: UserId) -> Self {
        Self {
            user: Some(user),
            ..Default::default()
        }
    }

    pub fn for_users(users: Vec<UserId>) -> Self {
        Self {
            users: Some(users),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Keep records marked within `[from, to)`
    pub fn marked_between(mut self, from: DateTime, to: DateTime) -> Self {
        self.marked_after = Some(from);
        self.marked_before = Some(to);
        self
    }

    pub fn to_document(&self) -> Document {
        let mut filter = doc! {};
        if let Some(kpi) = self.kpi {
            filter.insert("kpi", kpi);
        }
        if let Some(user) = self.user {
            filter.insert("user", user);
        } else if let Some(ref users) = self.users {
            filter.insert("user", doc! { "$in": users.clone() });
        }
        if let Some(status) = self.status {
            filter.insert("status", status.as_str());
        }
        let mut marked = doc! {};
        if let Some(after) = self.marked_after {
            marked.insert("$gte", after);
        }
        if let Some(before) = self.marked_before {
            marked.insert("$lt", before);
        }
        if !marked.is_empty() {
            filter.insert("marked_at", marked);
        }
        filter
    }

    pub fn matches(&self, record: &KpiStatusDoc) -> bool {
        if self.kpi.is_some_and(|kpi| record.kpi != kpi) {
            return false;
        }
        if let Some(user) = self.user {
            if record.user != user {
                return false;
            }
        } else if let Some(ref users) = self.users {
            if !users.contains(&record.user) {
                return false;
            }
        }
        if self.status.is_some_and(|status| record.status != status) {
            return false;
        }
        if self.marked_after.is_some() || self.marked_before.is_some() {
            let Some(marked) = record.marked_at else {
                return false;
            };
            if self.marked_after.is_some_and(|after| marked < after) {
                return false;
            }
            if self.marked_before.is_some_and(|before| marked >= before) {
                return false;
            }
        }
        true
    }
}
