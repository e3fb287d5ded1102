//! JSON views of stored documents
//!
//! Documents keep BSON types (ObjectId, BSON dates); the HTTP surface and
//! the dashboard speak hex ids and RFC 3339 timestamps.

use bson::{oid::ObjectId, DateTime};
use serde::Serialize;

use crate::db::schemas::{
    Battalion, Category, KpiDoc, KpiLifecycle, KpiStats, KpiStatusDoc, Priority, ProgressStatus,
    Role, Targets, UserDoc,
};

pub fn iso(date: DateTime) -> String {
    date.to_chrono().to_rfc3339()
}

fn iso_opt(date: Option<DateTime>) -> Option<String> {
    date.map(iso)
}

fn hex(id: Option<ObjectId>) -> String {
    id.map(|id| id.to_hex()).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetsView {
    pub all_users: bool,
    pub roles: Vec<Role>,
    pub battalions: Vec<Battalion>,
    pub specific_users: Vec<String>,
}

impl From<&Targets> for TargetsView {
    fn from(t: &Targets) -> Self {
        Self {
            all_users: t.all_users,
            roles: t.roles.iter().copied().collect(),
            battalions: t.battalions.iter().copied().collect(),
            specific_users: t.specific_users.iter().map(|id| id.to_hex()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub total_members: i64,
    pub not_started: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub progress_percentage: i64,
    pub last_updated: Option<String>,
}

impl From<&KpiStats> for StatsView {
    fn from(s: &KpiStats) -> Self {
        Self {
            total_members: s.total_members,
            not_started: s.not_started,
            in_progress: s.in_progress,
            completed: s.completed,
            progress_percentage: s.progress_percentage,
            last_updated: iso_opt(s.last_updated),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub priority: Priority,
    pub status: KpiLifecycle,
    pub deadline: Option<String>,
    pub days_until_deadline: Option<i64>,
    pub created_by: Option<String>,
    pub last_modified_by: Option<String>,
    pub version: i64,
    pub targets: TargetsView,
    pub target_description: String,
    pub stats: StatsView,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl From<&KpiDoc> for KpiView {
    fn from(k: &KpiDoc) -> Self {
        Self {
            id: hex(k._id),
            title: k.title.clone(),
            description: k.description.clone(),
            category: k.category,
            priority: k.priority,
            status: k.status,
            deadline: iso_opt(k.deadline),
            days_until_deadline: k.days_until_deadline(DateTime::now()),
            created_by: k.created_by.map(|id| id.to_hex()),
            last_modified_by: k.last_modified_by.map(|id| id.to_hex()),
            version: k.version,
            targets: TargetsView::from(&k.targets),
            target_description: k.targets.describe(),
            stats: StatsView::from(&k.stats),
            is_deleted: k.metadata.is_deleted,
            deleted_at: iso_opt(k.metadata.deleted_at),
            deleted_by: k.metadata.deleted_by.map(|id| id.to_hex()),
            created_at: iso_opt(k.metadata.created_at),
            updated_at: iso_opt(k.metadata.updated_at),
        }
    }
}

/// Short KPI fields embedded in status listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiBrief {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub priority: Priority,
    pub deadline: Option<String>,
    pub created_at: Option<String>,
}

impl From<&KpiDoc> for KpiBrief {
    fn from(k: &KpiDoc) -> Self {
        Self {
            id: hex(k._id),
            title: k.title.clone(),
            description: k.description.clone(),
            category: k.category,
            priority: k.priority,
            deadline: iso_opt(k.deadline),
            created_at: iso_opt(k.metadata.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub id: String,
    pub user: String,
    pub kpi: String,
    pub status: ProgressStatus,
    pub progress: Option<i32>,
    pub marked_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl From<&KpiStatusDoc> for StatusView {
    fn from(s: &KpiStatusDoc) -> Self {
        Self {
            id: hex(s._id),
            user: s.user.to_hex(),
            kpi: s.kpi.to_hex(),
            status: s.status,
            progress: s.progress,
            marked_at: iso_opt(s.marked_at),
            created_at: iso_opt(s.metadata.created_at),
            updated_at: iso_opt(s.metadata.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub battalion: Option<Battalion>,
    pub is_active: bool,
    pub created_at: Option<String>,
}

impl From<&UserDoc> for UserView {
    fn from(u: &UserDoc) -> Self {
        Self {
            id: hex(u._id),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            full_name: u.full_name(),
            email: u.email.clone(),
            role: u.role,
            battalion: u.battalion,
            is_active: u.is_active,
            created_at: iso_opt(u.metadata.created_at),
        }
    }
}
