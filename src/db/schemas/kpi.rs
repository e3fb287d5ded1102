//! KPI document schema
//!
//! A KPI carries its targeting rule and a denormalized stats block. The stats
//! block is derived data: only the stats aggregator writes it, always through
//! a version-checked update.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{Battalion, Category, KpiLifecycle, Metadata, Priority, Role};

/// Collection name for KPIs
pub const KPI_COLLECTION: &str = "kpis";

/// Maximum title length (after trimming)
pub const TITLE_MAX_LEN: usize = 200;

/// Maximum description length (after trimming)
pub const DESCRIPTION_MAX_LEN: usize = 1000;

/// Which members a KPI applies to
///
/// The selected set is the union of every populated field; `all_users`
/// short-circuits the rest.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Targets {
    #[serde(default)]
    pub all_users: bool,

    #[serde(default)]
    pub roles: BTreeSet<Role>,

    #[serde(default)]
    pub battalions: BTreeSet<Battalion>,

    #[serde(default)]
    pub specific_users: BTreeSet<ObjectId>,
}

/// Pre-aggregated progress counts for fast dashboard reads
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KpiStats {
    #[serde(default)]
    pub total_members: i64,

    #[serde(default)]
    pub not_started: i64,

    #[serde(default)]
    pub in_progress: i64,

    #[serde(default)]
    pub completed: i64,

    /// Share of members who started or finished, 0-100
    #[serde(default)]
    pub progress_percentage: i64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_updated: Option<DateTime>,
}

/// KPI document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KpiDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (timestamps, soft delete and deleting actor)
    #[serde(default)]
    pub metadata: Metadata,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub category: Category,

    #[serde(default)]
    pub priority: Priority,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<ObjectId>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_modified_by: Option<ObjectId>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline: Option<DateTime>,

    #[serde(default)]
    pub status: KpiLifecycle,

    /// Incremented by every write; conditional updates compare against it
    #[serde(default = "initial_version")]
    pub version: i64,

    #[serde(default)]
    pub targets: Targets,

    #[serde(default)]
    pub stats: KpiStats,
}

fn initial_version() -> i64 {
    1
}

impl Default for KpiDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            title: String::new(),
            description: String::new(),
            category: Category::default(),
            priority: Priority::default(),
            created_by: None,
            last_modified_by: None,
            deadline: None,
            status: KpiLifecycle::default(),
            version: initial_version(),
            targets: Targets::default(),
            stats: KpiStats::default(),
        }
    }
}

impl KpiDoc {
    /// Active and not soft-deleted
    pub fn is_live(&self) -> bool {
        self.status == KpiLifecycle::Active && !self.metadata.is_deleted
    }

    /// Whole days until the deadline, rounded up (negative once overdue)
    pub fn days_until_deadline(&self, now: DateTime) -> Option<i64> {
        let deadline = self.deadline?;
        let diff_ms = deadline.timestamp_millis() - now.timestamp_millis();
        Some(ceil_days(diff_ms))
    }
}

/// Milliseconds to whole days, rounding toward positive infinity
pub(crate) fn ceil_days(millis: i64) -> i64 {
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    millis.div_euclid(DAY_MS) + i64::from(millis.rem_euclid(DAY_MS) != 0)
}

impl IntoIndexes for KpiDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "status": 1, "metadata.is_deleted": 1, "metadata.created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("status_deleted_created_index".to_string())
                        .build(),
                ),
            ),
            // Separate target indexes avoid parallel-array compound indexes
            (
                doc! { "targets.all_users": 1 },
                Some(
                    IndexOptions::builder()
                        .name("targets_all_users_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "targets.roles": 1 },
                Some(
                    IndexOptions::builder()
                        .name("targets_roles_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "targets.battalions": 1 },
                Some(
                    IndexOptions::builder()
                        .name("targets_battalions_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "targets.specific_users": 1 },
                Some(
                    IndexOptions::builder()
                        .name("targets_specific_users_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "deadline": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("deadline_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for KpiDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_days() {
        const DAY_MS: i64 = 24 * 60 * 60 * 1000;
        assert_eq!(ceil_days(0), 0);
        assert_eq!(ceil_days(1), 1);
        assert_eq!(ceil_days(DAY_MS), 1);
        assert_eq!(ceil_days(DAY_MS + 1), 2);
        assert_eq!(ceil_days(-1), 0);
        assert_eq!(ceil_days(-DAY_MS), -1);
        assert_eq!(ceil_days(-DAY_MS - 1), -1);
    }

    #[test]
    fn test_targets_roundtrip_through_bson() {
        let mut targets = Targets::default();
        targets.roles.insert(Role::Commando);
        targets.battalions.insert(Battalion::Alpha);

        let doc = bson::to_document(&targets).unwrap();
        assert_eq!(doc.get_array("roles").unwrap().len(), 1);

        let back: Targets = bson::from_document(doc).unwrap();
        assert_eq!(back, targets);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let doc = doc! { "title": "Read chapter 1" };
        let kpi: KpiDoc = bson::from_document(doc).unwrap();
        assert_eq!(kpi.version, 1);
        assert_eq!(kpi.status, KpiLifecycle::Active);
        assert_eq!(kpi.stats.total_members, 0);
    }
}
