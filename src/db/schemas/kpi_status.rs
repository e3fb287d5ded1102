//! KPI status document schema
//!
//! One record per (user, KPI) pair, backed by a unique compound index.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{Metadata, ProgressStatus};

/// Collection name for KPI status records
pub const KPI_STATUS_COLLECTION: &str = "kpi_statuses";

/// A member's progress record against one KPI
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KpiStatusDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user: ObjectId,

    pub kpi: ObjectId,

    #[serde(default)]
    pub status: ProgressStatus,

    /// Optional self-reported progress, 0-100
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<i32>,

    /// Set on every status transition
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub marked_at: Option<DateTime>,
}

impl KpiStatusDoc {
    /// New pending record for `user` on `kpi`
    pub fn pending(user: ObjectId, kpi: ObjectId) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user,
            kpi,
            status: ProgressStatus::Pending,
            progress: None,
            marked_at: None,
        }
    }
}

impl Default for KpiStatusDoc {
    fn default() -> Self {
        Self::pending(ObjectId::new(), ObjectId::new())
    }
}

impl IntoIndexes for KpiStatusDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Exactly one record per (kpi, user)
            (
                doc! { "kpi": 1, "user": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("kpi_user_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "user": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("user_status_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "status": 1, "marked_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("status_marked_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for KpiStatusDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
