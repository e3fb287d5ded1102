//! User document schema
//!
//! Members of the barracks: identity plus the attributes KPI targeting
//! selects on (role, battalion, active flag).

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{Battalion, Metadata, Role};

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UserDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at, is_deleted)
    #[serde(default)]
    pub metadata: Metadata,

    pub first_name: String,

    pub last_name: String,

    pub email: String,

    #[serde(default)]
    pub role: Role,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub battalion: Option<Battalion>,

    /// Inactive members keep their history but receive no new assignments
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl UserDoc {
    /// Create a new user document
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        role: Role,
        battalion: Option<Battalion>,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            role,
            battalion,
            is_active: true,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on email
            (
                doc! { "email": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("email_unique".to_string())
                        .build(),
                ),
            ),
            // Targeting lookups
            (
                doc! { "role": 1, "is_active": 1 },
                Some(
                    IndexOptions::builder()
                        .name("role_active_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "battalion": 1 },
                Some(
                    IndexOptions::builder()
                        .name("battalion_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for UserDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
