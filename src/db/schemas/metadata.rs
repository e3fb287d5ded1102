//! Common metadata for all documents
//!
//! Tracks creation, update, and soft deletion (with the deleting actor).

use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

/// Common metadata for all documents
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Whether this document has been soft-deleted
    #[serde(default)]
    pub is_deleted: bool,

    /// When the document was soft-deleted
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<DateTime>,

    /// Who soft-deleted the document
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted_by: Option<ObjectId>,

    /// When the document was last updated
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_at: Option<DateTime>,

    /// When the document was created
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at: Option<DateTime>,
}

impl Metadata {
    /// Create new metadata with current timestamp
    pub fn new() -> Self {
        let now = DateTime::now();
        Self {
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            updated_at: Some(now),
            created_at: Some(now),
        }
    }

    /// Mark as soft-deleted by `actor`
    pub fn mark_deleted(&mut self, actor: ObjectId) {
        let now = DateTime::now();
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.deleted_by = Some(actor);
        self.updated_at = Some(now);
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(DateTime::now());
    }
}
