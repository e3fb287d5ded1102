//! Email delivery log schema

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for email logs
pub const EMAIL_LOG_COLLECTION: &str = "email_logs";

/// Outcome of one email delivery (after all retry attempts)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EmailLogDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub to: String,

    pub subject: String,

    pub success: bool,

    pub attempts: i32,

    /// Last error message when delivery failed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl IntoIndexes for EmailLogDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "to": 1, "metadata.created_at": -1 },
            Some(
                IndexOptions::builder()
                    .name("to_created_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for EmailLogDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
