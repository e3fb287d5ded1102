//! MongoDB-backed entity store

use bson::{doc, oid::ObjectId, to_bson, Bson, DateTime, Document};
use tracing::debug;

use super::{EntityStore, KpiId, KpiQuery, StatusId, StatusQuery, UserId, UserQuery};
use crate::db::schemas::{
    EmailLogDoc, KpiDoc, KpiStats, KpiStatusDoc, Metadata, ProgressStatus, UserDoc,
    EMAIL_LOG_COLLECTION, KPI_COLLECTION, KPI_STATUS_COLLECTION, USER_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{BarracksError, Result};

/// Entity store over the four MongoDB collections
pub struct MongoStore {
    users: MongoCollection<UserDoc>,
    kpis: MongoCollection<KpiDoc>,
    statuses: MongoCollection<KpiStatusDoc>,
    email_logs: MongoCollection<EmailLogDoc>,
}

impl MongoStore {
    /// Open every collection, applying schema indexes
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            users: client.collection(USER_COLLECTION).await?,
            kpis: client.collection(KPI_COLLECTION).await?,
            statuses: client.collection(KPI_STATUS_COLLECTION).await?,
            email_logs: client.collection(EMAIL_LOG_COLLECTION).await?,
        })
    }
}

fn newest_first() -> Option<Document> {
    Some(doc! { "metadata.created_at": -1, "_id": -1 })
}

fn bson_of<T: serde::Serialize>(value: &T) -> Result<Bson> {
    to_bson(value).map_err(|e| BarracksError::Internal(format!("BSON encode failed: {}", e)))
}

#[async_trait::async_trait]
impl EntityStore for MongoStore {
    async fn insert_user(&self, mut user: UserDoc) -> Result<UserDoc> {
        user.metadata = Metadata::new();
        let id = self.users.insert_one(user.clone()).await?;
        user._id = Some(id);
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "_id": id }).await
    }

    async fn find_users(&self, query: &UserQuery) -> Result<Vec<UserDoc>> {
        self.users.find_many(query.to_document(), newest_first()).await
    }

    async fn update_user(&self, user: &UserDoc) -> Result<()> {
        let id = user
            ._id
            .ok_or_else(|| BarracksError::Validation("User has no id".into()))?;
        let set = doc! {
            "first_name": user.first_name.clone(),
            "last_name": user.last_name.clone(),
            "email": user.email.clone(),
            "role": user.role.as_str(),
            "battalion": user.battalion.map(|b| b.as_str()),
            "is_active": user.is_active,
            "metadata.updated_at": DateTime::now(),
        };
        let result = self
            .users
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await?;
        if result.matched_count == 0 {
            return Err(BarracksError::NotFound(format!("User {}", id)));
        }
        Ok(())
    }

    async fn insert_kpi(&self, mut kpi: KpiDoc) -> Result<KpiDoc> {
        kpi.metadata = Metadata::new();
        let id = self.kpis.insert_one(kpi.clone()).await?;
        kpi._id = Some(id);
        Ok(kpi)
    }

    async fn get_kpi(&self, id: KpiId) -> Result<Option<KpiDoc>> {
        self.kpis.find_one_any(doc! { "_id": id }).await
    }

    async fn find_kpis(&self, query: &KpiQuery) -> Result<Vec<KpiDoc>> {
        self.kpis.find_many(query.to_document(), newest_first()).await
    }

    async fn update_kpi_definition(&self, kpi: &KpiDoc, expected_version: i64) -> Result<bool> {
        let Some(id) = kpi._id else {
            return Ok(false);
        };
        let set = doc! {
            "title": kpi.title.clone(),
            "description": kpi.description.clone(),
            "category": kpi.category.as_str(),
            "priority": kpi.priority.as_str(),
            "last_modified_by": kpi.last_modified_by,
            "deadline": kpi.deadline,
            "status": kpi.status.as_str(),
            "targets": bson_of(&kpi.targets)?,
            "metadata.is_deleted": kpi.metadata.is_deleted,
            "metadata.deleted_at": kpi.metadata.deleted_at,
            "metadata.deleted_by": kpi.metadata.deleted_by,
        };
        self.kpis.update_versioned(id, expected_version, set).await
    }

    async fn write_stats(
        &self,
        id: KpiId,
        expected_version: i64,
        stats: &KpiStats,
    ) -> Result<bool> {
        let written = self
            .kpis
            .update_versioned(id, expected_version, doc! { "stats": bson_of(stats)? })
            .await?;
        if !written {
            debug!("Stats write for KPI {} lost version {}", id, expected_version);
        }
        Ok(written)
    }

    async fn insert_statuses(&self, statuses: Vec<KpiStatusDoc>) -> Result<usize> {
        self.statuses.insert_many_skip_duplicates(statuses).await
    }

    async fn get_status(&self, id: StatusId) -> Result<Option<KpiStatusDoc>> {
        self.statuses.find_one(doc! { "_id": id }).await
    }

    async fn find_statuses(&self, query: &StatusQuery) -> Result<Vec<KpiStatusDoc>> {
        self.statuses
            .find_many(query.to_document(), newest_first())
            .await
    }

    async fn count_statuses(&self, query: &StatusQuery) -> Result<u64> {
        self.statuses.count(query.to_document()).await
    }

    async fn set_status(
        &self,
        id: StatusId,
        status: ProgressStatus,
        progress: Option<i32>,
        marked_at: DateTime,
    ) -> Result<Option<KpiStatusDoc>> {
        let mut set = doc! {
            "status": status.as_str(),
            "marked_at": marked_at,
            "metadata.updated_at": DateTime::now(),
        };
        if let Some(progress) = progress {
            set.insert("progress", progress);
        }
        self.statuses
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": set })
            .await
    }

    async fn delete_statuses(&self, query: &StatusQuery) -> Result<u64> {
        self.statuses.delete_many(query.to_document()).await
    }

    async fn record_email(&self, log: EmailLogDoc) -> Result<()> {
        self.email_logs.insert_one(log).await.map(|_: ObjectId| ())
    }
}
