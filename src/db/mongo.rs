//! MongoDB client and collection wrapper
//!
//! Typed collections apply schema-declared indexes on open and keep the
//! metadata timestamps current on insert.

use bson::{doc, oid::ObjectId, DateTime, Document};
use futures_util::StreamExt;
use mongodb::{
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info, warn};

use crate::db::schemas::Metadata;
use crate::types::{BarracksError, Result};

/// Server error code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| BarracksError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BarracksError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    /// Create a new collection and apply indexes
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| BarracksError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert a document, setting metadata timestamps
    pub async fn insert_one(&self, mut item: T) -> Result<ObjectId> {
        stamp_new(item.mut_metadata());

        let result = self.inner.insert_one(item).await.map_err(|e| {
            if is_duplicate_key(&e) {
                BarracksError::Validation("Document already exists".into())
            } else {
                BarracksError::Database(format!("Insert failed: {}", e))
            }
        })?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| BarracksError::Database("Failed to get inserted ID".into()))
    }

    /// Unordered bulk insert that skips documents rejected by a unique index
    ///
    /// Returns the number of documents actually inserted.
    pub async fn insert_many_skip_duplicates(&self, mut items: Vec<T>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        for item in items.iter_mut() {
            stamp_new(item.mut_metadata());
        }
        let requested = items.len();

        match self.inner.insert_many(items).ordered(false).await {
            Ok(result) => Ok(result.inserted_ids.len()),
            Err(e) => match *e.kind {
                ErrorKind::InsertMany(ref failure) => {
                    let write_errors = failure.write_errors.as_deref().unwrap_or_default();
                    if let Some(other) = write_errors.iter().find(|w| w.code != DUPLICATE_KEY_CODE) {
                        return Err(BarracksError::Database(format!(
                            "Bulk insert failed: {}",
                            other.message
                        )));
                    }
                    if write_errors.len() > 0 {
                        warn!(
                            "Bulk insert skipped {} of {} documents already present",
                            write_errors.len(),
                            requested
                        );
                    }
                    Ok(requested - write_errors.len())
                }
                _ => Err(BarracksError::Database(format!("Bulk insert failed: {}", e))),
            },
        }
    }

    /// Find one non-deleted document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.find_one_any(without_deleted(filter)).await
    }

    /// Find one document by filter, soft-deleted documents included
    pub async fn find_one_any(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| BarracksError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter (soft-delete handling is up to the filter)
    pub async fn find_many(&self, filter: Document, sort: Option<Document>) -> Result<Vec<T>> {
        let find = self.inner.find(filter);
        let find = match sort {
            Some(sort) => find.sort(sort),
            None => find,
        };
        let cursor = find
            .await
            .map_err(|e| BarracksError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Count documents matching a filter
    pub async fn count(&self, filter: Document) -> Result<u64> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(|e| BarracksError::Database(format!("Count failed: {}", e)))
    }

    /// Update one document
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update.into())
            .await
            .map_err(|e| BarracksError::Database(format!("Update failed: {}", e)))
    }

    /// Update one document only if its `version` still equals `expected`
    ///
    /// `$inc`s the version alongside `set`. Returns false when the document
    /// moved on (or is gone), so the caller can reload and retry.
    pub async fn update_versioned(
        &self,
        id: ObjectId,
        expected: i64,
        mut set: Document,
    ) -> Result<bool> {
        set.insert("metadata.updated_at", DateTime::now());
        let result = self
            .update_one(
                doc! { "_id": id, "version": expected },
                doc! { "$set": set, "$inc": { "version": 1_i64 } },
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    /// Update one document and return it as it is after the update
    pub async fn find_one_and_update(&self, filter: Document, update: Document) -> Result<Option<T>> {
        self.inner
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| BarracksError::Database(format!("Update failed: {}", e)))
    }

    /// Hard delete every matching document
    pub async fn delete_many(&self, filter: Document) -> Result<u64> {
        let result = self
            .inner
            .delete_many(filter)
            .await
            .map_err(|e| BarracksError::Database(format!("Delete failed: {}", e)))?;
        Ok(result.deleted_count)
    }
}

/// Add the not-deleted condition to a filter
pub fn without_deleted(mut filter: Document) -> Document {
    filter.insert("metadata.is_deleted", doc! { "$ne": true });
    filter
}

fn stamp_new(metadata: &mut Metadata) {
    let now = DateTime::now();
    metadata.is_deleted = false;
    metadata.created_at = Some(now);
    metadata.updated_at = Some(now);
}

fn is_duplicate_key(e: &MongoError) -> bool {
    matches!(
        *e.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref w)) if w.code == DUPLICATE_KEY_CODE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests would require a running MongoDB instance; the store
    // logic is exercised against the in-memory store instead.

    #[test]
    fn test_without_deleted_adds_condition() {
        let filter = without_deleted(doc! { "kpi": 1 });
        assert!(filter.contains_key("kpi"));
        assert_eq!(
            filter.get_document("metadata.is_deleted").unwrap(),
            &doc! { "$ne": true }
        );
    }
}
