//! Status ledger
//!
//! One progress record per (user, KPI). Records are created `pending` in
//! bulk when a KPI is assigned and change only through explicit status
//! updates. Every successful write refreshes the KPI's stats; a refresh that
//! fails is queued for repair instead of failing the write.

use bson::DateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{KpiStatusDoc, ProgressStatus};
use crate::kpi::stats::StatsAggregator;
use crate::store::{EntityStore, KpiId, StatusId, StatusQuery, UserId};
use crate::types::{BarracksError, Result};

/// Counts of a user's assignments by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
}

/// Insert pending records for the users in `user_ids` that lack one
///
/// Duplicate ids are collapsed; existing pairs are skipped by the store.
pub async fn insert_pending(
    store: &dyn EntityStore,
    kpi_id: KpiId,
    user_ids: &[UserId],
) -> Result<usize> {
    let mut seen = HashSet::new();
    let records: Vec<KpiStatusDoc> = user_ids
        .iter()
        .filter(|id| seen.insert(**id))
        .map(|user| KpiStatusDoc::pending(*user, kpi_id))
        .collect();
    if records.is_empty() {
        return Ok(0);
    }
    store.insert_statuses(records).await
}

pub struct StatusLedger {
    store: Arc<dyn EntityStore>,
    stats: Arc<StatsAggregator>,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn EntityStore>, stats: Arc<StatsAggregator>) -> Self {
        Self { store, stats }
    }

    /// Assign `kpi_id` to every listed user not already assigned
    ///
    /// Safe to repeat and to call with overlapping sets.
    pub async fn create_for_targets(&self, kpi_id: KpiId, user_ids: &[UserId]) -> Result<usize> {
        let inserted = insert_pending(self.store.as_ref(), kpi_id, user_ids).await?;
        if inserted > 0 {
            info!(kpi = %kpi_id, inserted, "Created status records");
            self.refresh_stats(kpi_id).await;
        } else {
            debug!(kpi = %kpi_id, "No new status records needed");
        }
        Ok(inserted)
    }

    /// Move one record to `status`, optionally recording percent progress
    pub async fn update_status(
        &self,
        status_id: StatusId,
        status: &str,
        progress: Option<i64>,
    ) -> Result<KpiStatusDoc> {
        let status: ProgressStatus = status.parse()?;
        let progress = match progress {
            Some(p) if !(0..=100).contains(&p) => {
                return Err(BarracksError::Validation(format!(
                    "Progress must be between 0 and 100, got {}",
                    p
                )))
            }
            Some(p) => Some(p as i32),
            None => None,
        };

        let record = self
            .store
            .set_status(status_id, status, progress, DateTime::now())
            .await?
            .ok_or_else(|| BarracksError::NotFound(format!("KPI status {}", status_id)))?;

        debug!(
            status_record = %status_id,
            kpi = %record.kpi,
            status = %record.status,
            "Status updated"
        );
        self.refresh_stats(record.kpi).await;
        Ok(record)
    }

    /// Remove every record of a KPI
    pub async fn delete_all_for_kpi(&self, kpi_id: KpiId) -> Result<u64> {
        let deleted = self
            .store
            .delete_statuses(&StatusQuery::for_kpi(kpi_id))
            .await?;
        info!(kpi = %kpi_id, deleted, "Deleted status records");
        Ok(deleted)
    }

    pub async fn find_by_user(&self, user_id: UserId) -> Result<Vec<KpiStatusDoc>> {
        self.store
            .find_statuses(&StatusQuery::for_user(user_id))
            .await
    }

    pub async fn find_by_kpi(&self, kpi_id: KpiId) -> Result<Vec<KpiStatusDoc>> {
        self.store.find_statuses(&StatusQuery::for_kpi(kpi_id)).await
    }

    pub async fn get(&self, status_id: StatusId) -> Result<KpiStatusDoc> {
        self.store
            .get_status(status_id)
            .await?
            .ok_or_else(|| BarracksError::NotFound(format!("KPI status {}", status_id)))
    }

    pub async fn user_summary(&self, user_id: UserId) -> Result<StatusSummary> {
        let query = StatusQuery::for_user(user_id);
        let pending_query = query.clone().with_status(ProgressStatus::Pending);
        let in_progress_query = query.clone().with_status(ProgressStatus::InProgress);
        let done_query = query.clone().with_status(ProgressStatus::Done);
        let (total, pending, in_progress, done) = tokio::try_join!(
            self.store.count_statuses(&query),
            self.store.count_statuses(&pending_query),
            self.store.count_statuses(&in_progress_query),
            self.store.count_statuses(&done_query),
        )?;
        Ok(StatusSummary {
            total,
            pending,
            in_progress,
            done,
        })
    }

    async fn refresh_stats(&self, kpi_id: KpiId) {
        if let Err(e) = self.stats.recompute(kpi_id).await {
            warn!(
                "Stats refresh for KPI {} failed, queued for repair: {}",
                kpi_id, e
            );
            self.stats.queue_repair(kpi_id);
        }
    }
}
