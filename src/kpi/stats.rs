//! Stats aggregation
//!
//! `compute_stats` is a pure function over a KPI's status records.
//! [`StatsAggregator::recompute`] persists its result with a version-checked
//! write and retries from a fresh read when another writer got there first,
//! so concurrent recomputes can never leave stale counts behind.
//!
//! Recomputes that fail after a ledger write already succeeded land in the
//! repair queue; the sweeper retries them and periodically recomputes every
//! active KPI.

use bson::DateTime;
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::schemas::{KpiStats, KpiStatusDoc, ProgressStatus, UserDoc};
use crate::kpi::ledger;
use crate::store::{EntityStore, KpiId, KpiQuery, StatusQuery, TargetSubject};
use crate::tasks::PeriodicTask;
use crate::types::{BarracksError, Result};

/// Tuning for the aggregator
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Attempts per recompute before giving up with a conflict
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly, plus jitter
    pub backoff_ms: u64,
    /// KPIs recomputed in parallel by batch operations
    pub concurrency: usize,
    pub repair_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 20,
            concurrency: 8,
            repair_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Outcome of recomputing several KPIs
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<(KpiId, BarracksError)>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, other: BatchReport) {
        self.succeeded += other.succeeded;
        self.failed.extend(other.failed);
    }
}

/// Derive the stats block from a KPI's status records
pub fn compute_stats(statuses: &[KpiStatusDoc], now: DateTime) -> KpiStats {
    let mut stats = KpiStats {
        total_members: statuses.len() as i64,
        last_updated: Some(now),
        ..Default::default()
    };
    for record in statuses {
        match record.status {
            ProgressStatus::Pending => stats.not_started += 1,
            ProgressStatus::InProgress => stats.in_progress += 1,
            ProgressStatus::Done => stats.completed += 1,
        }
    }
    stats.progress_percentage = engagement_percentage(
        (stats.in_progress + stats.completed) as u64,
        stats.total_members as u64,
    ) as i64;
    stats
}

/// `round(100 * engaged / total)`, halves rounding up; 0 when `total` is 0
pub fn engagement_percentage(engaged: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (200 * engaged + total) / (2 * total)
}

/// Keeps each KPI's stats block in line with its status records
pub struct StatsAggregator {
    store: Arc<dyn EntityStore>,
    config: StatsConfig,
    repair_queue: DashSet<KpiId>,
    sweeper: Mutex<Vec<PeriodicTask>>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn EntityStore>, config: StatsConfig) -> Self {
        Self {
            store,
            config,
            repair_queue: DashSet::new(),
            sweeper: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Recompute and persist one KPI's stats
    ///
    /// Reads the KPI version before reading statuses, so a write based on a
    /// stale read always loses the version check and is retried.
    pub async fn recompute(&self, kpi_id: KpiId) -> Result<KpiStats> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let kpi = self
                .store
                .get_kpi(kpi_id)
                .await?
                .ok_or_else(|| BarracksError::NotFound(format!("KPI {}", kpi_id)))?;

            if kpi.metadata.is_deleted {
                debug!("Skipping stats recompute for deleted KPI {}", kpi_id);
                return Ok(kpi.stats);
            }

            let statuses = self
                .store
                .find_statuses(&StatusQuery::for_kpi(kpi_id))
                .await?;
            let stats = compute_stats(&statuses, DateTime::now());

            if self.store.write_stats(kpi_id, kpi.version, &stats).await? {
                debug!(
                    kpi = %kpi_id,
                    total = stats.total_members,
                    progress = stats.progress_percentage,
                    attempt,
                    "Stats recomputed"
                );
                return Ok(stats);
            }

            if attempt < max_attempts {
                let delay = self.backoff(attempt);
                debug!(
                    kpi = %kpi_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Stats write lost version race, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            "Stats recompute for KPI {} gave up after {} attempts",
            kpi_id, max_attempts
        );
        Err(BarracksError::Conflict(format!(
            "Stats for KPI {} changed concurrently {} times",
            kpi_id, max_attempts
        )))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_ms;
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            0
        };
        Duration::from_millis(base * u64::from(attempt) + jitter)
    }

    /// Recompute several KPIs concurrently, collecting every failure
    pub async fn recompute_many(&self, kpi_ids: Vec<KpiId>) -> BatchReport {
        let mut ids = kpi_ids;
        ids.sort();
        ids.dedup();

        let outcomes: Vec<(KpiId, Result<KpiStats>)> = stream::iter(ids)
            .map(|id| async move { (id, self.recompute(id).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!("Stats recompute failed for KPI {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        report
    }

    /// Recompute every non-deleted active KPI
    pub async fn recompute_all_active(&self) -> Result<BatchReport> {
        let ids: Vec<KpiId> = self
            .store
            .find_kpis(&KpiQuery::active())
            .await?
            .into_iter()
            .filter_map(|k| k._id)
            .collect();
        info!("Recomputing stats for {} active KPIs", ids.len());
        Ok(self.recompute_many(ids).await)
    }

    /// React to a change of a user's role, battalion or active flag
    ///
    /// Finds active KPIs whose rule selects the user before or after the
    /// change, assigns the user where a rule now selects them (if active),
    /// and recomputes every affected KPI.
    pub async fn on_user_changed(
        &self,
        before: Option<&UserDoc>,
        after: &UserDoc,
    ) -> Result<BatchReport> {
        let Some(user_id) = after._id else {
            return Err(BarracksError::Validation("User has no id".into()));
        };

        let mut subjects: Vec<TargetSubject> =
            before.and_then(TargetSubject::of).into_iter().collect();
        if let Some(subject) = TargetSubject::of(after) {
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }

        let query = KpiQuery {
            could_target: subjects,
            ..KpiQuery::active()
        };
        let affected = self.store.find_kpis(&query).await?;

        let mut report = BatchReport::default();
        let mut ids = Vec::with_capacity(affected.len());
        for kpi in &affected {
            let Some(kpi_id) = kpi._id else { continue };
            ids.push(kpi_id);
            if after.is_active && kpi.targets.matches(after) {
                if let Err(e) = ledger::insert_pending(self.store.as_ref(), kpi_id, &[user_id]).await {
                    warn!("Assigning KPI {} to user {} failed: {}", kpi_id, user_id, e);
                    report.failed.push((kpi_id, e));
                }
            }
        }

        info!(
            user = %user_id,
            affected = ids.len(),
            "Recomputing KPIs after user change"
        );
        report.absorb(self.recompute_many(ids).await);
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Repair queue and sweeper
    // ------------------------------------------------------------------------

    /// Remember a KPI whose stats may be stale
    pub fn queue_repair(&self, kpi_id: KpiId) {
        if self.repair_queue.insert(kpi_id) {
            debug!("Queued stats repair for KPI {}", kpi_id);
        }
    }

    pub fn pending_repairs(&self) -> usize {
        self.repair_queue.len()
    }

    /// Retry every queued KPI; transient failures stay queued
    pub async fn repair_pending(&self) -> BatchReport {
        let ids: Vec<KpiId> = self.repair_queue.iter().map(|id| *id).collect();
        if ids.is_empty() {
            return BatchReport::default();
        }
        for id in &ids {
            self.repair_queue.remove(id);
        }

        let report = self.recompute_many(ids).await;
        for (id, e) in &report.failed {
            if e.is_transient() {
                self.repair_queue.insert(*id);
            }
        }
        info!(
            repaired = report.succeeded,
            failed = report.failed.len(),
            "Stats repair pass finished"
        );
        report
    }

    /// Start the repair and full-sweep loops (no-op when already running)
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.sweeper.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let repairer = Arc::clone(self);
        tasks.push(PeriodicTask::spawn(
            "stats repair",
            self.config.repair_interval,
            move || {
                let repairer = Arc::clone(&repairer);
                async move {
                    repairer.repair_pending().await;
                }
            },
        ));

        let sweeper = Arc::clone(self);
        tasks.push(PeriodicTask::spawn(
            "stats sweep",
            self.config.sweep_interval,
            move || {
                let sweeper = Arc::clone(&sweeper);
                async move {
                    match sweeper.recompute_all_active().await {
                        Ok(report) if !report.is_clean() => warn!(
                            "Stats sweep left {} of {} KPIs failed",
                            report.failed.len(),
                            report.attempted()
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Stats sweep failed: {}", e),
                    }
                }
            },
        ));
    }

    pub async fn stop(&self) {
        let tasks: Vec<PeriodicTask> = self.sweeper.lock().await.drain(..).collect();
        for task in tasks {
            task.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        !self.sweeper.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{Battalion, KpiDoc, Role, Targets};
    use crate::store::InMemoryStore;
    use bson::oid::ObjectId;

    fn statuses(pending: usize, in_progress: usize, done: usize) -> Vec<KpiStatusDoc> {
        let kpi = ObjectId::new();
        let mut out = Vec::new();
        for (count, status) in [
            (pending, ProgressStatus::Pending),
            (in_progress, ProgressStatus::InProgress),
            (done, ProgressStatus::Done),
        ] {
            for _ in 0..count {
                let mut record = KpiStatusDoc::pending(ObjectId::new(), kpi);
                record.status = status;
                out.push(record);
            }
        }
        out
    }

    fn aggregator(store: Arc<InMemoryStore>) -> StatsAggregator {
        let config = StatsConfig {
            backoff_ms: 1,
            ..Default::default()
        };
        StatsAggregator::new(store, config)
    }

    async fn kpi_with_statuses(store: &InMemoryStore, pending: usize, done: usize) -> KpiId {
        let kpi = store
            .insert_kpi(KpiDoc {
                title: "Weekly devotion".into(),
                targets: Targets {
                    all_users: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let id = kpi._id.unwrap();
        let mut records = Vec::new();
        for i in 0..(pending + done) {
            let mut record = KpiStatusDoc::pending(ObjectId::new(), id);
            if i >= pending {
                record.status = ProgressStatus::Done;
            }
            records.push(record);
        }
        store.insert_statuses(records).await.unwrap();
        id
    }

    #[test]
    fn test_progress_formula() {
        let stats = compute_stats(&statuses(5, 3, 2), DateTime::now());
        assert_eq!(stats.total_members, 10);
        assert_eq!(stats.not_started, 5);
        assert_eq!(stats.in_progress, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.progress_percentage, 50);
    }

    #[test]
    fn test_empty_kpi_has_zero_progress() {
        let stats = compute_stats(&[], DateTime::now());
        assert_eq!(stats.total_members, 0);
        assert_eq!(stats.progress_percentage, 0);
        assert!(stats.last_updated.is_some());
    }

    #[test]
    fn test_counts_always_sum_to_total() {
        for (p, i, d) in [(0, 0, 1), (1, 1, 1), (7, 0, 2), (0, 4, 0)] {
            let stats = compute_stats(&statuses(p, i, d), DateTime::now());
            assert_eq!(
                stats.not_started + stats.in_progress + stats.completed,
                stats.total_members
            );
        }
    }

    #[test]
    fn test_percentage_rounds_half_up() {
        assert_eq!(engagement_percentage(1, 3), 33);
        assert_eq!(engagement_percentage(2, 3), 67);
        assert_eq!(engagement_percentage(1, 8), 13);
        assert_eq!(engagement_percentage(0, 0), 0);
    }

    #[tokio::test]
    async fn test_recompute_persists_and_bumps_version() {
        let store = Arc::new(InMemoryStore::new());
        let id = kpi_with_statuses(&store, 2, 2).await;
        let agg = aggregator(Arc::clone(&store));

        let stats = agg.recompute(id).await.unwrap();
        assert_eq!(stats.progress_percentage, 50);

        let kpi = store.get_kpi(id).await.unwrap().unwrap();
        assert_eq!(kpi.stats.completed, 2);
        assert_eq!(kpi.version, 2);
    }

    #[tokio::test]
    async fn test_recompute_retries_after_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let id = kpi_with_statuses(&store, 1, 1).await;
        let agg = aggregator(Arc::clone(&store));

        store.inject_stats_conflicts(2);
        let stats = agg.recompute(id).await.unwrap();
        assert_eq!(stats.total_members, 2);
        assert_eq!(store.get_kpi(id).await.unwrap().unwrap().stats.completed, 1);
    }

    #[tokio::test]
    async fn test_recompute_gives_up_with_conflict() {
        let store = Arc::new(InMemoryStore::new());
        let id = kpi_with_statuses(&store, 1, 0).await;
        let agg = aggregator(Arc::clone(&store));

        store.inject_stats_conflicts(10);
        let err = agg.recompute(id).await.unwrap_err();
        assert!(matches!(err, BarracksError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_recompute_missing_kpi_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let agg = aggregator(store);
        let err = agg.recompute(ObjectId::new()).await.unwrap_err();
        assert!(matches!(err, BarracksError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recompute_many_collects_failures() {
        let store = Arc::new(InMemoryStore::new());
        let good = kpi_with_statuses(&store, 1, 1).await;
        let missing = ObjectId::new();
        let agg = aggregator(Arc::clone(&store));

        let report = agg.recompute_many(vec![good, missing, good]).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, missing);
    }

    #[tokio::test]
    async fn test_repair_queue_drains_on_success() {
        let store = Arc::new(InMemoryStore::new());
        let id = kpi_with_statuses(&store, 0, 3).await;
        let agg = aggregator(Arc::clone(&store));

        agg.queue_repair(id);
        agg.queue_repair(id);
        assert_eq!(agg.pending_repairs(), 1);

        let report = agg.repair_pending().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(agg.pending_repairs(), 0);
        assert_eq!(store.get_kpi(id).await.unwrap().unwrap().stats.completed, 3);
    }

    #[tokio::test]
    async fn test_repair_keeps_transient_failures_queued() {
        let store = Arc::new(InMemoryStore::new());
        let id = kpi_with_statuses(&store, 1, 0).await;
        let agg = aggregator(Arc::clone(&store));

        store.inject_stats_conflicts(100);
        agg.queue_repair(id);
        agg.queue_repair(ObjectId::new());
        let report = agg.repair_pending().await;
        assert_eq!(report.failed.len(), 2);
        // the conflict stays queued, the missing KPI is dropped
        assert_eq!(agg.pending_repairs(), 1);
    }

    #[tokio::test]
    async fn test_user_change_assigns_newly_targeted_kpi() {
        let store = Arc::new(InMemoryStore::new());
        let agg = aggregator(Arc::clone(&store));

        let kpi = store
            .insert_kpi(KpiDoc {
                title: "Bravo drill".into(),
                targets: Targets {
                    battalions: [Battalion::Bravo].into_iter().collect(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let kpi_id = kpi._id.unwrap();

        let before = store
            .insert_user(UserDoc::new(
                "Sam",
                "Eze",
                "sam@barracks.test",
                Role::Commando,
                Some(Battalion::Alpha),
            ))
            .await
            .unwrap();
        let mut after = before.clone();
        after.battalion = Some(Battalion::Bravo);
        store.update_user(&after).await.unwrap();

        let report = agg.on_user_changed(Some(&before), &after).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(report.is_clean());

        let stored = store.get_kpi(kpi_id).await.unwrap().unwrap();
        assert_eq!(stored.stats.total_members, 1);
        assert_eq!(stored.stats.not_started, 1);

        // repeating the change does not duplicate the assignment
        agg.on_user_changed(Some(&before), &after).await.unwrap();
        assert_eq!(
            store
                .count_statuses(&StatusQuery::for_kpi(kpi_id))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_sweeper() {
        let store = Arc::new(InMemoryStore::new());
        let agg = Arc::new(aggregator(store));
        agg.start().await;
        agg.start().await;
        assert!(agg.is_running().await);
        agg.stop().await;
        assert!(!agg.is_running().await);
    }
}
