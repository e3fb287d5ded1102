//! Dashboard read models
//!
//! Read-only compositions over users, KPIs and status records. A status
//! record whose KPI or user is gone (or whose KPI is soft-deleted) is
//! skipped rather than failing the whole view.

use bson::DateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::db::schemas::{ceil_days, Battalion, KpiDoc, KpiLifecycle, KpiStatusDoc, ProgressStatus, UserDoc};
use crate::kpi::{engagement_percentage, StatusLedger, StatusSummary};
use crate::store::{EntityStore, KpiId, KpiQuery, StatusQuery, UserId, UserQuery};
use crate::types::{BarracksError, Result};
use crate::views::{iso, KpiBrief, KpiView, UserView};

/// Group name for members without a battalion
pub const UNASSIGNED: &str = "Unassigned";

/// How far past its deadline a KPI is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_days_overdue(days: i64) -> Self {
        match days {
            d if d <= 7 => Severity::Low,
            d if d <= 30 => Severity::Medium,
            _ => Severity::High,
        }
    }
}

/// Member filter for [`DashboardService::members_by_progress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberProgress {
    /// No assignments, or every assignment still pending
    NotStarted,
    /// At least one assignment in progress
    InProgress,
    /// At least one assignment and all of them done
    Completed,
}

impl MemberProgress {
    fn admits(&self, statuses: &[ProgressStatus]) -> bool {
        match self {
            MemberProgress::NotStarted => statuses.iter().all(|s| *s == ProgressStatus::Pending),
            MemberProgress::InProgress => statuses.contains(&ProgressStatus::InProgress),
            MemberProgress::Completed => {
                !statuses.is_empty() && statuses.iter().all(|s| *s == ProgressStatus::Done)
            }
        }
    }
}

impl FromStr for MemberProgress {
    type Err = BarracksError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "notStarted" | "not_started" => Ok(MemberProgress::NotStarted),
            "inProgress" | "in_progress" => Ok(MemberProgress::InProgress),
            "completed" => Ok(MemberProgress::Completed),
            other => Err(BarracksError::Validation(format!(
                "Invalid member progress '{}' (expected one of: notStarted, inProgress, completed)",
                other
            ))),
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// One of the caller's assignments with its KPI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MyKpi {
    pub status_id: String,
    pub status: ProgressStatus,
    pub progress: Option<i32>,
    pub marked_at: Option<String>,
    pub kpi: KpiBrief,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub completed: u64,
    pub in_progress: u64,
    pub not_started: u64,
}

impl StatusCounts {
    fn add(&mut self, status: ProgressStatus) {
        match status {
            ProgressStatus::Done => self.completed += 1,
            ProgressStatus::InProgress => self.in_progress += 1,
            ProgressStatus::Pending => self.not_started += 1,
        }
    }

    fn total(&self) -> u64 {
        self.completed + self.in_progress + self.not_started
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub user: UserView,
    pub status: ProgressStatus,
    pub marked_at: Option<String>,
}

/// All of a battalion's assignments on one KPI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiAssignments {
    pub kpi: KpiBrief,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattalionSummary {
    pub battalion: Battalion,
    /// Individual assignments, not distinct KPIs
    pub total_assignments: u64,
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub unique_kpis: usize,
    pub battalion_users: usize,
    pub member_assignments: Vec<KpiAssignments>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueKpi {
    #[serde(flatten)]
    pub kpi: KpiView,
    pub days_overdue: i64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDetail {
    pub kpi: KpiBrief,
    pub status: ProgressStatus,
    pub marked_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetail {
    #[serde(flatten)]
    pub user: UserView,
    pub kpi_details: Vec<KpiDetail>,
    pub has_started: bool,
    pub all_completed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCount {
    pub battalion: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProgressSummary {
    pub total_members: usize,
    pub by_battalion: Vec<GroupCount>,
    pub by_role: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersByProgress {
    pub status: MemberProgress,
    pub summary: MemberProgressSummary,
    pub members: BTreeMap<String, Vec<MemberDetail>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattalionGroup {
    pub members: Vec<MemberDetail>,
    pub total_members: u64,
    pub members_started: u64,
    pub members_completed: u64,
    pub progress_percentage: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementOverview {
    pub total_members: u64,
    pub members_started: u64,
    pub members_completed: u64,
    pub progress_percentage: u64,
    /// Active, non-deleted KPIs
    pub total_kpis: usize,
    /// Distinct KPIs with at least one assignment
    pub unique_kpis: usize,
    pub kpi_status_counts: StatusCounts,
    pub battalion_groups: BTreeMap<String, BattalionGroup>,
    pub active_kpis: Vec<KpiView>,
}

// ============================================================================
// Service
// ============================================================================

pub struct DashboardService {
    store: Arc<dyn EntityStore>,
    ledger: Arc<StatusLedger>,
}

/// Joined statuses of every member, keyed by user
struct MemberStatuses {
    per_user: HashMap<UserId, Vec<(KpiStatusDoc, Arc<KpiDoc>)>>,
    counts: StatusCounts,
    unique_kpis: usize,
}

fn group_name(user: &UserDoc) -> String {
    user.battalion
        .map(|b| b.to_string())
        .unwrap_or_else(|| UNASSIGNED.to_string())
}

fn member_detail(user: &UserDoc, joined: &[(KpiStatusDoc, Arc<KpiDoc>)]) -> MemberDetail {
    let kpi_details = joined
        .iter()
        .map(|(status, kpi)| KpiDetail {
            kpi: KpiBrief::from(kpi.as_ref()),
            status: status.status,
            marked_at: status.marked_at.map(iso),
        })
        .collect::<Vec<_>>();
    MemberDetail {
        user: UserView::from(user),
        has_started: joined.iter().any(|(s, _)| s.status.is_engaged()),
        all_completed: !joined.is_empty()
            && joined.iter().all(|(s, _)| s.status == ProgressStatus::Done),
        kpi_details,
    }
}

impl DashboardService {
    pub fn new(store: Arc<dyn EntityStore>, ledger: Arc<StatusLedger>) -> Self {
        Self { store, ledger }
    }

    /// Non-deleted KPIs by id
    async fn live_kpis(&self) -> Result<HashMap<KpiId, Arc<KpiDoc>>> {
        Ok(self
            .store
            .find_kpis(&KpiQuery::all(false))
            .await?
            .into_iter()
            .filter_map(|k| Some((k._id?, Arc::new(k))))
            .collect())
    }

    /// The caller's assignments with KPI details, newest first
    pub async fn my_kpis(&self, user_id: UserId) -> Result<Vec<MyKpi>> {
        let (statuses, kpis) = tokio::try_join!(self.ledger.find_by_user(user_id), self.live_kpis())?;
        Ok(statuses
            .iter()
            .filter_map(|s| {
                let kpi = kpis.get(&s.kpi)?;
                Some(MyKpi {
                    status_id: s._id?.to_hex(),
                    status: s.status,
                    progress: s.progress,
                    marked_at: s.marked_at.map(iso),
                    kpi: KpiBrief::from(kpi.as_ref()),
                })
            })
            .collect())
    }

    pub async fn user_summary(&self, user_id: UserId) -> Result<StatusSummary> {
        self.ledger.user_summary(user_id).await
    }

    /// Assignment counts and per-KPI groups for every member of a battalion
    pub async fn battalion_summary(&self, battalion: Battalion) -> Result<BattalionSummary> {
        let users = self
            .store
            .find_users(&UserQuery::default().with_battalion(battalion))
            .await?;
        let mut summary = BattalionSummary {
            battalion,
            total_assignments: 0,
            counts: StatusCounts::default(),
            unique_kpis: 0,
            battalion_users: users.len(),
            member_assignments: Vec::new(),
        };
        if users.is_empty() {
            return Ok(summary);
        }

        let by_id: HashMap<UserId, &UserDoc> =
            users.iter().filter_map(|u| Some((u._id?, u))).collect();
        let query = StatusQuery::for_users(by_id.keys().copied().collect());
        let (statuses, kpis) = tokio::try_join!(self.store.find_statuses(&query), self.live_kpis())?;

        let mut order: Vec<KpiId> = Vec::new();
        let mut groups: HashMap<KpiId, KpiAssignments> = HashMap::new();
        for status in &statuses {
            let (Some(kpi), Some(user)) = (kpis.get(&status.kpi), by_id.get(&status.user)) else {
                continue;
            };
            summary.counts.add(status.status);
            groups
                .entry(status.kpi)
                .or_insert_with(|| {
                    order.push(status.kpi);
                    KpiAssignments {
                        kpi: KpiBrief::from(kpi.as_ref()),
                        assignments: Vec::new(),
                    }
                })
                .assignments
                .push(Assignment {
                    user: UserView::from(*user),
                    status: status.status,
                    marked_at: status.marked_at.map(iso),
                });
        }

        summary.total_assignments = summary.counts.total();
        summary.unique_kpis = order.len();
        summary.member_assignments = order
            .into_iter()
            .filter_map(|id| groups.remove(&id))
            .collect();
        Ok(summary)
    }

    /// Active or paused KPIs past their deadline, earliest deadline first
    pub async fn overdue_kpis(&self, now: DateTime) -> Result<Vec<OverdueKpi>> {
        let mut overdue = self
            .store
            .find_kpis(&KpiQuery {
                statuses: vec![KpiLifecycle::Active, KpiLifecycle::Paused],
                deadline_before: Some(now),
                ..Default::default()
            })
            .await?;
        overdue.sort_by_key(|k| k.deadline);

        Ok(overdue
            .iter()
            .map(|kpi| {
                let days_overdue = kpi
                    .deadline
                    .map(|d| ceil_days(now.timestamp_millis() - d.timestamp_millis()))
                    .unwrap_or(0);
                OverdueKpi {
                    kpi: KpiView::from(kpi),
                    days_overdue,
                    severity: Severity::from_days_overdue(days_overdue),
                }
            })
            .collect())
    }

    /// Statuses joined with their KPI, restricted to members in `roster`
    async fn member_statuses(&self, roster: &[UserDoc]) -> Result<MemberStatuses> {
        let known: HashSet<UserId> = roster.iter().filter_map(|u| u._id).collect();
        let query = StatusQuery::default();
        let (statuses, kpis) = tokio::try_join!(self.store.find_statuses(&query), self.live_kpis())?;
        let mut per_user: HashMap<UserId, Vec<(KpiStatusDoc, Arc<KpiDoc>)>> = HashMap::new();
        let mut counts = StatusCounts::default();
        let mut distinct = HashSet::new();
        let mut skipped = 0usize;
        for status in statuses {
            let Some(kpi) = kpis.get(&status.kpi) else {
                skipped += 1;
                continue;
            };
            if !known.contains(&status.user) {
                skipped += 1;
                continue;
            }
            counts.add(status.status);
            distinct.insert(status.kpi);
            per_user
                .entry(status.user)
                .or_default()
                .push((status, Arc::clone(kpi)));
        }
        if skipped > 0 {
            debug!(skipped, "Skipped status records of missing members or KPIs");
        }
        Ok(MemberStatuses {
            per_user,
            counts,
            unique_kpis: distinct.len(),
        })
    }

    /// All members sorted by battalion, role and first name
    async fn roster(&self) -> Result<Vec<UserDoc>> {
        let mut users = self.store.find_users(&UserQuery::default()).await?;
        users.sort_by(|a, b| {
            (a.battalion, a.role, &a.first_name).cmp(&(b.battalion, b.role, &b.first_name))
        });
        Ok(users)
    }

    /// Members whose assignments match `filter`, grouped by battalion
    pub async fn members_by_progress(&self, filter: MemberProgress) -> Result<MembersByProgress> {
        let users = self.roster().await?;
        let joined = self.member_statuses(&users).await?;

        let mut members: BTreeMap<String, Vec<MemberDetail>> = BTreeMap::new();
        let mut by_role: BTreeMap<String, usize> = BTreeMap::new();
        let mut total = 0;
        for user in &users {
            let Some(id) = user._id else { continue };
            let mine = joined.per_user.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let statuses: Vec<ProgressStatus> = mine.iter().map(|(s, _)| s.status).collect();
            if !filter.admits(&statuses) {
                continue;
            }
            total += 1;
            *by_role.entry(user.role.to_string()).or_default() += 1;
            members
                .entry(group_name(user))
                .or_default()
                .push(member_detail(user, mine));
        }

        let by_battalion = members
            .iter()
            .map(|(battalion, list)| GroupCount {
                battalion: battalion.clone(),
                count: list.len(),
            })
            .collect();
        Ok(MembersByProgress {
            status: filter,
            summary: MemberProgressSummary {
                total_members: total,
                by_battalion,
                by_role,
            },
            members,
        })
    }

    /// Battalion-wide engagement and every active KPI's progress
    pub async fn management_overview(&self) -> Result<ManagementOverview> {
        let active_query = KpiQuery::active();
        let (users, active_kpis) =
            tokio::try_join!(self.roster(), self.store.find_kpis(&active_query))?;
        let joined = self.member_statuses(&users).await?;

        let mut groups: BTreeMap<String, BattalionGroup> = BTreeMap::new();
        let (mut started, mut completed) = (0u64, 0u64);
        for user in &users {
            let Some(id) = user._id else { continue };
            let mine = joined.per_user.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let detail = member_detail(user, mine);
            let group = groups.entry(group_name(user)).or_default();
            group.total_members += 1;
            if detail.has_started {
                group.members_started += 1;
                started += 1;
            }
            if detail.all_completed {
                group.members_completed += 1;
                completed += 1;
            }
            group.members.push(detail);
        }
        for group in groups.values_mut() {
            group.progress_percentage =
                engagement_percentage(group.members_started, group.total_members);
        }

        let total_members = users.len() as u64;
        Ok(ManagementOverview {
            total_members,
            members_started: started,
            members_completed: completed,
            progress_percentage: engagement_percentage(started, total_members),
            total_kpis: active_kpis.len(),
            unique_kpis: joined.unique_kpis,
            kpi_status_counts: joined.counts,
            battalion_groups: groups,
            active_kpis: active_kpis.iter().map(KpiView::from).collect(),
        })
    }
}
