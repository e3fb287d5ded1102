//! End-to-end flows over the in-memory store, wired the way the server wires them

use std::sync::Arc;

use barracks::config::Args;
use barracks::db::schemas::{Battalion, ProgressStatus, Role, Targets};
use barracks::kpi::NewKpi;
use barracks::members::{NewMember, ProfileUpdate};
use barracks::metrics::{MetricDetail, MetricKind};
use barracks::notify::{LogMailer, PushEvent};
use barracks::store::{InMemoryStore, UserId};
use barracks::{AppState, BarracksError};
use bson::DateTime;
use clap::Parser;
use tokio_test::{assert_err, assert_ok};

fn state() -> AppState {
    let args = Args::parse_from([
        "barracks",
        "--dev-mode",
        "--stats-backoff-ms",
        "1",
        "--email-backoff-ms",
        "1",
    ]);
    AppState::new(args, Arc::new(InMemoryStore::new()), "memory", Arc::new(LogMailer))
}

async fn enlist(state: &AppState, n: usize, role: Role, battalion: Option<Battalion>) -> Vec<UserId> {
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        let user = state
            .members
            .register(NewMember {
                first_name: "Test".into(),
                last_name: "Member".into(),
                email: format!("{}@barracks.test", bson::oid::ObjectId::new()),
                role: Some(role),
                battalion,
            })
            .await
            .unwrap();
        ids.push(user._id.unwrap());
    }
    ids
}

fn days_from_now(days: i64) -> DateTime {
    DateTime::from_millis(DateTime::now().timestamp_millis() + days * 24 * 60 * 60 * 1000)
}

fn kpi(title: &str, targets: Targets) -> NewKpi {
    NewKpi {
        title: title.into(),
        deadline: Some(days_from_now(14)),
        targets: Some(targets),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_assignment_progress_and_dashboards() {
    let state = state();
    let commander = enlist(&state, 1, Role::Commander, None).await[0];
    let alpha = enlist(&state, 6, Role::Commando, Some(Battalion::Alpha)).await;
    let bravo = enlist(&state, 4, Role::GlobalSoldier, Some(Battalion::Bravo)).await;

    let created = state
        .kpis
        .create_kpi(
            commander,
            kpi(
                "Weekly outreach",
                Targets {
                    battalions: [Battalion::Alpha, Battalion::Bravo].into_iter().collect(),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
    assert_eq!(created.target_count, 10);
    let kpi_id = created.kpi._id.unwrap();

    // Three finished, two started, five untouched
    let statuses = state.kpis.statuses_for(kpi_id).await.unwrap();
    assert_eq!(statuses.len(), 10);
    for (i, record) in statuses.iter().enumerate().take(5) {
        let status = if i < 3 { "done" } else { "in_progress" };
        state
            .kpis
            .update_status(commander, record._id.unwrap(), status, None)
            .await
            .unwrap();
    }

    let stored = state.kpis.get_kpi(kpi_id).await.unwrap();
    assert_eq!(stored.stats.total_members, 10);
    assert_eq!(stored.stats.completed, 3);
    assert_eq!(stored.stats.in_progress, 2);
    assert_eq!(stored.stats.not_started, 5);
    assert_eq!(stored.stats.progress_percentage, 50);

    let alpha_summary = state
        .dashboard
        .battalion_summary(Battalion::Alpha)
        .await
        .unwrap();
    assert_eq!(alpha_summary.total_assignments, alpha.len() as u64);

    let overview = state.dashboard.management_overview().await.unwrap();
    assert_eq!(overview.total_kpis, 1);
    assert_eq!(overview.kpi_status_counts.completed, 3);
    assert_eq!(overview.kpi_status_counts.in_progress, 2);
    assert_eq!(overview.kpi_status_counts.not_started, 5);

    let mine = state.dashboard.my_kpis(bravo[0]).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].kpi.title, "Weekly outreach");
}

#[tokio::test]
async fn test_new_member_joins_existing_kpis() {
    let state = state();
    let commander = enlist(&state, 1, Role::Commander, None).await[0];
    enlist(&state, 2, Role::SpecialForce, Some(Battalion::Charlie)).await;

    let created = state
        .kpis
        .create_kpi(
            commander,
            kpi(
                "Field training",
                Targets {
                    roles: [Role::SpecialForce].into_iter().collect(),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
    let kpi_id = created.kpi._id.unwrap();
    assert_eq!(created.target_count, 2);

    let recruit = enlist(&state, 1, Role::Commando, Some(Battalion::Delta)).await[0];
    assert_eq!(state.kpis.get_kpi(kpi_id).await.unwrap().stats.total_members, 2);

    state
        .members
        .change_role(commander, recruit, Role::SpecialForce)
        .await
        .unwrap();
    assert_eq!(state.kpis.get_kpi(kpi_id).await.unwrap().stats.total_members, 3);

    // Moving battalion does not drop an existing assignment
    state
        .members
        .update_profile(
            recruit,
            ProfileUpdate {
                battalion: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let statuses = state.kpis.statuses_for(kpi_id).await.unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.status == ProgressStatus::Pending));
}

#[tokio::test]
async fn test_deleted_kpi_disappears_everywhere() {
    let state = state();
    let commander = enlist(&state, 1, Role::Commander, None).await[0];
    let members = enlist(&state, 3, Role::Commando, Some(Battalion::Alpha)).await;

    let created = state
        .kpis
        .create_kpi(
            commander,
            kpi(
                "Retired goal",
                Targets {
                    all_users: true,
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
    let kpi_id = created.kpi._id.unwrap();

    let mut feed = state.push.subscribe();
    state.kpis.soft_delete(commander, kpi_id).await.unwrap();

    let err = assert_err!(state.kpis.get_kpi(kpi_id).await);
    assert!(matches!(err, BarracksError::NotFound(_)));
    assert!(state.kpis.find_active().await.unwrap().is_empty());
    assert!(state.ledger.find_by_kpi(kpi_id).await.unwrap().is_empty());
    assert!(state.dashboard.my_kpis(members[0]).await.unwrap().is_empty());
    assert_eq!(
        state.dashboard.management_overview().await.unwrap().total_kpis,
        0
    );

    let envelope = feed.recv().await.unwrap();
    assert!(matches!(envelope.event, PushEvent::KpiDeleted { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_across_members() {
    let state = Arc::new(state());
    let commander = enlist(&state, 1, Role::Commander, None).await[0];
    enlist(&state, 8, Role::Commando, Some(Battalion::Bravo)).await;

    let created = state
        .kpis
        .create_kpi(
            commander,
            kpi(
                "Scripture memory",
                Targets {
                    roles: [Role::Commando].into_iter().collect(),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
    let kpi_id = created.kpi._id.unwrap();

    let statuses = state.kpis.statuses_for(kpi_id).await.unwrap();
    let handles: Vec<_> = statuses
        .iter()
        .map(|record| {
            let state = Arc::clone(&state);
            let status_id = record._id.unwrap();
            tokio::spawn(async move {
                state
                    .kpis
                    .update_status(commander, status_id, "done", None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let stats = state.stats.recompute(kpi_id).await.unwrap();
    assert_eq!(stats.completed, 8);
    assert_eq!(stats.progress_percentage, 100);
}

#[tokio::test]
async fn test_metrics_and_weekly_report_after_completions() {
    let state = state();
    let commander = enlist(&state, 1, Role::Commander, None).await[0];
    let squad = enlist(&state, 4, Role::Commando, Some(Battalion::Alpha)).await;

    let created = state
        .kpis
        .create_kpi(
            commander,
            kpi(
                "Prayer walk",
                Targets {
                    roles: [Role::Commando].into_iter().collect(),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
    let kpi_id = created.kpi._id.unwrap();

    for record in state.kpis.statuses_for(kpi_id).await.unwrap() {
        if record.user == squad[0] || record.user == squad[1] {
            assert_ok!(
                state
                    .kpis
                    .update_status(record.user, record._id.unwrap(), "done", None)
                    .await
            );
        }
    }

    let now = DateTime::now();
    let mine = state.metrics.live_metrics(Some(squad[0]), now).await.unwrap();
    assert_eq!(mine.completion_rate.value, 100);
    assert_eq!(mine.on_time_delivery.value, 100);

    let overall = state
        .metrics
        .metric(MetricKind::CompletionRate, None, now)
        .await
        .unwrap();
    let MetricDetail::CompletionRate(overall) = overall else {
        panic!("expected a completion rate");
    };
    assert_eq!(overall.total_assigned, 4);
    assert_eq!(overall.current_month_completed, 2);
    assert_eq!(overall.value, 50);

    // One digest for the only commander, whatever the weekday
    let report = state
        .reminders
        .send_weekly_reports(DateTime::from_millis(now.timestamp_millis() + 1))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    let status = state.reminders.status().await;
    assert!(!status.is_running);
    assert!(status.last_weekly_report.is_some());
}

#[tokio::test]
async fn test_metrics_for_unknown_member() {
    let state = state();
    let err = assert_err!(state.metrics.live_metrics(Some(UserId::new()), DateTime::now()).await);
    assert!(matches!(err, BarracksError::NotFound(_)));
}
