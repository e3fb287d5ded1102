//! Member directory
//!
//! Registration and profile changes. Role, battalion and active-flag changes
//! alter which KPIs select a member, so each one is followed by a stats pass
//! over the affected KPIs.

use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::{Battalion, Role, UserDoc};
use crate::kpi::StatsAggregator;
use crate::notify::NotificationDispatcher;
use crate::store::{EntityStore, UserId, UserQuery};
use crate::types::{BarracksError, Result};

const NAME_MAX_LEN: usize = 100;

/// Input for registering a member
#[derive(Debug, Clone, Default)]
pub struct NewMember {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Option<Role>,
    pub battalion: Option<Battalion>,
}

/// Partial profile edit; `battalion: Some(None)` clears the battalion
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub battalion: Option<Option<Battalion>>,
}

pub struct MemberDirectory {
    store: Arc<dyn EntityStore>,
    stats: Arc<StatsAggregator>,
    dispatcher: Arc<NotificationDispatcher>,
}

fn clean_name(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BarracksError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > NAME_MAX_LEN {
        return Err(BarracksError::Validation(format!(
            "{} cannot exceed {} characters",
            field, NAME_MAX_LEN
        )));
    }
    Ok(value.to_string())
}

fn clean_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(BarracksError::Validation(format!(
            "Invalid email '{}'",
            email
        ))),
    }
}

impl MemberDirectory {
    pub fn new(
        store: Arc<dyn EntityStore>,
        stats: Arc<StatsAggregator>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            stats,
            dispatcher,
        }
    }

    /// Register a member and assign any active KPI whose rule selects them
    pub async fn register(&self, new: NewMember) -> Result<UserDoc> {
        let user = UserDoc::new(
            clean_name(&new.first_name, "First name")?,
            clean_name(&new.last_name, "Last name")?,
            clean_email(&new.email)?,
            new.role.unwrap_or_default(),
            new.battalion,
        );
        let user = self.store.insert_user(user).await?;
        info!(
            user = ?user._id,
            role = %user.role,
            battalion = ?user.battalion,
            "Member registered"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let welcome = user.clone();
        tokio::spawn(async move {
            dispatcher.notify_welcome(&welcome).await;
        });

        self.after_change(None, &user).await;
        Ok(user)
    }

    pub async fn get(&self, id: UserId) -> Result<UserDoc> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| BarracksError::NotFound(format!("User {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<UserDoc>> {
        self.store.find_users(&UserQuery::default()).await
    }

    pub async fn change_role(&self, actor: UserId, id: UserId, role: Role) -> Result<UserDoc> {
        let before = self.get(id).await?;
        if before.role == role {
            return Ok(before);
        }
        let mut after = before.clone();
        after.role = role;
        self.store.update_user(&after).await?;
        info!(user = %id, actor = %actor, from = %before.role, to = %role, "Role changed");

        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let (old, user) = (before.role, after.clone());
        tokio::spawn(async move {
            let changed_by = store.get_user(actor).await.ok().flatten();
            dispatcher
                .notify_role_changed(&user, old, user.role, changed_by.as_ref())
                .await;
        });

        self.after_change(Some(&before), &after).await;
        Ok(after)
    }

    /// Activate or deactivate a member
    ///
    /// Deactivated members keep their status records but stop being selected
    /// for new assignments.
    pub async fn set_active(
        &self,
        actor: UserId,
        id: UserId,
        active: bool,
        reason: Option<String>,
    ) -> Result<UserDoc> {
        let before = self.get(id).await?;
        if before.is_active == active {
            return Ok(before);
        }
        let mut after = before.clone();
        after.is_active = active;
        self.store.update_user(&after).await?;
        info!(user = %id, actor = %actor, active, "Account status changed");

        let dispatcher = Arc::clone(&self.dispatcher);
        let user = after.clone();
        tokio::spawn(async move {
            dispatcher
                .notify_account_status(&user, active, reason.as_deref())
                .await;
        });

        self.after_change(Some(&before), &after).await;
        Ok(after)
    }

    pub async fn update_profile(&self, id: UserId, update: ProfileUpdate) -> Result<UserDoc> {
        let before = self.get(id).await?;
        let mut after = before.clone();
        if let Some(ref first_name) = update.first_name {
            after.first_name = clean_name(first_name, "First name")?;
        }
        if let Some(ref last_name) = update.last_name {
            after.last_name = clean_name(last_name, "Last name")?;
        }
        if let Some(battalion) = update.battalion {
            after.battalion = battalion;
        }
        if after == before {
            return Ok(before);
        }
        self.store.update_user(&after).await?;

        if after.battalion != before.battalion {
            info!(user = %id, from = ?before.battalion, to = ?after.battalion, "Battalion changed");
            self.after_change(Some(&before), &after).await;
        }
        Ok(after)
    }

    async fn after_change(&self, before: Option<&UserDoc>, after: &UserDoc) {
        match self.stats.on_user_changed(before, after).await {
            Ok(report) if !report.is_clean() => {
                warn!(
                    user = ?after._id,
                    failed = report.failed.len(),
                    "Some KPIs were not refreshed after member change"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(user = ?after._id, "Member change refresh failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{KpiDoc, Targets};
    use crate::kpi::StatsConfig;
    use crate::notify::{DispatchConfig, LogMailer, PushHub};
    use crate::store::{InMemoryStore, StatusQuery};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        members: MemberDirectory,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let stats = Arc::new(StatsAggregator::new(store.clone(), StatsConfig::default()));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(LogMailer),
            store.clone(),
            Arc::new(PushHub::new(Duration::from_secs(30))),
            DispatchConfig::default(),
        ));
        let members = MemberDirectory::new(store.clone(), stats, dispatcher);
        Fixture { store, members }
    }

    fn recruit(email: &str, role: Role, battalion: Option<Battalion>) -> NewMember {
        NewMember {
            first_name: "New".into(),
            last_name: "Recruit".into(),
            email: email.into(),
            role: Some(role),
            battalion,
        }
    }

    async fn kpi_for(f: &Fixture, targets: Targets) -> KpiDoc {
        f.store
            .insert_kpi(KpiDoc {
                title: "Targeted".into(),
                targets,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_validates_and_normalizes() {
        let f = fixture();
        let bad = f
            .members
            .register(recruit("not-an-email", Role::Commando, None))
            .await;
        assert!(matches!(bad, Err(BarracksError::Validation(_))));

        let user = f
            .members
            .register(recruit("  Ada@Barracks.Test ", Role::Commando, None))
            .await
            .unwrap();
        assert_eq!(user.email, "ada@barracks.test");

        let dup = f
            .members
            .register(recruit("ada@barracks.test", Role::Commando, None))
            .await;
        assert!(matches!(dup, Err(BarracksError::Validation(_))));
    }

    #[tokio::test]
    async fn test_register_joins_matching_kpis() {
        let f = fixture();
        let kpi = kpi_for(
            &f,
            Targets {
                battalions: [Battalion::Bravo].into_iter().collect(),
                ..Default::default()
            },
        )
        .await;
        let kpi_id = kpi._id.unwrap();

        f.members
            .register(recruit("bravo@barracks.test", Role::Commando, Some(Battalion::Bravo)))
            .await
            .unwrap();
        f.members
            .register(recruit("alpha@barracks.test", Role::Commando, Some(Battalion::Alpha)))
            .await
            .unwrap();

        let kpi = f.store.get_kpi(kpi_id).await.unwrap().unwrap();
        assert_eq!(kpi.stats.total_members, 1);
    }

    #[tokio::test]
    async fn test_role_change_assigns_newly_selected_kpis() {
        let f = fixture();
        let user = f
            .members
            .register(recruit("promo@barracks.test", Role::Commando, None))
            .await
            .unwrap();
        let user_id = user._id.unwrap();
        let kpi = kpi_for(
            &f,
            Targets {
                roles: [Role::Commander].into_iter().collect(),
                ..Default::default()
            },
        )
        .await;

        let promoted = f
            .members
            .change_role(user_id, user_id, Role::Commander)
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Commander);

        let count = f
            .store
            .count_statuses(&StatusQuery::for_user(user_id))
            .await
            .unwrap();
        assert_eq!(count, 1);
        let kpi = f.store.get_kpi(kpi._id.unwrap()).await.unwrap().unwrap();
        assert_eq!(kpi.stats.total_members, 1);
    }

    #[tokio::test]
    async fn test_deactivated_member_is_not_assigned() {
        let f = fixture();
        let user = f
            .members
            .register(recruit("idle@barracks.test", Role::Commando, None))
            .await
            .unwrap();
        let user_id = user._id.unwrap();
        f.members
            .set_active(user_id, user_id, false, Some("On leave".into()))
            .await
            .unwrap();

        kpi_for(
            &f,
            Targets {
                battalions: [Battalion::Delta].into_iter().collect(),
                ..Default::default()
            },
        )
        .await;
        let moved = f
            .members
            .update_profile(
                user_id,
                ProfileUpdate {
                    battalion: Some(Some(Battalion::Delta)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.battalion, Some(Battalion::Delta));
        assert!(!moved.is_active);
        assert_eq!(
            f.store
                .count_statuses(&StatusQuery::for_user(user_id))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_missing_member_is_not_found() {
        let f = fixture();
        let err = f
            .members
            .change_role(UserId::new(), UserId::new(), Role::Commander)
            .await
            .unwrap_err();
        assert!(matches!(err, BarracksError::NotFound(_)));
    }
}
