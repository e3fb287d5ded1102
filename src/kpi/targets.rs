//! Target resolution
//!
//! Maps a KPI's targeting rule onto a catalog of users. Resolution is pure:
//! callers load the catalog (active users only) and persist the result.

use bson::oid::ObjectId;
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::schemas::{Battalion, Role, Targets, UserDoc};
use crate::store::{TargetSubject, UserId};
use crate::types::{BarracksError, Result};

/// Users selected by a targeting rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetResolution {
    /// Selected ids, deduplicated, in catalog order
    pub user_ids: Vec<UserId>,
}

impl TargetResolution {
    pub fn target_count(&self) -> usize {
        self.user_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

/// Resolve `targets` against `catalog`
///
/// `all_users` selects the whole catalog; otherwise the result is the union
/// of role, battalion and explicit-id matches. An empty result is valid.
pub fn resolve_targets(targets: &Targets, catalog: &[UserDoc]) -> TargetResolution {
    let mut seen = HashSet::new();
    let user_ids = catalog
        .iter()
        .filter(|user| targets.matches(user))
        .filter_map(|user| user._id)
        .filter(|id| seen.insert(*id))
        .collect();
    TargetResolution { user_ids }
}

impl Targets {
    /// No selector populated
    pub fn is_empty_rule(&self) -> bool {
        !self.all_users
            && self.roles.is_empty()
            && self.battalions.is_empty()
            && self.specific_users.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty_rule() {
            return Err(BarracksError::Validation(
                "At least one target must be specified (all users, roles, battalions, or specific users)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Whether the rule selects a user with the given attributes
    pub fn selects(&self, user: UserId, role: Role, battalion: Option<Battalion>) -> bool {
        TargetSubject {
            user,
            role,
            battalion,
        }
        .selected_by(self)
    }

    /// Whether the rule selects `user` (users without an id never match)
    pub fn matches(&self, user: &UserDoc) -> bool {
        TargetSubject::of(user).is_some_and(|subject| subject.selected_by(self))
    }

    /// Human readable summary, e.g. `All Users | Roles: commando`
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.all_users {
            parts.push("All Users".to_string());
        }
        if !self.roles.is_empty() {
            let roles: Vec<&str> = self.roles.iter().map(|r| r.as_str()).collect();
            parts.push(format!("Roles: {}", roles.join(", ")));
        }
        if !self.battalions.is_empty() {
            let battalions: Vec<&str> = self.battalions.iter().map(|b| b.as_str()).collect();
            parts.push(format!("Battalions: {}", battalions.join(", ")));
        }
        if !self.specific_users.is_empty() {
            parts.push(format!("Specific Users: {}", self.specific_users.len()));
        }
        parts.join(" | ")
    }

    /// Build a rule from the legacy single-field request shapes
    pub fn from_legacy(legacy: &LegacyAssignment) -> Result<Targets> {
        let mut targets = Targets::default();
        legacy.apply_to(&mut targets)?;
        Ok(targets)
    }
}

/// Older request shapes for assigning a KPI
///
/// Two generations exist: `assigned_to` (`all`, a role name, or `specific`
/// with `specific_users`) and `assignment_type` (`all`, `role` with `role`,
/// or `specific` with `user_ids`). A single `battalion` may accompany
/// either.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LegacyAssignment {
    #[serde(default, alias = "assignedTo")]
    pub assigned_to: Option<String>,

    #[serde(default, alias = "specificUsers")]
    pub specific_users: Vec<ObjectId>,

    #[serde(default, alias = "assignmentType")]
    pub assignment_type: Option<String>,

    #[serde(default)]
    pub role: Option<Role>,

    #[serde(default, alias = "userIds")]
    pub user_ids: Vec<ObjectId>,

    #[serde(default)]
    pub battalion: Option<Battalion>,
}

impl LegacyAssignment {
    pub fn is_present(&self) -> bool {
        self.assigned_to.is_some() || self.assignment_type.is_some() || self.battalion.is_some()
    }

    /// Merge the legacy selectors into `targets`
    pub fn apply_to(&self, targets: &mut Targets) -> Result<()> {
        if let Some(ref assigned_to) = self.assigned_to {
            match assigned_to.trim() {
                "all" => targets.all_users = true,
                "specific" => targets
                    .specific_users
                    .extend(self.specific_users.iter().copied()),
                other => {
                    targets.roles.insert(other.parse::<Role>()?);
                }
            }
        }

        if let Some(ref assignment_type) = self.assignment_type {
            match assignment_type.trim() {
                "all" => targets.all_users = true,
                "role" => {
                    let role = self.role.ok_or_else(|| {
                        BarracksError::Validation(
                            "assignment_type 'role' requires a role".into(),
                        )
                    })?;
                    targets.roles.insert(role);
                }
                "specific" => targets.specific_users.extend(self.user_ids.iter().copied()),
                other => {
                    return Err(BarracksError::Validation(format!(
                        "Invalid assignment_type '{}' (expected one of: all, role, specific)",
                        other
                    )))
                }
            }
        }

        if let Some(battalion) = self.battalion {
            targets.battalions.insert(battalion);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(role: Role, battalion: Option<Battalion>, active: bool) -> UserDoc {
        let mut user = UserDoc::new(
            "Test",
            "Member",
            format!("{}@barracks.test", ObjectId::new()),
            role,
            battalion,
        );
        user._id = Some(ObjectId::new());
        user.is_active = active;
        user
    }

    #[test]
    fn test_role_and_battalion_union_is_deduplicated() {
        let mut catalog: Vec<UserDoc> = (0..5)
            .map(|_| member(Role::Commando, Some(Battalion::Alpha), true))
            .collect();
        catalog.extend((0..3).map(|_| member(Role::Commander, Some(Battalion::Bravo), true)));

        let targets = Targets {
            roles: [Role::Commando].into_iter().collect(),
            battalions: [Battalion::Alpha].into_iter().collect(),
            ..Default::default()
        };
        let resolution = resolve_targets(&targets, &catalog);
        assert_eq!(resolution.target_count(), 5);
    }

    #[test]
    fn test_all_users_selects_whole_catalog() {
        let catalog = vec![
            member(Role::Commander, None, true),
            member(Role::GlobalSoldier, Some(Battalion::Delta), true),
        ];
        let targets = Targets {
            all_users: true,
            ..Default::default()
        };
        assert_eq!(resolve_targets(&targets, &catalog).target_count(), 2);
    }

    #[test]
    fn test_specific_users_outside_catalog_are_dropped() {
        let catalog = vec![member(Role::Commando, None, true)];
        let targets = Targets {
            specific_users: [ObjectId::new()].into_iter().collect(),
            ..Default::default()
        };
        let resolution = resolve_targets(&targets, &catalog);
        assert!(resolution.is_empty());
        assert_eq!(resolution.target_count(), 0);
    }

    #[test]
    fn test_empty_rule_is_rejected() {
        let err = Targets::default().validate().unwrap_err();
        assert!(matches!(err, BarracksError::Validation(_)));

        let ok = Targets {
            battalions: [Battalion::Charlie].into_iter().collect(),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_describe() {
        let user = ObjectId::new();
        let targets = Targets {
            all_users: true,
            roles: [Role::Commando].into_iter().collect(),
            battalions: [Battalion::Alpha].into_iter().collect(),
            specific_users: [user, ObjectId::new()].into_iter().collect(),
        };
        assert_eq!(
            targets.describe(),
            "All Users | Roles: commando | Battalions: Alpha | Specific Users: 2"
        );
    }

    #[test]
    fn test_legacy_assigned_to_role() {
        let legacy = LegacyAssignment {
            assigned_to: Some("special_force".into()),
            battalion: Some(Battalion::Bravo),
            ..Default::default()
        };
        let targets = Targets::from_legacy(&legacy).unwrap();
        assert!(targets.roles.contains(&Role::SpecialForce));
        assert!(targets.battalions.contains(&Battalion::Bravo));
        assert!(!targets.all_users);
    }

    #[test]
    fn test_legacy_assignment_type_shapes() {
        let ids = vec![ObjectId::new(), ObjectId::new()];
        let specific = LegacyAssignment {
            assignment_type: Some("specific".into()),
            user_ids: ids.clone(),
            ..Default::default()
        };
        let targets = Targets::from_legacy(&specific).unwrap();
        assert_eq!(targets.specific_users.len(), 2);

        let all = LegacyAssignment {
            assignment_type: Some("all".into()),
            ..Default::default()
        };
        assert!(Targets::from_legacy(&all).unwrap().all_users);

        let missing_role = LegacyAssignment {
            assignment_type: Some("role".into()),
            ..Default::default()
        };
        assert!(Targets::from_legacy(&missing_role).is_err());
    }

    #[test]
    fn test_legacy_specific_without_users_is_empty_rule() {
        let legacy = LegacyAssignment {
            assigned_to: Some("specific".into()),
            ..Default::default()
        };
        let targets = Targets::from_legacy(&legacy).unwrap();
        assert!(targets.is_empty_rule());
    }

    #[test]
    fn test_matches_uses_role_battalion_and_id() {
        let user = member(Role::GlobalSoldier, Some(Battalion::Charlie), true);
        let by_battalion = Targets {
            battalions: [Battalion::Charlie].into_iter().collect(),
            ..Default::default()
        };
        assert!(by_battalion.matches(&user));
        assert!(by_battalion.selects(ObjectId::new(), Role::Commander, Some(Battalion::Charlie)));
        assert!(!by_battalion.selects(ObjectId::new(), Role::Commander, None));
    }
}
