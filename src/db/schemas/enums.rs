//! Enumerations shared by all documents
//!
//! Each concept has exactly one enum. Every accepted spelling, including the
//! legacy ones still found in older documents and clients (`special_force`,
//! `soldier`, ...), is listed next to its variant below and nowhere else.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::BarracksError;

macro_rules! labeled_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($what:literal) {
            $( $variant:ident => $label:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Canonical spelling (as stored and serialized)
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = BarracksError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $(
                    if s == $label $(|| s == $alias)* {
                        return Ok($name::$variant);
                    }
                )+
                Err(BarracksError::Validation(format!(
                    "Invalid {} '{}' (expected one of: {})",
                    $what,
                    s,
                    [$($label),+].join(", ")
                )))
            }
        }

        impl TryFrom<String> for $name {
            type Error = BarracksError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labeled_enum! {
    /// Rank/classification of a member
    Role ("role") {
        Commander => "commander" | "Commander",
        Commando => "commando" | "Commando",
        SpecialForce => "specialForce" | "special_force" | "Special Force",
        GlobalSoldier => "globalSoldier" | "global_soldier" | "soldier" | "Global Soldier",
    }
}

labeled_enum! {
    /// Organizational grouping of members
    Battalion ("battalion") {
        Alpha => "Alpha" | "alpha",
        Bravo => "Bravo" | "bravo",
        Charlie => "Charlie" | "charlie",
        Delta => "Delta" | "delta",
    }
}

labeled_enum! {
    Category ("category") {
        Spiritual => "spiritual",
        Ministry => "ministry",
        Leadership => "leadership",
        Personal => "personal",
        Community => "community",
        Other => "other",
    }
}

labeled_enum! {
    Priority ("priority") {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

labeled_enum! {
    /// KPI lifecycle status
    KpiLifecycle ("KPI status") {
        Draft => "draft",
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

labeled_enum! {
    /// One member's progress on one KPI
    ProgressStatus ("progress status") {
        Pending => "pending",
        InProgress => "in_progress",
        Done => "done",
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::GlobalSoldier
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Default for KpiLifecycle {
    fn default() -> Self {
        KpiLifecycle::Active
    }
}

impl Default for ProgressStatus {
    fn default() -> Self {
        ProgressStatus::Pending
    }
}

impl ProgressStatus {
    /// Started or finished
    pub fn is_engaged(&self) -> bool {
        matches!(self, ProgressStatus::InProgress | ProgressStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_role_spellings() {
        assert_eq!("special_force".parse::<Role>().unwrap(), Role::SpecialForce);
        assert_eq!("Special Force".parse::<Role>().unwrap(), Role::SpecialForce);
        assert_eq!("soldier".parse::<Role>().unwrap(), Role::GlobalSoldier);
        assert_eq!("globalSoldier".parse::<Role>().unwrap(), Role::GlobalSoldier);
        assert!("general".parse::<Role>().is_err());
    }

    #[test]
    fn test_progress_status_is_strict() {
        assert_eq!(
            "in_progress".parse::<ProgressStatus>().unwrap(),
            ProgressStatus::InProgress
        );
        let err = "finished".parse::<ProgressStatus>().unwrap_err();
        assert!(matches!(err, BarracksError::Validation(_)));
        assert!(err.to_string().contains("pending, in_progress, done"));
    }

    #[test]
    fn test_serde_uses_canonical_spelling() {
        let json = serde_json::to_string(&Role::SpecialForce).unwrap();
        assert_eq!(json, "\"specialForce\"");

        let role: Role = serde_json::from_str("\"special_force\"").unwrap();
        assert_eq!(role, Role::SpecialForce);

        let bad: Result<Battalion, _> = serde_json::from_str("\"Echo\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Category::default(), Category::Other);
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(KpiLifecycle::default(), KpiLifecycle::Active);
        assert_eq!(ProgressStatus::default(), ProgressStatus::Pending);
    }
}
