//! KPI domain: targeting, status ledger, stats and lifecycle flows

pub mod ledger;
pub mod service;
pub mod stats;
pub mod targets;

pub use ledger::{StatusLedger, StatusSummary};
pub use service::{CreatedKpi, KpiService, KpiUpdate, NewKpi};
pub use stats::{compute_stats, engagement_percentage, BatchReport, StatsAggregator, StatsConfig};
pub use targets::{resolve_targets, LegacyAssignment, TargetResolution};
