//! Barracks - KPI tracking for battalion members
//!
//! Commanders define KPIs with a targeting rule (all members, roles,
//! battalions, specific members). Each targeted member gets a status record;
//! every status change refreshes a denormalized stats block on the KPI and
//! is pushed to dashboards.
//!
//! ## Components
//!
//! - **kpi**: Target resolution, status ledger, stats aggregation and the
//!   KPI lifecycle service
//! - **members**: Registration and role/battalion/activation changes
//! - **dashboard**: Read models for members and management
//! - **metrics**: Live completion, performance, on-time and efficiency metrics
//! - **notify**: Email fan-out with retry, WebSocket push hub, deadline
//!   reminders and weekly reports
//! - **store**: Persistence seam with MongoDB and in-memory backends

pub mod config;
pub mod dashboard;
pub mod db;
pub mod kpi;
pub mod members;
pub mod metrics;
pub mod notify;
pub mod routes;
pub mod server;
pub mod store;
pub mod tasks;
pub mod types;
pub mod views;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{BarracksError, Result};
