//! Database schemas for Barracks
//!
//! Defines MongoDB document structures for users, KPIs, KPI status records
//! and the email delivery log.

mod email_log;
mod enums;
mod kpi;
mod kpi_status;
mod metadata;
mod user;

pub use email_log::{EmailLogDoc, EMAIL_LOG_COLLECTION};
pub use enums::{Battalion, Category, KpiLifecycle, Priority, ProgressStatus, Role};
pub use kpi::{
    KpiDoc, KpiStats, Targets, DESCRIPTION_MAX_LEN, KPI_COLLECTION, TITLE_MAX_LEN,
};
pub(crate) use kpi::ceil_days;
pub use kpi_status::{KpiStatusDoc, KPI_STATUS_COLLECTION};
pub use metadata::Metadata;
pub use user::{UserDoc, USER_COLLECTION};
