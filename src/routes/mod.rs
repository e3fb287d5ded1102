//! HTTP routes for Barracks

pub mod dashboard;
pub mod health;
pub mod kpis;
pub mod metrics;
pub mod notifications;
pub mod statuses;
pub mod users;
pub mod util;

pub use dashboard::handle_dashboard_request;
pub use health::{health_check, version_info};
pub use kpis::handle_kpi_request;
pub use metrics::handle_metrics_request;
pub use notifications::handle_notification_request;
pub use statuses::{handle_me_request, handle_status_request};
pub use users::handle_user_request;
