//! Configuration for Barracks
//!
//! CLI arguments and environment variable handling using clap. A `.env`
//! file in the working directory is loaded before parsing.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::kpi::StatsConfig;
use crate::notify::{DispatchConfig, SmtpSettings};

/// Barracks - battalion KPI tracking service
#[derive(Parser, Debug, Clone)]
#[command(name = "barracks")]
#[command(about = "KPI assignment, progress tracking and dashboards for battalion members")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory store, emails logged instead of sent)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "barracks")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// SMTP configuration
    #[command(flatten)]
    pub smtp: SmtpArgs,

    /// Delivery attempts per email
    #[arg(long, env = "EMAIL_MAX_ATTEMPTS", default_value = "3")]
    pub email_max_attempts: u32,

    /// Delay before the second delivery attempt; doubles after that
    #[arg(long, env = "EMAIL_BACKOFF_MS", default_value = "1000")]
    pub email_backoff_ms: u64,

    /// Emails in flight at once during a fan-out
    #[arg(long, env = "NOTIFY_CONCURRENCY", default_value = "8")]
    pub notify_concurrency: usize,

    /// Attempts per stats recompute before reporting a conflict
    #[arg(long, env = "STATS_MAX_ATTEMPTS", default_value = "5")]
    pub stats_max_attempts: u32,

    /// Base delay between stats recompute attempts
    #[arg(long, env = "STATS_BACKOFF_MS", default_value = "20")]
    pub stats_backoff_ms: u64,

    /// KPIs recomputed in parallel by batch operations
    #[arg(long, env = "STATS_CONCURRENCY", default_value = "8")]
    pub stats_concurrency: usize,

    /// Seconds between retries of failed stats refreshes
    #[arg(long, env = "REPAIR_INTERVAL_SECS", default_value = "30")]
    pub repair_interval_secs: u64,

    /// Seconds between full recomputes of every active KPI
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "600")]
    pub sweep_interval_secs: u64,

    /// Seconds between deadline reminder passes
    #[arg(long, env = "REMINDER_INTERVAL_SECS", default_value = "3600")]
    pub reminder_interval_secs: u64,

    /// Seconds between push heartbeats
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    pub heartbeat_interval_secs: u64,
}

/// SMTP connection configuration
#[derive(Parser, Debug, Clone)]
pub struct SmtpArgs {
    /// SMTP server host; emails are only logged when unset
    #[arg(long, env = "SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "SMTP_PORT", default_value = "587")]
    pub smtp_port: u16,

    /// SMTP username (optional)
    #[arg(long, env = "SMTP_USER")]
    pub smtp_user: Option<String>,

    /// SMTP password (optional)
    #[arg(long, env = "SMTP_PASS")]
    pub smtp_pass: Option<String>,

    /// Use a TLS relay connection
    #[arg(long, env = "SMTP_TLS", default_value = "true")]
    pub smtp_tls: bool,

    /// Sender address
    #[arg(long, env = "MAIL_FROM", default_value = "LHB Command <no-reply@lhb.app>")]
    pub mail_from: String,
}

impl Args {
    /// SMTP settings, if a host is configured
    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        let host = self.smtp.smtp_host.clone()?;
        Some(SmtpSettings {
            host,
            port: self.smtp.smtp_port,
            username: self.smtp.smtp_user.clone(),
            password: self.smtp.smtp_pass.clone(),
            tls: self.smtp.smtp_tls,
            from: self.smtp.mail_from.clone(),
        })
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            max_attempts: self.stats_max_attempts,
            backoff_ms: self.stats_backoff_ms,
            concurrency: self.stats_concurrency,
            repair_interval: Duration::from_secs(self.repair_interval_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_attempts: self.email_max_attempts,
            backoff_ms: self.email_backoff_ms,
            concurrency: self.notify_concurrency,
        }
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.smtp.smtp_host.is_none() {
            return Err("SMTP_HOST is required in production mode".to_string());
        }

        if self.email_max_attempts == 0 || self.stats_max_attempts == 0 {
            return Err("EMAIL_MAX_ATTEMPTS and STATS_MAX_ATTEMPTS must be at least 1".to_string());
        }

        if self.notify_concurrency == 0 || self.stats_concurrency == 0 {
            return Err("NOTIFY_CONCURRENCY and STATS_CONCURRENCY must be at least 1".to_string());
        }

        let intervals = [
            self.repair_interval_secs,
            self.sweep_interval_secs,
            self.reminder_interval_secs,
            self.heartbeat_interval_secs,
        ];
        if intervals.contains(&0) {
            return Err("Background task intervals must be at least 1 second".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["barracks"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_dev_mode_needs_no_smtp() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert!(args.smtp_settings().is_none());
    }

    #[test]
    fn test_production_requires_smtp() {
        let args = parse(&[]);
        assert!(args.validate().is_err());

        let args = parse(&["--smtp-host", "smtp.example.org", "--smtp-user", "ops"]);
        assert!(args.validate().is_ok());
        let smtp = args.smtp_settings().unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.username.as_deref(), Some("ops"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = parse(&["--dev-mode", "--sweep-interval-secs", "0"]);
        assert!(args.validate().is_err());
    }
}
