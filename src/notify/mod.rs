//! Notifications: email delivery, real-time push, deadline reminders and
//! weekly reports
//!
//! Every path here is best effort. Failures are logged (and written to the
//! email log) but never fail the core operation that triggered them.

pub mod dispatcher;
pub mod mailer;
pub mod push;
pub mod reminders;
pub mod templates;

pub use dispatcher::{DispatchConfig, FanOutReport, NotificationDispatcher};
pub use mailer::{LogMailer, Mailer, SmtpMailer, SmtpSettings};
pub use push::{now_timestamp, Audience, ClientMessage, PushEnvelope, PushEvent, PushHub};
pub use reminders::{ReminderReport, ReminderScheduler, SchedulerStatus, REMINDER_DAYS};
pub use templates::{Completion, Email};
