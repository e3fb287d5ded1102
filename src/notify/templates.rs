//! Email subjects and bodies

use bson::DateTime;

use crate::db::schemas::{KpiDoc, Role, UserDoc};

/// One composed email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

const SIGNATURE: &str = "<p>– LHB Command</p>";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn format_date(date: Option<DateTime>) -> String {
    match date {
        Some(d) => d.to_chrono().format("%Y-%m-%d %H:%M UTC").to_string(),
        None => "No deadline".to_string(),
    }
}

fn wrap(body: String) -> String {
    format!(
        r#"<div style="font-family: Arial, sans-serif;">{}{}</div>"#,
        body, SIGNATURE
    )
}

pub fn welcome(user: &UserDoc) -> Email {
    Email {
        to: user.email.clone(),
        subject: format!("Welcome to LHB App, {}", user.first_name),
        html: wrap(format!(
            "<h2>Welcome, {}!</h2><p>Your barracks account is ready.</p>",
            escape(&user.first_name)
        )),
    }
}

pub fn kpi_assigned(user: &UserDoc, kpi: &KpiDoc) -> Email {
    Email {
        to: user.email.clone(),
        subject: format!("New KPI Assigned: {}", kpi.title),
        html: wrap(format!(
            "<h2>Hello {},</h2>\
             <p>You've been assigned a new KPI:</p>\
             <p><strong>{}</strong></p>\
             <p>Deadline: {}</p>\
             <p>Please log in to your dashboard to respond.</p>",
            escape(&user.first_name),
            escape(&kpi.title),
            format_date(kpi.deadline)
        )),
    }
}

pub fn kpi_completed(
    commander: &UserDoc,
    completer: &UserDoc,
    kpi: &KpiDoc,
    completed_at: Option<DateTime>,
) -> Email {
    Email {
        to: commander.email.clone(),
        subject: format!("KPI Completed: {}", kpi.title),
        html: wrap(format!(
            "<h2>Hello {},</h2>\
             <p><strong>{}</strong> completed <strong>{}</strong>.</p>\
             <p>Completed at: {}</p>",
            escape(&commander.first_name),
            escape(&completer.full_name()),
            escape(&kpi.title),
            format_date(completed_at)
        )),
    }
}

pub fn role_changed(user: &UserDoc, old: Role, new: Role, changed_by: Option<&UserDoc>) -> Email {
    let by = changed_by
        .map(|u| format!(" by {}", escape(&u.full_name())))
        .unwrap_or_default();
    Email {
        to: user.email.clone(),
        subject: "Your role has been updated".to_string(),
        html: wrap(format!(
            "<h2>Hello {},</h2><p>Your role was changed from <strong>{}</strong> to <strong>{}</strong>{}.</p>",
            escape(&user.first_name),
            old,
            new,
            by
        )),
    }
}

pub fn account_status(user: &UserDoc, active: bool, reason: Option<&str>) -> Email {
    let state = if active { "activated" } else { "deactivated" };
    let reason = reason
        .map(|r| format!("<p>Reason: {}</p>", escape(r)))
        .unwrap_or_default();
    Email {
        to: user.email.clone(),
        subject: format!("Your account has been {}", state),
        html: wrap(format!(
            "<h2>Hello {},</h2><p>Your account has been {}.</p>{}",
            escape(&user.first_name),
            state,
            reason
        )),
    }
}

/// Reminder for a KPI due in `days_left` days; negative means overdue
pub fn deadline_reminder(user: &UserDoc, kpi: &KpiDoc, days_left: i64) -> Email {
    let (subject, when) = match days_left {
        d if d < 0 => (
            format!("Overdue KPI: {}", kpi.title),
            format!("is overdue by {} day(s)", -d),
        ),
        0 => (format!("KPI due today: {}", kpi.title), "is due today".to_string()),
        d => (
            format!("KPI due in {} day(s): {}", d, kpi.title),
            format!("is due in {} day(s)", d),
        ),
    };
    Email {
        to: user.email.clone(),
        subject,
        html: wrap(format!(
            "<h2>Hello {},</h2><p><strong>{}</strong> {}.</p><p>Deadline: {}</p>",
            escape(&user.first_name),
            escape(&kpi.title),
            when,
            format_date(kpi.deadline)
        )),
    }
}

/// One line of a weekly completion report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Member who finished, by full name
    pub member: String,
    pub kpi_title: String,
    pub completed_at: Option<DateTime>,
}

/// Digest of the past week's completions for one commander
pub fn weekly_report(commander: &UserDoc, completions: &[Completion]) -> Email {
    let rows: String = completions
        .iter()
        .map(|c| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape(&c.member),
                escape(&c.kpi_title),
                format_date(c.completed_at)
            )
        })
        .collect();
    Email {
        to: commander.email.clone(),
        subject: format!("Weekly KPI report: {} completion(s)", completions.len()),
        html: wrap(format!(
            "<h2>Hello {},</h2>\
             <p>KPIs completed in the past week:</p>\
             <table><tr><th>Member</th><th>KPI</th><th>Completed</th></tr>{}</table>",
            escape(&commander.first_name),
            rows
        )),
    }
}
