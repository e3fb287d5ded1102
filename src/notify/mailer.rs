//! Outgoing mail transports

use lettre::{
    message::{header::ContentType, Mailbox, Message},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use tracing::info;

use crate::types::{BarracksError, Result};

/// Something that can deliver one HTML email
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

/// SMTP connection settings
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Use STARTTLS/TLS relay; plain connection otherwise (local relays)
    pub tls: bool,
    pub from: String,
}

/// Mailer over an async SMTP transport
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|e| BarracksError::Config(format!("Invalid from address: {}", e)))?;

        let builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .map_err(|e| BarracksError::Config(format!("SMTP relay error: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        let builder = builder.port(settings.port);
        let builder = match (&settings.username, &settings.password) {
            (Some(user), Some(pass)) => {
                builder.credentials(Credentials::new(user.clone(), pass.clone()))
            }
            _ => builder,
        };

        info!(
            "SMTP mailer configured for {}:{} (tls: {})",
            settings.host, settings.port, settings.tls
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| BarracksError::Notification(format!("Invalid to address: {}", e)))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| BarracksError::Notification(format!("Failed to build email: {}", e)))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| BarracksError::Notification(format!("Failed to send email: {}", e)))?;
        Ok(())
    }
}

/// Dev-mode mailer that only logs
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<()> {
        info!(to, subject, "Email (not sent, log mailer)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_mailer_rejects_bad_from() {
        let settings = SmtpSettings {
            host: "localhost".into(),
            port: 25,
            username: None,
            password: None,
            tls: false,
            from: "not an address".into(),
        };
        assert!(matches!(
            SmtpMailer::new(&settings),
            Err(BarracksError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_everything() {
        assert!(LogMailer.send("a@b.c", "Hi", "<p>hi</p>").await.is_ok());
    }
}
