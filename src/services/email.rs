//! Email channel: minimal RFC-compliant messages over SMTP.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;
use crate::db::models::GroundingSource;
use crate::error::{AppError, AppResult};
use crate::services::notifications::SendOutcome;

#[derive(Clone)]
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl std::fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSender").field("from", &self.from).finish_non_exhaustive()
    }
}

impl EmailSender {
    /// Build the sender from process configuration. Returns `None` when SMTP
    /// is not configured; email channels then fail permanently at dispatch.
    pub fn from_config(config: &EmailConfig) -> AppResult<Option<Self>> {
        if !config.is_configured() {
            return Ok(None);
        }

        let host = config.smtp_host.as_deref().unwrap_or_default();
        let from_raw = config.smtp_from.as_deref().unwrap_or_default();

        let from: Mailbox = from_raw.parse().map_err(|e| {
            AppError::Config(format!("invalid EMAIL_SMTP_FROM '{from_raw}': {e}"))
        })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| AppError::Config(format!("invalid EMAIL_SMTP_HOST '{host}': {e}")))?
            .port(config.smtp_port);

        if let (Some(username), Some(password)) =
            (config.smtp_username.clone(), config.smtp_password.clone())
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Some(Self {
            transport: builder.build(),
            from,
        }))
    }

    /// Send one message; the outcome carries the retry classification.
    /// SMTP semantics invert HTTP's: 5xx replies are permanent, 4xx transient.
    pub async fn send(&self, recipient: &str, subject: &str, body: &str) -> SendOutcome {
        let to: Mailbox = match recipient.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                return SendOutcome::Permanent {
                    http_status: None,
                    error: format!("invalid recipient address '{recipient}': {e}"),
                }
            }
        };

        let message = match Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body.to_string())
        {
            Ok(message) => message,
            Err(e) => {
                return SendOutcome::Permanent {
                    http_status: None,
                    error: format!("failed to build message: {e}"),
                }
            }
        };

        match self.transport.send(message).await {
            Ok(_) => SendOutcome::Delivered { http_status: None },
            Err(e) if e.is_permanent() => SendOutcome::Permanent {
                http_status: None,
                error: e.to_string(),
            },
            Err(e) => SendOutcome::Transient {
                http_status: None,
                error: e.to_string(),
            },
        }
    }
}

/// Render the internal alert template for one condition-met firing.
pub fn render_alert(
    task_name: &str,
    notification: &str,
    sources: &[GroundingSource],
) -> (String, String) {
    let subject = format!("Torale alert: {task_name}");

    let mut body = String::new();
    body.push_str(notification);
    body.push('\n');

    if !sources.is_empty() {
        body.push_str("\nSources:\n");
        for source in sources {
            match &source.title {
                Some(title) => body.push_str(&format!("  - {title}: {}\n", source.uri)),
                None => body.push_str(&format!("  - {}\n", source.uri)),
            }
        }
    }

    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_template_lists_sources() {
        let sources = vec![
            GroundingSource {
                uri: "https://a.test/post".to_string(),
                title: Some("Announcement".to_string()),
            },
            GroundingSource {
                uri: "https://b.test".to_string(),
                title: None,
            },
        ];

        let (subject, body) = render_alert("Rust release watch", "1.80 is out", &sources);
        assert_eq!(subject, "Torale alert: Rust release watch");
        assert!(body.starts_with("1.80 is out"));
        assert!(body.contains("Announcement: https://a.test/post"));
        assert!(body.contains("- https://b.test"));
    }

    #[test]
    fn alert_template_omits_sources_section_when_empty() {
        let (_, body) = render_alert("t", "hit", &[]);
        assert!(!body.contains("Sources:"));
    }

    #[test]
    fn from_config_requires_smtp_settings() {
        let config = EmailConfig {
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
        };
        assert!(EmailSender::from_config(&config).unwrap().is_none());
    }
}
