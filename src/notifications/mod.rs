//! Outbound email for verification and deletion codes.
//!
//! When SMTP is disabled (the default for local development) nothing is sent;
//! the calling endpoint is expected to surface the code another way.

use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::SmtpConfig;

/// Service for sending system emails
#[derive(Clone)]
pub struct Mailer {
    config: SmtpConfig,
}

impl Mailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Check if email sending is configured and enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Send an email verification code to a new account
    pub async fn send_verification_code(&self, to_email: &str, code: &str) {
        let subject = "Verify your TraceLens account";
        let body = render_verification_text(code);
        self.deliver(to_email, subject, &body).await;
    }

    /// Send a deletion verification code
    pub async fn send_deletion_code(&self, to_email: &str, code: &str) {
        let subject = "Confirm your TraceLens data deletion request";
        let body = render_deletion_text(code);
        self.deliver(to_email, subject, &body).await;
    }

    /// Deliver a plain-text email, logging failures instead of surfacing them
    async fn deliver(&self, to_email: &str, subject: &str, body: &str) {
        if !self.is_enabled() {
            tracing::info!(to = %to_email, subject = %subject, "SMTP disabled, email not sent");
            return;
        }

        match self.send_email(to_email, subject, body).await {
            Ok(()) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
            }
            Err(e) => {
                tracing::error!(to = %to_email, error = %e, "Failed to send email");
            }
        }
    }

    async fn send_email(&self, to_email: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let from: Mailbox = self.config.from.parse()?;
        let to: Mailbox = to_email.parse()?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        let mailer = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        }
        .port(self.config.port);

        let mailer = if let (Some(username), Some(password)) =
            (&self.config.username, &self.config.password)
        {
            mailer.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer
        };

        mailer.build().send(email).await?;
        Ok(())
    }
}

fn render_verification_text(code: &str) -> String {
    format!(
        r#"Welcome to TraceLens

Your verification code is:

    {code}

Enter this code to activate your account. The code is valid for this
registration only.

If you didn't create a TraceLens account, you can safely ignore this email."#,
        code = code,
    )
}

fn render_deletion_text(code: &str) -> String {
    format!(
        r#"Data Deletion Request

You asked TraceLens to delete your data. To confirm, enter this code:

    {code}

If you didn't request deletion, ignore this email and your data will not
be touched."#,
        code = code,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_verification_text() {
        let text = render_verification_text("123456");
        assert!(text.contains("123456"));
        assert!(text.contains("verification code"));
    }

    #[test]
    fn test_render_deletion_text() {
        let text = render_deletion_text("ABCD2345");
        assert!(text.contains("ABCD2345"));
        assert!(text.contains("Deletion"));
    }

    #[test]
    fn test_disabled_mailer() {
        let mailer = Mailer::new(SmtpConfig::default());
        assert!(!mailer.is_enabled());
    }
}
