//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::delivery::retry::PERMANENT_SMTP_CODES;
use crate::error::{ConfigError, SendFailure};
use crate::mail::{Mailer, validate_address};

/// Port that expects TLS from the first byte instead of STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Sends HTML mail through an SMTP relay.
///
/// The transport keeps a connection pool and is driven on the blocking
/// thread pool.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
    message_id_domain: String,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from_address = validate_address(&config.from_email).map_err(|e| {
            ConfigError::InvalidValue {
                key: "SMTP_FROM_EMAIL".into(),
                message: e.to_string(),
            }
        })?;
        let from = Mailbox::new(config.from_name.clone(), from_address.clone());

        let builder = if config.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| ConfigError::InvalidValue {
            key: "SMTP_HOST".into(),
            message: format!("SMTP relay error: {e}"),
        })?
        .port(config.port);

        let builder = match &config.username {
            Some(username) => builder.credentials(Credentials::new(
                username.clone(),
                config.password.expose_secret().to_string(),
            )),
            None => builder,
        };

        tracing::info!(host = %config.host, port = config.port, from = %from, "SMTP mailer configured");

        Ok(Self {
            transport: builder.build(),
            from,
            message_id_domain: from_address.domain().to_string(),
        })
    }

    fn build_message(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
    ) -> Result<(Message, String), SendFailure> {
        let to = validate_address(recipient).map_err(|e| {
            SendFailure::permanent("553", format!("invalid recipient address: {e}"))
        })?;
        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.message_id_domain);

        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, to))
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| SendFailure::transient(format!("Failed to build email: {e}")))?;

        Ok((message, message_id))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
    ) -> Result<String, SendFailure> {
        let (message, message_id) = self.build_message(recipient, subject, html)?;
        let transport = self.transport.clone();

        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| SendFailure::transient(format!("SMTP task failed: {e}")))?;

        match result {
            Ok(_) => {
                tracing::debug!(to = %recipient, message_id = %message_id, "Email accepted by relay");
                Ok(message_id)
            }
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }
}

/// Tag a lettre error as permanent when it carries a 550-554 reply.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> SendFailure {
    let code = err.status().map(|code| code.to_string());
    match code {
        Some(code) if PERMANENT_SMTP_CODES.contains(&code.as_str()) => {
            SendFailure::permanent(code, err.to_string())
        }
        _ => SendFailure::transient(format!("SMTP send failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> SmtpConfig {
        install_crypto_provider();
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: Some("relay".into()),
            password: SecretString::from("hunter2"),
            from_email: "noreply@example.com".into(),
            from_name: Some("Example".into()),
        }
    }

    #[test]
    fn builds_with_valid_config() {
        let mailer = SmtpMailer::new(&config()).unwrap();
        assert_eq!(mailer.message_id_domain, "example.com");
        assert!(!format!("{mailer:?}").contains("hunter2"));
    }

    #[test]
    fn rejects_bad_from_address() {
        let mut cfg = config();
        cfg.from_email = "nope".into();
        let err = SmtpMailer::new(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SMTP_FROM_EMAIL"));
    }

    #[test]
    fn invalid_recipient_is_permanent() {
        let mailer = SmtpMailer::new(&config()).unwrap();
        let err = mailer.build_message("not an address", "Hi", "<p>x</p>").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn message_id_uses_sender_domain() {
        let mailer = SmtpMailer::new(&config()).unwrap();
        let (_, id) = mailer.build_message("ada@x.com", "Hi", "<p>x</p>").unwrap();
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
    }
}
