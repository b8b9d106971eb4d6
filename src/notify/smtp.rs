//! SMTP sink.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

use super::{Channel, Notification, Notifier, NotifyError};
use crate::config::SmtpConfig;

/// Port that speaks TLS from the first byte instead of upgrading with STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

fn smtp_err(e: impl std::fmt::Display) -> NotifyError {
    NotifyError::Smtp(e.to_string())
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
            .port(config.port)
            .timeout(Some(Duration::from_secs(5)));

        if config.use_tls {
            let params = TlsParameters::builder(config.server.clone())
                .dangerous_accept_invalid_certs(true)
                .build()
                .map_err(smtp_err)?;
            builder = builder.tls(if config.port == IMPLICIT_TLS_PORT {
                Tls::Wrapper(params)
            } else {
                Tls::Required(params)
            });
        }

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    pub fn build_message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let from: Mailbox = self.config.from.parse().map_err(smtp_err)?;
        let mut builder = Message::builder()
            .from(from)
            .subject(notification.title.clone())
            .header(ContentType::TEXT_PLAIN);
        for address in &self.config.to {
            let to: Mailbox = address.parse().map_err(smtp_err)?;
            builder = builder.to(to);
        }
        builder.body(notification.message.clone()).map_err(smtp_err)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn channel(&self) -> Channel {
        Channel::Smtp
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.build_message(notification)?;
        self.transport.send(message).await.map_err(smtp_err)?;
        tracing::info!("SMTP notification sent to {} recipient(s)", self.config.to.len());
        Ok(())
    }
}
