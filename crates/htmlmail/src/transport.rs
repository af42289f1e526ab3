//! Delivery of composed messages.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use htmlmail_common::{SmtpEncryption, SmtpSettings};
use lettre::{SmtpTransport, Transport as _, transport::smtp::authentication::Credentials};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::{error::MailError, message::OutboundMessage};

/// Hands a composed message over for delivery.
pub trait Transport {
    fn deliver(&self, message: &OutboundMessage) -> Result<(), MailError>;
}

impl<T> Transport for &T
where
    T: Transport + ?Sized,
{
    fn deliver(&self, message: &OutboundMessage) -> Result<(), MailError> {
        (**self).deliver(message)
    }
}

/// Blocking SMTP delivery through `lettre`.
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    /// Builds mailer object with specified configuration
    pub fn new(settings: &SmtpSettings) -> Result<Self, MailError> {
        let builder = match settings.encryption {
            SmtpEncryption::None => SmtpTransport::builder_dangerous(&settings.server),
            SmtpEncryption::StartTls => SmtpTransport::starttls_relay(&settings.server)?,
            SmtpEncryption::ImplicitTls => SmtpTransport::relay(&settings.server)?,
        }
        .port(settings.port)
        .timeout(Some(settings.timeout));

        // Skip credentials if any of them is empty
        let builder = if settings.has_credentials() {
            builder.credentials(Credentials::new(
                settings.user.clone(),
                settings.password.expose_secret().to_string(),
            ))
        } else {
            debug!("SMTP credentials were not provided, skipping username/password authentication");
            builder
        };

        Ok(Self {
            transport: builder.build(),
        })
    }
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer").finish_non_exhaustive()
    }
}

impl Transport for SmtpMailer {
    fn deliver(&self, message: &OutboundMessage) -> Result<(), MailError> {
        let message = message.to_message()?;
        let response = self.transport.send(&message)?;
        debug!("SMTP response: {response:?}");
        Ok(())
    }
}

/// Keeps delivered messages in memory instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<OutboundMessage>>,
    failing_recipients: Vec<String>,
    fail_all: bool,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that rejects every message.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Reject messages addressed to `address`.
    #[must_use]
    pub fn with_failing_recipient<S>(mut self, address: S) -> Self
    where
        S: Into<String>,
    {
        self.failing_recipients.push(address.into());
        self
    }

    /// Messages delivered so far, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for RecordingTransport {
    fn deliver(&self, message: &OutboundMessage) -> Result<(), MailError> {
        let rejected = message.to().iter().find(|recipient| {
            self.failing_recipients
                .iter()
                .any(|address| address.eq_ignore_ascii_case(&recipient.address))
        });
        if self.fail_all {
            return Err(MailError::TransportError("delivery disabled".into()));
        }
        if let Some(recipient) = rejected {
            return Err(MailError::TransportError(format!(
                "recipient {} rejected",
                recipient.address
            )));
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}
