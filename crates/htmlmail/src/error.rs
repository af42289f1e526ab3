use htmlmail_common::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    LettreError(#[from] lettre::error::Error),

    #[error(transparent)]
    AddressError(#[from] lettre::address::AddressError),

    #[error(transparent)]
    SmtpError(#[from] lettre::transport::smtp::Error),

    #[error(transparent)]
    ConfigError(#[from] ConfigError),

    #[error("Invalid content type {0}")]
    InvalidContentType(String),

    #[error("No recipients")]
    NoRecipients,

    // Failures reported by non-SMTP transports.
    #[error("Transport error: {0}")]
    TransportError(String),
}
