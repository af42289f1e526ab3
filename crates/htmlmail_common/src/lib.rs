//! Shared configuration for `htmlmail`: sender identity and SMTP settings.

pub mod config;

pub use crate::config::{ConfigError, SenderConfig, SenderOverrides, SmtpEncryption, SmtpSettings};
