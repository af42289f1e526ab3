use std::{env, fmt, str::FromStr, time::Duration};

use lettre::Address;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(15);

// Lookup order for each sender field; earlier bindings win.
const SENDER_NAME_VARS: [&str; 2] = ["MAIL_FROM_NAME", "SMTP_FROM_NAME"];
const SENDER_ADDRESS_VARS: [&str; 2] = ["MAIL_FROM_ADDRESS", "SMTP_FROM"];
const SENDER_PASSWORD_VARS: [&str; 2] = ["MAIL_PASSWORD", "SMTP_PASSWORD"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Sender {0} not configured")]
    MissingSender(&'static str),

    #[error("Invalid sender address {address}: {source}")]
    InvalidSenderAddress {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("SMTP not configured")]
    SmtpNotConfigured,

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid SMTP encryption: {0}")]
    InvalidEncryption(String),

    #[error("Invalid SMTP timeout {value}: {source}")]
    InvalidTimeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Reads a variable from the process environment.
fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Returns the first non-empty value: the explicit one, then each binding in order.
fn first_of<F>(explicit: Option<String>, vars: &[&str], lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = explicit.filter(|value| !value.is_empty()) {
        return Some(value);
    }
    vars.iter().find_map(|var| {
        let value = lookup(var).filter(|value| !value.is_empty())?;
        debug!("Using {var} from environment");
        Some(value)
    })
}

/// Explicit sender values; any field left `None` falls back to the environment.
#[derive(Clone, Debug, Default)]
pub struct SenderOverrides {
    pub name: Option<String>,
    pub address: Option<String>,
    pub password: Option<SecretString>,
}

/// Identity used in the `From` header and for SMTP authentication.
#[derive(Clone)]
pub struct SenderConfig {
    name: String,
    address: Address,
    password: SecretString,
}

impl SenderConfig {
    /// Create new [`SenderConfig`] from explicit values.
    pub fn new<N>(name: N, address: &str, password: SecretString) -> Result<Self, ConfigError>
    where
        N: Into<String>,
    {
        let address =
            Address::from_str(address).map_err(|source| ConfigError::InvalidSenderAddress {
                address: address.to_string(),
                source,
            })?;
        let name = name.into();
        let name = if name.is_empty() {
            address.to_string()
        } else {
            name
        };
        Ok(Self {
            name,
            address,
            password,
        })
    }

    /// Resolve sender from `overrides`, then `MAIL_*`, then `SMTP_*` variables.
    pub fn from_env(overrides: SenderOverrides) -> Result<Self, ConfigError> {
        Self::from_lookup(overrides, env_lookup)
    }

    /// Same as [`SenderConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(overrides: SenderOverrides, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = first_of(overrides.address, &SENDER_ADDRESS_VARS, &lookup)
            .ok_or(ConfigError::MissingSender("address"))?;
        let password = match overrides
            .password
            .filter(|password| !password.expose_secret().is_empty())
        {
            Some(password) => password,
            None => first_of(None, &SENDER_PASSWORD_VARS, &lookup)
                .map(SecretString::from)
                .ok_or(ConfigError::MissingSender("password"))?,
        };
        let name = first_of(overrides.name, &SENDER_NAME_VARS, &lookup).unwrap_or_default();

        Self::new(name, &address, password)
    }

    /// Getter for `name`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Getter for `address`.
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for SenderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum SmtpEncryption {
    #[strum(to_string = "none", serialize = "plain")]
    None,
    #[default]
    #[strum(to_string = "starttls", serialize = "start_tls")]
    StartTls,
    #[strum(to_string = "tls", serialize = "implicit_tls", serialize = "ssl")]
    ImplicitTls,
}

/// SMTP relay configuration.
#[derive(Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub encryption: SmtpEncryption,
    pub user: String,
    pub password: SecretString,
    pub timeout: Duration,
}

impl SmtpSettings {
    /// Settings for `server` with default port, STARTTLS and no credentials.
    #[must_use]
    pub fn new<S>(server: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            server: server.into(),
            port: DEFAULT_SMTP_PORT,
            encryption: SmtpEncryption::default(),
            user: String::new(),
            password: SecretString::from(String::new()),
            timeout: DEFAULT_SMTP_TIMEOUT,
        }
    }

    /// Reads `SMTP_SERVER`, `SMTP_PORT`, `SMTP_ENCRYPTION`, `SMTP_USER`,
    /// `SMTP_PASSWORD` and `SMTP_TIMEOUT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let server = get("SMTP_SERVER").ok_or(ConfigError::SmtpNotConfigured)?;
        let port = match get("SMTP_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port))?,
            None => DEFAULT_SMTP_PORT,
        };
        let encryption = match get("SMTP_ENCRYPTION") {
            Some(value) => SmtpEncryption::from_str(value.trim())
                .map_err(|_| ConfigError::InvalidEncryption(value))?,
            None => SmtpEncryption::default(),
        };
        let timeout = match get("SMTP_TIMEOUT") {
            Some(value) => humantime::parse_duration(value.trim())
                .map_err(|source| ConfigError::InvalidTimeout { value, source })?,
            None => DEFAULT_SMTP_TIMEOUT,
        };

        Ok(Self {
            server,
            port,
            encryption,
            user: get("SMTP_USER").unwrap_or_default(),
            password: SecretString::from(get("SMTP_PASSWORD").unwrap_or_default()),
            timeout,
        })
    }

    /// Fill missing credentials from the sender identity.
    #[must_use]
    pub fn with_sender_credentials(mut self, sender: &SenderConfig) -> Self {
        if self.user.is_empty() {
            self.user = sender.address().to_string();
        }
        if self.password.expose_secret().is_empty() {
            self.password = sender.password().clone();
        }
        self
    }

    /// Whether both user name and password are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.password.expose_secret().is_empty()
    }
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("encryption", &self.encryption)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
