use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::config::ConfigError;
use crate::poller::PollerState;
use crate::providers::ErrorKind;

pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Identity of a mailbox: one user on one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AccountKey {
    pub server: String,
    pub user: String,
}

impl Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.server, self.user)
    }
}

pub struct Account {
    pub server: String,
    pub user: String,
    pub port: u16,
    pub tls: bool,
    secret: SecretString,
}

impl Account {
    pub fn new(server: String, user: String, secret: String) -> Self {
        Self {
            server,
            user,
            port: DEFAULT_IMAP_PORT,
            tls: true,
            secret: SecretString::new(secret),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn key(&self) -> AccountKey {
        AccountKey {
            server: self.server.clone(),
            user: self.user.clone(),
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl Clone for Account {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            user: self.user.clone(),
            port: self.port,
            tls: self.tls,
            secret: SecretString::new(self.secret.expose_secret().clone()),
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("server", &self.server)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Parses `server,user,secret`. The server may carry an explicit `:port` and the
/// secret keeps any commas after the second separator.
impl FromStr for Account {
    type Err = ConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let mut parts = entry.trim().splitn(3, ',').map(str::trim);
        let (server, user, secret) = match (parts.next(), parts.next(), parts.next()) {
            (Some(server), Some(user), Some(secret))
                if !server.is_empty() && !user.is_empty() && !secret.is_empty() =>
            {
                (server, user, secret)
            }
            _ => return Err(ConfigError::AccountFormat(redact_entry(entry))),
        };

        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::AccountFormat(redact_entry(entry)))?;
                (host, port)
            }
            Some(_) => return Err(ConfigError::AccountFormat(redact_entry(entry))),
            None => (server, DEFAULT_IMAP_PORT),
        };

        Ok(Account::new(host.to_string(), user.to_string(), secret.to_string()).with_port(port))
    }
}

/// Keeps the first two fields of an account entry for error messages.
pub(crate) fn redact_entry(entry: &str) -> String {
    let visible: Vec<&str> = entry.trim().splitn(3, ',').take(2).map(str::trim).collect();
    if entry.matches(',').count() >= 2 {
        format!("{},***", visible.join(","))
    } else {
        visible.join(",")
    }
}

/// One new message, ready for the host to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub account: AccountKey,
    pub uid: u32,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub preview: String,
}

/// Everything produced by one scheduled cycle, together with the delivery targets that
/// were subscribed when it finished.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationBatch {
    pub notifications: Vec<NotificationRecord>,
    pub subscribers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub account: AccountKey,
    pub valid: Option<bool>,
    pub validation_error: Option<String>,
    pub state: PollerState,
    pub last_error: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    #[serde(rename = "connection_age_secs")]
    pub connection_age: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub accounts: usize,
    pub connected: usize,
    pub subscribers: Vec<String>,
    pub interval_secs: f64,
    pub text_limit: usize,
    pub rebuild_period_secs: u64,
    pub last_rebuild: Option<DateTime<Utc>>,
}
