use crate::models::Account;
use ::imap::Error as ImapError;
use chrono::{DateTime, Utc};
use native_tls::{Error as TlsError, HandshakeError};
use serde::Serialize;
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;

pub mod imap;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Category of the last failure seen for an account, kept for status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Authentication,
    Network,
    Protocol,
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Authentication(_) => ErrorKind::Authentication,
            ProviderError::Network(_) => ErrorKind::Network,
            ProviderError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    pub fn timed_out(operation: &str, limit: Duration) -> Self {
        Self::Network(format!("{operation} timed out after {}s", limit.as_secs_f64()))
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(value: std::io::Error) -> Self {
        Self::Network(value.to_string())
    }
}

impl From<TlsError> for ProviderError {
    fn from(value: TlsError) -> Self {
        Self::Network(value.to_string())
    }
}

impl From<HandshakeError<TcpStream>> for ProviderError {
    fn from(value: HandshakeError<TcpStream>) -> Self {
        Self::Network(format!("tls handshake failed: {value}"))
    }
}

impl From<ImapError> for ProviderError {
    fn from(value: ImapError) -> Self {
        match value {
            ImapError::Io(err) => Self::Network(err.to_string()),
            ImapError::Tls(err) => Self::Network(err.to_string()),
            ImapError::TlsHandshake(err) => Self::Network(format!("tls handshake failed: {err}")),
            ImapError::ConnectionLost => Self::Network("connection lost".into()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ProviderError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Network(format!("background task failure: {value}"))
    }
}

/// A message as returned by `UID FETCH`, before any parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

/// An authenticated session with `INBOX` selected.
///
/// Every method blocks on the network; callers run them on the blocking pool.
pub trait MailSession: Send {
    fn uid_validity(&self) -> Option<u32>;

    fn search_unseen(&mut self) -> Result<Vec<u32>, ProviderError>;

    /// Like [`MailSession::fetch`] but `body` only holds the header block.
    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError>;

    fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError>;

    fn logout(&mut self) -> Result<(), ProviderError>;
}

pub trait Connector: Send + Sync {
    /// Connects, logs in and selects `INBOX`, giving up after `timeout` on any single
    /// socket operation.
    fn connect(
        &self,
        account: &Account,
        timeout: Duration,
    ) -> Result<Box<dyn MailSession>, ProviderError>;
}
