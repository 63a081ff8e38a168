//! Watches IMAP inboxes and reports newly arrived unread mail.
//!
//! A [`Scheduler`] keeps one long-lived connection per account, polls them all on a shared
//! interval and hands back [`NotificationRecord`]s for messages that arrived recently.

pub mod body;
pub mod cache;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod models;
pub mod poller;
pub mod providers;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use cache::ValidityCache;
pub use config::{ConfigError, Settings};
pub use models::{Account, AccountKey, NotificationBatch, NotificationRecord};
pub use providers::{Connector, ErrorKind, ProviderError};
pub use scheduler::{AdminError, Scheduler};
