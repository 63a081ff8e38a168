use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::models::{Account, AccountKey};
use crate::providers::{Connector, MailSession, ProviderError};

/// One authenticated IMAP session, owned by exactly one poller.
///
/// The session is logged out when the handle is closed or dropped, whichever comes
/// first, so a handle abandoned after a timeout still releases its server-side state.
pub struct ConnectionHandle {
    account: AccountKey,
    session: Option<Box<dyn MailSession>>,
    uid_validity: Option<u32>,
    created_at: Instant,
    last_used: Instant,
}

impl ConnectionHandle {
    /// Blocking open. Use [`ConnectionHandle::open_with_timeout`] from async code.
    pub fn open(
        connector: &dyn Connector,
        account: &Account,
        io_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let session = connector.connect(account, io_timeout)?;
        let now = Instant::now();
        Ok(Self {
            account: account.key(),
            uid_validity: session.uid_validity(),
            session: Some(session),
            created_at: now,
            last_used: now,
        })
    }

    /// Opens on the blocking pool and gives up after `limit`. A connection that
    /// completes after the deadline is logged out and discarded.
    pub async fn open_with_timeout(
        connector: Arc<dyn Connector>,
        account: Account,
        limit: Duration,
    ) -> Result<Self, ProviderError> {
        let worker = task::spawn_blocking(move || Self::open(connector.as_ref(), &account, limit));
        match timeout(limit, worker).await {
            Ok(joined) => joined?,
            Err(_) => Err(ProviderError::timed_out("connect", limit)),
        }
    }

    pub fn account(&self) -> &AccountKey {
        &self.account
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > max_age
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Borrows the live session and marks the handle as used.
    pub fn session(&mut self) -> Result<&mut dyn MailSession, ProviderError> {
        self.last_used = Instant::now();
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(ProviderError::Network(format!(
                "connection for {} is closed",
                self.account
            ))),
        }
    }

    /// Logs out. Safe to call any number of times; only the first call talks to the
    /// server.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.logout() {
                Ok(()) => debug!(account = %self.account, "imap session logged out"),
                Err(err) => {
                    debug!(account = %self.account, %err, "logout failed, dropping session")
                }
            }
        }
    }

    /// Closes on the blocking pool and waits at most `limit` for the logout to finish.
    pub async fn close_with_timeout(mut self, limit: Duration) {
        if !self.is_open() {
            return;
        }
        let account = self.account.clone();
        let worker = task::spawn_blocking(move || self.close());
        if timeout(limit, worker).await.is_err() {
            warn!(account = %account, "logout did not finish in time, leaving it in the background");
        }
    }

    /// Closes on the blocking pool without waiting for the server. Outside a runtime
    /// the logout runs inline.
    pub fn close_in_background(mut self) {
        if !self.is_open() {
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || self.close());
            }
            Err(_) => {
                warn!(account = %self.account, "no runtime available, closing inline");
                self.close();
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
