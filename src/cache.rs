use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::models::{Account, AccountKey};
use crate::providers::{Connector, ProviderError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub valid: bool,
    pub checked_at: Instant,
    pub error: Option<String>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.checked_at) < ttl
    }
}

/// Remembers whether each account could log in, so status checks do not hit the
/// network every time.
pub struct ValidityCache {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<AccountKey, CacheEntry>>,
    ttl: RwLock<Duration>,
    timeout: RwLock<Duration>,
}

impl ValidityCache {
    pub fn new(connector: Arc<dyn Connector>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            ttl: RwLock::new(ttl),
            timeout: RwLock::new(timeout),
        }
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// Cached result for `key` if it is still within the time-to-live.
    pub fn lookup(&self, key: &AccountKey) -> Option<CacheEntry> {
        let ttl = self.ttl();
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_fresh(now, ttl))
            .cloned()
    }

    /// Last recorded result for `key`, expired or not.
    pub fn snapshot(&self, key: &AccountKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns whether `account` can log in. Only touches the network when there is no
    /// fresh entry; the probe connection is logged out right away.
    pub async fn validate(&self, account: &Account) -> bool {
        let key = account.key();
        if let Some(entry) = self.lookup(&key) {
            debug!(account = %key, valid = entry.valid, "validity cache hit");
            return entry.valid;
        }

        let limit = *self.timeout.read();
        let outcome = ConnectionHandle::open_with_timeout(
            Arc::clone(&self.connector),
            account.clone(),
            limit,
        )
        .await;

        match outcome {
            Ok(handle) => {
                handle.close_with_timeout(limit).await;
                info!(account = %key, "account validated");
                self.record(&key, Ok(()));
                true
            }
            Err(err) => {
                warn!(account = %key, %err, "account validation failed");
                self.record(&key, Err(&err));
                false
            }
        }
    }

    pub fn record(&self, key: &AccountKey, outcome: Result<(), &ProviderError>) {
        let entry = CacheEntry {
            valid: outcome.is_ok(),
            checked_at: Instant::now(),
            error: outcome.err().map(ToString::to_string),
        };
        self.entries.lock().insert(key.clone(), entry);
    }

    pub fn invalidate(&self, key: &AccountKey) {
        self.entries.lock().remove(key);
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock();
        let cleared = entries.len();
        entries.clear();
        cleared
    }
}
