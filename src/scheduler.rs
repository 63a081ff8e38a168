use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ValidityCache;
use crate::config::{check_interval, check_text_limit, ConfigError, Settings};
use crate::delivery::DeliveryLog;
use crate::models::{
    redact_entry, Account, AccountKey, AccountStatus, NotificationBatch, NotificationRecord,
    SchedulerStatus,
};
use crate::poller::{MailPoller, PollOptions};
use crate::providers::{Connector, ProviderError};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("account {0} is already configured")]
    AccountExists(AccountKey),
    #[error("no configured account matches `{0}`")]
    AccountNotFound(String),
    #[error("login test for {account} failed: {reason}")]
    ValidationFailed { account: AccountKey, reason: String },
    #[error("delivery target must not be empty")]
    EmptyTarget,
    #[error("`{0}` is not subscribed")]
    NotSubscribed(String),
    #[error("mail watch is already running")]
    AlreadyRunning,
    #[error("mail watch is not running")]
    NotRunning,
}

/// Drives one [`MailPoller`] per account on a shared cadence and hands new mail to the
/// host. Cloning is cheap; every clone controls the same loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    connector: Arc<dyn Connector>,
    cache: Arc<ValidityCache>,
    settings: RwLock<Settings>,
    accounts: RwLock<Vec<AccountSlot>>,
    subscriptions: Mutex<BTreeSet<String>>,
    deliveries: Mutex<DeliveryLog>,
    last_rebuild: Mutex<Option<RebuildMark>>,
    running: AsyncMutex<Option<LoopHandle>>,
    outbox: UnboundedSender<NotificationBatch>,
}

#[derive(Clone)]
struct AccountSlot {
    account: Account,
    poller: Arc<AsyncMutex<MailPoller>>,
}

impl AccountSlot {
    fn new(account: Account, connector: Arc<dyn Connector>) -> Self {
        let poller = MailPoller::new(account.clone(), connector);
        Self {
            account,
            poller: Arc::new(AsyncMutex::new(poller)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RebuildMark {
    at: Instant,
    wall: DateTime<Utc>,
}

impl RebuildMark {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What `remove_account` matches on: a bare user, or a server and user pair.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AccountSelector {
    User(String),
    Key(AccountKey),
}

impl AccountSelector {
    fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::AccountFormat(redact_entry(entry));
        let mut fields = entry.trim().splitn(3, ',').map(str::trim);
        let first = fields.next().unwrap_or_default();
        if first.is_empty() {
            return Err(invalid());
        }

        match fields.next() {
            None => Ok(Self::User(first.to_string())),
            Some("") => Err(invalid()),
            Some(user) => {
                let server = first.rsplit_once(':').map_or(first, |(host, _)| host);
                Ok(Self::Key(AccountKey {
                    server: server.to_string(),
                    user: user.to_string(),
                }))
            }
        }
    }

    fn matches(&self, account: &Account) -> bool {
        match self {
            Self::User(user) => account.user == *user,
            Self::Key(key) => account.key() == *key,
        }
    }
}

impl fmt::Display for AccountSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => f.write_str(user),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

impl SchedulerInner {
    fn slots(&self) -> Vec<AccountSlot> {
        self.accounts.read().clone()
    }

    fn poll_options(&self) -> PollOptions {
        PollOptions::from(&*self.settings.read())
    }

    /// True once per elapsed rebuild period. The first call only starts the clock.
    fn take_rebuild_due(&self, period: Duration) -> bool {
        let mut last = self.last_rebuild.lock();
        match *last {
            Some(mark) if mark.at.elapsed() < period => false,
            Some(_) => {
                *last = Some(RebuildMark::now());
                true
            }
            None => {
                *last = Some(RebuildMark::now());
                false
            }
        }
    }

    /// Gets the poller connected. Accounts whose credentials are cached as bad are left
    /// alone until the entry expires or is invalidated.
    async fn prepare(&self, poller: &mut MailPoller, options: &PollOptions, rebuild: bool) -> bool {
        let key = poller.key();
        if rebuild {
            poller.request_rebuild();
        }

        let was_connected = poller.is_connected();
        if !was_connected {
            if let Some(entry) = self.cache.lookup(&key).filter(|entry| !entry.valid) {
                debug!(account = %key, error = ?entry.error, "skipping account with rejected credentials");
                return false;
            }
        }

        match poller.ensure_connected(options).await {
            Ok(()) => {
                if !was_connected {
                    self.cache.record(&key, Ok(()));
                }
                true
            }
            Err(err) => {
                if matches!(err, ProviderError::Authentication(_)) {
                    self.cache.record(&key, Err(&err));
                }
                false
            }
        }
    }

    async fn poll_account(
        &self,
        slot: AccountSlot,
        options: PollOptions,
        rebuild: bool,
    ) -> Vec<NotificationRecord> {
        let mut poller = slot.poller.lock().await;
        if !self.prepare(&mut poller, &options, rebuild).await {
            return Vec::new();
        }

        match poller.check_and_notify(&options).await {
            Ok(records) => {
                if !records.is_empty() {
                    info!(account = %poller.key(), count = records.len(), "new mail");
                }
                records
            }
            // already logged and classified by the poller
            Err(_) => Vec::new(),
        }
    }

    /// Holds the poller lock while revalidating, so a probe never runs beside a connect.
    async fn account_status(&self, slot: &AccountSlot) -> AccountStatus {
        let key = slot.account.key();
        let poller = slot.poller.lock().await;
        if poller.is_connected() && self.cache.lookup(&key).is_none() {
            self.cache.record(&key, Ok(()));
        } else {
            self.cache.validate(&slot.account).await;
        }
        let entry = self.cache.snapshot(&key);

        AccountStatus {
            valid: entry.as_ref().map(|entry| entry.valid),
            validation_error: entry.and_then(|entry| entry.error),
            state: poller.state(),
            last_error: poller.last_error().map(ProviderError::kind),
            last_error_message: poller.last_error().map(ToString::to_string),
            connection_age: poller.connection_age().map(|age| age.as_secs()),
            account: key,
        }
    }
}

impl Scheduler {
    /// Builds a stopped scheduler. Batches produced by the loop arrive on the returned
    /// receiver. Duplicate accounts in `accounts` are ignored.
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<ValidityCache>,
        settings: Settings,
        accounts: Vec<Account>,
    ) -> Result<(Self, UnboundedReceiver<NotificationBatch>), ConfigError> {
        settings.validate()?;
        cache.set_ttl(settings.cache_ttl());
        cache.set_timeout(settings.timeout());

        let mut slots: Vec<AccountSlot> = Vec::with_capacity(accounts.len());
        for account in accounts {
            let key = account.key();
            if slots.iter().any(|slot| slot.account.key() == key) {
                warn!(account = %key, "duplicate account ignored");
                continue;
            }
            slots.push(AccountSlot::new(account, Arc::clone(&connector)));
        }

        let (outbox, inbox) = unbounded_channel();
        let inner = SchedulerInner {
            connector,
            cache,
            deliveries: Mutex::new(DeliveryLog::new(settings.dedup_retention())),
            settings: RwLock::new(settings),
            accounts: RwLock::new(slots),
            subscriptions: Mutex::new(BTreeSet::new()),
            last_rebuild: Mutex::new(None),
            running: AsyncMutex::new(None),
            outbox,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            inbox,
        ))
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    /// One pass over every account. Records come back in account configuration order,
    /// oldest first within an account, with recent duplicates removed.
    pub async fn run_cycle(&self) -> Vec<NotificationRecord> {
        let options = self.inner.poll_options();
        let rebuild = self.inner.take_rebuild_due(options.rebuild_period);
        if rebuild {
            info!("rebuild period elapsed, reconnecting every account");
        }

        let polls = self.inner.slots().into_iter().map(|slot| {
            let inner = Arc::clone(&self.inner);
            async move { inner.poll_account(slot, options, rebuild).await }
        });
        let records: Vec<NotificationRecord> = join_all(polls).await.into_iter().flatten().collect();

        self.inner.deliveries.lock().filter(records, Instant::now())
    }

    /// Connection health pass for hosts that drive the schedule themselves. Rebuilds
    /// handles that are due and returns how many accounts are connected afterwards.
    pub async fn maintain_connections(&self) -> usize {
        let options = self.inner.poll_options();
        let rebuild = self.inner.take_rebuild_due(options.rebuild_period);

        let checks = self.inner.slots().into_iter().map(|slot| {
            let inner = Arc::clone(&self.inner);
            async move {
                let mut poller = slot.poller.lock().await;
                inner.prepare(&mut poller, &options, rebuild).await
            }
        });
        join_all(checks).await.into_iter().filter(|connected| *connected).count()
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    pub async fn start(&self) -> Result<(), AdminError> {
        let mut running = self.inner.running.lock().await;
        if running.as_ref().is_some_and(|current| !current.handle.is_finished()) {
            return Err(AdminError::AlreadyRunning);
        }

        *self.inner.last_rebuild.lock() = Some(RebuildMark::now());
        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            run_loop(scheduler, token).await;
        });
        *running = Some(LoopHandle { cancel, handle });

        let settings = self.settings();
        info!(
            accounts = self.inner.accounts.read().len(),
            interval_secs = settings.interval_secs,
            "mail watch started"
        );
        Ok(())
    }

    /// Cancels the loop, waiting at most the stop timeout, then logs out every account.
    pub async fn stop(&self) -> Result<(), AdminError> {
        let Some(LoopHandle { cancel, mut handle }) = self.inner.running.lock().await.take() else {
            return Err(AdminError::NotRunning);
        };

        cancel.cancel();
        let limit = self.settings().stop_timeout();
        match timeout(limit, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_panic() => error!(?err, "poll loop panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(limit_secs = limit.as_secs(), "poll loop did not stop in time, aborting");
                handle.abort();
            }
        }

        for slot in self.inner.slots() {
            slot.poller.lock().await.disconnect();
        }
        info!("mail watch stopped");
        Ok(())
    }

    /// Parses `server,user,secret`, tests the login and adds the account.
    pub async fn add_account(&self, entry: &str) -> Result<AccountKey, AdminError> {
        let account: Account = entry.parse()?;
        let key = account.key();
        if self.inner.accounts.read().iter().any(|slot| slot.account.key() == key) {
            return Err(AdminError::AccountExists(key));
        }

        self.inner.cache.invalidate(&key);
        if !self.inner.cache.validate(&account).await {
            let reason = self
                .inner
                .cache
                .snapshot(&key)
                .and_then(|entry| entry.error)
                .unwrap_or_else(|| "login rejected".to_string());
            return Err(AdminError::ValidationFailed {
                account: key,
                reason,
            });
        }

        let mut accounts = self.inner.accounts.write();
        if accounts.iter().any(|slot| slot.account.key() == key) {
            return Err(AdminError::AccountExists(key));
        }
        accounts.push(AccountSlot::new(account, Arc::clone(&self.inner.connector)));
        info!(account = %key, total = accounts.len(), "account added");
        Ok(key)
    }

    /// Removes every account matching a bare user or a `server,user[,secret]` entry.
    pub async fn remove_account(&self, entry: &str) -> Result<Vec<AccountKey>, AdminError> {
        let selector = AccountSelector::parse(entry)?;
        let removed: Vec<AccountSlot> = {
            let mut accounts = self.inner.accounts.write();
            let (removed, kept): (Vec<_>, Vec<_>) = accounts
                .drain(..)
                .partition(|slot| selector.matches(&slot.account));
            *accounts = kept;
            removed
        };

        if removed.is_empty() {
            return Err(AdminError::AccountNotFound(selector.to_string()));
        }

        let mut keys = Vec::with_capacity(removed.len());
        for slot in removed {
            let key = slot.account.key();
            slot.poller.lock().await.disconnect();
            self.inner.cache.invalidate(&key);
            info!(account = %key, "account removed");
            keys.push(key);
        }
        Ok(keys)
    }

    /// Per-account report. Expired validity entries are re-checked first.
    pub async fn list_accounts(&self) -> Vec<AccountStatus> {
        let reports = self.inner.slots().into_iter().map(|slot| {
            let inner = Arc::clone(&self.inner);
            async move { inner.account_status(&slot).await }
        });
        join_all(reports).await
    }

    pub fn set_interval(&self, secs: f64) -> Result<Duration, AdminError> {
        check_interval(secs)?;
        let mut settings = self.inner.settings.write();
        settings.interval_secs = secs;
        info!(interval_secs = secs, "poll interval changed");
        Ok(settings.interval())
    }

    pub fn set_text_limit(&self, limit: usize) -> Result<usize, AdminError> {
        check_text_limit(limit)?;
        self.inner.settings.write().text_limit = limit;
        info!(text_limit = limit, "preview length changed");
        Ok(limit)
    }

    /// Closes and reopens every connection now. Returns how many reconnected.
    pub async fn force_rebuild_all(&self) -> Result<usize, AdminError> {
        if !self.is_running().await {
            return Err(AdminError::NotRunning);
        }

        let options = self.inner.poll_options();
        *self.inner.last_rebuild.lock() = Some(RebuildMark::now());
        let rebuilds = self.inner.slots().into_iter().map(|slot| {
            let inner = Arc::clone(&self.inner);
            async move {
                let mut poller = slot.poller.lock().await;
                inner.prepare(&mut poller, &options, true).await
            }
        });
        let connected = join_all(rebuilds).await.into_iter().filter(|ok| *ok).count();
        info!(connected, "forced rebuild of all connections");
        Ok(connected)
    }

    pub fn refresh_cache(&self) -> usize {
        let cleared = self.inner.cache.invalidate_all();
        info!(cleared, "validity cache cleared");
        cleared
    }

    pub async fn status(&self) -> SchedulerStatus {
        let settings = self.settings();
        let slots = self.inner.slots();
        let mut connected = 0;
        for slot in &slots {
            if slot.poller.lock().await.is_connected() {
                connected += 1;
            }
        }

        SchedulerStatus {
            running: self.is_running().await,
            accounts: slots.len(),
            connected,
            subscribers: self.subscriptions(),
            interval_secs: settings.interval_secs,
            text_limit: settings.text_limit,
            rebuild_period_secs: settings.rebuild_period_secs,
            last_rebuild: self.inner.last_rebuild.lock().map(|mark| mark.wall),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    /// Registers a delivery target and starts the loop if needed. Returns false when the
    /// target was already subscribed.
    pub async fn subscribe(&self, target: &str) -> Result<bool, AdminError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(AdminError::EmptyTarget);
        }

        let added = self.inner.subscriptions.lock().insert(target.to_string());
        if added {
            info!(target, "subscribed");
        }
        self.ensure_started().await?;
        Ok(added)
    }

    /// Drops a delivery target. The loop stops when the last one leaves.
    pub async fn unsubscribe(&self, target: &str) -> Result<(), AdminError> {
        let target = target.trim();
        let remaining = {
            let mut subscriptions = self.inner.subscriptions.lock();
            if !subscriptions.remove(target) {
                return Err(AdminError::NotSubscribed(target.to_string()));
            }
            subscriptions.len()
        };
        info!(target, remaining, "unsubscribed");

        if remaining == 0 && self.is_running().await {
            self.stop().await?;
        }
        Ok(())
    }

    /// Re-registers saved delivery targets and starts the loop when any exist.
    pub async fn restore_state<I>(&self, targets: I) -> Result<usize, AdminError>
    where
        I: IntoIterator<Item = String>,
    {
        let restored: BTreeSet<String> = targets
            .into_iter()
            .map(|target| target.trim().to_string())
            .filter(|target| !target.is_empty())
            .collect();
        let count = restored.len();
        *self.inner.subscriptions.lock() = restored;
        info!(count, "subscriptions restored");

        if count > 0 {
            self.ensure_started().await?;
        }
        Ok(count)
    }

    /// Starts the loop unless another caller already did.
    async fn ensure_started(&self) -> Result<(), AdminError> {
        match self.start().await {
            Ok(()) | Err(AdminError::AlreadyRunning) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn run_loop(scheduler: Scheduler, cancel: CancellationToken) {
    loop {
        let notifications = tokio::select! {
            _ = cancel.cancelled() => break,
            records = scheduler.run_cycle() => records,
        };

        if !notifications.is_empty() {
            let batch = NotificationBatch {
                notifications,
                subscribers: scheduler.subscriptions(),
            };
            if scheduler.inner.outbox.send(batch).is_err() {
                warn!("notification receiver dropped, batch discarded");
            }
        }

        let pause = scheduler.inner.settings.read().interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }
    debug!("poll loop exited");
}
