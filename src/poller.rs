use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::body;
use crate::config::Settings;
use crate::connection::ConnectionHandle;
use crate::models::{Account, AccountKey, NotificationRecord};
use crate::providers::{Connector, ProviderError, RawMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Disconnected,
    Connecting,
    Ready,
    Checking,
    Closing,
}

/// UIDs already evaluated for one mailbox, valid only under one UIDVALIDITY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSet {
    uid_validity: Option<u32>,
    uids: HashSet<u32>,
}

impl SeenSet {
    pub fn contains(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Attaches the set to a new session. Identifiers survive only when the mailbox
    /// reports the same, known UIDVALIDITY. Returns whether the set was cleared.
    pub fn rebind(&mut self, uid_validity: Option<u32>) -> bool {
        let keep = uid_validity.is_some() && uid_validity == self.uid_validity;
        self.uid_validity = uid_validity;
        if keep || self.uids.is_empty() {
            return false;
        }
        self.uids.clear();
        true
    }

    fn prune_and_extend(&mut self, unread: &[u32], evaluated: impl IntoIterator<Item = u32>) {
        let unread: HashSet<u32> = unread.iter().copied().collect();
        self.uids.retain(|uid| unread.contains(uid));
        self.uids.extend(evaluated);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub recency_window: Duration,
    pub rebuild_period: Duration,
    pub timeout: Duration,
    pub text_limit: usize,
}

impl From<&Settings> for PollOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            recency_window: settings.recency_window(),
            rebuild_period: settings.rebuild_period(),
            timeout: settings.timeout(),
            text_limit: settings.text_limit,
        }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

/// Upper bound on UIDs in one `UID FETCH`, so a large backlog is read in slices.
const MAX_UIDS_PER_FETCH: usize = 500;

struct UnreadSnapshot {
    unread: Vec<u32>,
    /// Every UID requested this check, answered by the server or not.
    evaluated: Vec<u32>,
    messages: Vec<RawMessage>,
}

/// Polls one account. Owns that account's connection and seen-set; callers must not
/// run two operations on the same poller at once.
pub struct MailPoller {
    account: Account,
    connector: Arc<dyn Connector>,
    handle: Option<ConnectionHandle>,
    seen: SeenSet,
    state: PollerState,
    last_error: Option<ProviderError>,
    rebuild_requested: bool,
}

impl MailPoller {
    pub fn new(account: Account, connector: Arc<dyn Connector>) -> Self {
        Self {
            account,
            connector,
            handle: None,
            seen: SeenSet::default(),
            state: PollerState::Disconnected,
            last_error: None,
            rebuild_requested: false,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn key(&self) -> AccountKey {
        self.account.key()
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn last_error(&self) -> Option<&ProviderError> {
        self.last_error.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(ConnectionHandle::is_open)
    }

    pub fn connection_age(&self) -> Option<Duration> {
        self.handle.as_ref().map(|handle| handle.age(Instant::now()))
    }

    /// Makes the next [`MailPoller::ensure_connected`] replace the current connection.
    pub fn request_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    pub async fn connect(&mut self, limit: Duration) -> Result<(), ProviderError> {
        if let Some(old) = self.handle.take() {
            old.close_in_background();
        }
        self.state = PollerState::Connecting;
        let key = self.key();

        match ConnectionHandle::open_with_timeout(
            Arc::clone(&self.connector),
            self.account.clone(),
            limit,
        )
        .await
        {
            Ok(handle) => {
                if self.seen.rebind(handle.uid_validity()) {
                    info!(account = %key, "mailbox uid validity changed, seen set cleared");
                }
                self.handle = Some(handle);
                self.state = PollerState::Ready;
                self.last_error = None;
                debug!(account = %key, "poller connected");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Logs the current session out in the background and forgets it.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.state = PollerState::Closing;
            handle.close_in_background();
        }
        self.state = PollerState::Disconnected;
    }

    /// Reconnects when a rebuild was requested, when the connection is older than the
    /// rebuild period, or when there is no connection at all.
    pub async fn ensure_connected(&mut self, options: &PollOptions) -> Result<(), ProviderError> {
        let now = Instant::now();
        let stale = self
            .handle
            .as_ref()
            .is_some_and(|handle| handle.is_stale(now, options.rebuild_period));

        if self.rebuild_requested || stale {
            info!(account = %self.key(), stale, "rebuilding imap connection");
            self.rebuild_requested = false;
            self.disconnect();
        }

        if self.is_connected() {
            return Ok(());
        }
        self.connect(options.timeout).await
    }

    /// Looks for unread messages that arrived within the recency window and were not
    /// reported before. Records come back oldest first.
    pub async fn check_and_notify(
        &mut self,
        options: &PollOptions,
    ) -> Result<Vec<NotificationRecord>, ProviderError> {
        let key = self.key();
        let mut handle = match self.handle.take() {
            Some(handle) if handle.is_open() => handle,
            _ => {
                self.state = PollerState::Disconnected;
                return Err(ProviderError::Network(format!("{key} is not connected")));
            }
        };

        if handle.is_stale(Instant::now(), options.rebuild_period) {
            handle.close_in_background();
            self.state = PollerState::Disconnected;
            return Err(ProviderError::Network(format!(
                "connection for {key} is older than the rebuild period"
            )));
        }

        self.state = PollerState::Checking;
        let known = self.seen.uids.clone();
        let now = Utc::now();
        let window = options.recency_window;
        let worker = task::spawn_blocking(move || {
            let outcome = read_unread(&mut handle, &known, now, window);
            (handle, outcome)
        });

        let snapshot = match timeout(options.timeout, worker).await {
            Err(_) => {
                return Err(self.fail(ProviderError::timed_out("mail check", options.timeout)));
            }
            Ok(Err(join_err)) => return Err(self.fail(join_err.into())),
            Ok(Ok((handle, Err(err)))) => {
                handle.close_in_background();
                return Err(self.fail(err));
            }
            Ok(Ok((handle, Ok(snapshot)))) => {
                self.handle = Some(handle);
                self.state = PollerState::Ready;
                snapshot
            }
        };

        let records = select_recent(
            &key,
            snapshot.messages,
            now,
            options.recency_window,
            options.text_limit,
        );
        self.seen.prune_and_extend(&snapshot.unread, snapshot.evaluated);

        debug!(
            account = %key,
            unread = snapshot.unread.len(),
            new = records.len(),
            seen = self.seen.len(),
            "mail check finished"
        );
        Ok(records)
    }

    /// One scheduled step: reconnect if needed, then check.
    pub async fn poll(&mut self, options: &PollOptions) -> Result<Vec<NotificationRecord>, ProviderError> {
        self.ensure_connected(options).await?;
        self.check_and_notify(options).await
    }

    fn fail(&mut self, err: ProviderError) -> ProviderError {
        let key = self.key();
        match &err {
            ProviderError::Protocol(detail) => {
                error!(account = %key, state = ?self.state, %detail, "imap protocol error, dropping connection")
            }
            ProviderError::Network(detail) => {
                warn!(account = %key, state = ?self.state, %detail, "imap network error, dropping connection")
            }
            ProviderError::Authentication(detail) => {
                warn!(account = %key, %detail, "imap login rejected")
            }
        }
        if let Some(handle) = self.handle.take() {
            handle.close_in_background();
        }
        self.state = PollerState::Disconnected;
        self.last_error = Some(err.clone());
        err
    }
}

impl Drop for MailPoller {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reads headers of unread mail not seen before, then full bodies for the ones dated
/// within `window` of `now`.
fn read_unread(
    handle: &mut ConnectionHandle,
    known: &HashSet<u32>,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<UnreadSnapshot, ProviderError> {
    let key = handle.account().clone();
    let session = handle.session()?;
    let unread = session.search_unseen()?;
    let fresh: Vec<u32> = unread.iter().copied().filter(|uid| !known.contains(uid)).collect();

    let mut recent = Vec::new();
    for chunk in fresh.chunks(MAX_UIDS_PER_FETCH) {
        let headers = session.fetch_headers(chunk)?;
        if headers.len() < chunk.len() {
            debug!(account = %key, requested = chunk.len(), returned = headers.len(), "server skipped some header fetches");
        }
        recent.extend(
            headers
                .into_iter()
                .filter(|header| {
                    body::header_date(&header.body)
                        .or(header.internal_date)
                        .is_some_and(|sent_at| within_window(now, sent_at, window))
                })
                .map(|header| header.uid),
        );
    }

    let mut messages = Vec::with_capacity(recent.len());
    for chunk in recent.chunks(MAX_UIDS_PER_FETCH) {
        messages.extend(session.fetch(chunk)?);
    }
    if messages.len() < recent.len() {
        warn!(account = %key, requested = recent.len(), returned = messages.len(), "server skipped some message fetches");
    }

    debug!(account = %key, fresh = fresh.len(), recent = recent.len(), "unread mail read");
    Ok(UnreadSnapshot {
        unread,
        evaluated: fresh,
        messages,
    })
}

fn within_window(now: DateTime<Utc>, timestamp: DateTime<Utc>, window: Duration) -> bool {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    now.signed_duration_since(timestamp).num_milliseconds().unsigned_abs() <= window_ms
}

/// Turns fetched messages into notification records, dropping anything without a
/// usable timestamp or dated outside `window` around `now` in either direction.
pub fn select_recent(
    account: &AccountKey,
    messages: Vec<RawMessage>,
    now: DateTime<Utc>,
    window: Duration,
    text_limit: usize,
) -> Vec<NotificationRecord> {
    let mut records: Vec<NotificationRecord> = messages
        .into_iter()
        .filter_map(|message| {
            let summary = match body::summarize(&message.body, text_limit) {
                Ok(summary) => summary,
                Err(err) => {
                    debug!(account = %account, uid = message.uid, %err, "unparsable message skipped");
                    return None;
                }
            };

            let Some(timestamp) = summary.sent_at.or(message.internal_date) else {
                debug!(account = %account, uid = message.uid, "message has no usable date, skipped");
                return None;
            };

            if !within_window(now, timestamp, window) {
                debug!(account = %account, uid = message.uid, %timestamp, "message outside recency window");
                return None;
            }

            Some(NotificationRecord {
                account: account.clone(),
                uid: message.uid,
                timestamp,
                subject: summary.subject,
                preview: summary.preview,
            })
        })
        .collect();

    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.uid.cmp(&b.uid)));
    records
}
