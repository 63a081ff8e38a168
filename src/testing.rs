//! In-memory IMAP stand-in used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::Account;
use crate::providers::{Connector, MailSession, ProviderError, RawMessage};

#[derive(Default)]
struct MailboxState {
    messages: Vec<StoredMessage>,
    uid_validity: Option<u32>,
    next_uid: u32,
    reject_logins: bool,
    fail_search: bool,
    connect_delay: Option<Duration>,
    search_delay: Option<Duration>,
    fetch_cost: Option<Duration>,
    omitted: Vec<u32>,
    largest_fetch: usize,
    requested: usize,
    connects: usize,
    logouts: usize,
    searches: usize,
}

struct StoredMessage {
    uid: u32,
    unseen: bool,
    internal_date: Option<DateTime<Utc>>,
    raw: Vec<u8>,
}

#[derive(Clone)]
pub(crate) struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        let state = MailboxState {
            uid_validity: Some(1),
            next_uid: 1,
            ..MailboxState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Adds an unread plain-text message with a `Date` header and returns its UID.
    pub fn deliver(&self, date: DateTime<Utc>, subject: &str, body: &str) -> u32 {
        let raw = format!(
            "From: sender@test\r\nSubject: {subject}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n",
            date.to_rfc2822()
        );
        self.deliver_raw(raw.into_bytes(), Some(date))
    }

    pub fn deliver_raw(&self, raw: Vec<u8>, internal_date: Option<DateTime<Utc>>) -> u32 {
        let mut state = self.state.lock();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.messages.push(StoredMessage {
            uid,
            unseen: true,
            internal_date,
            raw,
        });
        uid
    }

    pub fn mark_seen(&self, uid: u32) {
        let mut state = self.state.lock();
        if let Some(message) = state.messages.iter_mut().find(|message| message.uid == uid) {
            message.unseen = false;
        }
    }

    pub fn set_uid_validity(&self, value: Option<u32>) {
        self.state.lock().uid_validity = value;
    }

    pub fn reject_logins(&self, reject: bool) {
        self.state.lock().reject_logins = reject;
    }

    pub fn fail_searches(&self, fail: bool) {
        self.state.lock().fail_search = fail;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    pub fn set_search_delay(&self, delay: Option<Duration>) {
        self.state.lock().search_delay = delay;
    }

    /// Time a full-body fetch spends per returned message.
    pub fn set_fetch_cost(&self, cost: Duration) {
        self.state.lock().fetch_cost = Some(cost);
    }

    /// Makes every fetch silently leave `uid` out of its response.
    pub fn omit_from_fetches(&self, uid: u32) {
        self.state.lock().omitted.push(uid);
    }

    /// Largest UID set seen by any single fetch.
    pub fn largest_fetch(&self) -> usize {
        self.state.lock().largest_fetch
    }

    /// Total UIDs asked for across every fetch.
    pub fn requested(&self) -> usize {
        self.state.lock().requested
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn logouts(&self) -> usize {
        self.state.lock().logouts
    }

    pub fn searches(&self) -> usize {
        self.state.lock().searches
    }
}

#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<MailboxState>>,
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _account: &Account,
        _timeout: Duration,
    ) -> Result<Box<dyn MailSession>, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let state = self.state.lock();
        if state.reject_logins {
            return Err(ProviderError::Authentication("[AUTHENTICATIONFAILED] invalid credentials".into()));
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            uid_validity: state.uid_validity,
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<MailboxState>>,
    uid_validity: Option<u32>,
}

impl FakeSession {
    fn answer(&self, uids: &[u32]) -> Vec<RawMessage> {
        let mut state = self.state.lock();
        state.largest_fetch = state.largest_fetch.max(uids.len());
        state.requested += uids.len();
        let wanted: HashSet<u32> = uids.iter().copied().collect();
        state
            .messages
            .iter()
            .filter(|message| wanted.contains(&message.uid) && !state.omitted.contains(&message.uid))
            .map(|message| RawMessage {
                uid: message.uid,
                internal_date: message.internal_date,
                body: message.raw.clone(),
            })
            .collect()
    }
}

impl MailSession for FakeSession {
    fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state.searches += 1;
            state.search_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let state = self.state.lock();
        if state.fail_search {
            return Err(ProviderError::Network("connection reset by peer".into()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|message| message.unseen)
            .map(|message| message.uid)
            .collect())
    }

    fn fetch_headers(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError> {
        Ok(self.answer(uids))
    }

    fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ProviderError> {
        let messages = self.answer(uids);
        let cost = self.state.lock().fetch_cost;
        if let Some(cost) = cost {
            std::thread::sleep(cost * messages.len() as u32);
        }
        Ok(messages)
    }

    fn logout(&mut self) -> Result<(), ProviderError> {
        self.state.lock().logouts += 1;
        Ok(())
    }
}

/// Routes connections to one [`FakeMailbox`] per user. Unknown users fail to log in.
#[derive(Clone, Default)]
pub(crate) struct FakeDirectory {
    mailboxes: Arc<Mutex<HashMap<String, FakeMailbox>>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mailbox(&self, user: &str) -> FakeMailbox {
        self.mailboxes
            .lock()
            .entry(user.to_string())
            .or_insert_with(FakeMailbox::new)
            .clone()
    }
}

impl Connector for FakeDirectory {
    fn connect(
        &self,
        account: &Account,
        timeout: Duration,
    ) -> Result<Box<dyn MailSession>, ProviderError> {
        let mailbox = self.mailboxes.lock().get(&account.user).cloned();
        match mailbox {
            Some(mailbox) => mailbox.connector().connect(account, timeout),
            None => Err(ProviderError::Authentication(format!("no such user {}", account.user))),
        }
    }
}
