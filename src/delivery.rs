use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::models::{AccountKey, NotificationRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DeliveryKey {
    account: AccountKey,
    subject: String,
    minute: i64,
}

impl From<&NotificationRecord> for DeliveryKey {
    fn from(record: &NotificationRecord) -> Self {
        Self {
            account: record.account.clone(),
            subject: record.subject.clone(),
            minute: record.timestamp.timestamp().div_euclid(60),
        }
    }
}

/// Remembers what was handed to the host recently. Catches the same mail showing up
/// under a new UID after the mailbox was renumbered.
#[derive(Debug)]
pub struct DeliveryLog {
    retention: Duration,
    delivered: HashMap<DeliveryKey, Instant>,
}

impl DeliveryLog {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            delivered: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty()
    }

    /// Drops records delivered within the retention period and logs the rest as
    /// delivered. Order is preserved.
    pub fn filter(&mut self, records: Vec<NotificationRecord>, now: Instant) -> Vec<NotificationRecord> {
        let retention = self.retention;
        self.delivered
            .retain(|_, delivered_at| now.saturating_duration_since(*delivered_at) < retention);

        records
            .into_iter()
            .filter(|record| {
                let key = DeliveryKey::from(record);
                if self.delivered.contains_key(&key) {
                    debug!(account = %record.account, uid = record.uid, "duplicate notification suppressed");
                    return false;
                }
                self.delivered.insert(key, now);
                true
            })
            .collect()
    }
}
