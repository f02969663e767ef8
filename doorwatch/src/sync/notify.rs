//! Self-expiring operator notifications. Insertion order is display order;
//! every entry lives for the same TTL, so the queue is also expiry-ordered.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub severity: Severity,
    /// Wall clock time of emission, for display.
    pub created: DateTime<Utc>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

pub struct NotificationQueue {
    ttl: Duration,
    next_id: u64,
    entries: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn new(ttl: Duration) -> NotificationQueue {
        NotificationQueue {
            ttl,
            next_id: 0,
            entries: VecDeque::new(),
        }
    }

    pub fn emit(&mut self, message: impl Into<String>, severity: Severity, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Notification {
            id,
            message: message.into(),
            severity,
            created: Utc::now(),
            created_at: now,
            expires_at: now + self.ttl,
        });
        id
    }

    /// Drops expired entries, returning how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        while let Some(front) = self.entries.front() {
            if front.expires_at > now {
                break;
            }
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.front().map(|n| n.expires_at)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Notification> {
        self.entries.iter().cloned().collect()
    }
}
