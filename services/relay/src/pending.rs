//! Pending-session tracker.
//!
//! Session requests that found no subscriber wait here until a wallet picks
//! them up or they expire. A min-heap ordered by expiry gives O(1) peek and
//! O(log n) pop; deletions by topic are recorded in the by-topic map and the
//! heap drops stale entries lazily.

use crate::client::Client;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

/// A session request waiting for a wallet.
pub struct PendingSession {
    pub expires_at: Instant,
    pub topic: String,
    pub dapp: Arc<Client>,
}

#[derive(Default)]
pub struct PendingSessionTracker {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    by_topic: HashMap<String, (Instant, Arc<Client>)>,
}

impl PendingSessionTracker {
    pub fn new() -> Self {
        PendingSessionTracker::default()
    }

    /// Track `topic` until `expires_at`. Inserting an already-tracked topic
    /// is a no-op; returns whether the entry was added.
    pub fn insert(&mut self, topic: &str, expires_at: Instant, dapp: Arc<Client>) -> bool {
        if self.by_topic.contains_key(topic) {
            return false;
        }
        self.by_topic.insert(topic.to_owned(), (expires_at, dapp));
        self.heap.push(Reverse((expires_at, topic.to_owned())));
        true
    }

    /// Stop tracking `topic`. Returns whether it was tracked.
    pub fn delete_by_topic(&mut self, topic: &str) -> bool {
        self.by_topic.remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// Expiry and topic of the earliest-expiring tracked session.
    pub fn peek_earliest(&mut self) -> Option<(Instant, &str)> {
        self.drop_stale();
        self.heap
            .peek()
            .map(|Reverse((expires_at, topic))| (*expires_at, topic.as_str()))
    }

    /// Remove and return the earliest-expiring tracked session.
    pub fn pop_earliest(&mut self) -> Option<PendingSession> {
        self.drop_stale();
        let Reverse((expires_at, topic)) = self.heap.pop()?;
        let (_, dapp) = self.by_topic.remove(&topic)?;
        Some(PendingSession {
            expires_at,
            topic,
            dapp,
        })
    }

    /// Remove and return every session whose expiry is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<PendingSession> {
        let mut expired = Vec::new();
        loop {
            match self.peek_earliest() {
                Some((expires_at, _)) if expires_at <= now => {
                    if let Some(session) = self.pop_earliest() {
                        expired.push(session);
                    }
                }
                _ => break,
            }
        }
        expired
    }

    // Drop heap entries whose topic was deleted or re-tracked with a
    // different expiry.
    fn drop_stale(&mut self) {
        loop {
            let stale = match self.heap.peek() {
                Some(Reverse((expires_at, topic))) => {
                    !matches!(self.by_topic.get(topic), Some((current, _)) if current == expires_at)
                }
                None => false,
            };
            if !stale {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;
    use tokio::time::Duration;

    fn dapp() -> Arc<Client> {
        test_client().0
    }

    #[tokio::test]
    async fn peek_and_pop_follow_expiry_order() {
        let mut tracker = PendingSessionTracker::new();
        let now = Instant::now();
        tracker.insert("topic1", now + Duration::from_secs(5), dapp());
        tracker.insert("topic3", now + Duration::from_secs(3), dapp());
        tracker.insert("topic2", now + Duration::from_secs(4), dapp());

        assert_eq!(tracker.peek_earliest().unwrap().1, "topic3");
        assert_eq!(tracker.pop_earliest().unwrap().topic, "topic3");
        assert_eq!(tracker.peek_earliest().unwrap().1, "topic2");
        assert_eq!(tracker.pop_earliest().unwrap().topic, "topic2");
        assert_eq!(tracker.pop_earliest().unwrap().topic, "topic1");
        assert!(tracker.pop_earliest().is_none());
    }

    #[tokio::test]
    async fn delete_by_topic_skips_the_deleted_entry() {
        let mut tracker = PendingSessionTracker::new();
        let now = Instant::now();
        tracker.insert("topic1", now + Duration::from_secs(5), dapp());
        tracker.insert("topic3", now + Duration::from_secs(3), dapp());
        tracker.insert("topic2", now + Duration::from_secs(4), dapp());

        assert!(tracker.delete_by_topic("topic3"));
        assert!(!tracker.delete_by_topic("topic3"));
        assert_eq!(tracker.peek_earliest().unwrap().1, "topic2");
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn insert_dedups_by_topic() {
        let mut tracker = PendingSessionTracker::new();
        let now = Instant::now();
        assert!(tracker.insert("topic1", now + Duration::from_secs(10), dapp()));
        assert!(!tracker.insert("topic1", now + Duration::from_secs(1), dapp()));
        assert_eq!(tracker.len(), 1);

        // The original expiry wins.
        let (expires_at, _) = tracker.peek_earliest().unwrap();
        assert_eq!(expires_at, now + Duration::from_secs(10));
    }

    #[tokio::test]
    async fn reinsert_after_delete_uses_the_new_expiry() {
        let mut tracker = PendingSessionTracker::new();
        let now = Instant::now();
        tracker.insert("topic1", now + Duration::from_secs(1), dapp());
        tracker.delete_by_topic("topic1");
        tracker.insert("topic1", now + Duration::from_secs(9), dapp());

        let (expires_at, topic) = tracker.peek_earliest().unwrap();
        assert_eq!(topic, "topic1");
        assert_eq!(expires_at, now + Duration::from_secs(9));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn pop_expired_returns_only_due_sessions() {
        let mut tracker = PendingSessionTracker::new();
        let now = Instant::now();
        tracker.insert("due1", now + Duration::from_secs(1), dapp());
        tracker.insert("due2", now + Duration::from_secs(2), dapp());
        tracker.insert("later", now + Duration::from_secs(60), dapp());

        let expired = tracker.pop_expired(now + Duration::from_secs(5));
        let topics: Vec<&str> = expired.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, vec!["due1", "due2"]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains("later"));

        assert!(tracker.pop_expired(now + Duration::from_secs(5)).is_empty());
    }
}
