//! Topic -> connection indices.
//!
//! The relay core owns two `TopicClientSet`s (publishers and subscribers).
//! Every mutation happens inside the core event loop, so the index carries no
//! internal locking.

use crate::client::Client;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
pub struct TopicClientSet {
    topics: HashMap<String, HashMap<Uuid, Arc<Client>>>,
}

impl TopicClientSet {
    pub fn new() -> Self {
        TopicClientSet::default()
    }

    /// Associate `client` with `topic`.
    pub fn set(&mut self, topic: &str, client: &Arc<Client>) {
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .insert(client.id, client.clone());
    }

    /// Remove one association. Returns whether it existed.
    pub fn unset(&mut self, topic: &str, id: Uuid) -> bool {
        self.topics
            .get_mut(topic)
            .is_some_and(|clients| clients.remove(&id).is_some())
    }

    /// Number of clients currently associated with `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashMap::len)
    }

    /// Drop the topic entry entirely.
    pub fn clear(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn contains(&self, topic: &str, id: Uuid) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|clients| clients.contains_key(&id))
    }

    /// Clients associated with `topic`.
    pub fn clients(&self, topic: &str) -> impl Iterator<Item = &Arc<Client>> {
        self.topics.get(topic).into_iter().flat_map(HashMap::values)
    }

    /// Inverse lookup: every topic `id` is associated with.
    pub fn topics_of(&self, id: Uuid) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, clients)| clients.contains_key(&id))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Number of topics with at least one association.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;

    #[test]
    fn set_unset_len_clear() {
        let mut index = TopicClientSet::new();
        let (a, _) = test_client();
        let (b, _) = test_client();

        index.set("t1", &a);
        index.set("t1", &b);
        index.set("t2", &a);
        assert_eq!(index.len("t1"), 2);
        assert_eq!(index.len("t2"), 1);
        assert_eq!(index.len("missing"), 0);
        assert!(index.contains("t1", a.id));

        // set is idempotent per (topic, client)
        index.set("t1", &a);
        assert_eq!(index.len("t1"), 2);

        assert!(index.unset("t1", a.id));
        assert!(!index.unset("t1", a.id));
        assert_eq!(index.len("t1"), 1);

        index.clear("t1");
        assert_eq!(index.len("t1"), 0);
        assert_eq!(index.topic_count(), 1);
    }

    #[test]
    fn inverse_lookup_finds_all_topics_of_a_client() {
        let mut index = TopicClientSet::new();
        let (a, _) = test_client();
        let (b, _) = test_client();

        index.set("t1", &a);
        index.set("t2", &a);
        index.set("t3", &b);

        let mut topics = index.topics_of(a.id);
        topics.sort();
        assert_eq!(topics, vec!["t1".to_owned(), "t2".to_owned()]);
        assert!(index.topics_of(Uuid::new_v4()).is_empty());
    }
}
