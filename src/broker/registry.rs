//! Topic registry
//!
//! Maps topic names to shared `Topic` handles. Topics are created lazily on
//! first reference and are never removed, so a handle obtained from
//! `resolve_topic` stays valid for as long as the owning `Broker` lives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::broker::topic::Topic;

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the topic named `name`, creating and registering it if it
    /// doesn't exist yet.
    pub fn resolve_topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.lock();
        if let Some(topic) = topics.get(name) {
            return Arc::clone(topic);
        }
        debug!("Creating topic '{name}'");
        let topic = Arc::new(Topic::new(name));
        topics.insert(name.to_string(), Arc::clone(&topic));
        topic
    }

    /// Look a topic up without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.lock().get(name).cloned()
    }

    /// Names of every topic resolved so far, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of topics.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
