//! Topic management
//!
//! A `Topic` holds the ordered list of consumer registrations for one topic
//! name plus the topic's sequence counter. Both live behind a single lock, so
//! a publish and a concurrent registration are totally ordered: a consumer
//! sees exactly the messages whose publish acquired the lock after its
//! registration did.
//!
//! Registrations are kept in insertion order and duplicate registrations are
//! a no-op.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::Message;

pub type ConsumerId = String;

#[derive(Debug)]
pub struct Topic {
    name: String,
    state: Mutex<TopicState>,
}

#[derive(Debug, Default)]
pub(crate) struct TopicState {
    pub(crate) last_sequence: u64,
    pub(crate) subscribers: Vec<Subscriber>,
}

/// One registered consumer: its id and the sending half of its delivery
/// queue.
#[derive(Debug)]
pub(crate) struct Subscriber {
    pub(crate) id: ConsumerId,
    pub(crate) sender: UnboundedSender<Message>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(TopicState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of consumers currently registered.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Sequence number of the most recent publish, `0` if none.
    pub fn last_sequence(&self) -> u64 {
        self.lock().last_sequence
    }

    /// Ids of the registered consumers in registration order.
    pub fn subscriber_ids(&self) -> Vec<ConsumerId> {
        self.lock().subscribers.iter().map(|s| s.id.clone()).collect()
    }

    /// Register a consumer. Returns `false` if `id` was already registered.
    pub(crate) fn subscribe(&self, id: ConsumerId, sender: UnboundedSender<Message>) -> bool {
        let mut state = self.lock();
        if state.subscribers.iter().any(|s| s.id == id) {
            return false;
        }
        state.subscribers.push(Subscriber { id, sender });
        true
    }

    /// Remove a consumer. Returns `false` if it was not registered.
    pub(crate) fn unsubscribe(&self, id: &ConsumerId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| &s.id != id);
        state.subscribers.len() != before
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
