//! Message definitions for the broker
//!
//! A `Message` is immutable once published. Fields:
//! - `topic`: name of the topic the message was published to
//! - `payload`: the UTF-8 text body
//! - `timestamp`: milliseconds since UNIX epoch, set at publish time
//! - `sequence`: per-topic counter assigned by the topic, starting at 1;
//!   it orders messages within one topic, never across topics
//! - `message_id`: opaque unique id (UUID v4)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub timestamp: i64,
    pub sequence: u64,
    pub message_id: String,
}

impl Message {
    pub(crate) fn new(topic: &str, payload: String, sequence: u64) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            sequence,
            message_id: Uuid::new_v4().to_string(),
        }
    }

    /// The text body.
    pub fn text(&self) -> &str {
        &self.payload
    }
}
