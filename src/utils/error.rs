//! Error types for broker, connection and consumer operations.
//!
//! Errors on the publish path (`Producer::send`) and on the receive path
//! (`Consumer::receive`) are returned to the caller. `DeliveryCallback` is
//! different: the dispatcher builds it when a listener fails, logs it and
//! moves on, so it never reaches a publisher or another consumer.

use thiserror::Error;

use crate::broker::topic::ConsumerId;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("consumer closed")]
    ConsumerClosed,

    #[error("timed out waiting for a message")]
    Timeout,

    #[error("delivery callback failed for consumer '{consumer}': {reason}")]
    DeliveryCallback { consumer: ConsumerId, reason: String },
}

impl BrokerError {
    pub(crate) fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState(what.into())
    }
}
