//! The `utils` module provides shared definitions used across the `topicmq`
//! crate: the broker error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};
