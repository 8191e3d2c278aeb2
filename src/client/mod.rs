//! The `client` module is the API a program uses to talk to the broker.
//!
//! A `Connection` is obtained from a `Broker` and owns `Session`s. Sessions
//! create `Producer`s, which send text messages to a topic, and `Consumer`s,
//! which either pull messages with `receive()` or have a `MessageListener`
//! invoked for them.

pub mod connection;
pub mod consumer;
pub mod producer;
pub mod session;

pub use connection::{Connection, ConnectionState};
pub use consumer::{Consumer, ListenerError, MessageListener};
pub use producer::Producer;
pub use session::{AcknowledgeMode, Session};

#[cfg(test)]
mod tests;
