//! # topicmq
//!
//! `topicmq` is a small embeddable publish/subscribe core: an in-process
//! topic broker with connections, sessions, producers and consumers, in the
//! shape of a JMS topic client but with no external server behind it.
//!
//! ```no_run
//! use topicmq::{AcknowledgeMode, Broker};
//!
//! # async fn demo() -> topicmq::Result<()> {
//! let broker = Broker::new();
//! let connection = broker.create_connection();
//! connection.start()?;
//!
//! let session = connection.create_session(AcknowledgeMode::Auto)?;
//! let topic = session.create_topic("historiales");
//! let consumer = session.create_consumer(&topic)?;
//! let producer = session.create_producer(&topic)?;
//!
//! producer.send("hello")?;
//! assert_eq!(consumer.receive().await?.text(), "hello");
//! connection.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Modules
//!
//! - `broker`: topic registry, messages and the dispatcher that routes them.
//! - `client`: the connection / session / producer / consumer API.
//! - `config`: loading settings from file and environment.
//! - `utils`: the error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod utils;

pub use broker::{Broker, DispatchStats, Message, Topic};
pub use client::{
    AcknowledgeMode, Connection, ConnectionState, Consumer, ListenerError, MessageListener,
    Producer, Session,
};
pub use utils::{BrokerError, Result};
