//! Sessions
//!
//! A session is one logical channel on a connection. It creates producers
//! and consumers and closes them all when it is closed, either directly or
//! because its connection closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Broker, Topic};
use crate::client::connection::{ConnectionInner, ConnectionState};
use crate::client::consumer::{CloseReason, Consumer, ConsumerShared, MessageListener};
use crate::client::producer::{Producer, ProducerShared};
use crate::utils::{BrokerError, Result};

/// How received messages are acknowledged. Only `Auto` changes delivery
/// behavior today; `Client` is recorded and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgeMode {
    #[default]
    Auto,
    Client,
}

#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) id: String,
    ack_mode: AcknowledgeMode,
    broker: Broker,
    connection: Weak<ConnectionInner>,
    state: watch::Receiver<ConnectionState>,
    closed: AtomicBool,
    members: Mutex<Members>,
}

#[derive(Debug, Default)]
struct Members {
    producers: Vec<Arc<ProducerShared>>,
    consumers: Vec<Arc<ConsumerShared>>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Unique id of this session.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The acknowledge mode the session was created with.
    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.inner.ack_mode
    }

    /// True once the session, or the connection it belongs to, is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Producer entries the session still tracks, closed ones included
    /// until the next `create_producer` prunes them.
    #[cfg(test)]
    pub(crate) fn tracked_producers(&self) -> usize {
        self.inner.lock_members().producers.len()
    }

    /// Resolve `name` through the broker's topic registry.
    pub fn create_topic(&self, name: &str) -> Arc<Topic> {
        self.inner.broker.resolve_topic(name)
    }

    /// Create a producer for `topic`. Allowed before the connection starts;
    /// sending is not.
    pub fn create_producer(&self, topic: &Arc<Topic>) -> Result<Producer> {
        let mut members = self.inner.lock_members();
        self.inner.ensure_open()?;

        members.producers.retain(|p| !p.is_closed());
        let shared = Arc::new(ProducerShared::default());
        members.producers.push(Arc::clone(&shared));

        Ok(Producer::new(
            Arc::clone(topic),
            self.inner.broker.dispatcher().clone(),
            self.inner.state.clone(),
            shared,
        ))
    }

    /// Create a pull-mode consumer on `topic`.
    ///
    /// The consumer is registered when this returns and sees every message
    /// published from then on.
    pub fn create_consumer(&self, topic: &Arc<Topic>) -> Result<Consumer> {
        let mut members = self.inner.lock_members();
        self.inner.ensure_open()?;

        let (sender, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(ConsumerShared::new(Arc::clone(topic)));
        topic.subscribe(shared.id.clone(), sender);
        members.consumers.retain(|c| !c.is_closed());
        members.consumers.push(Arc::clone(&shared));
        debug!(
            "Consumer {} registered on topic '{}' (pull)",
            shared.id,
            topic.name()
        );

        Ok(Consumer::pull(shared, queue, self.inner.state.clone()))
    }

    /// Create a push-mode consumer on `topic` whose `listener` is invoked on
    /// a dispatcher task for every delivered message.
    ///
    /// The listener task is spawned on the current Tokio runtime; outside
    /// of one this fails with `InvalidState` and nothing is registered.
    /// Keep the returned `Consumer` alive: dropping it closes the consumer.
    pub fn create_consumer_with_listener<L>(&self, topic: &Arc<Topic>, listener: L) -> Result<Consumer>
    where
        L: MessageListener,
    {
        let mut members = self.inner.lock_members();
        self.inner.ensure_open()?;
        let runtime = Handle::try_current().map_err(|_| {
            BrokerError::invalid_state("a message listener needs a running Tokio runtime")
        })?;

        let (sender, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(ConsumerShared::new(Arc::clone(topic)));
        topic.subscribe(shared.id.clone(), sender);

        let listener: Arc<dyn MessageListener> = Arc::new(listener);
        let task = self.inner.broker.dispatcher().spawn_listener(
            &runtime,
            Arc::clone(&shared),
            queue,
            listener,
            self.inner.state.clone(),
        );
        shared.set_task(task);

        members.consumers.retain(|c| !c.is_closed());
        members.consumers.push(Arc::clone(&shared));
        debug!(
            "Consumer {} registered on topic '{}' (listener)",
            shared.id,
            topic.name()
        );

        Ok(Consumer::push(shared, self.inner.state.clone()))
    }

    /// Close the session and every producer and consumer it created.
    /// Pending `receive()` calls fail with `ConsumerClosed`.
    pub fn close(&self) {
        drop(self.inner.shutdown(CloseReason::Consumer));
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.remove_session(&self.inner.id);
        }
    }
}

impl SessionInner {
    pub(crate) fn new(
        connection: Weak<ConnectionInner>,
        broker: Broker,
        state: watch::Receiver<ConnectionState>,
        ack_mode: AcknowledgeMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ack_mode,
            broker,
            connection,
            state,
            closed: AtomicBool::new(false),
            members: Mutex::new(Members::default()),
        }
    }

    /// Close every member. Returns the listener tasks so a caller can wait
    /// for them.
    pub(crate) fn shutdown(&self, reason: CloseReason) -> Vec<JoinHandle<()>> {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let members = std::mem::take(&mut *self.lock_members());

        for producer in members.producers {
            producer.close();
        }

        let mut tasks = Vec::new();
        for consumer in members.consumers {
            consumer.close(reason);
            tasks.extend(consumer.take_task());
        }

        if first {
            debug!("Session {} closed", self.id);
        }
        tasks
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::invalid_state("session is closed"));
        }
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(BrokerError::invalid_state("connection is closed"));
        }
        Ok(())
    }

    fn lock_members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
