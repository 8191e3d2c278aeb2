//! Consumers
//!
//! A consumer is either pull-mode, where the caller awaits `receive()`, or
//! push-mode, where a `MessageListener` is invoked by the dispatcher. The
//! mode is fixed when the session creates the consumer.
//!
//! Closing a consumer, its session or its connection unregisters it from the
//! topic at once and wakes any pending `receive()`. Messages already queued
//! for it are discarded.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{ConsumerId, Message, Topic};
use crate::client::connection::{ConnectionState, wait_until_started};
use crate::utils::{BrokerError, Result};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback for push-mode consumers.
///
/// Invocations for one consumer never overlap and follow publish order. A
/// listener shares the runtime with other consumers' listeners, so it
/// should not block for long. Returning `Err` or panicking is logged; the
/// message is not redelivered.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, message: &Message) -> std::result::Result<(), ListenerError>;
}

impl<F> MessageListener for F
where
    F: Fn(&Message) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_message(&self, message: &Message) -> std::result::Result<(), ListenerError> {
        self(message)
    }
}

/// Who closed a consumer, which decides the error a pending receive sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Consumer,
    Connection,
}

impl From<CloseReason> for BrokerError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Consumer => BrokerError::ConsumerClosed,
            CloseReason::Connection => BrokerError::ConnectionClosed,
        }
    }
}

/// State shared between a `Consumer`, its session and the dispatcher.
#[derive(Debug)]
pub(crate) struct ConsumerShared {
    pub(crate) id: ConsumerId,
    pub(crate) topic: Arc<Topic>,
    closed: watch::Sender<Option<CloseReason>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerShared {
    pub(crate) fn new(topic: Arc<Topic>) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4().to_string(),
            topic,
            closed,
            task: Mutex::new(None),
        }
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Close once; later calls keep the first reason. Returns `true` if this
    /// call closed the consumer.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let closed_now = self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });

        if closed_now {
            self.topic.unsubscribe(&self.id);
            debug!(
                "Consumer {} on topic '{}' closed ({reason:?})",
                self.id,
                self.topic.name()
            );
        }
        closed_now
    }

    /// Resolves once the consumer is closed.
    pub(crate) async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.subscribe();
        loop {
            let current = *closed.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if closed.changed().await.is_err() {
                return CloseReason::Consumer;
            }
        }
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Debug)]
enum Delivery {
    Pull(AsyncMutex<UnboundedReceiver<Message>>),
    Push,
}

/// Receives messages from one topic. Dropping it closes it.
#[derive(Debug)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    delivery: Delivery,
    state: watch::Receiver<ConnectionState>,
}

impl Consumer {
    pub(crate) fn pull(
        shared: Arc<ConsumerShared>,
        queue: UnboundedReceiver<Message>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            shared,
            delivery: Delivery::Pull(AsyncMutex::new(queue)),
            state,
        }
    }

    pub(crate) fn push(shared: Arc<ConsumerShared>, state: watch::Receiver<ConnectionState>) -> Self {
        Self {
            shared,
            delivery: Delivery::Push,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.shared.topic
    }

    pub fn has_listener(&self) -> bool {
        matches!(self.delivery, Delivery::Push)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait for the next message.
    ///
    /// Waits while the connection is not Started. Fails with
    /// `ConsumerClosed` if this consumer or its session closes, and with
    /// `ConnectionClosed` if the connection closes.
    pub async fn receive(&self) -> Result<Message> {
        let queue = self.pull_queue()?;
        let mut queue = queue.lock().await;
        let mut state = self.state.clone();

        loop {
            if let Some(reason) = self.shared.close_reason() {
                return Err(reason.into());
            }

            tokio::select! {
                biased;
                reason = self.shared.closed() => return Err(reason.into()),
                started = wait_until_started(&mut state) => started?,
            }

            tokio::select! {
                biased;
                reason = self.shared.closed() => return Err(reason.into()),
                changed = state.changed() => {
                    // Stopped or closed underneath us; re-evaluate.
                    if changed.is_err() {
                        return Err(BrokerError::ConnectionClosed);
                    }
                }
                message = queue.recv() => return message.ok_or(BrokerError::ConsumerClosed),
            }
        }
    }

    /// Like `receive`, but gives up with `Timeout` after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    /// Return the next message if one can be handed out right now.
    pub fn receive_no_wait(&self) -> Result<Option<Message>> {
        let queue = self.pull_queue()?;
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason.into());
        }

        let state = *self.state.borrow();
        match state {
            ConnectionState::Started => {}
            ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
            ConnectionState::Created | ConnectionState::Stopped => return Ok(None),
        }

        // Another task is parked in receive(); it gets the next message.
        let Ok(mut queue) = queue.try_lock() else {
            return Ok(None);
        };
        match queue.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BrokerError::ConsumerClosed),
        }
    }

    /// Stop delivery to this consumer. Idempotent.
    pub fn close(&self) {
        self.shared.close(CloseReason::Consumer);
    }

    fn pull_queue(&self) -> Result<&AsyncMutex<UnboundedReceiver<Message>>> {
        match &self.delivery {
            Delivery::Pull(queue) => Ok(queue),
            Delivery::Push => Err(BrokerError::invalid_state(
                "consumer has a message listener and cannot receive",
            )),
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.close(CloseReason::Consumer);
    }
}
