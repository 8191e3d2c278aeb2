//! Dispatcher
//!
//! Routes published messages to the consumers registered on a topic.
//!
//! `publish` runs on the caller's task: under the topic lock it assigns the
//! next sequence number and pushes the message onto every registered
//! consumer's unbounded delivery queue, then returns. It never waits on a
//! consumer. Pull-mode consumers drain their queue from `receive()`;
//! push-mode consumers are drained by a listener task spawned here, one per
//! consumer, which keeps each consumer's callbacks strictly ordered while
//! letting different consumers run concurrently.
//!
//! Delivery is at-most-once. A listener that returns an error or panics is
//! logged and counted; the message is not retried and other consumers are
//! unaffected.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::topic::{ConsumerId, Topic, TopicState};
use crate::client::connection::{ConnectionState, wait_until_started};
use crate::client::consumer::{ConsumerShared, MessageListener};
use crate::utils::{BrokerError, Result};

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sequence: u64,
    /// Consumers the message was enqueued for. `0` means it was dropped.
    pub recipients: usize,
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub published: u64,
    /// Per-consumer enqueues; one publish to three consumers counts three.
    pub delivered: u64,
    /// Publishes that found no registered consumer.
    pub dropped: u64,
    pub callback_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    callback_failures: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` to every consumer currently registered on `topic`.
    ///
    /// With no consumers registered the message is dropped: it is not kept
    /// for consumers that register later. Registrations whose queue has been
    /// dropped are pruned on the way.
    pub fn publish(&self, topic: &Topic, payload: String) -> PublishReceipt {
        let mut state = topic.lock();
        self.publish_locked(topic, &mut state, payload)
    }

    /// Like `publish`, but runs `check` while holding the topic lock and
    /// publishes nothing if it fails.
    ///
    /// Producers pass their connection-state check here, so a send that
    /// loses a race with `Connection::close` is rejected as a whole.
    pub fn publish_checked<F>(
        &self,
        topic: &Topic,
        payload: String,
        check: F,
    ) -> Result<PublishReceipt>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = topic.lock();
        check()?;
        Ok(self.publish_locked(topic, &mut state, payload))
    }

    fn publish_locked(
        &self,
        topic: &Topic,
        state: &mut TopicState,
        payload: String,
    ) -> PublishReceipt {
        state.last_sequence += 1;
        let message = Message::new(topic.name(), payload, state.last_sequence);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if state.subscribers.is_empty() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "No consumers on topic '{}', dropping message #{}",
                topic.name(),
                message.sequence
            );
            return PublishReceipt {
                sequence: message.sequence,
                recipients: 0,
            };
        }

        let mut recipients = 0;
        state
            .subscribers
            .retain(|sub| match sub.sender.send(message.clone()) {
                Ok(()) => {
                    recipients += 1;
                    true
                }
                Err(_) => {
                    warn!(
                        "Consumer {} on topic '{}' is gone, removing it",
                        sub.id,
                        topic.name()
                    );
                    false
                }
            });

        self.counters
            .delivered
            .fetch_add(recipients as u64, Ordering::Relaxed);
        debug!(
            "Published message #{} on topic '{}' to {} consumer(s)",
            message.sequence,
            topic.name(),
            recipients
        );

        PublishReceipt {
            sequence: message.sequence,
            recipients,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn the task that feeds `queue` into `listener` for one push-mode
    /// consumer.
    ///
    /// The task runs on `runtime`, never on the publisher's task. Messages
    /// are only handed over while the connection is Started. The task ends
    /// when the consumer closes or the connection goes away; whatever is
    /// still queued at that point is discarded.
    pub(crate) fn spawn_listener(
        &self,
        runtime: &Handle,
        consumer: Arc<ConsumerShared>,
        mut queue: UnboundedReceiver<Message>,
        listener: Arc<dyn MessageListener>,
        mut state: watch::Receiver<ConnectionState>,
    ) -> JoinHandle<()> {
        let counters = Arc::clone(&self.counters);

        runtime.spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = consumer.closed() => break,
                    message = queue.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let started = tokio::select! {
                    biased;
                    _ = consumer.closed() => break,
                    started = wait_until_started(&mut state) => started,
                };
                if started.is_err() || consumer.is_closed() {
                    break;
                }

                if let Err(err) = invoke(&consumer.id, listener.as_ref(), &message) {
                    counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("{err}");
                }
            }

            debug!("Listener for consumer {} stopped", consumer.id);
        })
    }
}

fn invoke(consumer: &ConsumerId, listener: &dyn MessageListener, message: &Message) -> Result<()> {
    let reason = match panic::catch_unwind(AssertUnwindSafe(|| listener.on_message(message))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_reason(payload.as_ref()),
    };

    Err(BrokerError::DeliveryCallback {
        consumer: consumer.clone(),
        reason,
    })
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}
