use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::debug;

use crate::broker::{Dispatcher, Topic};
use crate::client::connection::ConnectionState;
use crate::utils::{BrokerError, Result};

/// Sends text messages to one topic.
#[derive(Debug)]
pub struct Producer {
    topic: Arc<Topic>,
    dispatcher: Dispatcher,
    state: watch::Receiver<ConnectionState>,
    shared: Arc<ProducerShared>,
}

/// The part of a producer its session can reach to close it.
#[derive(Debug, Default)]
pub(crate) struct ProducerShared {
    closed: AtomicBool,
}

impl ProducerShared {
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Producer {
    pub(crate) fn new(
        topic: Arc<Topic>,
        dispatcher: Dispatcher,
        state: watch::Receiver<ConnectionState>,
        shared: Arc<ProducerShared>,
    ) -> Self {
        Self {
            topic,
            dispatcher,
            state,
            shared,
        }
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Publish `text` to the topic.
    ///
    /// Returns once the message is queued for every consumer registered at
    /// this moment, without waiting for any of them. A topic with no
    /// consumers silently drops the message.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(BrokerError::invalid_state("producer is closed"));
        }

        // Checked again under the topic lock: a send that loses a race with
        // close is rejected, never published.
        let receipt = self
            .dispatcher
            .publish_checked(&self.topic, text.into(), || {
                let state = *self.state.borrow();
                if state != ConnectionState::Started {
                    return Err(BrokerError::invalid_state(format!(
                        "cannot send while the connection is {state}"
                    )));
                }
                if self.shared.is_closed() {
                    return Err(BrokerError::invalid_state("producer is closed"));
                }
                Ok(())
            })?;
        debug!(
            "Sent message #{} to '{}'",
            receipt.sequence,
            self.topic.name()
        );
        Ok(())
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shared.close();
    }
}
