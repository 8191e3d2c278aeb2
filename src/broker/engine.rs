//! Broker engine
//!
//! `Broker` is the explicit owner of the state every connection shares: the
//! topic registry and the dispatcher. It is a cheap `Clone` handle; all
//! clones see the same topics. There is no global broker, whoever creates
//! connections holds one.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::dispatcher::{DispatchStats, Dispatcher};
use crate::broker::registry::TopicRegistry;
use crate::broker::topic::Topic;
use crate::client::Connection;
use crate::config::BrokerSettings;

#[derive(Debug, Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    registry: TopicRegistry,
    dispatcher: Dispatcher,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: TopicRegistry::new(),
                dispatcher: Dispatcher::new(),
                settings,
            }),
        }
    }

    /// Open a new connection in the Created state.
    pub fn create_connection(&self) -> Connection {
        Connection::create(self)
    }

    /// Lookup-or-create a topic by name.
    pub fn resolve_topic(&self, name: &str) -> Arc<Topic> {
        self.inner.registry.resolve_topic(name)
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.dispatcher.stats()
    }

    pub(crate) fn close_grace_period(&self) -> Duration {
        Duration::from_millis(self.inner.settings.close_grace_ms)
    }
}
