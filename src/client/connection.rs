//! Connection lifecycle
//!
//! A connection moves through `Created -> Started <-> Stopped -> Closed`.
//! Producers may only send while their connection is Started, and consumers
//! only hand out messages while it is Started; messages published meanwhile
//! keep queueing for already registered consumers. `close()` is terminal and
//! idempotent: it closes every session, which unregisters their consumers
//! and wakes any pending `receive()` with `ConnectionClosed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::client::consumer::CloseReason;
use crate::client::session::{AcknowledgeMode, Session, SessionInner};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Created,
    Started,
    Stopped,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handle to a connection. Clones share the same connection; dropping the
/// last handle closes it.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    id: String,
    broker: Broker,
    state: watch::Sender<ConnectionState>,
    sessions: Mutex<HashMap<String, Arc<SessionInner>>>,
}

impl Connection {
    pub fn create(broker: &Broker) -> Self {
        let (state, _) = watch::channel(ConnectionState::Created);
        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4().to_string(),
            broker: broker.clone(),
            state,
            sessions: Mutex::new(HashMap::new()),
        });
        info!("Connection {} created", inner.id);
        Self { inner }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Shorthand for `state() == ConnectionState::Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Start (or resume) delivery. No-op when already Started.
    pub fn start(&self) -> Result<()> {
        let mut outcome = Ok(());
        let changed = self.inner.state.send_if_modified(|state| match *state {
            ConnectionState::Closed => {
                outcome = Err(BrokerError::invalid_state(
                    "cannot start a closed connection",
                ));
                false
            }
            ConnectionState::Started => false,
            ConnectionState::Created | ConnectionState::Stopped => {
                *state = ConnectionState::Started;
                true
            }
        });
        if changed {
            info!("Connection {} started", self.inner.id);
        }
        outcome
    }

    /// Pause delivery. Sends fail until the connection is started again.
    /// No-op unless Started.
    pub fn stop(&self) -> Result<()> {
        let mut outcome = Ok(());
        let changed = self.inner.state.send_if_modified(|state| match *state {
            ConnectionState::Closed => {
                outcome = Err(BrokerError::invalid_state("cannot stop a closed connection"));
                false
            }
            ConnectionState::Started => {
                *state = ConnectionState::Stopped;
                true
            }
            ConnectionState::Created | ConnectionState::Stopped => false,
        });
        if changed {
            info!("Connection {} stopped", self.inner.id);
        }
        outcome
    }

    /// Close the connection and everything it owns.
    pub fn close(&self) {
        drop(self.inner.shutdown());
    }

    /// Close the connection, then wait up to the broker's close grace period
    /// for listener callbacks that are still running to return.
    pub async fn close_gracefully(&self) {
        let tasks = self.inner.shutdown();
        let deadline = Instant::now() + self.inner.broker.close_grace_period();
        for task in tasks {
            if timeout_at(deadline, task).await.is_err() {
                warn!(
                    "Listener on connection {} still running after the close grace period",
                    self.inner.id
                );
            }
        }
    }

    pub fn create_session(&self, ack_mode: AcknowledgeMode) -> Result<Session> {
        let mut sessions = self.inner.lock_sessions();
        if self.is_closed() {
            return Err(BrokerError::invalid_state(
                "cannot create a session on a closed connection",
            ));
        }

        let session = Arc::new(SessionInner::new(
            Arc::downgrade(&self.inner),
            self.inner.broker.clone(),
            self.inner.state.subscribe(),
            ack_mode,
        ));
        sessions.insert(session.id.clone(), Arc::clone(&session));
        Ok(Session::from_inner(session))
    }
}

impl ConnectionInner {
    pub(crate) fn remove_session(&self, id: &str) {
        self.lock_sessions().remove(id);
    }

    /// Mark the connection Closed, then close every session. The state flip
    /// happens first so no session can be added after the drain.
    fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let previous = self.state.send_replace(ConnectionState::Closed);
        let sessions: Vec<_> = self.lock_sessions().drain().map(|(_, s)| s).collect();

        let mut tasks = Vec::new();
        for session in sessions {
            tasks.extend(session.shutdown(CloseReason::Connection));
        }

        if previous != ConnectionState::Closed {
            info!("Connection {} closed", self.id);
        }
        tasks
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionInner>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        drop(self.shutdown());
    }
}

/// Wait until the watched connection is Started.
///
/// Fails with `ConnectionClosed` if it is, or becomes, Closed, or if the
/// connection itself has been dropped.
pub(crate) async fn wait_until_started(state: &mut watch::Receiver<ConnectionState>) -> Result<()> {
    loop {
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Started => return Ok(()),
            ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
            ConnectionState::Created | ConnectionState::Stopped => {}
        }
        if state.changed().await.is_err() {
            return Err(BrokerError::ConnectionClosed);
        }
    }
}
