//! Owns the single broker session of a chat client.

use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::{domain::Credentials, error::ConnectionError};
use tokio::{
    sync::{watch, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::transport::{BrokerConnector, BrokerSession, Subscription, SubscriptionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub endpoint: String,
    /// Incremented on every successful connect.
    pub generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    connect_timeout: Duration,
    publish_timeout: Duration,
    inner: Mutex<ConnectionInner>,
    state: watch::Sender<ConnectionState>,
}

struct ConnectionInner {
    session: Option<Arc<dyn BrokerSession>>,
    // destination -> subscription id
    subscriptions: HashMap<String, String>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        connect_timeout: Duration,
        publish_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            connect_timeout,
            publish_timeout,
            inner: Mutex::new(ConnectionInner {
                session: None,
                subscriptions: HashMap::new(),
                generation: 0,
            }),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Opens a session, releasing any previous one first. The inner lock is
    /// held for the whole attempt so connect/disconnect never overlap.
    pub async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.session.take() {
            guard.subscriptions.clear();
            if let Err(err) = previous.disconnect().await {
                debug!("releasing previous broker session failed: {err}");
            }
        }

        self.set_state(ConnectionState::Connecting);
        let attempt = timeout(
            self.connect_timeout,
            self.connector.connect(endpoint, credentials),
        )
        .await;

        let session = match attempt {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(endpoint, "broker connect failed: {err}");
                return Err(err);
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                let millis = self.connect_timeout.as_millis() as u64;
                warn!(endpoint, timeout_ms = millis, "broker connect timed out");
                return Err(ConnectionError::TimedOut(millis));
            }
        };

        guard.session = Some(session);
        guard.generation += 1;
        self.set_state(ConnectionState::Connected);
        info!(endpoint, generation = guard.generation, "connected to broker");
        Ok(ConnectionHandle {
            endpoint: endpoint.to_string(),
            generation: guard.generation,
        })
    }

    pub async fn is_connected(&self) -> bool {
        let mut guard = self.inner.lock().await;
        self.live_session(&mut guard).is_some()
    }

    /// Registers a subscription on `destination`. A destination can be
    /// subscribed at most once per session.
    pub async fn subscribe(&self, destination: &str) -> Result<Subscription, ConnectionError> {
        let mut guard = self.inner.lock().await;
        let session = self
            .live_session(&mut guard)
            .ok_or(ConnectionError::NotConnected)?;
        if guard.subscriptions.contains_key(destination) {
            return Err(ConnectionError::AlreadySubscribed(destination.to_string()));
        }

        let subscription = session.subscribe(destination).await?;
        guard
            .subscriptions
            .insert(destination.to_string(), subscription.id.clone());
        debug!(destination, id = %subscription.id, "subscribed");
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), ConnectionError> {
        let mut guard = self.inner.lock().await;
        if guard.subscriptions.get(&handle.destination) != Some(&handle.id) {
            return Ok(());
        }
        guard.subscriptions.remove(&handle.destination);
        let Some(session) = self.live_session(&mut guard) else {
            return Ok(());
        };
        session.unsubscribe(&handle.id).await
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    /// Fire-and-forget send. Failures are logged and returned, never retried.
    pub async fn publish(&self, destination: &str, body: String) -> Result<(), ConnectionError> {
        let session = {
            let mut guard = self.inner.lock().await;
            self.live_session(&mut guard)
        };
        let Some(session) = session else {
            warn!(destination, "dropping publish: not connected");
            return Err(ConnectionError::NotConnected);
        };

        match timeout(self.publish_timeout, session.publish(destination, body)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(destination, "publish failed: {err}");
                Err(err)
            }
            Err(_) => {
                let millis = self.publish_timeout.as_millis() as u64;
                warn!(destination, timeout_ms = millis, "publish timed out");
                Err(ConnectionError::TimedOut(millis))
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.subscriptions.clear();
        if let Some(session) = guard.session.take() {
            if let Err(err) = session.disconnect().await {
                debug!("broker disconnect reported: {err}");
            }
            info!("disconnected from broker");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // Drops a session whose transport has gone away so the next connect
    // starts from an empty subscription registry.
    fn live_session(&self, guard: &mut ConnectionInner) -> Option<Arc<dyn BrokerSession>> {
        let session = guard.session.as_ref()?;
        if session.is_connected() {
            return Some(Arc::clone(session));
        }
        warn!("broker session closed by remote");
        guard.session = None;
        guard.subscriptions.clear();
        self.set_state(ConnectionState::Disconnected);
        None
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
