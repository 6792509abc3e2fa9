//! In-memory broker and collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Correspondent, Credentials, Message, MessageId, UserId},
    error::ConnectionError,
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    services::{HistoryService, RosterService},
    transport::{BrokerConnector, BrokerSession, Delivery, Subscription},
};

#[derive(Default)]
pub struct FakeBroker {
    pub connects: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    connected: AtomicBool,
    fail_publish: AtomicBool,
    published: Mutex<Vec<(String, String)>>,
    routes: Mutex<HashMap<String, (String, mpsc::UnboundedSender<Delivery>)>>,
    next_id: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }

    pub async fn active_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .routes
            .lock()
            .await
            .values()
            .map(|(destination, _)| destination.clone())
            .collect();
        destinations.sort();
        destinations
    }

    /// Pushes `body` to every subscriber of `destination`; returns how many
    /// subscriptions received it.
    pub async fn deliver(&self, destination: &str, body: impl Into<String>) -> usize {
        let body = body.into();
        let routes = self.routes.lock().await;
        let mut delivered = 0;
        for (route_destination, tx) in routes.values() {
            if route_destination == destination
                && tx
                    .send(Delivery {
                        destination: destination.to_string(),
                        body: body.clone(),
                    })
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Simulates the remote end closing the socket.
    pub async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.routes.lock().await.clear();
    }
}

pub struct FakeConnector {
    pub broker: Arc<FakeBroker>,
    pub fail_with: Option<ConnectionError>,
    pub delay: Option<Duration>,
}

impl FakeConnector {
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        Self {
            broker,
            fail_with: None,
            delay: None,
        }
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        self.broker.connected.store(true, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct FakeSession {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn subscribe(&self, destination: &str) -> Result<Subscription, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.broker.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("sub-{}", self.broker.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker
            .routes
            .lock()
            .await
            .insert(id.clone(), (destination.to_string(), tx));
        Ok(Subscription {
            id,
            destination: destination.to_string(),
            deliveries: rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ConnectionError> {
        self.broker.routes.lock().await.remove(subscription_id);
        Ok(())
    }

    async fn publish(&self, destination: &str, body: String) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        if self.broker.fail_publish.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport("socket write failed".into()));
        }
        self.broker
            .published
            .lock()
            .await
            .push((destination.to_string(), body));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.broker.connected.store(false, Ordering::SeqCst);
        self.broker.routes.lock().await.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker.connected.load(Ordering::SeqCst)
    }
}

pub struct StaticRoster(pub Vec<Correspondent>);

#[async_trait]
impl RosterService for StaticRoster {
    async fn fetch_roster(&self) -> Result<Vec<Correspondent>> {
        Ok(self.0.clone())
    }
}

/// History backend with per-recipient canned answers. A recipient can be
/// gated so its load only completes once `release` is called.
#[derive(Default)]
pub struct ScriptedHistory {
    histories: Mutex<HashMap<UserId, Vec<Message>>>,
    failures: Mutex<HashMap<UserId, String>>,
    gates: Mutex<HashMap<UserId, Arc<Notify>>>,
    pub calls: Mutex<VecDeque<UserId>>,
}

impl ScriptedHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set(&self, recipient_id: UserId, history: Vec<Message>) {
        self.histories.lock().await.insert(recipient_id, history);
    }

    pub async fn fail(&self, recipient_id: UserId, reason: &str) {
        self.failures
            .lock()
            .await
            .insert(recipient_id, reason.to_string());
    }

    pub async fn gate(&self, recipient_id: UserId) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .await
            .insert(recipient_id, Arc::clone(&notify));
        notify
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl HistoryService for ScriptedHistory {
    async fn fetch_history(&self, recipient_id: UserId) -> Result<Vec<Message>> {
        self.calls.lock().await.push_back(recipient_id);
        let gate = self.gates.lock().await.get(&recipient_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(reason) = self.failures.lock().await.get(&recipient_id) {
            return Err(anyhow!(reason.clone()));
        }
        Ok(self
            .histories
            .lock()
            .await
            .get(&recipient_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn correspondent(id: i64, first_name: &str, last_name: &str) -> Correspondent {
    Correspondent {
        id: UserId(id),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        avatar_url: None,
        username: format!("{}{}", first_name.to_lowercase(), last_name.to_lowercase()),
    }
}

pub fn message(id: i64, sender_id: i64, content: &str, timestamp: i64) -> Message {
    Message {
        id: MessageId(id),
        sender_id: UserId(sender_id),
        recipient_id: None,
        content: content.to_string(),
        timestamp,
    }
}
