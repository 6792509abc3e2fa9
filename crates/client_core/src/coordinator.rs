//! Binds broker traffic to the message store of the open conversation.

use std::{collections::VecDeque, sync::Arc};

use anyhow::Context;
use chrono::Utc;
use shared::{
    domain::{ConversationSelection, Correspondent, Credentials, Message, MessageId, UserId},
    error::{ChatError, ConnectionError, LoadError, NotFoundError},
    protocol::{conversation_channel, publish_destination, SendPayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ChatConfig,
    connection::{ConnectionHandle, ConnectionManager},
    directory::ConversationDirectory,
    message_store::{MessageStore, StoreEvent},
    services::{HistoryService, RosterService},
    transport::{BrokerConnector, Subscription, SubscriptionHandle},
};

// Optimistic sends still waiting for their broker echo.
const MAX_PENDING_ECHOES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationPhase {
    Idle,
    Loading { recipient_id: UserId },
    Active(ConversationSelection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Opened(ConversationSelection),
    /// The id is already open or loading; nothing was reloaded.
    AlreadySelected,
    /// A newer selection finished first; this load was discarded.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Ignored,
    Sent(Message),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ConnectionChanged { online: bool },
    ConversationLoading { recipient_id: UserId },
    ConversationOpened(ConversationSelection),
    LoadFailed { recipient_id: UserId, reason: String },
    InboundRejected { reason: String },
}

struct PendingSend {
    local_id: MessageId,
    content: String,
}

struct CoordinatorState {
    directory: ConversationDirectory,
    phase: ConversationPhase,
    generation: u64,
    subscription: Option<SubscriptionHandle>,
    inbound_task: Option<JoinHandle<()>>,
    pending_outbound: VecDeque<PendingSend>,
    last_local_id: i64,
}

impl CoordinatorState {
    fn stop_inbound(&mut self) -> Option<SubscriptionHandle> {
        if let Some(task) = self.inbound_task.take() {
            task.abort();
        }
        self.subscription.take()
    }
}

pub struct DeliveryCoordinator {
    self_id: UserId,
    channel_prefix: String,
    connection: Arc<ConnectionManager>,
    history: Arc<dyn HistoryService>,
    store: Arc<MessageStore>,
    inner: Mutex<CoordinatorState>,
    events: broadcast::Sender<ChatEvent>,
}

impl DeliveryCoordinator {
    pub fn new(
        self_id: UserId,
        directory: ConversationDirectory,
        connection: Arc<ConnectionManager>,
        history: Arc<dyn HistoryService>,
        channel_prefix: impl Into<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            self_id,
            channel_prefix: channel_prefix.into(),
            connection,
            history,
            store: Arc::new(MessageStore::new()),
            inner: Mutex::new(CoordinatorState {
                directory,
                phase: ConversationPhase::Idle,
                generation: 0,
                subscription: None,
                inbound_task: None,
                pending_outbound: VecDeque::new(),
                last_local_id: 0,
            }),
            events,
        })
    }

    /// Fetches the roster once and tries to go online. A broker failure
    /// leaves the coordinator usable but offline.
    pub async fn start(
        self_id: UserId,
        config: &ChatConfig,
        credentials: &Credentials,
        connector: Arc<dyn BrokerConnector>,
        roster: &dyn RosterService,
        history: Arc<dyn HistoryService>,
    ) -> anyhow::Result<Arc<Self>> {
        let roster = roster
            .fetch_roster()
            .await
            .context("failed to fetch correspondent roster")?;
        info!(user_id = self_id.0, correspondents = roster.len(), "roster loaded");

        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.connect_timeout,
            config.publish_timeout,
        ));
        let coordinator = Self::new(
            self_id,
            ConversationDirectory::new(roster),
            connection,
            history,
            config.channel_prefix.clone(),
        );
        if let Err(err) = coordinator.connect(&config.broker_url, credentials).await {
            warn!("starting offline: {err}");
        }
        Ok(coordinator)
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn store(&self) -> Arc<MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn connection(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connection)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub async fn roster(&self) -> Vec<Correspondent> {
        self.inner.lock().await.directory.list().to_vec()
    }

    pub async fn phase(&self) -> ConversationPhase {
        self.inner.lock().await.phase.clone()
    }

    pub async fn selection(&self) -> Option<ConversationSelection> {
        self.inner.lock().await.directory.selected().cloned()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.store.snapshot().await
    }

    /// True when a conversation is open and the broker is reachable.
    pub async fn can_send(&self) -> bool {
        let active = matches!(
            self.inner.lock().await.phase,
            ConversationPhase::Active(_)
        );
        active && self.connection.is_connected().await
    }

    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle, ChatError> {
        let result = self.connection.connect(endpoint, credentials).await;

        let mut guard = self.inner.lock().await;
        // A select racing this connect may already have subscribed on the new
        // session; release it so the channel is attached exactly once.
        if let Some(stale) = guard.stop_inbound() {
            if let Err(err) = self.connection.unsubscribe(&stale).await {
                debug!(destination = %stale.destination, "unsubscribe failed: {err}");
            }
        }
        match result {
            Ok(handle) => {
                let _ = self.events.send(ChatEvent::ConnectionChanged { online: true });
                self.attach_channel(&mut guard).await;
                Ok(handle)
            }
            Err(err) => {
                let _ = self
                    .events
                    .send(ChatEvent::ConnectionChanged { online: false });
                Err(err.into())
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.stop_inbound();
        self.connection.disconnect().await;
        let _ = self
            .events
            .send(ChatEvent::ConnectionChanged { online: false });
    }

    /// Opens the conversation with `recipient_id`, replacing the history of
    /// any previously open one.
    pub async fn select(self: &Arc<Self>, recipient_id: UserId) -> Result<SelectOutcome, ChatError> {
        let (generation, previous) = {
            let mut guard = self.inner.lock().await;
            if guard.directory.get(recipient_id).is_none() {
                return Err(NotFoundError(recipient_id).into());
            }
            let current = match &guard.phase {
                ConversationPhase::Idle => None,
                ConversationPhase::Loading { recipient_id } => Some(*recipient_id),
                ConversationPhase::Active(selection) => Some(selection.recipient_id),
            };
            if current == Some(recipient_id) {
                debug!(recipient_id = recipient_id.0, "conversation already selected");
                return Ok(SelectOutcome::AlreadySelected);
            }

            guard.generation += 1;
            guard.phase = ConversationPhase::Loading { recipient_id };
            guard.pending_outbound.clear();
            // Cleared under the lock so no late append from the previous
            // conversation can land after it.
            self.store.clear().await;
            (guard.generation, guard.stop_inbound())
        };

        let _ = self
            .events
            .send(ChatEvent::ConversationLoading { recipient_id });
        if let Some(previous) = previous {
            if let Err(err) = self.connection.unsubscribe(&previous).await {
                debug!(destination = %previous.destination, "unsubscribe failed: {err}");
            }
        }

        let loaded = self.history.fetch_history(recipient_id).await;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(recipient_id = recipient_id.0, "discarding superseded history load");
            return Ok(SelectOutcome::Superseded);
        }

        let history = match loaded {
            Ok(history) => history,
            Err(err) => {
                guard.phase = ConversationPhase::Idle;
                guard.directory.clear_selection();
                drop(guard);
                let reason = format!("{err:#}");
                warn!(recipient_id = recipient_id.0, "history load failed: {reason}");
                let _ = self.events.send(ChatEvent::LoadFailed {
                    recipient_id,
                    reason: reason.clone(),
                });
                return Err(LoadError {
                    recipient_id,
                    reason,
                }
                .into());
            }
        };

        let total = history.len();
        let history: Vec<Message> = history
            .into_iter()
            .filter(|message| message.is_between(self.self_id, recipient_id))
            .collect();
        if history.len() != total {
            warn!(
                recipient_id = recipient_id.0,
                dropped = total - history.len(),
                "history contained messages from other conversations"
            );
        }

        let correspondent = guard.directory.select(recipient_id)?;
        let selection = ConversationSelection::from(&correspondent);
        guard.phase = ConversationPhase::Active(selection.clone());
        self.store.replace(history).await;
        let _ = self
            .events
            .send(ChatEvent::ConversationOpened(selection.clone()));
        let messages = self.store.len().await;
        info!(recipient_id = recipient_id.0, messages, "conversation opened");

        self.attach_channel(&mut guard).await;
        Ok(SelectOutcome::Opened(selection))
    }

    /// Appends `text` optimistically and publishes it. Whitespace-only text is
    /// ignored.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, ChatError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let (message, destination) = {
            let mut guard = self.inner.lock().await;
            let recipient_id = match &guard.phase {
                ConversationPhase::Active(selection) => selection.recipient_id,
                _ => return Err(ChatError::NoConversation),
            };

            let now = Utc::now().timestamp_millis();
            let local_id = now.max(guard.last_local_id + 1);
            guard.last_local_id = local_id;
            let message = Message {
                id: MessageId(local_id),
                sender_id: self.self_id,
                recipient_id: Some(recipient_id),
                content: text.to_string(),
                timestamp: now,
            };
            self.store.append(message.clone()).await;

            if guard.pending_outbound.len() == MAX_PENDING_ECHOES {
                guard.pending_outbound.pop_front();
            }
            guard.pending_outbound.push_back(PendingSend {
                local_id: message.id,
                content: message.content.clone(),
            });
            (message, publish_destination(self.self_id, recipient_id))
        };

        let payload = SendPayload {
            content: text.to_string(),
        };
        let published = match serde_json::to_string(&payload) {
            Ok(body) => match self.connection.publish(&destination, body).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(local_id = message.id.0, "message kept locally: {err}");
                    false
                }
            },
            Err(err) => {
                warn!("failed to encode outgoing message: {err}");
                false
            }
        };
        if !published {
            // No echo will come for it; keep it from claiming a later one.
            self.inner
                .lock()
                .await
                .pending_outbound
                .retain(|pending| pending.local_id != message.id);
        }
        Ok(SendOutcome::Sent(message))
    }

    async fn attach_channel(self: &Arc<Self>, guard: &mut CoordinatorState) {
        let ConversationPhase::Active(selection) = &guard.phase else {
            return;
        };
        if guard.subscription.is_some() {
            return;
        }

        let channel =
            conversation_channel(&self.channel_prefix, self.self_id, selection.recipient_id);
        match self.connection.subscribe(&channel).await {
            Ok(subscription) => {
                guard.subscription = Some(subscription.handle());
                guard.inbound_task = Some(self.spawn_inbound(subscription, guard.generation));
            }
            Err(ConnectionError::NotConnected) => {
                debug!(%channel, "offline; channel will be attached on reconnect");
            }
            Err(err) => warn!(%channel, "failed to subscribe: {err}"),
        }
    }

    fn spawn_inbound(self: &Arc<Self>, mut subscription: Subscription, generation: u64) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(delivery) = subscription.deliveries.recv().await {
                coordinator.receive(generation, &delivery.body).await;
            }
            debug!(destination = %subscription.destination, "inbound stream ended");
            // Drops a session the broker closed and flips the connection state.
            let online = coordinator.connection.is_connected().await;
            let mut guard = coordinator.inner.lock().await;
            if guard.generation == generation
                && guard.subscription.as_ref().map(|s| s.id.as_str()) == Some(subscription.id.as_str())
            {
                guard.subscription = None;
                guard.inbound_task = None;
                drop(guard);
                if !online {
                    warn!(destination = %subscription.destination, "broker connection lost");
                    let _ = coordinator
                        .events
                        .send(ChatEvent::ConnectionChanged { online: false });
                }
            }
        })
    }

    async fn receive(&self, generation: u64, body: &str) {
        let message: Message = match serde_json::from_str(body) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping undecodable inbound message: {err}");
                let _ = self.events.send(ChatEvent::InboundRejected {
                    reason: err.to_string(),
                });
                return;
            }
        };

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return;
        }
        let ConversationPhase::Active(selection) = &guard.phase else {
            return;
        };
        if !message.is_between(self.self_id, selection.recipient_id) {
            debug!(
                message_id = message.id.0,
                sender_id = message.sender_id.0,
                "dropping message outside the open conversation"
            );
            let _ = self.events.send(ChatEvent::InboundRejected {
                reason: format!("message {} is not part of the open conversation", message.id),
            });
            return;
        }

        if message.sender_id == self.self_id {
            let index = guard
                .pending_outbound
                .iter()
                .position(|pending| pending.content == message.content);
            if let Some(pending) = index.and_then(|index| guard.pending_outbound.remove(index)) {
                if self.store.reconcile(pending.local_id, message.clone()).await {
                    debug!(
                        local_id = pending.local_id.0,
                        message_id = message.id.0,
                        "optimistic message confirmed"
                    );
                    return;
                }
            }
        }

        self.store.append(message).await;
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
