use shared::domain::{Message, MessageId};
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Replaced(Vec<Message>),
    Appended(Message),
    Reconciled { local_id: MessageId, message: Message },
    Cleared,
}

/// Ordered history of the open conversation. Order is receipt order; the
/// store never sorts by timestamp.
pub struct MessageStore {
    history: RwLock<Vec<Message>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            history: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn replace(&self, history: Vec<Message>) {
        *self.history.write().await = history.clone();
        let _ = self.events.send(StoreEvent::Replaced(history));
    }

    pub async fn append(&self, message: Message) {
        self.history.write().await.push(message.clone());
        let _ = self.events.send(StoreEvent::Appended(message));
    }

    /// Swaps the optimistic entry `local_id` for its confirmed copy in place.
    /// Returns false when no such entry exists.
    pub async fn reconcile(&self, local_id: MessageId, confirmed: Message) -> bool {
        {
            let mut history = self.history.write().await;
            let Some(slot) = history.iter_mut().find(|message| message.id == local_id) else {
                return false;
            };
            *slot = confirmed.clone();
        }
        let _ = self.events.send(StoreEvent::Reconciled {
            local_id,
            message: confirmed,
        });
        true
    }

    pub async fn clear(&self) {
        let was_empty = {
            let mut history = self.history.write().await;
            let was_empty = history.is_empty();
            history.clear();
            was_empty
        };
        if !was_empty {
            let _ = self.events.send(StoreEvent::Cleared);
        }
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.history.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.history.read().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
