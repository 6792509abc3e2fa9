pub mod config;
pub mod connection;
pub mod coordinator;
pub mod directory;
pub mod message_store;
pub mod services;
pub mod stomp;
pub mod transport;

pub use config::{load_config, ChatConfig};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use coordinator::{
    ChatEvent, ConversationPhase, DeliveryCoordinator, SelectOutcome, SendOutcome,
};
pub use directory::ConversationDirectory;
pub use message_store::{MessageStore, StoreEvent};
pub use services::{HistoryService, HttpChatApi, RosterService};
pub use stomp::StompConnector;
pub use transport::{BrokerConnector, BrokerSession, Delivery, Subscription, SubscriptionHandle};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
