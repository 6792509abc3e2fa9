use std::sync::Arc;

use async_trait::async_trait;
use shared::{domain::Credentials, error::ConnectionError};
use tokio::sync::mpsc;

/// One message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub destination: String,
    pub body: String,
}

/// A live subscription. Deliveries arrive on `deliveries` in receipt order;
/// the receiver ends when the subscription or its session is released.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id.clone(),
            destination: self.destination.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub destination: String,
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, destination: &str) -> Result<Subscription, ConnectionError>;
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ConnectionError>;
    async fn publish(&self, destination: &str, body: String) -> Result<(), ConnectionError>;
    /// Releases the session. Calling it again is a no-op.
    async fn disconnect(&self) -> Result<(), ConnectionError>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError>;
}
