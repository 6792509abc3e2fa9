//! Roster and history collaborators consumed by the delivery coordinator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use shared::domain::{Correspondent, Credentials, Message, UserId};

#[async_trait]
pub trait RosterService: Send + Sync {
    async fn fetch_roster(&self) -> Result<Vec<Correspondent>>;
}

#[async_trait]
pub trait HistoryService: Send + Sync {
    /// Messages exchanged with `recipient_id`, oldest first.
    async fn fetch_history(&self, recipient_id: UserId) -> Result<Vec<Message>>;
}

// Some deployments wrap list responses in a `data` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Bare(items) | Listing::Wrapped { data: items } => items,
        }
    }
}

/// REST client for the chat backend.
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, credentials: &Credentials) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: credentials.token.clone(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_listing<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let listing: Listing<T> = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid response body from {url}"))?;
        Ok(listing.into_vec())
    }
}

#[async_trait]
impl RosterService for HttpChatApi {
    async fn fetch_roster(&self) -> Result<Vec<Correspondent>> {
        self.get_listing(format!("{}/chats/users", self.base_url))
            .await
    }
}

#[async_trait]
impl HistoryService for HttpChatApi {
    async fn fetch_history(&self, recipient_id: UserId) -> Result<Vec<Message>> {
        self.get_listing(format!("{}/chats/{recipient_id}", self.base_url))
            .await
    }
}

#[cfg(test)]
#[path = "tests/services_tests.rs"]
mod tests;
