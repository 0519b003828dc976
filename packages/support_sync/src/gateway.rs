//! Persistence Gateway
//!
//! Stateless access to the persistence service. The session only sees the
//! [`PersistenceGateway`] trait so tests can swap in an in-memory fake.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::types::{ConversationRecord, ConversationSummary, PersistedMessage};

#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    /// Conversation summaries for an owner, most recent first.
    async fn list_conversations(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError>;

    /// Full history plus the customer's identity.
    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, GatewayError>;

    /// Stores a message. Called at most once per draft; callers never retry.
    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<PersistedMessage, GatewayError>;

    /// Best-effort acknowledgement that the agent has read the conversation.
    async fn mark_read(&self, conversation_id: &str) -> Result<(), GatewayError>;
}

/// HTTP implementation backed by a JSON REST API.
///
/// | Operation | Request |
/// |---|---|
/// | list | `GET {base}/conversations?ownerId=..` |
/// | fetch | `GET {base}/conversations/{id}` |
/// | send | `POST {base}/conversations/{id}/messages` with `{"body": ..}` |
/// | mark read | `POST {base}/conversations/{id}/read` |
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(GatewayError::from_reqwest)?;

        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| GatewayError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(config.base_url.clone()));
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Appends path segments to the base url, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let err = GatewayError::from_status(status, body);
        if matches!(err, GatewayError::Unavailable(_)) {
            tracing::warn!(%status, "persistence service unavailable");
        }
        Err(err)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let resp = self.execute(request).await?;
        let bytes = resp.bytes().await.map_err(GatewayError::from_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn list_conversations(
        &self,
        owner_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let url = self.endpoint(&["conversations"]);
        let conversations: Vec<ConversationSummary> = self
            .json(self.client.get(url).query(&[("ownerId", owner_id)]))
            .await?;
        tracing::debug!(owner_id, count = conversations.len(), "listed conversations");
        Ok(conversations)
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, GatewayError> {
        let url = self.endpoint(&["conversations", conversation_id]);
        self.json(self.client.get(url))
            .await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        body: &str,
    ) -> Result<PersistedMessage, GatewayError> {
        let url = self.endpoint(&["conversations", conversation_id, "messages"]);
        self.json(self.client.post(url).json(&json!({ "body": body })))
            .await
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<(), GatewayError> {
        let url = self.endpoint(&["conversations", conversation_id, "read"]);
        self.execute(self.client.post(url)).await?;
        Ok(())
    }
}
