use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use chatsync_types::api::{ErrorBody, HealthResponse};
use chatsync_types::events::MessagePayload;
use chatsync_types::{Message, SessionIdentity};

use crate::error::LoadError;

/// Where the engine gets the message history on connect.
pub trait HistorySource: Send + Sync {
    /// One attempt, no retry.
    fn fetch(&self, identity: &SessionIdentity) -> BoxFuture<'static, Result<Vec<Message>, LoadError>>;
}

/// History and health over the chat server's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    client: Client,
    base_url: String,
}

impl HttpHistory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LoadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoadError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<HealthResponse, LoadError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| LoadError::Request(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.json::<HealthResponse>()
            .await
            .map_err(|e| LoadError::Decode(e.to_string()))
    }
}

impl HistorySource for HttpHistory {
    fn fetch(&self, identity: &SessionIdentity) -> BoxFuture<'static, Result<Vec<Message>, LoadError>> {
        let request = self
            .client
            .get(format!("{}/chat/messages", self.base_url))
            .bearer_auth(&identity.token);

        Box::pin(async move {
            let resp = request
                .send()
                .await
                .map_err(|e| LoadError::Request(e.to_string()))?;
            let resp = check_status(resp).await?;
            let raw: Vec<Value> = resp
                .json()
                .await
                .map_err(|e| LoadError::Decode(e.to_string()))?;
            Ok(decode_history(raw))
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LoadError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(LoadError::Unauthorized);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.describe().map(str::to_string))
            .unwrap_or(body);
        return Err(LoadError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

/// Keep every well-formed entry, in server order.
pub fn decode_history(raw: Vec<Value>) -> Vec<Message> {
    let total = raw.len();
    let messages: Vec<Message> = raw
        .into_iter()
        .filter_map(|value| {
            let decoded = MessagePayload::deserialize(&value)
                .map_err(|e| e.to_string())
                .and_then(|p| p.into_message("history").map_err(|e| e.to_string()));
            match decoded {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("bad history entry: {} -- raw: {}", e, value);
                    None
                }
            }
        })
        .collect();
    debug!("decoded {} of {} history entries", messages.len(), total);
    messages
}
