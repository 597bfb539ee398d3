use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::ActionError;
use crate::session::ResourceKind;

/// Where the caller should go after a successful action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub link: String,
}

#[derive(Deserialize)]
struct RetryResponse {
    build: Option<LinkedRecord>,
}

#[derive(Deserialize)]
struct LinkedRecord {
    link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryAction {
    client: reqwest::Client,
    base_url: String,
}

impl RetryAction {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn retry_url(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}/api/0/{}/{id}/retry/", self.base_url, kind.collection())
    }

    /// POSTs the retry request and returns the new build's link.
    pub async fn retry(&self, kind: ResourceKind, id: &str) -> Result<Navigation, ActionError> {
        let url = self.retry_url(kind, id);
        info!(event = "retry_requested", kind = %kind, id = %id, url = %url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|err| ActionError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ActionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ActionError::Decode(err.to_string()))?;
        navigation_from_response(&payload)
    }
}

/// Reads `{"build": {"link": ...}}`.
pub fn navigation_from_response(payload: &Value) -> Result<Navigation, ActionError> {
    let response = RetryResponse::deserialize(payload)
        .map_err(|err| ActionError::Decode(err.to_string()))?;
    response
        .build
        .and_then(|build| build.link)
        .filter(|link| !link.trim().is_empty())
        .map(|link| Navigation { link })
        .ok_or(ActionError::MissingLink)
}
