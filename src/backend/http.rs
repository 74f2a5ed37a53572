use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::BackendApi;
use crate::config::BackendConfig;
use crate::error::{RelayError, Result};
use crate::store::{keys, Store};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// JSON-over-HTTP client for the listing/user service.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    store: Store,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, store: Store) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            store,
        })
    }

    async fn token(&self) -> Option<String> {
        self.store
            .get(keys::AUTH_TOKEN)
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    async fn post(&self, operation: &str, payload: Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, operation);
        let token = self.token().await;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut request = self.client.post(&url).json(&payload);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| RelayError::Network(format!("Request to {} failed: {}", operation, e)))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                warn!("Backend rate limited {}, waiting...", operation);
                sleep(Duration::from_secs(2u64.pow(attempt))).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            debug!("Backend {} answered {}", operation, status);
            return interpret_reply(operation, status, &body);
        }

        Err(RelayError::Network(format!("{} still rate limited after {} retries", operation, MAX_RATE_LIMIT_RETRIES)).into())
    }
}

/// Maps a raw reply onto the `{success, ...}` contract.
fn interpret_reply(operation: &str, status: StatusCode, body: &str) -> Result<Value> {
    let reply: Value = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(_) if !status.is_success() => {
            return Err(RelayError::Network(format!("{} failed with status {}: {}", operation, status, body)).into());
        }
        Err(e) => return Err(RelayError::from(e).into()),
    };

    let success = reply.get("success").and_then(Value::as_bool).unwrap_or(status.is_success());
    if success {
        return Ok(reply);
    }

    let message = reply
        .get("message")
        .or_else(|| reply.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} failed with status {}", operation, status));
    let needs_subscription = reply
        .get("needsSubscription")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Err(RelayError::Request {
        message,
        needs_subscription,
    }
    .into())
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn sign_in(&self, payload: Value) -> Result<Value> {
        let reply = self.post("sign-in", payload).await?;
        if let Some(token) = reply.get("token").and_then(Value::as_str) {
            self.store.set(keys::AUTH_TOKEN, Value::String(token.to_string())).await?;
            info!("Signed in to backend");
        } else {
            warn!("sign-in reply carried no token");
        }
        Ok(reply)
    }

    async fn add_user(&self, payload: Value) -> Result<Value> {
        self.post("add-user", payload).await
    }

    async fn get_user_status(&self, payload: Value) -> Result<Value> {
        self.post("get-user-status", payload).await
    }

    async fn get_all_users(&self, payload: Value) -> Result<Value> {
        self.post("get-all-users", payload).await
    }

    async fn update_user_status(&self, payload: Value) -> Result<Value> {
        self.post("update-user-status", payload).await
    }

    async fn add_listing(&self, payload: Value) -> Result<Value> {
        self.post("add-listing", payload).await
    }

    async fn get_listing(&self, payload: Value) -> Result<Value> {
        self.post("get-listing", payload).await
    }

    async fn get_all_listing(&self, payload: Value) -> Result<Value> {
        self.post("get-all-listing", payload).await
    }

    async fn delete_listing(&self, payload: Value) -> Result<Value> {
        self.post("delete-listing", payload).await
    }

    async fn delete_listing_with_id(&self, payload: Value) -> Result<Value> {
        self.post("delete-listing-with-id", payload).await
    }
}
