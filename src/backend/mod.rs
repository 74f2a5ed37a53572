pub mod http;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use http::HttpBackend;

/// Remote listing/user service. Payloads and replies are passed through
/// untouched; a `success:false` reply comes back as `RelayError::Request`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Signs in and keeps the returned token for later calls.
    async fn sign_in(&self, payload: Value) -> Result<Value>;
    async fn add_user(&self, payload: Value) -> Result<Value>;
    async fn get_user_status(&self, payload: Value) -> Result<Value>;
    async fn get_all_users(&self, payload: Value) -> Result<Value>;
    async fn update_user_status(&self, payload: Value) -> Result<Value>;
    async fn add_listing(&self, payload: Value) -> Result<Value>;
    async fn get_listing(&self, payload: Value) -> Result<Value>;
    async fn get_all_listing(&self, payload: Value) -> Result<Value>;
    async fn delete_listing(&self, payload: Value) -> Result<Value>;
    async fn delete_listing_with_id(&self, payload: Value) -> Result<Value>;
}
