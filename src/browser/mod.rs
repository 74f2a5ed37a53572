pub mod manager;

#[cfg(test)]
pub mod fake;


use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

pub use manager::{BrowserManager, ChromePage};

pub type TabId = u32;

/// Navigation lifecycle of a page, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// A new document started loading; whatever ran in the old one is gone.
    Loading { tab_id: TabId },
    Complete { tab_id: TabId, url: String },
    Closed { tab_id: TabId },
}

impl PageEvent {
    pub fn tab_id(&self) -> TabId {
        match self {
            PageEvent::Loading { tab_id } => *tab_id,
            PageEvent::Complete { tab_id, .. } => *tab_id,
            PageEvent::Closed { tab_id } => *tab_id,
        }
    }
}

/// What an agent can do inside the page it is bound to.
#[async_trait]
pub trait PageDriver: Send + Sync {
    fn tab_id(&self) -> TabId;
    async fn url(&self) -> Result<String>;
    async fn exists(&self, selector: &str) -> Result<bool>;
    /// Clicks the first match. `Ok(false)` when nothing matches.
    async fn click(&self, selector: &str) -> Result<bool>;
    async fn content(&self) -> Result<String>;
    async fn navigate(&self, url: &str) -> Result<()>;
    /// Role marker left in the current document by an earlier activation.
    async fn read_marker(&self) -> Result<Option<String>>;
    async fn write_marker(&self, role: &str) -> Result<()>;
}

/// Opens, closes and watches pages on behalf of the dispatcher.
#[async_trait]
pub trait PageHost: Send + Sync {
    async fn open_page(&self, url: &str, active: bool) -> Result<TabId>;
    async fn close_page(&self, tab_id: TabId) -> Result<()>;
    async fn page(&self, tab_id: TabId) -> Option<Arc<dyn PageDriver>>;
    fn events(&self) -> broadcast::Receiver<PageEvent>;
}

/// JS string literal for a selector, safe to splice into a script.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}
