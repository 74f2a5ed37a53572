use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{EventFrameStartedLoading, EventLoadEventFired};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::{js_string, PageDriver, PageEvent, PageHost, TabId};
use crate::error::{RelayError, Result};

const MARKER_PROPERTY: &str = "__listingRelayRole";

/// A Chrome tab driven over CDP.
#[derive(Debug, Clone)]
pub struct ChromePage {
    tab_id: TabId,
    page: Page,
}

impl ChromePage {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| RelayError::Browser(format!("Script evaluation failed on tab {}: {}", self.tab_id, e)))?;
        let value = result.into_value::<T>().map_err(RelayError::from)?;
        Ok(value)
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    fn tab_id(&self) -> TabId {
        self.tab_id
    }

    async fn url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to read url of tab {}: {}", self.tab_id, e)))?;
        Ok(url.unwrap_or_default())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        self.eval(format!("document.querySelector({}) !== null", js_string(selector)))
            .await
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        match self.page.find_element(selector).await {
            Ok(element) => {
                element
                    .click()
                    .await
                    .map_err(|e| RelayError::Browser(format!("Click on {} failed: {}", selector, e)))?;
                debug!("Clicked {} on tab {}", selector, self.tab_id);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn content(&self) -> Result<String> {
        let html = self
            .page
            .content()
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to get page content: {}", e)))?;
        Ok(html)
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        info!("Navigating tab {} to {}", self.tab_id, url);
        // don't wait for the load: this document, and the agent in it, is about to go away
        self.eval::<serde_json::Value>(format!("window.location.assign({}); null", js_string(url)))
            .await?;
        Ok(())
    }

    async fn read_marker(&self) -> Result<Option<String>> {
        self.eval(format!("window.{} || null", MARKER_PROPERTY)).await
    }

    async fn write_marker(&self, role: &str) -> Result<()> {
        self.eval::<serde_json::Value>(format!("window.{} = {}; null", MARKER_PROPERTY, js_string(role)))
            .await?;
        Ok(())
    }
}

struct OpenTab {
    page: ChromePage,
    watcher: JoinHandle<()>,
}

/// Owns the Chrome process and every tab the coordinator opened.
pub struct BrowserManager {
    browser: Arc<Browser>,
    tabs: Arc<RwLock<HashMap<TabId, OpenTab>>>,
    events: broadcast::Sender<PageEvent>,
    next_tab: AtomicU32,
}

impl BrowserManager {
    pub async fn launch(headless: bool) -> Result<Self> {
        let browser = Self::create_browser(headless).await?;
        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            browser: Arc::new(browser),
            tabs: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_tab: AtomicU32::new(1),
        })
    }

    async fn create_browser(headless: bool) -> Result<Browser> {
        let user_data_dir = std::env::temp_dir().join(format!("listing-relay-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| RelayError::Browser(format!("Failed to create profile dir: {}", e)))?;

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(&user_data_dir)
            .args(vec![
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--mute-audio",
                "--no-first-run",
                "--disable-default-apps",
                "--disable-sync",
                "--disable-background-timer-throttling",
                "--disable-renderer-backgrounding",
                "--disable-backgrounding-occluded-windows",
                "--disable-blink-features=AutomationControlled",
            ]);
        if !headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| RelayError::Browser(format!("Failed to create browser config: {}", e)))?;

        let mut last_error = None;
        for attempt in 1..=3 {
            match Browser::launch(config.clone()).await {
                Ok((browser, mut handler)) => {
                    info!("Browser launched on attempt {}", attempt);
                    tokio::spawn(async move {
                        while let Some(event) = handler.next().await {
                            if let Err(e) = event {
                                let message = e.to_string();
                                if message.contains("data did not match any variant") {
                                    debug!("Ignoring CDP deserialization error: {}", e);
                                } else {
                                    warn!("Browser handler error: {}", e);
                                }
                            }
                        }
                        debug!("Browser handler task ended");
                    });
                    return Ok(browser);
                }
                Err(e) => {
                    error!("Browser launch attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        Err(RelayError::Browser(format!(
            "Failed to launch browser after 3 attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
        .into())
    }

    /// Forwards CDP load events of one tab as [`PageEvent`]s.
    async fn watch_tab(&self, tab_id: TabId, page: &Page) -> Result<JoinHandle<()>> {
        let mut started = page
            .event_listener::<EventFrameStartedLoading>()
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to listen for navigation: {}", e)))?;
        let mut loaded = page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to listen for load events: {}", e)))?;

        let page = page.clone();
        let events = self.events.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = started.next() => {
                        if event.is_none() {
                            break;
                        }
                        let _ = events.send(PageEvent::Loading { tab_id });
                    }
                    event = loaded.next() => {
                        if event.is_none() {
                            break;
                        }
                        let url = page.url().await.ok().flatten().unwrap_or_default();
                        let _ = events.send(PageEvent::Complete { tab_id, url });
                    }
                }
            }
            let _ = events.send(PageEvent::Closed { tab_id });
            debug!("Event watcher for tab {} ended", tab_id);
        }))
    }

    pub async fn open_tab_count(&self) -> usize {
        self.tabs.read().await.len()
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down browser manager");
        let tab_ids: Vec<TabId> = self.tabs.read().await.keys().copied().collect();
        for tab_id in tab_ids {
            if let Err(e) = self.close_page(tab_id).await {
                error!("Failed to close tab {}: {}", tab_id, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PageHost for BrowserManager {
    async fn open_page(&self, url: &str, active: bool) -> Result<TabId> {
        let tab_id = self.next_tab.fetch_add(1, Ordering::Relaxed);

        let page = tokio::time::timeout(Duration::from_secs(10), self.browser.new_page("about:blank"))
            .await
            .map_err(|_| RelayError::Browser("Timeout creating new page".to_string()))?
            .map_err(|e| RelayError::Browser(format!("Failed to create new page: {}", e)))?;

        if active {
            if let Err(e) = page.bring_to_front().await {
                warn!("Could not activate tab {}: {}", tab_id, e);
            }
        }

        // listen before navigating so the first load is not missed
        let watcher = self.watch_tab(tab_id, &page).await?;
        let chrome_page = ChromePage { tab_id, page: page.clone() };
        self.tabs.write().await.insert(
            tab_id,
            OpenTab {
                page: chrome_page,
                watcher,
            },
        );

        page.goto(url)
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to navigate to {}: {}", url, e)))?;

        info!("Opened tab {} at {}", tab_id, url);
        Ok(tab_id)
    }

    async fn close_page(&self, tab_id: TabId) -> Result<()> {
        let Some(tab) = self.tabs.write().await.remove(&tab_id) else {
            return Ok(());
        };
        tab.watcher.abort();
        tab.page
            .page
            .close()
            .await
            .map_err(|e| RelayError::Browser(format!("Failed to close tab {}: {}", tab_id, e)))?;
        let _ = self.events.send(PageEvent::Closed { tab_id });

        info!("Closed tab {}", tab_id);
        Ok(())
    }

    async fn page(&self, tab_id: TabId) -> Option<Arc<dyn PageDriver>> {
        self.tabs
            .read()
            .await
            .get(&tab_id)
            .map(|tab| Arc::new(tab.page.clone()) as Arc<dyn PageDriver>)
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}

impl Drop for BrowserManager {
    fn drop(&mut self) {
        info!("Browser manager dropped");
    }
}
