//! Scripted pages for exercising agents and the dispatcher without Chrome.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::browser::{PageDriver, PageEvent, PageHost, TabId};
use crate::error::{RelayError, Result};

#[derive(Default)]
struct FakeDom {
    url: String,
    html: String,
    /// selector -> number of `exists` checks before it shows up
    elements: HashMap<String, u32>,
    marker: Option<String>,
    clicks: Vec<String>,
    navigations: Vec<String>,
    /// selector -> selectors revealed when it is clicked
    on_click: HashMap<String, Vec<String>>,
    /// selector -> url the page navigates to when it is clicked
    navigate_on_click: HashMap<String, String>,
}

pub struct FakePage {
    tab_id: TabId,
    dom: Mutex<FakeDom>,
    events: Option<broadcast::Sender<PageEvent>>,
    site: Arc<Mutex<HashMap<String, String>>>,
}

impl FakePage {
    pub fn new(tab_id: TabId, url: &str) -> Self {
        Self {
            tab_id,
            dom: Mutex::new(FakeDom {
                url: url.to_string(),
                ..FakeDom::default()
            }),
            events: None,
            site: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_element(self, selector: &str) -> Self {
        self.show(selector);
        self
    }

    pub fn with_html(self, html: &str) -> Self {
        self.dom.lock().unwrap().html = html.to_string();
        self
    }

    pub fn show(&self, selector: &str) {
        self.dom.lock().unwrap().elements.insert(selector.to_string(), 0);
    }

    pub fn show_after(&self, selector: &str, checks: u32) {
        self.dom.lock().unwrap().elements.insert(selector.to_string(), checks);
    }

    pub fn hide(&self, selector: &str) {
        self.dom.lock().unwrap().elements.remove(selector);
    }

    pub fn reveal_on_click(&self, clicked: &str, revealed: &str) {
        self.dom
            .lock()
            .unwrap()
            .on_click
            .entry(clicked.to_string())
            .or_default()
            .push(revealed.to_string());
    }

    /// Clicking `clicked` behaves like a submitting link to `url`.
    pub fn navigate_on_click(&self, clicked: &str, url: &str) {
        self.dom
            .lock()
            .unwrap()
            .navigate_on_click
            .insert(clicked.to_string(), url.to_string());
    }

    pub fn set_marker(&self, role: &str) {
        self.dom.lock().unwrap().marker = Some(role.to_string());
    }

    pub fn clicks(&self) -> Vec<String> {
        self.dom.lock().unwrap().clicks.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.dom.lock().unwrap().navigations.clone()
    }
}

#[async_trait]
impl PageDriver for FakePage {
    fn tab_id(&self) -> TabId {
        self.tab_id
    }

    async fn url(&self) -> Result<String> {
        Ok(self.dom.lock().unwrap().url.clone())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let mut dom = self.dom.lock().unwrap();
        match dom.elements.get_mut(selector) {
            Some(0) => Ok(true),
            Some(remaining) => {
                *remaining -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        let target = {
            let mut dom = self.dom.lock().unwrap();
            if dom.elements.get(selector) != Some(&0) {
                return Ok(false);
            }
            dom.clicks.push(selector.to_string());
            if let Some(revealed) = dom.on_click.get(selector).cloned() {
                for r in revealed {
                    dom.elements.insert(r, 0);
                }
            }
            dom.navigate_on_click.get(selector).cloned()
        };
        if let Some(url) = target {
            self.navigate(&url).await?;
        }
        Ok(true)
    }

    async fn content(&self) -> Result<String> {
        Ok(self.dom.lock().unwrap().html.clone())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let html = self.site.lock().unwrap().get(url).cloned();
        {
            let mut dom = self.dom.lock().unwrap();
            dom.navigations.push(url.to_string());
            dom.url = url.to_string();
            dom.marker = None;
            dom.html = html.unwrap_or_default();
        }
        if let Some(events) = &self.events {
            let _ = events.send(PageEvent::Loading { tab_id: self.tab_id });
            let _ = events.send(PageEvent::Complete {
                tab_id: self.tab_id,
                url: url.to_string(),
            });
        }
        Ok(())
    }

    async fn read_marker(&self) -> Result<Option<String>> {
        Ok(self.dom.lock().unwrap().marker.clone())
    }

    async fn write_marker(&self, role: &str) -> Result<()> {
        self.dom.lock().unwrap().marker = Some(role.to_string());
        Ok(())
    }
}

/// In-process stand-in for the browser. Pages navigate instantly; the
/// `site` map supplies HTML per URL.
pub struct FakeHost {
    pages: Mutex<HashMap<TabId, Arc<FakePage>>>,
    opened: Mutex<Vec<(TabId, String)>>,
    closed: Mutex<Vec<TabId>>,
    site: Arc<Mutex<HashMap<String, String>>>,
    events: broadcast::Sender<PageEvent>,
    next_tab: AtomicU32,
    /// Complete events are only sent by `fire_complete` when false.
    auto_load: bool,
}

impl FakeHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            pages: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            site: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_tab: AtomicU32::new(1),
            auto_load: true,
        }
    }

    pub fn manual_load() -> Self {
        Self {
            auto_load: false,
            ..Self::new()
        }
    }

    pub fn add_site_page(&self, url: &str, html: &str) {
        self.site.lock().unwrap().insert(url.to_string(), html.to_string());
    }

    /// Registers a page without announcing any events.
    pub fn insert_page(&self, url: &str) -> Arc<FakePage> {
        let tab_id = self.next_tab.fetch_add(1, Ordering::Relaxed);
        let html = self.site.lock().unwrap().get(url).cloned().unwrap_or_default();
        let page = Arc::new(FakePage {
            tab_id,
            dom: Mutex::new(FakeDom {
                url: url.to_string(),
                html,
                ..FakeDom::default()
            }),
            events: Some(self.events.clone()),
            site: self.site.clone(),
        });
        self.pages.lock().unwrap().insert(tab_id, page.clone());
        page
    }

    pub fn fake_page(&self, tab_id: TabId) -> Option<Arc<FakePage>> {
        self.pages.lock().unwrap().get(&tab_id).cloned()
    }

    pub fn fire_complete(&self, tab_id: TabId) {
        if let Some(page) = self.fake_page(tab_id) {
            let url = page.dom.lock().unwrap().url.clone();
            let _ = self.events.send(PageEvent::Complete { tab_id, url });
        }
    }

    pub fn opened(&self) -> Vec<(TabId, String)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<TabId> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageHost for FakeHost {
    async fn open_page(&self, url: &str, _active: bool) -> Result<TabId> {
        let page = self.insert_page(url);
        let tab_id = page.tab_id;
        self.opened.lock().unwrap().push((tab_id, url.to_string()));
        let _ = self.events.send(PageEvent::Loading { tab_id });
        if self.auto_load {
            self.fire_complete(tab_id);
        }
        Ok(tab_id)
    }

    async fn close_page(&self, tab_id: TabId) -> Result<()> {
        if self.pages.lock().unwrap().remove(&tab_id).is_none() {
            return Err(RelayError::Browser(format!("No tab {}", tab_id)).into());
        }
        self.closed.lock().unwrap().push(tab_id);
        let _ = self.events.send(PageEvent::Closed { tab_id });
        Ok(())
    }

    async fn page(&self, tab_id: TabId) -> Option<Arc<dyn PageDriver>> {
        self.fake_page(tab_id).map(|p| p as Arc<dyn PageDriver>)
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }
}
