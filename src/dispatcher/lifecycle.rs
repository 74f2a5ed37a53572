use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{lock, Dispatcher, Generation, PageBinding, RunCounters};
use crate::agents::{
    Agent, AgentContext, AgentMessage, AgentRole, AgentStatus, ListingStatus, ListingTask, ListingWizard,
    ResumeInstruction, ScraperAgent,
};
use crate::browser::{PageEvent, TabId};
use crate::error::Result;
use crate::session::{ScrapeKind, Session, SessionStatus};
use crate::store::{keys, Subscription};

impl Dispatcher {
    pub(super) async fn run_page_events(
        self,
        mut events: broadcast::Receiver<PageEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Page event loop received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_page_event(event),
                    Err(RecvError::Lagged(missed)) => warn!("Page event loop fell behind, {} events dropped", missed),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    fn on_page_event(&self, event: PageEvent) {
        match event {
            PageEvent::Loading { tab_id } => {
                if let Some(binding) = self.bindings.navigation_started(tab_id) {
                    debug!("Tab {} navigated away from its {} agent", tab_id, binding.role.as_str());
                }
                self.abort_agent(tab_id);
            }
            PageEvent::Closed { tab_id } => {
                self.bindings.page_closed(tab_id);
                self.abort_agent(tab_id);
                lock(&self.scrape_tabs).retain(|_, tab| *tab != tab_id);
                debug!("Tab {} closed", tab_id);
            }
            PageEvent::Complete { tab_id, url } => {
                // the generation must be read here, before any later navigation is seen
                let generation = self.bindings.generation(tab_id);
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.handle_page_loaded(tab_id, &url, generation).await {
                        warn!("Could not activate an agent on tab {}: {}", tab_id, e);
                    }
                });
            }
        }
    }

    fn abort_agent(&self, tab_id: TabId) {
        if let Some(handle) = lock(&self.agents).remove(&tab_id) {
            handle.abort();
        }
    }

    /// Classifies a freshly loaded document and activates the matching agent on it.
    pub(crate) async fn handle_page_loaded(
        &self,
        tab_id: TabId,
        url: &str,
        generation: Generation,
    ) -> Result<Option<PageBinding>> {
        let role = self.roles.read().await.classify(url);
        if role == AgentRole::None {
            debug!("Tab {} loaded {}, no agent needed", tab_id, url);
            return Ok(None);
        }
        info!("Tab {} loaded {} as a {} page", tab_id, url, role.as_str());
        self.activate(tab_id, role, generation, true).await
    }

    /// Binds and spawns an agent. With `check_marker` an activation is skipped
    /// if the document already carries a marker for the same role.
    pub(crate) async fn activate(
        &self,
        tab_id: TabId,
        role: AgentRole,
        generation: Generation,
        check_marker: bool,
    ) -> Result<Option<PageBinding>> {
        let Some(page) = self.host.page(tab_id).await else {
            debug!("Tab {} is gone, nothing to activate", tab_id);
            return Ok(None);
        };

        let agent_config = self.config.read().await.agents.clone();
        let ctx = AgentContext::new(role, page.clone(), self.store.clone(), agent_config, self.outbox.clone());
        let agent_id = ctx.id;

        let mut agent: Box<dyn Agent> = match role {
            AgentRole::Scraper => {
                let Some(resume) = self.resume_for(tab_id).await? else {
                    debug!("No running scrape session for tab {}", tab_id);
                    return Ok(None);
                };
                Box::new(ScraperAgent::new(ctx, self.tracker.clone(), resume)?)
            }
            AgentRole::Lister => Box::new(ListingWizard::new(ctx)),
            AgentRole::None => return Ok(None),
        };

        let Some(binding) = self.bindings.try_bind(tab_id, role, agent_id, generation) else {
            debug!("Tab {} already has an agent or has moved on", tab_id);
            return Ok(None);
        };

        // the marker is checked after binding so a finished agent's marker is always visible
        if check_marker {
            match page.read_marker().await {
                Ok(Some(marker)) if AgentRole::from_marker(&marker) == role => {
                    self.bindings.release(tab_id, agent_id);
                    debug!("Tab {} already ran a {} agent for this document", tab_id, role.as_str());
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => debug!("Could not read marker on tab {}: {}", tab_id, e),
            }
        }
        if let Err(e) = page.write_marker(role.as_str()).await {
            debug!("Could not write marker on tab {}: {}", tab_id, e);
        }

        let bindings = self.bindings.clone();
        let handle: JoinHandle<()> = tokio::spawn(async move {
            match agent.run().await {
                Ok(status) => debug!("{} agent {} on tab {} ended {:?}", agent.role().as_str(), agent_id, tab_id, status),
                Err(e) => error!("{} agent {} on tab {} failed: {}", agent.role().as_str(), agent_id, tab_id, e),
            }
            bindings.release(tab_id, agent_id);
        });

        lock(&self.agents).insert(tab_id, handle);
        self.total_agents_spawned.fetch_add(1, Ordering::Relaxed);

        // a navigation that slipped in before the handle was registered
        if self.bindings.generation(tab_id) != generation {
            self.abort_agent(tab_id);
        }

        info!("Activated {} agent {} on tab {}", role.as_str(), agent_id, tab_id);
        Ok(Some(binding))
    }

    async fn resume_for(&self, tab_id: TabId) -> Result<Option<ResumeInstruction>> {
        let owner = lock(&self.scrape_tabs)
            .iter()
            .find(|(_, tab)| **tab == tab_id)
            .map(|(kind, _)| *kind);
        let candidates = match owner {
            Some(kind) => vec![kind],
            None => vec![ScrapeKind::Search, ScrapeKind::Storefront],
        };

        for kind in candidates {
            if let Some((session_id, cursor)) = self.tracker.resume_point(kind).await? {
                return Ok(Some(ResumeInstruction {
                    kind,
                    session_id,
                    cursor,
                }));
            }
        }
        Ok(None)
    }

    /// Opens a page and watches for its first load. The watcher resolves to the
    /// loaded URL, or `None` if the page closed or didn't load in time.
    pub(super) async fn open_watched(&self, url: &str, active: bool) -> Result<(TabId, JoinHandle<Option<String>>)> {
        // subscribe first, the load can finish before open_page returns
        let mut events = self.host.events();
        let tab_id = self.host.open_page(url, active).await?;
        let limit = self.config.read().await.dispatcher.navigation_timeout;

        let watcher = tokio::spawn(async move {
            let loaded = timeout(limit, async {
                loop {
                    match events.recv().await {
                        Ok(PageEvent::Complete { tab_id: tab, url }) if tab == tab_id => return Some(url),
                        Ok(PageEvent::Closed { tab_id: tab }) if tab == tab_id => return None,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            })
            .await;

            loaded.unwrap_or_else(|_| {
                warn!("Tab {} did not finish loading within {:?}", tab_id, limit);
                None
            })
        });

        Ok((tab_id, watcher))
    }

    pub(super) async fn run_inbox(
        self,
        mut inbox: mpsc::UnboundedReceiver<AgentMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Agent inbox received shutdown signal");
                    break;
                }
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    self.on_agent_message(message).await;
                }
            }
        }
    }

    async fn on_agent_message(&self, message: AgentMessage) {
        match message {
            AgentMessage::ClosePage { tab_id, reason } => {
                info!("Closing tab {}: {}", tab_id, reason);
                self.close_quietly(tab_id).await;
            }
            AgentMessage::StatusUpdate {
                agent_id,
                tab_id,
                role,
                status,
            } => {
                debug!("Agent {} on tab {} is {:?}", agent_id, tab_id, status);
                if role == AgentRole::Lister
                    && status == AgentStatus::Finished
                    && self.store.get_bool(keys::IS_BULK_LISTING).await
                {
                    info!("Bulk listing on tab {} done, closing it", tab_id);
                    self.close_quietly(tab_id).await;
                }
            }
        }
    }

    async fn close_quietly(&self, tab_id: TabId) {
        if let Err(e) = self.host.close_page(tab_id).await {
            debug!("Tab {} could not be closed: {}", tab_id, e);
        }
    }

    /// Closes a scrape's tab once its session completes.
    pub(super) async fn watch_session(
        self,
        kind: ScrapeKind,
        mut changes: Subscription,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    let was_complete = status_of(change.old_value.as_ref()) == Some(SessionStatus::Complete);
                    let is_complete = status_of(change.new_value.as_ref()) == Some(SessionStatus::Complete);
                    if !is_complete || was_complete {
                        continue;
                    }

                    let tab = lock(&self.scrape_tabs).remove(&kind);
                    if let Some(tab_id) = tab {
                        info!("{} scrape complete, closing tab {}", kind.as_str(), tab_id);
                        self.close_quietly(tab_id).await;
                    }
                }
            }
        }
    }

    /// Tallies finished listings while a bulk sweep is running.
    pub(super) async fn watch_listing(self, mut changes: Subscription, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    let before = listing_status_of(change.old_value.as_ref());
                    let after = listing_status_of(change.new_value.as_ref());
                    let Some(after) = after else { continue };
                    if !after.is_terminal() || before.map_or(false, |b| b.is_terminal()) {
                        continue;
                    }
                    if let Err(e) = self.count_listing(after).await {
                        error!("Could not update sweep counters: {}", e);
                    }
                }
            }
        }
    }

    async fn count_listing(&self, status: ListingStatus) -> Result<()> {
        if !self.store.get_bool(keys::IS_BULK_LISTING).await {
            return Ok(());
        }
        let mut counters: RunCounters = self.store.get_json(keys::EOL_RUN_COUNTERS).await?.unwrap_or_default();
        match status {
            ListingStatus::Complete => counters.listed += 1,
            ListingStatus::Error => counters.failed += 1,
            _ => return Ok(()),
        }
        self.store.set_json(keys::EOL_RUN_COUNTERS, &counters).await?;
        debug!("Sweep counters now {} listed, {} failed", counters.listed, counters.failed);
        Ok(())
    }
}

fn status_of(value: Option<&serde_json::Value>) -> Option<SessionStatus> {
    value
        .and_then(|v| serde_json::from_value::<Session>(v.clone()).ok())
        .map(|s| s.status)
}

fn listing_status_of(value: Option<&serde_json::Value>) -> Option<ListingStatus> {
    value
        .and_then(|v| serde_json::from_value::<ListingTask>(v.clone()).ok())
        .map(|t| t.status)
}

/// Upper bound on how long `stop-scrape` waits for a scraper to confirm.
pub(super) async fn wait_for_ack(changes: &mut Subscription, grace: Duration) -> bool {
    let acknowledged = timeout(grace, async {
        while let Some(change) = changes.recv().await {
            let acked = change
                .new_value
                .and_then(|v| serde_json::from_value::<Session>(v).ok())
                .map_or(false, |s| s.stop_acknowledged);
            if acked {
                return true;
            }
        }
        false
    })
    .await;
    acknowledged.unwrap_or(false)
}
