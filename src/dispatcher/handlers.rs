use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::lifecycle::wait_for_ack;
use super::request::{BackendCall, BulkOptions, ClosePage, OpenPage, StartListing, StartScrape};
use super::{lock, Dispatcher, Request, RunCounters};
use crate::agents::{AgentRole, ListingTask, RunSignal};
use crate::browser::TabId;
use crate::error::{RelayError, Result};
use crate::session::{ScrapeKind, SessionId, SessionStatus};
use crate::store::keys;

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value).map_err(RelayError::from)?)
}

fn no_session(kind: ScrapeKind) -> Box<dyn std::error::Error + Send + Sync> {
    RelayError::Request {
        message: format!("No {} scrape session", kind.as_str()),
        needs_subscription: false,
    }
    .into()
}

impl Dispatcher {
    pub(super) async fn handle(&self, request: Request) -> Result<Value> {
        match request {
            Request::Backend(call, payload) => self.forward(call, payload).await,
            Request::OpenPage(open) => self.open_page(open).await,
            Request::ClosePage(ClosePage { tab_id }) => {
                self.host.close_page(tab_id).await?;
                Ok(json!({ "tabId": tab_id }))
            }
            Request::StartScrape(start) => self.start_scrape(start).await,
            Request::StopScrape(req) => self.stop_scrape(req.kind).await,
            Request::ResumeScrape(req) => self.resume_scrape(req.kind).await,
            Request::GetScrapeProgress(req) => {
                let progress = self.tracker.progress(req.kind).await?;
                Ok(json!({ "progress": progress }))
            }
            Request::ClearScrape(req) => {
                self.tracker.clear(req.kind).await?;
                info!("Cleared {} scrape session", req.kind.as_str());
                Ok(Value::Null)
            }
            Request::StartListing(start) => self.start_listing(start).await,
            Request::SetListingStatus(req) => {
                self.store.set_json(keys::LISTING_STATUS, &req.status).await?;
                info!("Listing run signal set to {:?}", req.status);
                Ok(Value::Null)
            }
            Request::GetListingTask => {
                let task: Option<ListingTask> = self.store.get_json(keys::LISTING_TASK).await?;
                Ok(json!({ "task": task }))
            }
            Request::SetBulkOptions(BulkOptions {
                is_bulk_listing,
                close_on_error,
            }) => {
                self.store.set_json(keys::IS_BULK_LISTING, &is_bulk_listing).await?;
                self.store.set_json(keys::CLOSE_ON_ERROR, &close_on_error).await?;
                Ok(Value::Null)
            }
            Request::StartEolSweep => {
                let tab_id = self.start_eol_sweep().await?;
                Ok(json!({ "tabId": tab_id }))
            }
        }
    }

    async fn forward(&self, call: BackendCall, payload: Value) -> Result<Value> {
        debug!("Forwarding {:?} to backend", call);
        let backend = &self.backend;
        match call {
            BackendCall::SignIn => backend.sign_in(payload).await,
            BackendCall::AddUser => backend.add_user(payload).await,
            BackendCall::GetUserStatus => backend.get_user_status(payload).await,
            BackendCall::GetAllUsers => backend.get_all_users(payload).await,
            BackendCall::UpdateUserStatus => backend.update_user_status(payload).await,
            BackendCall::AddListing => backend.add_listing(payload).await,
            BackendCall::GetListing => backend.get_listing(payload).await,
            BackendCall::GetAllListing => backend.get_all_listing(payload).await,
            BackendCall::DeleteListing => backend.delete_listing(payload).await,
            BackendCall::DeleteListingWithId => backend.delete_listing_with_id(payload).await,
        }
    }

    async fn open_page(&self, open: OpenPage) -> Result<Value> {
        if !open.wait_for_load {
            let tab_id = self.host.open_page(&open.url, open.active).await?;
            return Ok(json!({ "tabId": tab_id }));
        }

        let (tab_id, watcher) = self.open_watched(&open.url, open.active).await?;
        let loaded = watcher
            .await
            .map_err(|e| RelayError::Browser(format!("Load watcher for tab {} failed: {}", tab_id, e)))?;
        Ok(json!({ "tabId": tab_id, "loaded": loaded.is_some(), "url": loaded }))
    }

    async fn start_scrape(&self, start: StartScrape) -> Result<Value> {
        let session = self
            .tracker
            .start(start.kind, start.target, start.url.clone(), start.user)
            .await?;
        let tab_id = self.open_scrape_tab(start.kind, session.session_id, &start.url).await?;
        Ok(json!({ "sessionId": session.session_id, "tabId": tab_id }))
    }

    /// Opens the tab a scrape runs in. A session whose page never loads is failed.
    async fn open_scrape_tab(&self, kind: ScrapeKind, session_id: SessionId, url: &str) -> Result<TabId> {
        let (tab_id, watcher) = self.open_watched(url, false).await?;
        if let Some(previous) = lock(&self.scrape_tabs).insert(kind, tab_id) {
            debug!("{} scrape moved from tab {} to tab {}", kind.as_str(), previous, tab_id);
        }

        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            if let Ok(None) = watcher.await {
                if let Err(e) = tracker.fail(kind, session_id, "Scrape page did not finish loading").await {
                    warn!("Could not mark session {} failed: {}", session_id, e);
                }
            }
        });

        info!("{} scrape {} running in tab {}", kind.as_str(), session_id, tab_id);
        Ok(tab_id)
    }

    async fn stop_scrape(&self, kind: ScrapeKind) -> Result<Value> {
        // subscribe before pausing so the acknowledgement can't be missed
        let mut changes = self.store.subscribe(&keys::session(kind.as_str()));
        let session = self.tracker.pause(kind).await?.ok_or_else(|| no_session(kind))?;

        if session.status != SessionStatus::Paused {
            return Ok(json!({ "status": session.status, "acknowledged": false }));
        }

        let scrape_tab = lock(&self.scrape_tabs).get(&kind).copied();
        let scraper_active = scrape_tab
            .and_then(|tab_id| self.bindings.get(tab_id))
            .map_or(false, |b| b.role == AgentRole::Scraper);
        let acknowledged = if session.stop_acknowledged {
            true
        } else if scraper_active {
            let grace = self.config.read().await.agents.stop_grace;
            wait_for_ack(&mut changes, grace).await
        } else {
            self.tracker.acknowledge_stop(kind, session.session_id).await?;
            true
        };

        if !acknowledged {
            warn!("Scraper did not confirm the {} stop in time", kind.as_str());
        }
        info!("{} scrape paused with {} items", kind.as_str(), session.items_collected.len());
        Ok(json!({ "status": session.status, "acknowledged": acknowledged }))
    }

    async fn resume_scrape(&self, kind: ScrapeKind) -> Result<Value> {
        let session = self.tracker.unpause(kind).await?.ok_or_else(|| no_session(kind))?;
        if session.status != SessionStatus::Running {
            return Ok(json!({ "status": session.status }));
        }

        let existing = lock(&self.scrape_tabs).get(&kind).copied();
        if let Some(tab_id) = existing {
            if let Some(page) = self.host.page(tab_id).await {
                let url = page.url().await?;
                if self.roles.read().await.classify(&url) == AgentRole::Scraper {
                    // the document is still loaded, the marker from the stopped agent doesn't count
                    let generation = self.bindings.generation(tab_id);
                    self.activate(tab_id, AgentRole::Scraper, generation, false).await?;
                    info!("Resumed {} scrape on tab {}", kind.as_str(), tab_id);
                    return Ok(json!({ "status": session.status, "tabId": tab_id }));
                }
            }
        }

        let url = if session.cursor.is_initial() {
            session.start_url.clone()
        } else {
            session.cursor.as_str().to_string()
        };
        let tab_id = self.open_scrape_tab(kind, session.session_id, &url).await?;
        Ok(json!({ "status": session.status, "tabId": tab_id }))
    }

    async fn start_listing(&self, start: StartListing) -> Result<Value> {
        let mut task = ListingTask::new(start.source_id, start.sku);
        task.draft_id = start.draft_id;

        self.store.set_json(keys::LISTING_TASK, &task).await?;
        self.store.set_json(keys::LISTING_STATUS, &RunSignal::Running).await?;

        let tab_id = self.host.open_page(&start.url, true).await?;
        info!("Listing {} ({}) opened in tab {}", task.source_id, task.sku, tab_id);
        Ok(json!({ "tabId": tab_id, "task": to_value(&task)? }))
    }

    /// Starts a bulk sweep over ended listings: fresh counters, bulk mode on,
    /// sweep page opened in the background.
    pub async fn start_eol_sweep(&self) -> Result<TabId> {
        let counters = RunCounters {
            listed: 0,
            failed: 0,
            started_at: Some(chrono::Utc::now()),
        };
        self.store.set_json(keys::EOL_RUN_COUNTERS, &counters).await?;
        self.store.set_json(keys::IS_BULK_LISTING, &true).await?;
        self.store.set_json(keys::LISTING_STATUS, &RunSignal::Running).await?;

        let url = self.config.read().await.marketplace.eol_sweep_url.clone();
        let tab_id = self.host.open_page(&url, false).await?;
        info!("Ended-listing sweep started in tab {}", tab_id);
        Ok(tab_id)
    }
}
