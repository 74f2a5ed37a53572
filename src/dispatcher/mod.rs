pub mod bindings;
pub mod request;
pub mod roles;

mod handlers;
mod lifecycle;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agents::AgentMessage;
use crate::backend::BackendApi;
use crate::browser::{PageHost, TabId};
use crate::config::Config;
use crate::error::Result;
use crate::session::{ScrapeKind, SessionTracker};
use crate::store::Store;

pub use bindings::{BindingRegistry, Generation, PageBinding};
pub use request::{BackendCall, Envelope, Request, Response};
pub use roles::RoleClassifier;

/// Per-run tallies of a bulk listing sweep, kept under `eol-run-counters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub listed: u32,
    pub failed: u32,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStatus {
    pub bindings: Vec<PageBinding>,
    pub total_agents_spawned: u64,
    pub scrape_tabs: HashMap<String, TabId>,
}

/// The coordinator: routes requests, owns page lifecycle and decides which
/// agent runs on which page.
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn PageHost>,
    store: Store,
    tracker: SessionTracker,
    backend: Arc<dyn BackendApi>,

    config: Arc<RwLock<Config>>,
    roles: Arc<RwLock<RoleClassifier>>,

    bindings: Arc<BindingRegistry>,
    agents: Arc<Mutex<HashMap<TabId, JoinHandle<()>>>>,
    scrape_tabs: Arc<Mutex<HashMap<ScrapeKind, TabId>>>,
    total_agents_spawned: Arc<AtomicU64>,

    outbox: mpsc::UnboundedSender<AgentMessage>,
    inbox: Arc<Mutex<Option<mpsc::UnboundedReceiver<AgentMessage>>>>,
    shutdown: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    pub fn new(config: Config, host: Arc<dyn PageHost>, store: Store, backend: Arc<dyn BackendApi>) -> Result<Self> {
        let roles = RoleClassifier::new(&config.marketplace)?;
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            host,
            tracker: SessionTracker::new(store.clone()),
            store,
            backend,
            config: Arc::new(RwLock::new(config)),
            roles: Arc::new(RwLock::new(roles)),
            bindings: Arc::new(BindingRegistry::new()),
            agents: Arc::new(Mutex::new(HashMap::new())),
            scrape_tabs: Arc::new(Mutex::new(HashMap::new())),
            total_agents_spawned: Arc::new(AtomicU64::new(0)),
            outbox,
            inbox: Arc::new(Mutex::new(Some(inbox))),
            shutdown,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Starts the page-event loop, the agent inbox and the store observers.
    /// Everything is subscribed before this returns.
    pub fn start(&self) -> Result<()> {
        info!("Starting dispatcher");

        let mut tasks = Vec::new();

        let events = self.host.events();
        tasks.push(tokio::spawn(self.clone().run_page_events(events, self.shutdown.subscribe())));

        if let Some(inbox) = lock(&self.inbox).take() {
            tasks.push(tokio::spawn(self.clone().run_inbox(inbox, self.shutdown.subscribe())));
        } else {
            warn!("Dispatcher inbox already taken, agent messages are handled elsewhere");
        }

        for kind in [ScrapeKind::Search, ScrapeKind::Storefront] {
            let changes = self.store.subscribe(&crate::store::keys::session(kind.as_str()));
            tasks.push(tokio::spawn(self.clone().watch_session(kind, changes, self.shutdown.subscribe())));
        }

        let listing = self.store.subscribe(crate::store::keys::LISTING_TASK);
        tasks.push(tokio::spawn(self.clone().watch_listing(listing, self.shutdown.subscribe())));

        lock(&self.tasks).extend(tasks);
        info!("Dispatcher started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping dispatcher");
        let _ = self.shutdown.send(());

        let agents: Vec<(TabId, JoinHandle<()>)> = lock(&self.agents).drain().collect();
        for (tab_id, handle) in agents {
            debug!("Aborting agent on tab {}", tab_id);
            handle.abort();
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Request/response. `None` when no handler exists for the callback.
    pub async fn call(&self, envelope: Envelope) -> Option<Response> {
        let callback = envelope.callback.clone();
        let request = match Request::parse(envelope) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("No handler for callback {}, ignoring", callback);
                return None;
            }
            Err(e) => {
                warn!("Rejected {} request: {}", callback, e);
                return Some(Response::from_error(e.as_ref()));
            }
        };

        // run on its own task so even a panicking handler gets an answer
        let dispatcher = self.clone();
        let outcome = tokio::spawn(async move { dispatcher.handle(request).await }).await;

        Some(match outcome {
            Ok(Ok(result)) => Response::ok(result),
            Ok(Err(e)) => {
                warn!("Handler for {} failed: {}", callback, e);
                Response::from_error(e.as_ref())
            }
            Err(e) => {
                error!("Handler for {} crashed: {}", callback, e);
                Response::error(format!("Handler for {} crashed", callback))
            }
        })
    }

    /// Fire-and-forget. Returns whether the request was accepted; the caller
    /// never waits for the handler.
    pub fn notify(&self, envelope: Envelope) -> bool {
        let callback = envelope.callback.clone();
        match Request::parse(envelope) {
            Ok(Some(request)) => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.handle(request).await {
                        warn!("Notification {} failed: {}", callback, e);
                    }
                });
                true
            }
            Ok(None) => {
                debug!("No handler for notification {}, ignoring", callback);
                false
            }
            Err(e) => {
                warn!("Rejected {} notification: {}", callback, e);
                false
            }
        }
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            bindings: self.bindings.all(),
            total_agents_spawned: self.total_agents_spawned.load(Ordering::Relaxed),
            scrape_tabs: lock(&self.scrape_tabs)
                .iter()
                .map(|(kind, tab)| (kind.as_str().to_string(), *tab))
                .collect(),
        }
    }

    /// Swaps in a reloaded config. A config whose role patterns don't compile is rejected whole.
    pub async fn apply_config(&self, config: Config) -> Result<()> {
        let roles = RoleClassifier::new(&config.marketplace)?;
        *self.roles.write().await = roles;
        *self.config.write().await = config;
        info!("Dispatcher picked up new configuration");
        Ok(())
    }

    pub fn start_config_watcher(&self, mut updates: mpsc::Receiver<Config>) {
        let dispatcher = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Config watcher received shutdown signal");
                        break;
                    }
                    update = updates.recv() => {
                        let Some(config) = update else { break };
                        if let Err(e) = dispatcher.apply_config(config).await {
                            error!("Ignoring reloaded configuration: {}", e);
                        }
                    }
                }
            }
        });
        lock(&self.tasks).push(task);
    }
}
