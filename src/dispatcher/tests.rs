use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::agents::{AgentRole, ListingStatus, ListingTask, RunSignal};
use crate::backend::MockBackendApi;
use crate::browser::fake::FakeHost;
use crate::browser::{PageDriver, TabId};
use crate::config::{Config, WizardSelectors};
use crate::dispatcher::{Dispatcher, Envelope, RunCounters};
use crate::error::{RelayError, Result};
use crate::session::{ScrapeKind, ScrapeTarget, SessionStatus};
use crate::store::{keys, MemoryBackend, Store, StoreBackend, StoreEntry};

const P1: &str = "https://www.amazon.com/s?k=lamp";
const P2: &str = "https://www.amazon.com/s?k=lamp&page=2";
const P3: &str = "https://www.amazon.com/s?k=lamp&page=3";
const PRELIST: &str = "https://www.ebay.com/sl/prelist/suggest";
const LISTED_ITEM: &str = "https://www.ebay.com/itm/1234567890";

fn test_config() -> Config {
    let mut config = Config::default();
    config.agents.delay_range = (0, 0);
    config.agents.poll_interval = Duration::from_millis(100);
    config
}

fn results_page(ids: std::ops::Range<usize>, next: Option<&str>) -> String {
    let mut html = String::new();
    for i in ids {
        html.push_str(&format!(
            r#"<div data-relay="item" data-item-id="B{i:04}"><span data-relay="title">Lamp {i}</span></div>"#
        ));
    }
    if let Some(href) = next {
        html.push_str(&format!(r#"<a data-relay="next-page" href="{href}">Next</a>"#));
    }
    html
}

async fn started(host: &Arc<FakeHost>, config: Config, backend: MockBackendApi) -> Dispatcher {
    let dispatcher = Dispatcher::new(config, host.clone(), Store::in_memory().await, Arc::new(backend)).unwrap();
    dispatcher.start().unwrap();
    dispatcher
}

/// Memory backend with disk-like write latency.
struct SlowBackend(MemoryBackend);

#[async_trait]
impl StoreBackend for SlowBackend {
    async fn load(&self) -> Result<HashMap<String, StoreEntry>> {
        self.0.load().await
    }

    async fn persist(&self, snapshot: &HashMap<String, StoreEntry>) -> Result<()> {
        sleep(Duration::from_millis(5)).await;
        self.0.persist(snapshot).await
    }
}

async fn started_slow(host: &Arc<FakeHost>, config: Config) -> Dispatcher {
    let store = Store::open(Arc::new(SlowBackend(MemoryBackend::new())), u64::MAX).await.unwrap();
    let dispatcher = Dispatcher::new(config, host.clone(), store, Arc::new(MockBackendApi::new())).unwrap();
    dispatcher.start().unwrap();
    dispatcher
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(120), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn tab_of(response: &crate::dispatcher::Response) -> TabId {
    response.fields["tabId"].as_u64().unwrap() as TabId
}

#[tokio::test(start_paused = true)]
async fn test_scrape_runs_across_page_loads_to_target() {
    let host = Arc::new(FakeHost::new());
    host.add_site_page(P1, &results_page(0..20, Some("/s?k=lamp&page=2")));
    host.add_site_page(P2, &results_page(20..40, Some("/s?k=lamp&page=3")));
    host.add_site_page(P3, &results_page(40..50, None));
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    let response = dispatcher
        .call(Envelope::new(
            "start-scrape",
            json!({ "kind": "search", "url": P1, "target": { "maxItems": 50 } }),
        ))
        .await
        .unwrap();
    assert!(response.success);
    let tab_id = tab_of(&response);

    let tracker = dispatcher.tracker().clone();
    wait_until(|| {
        let tracker = tracker.clone();
        async move {
            tracker
                .get(ScrapeKind::Search)
                .await
                .unwrap()
                .map_or(false, |s| s.status == SessionStatus::Complete)
        }
    })
    .await;

    let session = tracker.get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.items_collected.len(), 50);
    assert_eq!(session.items_collected[49].source_id, "B0049");

    let progress = tracker.progress(ScrapeKind::Search).await.unwrap().unwrap();
    assert!(progress.is_complete);
    assert_eq!(progress.percent, 100);

    let closed = host.clone();
    wait_until(|| {
        let closed = closed.clone();
        async move { closed.closed().contains(&tab_id) }
    })
    .await;
    assert_eq!(dispatcher.status().total_agents_spawned, 3);
}

#[tokio::test(start_paused = true)]
async fn test_completed_scrape_is_fully_recorded_before_tab_closes() {
    let host = Arc::new(FakeHost::new());
    host.add_site_page(P1, &results_page(0..3, None));
    let dispatcher = started_slow(&host, test_config()).await;

    let response = dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "search", "url": P1, "user": "u1" })))
        .await
        .unwrap();
    let tab_id = tab_of(&response);

    let closed = host.clone();
    wait_until(|| {
        let closed = closed.clone();
        async move { closed.closed().contains(&tab_id) }
    })
    .await;

    let tracker = dispatcher.tracker();
    let session = tracker.get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    let progress = tracker.progress(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(progress.status, SessionStatus::Complete);
    assert!(progress.is_complete);
    assert_eq!(progress.products.len(), 3);
    let snapshot = dispatcher.store().get(&keys::scraped_products("u1")).await.unwrap();
    assert_eq!(snapshot.as_array().map(Vec::len), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_mid_delay_and_resume_continues() {
    let host = Arc::new(FakeHost::manual_load());
    host.add_site_page(P1, &results_page(0..2, Some("/s?k=lamp&page=2")));
    host.add_site_page(P2, &results_page(2..3, None));
    let mut config = test_config();
    config.agents.delay_range = (1000, 1000);
    let dispatcher = started(&host, config, MockBackendApi::new()).await;

    let response = dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "search", "url": P1 })))
        .await
        .unwrap();
    let tab_id = tab_of(&response);
    host.fire_complete(tab_id);

    // the agent has recorded page one and is waiting before it moves on
    sleep(Duration::from_millis(100)).await;
    let page = host.fake_page(tab_id).unwrap();
    let session = dispatcher.tracker().get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.items_collected.len(), 2);

    let stopped = dispatcher
        .call(Envelope::new("stop-scrape", json!({ "kind": "search" })))
        .await
        .unwrap();
    assert!(stopped.success);
    assert_eq!(stopped.fields["status"], json!("paused"));
    assert_eq!(stopped.fields["acknowledged"], json!(true));
    assert!(page.navigations().is_empty());

    // a reload while paused must not restart scraping
    page.navigate(P1).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let session = dispatcher.tracker().get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    assert_eq!(session.items_collected.len(), 2);
    assert_eq!(dispatcher.status().total_agents_spawned, 1);

    let resumed = dispatcher
        .call(Envelope::new("resume-scrape", json!({ "kind": "search" })))
        .await
        .unwrap();
    assert_eq!(resumed.fields["status"], json!("running"));
    assert_eq!(tab_of(&resumed), tab_id);

    let tracker = dispatcher.tracker().clone();
    wait_until(|| {
        let tracker = tracker.clone();
        async move {
            tracker
                .get(ScrapeKind::Search)
                .await
                .unwrap()
                .map_or(false, |s| s.status == SessionStatus::Complete)
        }
    })
    .await;
    let session = tracker.get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.items_collected.len(), 3);
    assert!(page.navigations().contains(&P2.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_active_agent_is_acknowledged_at_once() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;
    dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "storefront", "url": P1 })))
        .await
        .unwrap();

    let stopped = dispatcher
        .call(Envelope::new("stop-scrape", json!({ "kind": "storefront" })))
        .await
        .unwrap();
    assert_eq!(stopped.fields["acknowledged"], json!(true));
    let session = dispatcher.tracker().get(ScrapeKind::Storefront).await.unwrap().unwrap();
    assert!(session.stop_acknowledged);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_loads_bind_one_agent_per_tab() {
    let host = Arc::new(FakeHost::manual_load());
    host.add_site_page(P1, &results_page(0..3, None));
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;
    dispatcher
        .tracker()
        .start(ScrapeKind::Search, ScrapeTarget::unbounded(), P1.to_string(), None)
        .await
        .unwrap();

    let first = host.insert_page(P1);
    let second = host.insert_page(P1);
    for _ in 0..2 {
        host.fire_complete(first.tab_id());
        host.fire_complete(second.tab_id());
    }
    sleep(Duration::from_secs(1)).await;

    assert_eq!(dispatcher.status().total_agents_spawned, 2);
    assert_eq!(first.read_marker().await.unwrap().as_deref(), Some("scraper"));
    assert_eq!(second.read_marker().await.unwrap().as_deref(), Some("scraper"));

    let session = dispatcher.tracker().get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.items_collected.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stale_load_is_not_activated() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;
    let page = host.insert_page(PRELIST);

    let seen = dispatcher.bindings.generation(page.tab_id());
    dispatcher.bindings.navigation_started(page.tab_id());

    let bound = dispatcher.handle_page_loaded(page.tab_id(), PRELIST, seen).await.unwrap();
    assert!(bound.is_none());
    assert_eq!(dispatcher.status().total_agents_spawned, 0);
}

#[tokio::test(start_paused = true)]
async fn test_listing_failure_closes_page_in_bulk_run() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;
    dispatcher
        .call(Envelope::new(
            "set-bulk-options",
            json!({ "isBulkListing": true, "closeOnError": true }),
        ))
        .await
        .unwrap();

    let response = dispatcher
        .call(Envelope::new(
            "start-listing",
            json!({ "sourceId": "B00A", "sku": "SKU-1", "url": PRELIST }),
        ))
        .await
        .unwrap();
    let tab_id = tab_of(&response);

    let w = WizardSelectors::default();
    let page = host.fake_page(tab_id).unwrap();
    page.show(&w.category_option);
    page.show(&w.condition_group);
    page.show(&w.continue_button);
    host.fire_complete(tab_id);

    let closed = host.clone();
    wait_until(|| {
        let closed = closed.clone();
        async move { closed.closed().contains(&tab_id) }
    })
    .await;

    let store = dispatcher.store().clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get_json::<RunCounters>(keys::EOL_RUN_COUNTERS)
                .await
                .unwrap()
                .map_or(false, |c| c.failed == 1)
        }
    })
    .await;
    let task: ListingTask = store.get_json(keys::LISTING_TASK).await.unwrap().unwrap();
    assert_eq!(task.status, ListingStatus::Error);
    assert_eq!(task.error_message.as_deref(), Some("ConditionNotFound"));
    let signal: RunSignal = store.get_json(keys::LISTING_STATUS).await.unwrap().unwrap();
    assert_eq!(signal, RunSignal::Error);

    let counters: RunCounters = store.get_json(keys::EOL_RUN_COUNTERS).await.unwrap().unwrap();
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.listed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_eol_sweep_counts_and_closes_finished_listing() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    let sweep = dispatcher.call(Envelope::new("start-eol-sweep", json!({}))).await.unwrap();
    assert!(sweep.success);
    assert_eq!(host.opened()[0].1, Config::default().marketplace.eol_sweep_url);
    assert!(dispatcher.store().get_bool(keys::IS_BULK_LISTING).await);

    let response = dispatcher
        .call(Envelope::new(
            "start-listing",
            json!({ "sourceId": "B00B", "sku": "SKU-2", "url": PRELIST, "draftId": "D1" }),
        ))
        .await
        .unwrap();
    let tab_id = tab_of(&response);
    let w = WizardSelectors::default();
    let page = host.fake_page(tab_id).unwrap();
    for selector in [&w.category_option, &w.condition_group, &w.condition_new, &w.continue_button] {
        page.show(selector);
    }
    host.fire_complete(tab_id);

    let closed = host.clone();
    wait_until(|| {
        let closed = closed.clone();
        async move { closed.closed().contains(&tab_id) }
    })
    .await;

    let store = dispatcher.store().clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get_json::<RunCounters>(keys::EOL_RUN_COUNTERS)
                .await
                .unwrap()
                .map_or(false, |c| c.listed == 1)
        }
    })
    .await;
    let task: ListingTask = store.get_json(keys::LISTING_TASK).await.unwrap().unwrap();
    assert_eq!(task.status, ListingStatus::Complete);
    assert_eq!(task.draft_id.as_deref(), Some("D1"));
    let counters: RunCounters = store.get_json(keys::EOL_RUN_COUNTERS).await.unwrap().unwrap();
    assert_eq!(counters.failed, 0);
    assert!(counters.started_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_submit_navigation_does_not_lose_listing_outcome() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started_slow(&host, test_config()).await;
    dispatcher.call(Envelope::new("start-eol-sweep", json!({}))).await.unwrap();

    let response = dispatcher
        .call(Envelope::new(
            "start-listing",
            json!({ "sourceId": "B00C", "sku": "SKU-3", "url": PRELIST }),
        ))
        .await
        .unwrap();
    let tab_id = tab_of(&response);
    let w = WizardSelectors::default();
    let page = host.fake_page(tab_id).unwrap();
    for selector in [&w.category_option, &w.condition_group, &w.condition_new, &w.continue_button] {
        page.show(selector);
    }
    page.navigate_on_click(&w.continue_button, LISTED_ITEM);
    host.fire_complete(tab_id);

    let closed = host.clone();
    wait_until(|| {
        let closed = closed.clone();
        async move { closed.closed().contains(&tab_id) }
    })
    .await;

    let store = dispatcher.store().clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get_json::<RunCounters>(keys::EOL_RUN_COUNTERS)
                .await
                .unwrap()
                .map_or(false, |c| c.listed == 1)
        }
    })
    .await;
    let task: ListingTask = store.get_json(keys::LISTING_TASK).await.unwrap().unwrap();
    assert_eq!(task.status, ListingStatus::Complete);
    assert_eq!(page.navigations(), vec![LISTED_ITEM.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_only_for_its_own_scraper() {
    let host = Arc::new(FakeHost::manual_load());
    host.add_site_page(P1, &results_page(0..2, Some("/s?k=lamp&page=2")));
    let mut config = test_config();
    config.agents.delay_range = (60_000, 60_000);
    let dispatcher = started(&host, config, MockBackendApi::new()).await;

    // a search scraper sits in its inter-page delay
    let search = dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "search", "url": P1 })))
        .await
        .unwrap();
    host.fire_complete(tab_of(&search));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.status().bindings.len(), 1);

    dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "storefront", "url": P1 })))
        .await
        .unwrap();
    let started_at = tokio::time::Instant::now();
    let stopped = dispatcher
        .call(Envelope::new("stop-scrape", json!({ "kind": "storefront" })))
        .await
        .unwrap();

    assert_eq!(stopped.fields["acknowledged"], json!(true));
    assert!(started_at.elapsed() < Config::default().agents.stop_grace);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_callback_gets_no_response() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    assert!(dispatcher.call(Envelope::new("refresh-popup", json!({}))).await.is_none());
    assert!(!dispatcher.notify(Envelope::new("refresh-popup", json!({}))));
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_wrapped_into_responses() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    let bad_payload = dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "search" })))
        .await
        .unwrap();
    assert!(!bad_payload.success);
    assert!(bad_payload.error.is_some());

    let missing_tab = dispatcher
        .call(Envelope::new("close-page", json!({ "tabId": 99 })))
        .await
        .unwrap();
    assert!(!missing_tab.success);

    let no_session = dispatcher
        .call(Envelope::new("stop-scrape", json!({ "kind": "search" })))
        .await
        .unwrap();
    assert!(!no_session.success);
    assert_eq!(no_session.error.as_deref(), Some("No search scrape session"));
}

#[tokio::test(start_paused = true)]
async fn test_backend_calls_pass_through() {
    let mut backend = MockBackendApi::new();
    backend
        .expect_get_all_listing()
        .returning(|_| Ok(json!({ "success": true, "listings": [{ "id": "L1" }] })));
    backend.expect_add_listing().returning(|_| {
        Err(RelayError::Request {
            message: "Subscription required".to_string(),
            needs_subscription: true,
        }
        .into())
    });

    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), backend).await;

    let listed = dispatcher
        .call(Envelope::new("get-all-listing", json!({})))
        .await
        .unwrap();
    assert!(listed.success);
    assert_eq!(listed.fields["listings"][0]["id"], json!("L1"));

    let rejected = dispatcher
        .call(Envelope::new("add-listing", json!({ "sku": "SKU-1" })))
        .await
        .unwrap();
    assert!(!rejected.success);
    assert!(rejected.needs_subscription);
    assert_eq!(rejected.error.as_deref(), Some("Subscription required"));
}

#[tokio::test(start_paused = true)]
async fn test_notify_returns_before_handler_runs() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    assert!(dispatcher.notify(Envelope::new("set-listing-status", json!({ "status": "paused" }))));

    let store = dispatcher.store().clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store.get_json::<RunSignal>(keys::LISTING_STATUS).await.unwrap() == Some(RunSignal::Paused)
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_open_page_waits_for_load() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    let response = dispatcher
        .call(Envelope::new(
            "open-page",
            json!({ "url": "https://www.amazon.com/dp/B000", "waitForLoad": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.fields["loaded"], json!(true));
    assert_eq!(response.fields["url"], json!("https://www.amazon.com/dp/B000"));
}

#[tokio::test(start_paused = true)]
async fn test_scrape_fails_when_page_never_loads() {
    let host = Arc::new(FakeHost::manual_load());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    dispatcher
        .call(Envelope::new("start-scrape", json!({ "kind": "search", "url": P1 })))
        .await
        .unwrap();
    sleep(Duration::from_secs(61)).await;

    let session = dispatcher.tracker().get(ScrapeKind::Search).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert!(session.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bad_config_reload_keeps_previous_roles() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;

    let mut broken = test_config();
    broken.marketplace.scraper_patterns = vec!["([".to_string()];
    assert!(dispatcher.apply_config(broken).await.is_err());
    assert_eq!(dispatcher.roles.read().await.classify(P1), AgentRole::Scraper);

    let mut widened = test_config();
    widened.marketplace.lister_patterns.push(r"^https://shop\.example\.com/sell".to_string());
    dispatcher.apply_config(widened).await.unwrap();
    assert_eq!(
        dispatcher.roles.read().await.classify("https://shop.example.com/sell/new"),
        AgentRole::Lister
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_background_tasks() {
    let host = Arc::new(FakeHost::new());
    let dispatcher = started(&host, test_config(), MockBackendApi::new()).await;
    dispatcher.stop().await.unwrap();
    assert_eq!(dispatcher.store().subscriber_count(&keys::session("search")), 0);
}
