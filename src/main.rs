use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use listing_relay::backend::HttpBackend;
use listing_relay::config::{ConfigManager, FileConfigManager};
use listing_relay::store::FileBackend;
use listing_relay::{api, BrowserManager, Dispatcher, EolSweepScheduler, Store};

fn boxed(e: Box<dyn std::error::Error + Send + Sync>) -> anyhow::Error {
    anyhow::anyhow!(e)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("listing_relay=info")))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));
    let config_manager = FileConfigManager::new(config_path);
    let config = config_manager
        .load_config()
        .await
        .map_err(boxed)
        .context("Failed to load configuration")?;

    info!("Starting listing relay");

    let quota = FileConfigManager::parse_size_to_bytes(&config.store.quota).map_err(boxed)?;
    let store = Store::open(Arc::new(FileBackend::new(config.store.path.clone())), quota)
        .await
        .map_err(boxed)
        .with_context(|| format!("Failed to open state store at {}", config.store.path.display()))?;

    let headless = std::env::var("RELAY_HEADLESS").map(|v| v != "0").unwrap_or(false);
    let browser = Arc::new(
        BrowserManager::launch(headless)
            .await
            .map_err(boxed)
            .context("Failed to launch browser")?,
    );

    let backend = Arc::new(HttpBackend::new(&config.backend, store.clone()).map_err(boxed)?);
    let dispatcher = Dispatcher::new(config.clone(), browser.clone(), store, backend).map_err(boxed)?;
    dispatcher.start().map_err(boxed)?;

    match config_manager.watch_config_changes().await {
        Ok(updates) => dispatcher.start_config_watcher(updates),
        Err(e) => error!("Config hot reload disabled: {}", e),
    }

    let mut scheduler = if config.schedule.enabled {
        let mut scheduler = EolSweepScheduler::new(dispatcher.clone(), &config.schedule).map_err(boxed)?;
        scheduler.start().map_err(boxed)?;
        Some(scheduler)
    } else {
        None
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_dispatcher = dispatcher.clone();
    let api_config = config.api.clone();
    let api_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = api_shutdown.recv().await;
        };
        if let Err(e) = api::start_api_server(api_dispatcher, &api_config, shutdown).await {
            error!("API server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");

    let _ = shutdown_tx.send(());
    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop().await;
    }
    dispatcher.stop().await.map_err(boxed)?;
    if let Err(e) = dispatcher.store().flush().await {
        error!("Failed to flush state store: {}", e);
    }
    if let Err(e) = browser.shutdown().await {
        error!("Browser did not shut down cleanly: {}", e);
    }
    let _ = api_task.await;

    info!("Listing relay stopped.");
    Ok(())
}
