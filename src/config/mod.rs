use chrono::NaiveTime;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub marketplace: MarketplaceConfig,
    pub agents: AgentConfig,
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub backend: BackendConfig,
    pub schedule: ScheduleConfig,
    pub api: ApiConfig,
}

/// URL patterns deciding which agent belongs on a loaded page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketplaceConfig {
    pub scraper_patterns: Vec<String>,
    pub lister_patterns: Vec<String>,
    pub eol_sweep_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub condition_attempts: u32,
    pub continuation_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    pub delay_range: (u64, u64), // milliseconds
    pub wizard: WizardSelectors,
    pub items: ItemSelectors,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WizardSelectors {
    pub category_option: String,
    pub condition_group: String,
    pub condition_new: String,
    pub continue_button: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ItemSelectors {
    pub item: String,
    pub id_attribute: String,
    pub title: String,
    pub price: String,
    pub image: String,
    pub next_page: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub quota: String, // "5MB"
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub time_of_day: String, // "HH:MM"
    pub interval: String,    // "24h"
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub port: u16,
    pub token: Option<String>,
}

impl Default for WizardSelectors {
    fn default() -> Self {
        Self {
            category_option: "[data-relay='category-suggestion']".to_string(),
            condition_group: "[data-relay='condition-group']".to_string(),
            condition_new: "[data-relay='condition-new']".to_string(),
            continue_button: "[data-relay='continue']".to_string(),
        }
    }
}

impl Default for ItemSelectors {
    fn default() -> Self {
        Self {
            item: "[data-relay='item']".to_string(),
            id_attribute: "data-item-id".to_string(),
            title: "[data-relay='title']".to_string(),
            price: "[data-relay='price']".to_string(),
            image: "img".to_string(),
            next_page: "[data-relay='next-page']".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            marketplace: MarketplaceConfig {
                scraper_patterns: vec![r"^https://www\.amazon\.[a-z.]+/(s\?|.*/s\?|stores/)".to_string()],
                lister_patterns: vec![r"^https://www\.ebay\.[a-z.]+/(sl/|lstng)".to_string()],
                eol_sweep_url: "https://www.ebay.com/sh/lst/active".to_string(),
            },
            agents: AgentConfig {
                poll_interval: Duration::from_millis(500),
                condition_attempts: 5,
                continuation_attempts: 10,
                stop_grace: Duration::from_secs(5),
                delay_range: (200, 800),
                wizard: WizardSelectors::default(),
                items: ItemSelectors::default(),
            },
            store: StoreConfig {
                path: PathBuf::from("./relay_state.json"),
                quota: "5MB".to_string(),
            },
            dispatcher: DispatcherConfig {
                navigation_timeout: Duration::from_secs(60),
            },
            backend: BackendConfig {
                base_url: "http://localhost:3000/api".to_string(),
                timeout: Duration::from_secs(10),
            },
            schedule: ScheduleConfig {
                enabled: false,
                time_of_day: "03:00".to_string(),
                interval: "24h".to_string(),
            },
            api: ApiConfig {
                port: 8080,
                token: None,
            },
        }
    }
}

#[async_trait::async_trait]
pub trait ConfigManager {
    async fn load_config(&self) -> Result<Config>;
    async fn save_config(&self, config: &Config) -> Result<()>;
    async fn watch_config_changes(&self) -> Result<tokio::sync::mpsc::Receiver<Config>>;
    fn validate_config(&self, config: &Config) -> Result<()>;
}

pub struct FileConfigManager {
    config_path: PathBuf,
}

impl FileConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }
}

#[async_trait::async_trait]
impl ConfigManager for FileConfigManager {
    async fn load_config(&self) -> Result<Config> {
        info!("Loading configuration from {:?}", self.config_path);

        if !self.config_path.exists() {
            warn!("Configuration file not found, creating default config at {:?}", self.config_path);
            self.create_default_config().await?;
        }

        let config_content = fs::read_to_string(&self.config_path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_content)
            .map_err(|e| RelayError::Config(format!("Failed to parse TOML config: {}", e)))?;

        self.validate_config(&config)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    async fn watch_config_changes(&self) -> Result<tokio::sync::mpsc::Receiver<Config>> {
        let (tx, rx) = mpsc::channel(10);
        let config_path = self.config_path.clone();
        let config_manager = FileConfigManager::new(config_path.clone());

        tokio::spawn(async move {
            if let Err(e) = Self::watch_config_file(config_path, tx, config_manager).await {
                error!("Configuration file watcher error: {}", e);
            }
        });

        Ok(rx)
    }

    fn validate_config(&self, config: &Config) -> Result<()> {
        debug!("Validating configuration");

        let market = &config.marketplace;
        if market.scraper_patterns.is_empty() || market.lister_patterns.is_empty() {
            return Err(RelayError::Config("scraper_patterns and lister_patterns cannot be empty".to_string()).into());
        }
        for pattern in market.scraper_patterns.iter().chain(market.lister_patterns.iter()) {
            Regex::new(pattern)
                .map_err(|e| RelayError::Config(format!("Invalid role pattern '{}': {}", pattern, e)))?;
        }
        if !is_http_url(&market.eol_sweep_url) {
            return Err(RelayError::Config("eol_sweep_url must start with http:// or https://".to_string()).into());
        }

        let agents = &config.agents;
        if agents.poll_interval.is_zero() {
            return Err(RelayError::Config("poll_interval must be greater than 0".to_string()).into());
        }
        if agents.condition_attempts == 0 || agents.continuation_attempts == 0 {
            return Err(RelayError::Config("condition_attempts and continuation_attempts must be greater than 0".to_string()).into());
        }
        if agents.delay_range.0 > agents.delay_range.1 {
            return Err(RelayError::Config("delay_range minimum must not exceed maximum".to_string()).into());
        }
        if agents.delay_range.1 > 60000 {
            return Err(RelayError::Config("delay_range maximum cannot exceed 60 seconds".to_string()).into());
        }

        if !Self::is_valid_size_format(&config.store.quota) {
            return Err(RelayError::Config(format!("Invalid store quota '{}', expected format like '5MB'", config.store.quota)).into());
        }

        if config.dispatcher.navigation_timeout.is_zero() {
            return Err(RelayError::Config("navigation_timeout must be greater than 0".to_string()).into());
        }

        if !is_http_url(&config.backend.base_url) {
            return Err(RelayError::Config("backend base_url must start with http:// or https://".to_string()).into());
        }

        if Self::parse_time_of_day(&config.schedule.time_of_day).is_err() {
            return Err(RelayError::Config(format!("Invalid time_of_day '{}', expected 'HH:MM'", config.schedule.time_of_day)).into());
        }
        if !Self::is_valid_time_format(&config.schedule.interval) {
            return Err(RelayError::Config(format!("Invalid schedule interval '{}', expected format like '1h', '30m', '1d'", config.schedule.interval)).into());
        }

        if config.api.port < 1024 {
            return Err(RelayError::Config("api port must be between 1024 and 65535".to_string()).into());
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    async fn save_config(&self, config: &Config) -> Result<()> {
        info!("Saving configuration to {:?}", self.config_path);

        let toml_content = toml::to_string_pretty(config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&self.config_path, toml_content)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully");
        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl FileConfigManager {
    async fn create_default_config(&self) -> Result<()> {
        let default_config = Config::default();
        let toml_content = toml::to_string_pretty(&default_config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize default config: {}", e)))?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        fs::write(&self.config_path, toml_content)
            .map_err(|e| RelayError::Config(format!("Failed to write default config: {}", e)))?;

        info!("Default configuration file created at {:?}", self.config_path);
        Ok(())
    }

    /// Watch configuration file for changes and send updates through the channel
    async fn watch_config_file(
        config_path: PathBuf,
        tx: mpsc::Sender<Config>,
        config_manager: FileConfigManager,
    ) -> Result<()> {
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if let Err(e) = file_tx.blocking_send(event) {
                        error!("Failed to send file system event: {}", e);
                    }
                }
                Err(e) => error!("File system watcher error: {}", e),
            }
        })
        .map_err(|e| RelayError::Config(format!("Failed to create file watcher: {}", e)))?;

        let watch_path = config_path.parent().unwrap_or(&config_path);
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| RelayError::Config(format!("Failed to watch config directory: {}", e)))?;

        info!("Started watching configuration file: {:?}", config_path);

        while let Some(event) = file_rx.recv().await {
            match event.kind {
                EventKind::Modify(_) | EventKind::Create(_) => {
                    if event.paths.iter().any(|p| p == &config_path) {
                        debug!("Configuration file changed, reloading...");

                        // let the writer finish
                        tokio::time::sleep(Duration::from_millis(100)).await;

                        match config_manager.load_config().await {
                            Ok(new_config) => {
                                info!("Configuration reloaded successfully");
                                if let Err(e) = tx.send(new_config).await {
                                    error!("Failed to send updated config: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("Failed to reload configuration: {}", e);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn is_valid_size_format(size_str: &str) -> bool {
        Self::parse_size_to_bytes(size_str).is_ok()
    }

    fn is_valid_time_format(time_str: &str) -> bool {
        Self::parse_time_to_duration(time_str).is_ok()
    }

    /// Parse size string to bytes
    pub fn parse_size_to_bytes(size_str: &str) -> Result<u64> {
        let size_str = size_str.to_uppercase();
        // longer suffixes first
        let multipliers = [
            ("TB", 1024_u64.pow(4)),
            ("GB", 1024 * 1024 * 1024),
            ("MB", 1024 * 1024),
            ("KB", 1024),
            ("B", 1),
        ];

        for (suffix, multiplier) in &multipliers {
            if size_str.ends_with(suffix) {
                let number_part = &size_str[..size_str.len() - suffix.len()];
                let number: u64 = number_part
                    .parse()
                    .map_err(|_| RelayError::Config(format!("Invalid number in size format: {}", size_str)))?;
                return number
                    .checked_mul(*multiplier)
                    .ok_or_else(|| RelayError::Config(format!("Size too large: {}", size_str)).into());
            }
        }

        Err(RelayError::Config(format!("Invalid size format: {}", size_str)).into())
    }

    /// Parse time string to duration
    pub fn parse_time_to_duration(time_str: &str) -> Result<Duration> {
        let time_str = time_str.to_lowercase();
        let multipliers: [(&str, u64); 4] = [("s", 1), ("m", 60), ("h", 3600), ("d", 86400)];

        for (suffix, multiplier) in &multipliers {
            if time_str.ends_with(suffix) {
                let number_part = &time_str[..time_str.len() - suffix.len()];
                let number: u64 = number_part
                    .parse()
                    .map_err(|_| RelayError::Config(format!("Invalid time format: {}", time_str)))?;
                if number == 0 {
                    return Err(RelayError::Config(format!("Time must be positive: {}", time_str)).into());
                }
                return number
                    .checked_mul(*multiplier)
                    .map(Duration::from_secs)
                    .ok_or_else(|| RelayError::Config(format!("Time too large: {}", time_str)).into());
            }
        }

        Err(RelayError::Config(format!("Invalid time format: {}", time_str)).into())
    }

    /// Parse "HH:MM" into a time of day
    pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(value, "%H:%M")
            .map_err(|e| RelayError::Config(format!("Invalid time of day '{}': {}", value, e)).into())
    }
}
