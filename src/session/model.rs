use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Which scrape a session belongs to. Starting a new scrape of a kind replaces
/// the previous session of that kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeKind {
    Search,
    Storefront,
}

impl ScrapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeKind::Search => "search",
            ScrapeKind::Storefront => "storefront",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Error,
}

/// Opaque progress token: a next-page URL, a scroll offset, whatever the page
/// agent needs to pick up where the last page load left off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    const INITIAL: &'static str = "initial";

    pub fn initial() -> Self {
        Cursor(Self::INITIAL.to_string())
    }

    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn is_initial(&self) -> bool {
        self.0 == Self::INITIAL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeTarget {
    pub max_items: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub max_duration: Option<Duration>,
}

impl ScrapeTarget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_items(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            max_duration: None,
        }
    }
}

/// One scraped product. Never mutated after it has been appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub source_id: String,
    pub title: String,
    pub price: Option<String>,
    pub media: Vec<String>,
    pub source_session_id: SessionId,
}

impl Item {
    /// Stable id for listings the page does not label with a marketplace id.
    pub fn content_id(title: &str, price: Option<&str>, media: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(price.unwrap_or_default().as_bytes());
        for m in media {
            hasher.update(m.as_bytes());
        }
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// A resumable multi-page scrape. Lives only in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub kind: ScrapeKind,
    pub status: SessionStatus,
    pub cursor: Cursor,
    pub items_collected: Vec<Item>,
    pub target: ScrapeTarget,
    pub start_url: String,
    pub user: Option<String>,
    pub error: Option<String>,
    /// md5 of the last page processed for `cursor`, so a reload of the same page is skipped.
    pub page_digest: Option<String>,
    pub stop_acknowledged: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Session {
    pub fn new(kind: ScrapeKind, target: ScrapeTarget, start_url: String, user: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            kind,
            status: SessionStatus::Running,
            cursor: Cursor::initial(),
            items_collected: Vec::new(),
            target,
            start_url,
            user,
            error: None,
            page_digest: None,
            stop_acknowledged: false,
            started_at: now,
            last_updated: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Complete
    }

    pub fn target_reached(&self, now: DateTime<Utc>) -> bool {
        if let Some(max) = self.target.max_items {
            if self.items_collected.len() >= max {
                return true;
            }
        }
        if let Some(max) = self.target.max_duration {
            let elapsed = now.signed_duration_since(self.started_at);
            if elapsed.to_std().map_or(false, |e| e >= max) {
                return true;
            }
        }
        false
    }

    pub fn progress(&self) -> ScrapeProgress {
        let current = self.items_collected.len();
        let total = self.target.max_items;
        let percent = match (self.is_complete(), total) {
            (true, _) => 100,
            (false, Some(total)) if total > 0 => ((current * 100) / total).min(100) as u8,
            _ => 0,
        };

        ScrapeProgress {
            session_id: self.session_id,
            status: self.status,
            percent,
            current,
            total,
            is_complete: self.is_complete(),
            products: if self.is_complete() {
                self.items_collected.clone()
            } else {
                Vec::new()
            },
        }
    }
}

/// What a polling UI reads to render progress without the agent being alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeProgress {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub percent: u8,
    pub current: usize,
    pub total: Option<usize>,
    pub is_complete: bool,
    pub products: Vec<Item>,
}
