use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::session::model::{Cursor, Item, ScrapeKind, ScrapeProgress, ScrapeTarget, Session, SessionId, SessionStatus};
use crate::store::{keys, Store};

/// Result of reporting one page's worth of items.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// Keep going on the next page load from `next`.
    Continue { appended: usize, next: Cursor },
    Complete { total: usize },
    /// The session is no longer running; nothing was appended.
    Halted(SessionStatus),
    /// No session, or a different session than the agent was resumed for.
    Stale,
}

/// A page report from a scraper agent.
#[derive(Debug, Clone)]
pub struct PageReport {
    pub session_id: SessionId,
    /// The cursor the agent was resumed with.
    pub cursor: Cursor,
    pub page_digest: Option<String>,
    pub items: Vec<Item>,
    /// `None` once the listing pages are exhausted.
    pub next: Option<Cursor>,
}

/// Owns the lifecycle of resumable scrape sessions on top of the store.
///
/// Every mutation is a read-modify-conditional-write on the session key, so a
/// status change made by the dispatcher is never clobbered by an agent's
/// concurrent progress write.
#[derive(Clone)]
pub struct SessionTracker {
    store: Store,
}

impl SessionTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn start(
        &self,
        kind: ScrapeKind,
        target: ScrapeTarget,
        start_url: String,
        user: Option<String>,
    ) -> Result<Session> {
        self.clear(kind).await?;

        let session = Session::new(kind, target, start_url, user);
        let mut writes = self.companion_writes(&session)?;
        writes.push((keys::session(kind.as_str()), serde_json::to_value(&session).map_err(RelayError::from)?));
        self.store.set_many(writes).await?;

        info!("Started {} scrape session {}", kind.as_str(), session.session_id);
        Ok(session)
    }

    pub async fn get(&self, kind: ScrapeKind) -> Result<Option<Session>> {
        self.store.get_json(&keys::session(kind.as_str())).await
    }

    pub async fn progress(&self, kind: ScrapeKind) -> Result<Option<ScrapeProgress>> {
        self.store.get_json(&keys::scraping_progress(kind.as_str())).await
    }

    /// The cursor a freshly activated agent should resume from, if the session is running.
    pub async fn resume_point(&self, kind: ScrapeKind) -> Result<Option<(SessionId, Cursor)>> {
        Ok(self
            .get(kind)
            .await?
            .filter(|s| s.status == SessionStatus::Running)
            .map(|s| (s.session_id, s.cursor)))
    }

    pub async fn record_page(&self, kind: ScrapeKind, report: PageReport) -> Result<PageOutcome> {
        let key = keys::session(kind.as_str());

        loop {
            let Some(entry) = self.store.get_entry(&key).await else {
                return Ok(PageOutcome::Stale);
            };
            let mut session: Session = serde_json::from_value(entry.value).map_err(RelayError::from)?;

            if session.session_id != report.session_id {
                debug!("Ignoring page report for superseded session {}", report.session_id);
                return Ok(PageOutcome::Stale);
            }
            if session.status != SessionStatus::Running {
                return Ok(PageOutcome::Halted(session.status));
            }

            let same_cursor = session.cursor == report.cursor;
            let appended = append_unique(&mut session, report.items.clone());
            let now = Utc::now();

            // a replayed resume for an older cursor may add items but never rewinds
            if same_cursor {
                session.page_digest = report.page_digest.clone();
                if let Some(next) = &report.next {
                    session.cursor = next.clone();
                }
            }

            let exhausted = same_cursor && report.next.is_none();
            if exhausted || session.target_reached(now) {
                session.status = SessionStatus::Complete;
            }
            session.last_updated = now;

            let value = serde_json::to_value(&session).map_err(RelayError::from)?;
            let also = self.companion_writes(&session)?;
            if self
                .store
                .commit_if_version(&key, value, Some(entry.version), also)
                .await?
                .is_none()
            {
                continue;
            }

            if session.is_complete() {
                info!(
                    "Scrape session {} complete with {} items",
                    session.session_id,
                    session.items_collected.len()
                );
                return Ok(PageOutcome::Complete {
                    total: session.items_collected.len(),
                });
            }

            return Ok(PageOutcome::Continue {
                appended,
                next: session.cursor.clone(),
            });
        }
    }

    /// User stop: `running -> paused`. Returns the session as it now stands.
    pub async fn pause(&self, kind: ScrapeKind) -> Result<Option<Session>> {
        self.transition(kind, |session| {
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Paused;
                session.stop_acknowledged = false;
                true
            } else {
                false
            }
        })
        .await
    }

    /// Explicit `paused -> running`; the only way a paused session is resumed again.
    pub async fn unpause(&self, kind: ScrapeKind) -> Result<Option<Session>> {
        self.transition(kind, |session| {
            if session.status == SessionStatus::Paused {
                session.status = SessionStatus::Running;
                session.stop_acknowledged = false;
                true
            } else {
                false
            }
        })
        .await
    }

    /// Agent-side acknowledgement that it has stopped appending.
    pub async fn acknowledge_stop(&self, kind: ScrapeKind, session_id: SessionId) -> Result<()> {
        self.transition(kind, |session| {
            if session.session_id == session_id
                && session.status == SessionStatus::Paused
                && !session.stop_acknowledged
            {
                session.stop_acknowledged = true;
                true
            } else {
                false
            }
        })
        .await?;
        Ok(())
    }

    /// Marks the session failed. Items already collected are kept.
    pub async fn fail(&self, kind: ScrapeKind, session_id: SessionId, message: &str) -> Result<()> {
        let updated = self
            .transition(kind, |session| {
                if session.session_id == session_id
                    && matches!(session.status, SessionStatus::Running | SessionStatus::Pending)
                {
                    session.status = SessionStatus::Error;
                    session.error = Some(message.to_string());
                    true
                } else {
                    false
                }
            })
            .await?;

        if let Some(session) = updated.filter(|s| s.status == SessionStatus::Error) {
            warn!(
                "Scrape session {} failed with {} items kept: {}",
                session.session_id,
                session.items_collected.len(),
                message
            );
        }
        Ok(())
    }

    pub async fn clear(&self, kind: ScrapeKind) -> Result<()> {
        self.store.remove(&keys::session(kind.as_str())).await?;
        self.store.remove(&keys::scraping_progress(kind.as_str())).await?;
        Ok(())
    }

    async fn transition<F>(&self, kind: ScrapeKind, mut apply: F) -> Result<Option<Session>>
    where
        F: FnMut(&mut Session) -> bool,
    {
        let key = keys::session(kind.as_str());
        loop {
            let Some(entry) = self.store.get_entry(&key).await else {
                return Ok(None);
            };
            let mut session: Session = serde_json::from_value(entry.value).map_err(RelayError::from)?;
            if !apply(&mut session) {
                return Ok(Some(session));
            }
            session.last_updated = Utc::now();

            let value = serde_json::to_value(&session).map_err(RelayError::from)?;
            let also = self.companion_writes(&session)?;
            if self
                .store
                .commit_if_version(&key, value, Some(entry.version), also)
                .await?
                .is_some()
            {
                return Ok(Some(session));
            }
        }
    }

    /// Keys committed together with the session: its progress record and, once
    /// complete, the user's snapshot. Observers of the session key therefore
    /// never see a status the progress record doesn't reflect yet.
    fn companion_writes(&self, session: &Session) -> Result<Vec<(String, Value)>> {
        let mut writes = vec![(
            keys::scraping_progress(session.kind.as_str()),
            serde_json::to_value(session.progress()).map_err(RelayError::from)?,
        )];
        if session.is_complete() {
            if let Some(user) = &session.user {
                writes.push((
                    keys::scraped_products(user),
                    serde_json::to_value(&session.items_collected).map_err(RelayError::from)?,
                ));
            }
        }
        Ok(writes)
    }
}

/// Appends items whose source id is new, stopping at the target size.
fn append_unique(session: &mut Session, items: Vec<Item>) -> usize {
    let mut seen: HashSet<String> = session.items_collected.iter().map(|i| i.source_id.clone()).collect();
    let room = session
        .target
        .max_items
        .map_or(usize::MAX, |max| max.saturating_sub(session.items_collected.len()));

    let mut appended = 0;
    for item in items {
        if appended >= room {
            break;
        }
        if seen.insert(item.source_id.clone()) {
            session.items_collected.push(item);
            appended += 1;
        }
    }
    appended
}
