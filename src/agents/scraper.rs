use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::agents::agent::{Agent, AgentContext, AgentRole, AgentStatus};
use crate::agents::extract::HtmlItemExtractor;
use crate::error::{is_store_failure, RelayError, Result};
use crate::session::{Cursor, PageOutcome, PageReport, ScrapeKind, SessionId, SessionStatus, SessionTracker};

/// Where a freshly activated scraper picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeInstruction {
    pub kind: ScrapeKind,
    pub session_id: SessionId,
    pub cursor: Cursor,
}

/// Scrapes one results page per activation and hands off to the next page
/// load by navigating. The session in the store carries everything else.
pub struct ScraperAgent {
    ctx: AgentContext,
    tracker: SessionTracker,
    extractor: HtmlItemExtractor,
    resume: ResumeInstruction,
}

impl ScraperAgent {
    pub fn new(ctx: AgentContext, tracker: SessionTracker, resume: ResumeInstruction) -> Result<Self> {
        let extractor = HtmlItemExtractor::new(&ctx.config.items)?;
        Ok(Self {
            ctx,
            tracker,
            extractor,
            resume,
        })
    }

    async fn scrape_page(&self) -> Result<AgentStatus> {
        let kind = self.resume.kind;
        let Some(session) = self.tracker.get(kind).await? else {
            return Ok(AgentStatus::Idle);
        };
        if session.session_id != self.resume.session_id {
            debug!("Session {} was replaced, not resuming", self.resume.session_id);
            return Ok(AgentStatus::Idle);
        }
        match session.status {
            SessionStatus::Running => {}
            SessionStatus::Paused => return self.stop().await,
            _ => return Ok(AgentStatus::Idle),
        }

        let html = self.ctx.page.content().await?;
        let digest = format!("{:x}", md5::compute(&html));
        let page_url = self.ctx.page.url().await?;
        let cursor = &self.resume.cursor;

        if session.page_digest.as_deref() == Some(digest.as_str()) {
            // a reload of the page already scraped for this cursor
            info!("Tab {} shows an already scraped page, moving on to {}", self.ctx.tab_id(), cursor.as_str());
            if !cursor.is_initial() {
                self.ctx.page.navigate(cursor.as_str()).await?;
            }
            return Ok(AgentStatus::Running);
        }
        if !cursor.is_initial() && !at_resume_point(&page_url, cursor.as_str()) {
            info!("Tab {} is not at the resume point, navigating to {}", self.ctx.tab_id(), cursor.as_str());
            self.ctx.page.navigate(cursor.as_str()).await?;
            return Ok(AgentStatus::Running);
        }

        let extracted = self.extractor.extract(&html, session.session_id);
        let next = match extracted.next_page {
            Some(href) => Some(Cursor::new(resolve_href(&page_url, &href)?)),
            None => None,
        };
        let found = extracted.items.len();

        let report = PageReport {
            session_id: session.session_id,
            cursor: cursor.clone(),
            page_digest: Some(digest),
            items: extracted.items,
            next,
        };

        match self.tracker.record_page(kind, report).await? {
            PageOutcome::Continue { appended, next } => {
                info!(
                    "Tab {} appended {} of {} items, continuing at {}",
                    self.ctx.tab_id(),
                    appended,
                    found,
                    next.as_str()
                );
                self.ctx.human_delay().await;

                // a stop may have landed while we waited
                let still_running = self
                    .tracker
                    .get(kind)
                    .await?
                    .map_or(false, |s| s.session_id == self.resume.session_id && s.status == SessionStatus::Running);
                if !still_running {
                    return self.stop().await;
                }

                self.ctx.page.navigate(next.as_str()).await?;
                Ok(AgentStatus::Running)
            }
            PageOutcome::Complete { total } => {
                info!("Tab {} finished scrape with {} items", self.ctx.tab_id(), total);
                Ok(AgentStatus::Finished)
            }
            PageOutcome::Halted(SessionStatus::Paused) => self.stop().await,
            PageOutcome::Halted(_) | PageOutcome::Stale => Ok(AgentStatus::Idle),
        }
    }

    async fn stop(&self) -> Result<AgentStatus> {
        self.tracker
            .acknowledge_stop(self.resume.kind, self.resume.session_id)
            .await?;
        info!("Scraper on tab {} stopped", self.ctx.tab_id());
        Ok(AgentStatus::Paused)
    }
}

/// Whether `page_url` shows the page `cursor` points at. Query pairs the page
/// adds on top of the cursor's (tracking ids, refs) don't count.
fn at_resume_point(page_url: &str, cursor: &str) -> bool {
    let (Ok(page), Ok(target)) = (Url::parse(page_url), Url::parse(cursor)) else {
        return page_url == cursor;
    };
    if page.scheme() != target.scheme()
        || page.host_str() != target.host_str()
        || page.path().trim_end_matches('/') != target.path().trim_end_matches('/')
    {
        return false;
    }
    let shown: HashSet<(String, String)> = page.query_pairs().into_owned().collect();
    target.query_pairs().into_owned().all(|pair| shown.contains(&pair))
}

fn resolve_href(base: &str, href: &str) -> Result<String> {
    let base = Url::parse(base).map_err(|e| RelayError::Browser(format!("Page has invalid url '{}': {}", base, e)))?;
    let url = base
        .join(href)
        .map_err(|e| RelayError::Browser(format!("Invalid next page link '{}': {}", href, e)))?;
    Ok(url.to_string())
}

#[async_trait]
impl Agent for ScraperAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Scraper
    }

    async fn run(&mut self) -> Result<AgentStatus> {
        self.ctx.report_status(AgentStatus::Running);

        let status = match self.scrape_page().await {
            Ok(status) => status,
            Err(e) => {
                if is_store_failure(e.as_ref()) {
                    return Err(e);
                }
                warn!("Scraper on tab {} failed: {}", self.ctx.tab_id(), e);
                let message = e.to_string();
                self.tracker
                    .fail(self.resume.kind, self.resume.session_id, &message)
                    .await?;
                AgentStatus::Error(message)
            }
        };

        self.ctx.report_status(status.clone());
        Ok(status)
    }
}
