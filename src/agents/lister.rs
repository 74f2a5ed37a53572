use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::agents::agent::{Agent, AgentContext, AgentMessage, AgentRole, AgentStatus};
use crate::error::{is_store_failure, AutomationFailure, RelayError, Result};
use crate::store::keys;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    Pending,
    InProgress,
    Complete,
    Paused,
    Terminated,
    Error,
}

impl ListingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ListingStatus::Pending | ListingStatus::InProgress)
    }
}

/// One cross-listing attempt, as the UI sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingTask {
    pub listing_id: Option<String>,
    pub source_id: String,
    pub sku: String,
    pub draft_id: Option<String>,
    pub status: ListingStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ListingTask {
    pub fn new(source_id: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            listing_id: None,
            source_id: source_id.into(),
            sku: sku.into(),
            draft_id: None,
            status: ListingStatus::Pending,
            error_message: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Run-wide listing signal kept under `listing-status`. The UI flips it to
/// `paused`/`terminated`; agents write `error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunSignal {
    Running,
    Paused,
    Terminated,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WizardState {
    Start,
    CategoryConfirm,
    ConditionSelect,
    Continue,
    Done,
    Error(AutomationFailure),
    Paused,
    Terminated,
}

impl WizardState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WizardState::Done | WizardState::Error(_) | WizardState::Paused | WizardState::Terminated
        )
    }
}

/// Drives the sell-form wizard on a lister page.
///
/// Holds no progress of its own: every activation starts at
/// [`WizardState::Start`] and reads the wizard's position off the DOM.
pub struct ListingWizard {
    ctx: AgentContext,
}

impl ListingWizard {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Executes one state and returns the next.
    pub async fn step(&self, state: &WizardState) -> Result<WizardState> {
        if let Some(halt) = self.external_halt().await? {
            return Ok(halt);
        }

        match state {
            WizardState::Start => self.start().await,
            WizardState::CategoryConfirm => self.await_condition_group().await,
            WizardState::ConditionSelect => self.select_condition().await,
            WizardState::Continue => self.confirm_continue().await,
            terminal => Ok(terminal.clone()),
        }
    }

    /// Runs from `Start` to a terminal state.
    pub async fn drive(&self) -> Result<WizardState> {
        let mut state = WizardState::Start;
        while !state.is_terminal() {
            let next = self.step(&state).await?;
            debug!("Tab {} wizard {:?} -> {:?}", self.ctx.tab_id(), state, next);
            state = next;
        }
        Ok(state)
    }

    async fn external_halt(&self) -> Result<Option<WizardState>> {
        let signal = self.ctx.store.get_json::<RunSignal>(keys::LISTING_STATUS).await?;
        Ok(match signal {
            Some(RunSignal::Paused) => Some(WizardState::Paused),
            Some(RunSignal::Terminated) => Some(WizardState::Terminated),
            _ => None,
        })
    }

    async fn poll(&self) {
        sleep(self.ctx.config.poll_interval).await;
    }

    async fn start(&self) -> Result<WizardState> {
        let selector = &self.ctx.config.wizard.category_option;
        if self.ctx.page.exists(selector).await? && self.ctx.page.click(selector).await? {
            info!("Tab {} selected suggested category", self.ctx.tab_id());
            self.ctx.human_delay().await;
        } else {
            debug!("Tab {} has no category suggestion, skipping", self.ctx.tab_id());
        }
        Ok(WizardState::CategoryConfirm)
    }

    /// Unbounded: the condition step can take arbitrarily long to render,
    /// but the run signal is re-read on every poll.
    async fn await_condition_group(&self) -> Result<WizardState> {
        let selector = &self.ctx.config.wizard.condition_group;
        loop {
            if self.ctx.page.exists(selector).await? {
                return Ok(WizardState::ConditionSelect);
            }
            self.poll().await;
            if let Some(halt) = self.external_halt().await? {
                return Ok(halt);
            }
        }
    }

    async fn select_condition(&self) -> Result<WizardState> {
        let selector = &self.ctx.config.wizard.condition_new;
        for attempt in 1..=self.ctx.config.condition_attempts {
            if self.ctx.page.click(selector).await? {
                info!("Tab {} selected condition 'new'", self.ctx.tab_id());
                self.ctx.human_delay().await;
                return Ok(WizardState::Continue);
            }
            debug!("Tab {} condition option missing (attempt {})", self.ctx.tab_id(), attempt);
            self.poll().await;
            if let Some(halt) = self.external_halt().await? {
                return Ok(halt);
            }
        }
        Ok(WizardState::Error(AutomationFailure::ConditionNotFound))
    }

    async fn confirm_continue(&self) -> Result<WizardState> {
        let selector = &self.ctx.config.wizard.continue_button;
        for attempt in 1..=self.ctx.config.continuation_attempts {
            if self.submit(selector).await? {
                return Ok(WizardState::Done);
            }
            debug!("Tab {} continue button missing (attempt {})", self.ctx.tab_id(), attempt);
            self.poll().await;
            if let Some(halt) = self.external_halt().await? {
                return Ok(halt);
            }
        }
        Ok(WizardState::Error(AutomationFailure::ContinuationNotFound))
    }

    /// Clicks the submitting button and records the finished task on a task of
    /// its own. The click navigates the page, and the dispatcher aborts this
    /// agent when it sees that navigation start.
    async fn submit(&self, selector: &str) -> Result<bool> {
        let wizard = ListingWizard::new(self.ctx.clone());
        let selector = selector.to_string();
        tokio::spawn(async move { wizard.commit_submit(&selector).await })
            .await
            .map_err(|e| RelayError::Browser(format!("Listing submit on tab {} crashed: {}", self.ctx.tab_id(), e)))?
    }

    async fn commit_submit(&self, selector: &str) -> Result<bool> {
        if !self.ctx.page.click(selector).await? {
            return Ok(false);
        }
        info!("Tab {} confirmed listing", self.ctx.tab_id());
        self.finish_task(ListingStatus::Complete, None).await?;
        self.ctx.report_status(AgentStatus::Finished);
        Ok(true)
    }

    /// Applies `apply` to the current task, if there is one.
    async fn update_task<F>(&self, apply: F) -> Result<Option<ListingTask>>
    where
        F: FnOnce(&mut ListingTask),
    {
        let Some(mut task) = self.ctx.store.get_json::<ListingTask>(keys::LISTING_TASK).await? else {
            return Ok(None);
        };
        apply(&mut task);
        self.ctx.store.set_json(keys::LISTING_TASK, &task).await?;
        Ok(Some(task))
    }

    async fn finish_task(&self, status: ListingStatus, message: Option<String>) -> Result<()> {
        self.update_task(|task| {
            task.status = status;
            task.error_message = message;
            task.finished_at = Some(Utc::now());
        })
        .await?;
        Ok(())
    }

    /// Records a failure and, in bulk runs configured for it, asks for the page to be closed.
    async fn record_failure(&self, reason: &str) -> Result<()> {
        warn!("Listing on tab {} failed: {}", self.ctx.tab_id(), reason);

        self.ctx.store.set_json(keys::LISTING_STATUS, &RunSignal::Error).await?;
        self.finish_task(ListingStatus::Error, Some(reason.to_string())).await?;

        let bulk = self.ctx.store.get_bool(keys::IS_BULK_LISTING).await;
        let close_on_error = self.ctx.store.get_bool(keys::CLOSE_ON_ERROR).await;
        if bulk && close_on_error {
            self.ctx.send(AgentMessage::ClosePage {
                tab_id: self.ctx.tab_id(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for ListingWizard {
    fn role(&self) -> AgentRole {
        AgentRole::Lister
    }

    async fn run(&mut self) -> Result<AgentStatus> {
        if let Some(task) = self.ctx.store.get_json::<ListingTask>(keys::LISTING_TASK).await? {
            if task.status.is_terminal() {
                debug!("Listing task for {} already {:?}, nothing to do", task.source_id, task.status);
                return Ok(AgentStatus::Idle);
            }
        }

        self.update_task(|task| {
            task.status = ListingStatus::InProgress;
            task.started_at.get_or_insert_with(Utc::now);
        })
        .await?;
        self.ctx.report_status(AgentStatus::Running);

        let status = match self.drive().await {
            // recorded and reported by `submit`
            Ok(WizardState::Done) => return Ok(AgentStatus::Finished),
            Ok(WizardState::Paused) => {
                self.finish_task(ListingStatus::Paused, None).await?;
                AgentStatus::Paused
            }
            Ok(WizardState::Terminated) => {
                self.finish_task(ListingStatus::Terminated, None).await?;
                AgentStatus::Terminated
            }
            Ok(WizardState::Error(failure)) => {
                self.record_failure(failure.reason()).await?;
                AgentStatus::Error(failure.reason().to_string())
            }
            Ok(other) => {
                error!("Wizard stopped in non-terminal state {:?}", other);
                AgentStatus::Error(format!("{:?}", other))
            }
            Err(e) => {
                if is_store_failure(e.as_ref()) {
                    return Err(e);
                }
                let message = e.to_string();
                self.record_failure(&message).await?;
                AgentStatus::Error(message)
            }
        };

        self.ctx.report_status(status.clone());
        Ok(status)
    }
}
