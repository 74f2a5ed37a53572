use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use crate::browser::{PageDriver, TabId};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::store::Store;

pub type AgentId = Uuid;

/// Which agent belongs on a page, decided from its URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Scraper,
    Lister,
    None,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Scraper => "scraper",
            AgentRole::Lister => "lister",
            AgentRole::None => "none",
        }
    }

    pub fn from_marker(marker: &str) -> Self {
        match marker {
            "scraper" => AgentRole::Scraper,
            "lister" => AgentRole::Lister,
            _ => AgentRole::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentStatus {
    Idle,
    Running,
    Finished,
    Paused,
    Terminated,
    Error(String),
}

/// One-way notifications from an agent to the dispatcher. The agent never
/// waits for an answer: its page may be gone before one could arrive.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    StatusUpdate {
        agent_id: AgentId,
        tab_id: TabId,
        role: AgentRole,
        status: AgentStatus,
    },
    ClosePage {
        tab_id: TabId,
        reason: String,
    },
}

pub type Outbox = mpsc::UnboundedSender<AgentMessage>;

/// Everything an agent gets when it is activated on a page. Nothing here
/// survives the page; durable state goes through `store`.
#[derive(Clone)]
pub struct AgentContext {
    pub id: AgentId,
    pub role: AgentRole,
    pub page: Arc<dyn PageDriver>,
    pub store: Store,
    pub config: AgentConfig,
    pub outbox: Outbox,
}

impl AgentContext {
    pub fn new(role: AgentRole, page: Arc<dyn PageDriver>, store: Store, config: AgentConfig, outbox: Outbox) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            page,
            store,
            config,
            outbox,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.page.tab_id()
    }

    pub fn send(&self, message: AgentMessage) {
        if self.outbox.send(message).is_err() {
            debug!("Dispatcher gone, dropping message from agent {}", self.id);
        }
    }

    pub fn report_status(&self, status: AgentStatus) {
        self.send(AgentMessage::StatusUpdate {
            agent_id: self.id,
            tab_id: self.tab_id(),
            role: self.role,
            status,
        });
    }

    /// Random pause between page actions.
    pub async fn human_delay(&self) {
        let (min, max) = self.config.delay_range;
        let delay = rand::thread_rng().gen_range(min..=max);
        debug!("Agent {} delaying for {}ms", self.id, delay);
        sleep(Duration::from_millis(delay)).await;
    }
}

#[async_trait]
pub trait Agent: Send {
    fn role(&self) -> AgentRole;
    /// Runs until the agent has nothing left to do on this page load.
    async fn run(&mut self) -> Result<AgentStatus>;
}
