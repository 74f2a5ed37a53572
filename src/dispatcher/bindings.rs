use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::agents::{AgentId, AgentRole};
use crate::browser::TabId;

/// Which agent is active on a page right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBinding {
    pub tab_id: TabId,
    pub role: AgentRole,
    pub agent_id: AgentId,
    pub injected_at: DateTime<Utc>,
}

/// Each tab's document generation. Bumped on every navigation so an
/// activation computed for an old document can't bind to the new one.
pub type Generation = u64;

#[derive(Default)]
struct RegistryState {
    bindings: HashMap<TabId, PageBinding>,
    generations: HashMap<TabId, Generation>,
}

/// Authoritative record of active agents, at most one per tab.
#[derive(Default)]
pub struct BindingRegistry {
    state: Mutex<RegistryState>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self, tab_id: TabId) -> Generation {
        self.lock().generations.get(&tab_id).copied().unwrap_or(0)
    }

    /// A new document started loading in `tab_id`: whatever was bound is gone.
    pub fn navigation_started(&self, tab_id: TabId) -> Option<PageBinding> {
        let mut state = self.lock();
        *state.generations.entry(tab_id).or_insert(0) += 1;
        state.bindings.remove(&tab_id)
    }

    pub fn page_closed(&self, tab_id: TabId) -> Option<PageBinding> {
        let mut state = self.lock();
        state.generations.remove(&tab_id);
        state.bindings.remove(&tab_id)
    }

    /// Check-and-insert in one step. `None` if the tab already has an agent
    /// or has navigated since `generation` was read.
    pub fn try_bind(&self, tab_id: TabId, role: AgentRole, agent_id: AgentId, generation: Generation) -> Option<PageBinding> {
        let mut state = self.lock();
        if state.generations.get(&tab_id).copied().unwrap_or(0) != generation || state.bindings.contains_key(&tab_id) {
            return None;
        }
        let binding = PageBinding {
            tab_id,
            role,
            agent_id,
            injected_at: Utc::now(),
        };
        state.bindings.insert(tab_id, binding.clone());
        Some(binding)
    }

    /// Drops the binding only if it still belongs to `agent_id`.
    pub fn release(&self, tab_id: TabId, agent_id: AgentId) -> bool {
        let mut state = self.lock();
        match state.bindings.get(&tab_id) {
            Some(binding) if binding.agent_id == agent_id => {
                state.bindings.remove(&tab_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, tab_id: TabId) -> Option<PageBinding> {
        self.lock().bindings.get(&tab_id).cloned()
    }

    pub fn all(&self) -> Vec<PageBinding> {
        self.lock().bindings.values().cloned().collect()
    }
}
