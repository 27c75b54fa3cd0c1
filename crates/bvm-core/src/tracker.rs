//! Registry of connected storage agents.

use crate::context::RequestContext;
use crate::dtos::StorageServerId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// One registered agent connection.
#[derive(Debug, Clone)]
pub struct TrackedAgent {
    pub id: StorageServerId,
    pub name: String,
    pub context: Arc<RequestContext>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_id: StorageServerId,
    agents: HashMap<StorageServerId, TrackedAgent>,
}

/// Assigns agent IDs and maps them to their connection contexts.
///
/// IDs start at 0 and are never reused, even after the agent leaves.
#[derive(Debug, Default)]
pub struct AgentTracker {
    state: RwLock<TrackerState>,
}

impl AgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new agent and return its ID.
    pub fn register_agent(
        &self,
        name: impl Into<String>,
        context: Arc<RequestContext>,
    ) -> StorageServerId {
        let name = name.into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.agents.insert(
            id,
            TrackedAgent {
                id,
                name: name.clone(),
                context,
                registered_at: Utc::now(),
            },
        );
        drop(state);

        info!("Storage server {} registered as {}", name, id);
        id
    }

    /// Stop tracking an agent. Returns whether it was tracked.
    pub fn remove_agent(&self, id: StorageServerId) -> bool {
        let removed = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .agents
            .remove(&id);

        match removed {
            Some(agent) => {
                info!("Storage server {} ({}) removed", agent.name, id);
                true
            }
            None => false,
        }
    }

    pub fn get_agent_context(&self, id: StorageServerId) -> Option<Arc<RequestContext>> {
        self.get_agent(id).map(|agent| agent.context)
    }

    pub fn get_agent(&self, id: StorageServerId) -> Option<TrackedAgent> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .agents
            .get(&id)
            .cloned()
    }

    /// Snapshot of all tracked agents, ordered by ID.
    pub fn list_agents(&self) -> Vec<TrackedAgent> {
        let mut agents: Vec<TrackedAgent> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .agents
            .values()
            .cloned()
            .collect();
        agents.sort_by_key(|agent| agent.id);
        agents
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .agents
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
