use crate::store::{
    Result, StateError, StateStore, StatusEvent, StatusStore, UsageStore,
};
use agentflow_core::tokens::{TokenSettings, UsageRecord};
use agentflow_core::workflow::{Step, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

/// In-memory implementation of all persistence traits
///
/// Backs tests and the default CLI path. Not durable: a restart loses
/// everything, which is acceptable for local runs.
#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<Uuid, Workflow>,
    events: RwLock<Vec<StatusEvent>>,
    usage: RwLock<Vec<UsageRecord>>,
    settings: DashMap<String, TokenSettings>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn find_by_session(&self, session: &str) -> Result<Option<Workflow>> {
        let mut newest: Option<Workflow> = None;
        for entry in self.workflows.iter() {
            if entry.session_id == session {
                let replace = newest
                    .as_ref()
                    .map(|w| entry.created_at > w.created_at)
                    .unwrap_or(true);
                if replace {
                    newest = Some(entry.clone());
                }
            }
        }
        Ok(newest)
    }

    async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        current_step: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut workflow = self
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StateError::WorkflowNotFound(id.to_string()))?;
        workflow.status = status;
        workflow.current_step = current_step;
        if completed_at.is_some() {
            workflow.completed_at = completed_at;
        }
        Ok(())
    }

    async fn update_step(&self, workflow_id: Uuid, step: &Step) -> Result<()> {
        let mut workflow = self
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StateError::WorkflowNotFound(workflow_id.to_string()))?;

        match workflow
            .steps
            .iter_mut()
            .find(|s| s.step_number == step.step_number)
        {
            Some(existing) => *existing = step.clone(),
            None => {
                return Err(StateError::Database(format!(
                    "Step {} does not exist in workflow {}",
                    step.step_number, workflow_id
                )))
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Workflow>> {
        let mut active: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|w| !w.status.is_terminal())
            .map(|w| w.clone())
            .collect();
        active.sort_by_key(|w| w.created_at);
        Ok(active)
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn append(&self, event: StatusEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn events_since(
        &self,
        session: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>> {
        let events = self.events.read();
        let mut matching: Vec<StatusEvent> = events
            .iter()
            .filter(|e| e.session == session)
            .filter(|e| since.map(|cursor| e.timestamp > cursor).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.timestamp);
        Ok(matching)
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage.write().push(record.clone());
        Ok(())
    }

    async fn usage_since(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let usage = self.usage.read();
        Ok(usage
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= cutoff)
            .map(|r| r.total_tokens)
            .sum())
    }

    async fn usage_records(&self, user_id: &str, limit: u32) -> Result<Vec<UsageRecord>> {
        let usage = self.usage.read();
        let mut records: Vec<UsageRecord> = usage
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn settings(&self, user_id: &str) -> Result<TokenSettings> {
        Ok(self
            .settings
            .get(user_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn put_settings(&self, user_id: &str, settings: &TokenSettings) -> Result<()> {
        self.settings.insert(user_id.to_string(), settings.clone());
        Ok(())
    }
}
