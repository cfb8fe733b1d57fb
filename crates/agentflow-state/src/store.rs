use agentflow_core::tokens::{TokenSettings, UsageRecord};
use agentflow_core::workflow::{Step, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Workflow not found
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// One entry of the per-session status timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Event identifier
    pub id: Uuid,

    /// Session the event belongs to
    pub session: String,

    /// Event time; monotonically increasing within one session
    pub timestamp: DateTime<Utc>,

    /// Human-readable progress message
    pub message: String,
}

impl StatusEvent {
    /// Create an event stamped now
    pub fn new(session: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: session.into(),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Durable record of workflows and their steps
///
/// The orchestrator is the only writer. Loading always returns the
/// workflow with all of its steps in one round trip; there is no lazy
/// loading during execution.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or fully replace a workflow and its steps
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Load a workflow with all steps
    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>>;

    /// Load the most recent workflow for a session
    async fn find_by_session(&self, session: &str) -> Result<Option<Workflow>>;

    /// Update workflow status, current step and completion time
    async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        current_step: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Persist one step's current state
    async fn update_step(&self, workflow_id: Uuid, step: &Step) -> Result<()>;

    /// Workflows in a non-terminal state, for re-attach on restart
    async fn list_active(&self) -> Result<Vec<Workflow>>;
}

/// Append-only per-session status timeline
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Append one event
    async fn append(&self, event: StatusEvent) -> Result<()>;

    /// Events for a session after the given cursor, oldest first
    async fn events_since(
        &self,
        session: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>>;
}

/// Token usage records and per-user settings
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Record one completed model call
    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Sum of total tokens for a user since the cutoff
    async fn usage_since(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Usage records for a user, newest first
    async fn usage_records(&self, user_id: &str, limit: u32) -> Result<Vec<UsageRecord>>;

    /// Settings for a user, falling back to defaults
    async fn settings(&self, user_id: &str) -> Result<TokenSettings>;

    /// Replace a user's settings
    async fn put_settings(&self, user_id: &str, settings: &TokenSettings) -> Result<()>;
}

/// Type alias for Arc-wrapped StateStore
pub type StateStoreRef = Arc<dyn StateStore>;

/// Type alias for Arc-wrapped StatusStore
pub type StatusStoreRef = Arc<dyn StatusStore>;

/// Type alias for Arc-wrapped UsageStore
pub type UsageStoreRef = Arc<dyn UsageStore>;
