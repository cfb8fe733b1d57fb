// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Service facade: the operations an ingress layer (HTTP, CLI) calls.
//!
//! Workflows run on a bounded background worker pool so callers get a
//! session id immediately and poll the status endpoint; blocking model
//! backoff never happens on the request path.

use crate::config::EngineConfig;
use crate::limits::{LimitCheck, TokenLimiter, WorkflowUsageRecorder};
use crate::orchestrator::WorkflowOrchestrator;
use crate::planner::Planner;
use agentflow_core::error::{EngineError, Result};
use agentflow_core::tokens::{TokenSettings, UsageRecord};
use agentflow_core::workflow::{Workflow, WorkflowStatus};
use agentflow_llm::{GatewayConfig, LlmGateway, LlmProvider};
use agentflow_state::{StateStore, StateStoreRef, StatusEvent, StatusStream, UsageStore, UsageStoreRef};
use agentflow_tools::ToolRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Response of workflow creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateWorkflowResponse {
    /// Persisted workflow id.
    pub workflow_id: Uuid,

    /// Session to poll for status.
    pub session_id: String,

    /// Number of planned steps.
    pub steps_count: usize,

    /// Tools the plan wanted but the registry lacks (empty on success).
    pub missing_tools: Vec<String>,
}

/// One step in the status response.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub number: u32,
    #[serde(rename = "type")]
    pub step_type: String,
    pub description: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Workflow status response.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusResponse {
    pub status: String,
    pub current_step: u32,
    pub total_steps: usize,
    pub steps: Vec<StepView>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStatusResponse {
    fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            status: workflow.status.as_str().to_string(),
            current_step: workflow.current_step,
            total_steps: workflow.steps.len(),
            steps: workflow
                .steps
                .iter()
                .map(|step| StepView {
                    number: step.step_number,
                    step_type: step.step_type.as_str().to_string(),
                    description: step.description.clone(),
                    status: step.status.as_str().to_string(),
                    result: step.result.clone(),
                    error: step.error.clone(),
                })
                .collect(),
            created_at: workflow.created_at,
            completed_at: workflow.completed_at,
        }
    }
}

/// Entry point for clients: creates, observes, confirms and cancels
/// workflows and exposes token governance.
#[derive(Clone)]
pub struct WorkflowService {
    state: StateStoreRef,
    status: Arc<StatusStream>,
    usage: UsageStoreRef,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    gateway_config: GatewayConfig,
    limiter: Arc<TokenLimiter>,
    orchestrator: WorkflowOrchestrator,
    workers: Arc<Semaphore>,
    tasks: Arc<DashMap<String, CancellationToken>>,
}

impl WorkflowService {
    /// Wire up the service from its collaborators.
    pub fn new(
        state: StateStoreRef,
        status: Arc<StatusStream>,
        usage: UsageStoreRef,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        gateway_config: GatewayConfig,
        config: EngineConfig,
    ) -> Self {
        let limiter = Arc::new(TokenLimiter::new(usage.clone()));
        let orchestrator = WorkflowOrchestrator::new(
            state.clone(),
            status.clone(),
            registry.clone(),
            provider.clone(),
            gateway_config.clone(),
            limiter.clone(),
            config.clone(),
        );

        Self {
            state,
            status,
            usage,
            registry,
            provider,
            gateway_config,
            limiter,
            orchestrator,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Plan a workflow for an intent, persist it and start it on the
    /// worker pool. Returns immediately; clients poll [`Self::status`].
    pub async fn create(
        &self,
        intent: &str,
        session_id: Option<String>,
        user_id: &str,
    ) -> Result<CreateWorkflowResponse> {
        let session = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let recorder = Arc::new(WorkflowUsageRecorder::new(self.limiter.clone(), user_id));
        let gateway = Arc::new(
            LlmGateway::new(self.provider.clone(), self.gateway_config.clone())
                .with_recorder(recorder),
        );
        let planner = Planner::new(gateway, self.registry.clone());

        let workflow = planner.plan(intent, &session).await?;
        let workflow_id = workflow.id;
        let steps_count = workflow.steps.len();

        self.state
            .save_workflow(&workflow)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?;

        info!(
            session = %session,
            workflow = %workflow_id,
            steps = steps_count,
            "Workflow created"
        );
        let _ = self
            .status
            .emit(&session, format!("Plan erstellt: {} Schritte", steps_count))
            .await;

        self.spawn_run(workflow_id, session.clone(), user_id.to_string());

        Ok(CreateWorkflowResponse {
            workflow_id,
            session_id: session,
            steps_count,
            missing_tools: Vec::new(),
        })
    }

    fn spawn_run(&self, workflow_id: Uuid, session: String, user_id: String) {
        let token = CancellationToken::new();
        self.tasks.insert(session.clone(), token.clone());

        let orchestrator = self.orchestrator.clone();
        let workers = self.workers.clone();
        let tasks = self.tasks.clone();

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                tasks.remove(&session);
                return;
            };

            if let Err(err) = orchestrator.run(workflow_id, &user_id, token).await {
                error!(
                    session = %session,
                    workflow = %workflow_id,
                    error = %err,
                    "Workflow task failed"
                );
            }

            tasks.remove(&session);
        });
    }

    /// Current state of the most recent workflow in a session.
    pub async fn status(&self, session: &str) -> Result<WorkflowStatusResponse> {
        let workflow = self
            .state
            .find_by_session(session)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?
            .ok_or_else(|| EngineError::state(format!("No workflow for session {}", session)))?;

        Ok(WorkflowStatusResponse::from_workflow(&workflow))
    }

    /// Resolve a workflow parked in `waiting_confirmation`.
    ///
    /// Confirmation consumes the step's flag and re-enters the loop; a
    /// rejection cancels the workflow.
    pub async fn confirm(&self, workflow_id: Uuid, confirmed: bool, user_id: &str) -> Result<()> {
        let mut workflow = self
            .state
            .load_workflow(workflow_id)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?
            .ok_or_else(|| EngineError::state(format!("Workflow not found: {}", workflow_id)))?;

        if workflow.status != WorkflowStatus::WaitingConfirmation {
            return Err(EngineError::Confirmation(format!(
                "Workflow {} is not waiting for confirmation",
                workflow_id
            )));
        }

        let session = workflow.session_id.clone();

        if !confirmed {
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(Utc::now());
            self.state
                .save_workflow(&workflow)
                .await
                .map_err(|e| EngineError::state(e.to_string()))?;
            let _ = self
                .status
                .emit(&session, "Bestätigung abgelehnt, Workflow abgebrochen")
                .await;
            return Ok(());
        }

        if let Some(step) = workflow
            .steps
            .iter_mut()
            .find(|s| s.requires_confirmation && !s.status.is_terminal())
        {
            step.requires_confirmation = false;
        }
        workflow.status = WorkflowStatus::Running;
        self.state
            .save_workflow(&workflow)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?;

        let _ = self
            .status
            .emit(&session, "Bestätigung erhalten, Workflow wird fortgesetzt")
            .await;
        self.spawn_run(workflow_id, session, user_id.to_string());

        Ok(())
    }

    /// Signal cancellation to a session's running workflow task.
    pub fn cancel(&self, session: &str) -> bool {
        match self.tasks.get(session) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Incremental status events for a session.
    pub async fn events_since(
        &self,
        session: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>> {
        self.status
            .events_since(session, since)
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    /// Token limits for a user.
    pub async fn token_settings(&self, user_id: &str) -> Result<TokenSettings> {
        self.usage
            .settings(user_id)
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    /// Replace a user's token limits.
    pub async fn put_token_settings(&self, user_id: &str, settings: &TokenSettings) -> Result<()> {
        self.usage
            .put_settings(user_id, settings)
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    /// Recent usage records for a user.
    pub async fn token_usage(&self, user_id: &str, limit: u32) -> Result<Vec<UsageRecord>> {
        self.usage
            .usage_records(user_id, limit)
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    /// Would a call of the given size be admitted right now?
    pub async fn check_limit(&self, user_id: &str, estimated_tokens: u64) -> LimitCheck {
        self.limiter.check(user_id, estimated_tokens).await
    }
}
