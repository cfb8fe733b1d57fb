// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Workflow orchestration: the sequential step loop.
//!
//! The orchestrator owns every persistence write. Each step is
//! persisted as `running` before dispatch and only marked `completed`
//! after its result has been written, so a crash can never leave a
//! phantom completion behind.

use crate::config::EngineConfig;
use crate::executor::{StepExecutor, StepOutcome, VARIANT_PSEUDO_TOOL};
use crate::limits::{TokenLimiter, WorkflowUsageRecorder};
use crate::metrics;
use crate::smart_retry::RetryController;
use agentflow_core::error::{EngineError, Result};
use agentflow_core::template::resolve_value;
use agentflow_core::workflow::{Step, StepStatus, Workflow, WorkflowStatus};
use agentflow_core::ExecutionContext;
use agentflow_llm::{GatewayConfig, LlmGateway, LlmProvider};
use agentflow_state::{StateStore, StateStoreRef, StatusStream};
use agentflow_tools::{InvocationContext, ToolRegistry};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Walks steps in order, updates persisted state, emits status events
/// and handles failure escalation.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    state: StateStoreRef,
    status: Arc<StatusStream>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    gateway_config: GatewayConfig,
    limiter: Arc<TokenLimiter>,
    config: EngineConfig,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator over its collaborators.
    pub fn new(
        state: StateStoreRef,
        status: Arc<StatusStream>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        gateway_config: GatewayConfig,
        limiter: Arc<TokenLimiter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            status,
            registry,
            provider,
            gateway_config,
            limiter,
            config,
        }
    }

    /// Drive one workflow to a terminal or parked state.
    ///
    /// The returned workflow carries the outcome; `Err` is reserved for
    /// infrastructure failures (persistence, missing workflow).
    pub async fn run(
        &self,
        workflow_id: Uuid,
        user_id: &str,
        cancel: CancellationToken,
    ) -> Result<Workflow> {
        let mut workflow = self
            .state
            .load_workflow(workflow_id)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?
            .ok_or_else(|| EngineError::state(format!("Workflow not found: {}", workflow_id)))?;

        if workflow.status.is_terminal() {
            return Ok(workflow);
        }

        let session = workflow.session_id.clone();
        let total_steps = workflow.steps.len();

        workflow.status = WorkflowStatus::Running;
        self.persist_status(&workflow).await?;
        metrics::WORKFLOWS_STARTED.inc();
        self.emit(&session, format!("Workflow gestartet: {} Schritte", total_steps))
            .await;

        // The gateway is scoped to this run: the fallback-model latch
        // lives until the workflow ends.
        let recorder = Arc::new(WorkflowUsageRecorder::new(self.limiter.clone(), user_id));
        let gateway = Arc::new(
            LlmGateway::new(self.provider.clone(), self.gateway_config.clone())
                .with_recorder(recorder),
        );

        let invocation =
            InvocationContext::new(user_id, session.clone(), workflow.id.to_string());
        let executor = StepExecutor::new(
            self.registry.clone(),
            gateway,
            self.limiter.clone(),
            self.status.clone(),
            self.config.clone(),
            invocation,
        );

        let ctx = ExecutionContext::new();
        for step in &workflow.steps {
            if step.status.is_terminal() {
                rehydrate(&ctx, step);
            }
        }

        let mut failures: u32 = 0;

        for index in 0..workflow.steps.len() {
            let step = workflow.steps[index].clone();
            if step.status.is_terminal() {
                continue;
            }

            if cancel.is_cancelled() {
                return self.cancelled(workflow, index).await;
            }

            workflow.current_step = step.step_number;

            if step.requires_confirmation {
                workflow.status = WorkflowStatus::WaitingConfirmation;
                self.persist_status(&workflow).await?;
                self.emit(
                    &session,
                    format!("Schritt {} wartet auf Bestätigung: {}", step.step_number, step.description),
                )
                .await;
                return Ok(workflow);
            }

            if let Some(condition) = &step.skip_if {
                let resolved = resolve_value(&json!(condition), &ctx).value;
                if is_truthy(&resolved) {
                    let result = json!({ "status": "skipped", "reason": "condition met" });
                    self.apply_skip(&mut workflow, index, &ctx, result, "Bedingung erfüllt")
                        .await?;
                    continue;
                }
            }

            let prior = &workflow.steps[..index];

            if RetryController::is_retry_step(&step, prior) {
                if let Some(copied) = RetryController::skip_decision(&step, prior) {
                    self.apply_skip(
                        &mut workflow,
                        index,
                        &ctx,
                        copied,
                        "vorheriger Versuch war erfolgreich",
                    )
                    .await?;
                    continue;
                }
            }

            if RetryController::is_terminal_selection(&step) {
                let selected = RetryController::select_best(&step, prior, &ctx);
                workflow.steps[index].complete(selected.clone());
                ctx.record_step_result(step.step_number, selected);
                self.persist_step(&workflow, index).await?;
                self.emit(
                    &session,
                    format!("Schritt {}: bestes Ergebnis aus allen Versuchen gewählt", step.step_number),
                )
                .await;
                continue;
            }

            // Persisted as running before dispatch: a crash leaves
            // running/pending rows, never a phantom completion.
            workflow.steps[index].status = StepStatus::Running;
            self.persist_step(&workflow, index).await?;
            self.persist_status(&workflow).await?;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.cancelled(workflow, index).await;
                }
                outcome = executor.execute(&step, &ctx) => outcome,
            };

            match outcome {
                StepOutcome::Done(value) => {
                    workflow.steps[index].complete(value.clone());
                    ctx.record_step_result(step.step_number, value);
                    rehydrate(&ctx, &workflow.steps[index]);
                    self.persist_step(&workflow, index).await?;
                    self.emit(
                        &session,
                        format!(
                            "Schritt {}/{} abgeschlossen: {}",
                            step.step_number, total_steps, step.description
                        ),
                    )
                    .await;
                }
                StepOutcome::Skip { reason, result } => {
                    self.apply_skip(&mut workflow, index, &ctx, result, &reason)
                        .await?;
                }
                StepOutcome::Fail(err) => {
                    failures += 1;

                    let optional_tool = step
                        .tool
                        .as_deref()
                        .and_then(|name| self.registry.get(name))
                        .map(|tool| tool.optional())
                        .unwrap_or(false);

                    if optional_tool && failures < self.config.max_optional_failures {
                        warn!(
                            session = %session,
                            step = step.step_number,
                            error = %err,
                            "Optional tool failed, skipping with placeholder result"
                        );
                        let placeholder = step
                            .output_format
                            .as_ref()
                            .map(|schema| schema.default_object())
                            .unwrap_or_else(|| {
                                json!({ "status": "error", "message": err.to_string() })
                            });
                        self.apply_skip(
                            &mut workflow,
                            index,
                            &ctx,
                            placeholder,
                            "optionales Werkzeug fehlgeschlagen",
                        )
                        .await?;
                        continue;
                    }

                    return self.failed(workflow, index, err).await;
                }
            }
        }

        workflow.status = WorkflowStatus::Completed;
        workflow.completed_at = Some(Utc::now());
        self.persist_status(&workflow).await?;
        metrics::WORKFLOWS_FINISHED
            .with_label_values(&["completed"])
            .inc();
        self.emit(&session, "Workflow erfolgreich abgeschlossen".to_string())
            .await;

        info!(session = %session, workflow = %workflow.id, "Workflow completed");
        Ok(workflow)
    }

    async fn apply_skip(
        &self,
        workflow: &mut Workflow,
        index: usize,
        ctx: &ExecutionContext,
        result: Value,
        reason: &str,
    ) -> Result<()> {
        let step_number = workflow.steps[index].step_number;
        workflow.steps[index].skip(result.clone());
        ctx.record_step_result(step_number, result);
        self.persist_step(workflow, index).await?;
        metrics::STEPS_SKIPPED.inc();
        self.emit(
            &workflow.session_id.clone(),
            format!("Schritt {} übersprungen: {}", step_number, reason),
        )
        .await;
        Ok(())
    }

    async fn failed(
        &self,
        mut workflow: Workflow,
        index: usize,
        err: EngineError,
    ) -> Result<Workflow> {
        let step_number = workflow.steps[index].step_number;
        let session = workflow.session_id.clone();

        error!(
            session = %session,
            step = step_number,
            error = %err,
            "Workflow failed"
        );

        workflow.steps[index].fail(err.to_string());
        self.persist_step(&workflow, index).await?;

        workflow.status = WorkflowStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        self.persist_status(&workflow).await?;
        metrics::WORKFLOWS_FINISHED
            .with_label_values(&["failed"])
            .inc();

        self.emit(
            &session,
            format!(
                "Workflow fehlgeschlagen (Session {}, Schritt {}): {}",
                session, step_number, err
            ),
        )
        .await;

        Ok(workflow)
    }

    async fn cancelled(&self, mut workflow: Workflow, index: usize) -> Result<Workflow> {
        let session = workflow.session_id.clone();
        let step_number = workflow.steps[index].step_number;

        if !workflow.steps[index].status.is_terminal() {
            workflow.steps[index].fail("Workflow cancelled");
            self.persist_step(&workflow, index).await?;
        }

        workflow.status = WorkflowStatus::Cancelled;
        workflow.completed_at = Some(Utc::now());
        self.persist_status(&workflow).await?;
        metrics::WORKFLOWS_FINISHED
            .with_label_values(&["cancelled"])
            .inc();

        self.emit(
            &session,
            format!("Workflow abgebrochen bei Schritt {}", step_number),
        )
        .await;

        Ok(workflow)
    }

    async fn persist_step(&self, workflow: &Workflow, index: usize) -> Result<()> {
        self.state
            .update_step(workflow.id, &workflow.steps[index])
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    async fn persist_status(&self, workflow: &Workflow) -> Result<()> {
        self.state
            .update_workflow_status(
                workflow.id,
                workflow.status,
                workflow.current_step,
                workflow.completed_at,
            )
            .await
            .map_err(|e| EngineError::state(e.to_string()))
    }

    async fn emit(&self, session: &str, message: String) {
        if let Err(err) = self.status.emit(session, message).await {
            warn!(session = %session, error = %err, "Failed to append status event");
        }
    }
}

/// Rehydrate context entries from a terminal step, including the
/// variant keys owned by the pseudo-tool.
fn rehydrate(ctx: &ExecutionContext, step: &Step) {
    let Some(result) = &step.result else {
        return;
    };

    if !ctx.contains(&format!("step_{}", step.step_number)) {
        ctx.record_step_result(step.step_number, result.clone());
    }

    if step.tool.as_deref() == Some(VARIANT_PSEUDO_TOOL) {
        if let Some(list) = result.get("search_variants_list") {
            ctx.set("search_variants_list", list.clone());
        }
        if let Some(count) = result.get("search_variants_count") {
            ctx.set("search_variants_count", count.clone());
        }
    }
}

/// Truthiness of a resolved `skip_if` condition.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            s == "true" || s == "yes" || s == "ja" || s == "1"
        }
        _ => false,
    }
}
