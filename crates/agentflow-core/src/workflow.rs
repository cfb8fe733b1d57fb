// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Workflow and step definition types.

use crate::error::{EngineError, Result};
use crate::schema::OutputFormat;
use crate::template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An executable instance of a plan derived from a user intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Externally visible session identifier used to correlate status
    /// events with workflow state.
    pub session_id: String,

    /// The original user intent text.
    pub intent: String,

    /// Current lifecycle status.
    #[serde(default)]
    pub status: WorkflowStatus,

    /// Number of the step currently (or next to be) executed.
    #[serde(default)]
    pub current_step: u32,

    /// Creation timestamp.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Completion timestamp, set on reaching a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Ordered steps of the plan.
    pub steps: Vec<Step>,
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Plan is being produced by the planner.
    #[default]
    Planning,

    /// The orchestrator loop is running.
    Running,

    /// A step demanded confirmation; execution is parked.
    WaitingConfirmation,

    /// The final step finished.
    Completed,

    /// An unrecoverable step failure.
    Failed,

    /// The task observed a cancellation signal.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status ends the workflow lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One atomic unit of a plan with a typed action and an expected
/// output shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 1-based step number, dense and unique within one workflow.
    pub step_number: u32,

    /// Typed action.
    pub step_type: StepType,

    /// Human description; also the base of analysis prompts.
    pub description: String,

    /// Tool name for tool_call steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Tool parameters, potentially containing placeholder strings.
    #[serde(default)]
    pub parameters: Value,

    /// Declared output schema for analysis/decision steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,

    /// Placeholder condition; a truthy resolution skips the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,

    /// Whether execution parks until an external confirmation.
    #[serde(default)]
    pub requires_confirmation: bool,

    /// Current execution status.
    #[serde(default)]
    pub status: StepStatus,

    /// Result value, written exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Completion timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step action type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Invoke a registered tool with resolved parameters.
    ToolCall,

    /// LLM analysis with a structured output schema.
    Analysis,

    /// LLM decision, typically producing control flags.
    Decision,

    /// Render a message into the status stream.
    Notification,
}

impl StepType {
    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::Analysis => "analysis",
            Self::Decision => "decision",
            Self::Notification => "notification",
        }
    }
}

/// Step execution status. No resurrection: terminal states are final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet dispatched.
    #[default]
    Pending,

    /// Currently executing.
    Running,

    /// Finished with a result.
    Completed,

    /// Bypassed; carries a copied or synthesized result.
    Skipped,

    /// Finished with an error.
    Failed,
}

impl StepStatus {
    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Whether this step can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl Step {
    /// Create a pending step with the given number, type and description.
    pub fn new(step_number: u32, step_type: StepType, description: impl Into<String>) -> Self {
        Self {
            step_number,
            step_type,
            description: description.into(),
            tool: None,
            parameters: Value::Null,
            output_format: None,
            skip_if: None,
            requires_confirmation: false,
            status: StepStatus::Pending,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    /// Set the tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Set the raw (unresolved) parameters.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the expected output schema.
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Mark as completed with a result. The result is written once;
    /// a second write is a programming error surfaced in debug builds.
    pub fn complete(&mut self, result: Value) {
        debug_assert!(self.result.is_none(), "step result written twice");
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Mark as skipped, carrying the copied/synthesized result so that
    /// downstream placeholders still resolve.
    pub fn skip(&mut self, result: Value) {
        self.status = StepStatus::Skipped;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Mark as failed with a one-line reason.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

impl Workflow {
    /// Create a new workflow in `Planning` state.
    pub fn new(session_id: impl Into<String>, intent: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            intent: intent.into(),
            status: WorkflowStatus::Planning,
            current_step: 0,
            created_at: Utc::now(),
            completed_at: None,
            steps,
        }
    }

    /// Get a step by its 1-based number.
    pub fn step(&self, number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == number)
    }

    /// Mutable access to a step by its 1-based number.
    pub fn step_mut(&mut self, number: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_number == number)
    }

    /// Validate workflow structure.
    ///
    /// Checks density and uniqueness of step numbers and that placeholder
    /// references in parameters point only to earlier steps.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::validation("Workflow has no steps"));
        }

        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.step_number != expected {
                return Err(EngineError::validation(format!(
                    "Step numbers must be dense and 1-based: found {} at position {}",
                    step.step_number, expected
                )));
            }

            if step.step_type == StepType::ToolCall && step.tool.is_none() {
                return Err(EngineError::validation(format!(
                    "Step {} is a tool_call without a tool name",
                    step.step_number
                )));
            }

            for referenced in template::collect_step_refs(&step.parameters) {
                if referenced >= step.step_number {
                    return Err(EngineError::validation(format!(
                        "Step {} references step_{} (forward or self references are not allowed)",
                        step.step_number, referenced
                    )));
                }
            }
        }

        Ok(())
    }
}
