// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Core data model for the agentflow workflow engine.
//!
//! This crate defines the workflow/step model, the execution context,
//! the placeholder template engine and the token governance types.
//! The execution machinery lives in `agentflow-engine`.

pub mod context;
pub mod error;
pub mod schema;
pub mod template;
pub mod tokens;
pub mod workflow;

pub use context::ExecutionContext;
pub use error::{EngineError, Result};
pub use schema::{FieldType, OutputFormat};
pub use template::{resolve_value, split_path, Resolved, Template};
pub use tokens::{TokenSettings, UsageRecord, UsageWindow, WindowLimit};
pub use workflow::{Step, StepStatus, StepType, Workflow, WorkflowStatus};
