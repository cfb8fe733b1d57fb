// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Engine-wide error taxonomy.

use thiserror::Error;

/// Result alias used across the engine crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced while planning or executing a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A workflow or plan failed structural validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A value could not be parsed (plan JSON, template, condition).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization round-trip failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Step parameters still contained placeholders after resolution.
    #[error("Unresolved placeholders [{}] (available context keys: [{}])", .refs.join(", "), .available.join(", "))]
    UnresolvedPlaceholders {
        /// The placeholder expressions that did not resolve.
        refs: Vec<String>,
        /// Context keys that were available at resolution time.
        available: Vec<String>,
    },

    /// A tool_call step referenced a tool the registry does not know.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// A tool invocation failed.
    #[error("Tool '{tool}' failed: {message}")]
    Tool {
        /// Name of the failing tool.
        tool: String,
        /// One-line failure reason.
        message: String,
        /// Whether the executor may retry the invocation.
        retriable: bool,
    },

    /// The LLM gateway gave up on a call.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Token admission rejected a planned model call.
    #[error("Token limit reached for {window} window: used {used} of {limit}, call estimated {estimate}")]
    TokenLimitExceeded {
        /// The window whose limit would be crossed.
        window: String,
        /// Usage already accumulated in the window.
        used: u64,
        /// The configured limit.
        limit: u64,
        /// Tokens the rejected call was estimated to consume.
        estimate: u64,
    },

    /// A per-attempt timeout elapsed.
    #[error("Operation timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// The workflow task observed a cancellation signal.
    #[error("Workflow cancelled")]
    Cancelled,

    /// The planner produced a plan that failed validation twice.
    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    /// Persistence layer failure.
    #[error("State error: {0}")]
    State(String),

    /// A confirmation was required but resolved negatively or invalidly.
    #[error("Confirmation error: {0}")]
    Confirmation(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Shorthand for a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Shorthand for an uncategorized error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the executor may retry the failing operation in place.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Tool { retriable, .. } => *retriable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}
