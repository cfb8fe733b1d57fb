// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The tool contract consumed by the step executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Tool invocation error.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Parameters violated the declared schema.
    #[error("Invalid parameters: {0}")]
    Invalid(String),

    /// The tool ran and failed.
    #[error("Execution failed: {message}")]
    Execution {
        /// One-line failure reason.
        message: String,
        /// Transient failures may be retried by the executor.
        retriable: bool,
    },

    /// HTTP transport failure (always retriable).
    #[error("HTTP error: {0}")]
    Http(String),
}

impl ToolError {
    /// Whether the executor may retry the invocation.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Invalid(_) => false,
            Self::Execution { retriable, .. } => *retriable,
            Self::Http(_) => true,
        }
    }
}

/// Primitive parameter type accepted by tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// Declaration of one tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Primitive type.
    #[serde(rename = "type")]
    pub param_type: ParameterType,

    /// Human description shown to the planner.
    pub description: String,

    /// Whether the parameter must be present.
    #[serde(default)]
    pub required: bool,

    /// Allowed values for string parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,

    /// Regex-like pattern hint for string parameters. Validated as a
    /// plain substring-free format hint only; enforcement is the
    /// tool's business.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Minimum string length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Maximum string length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Minimum numeric value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    /// Maximum numeric value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl ToolParameter {
    /// A required parameter of the given type.
    pub fn required(param_type: ParameterType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: true,
            enum_values: Vec::new(),
            pattern: None,
            min_length: None,
            max_length: None,
            minimum: None,
            maximum: None,
        }
    }

    /// An optional parameter of the given type.
    pub fn optional(param_type: ParameterType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(param_type, description)
        }
    }

    fn type_matches(&self, value: &Value) -> bool {
        match self.param_type {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }

    fn check(&self, name: &str, value: &Value) -> Result<(), ToolError> {
        if !self.type_matches(value) {
            return Err(ToolError::Invalid(format!(
                "Parameter '{}' has wrong type (expected {:?})",
                name, self.param_type
            )));
        }

        if let Value::String(s) = value {
            if !self.enum_values.is_empty() && !self.enum_values.iter().any(|v| v == s) {
                return Err(ToolError::Invalid(format!(
                    "Parameter '{}' must be one of [{}]",
                    name,
                    self.enum_values.join(", ")
                )));
            }
            if let Some(min) = self.min_length {
                if s.chars().count() < min {
                    return Err(ToolError::Invalid(format!(
                        "Parameter '{}' is shorter than {} characters",
                        name, min
                    )));
                }
            }
            if let Some(max) = self.max_length {
                if s.chars().count() > max {
                    return Err(ToolError::Invalid(format!(
                        "Parameter '{}' is longer than {} characters",
                        name, max
                    )));
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(ToolError::Invalid(format!(
                        "Parameter '{}' is below minimum {}",
                        name, min
                    )));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(ToolError::Invalid(format!(
                        "Parameter '{}' is above maximum {}",
                        name, max
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Named parameter map declared by a tool. Ordered for deterministic
/// catalog rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Declared parameters by name.
    pub parameters: BTreeMap<String, ToolParameter>,
}

impl ToolSchema {
    /// Build a schema from `(name, parameter)` pairs.
    pub fn from_parameters<I, S>(parameters: I) -> Self
    where
        I: IntoIterator<Item = (S, ToolParameter)>,
        S: Into<String>,
    {
        Self {
            parameters: parameters.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Validate resolved parameters against this schema.
    pub fn validate(&self, params: &Value) -> Result<(), ToolError> {
        let map = match params {
            Value::Object(map) => map,
            Value::Null if self.parameters.values().all(|p| !p.required) => return Ok(()),
            _ => {
                return Err(ToolError::Invalid(
                    "Tool parameters must be an object".to_string(),
                ))
            }
        };

        for (name, spec) in &self.parameters {
            match map.get(name) {
                Some(value) if !value.is_null() => spec.check(name, value)?,
                _ if spec.required => {
                    return Err(ToolError::Invalid(format!(
                        "Missing required parameter '{}'",
                        name
                    )))
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Request-scoped context injected into every tool invocation.
///
/// Tools discover the acting user through this value; there is no
/// ambient process-wide state.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The user the workflow runs on behalf of.
    pub user_id: String,

    /// Session the invocation belongs to.
    pub session_id: String,

    /// Workflow the invocation belongs to.
    pub workflow_id: String,
}

impl InvocationContext {
    /// Build a context for one workflow execution.
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
        }
    }
}

/// A tool invokable by the step executor.
///
/// Tools are pure with respect to the engine: all inputs arrive as
/// resolved parameters plus the invocation context; no tool reads the
/// execution context directly.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool name.
    fn name(&self) -> &str;

    /// Human description shown to the planner.
    fn description(&self) -> &str;

    /// Parameter schema.
    fn schema(&self) -> ToolSchema {
        ToolSchema::default()
    }

    /// Optional tools may be skipped by the orchestrator on failure
    /// instead of failing the workflow.
    fn optional(&self) -> bool {
        false
    }

    /// Execute with resolved parameters. The result is a mapping with
    /// at least `{"status": "success"|"error"}`.
    async fn execute(&self, params: Value, ctx: &InvocationContext) -> Result<Value, ToolError>;
}

/// Convenience constructor for the conventional success envelope.
pub fn success_result(fields: Value) -> Value {
    let mut result = json!({ "status": "success" });
    if let (Some(obj), Value::Object(extra)) = (result.as_object_mut(), fields) {
        for (key, value) in extra {
            obj.insert(key, value);
        }
    }
    result
}
