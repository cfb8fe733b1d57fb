// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for engine tests: scripted providers and tools.

use agentflow_llm::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};
use agentflow_tools::{InvocationContext, Tool, ToolError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Provider scripted with a queue of canned responses.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls that reached the provider.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Prompts in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.prompt.clone()).collect()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Err(ProviderError::Api("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A canned successful completion.
pub fn ok_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        text: text.to_string(),
        model: "gemini-2.5-flash".to_string(),
        prompt_tokens: 10,
        completion_tokens: 5,
    }
}

/// Tool scripted with a queue of results; repeats success once the
/// script runs dry.
pub struct StaticTool {
    name: String,
    optional: bool,
    script: Mutex<VecDeque<Result<Value, ToolError>>>,
    received: Mutex<Vec<Value>>,
}

impl StaticTool {
    pub fn new(name: &str, script: Vec<Result<Value, ToolError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            optional: false,
            script: Mutex::new(script.into()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn optional_tool(name: &str, script: Vec<Result<Value, ToolError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            optional: true,
            script: Mutex::new(script.into()),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Number of invocations so far.
    pub fn invocations(&self) -> usize {
        self.received.lock().len()
    }

    /// Parameters of the most recent invocation.
    pub fn last_params(&self) -> Option<Value> {
        self.received.lock().last().cloned()
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn optional(&self) -> bool {
        self.optional
    }

    async fn execute(&self, params: Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        self.received.lock().push(params);

        // ToolError is not Clone, so the script is consumed.
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "status": "success" })))
    }
}
